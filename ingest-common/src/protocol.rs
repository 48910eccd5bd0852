//! Farcaster hub wire types.
//!
//! The subset of the hub event envelope this pipeline consumes: merge-message
//! events carrying cast, reaction, link, user-data and username-proof bodies.
//! Everything here is deserialized straight off the hub's HTTP event feed and
//! re-serialized untouched into the ingress queue, so field names follow the
//! hub's camelCase convention.
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Hub message timestamps are seconds since the Farcaster epoch, not the Unix
/// epoch: 2021-01-01T00:00:00Z.
pub const FARCASTER_EPOCH_SECS: i64 = 1_609_459_200;

/// Convert a protocol timestamp to UTC.
pub fn farcaster_time_to_utc(timestamp: u32) -> DateTime<Utc> {
    Utc.timestamp_opt(FARCASTER_EPOCH_SECS + i64::from(timestamp), 0)
        .single()
        .unwrap_or_else(|| Utc.timestamp_opt(FARCASTER_EPOCH_SECS, 0).unwrap())
}

/// The canonical URI of a cast, derived purely from protocol fields so that
/// add and remove events agree on it without any lookup.
pub fn cast_uri(fid: u64, hash: &str) -> String {
    format!("farcaster://cast/{fid}/{hash}")
}

/// One page of the hub's event feed.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubEventsPage {
    pub next_page_event_id: u64,
    pub events: Vec<HubEvent>,
}

/// The protocol-level event envelope. `id` is hub-assigned and monotonic; it is
/// the resume cursor and the only identity used for dedup.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubEvent {
    pub id: u64,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub merge_message_body: Option<MergeMessageBody>,
}

pub const HUB_EVENT_TYPE_MERGE_MESSAGE: &str = "HUB_EVENT_TYPE_MERGE_MESSAGE";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeMessageBody {
    pub message: Message,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub data: MessageData,
    /// Hex-encoded message hash, 0x-prefixed.
    pub hash: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageData {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub fid: u64,
    /// Seconds since the Farcaster epoch.
    pub timestamp: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cast_add_body: Option<CastAddBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cast_remove_body: Option<CastRemoveBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reaction_body: Option<ReactionBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_body: Option<LinkBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data_body: Option<UserDataBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_proof_body: Option<UsernameProofBody>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum MessageType {
    #[serde(rename = "MESSAGE_TYPE_CAST_ADD")]
    CastAdd,
    #[serde(rename = "MESSAGE_TYPE_CAST_REMOVE")]
    CastRemove,
    #[serde(rename = "MESSAGE_TYPE_REACTION_ADD")]
    ReactionAdd,
    #[serde(rename = "MESSAGE_TYPE_REACTION_REMOVE")]
    ReactionRemove,
    #[serde(rename = "MESSAGE_TYPE_LINK_ADD")]
    LinkAdd,
    #[serde(rename = "MESSAGE_TYPE_LINK_REMOVE")]
    LinkRemove,
    #[serde(rename = "MESSAGE_TYPE_USER_DATA_ADD")]
    UserDataAdd,
    #[serde(rename = "MESSAGE_TYPE_USERNAME_PROOF")]
    UsernameProof,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CastId {
    pub fid: u64,
    pub hash: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Embed {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cast_id: Option<CastId>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CastAddBody {
    #[serde(default)]
    pub text: String,
    /// Fids mentioned in the text, parallel to `mentions_positions`.
    #[serde(default)]
    pub mentions: Vec<u64>,
    /// Byte offsets into `text` where each mention is spliced in.
    #[serde(default)]
    pub mentions_positions: Vec<u32>,
    #[serde(default)]
    pub embeds: Vec<Embed>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_cast_id: Option<CastId>,
    /// Set when the cast was posted to a channel rather than as a reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CastRemoveBody {
    pub target_hash: String,
}

/// Reaction type codes are a closed enum in the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionType {
    Like,
    Repost,
}

#[derive(Error, Debug)]
#[error("unsupported reaction type: {0}")]
pub struct UnsupportedReactionType(pub i32);

impl TryFrom<i32> for ReactionType {
    type Error = UnsupportedReactionType;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(ReactionType::Like),
            2 => Ok(ReactionType::Repost),
            other => Err(UnsupportedReactionType(other)),
        }
    }
}

impl ReactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReactionType::Like => "like",
            ReactionType::Repost => "repost",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionBody {
    /// Raw protocol code: 1 = like, 2 = repost. Anything else fails the event.
    #[serde(rename = "type")]
    pub reaction_type: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_cast_id: Option<CastId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkBody {
    #[serde(rename = "type")]
    pub link_type: String,
    pub target_fid: u64,
}

pub const LINK_TYPE_FOLLOW: &str = "follow";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserDataBody {
    #[serde(rename = "type")]
    pub user_data_type: String,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsernameProofBody {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    pub fid: u64,
}
