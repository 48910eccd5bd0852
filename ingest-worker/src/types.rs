use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The reconciliation dimension of an action. Together with the source id it
/// forms the unique key a remove event is matched against. POST and REPLY share
/// `Cast` because a cast-remove event does not say whether the original cast
/// was a top-level post or a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Cast,
    Like,
    Repost,
    Follow,
    UserData,
    UsernameProof,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Cast => "cast",
            ActionKind::Like => "like",
            ActionKind::Repost => "repost",
            ActionKind::Follow => "follow",
            ActionKind::UserData => "user_data",
            ActionKind::UsernameProof => "username_proof",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionType {
    #[serde(rename = "POST")]
    Post,
    #[serde(rename = "REPLY")]
    Reply,
    #[serde(rename = "UNPOST")]
    Unpost,
    #[serde(rename = "UNREPLY")]
    Unreply,
    #[serde(rename = "LIKE")]
    Like,
    #[serde(rename = "UNLIKE")]
    Unlike,
    #[serde(rename = "REPOST")]
    Repost,
    #[serde(rename = "UNREPOST")]
    Unrepost,
    #[serde(rename = "FOLLOW")]
    Follow,
    #[serde(rename = "UNFOLLOW")]
    Unfollow,
    #[serde(rename = "USER_DATA_ADD")]
    UserDataAdd,
    #[serde(rename = "UPDATE_USER_INFO")]
    UpdateUserInfo,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Post => "POST",
            ActionType::Reply => "REPLY",
            ActionType::Unpost => "UNPOST",
            ActionType::Unreply => "UNREPLY",
            ActionType::Like => "LIKE",
            ActionType::Unlike => "UNLIKE",
            ActionType::Repost => "REPOST",
            ActionType::Unrepost => "UNREPOST",
            ActionType::Follow => "FOLLOW",
            ActionType::Unfollow => "UNFOLLOW",
            ActionType::UserDataAdd => "USER_DATA_ADD",
            ActionType::UpdateUserInfo => "UPDATE_USER_INFO",
        }
    }

    /// Whether this action retracts protocol state rather than asserting it.
    pub fn is_remove(&self) -> bool {
        matches!(
            self,
            ActionType::Unpost
                | ActionType::Unreply
                | ActionType::Unlike
                | ActionType::Unrepost
                | ActionType::Unfollow
        )
    }

    /// The asserting counterpart of a remove type. Stored rows always carry the
    /// add form; removal is expressed through `deleted_at`.
    pub fn add_equivalent(&self) -> ActionType {
        match self {
            ActionType::Unpost => ActionType::Post,
            ActionType::Unreply => ActionType::Reply,
            ActionType::Unlike => ActionType::Like,
            ActionType::Unrepost => ActionType::Repost,
            ActionType::Unfollow => ActionType::Follow,
            other => *other,
        }
    }
}

/// Per-type action payload. Tagged so consumers can match exhaustively instead
/// of poking at a loose JSON blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionData {
    Cast {
        content_id: String,
        parent_id: Option<String>,
    },
    Reaction {
        content_id: String,
    },
    Follow {
        target_entity_id: Uuid,
    },
    UserData {
        field: String,
        value: String,
    },
    UserInfo {
        username: String,
    },
}

/// One derived unit of user activity, ready for the reconciling upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedAction {
    /// The hub event this action was derived from.
    pub event_id: i64,
    /// Deterministic identity of the underlying protocol state, shared between
    /// the add and remove events for that state.
    pub source_id: String,
    pub action_type: ActionType,
    /// The acting user's internal id.
    pub entity_id: Uuid,
    pub referenced_entity_ids: Vec<Uuid>,
    pub referenced_content_ids: Vec<String>,
    pub data: ActionData,
    /// Protocol event time, not ingestion time. Drives last-write-wins
    /// reconciliation for out-of-order delivery.
    pub occurred_at: DateTime<Utc>,
}

impl NormalizedAction {
    pub fn kind(&self) -> ActionKind {
        match self.action_type {
            ActionType::Post | ActionType::Reply | ActionType::Unpost | ActionType::Unreply => {
                ActionKind::Cast
            }
            ActionType::Like | ActionType::Unlike => ActionKind::Like,
            ActionType::Repost | ActionType::Unrepost => ActionKind::Repost,
            ActionType::Follow | ActionType::Unfollow => ActionKind::Follow,
            ActionType::UserDataAdd => ActionKind::UserData,
            ActionType::UpdateUserInfo => ActionKind::UsernameProof,
        }
    }

    pub fn is_remove(&self) -> bool {
        self.action_type.is_remove()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentType {
    #[serde(rename = "POST")]
    Post,
    #[serde(rename = "REPLY")]
    Reply,
    #[serde(rename = "URL")]
    Url,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Post => "POST",
            ContentType::Reply => "REPLY",
            ContentType::Url => "URL",
        }
    }
}

/// A user mentioned inside a cast's text. `position` is the byte offset where
/// the mention is spliced in; the protocol strips the label out of the text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mention {
    pub fid: u64,
    pub entity_id: Uuid,
    pub position: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContentData {
    Cast(CastContent),
    Url(UrlContent),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CastContent {
    /// The protocol text with mention labels stripped, exactly as received.
    pub text: String,
    /// The text with mention labels spliced back in at their byte offsets.
    pub rendered_text: String,
    pub mentions: Vec<Mention>,
    /// Content ids of every embed, cast URIs and external URLs alike.
    pub embeds: Vec<String>,
    pub parent_id: Option<String>,
    /// The channel URL the cast was posted into, if any. Read back by the
    /// channel-attach job.
    pub channel_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UrlContent {
    pub url: String,
    /// Scraped page metadata. None until the scrape job has run.
    pub metadata: Option<serde_json::Value>,
    pub frame: Option<serde_json::Value>,
}

/// Channel metadata attached to content posted into a named channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub url: String,
    pub name: String,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub lead_fid: Option<u64>,
    /// Internal id of the channel lead, when identity resolution knows them.
    pub lead_entity_id: Option<Uuid>,
}

/// A content record as first created. Never rewritten wholesale afterwards;
/// scrape results and channel metadata are attached with targeted updates.
#[derive(Debug, Clone, PartialEq)]
pub struct NewContent {
    pub content_id: String,
    pub content_type: ContentType,
    pub submitter_id: Uuid,
    /// Every internal user id the content references, deduplicated.
    pub entity_ids: Vec<Uuid>,
    pub data: ContentData,
    pub event_timestamp: DateTime<Utc>,
}

/// The full output of normalizing one hub event.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEvent {
    pub event_id: i64,
    /// The acting user.
    pub entity_id: Uuid,
    pub actions: Vec<NormalizedAction>,
    /// Content records the event requires to exist, in dependency order.
    pub contents: Vec<NewContent>,
    /// External URLs among the contents that still need scraping.
    pub unscraped_urls: Vec<String>,
    /// The channel URL the cast was posted to, if any.
    pub channel_url: Option<String>,
}

/// Splice mention labels into cast text. Offsets index the original bytes, so
/// splices are applied highest offset first to keep the remaining offsets
/// valid. Offsets come off the wire untrusted; any that land past the end or
/// inside a multi-byte character snap back to the previous char boundary.
pub fn splice_mentions(text: &str, mentions: &[Mention]) -> String {
    let mut ordered: Vec<&Mention> = mentions.iter().collect();
    ordered.sort_by(|a, b| b.position.cmp(&a.position));

    let mut spliced = text.to_owned();
    for mention in ordered {
        let mut at = (mention.position as usize).min(spliced.len());
        while !spliced.is_char_boundary(at) {
            at -= 1;
        }
        spliced.insert_str(at, &format!("@{}", mention.fid));
    }
    spliced
}
