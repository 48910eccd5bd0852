//! User-data and username-proof transformers. Both are profile updates keyed
//! per user, so repeats overwrite rather than accumulate rows.
use std::collections::HashMap;

use ingest_common::protocol::{farcaster_time_to_utc, MessageData};
use uuid::Uuid;

use super::{lookup, require};
use crate::error::EventError;
use crate::types::{ActionData, ActionType, NormalizedAction, NormalizedEvent};

pub(super) fn transform_user_data(
    event_id: i64,
    data: &MessageData,
    identities: &HashMap<u64, Uuid>,
) -> Result<NormalizedEvent, EventError> {
    let body = require(data.user_data_body.as_ref(), "user-data", "userDataBody")?;

    let entity_id = lookup(identities, data.fid)?;
    let occurred_at = farcaster_time_to_utc(data.timestamp);

    // One row per (user, field): a later value for the same field replaces the
    // earlier one through the usual reconciling upsert.
    let source_id = format!("{}:{}", data.fid, body.user_data_type);

    let action = NormalizedAction {
        event_id,
        source_id,
        action_type: ActionType::UserDataAdd,
        entity_id,
        referenced_entity_ids: Vec::new(),
        referenced_content_ids: Vec::new(),
        data: ActionData::UserData {
            field: body.user_data_type.clone(),
            value: body.value.clone(),
        },
        occurred_at,
    };

    Ok(NormalizedEvent {
        event_id,
        entity_id,
        actions: vec![action],
        contents: Vec::new(),
        unscraped_urls: Vec::new(),
        channel_url: None,
    })
}

pub(super) fn transform_username_proof(
    event_id: i64,
    data: &MessageData,
    identities: &HashMap<u64, Uuid>,
) -> Result<NormalizedEvent, EventError> {
    let body = require(
        data.username_proof_body.as_ref(),
        "username-proof",
        "usernameProofBody",
    )?;

    let entity_id = lookup(identities, data.fid)?;
    let occurred_at = farcaster_time_to_utc(data.timestamp);

    let source_id = format!("{}:username_proof", data.fid);

    let action = NormalizedAction {
        event_id,
        source_id,
        action_type: ActionType::UpdateUserInfo,
        entity_id,
        referenced_entity_ids: Vec::new(),
        referenced_content_ids: Vec::new(),
        data: ActionData::UserInfo {
            username: body.name.clone(),
        },
        occurred_at,
    };

    Ok(NormalizedEvent {
        event_id,
        entity_id,
        actions: vec![action],
        contents: Vec::new(),
        unscraped_urls: Vec::new(),
        channel_url: None,
    })
}
