//! Reaction add/remove transformers.
use std::collections::HashMap;

use ingest_common::protocol::{cast_uri, farcaster_time_to_utc, MessageData, ReactionType};
use uuid::Uuid;

use super::{lookup, require};
use crate::error::EventError;
use crate::types::{ActionData, ActionType, NormalizedAction, NormalizedEvent};

pub(super) fn transform(
    event_id: i64,
    data: &MessageData,
    identities: &HashMap<u64, Uuid>,
    is_remove: bool,
) -> Result<NormalizedEvent, EventError> {
    let body = require(data.reaction_body.as_ref(), "reaction", "reactionBody")?;
    let reaction = ReactionType::try_from(body.reaction_type)?;

    let entity_id = lookup(identities, data.fid)?;
    let occurred_at = farcaster_time_to_utc(data.timestamp);

    let (target_content_id, target_entity_id) = if let Some(target) = &body.target_cast_id {
        (
            cast_uri(target.fid, &target.hash),
            Some(lookup(identities, target.fid)?),
        )
    } else if let Some(url) = &body.target_url {
        (url.clone(), None)
    } else {
        return Err(EventError::MissingField {
            message_type: "reaction",
            field: "targetCastId",
        });
    };

    // Add and remove derive the same key, so the remove reconciles against the
    // add's row no matter which is processed first.
    let source_id = format!("{}:{}:{}", data.fid, reaction.as_str(), target_content_id);

    let action_type = match (reaction, is_remove) {
        (ReactionType::Like, false) => ActionType::Like,
        (ReactionType::Like, true) => ActionType::Unlike,
        (ReactionType::Repost, false) => ActionType::Repost,
        (ReactionType::Repost, true) => ActionType::Unrepost,
    };

    let referenced_entity_ids = target_entity_id
        .filter(|target| *target != entity_id)
        .into_iter()
        .collect();

    let action = NormalizedAction {
        event_id,
        source_id,
        action_type,
        entity_id,
        referenced_entity_ids,
        referenced_content_ids: vec![target_content_id.clone()],
        data: ActionData::Reaction {
            content_id: target_content_id,
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
