//! Transformers from hub events to normalized actions and content.
//!
//! Normalization is a pure function of the event and a pre-resolved identity
//! map. Callers collect the fids with [`referenced_fids`], resolve them in one
//! batched identity lookup, then dispatch with [`normalize`]. Repeated
//! processing of the same event yields byte-identical output, which is what
//! makes queue redelivery safe.
use std::collections::HashMap;

use ingest_common::protocol::{HubEvent, Message, MessageType};
use uuid::Uuid;

use crate::error::EventError;
use crate::types::NormalizedEvent;

mod cast;
mod link;
mod reaction;
mod user_data;

/// Every fid the event references and therefore needs an identity for: the
/// actor plus mentions, parent authors and link targets. Deduplicated, sorted.
pub fn referenced_fids(event: &HubEvent) -> Result<Vec<u64>, EventError> {
    let message = merge_message(event)?;
    let data = &message.data;

    let mut fids = vec![data.fid];

    match data.message_type {
        MessageType::CastAdd => {
            let body = require(data.cast_add_body.as_ref(), "cast-add", "castAddBody")?;
            fids.extend(body.mentions.iter().copied());
            if let Some(parent) = &body.parent_cast_id {
                fids.push(parent.fid);
            }
        }
        MessageType::ReactionAdd | MessageType::ReactionRemove => {
            let body = require(data.reaction_body.as_ref(), "reaction", "reactionBody")?;
            if let Some(target) = &body.target_cast_id {
                fids.push(target.fid);
            }
        }
        MessageType::LinkAdd | MessageType::LinkRemove => {
            let body = require(data.link_body.as_ref(), "link", "linkBody")?;
            fids.push(body.target_fid);
        }
        MessageType::CastRemove | MessageType::UserDataAdd | MessageType::UsernameProof => {}
    }

    fids.sort_unstable();
    fids.dedup();
    Ok(fids)
}

/// Dispatch the event to its transformer. `identities` must cover every fid
/// returned by [`referenced_fids`] for this event.
pub fn normalize(
    event: &HubEvent,
    identities: &HashMap<u64, Uuid>,
) -> Result<NormalizedEvent, EventError> {
    let message = merge_message(event)?;
    let event_id = event.id as i64;

    match message.data.message_type {
        MessageType::CastAdd => cast::transform_add(event_id, message, identities),
        MessageType::CastRemove => cast::transform_remove(event_id, &message.data, identities),
        MessageType::ReactionAdd => reaction::transform(event_id, &message.data, identities, false),
        MessageType::ReactionRemove => {
            reaction::transform(event_id, &message.data, identities, true)
        }
        MessageType::LinkAdd => link::transform(event_id, &message.data, identities, false),
        MessageType::LinkRemove => link::transform(event_id, &message.data, identities, true),
        MessageType::UserDataAdd => user_data::transform_user_data(event_id, &message.data, identities),
        MessageType::UsernameProof => {
            user_data::transform_username_proof(event_id, &message.data, identities)
        }
    }
}

fn merge_message(event: &HubEvent) -> Result<&Message, EventError> {
    event
        .merge_message_body
        .as_ref()
        .map(|body| &body.message)
        .ok_or(EventError::MissingField {
            message_type: "merge-message",
            field: "mergeMessageBody",
        })
}

pub(crate) fn require<'a, T>(
    field: Option<&'a T>,
    message_type: &'static str,
    name: &'static str,
) -> Result<&'a T, EventError> {
    field.ok_or(EventError::MissingField {
        message_type,
        field: name,
    })
}

pub(crate) fn lookup(identities: &HashMap<u64, Uuid>, fid: u64) -> Result<Uuid, EventError> {
    identities
        .get(&fid)
        .copied()
        .ok_or(EventError::UnresolvedFid(fid))
}

#[cfg(test)]
pub(crate) mod test_helpers {
    use ingest_common::protocol::{HubEvent, MergeMessageBody, Message, MessageData, MessageType};

    pub fn merge_event(id: u64, hash: &str, data_fn: impl FnOnce(&mut MessageData)) -> HubEvent {
        let mut data = MessageData {
            message_type: MessageType::CastAdd,
            fid: 1,
            timestamp: 48994466,
            cast_add_body: None,
            cast_remove_body: None,
            reaction_body: None,
            link_body: None,
            user_data_body: None,
            username_proof_body: None,
        };
        data_fn(&mut data);

        HubEvent {
            id,
            event_type: "HUB_EVENT_TYPE_MERGE_MESSAGE".to_owned(),
            merge_message_body: Some(MergeMessageBody {
                message: Message {
                    data,
                    hash: hash.to_owned(),
                },
            }),
        }
    }
}
