//! Link add/remove transformers. Only follow links exist in the protocol
//! today; other link types fail the event permanently rather than being
//! silently dropped.
use std::collections::HashMap;

use ingest_common::protocol::{farcaster_time_to_utc, MessageData, LINK_TYPE_FOLLOW};
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
    let body = require(data.link_body.as_ref(), "link", "linkBody")?;

    if body.link_type != LINK_TYPE_FOLLOW {
        return Err(EventError::UnsupportedLinkType(body.link_type.clone()));
    }

    let entity_id = lookup(identities, data.fid)?;
    let target_entity_id = lookup(identities, body.target_fid)?;
    let occurred_at = farcaster_time_to_utc(data.timestamp);

    let source_id = format!("{}:follow:{}", data.fid, body.target_fid);

    let action = NormalizedAction {
        event_id,
        source_id,
        action_type: if is_remove {
            ActionType::Unfollow
        } else {
            ActionType::Follow
        },
        entity_id,
        referenced_entity_ids: vec![target_entity_id],
        referenced_content_ids: Vec::new(),
        data: ActionData::Follow { target_entity_id },
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

#[cfg(test)]
mod tests {
    use ingest_common::protocol::{LinkBody, MessageType};

    use super::super::{normalize, referenced_fids, test_helpers::merge_event};
    use super::*;

    fn link_event(id: u64, link_type: &str, remove: bool) -> ingest_common::protocol::HubEvent {
        let link_type = link_type.to_owned();
        merge_event(id, "0x03", move |data| {
            data.fid = 1;
            data.message_type = if remove {
                MessageType::LinkRemove
            } else {
                MessageType::LinkAdd
            };
            data.link_body = Some(LinkBody {
                link_type,
                target_fid: 2,
            });
        })
    }

    fn identities_for(event: &ingest_common::protocol::HubEvent) -> HashMap<u64, Uuid> {
        referenced_fids(event)
            .unwrap()
            .into_iter()
            .map(|fid| (fid, Uuid::now_v7()))
            .collect()
    }

    #[test]
    fn test_follow_add_then_remove_share_a_source_id() {
        let add = link_event(300, "follow", false);
        let remove = link_event(301, "follow", true);
        let identities = identities_for(&add);

        let added = normalize(&add, &identities).unwrap();
        let removed = normalize(&remove, &identities).unwrap();

        assert_eq!(added.actions[0].action_type, ActionType::Follow);
        assert_eq!(added.actions[0].source_id, "1:follow:2");
        assert_eq!(
            added.actions[0].referenced_entity_ids,
            vec![identities[&2]]
        );
        assert_eq!(removed.actions[0].action_type, ActionType::Unfollow);
        assert_eq!(added.actions[0].source_id, removed.actions[0].source_id);
    }

    #[test]
    fn test_unknown_link_type_is_a_permanent_error() {
        let event = link_event(302, "block", false);
        let identities = identities_for(&event);

        let error = normalize(&event, &identities).unwrap_err();

        assert!(matches!(error, EventError::UnsupportedLinkType(_)));
        assert!(!error.is_retryable());
    }
}
