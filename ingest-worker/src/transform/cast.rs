//! Cast add/remove transformers.
use std::collections::HashMap;

use ingest_common::protocol::{cast_uri, farcaster_time_to_utc, Message, MessageData};
use uuid::Uuid;

use super::{lookup, require};
use crate::error::EventError;
use crate::types::{
    ActionData, ActionType, CastContent, ContentData, ContentType, Mention, NewContent,
    NormalizedAction, NormalizedEvent, UrlContent,
};

pub(super) fn transform_add(
    event_id: i64,
    message: &Message,
    identities: &HashMap<u64, Uuid>,
) -> Result<NormalizedEvent, EventError> {
    let data = &message.data;
    let body = require(data.cast_add_body.as_ref(), "cast-add", "castAddBody")?;

    let entity_id = lookup(identities, data.fid)?;
    let occurred_at = farcaster_time_to_utc(data.timestamp);
    let content_id = cast_uri(data.fid, &message.hash);

    let mentions = body
        .mentions
        .iter()
        .zip(body.mentions_positions.iter())
        .map(|(&fid, &position)| {
            Ok(Mention {
                fid,
                entity_id: lookup(identities, fid)?,
                position,
            })
        })
        .collect::<Result<Vec<_>, EventError>>()?;

    let parent = body
        .parent_cast_id
        .as_ref()
        .map(|parent| Ok::<_, EventError>((cast_uri(parent.fid, &parent.hash), lookup(identities, parent.fid)?)))
        .transpose()?;
    let (parent_id, parent_entity_id) = match parent {
        Some((id, entity)) => (Some(id), Some(entity)),
        None => (None, None),
    };

    // Embeds become content references. External URLs additionally get a stub
    // content row so the scrape job has something to fill in.
    let mut embed_ids = Vec::new();
    let mut url_stubs = Vec::new();
    let mut unscraped_urls = Vec::new();
    for embed in &body.embeds {
        if let Some(url) = &embed.url {
            embed_ids.push(url.clone());
            unscraped_urls.push(url.clone());
            url_stubs.push(NewContent {
                content_id: url.clone(),
                content_type: ContentType::Url,
                submitter_id: entity_id,
                entity_ids: vec![entity_id],
                data: ContentData::Url(UrlContent {
                    url: url.clone(),
                    metadata: None,
                    frame: None,
                }),
                event_timestamp: occurred_at,
            });
        } else if let Some(embedded_cast) = &embed.cast_id {
            embed_ids.push(cast_uri(embedded_cast.fid, &embedded_cast.hash));
        }
    }

    let mut entity_ids = vec![entity_id];
    entity_ids.extend(mentions.iter().map(|mention| mention.entity_id));
    entity_ids.extend(parent_entity_id);
    let entity_ids = dedup_preserving_order(entity_ids);

    let mut referenced_entity_ids = entity_ids.clone();
    referenced_entity_ids.retain(|id| *id != entity_id);

    let (content_type, action_type) = if parent_id.is_some() {
        (ContentType::Reply, ActionType::Reply)
    } else {
        (ContentType::Post, ActionType::Post)
    };

    let mut referenced_content_ids = vec![content_id.clone()];
    referenced_content_ids.extend(embed_ids.clone());

    let mut contents = vec![NewContent {
        content_id: content_id.clone(),
        content_type,
        submitter_id: entity_id,
        entity_ids,
        data: ContentData::Cast(CastContent {
            text: body.text.clone(),
            rendered_text: crate::types::splice_mentions(&body.text, &mentions),
            mentions,
            embeds: embed_ids,
            parent_id: parent_id.clone(),
            channel_url: body.parent_url.clone(),
        }),
        event_timestamp: occurred_at,
    }];
    contents.extend(url_stubs);

    let action = NormalizedAction {
        event_id,
        source_id: content_id.clone(),
        action_type,
        entity_id,
        referenced_entity_ids,
        referenced_content_ids,
        data: ActionData::Cast {
            content_id,
            parent_id,
        },
        occurred_at,
    };

    Ok(NormalizedEvent {
        event_id,
        entity_id,
        actions: vec![action],
        contents,
        unscraped_urls,
        channel_url: body.parent_url.clone(),
    })
}

/// A cast-remove only carries the target hash, but that is enough to derive
/// the exact content id the original add produced, so reconciliation works
/// even when the add has not been seen locally yet.
pub(super) fn transform_remove(
    event_id: i64,
    data: &MessageData,
    identities: &HashMap<u64, Uuid>,
) -> Result<NormalizedEvent, EventError> {
    let body = require(data.cast_remove_body.as_ref(), "cast-remove", "castRemoveBody")?;

    let entity_id = lookup(identities, data.fid)?;
    let occurred_at = farcaster_time_to_utc(data.timestamp);
    let content_id = cast_uri(data.fid, &body.target_hash);

    let action = NormalizedAction {
        event_id,
        source_id: content_id.clone(),
        // The remove does not say whether the cast was a post or a reply. The
        // store reconciles on the shared cast key, so this is only the type
        // recorded when the remove arrives before its add.
        action_type: ActionType::Unpost,
        entity_id,
        referenced_entity_ids: Vec::new(),
        referenced_content_ids: vec![content_id.clone()],
        data: ActionData::Cast {
            content_id,
            parent_id: None,
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

fn dedup_preserving_order(ids: Vec<Uuid>) -> Vec<Uuid> {
    let mut seen = std::collections::HashSet::new();
    ids.into_iter().filter(|id| seen.insert(*id)).collect()
}

#[cfg(test)]
mod tests {
    use ingest_common::protocol::{CastAddBody, CastId, CastRemoveBody, Embed, MessageType};

    use super::super::{normalize, referenced_fids, test_helpers::merge_event};
    use super::*;

    fn identities_for(event: &ingest_common::protocol::HubEvent) -> HashMap<u64, Uuid> {
        referenced_fids(event)
            .unwrap()
            .into_iter()
            .map(|fid| (fid, Uuid::now_v7()))
            .collect()
    }

    #[test]
    fn test_cast_add_without_parent_is_a_post() {
        let event = merge_event(100, "0xaa", |data| {
            data.fid = 1;
            data.cast_add_body = Some(CastAddBody {
                text: "gm".to_owned(),
                mentions: vec![],
                mentions_positions: vec![],
                embeds: vec![],
                parent_cast_id: None,
                parent_url: None,
            });
        });
        let identities = identities_for(&event);

        let normalized = normalize(&event, &identities).unwrap();

        assert_eq!(normalized.actions.len(), 1);
        let action = &normalized.actions[0];
        assert_eq!(action.action_type, ActionType::Post);
        assert_eq!(action.source_id, "farcaster://cast/1/0xaa");
        assert_eq!(action.entity_id, identities[&1]);

        assert_eq!(normalized.contents.len(), 1);
        let content = &normalized.contents[0];
        assert_eq!(content.content_type, ContentType::Post);
        assert_eq!(content.entity_ids, vec![identities[&1]]);
    }

    #[test]
    fn test_cast_add_with_parent_is_a_reply() {
        let event = merge_event(101, "0xbb", |data| {
            data.fid = 2;
            data.cast_add_body = Some(CastAddBody {
                text: "welcome".to_owned(),
                mentions: vec![],
                mentions_positions: vec![],
                embeds: vec![],
                parent_cast_id: Some(CastId {
                    fid: 1,
                    hash: "0xaa".to_owned(),
                }),
                parent_url: None,
            });
        });
        let identities = identities_for(&event);

        let normalized = normalize(&event, &identities).unwrap();

        let action = &normalized.actions[0];
        assert_eq!(action.action_type, ActionType::Reply);
        assert_eq!(action.referenced_entity_ids, vec![identities[&1]]);
        assert_eq!(normalized.contents[0].content_type, ContentType::Reply);
        assert_eq!(
            normalized.contents[0].entity_ids,
            vec![identities[&2], identities[&1]]
        );
        match &normalized.contents[0].data {
            ContentData::Cast(cast) => {
                assert_eq!(cast.parent_id.as_deref(), Some("farcaster://cast/1/0xaa"));
            }
            other => panic!("expected cast content, got {:?}", other),
        }
    }

    #[test]
    fn test_cast_add_url_embeds_produce_stubs_and_scrapes() {
        let event = merge_event(102, "0xcc", |data| {
            data.fid = 1;
            data.cast_add_body = Some(CastAddBody {
                text: "read this".to_owned(),
                mentions: vec![],
                mentions_positions: vec![],
                embeds: vec![
                    Embed {
                        url: Some("https://example.com/article".to_owned()),
                        cast_id: None,
                    },
                    Embed {
                        url: None,
                        cast_id: Some(CastId {
                            fid: 3,
                            hash: "0xdd".to_owned(),
                        }),
                    },
                ],
                parent_cast_id: None,
                parent_url: None,
            });
        });
        let identities = identities_for(&event);

        let normalized = normalize(&event, &identities).unwrap();

        let action = &normalized.actions[0];
        assert_eq!(
            action.referenced_content_ids,
            vec![
                "farcaster://cast/1/0xcc",
                "https://example.com/article",
                "farcaster://cast/3/0xdd",
            ]
        );
        // One stub for the URL embed; no stub for the embedded cast.
        assert_eq!(normalized.contents.len(), 2);
        assert_eq!(normalized.contents[1].content_type, ContentType::Url);
        assert_eq!(
            normalized.unscraped_urls,
            vec!["https://example.com/article"]
        );
    }

    #[test]
    fn test_cast_add_into_channel_carries_channel_url() {
        let event = merge_event(103, "0xee", |data| {
            data.fid = 1;
            data.cast_add_body = Some(CastAddBody {
                text: "gm farcaster".to_owned(),
                mentions: vec![],
                mentions_positions: vec![],
                embeds: vec![],
                parent_cast_id: None,
                parent_url: Some("https://warpcast.com/~/channel/gm".to_owned()),
            });
        });
        let identities = identities_for(&event);

        let normalized = normalize(&event, &identities).unwrap();

        // A channel post is still a top-level post, not a reply.
        assert_eq!(normalized.actions[0].action_type, ActionType::Post);
        assert_eq!(
            normalized.channel_url.as_deref(),
            Some("https://warpcast.com/~/channel/gm")
        );
    }

    #[test]
    fn test_cast_remove_resolves_the_same_content_id_as_the_add() {
        let add = merge_event(104, "0xaa", |data| {
            data.fid = 1;
            data.cast_add_body = Some(CastAddBody {
                text: "gm".to_owned(),
                mentions: vec![],
                mentions_positions: vec![],
                embeds: vec![],
                parent_cast_id: None,
                parent_url: None,
            });
        });
        let remove = merge_event(105, "0xffff", |data| {
            data.fid = 1;
            data.message_type = MessageType::CastRemove;
            data.cast_remove_body = Some(CastRemoveBody {
                target_hash: "0xaa".to_owned(),
            });
        });

        let identities = identities_for(&add);
        let added = normalize(&add, &identities).unwrap();
        let removed = normalize(&remove, &identities).unwrap();

        assert_eq!(added.actions[0].source_id, removed.actions[0].source_id);
        assert!(removed.actions[0].is_remove());
        assert!(removed.contents.is_empty());
    }

    #[test]
    fn test_mentions_resolve_against_the_identity_map() {
        let event = merge_event(106, "0xab", |data| {
            data.fid = 1;
            data.cast_add_body = Some(CastAddBody {
                text: "hi  bye ".to_owned(),
                mentions: vec![11, 22],
                mentions_positions: vec![3, 8],
                embeds: vec![],
                parent_cast_id: None,
                parent_url: None,
            });
        });
        let identities = identities_for(&event);

        let normalized = normalize(&event, &identities).unwrap();

        match &normalized.contents[0].data {
            ContentData::Cast(cast) => {
                assert_eq!(cast.mentions.len(), 2);
                assert_eq!(cast.mentions[0].entity_id, identities[&11]);
                assert_eq!(cast.mentions[1].entity_id, identities[&22]);
                assert_eq!(cast.rendered_text, "hi @11 bye @22");
            }
            other => panic!("expected cast content, got {:?}", other),
        }
        assert_eq!(
            normalized.actions[0].referenced_entity_ids,
            vec![identities[&11], identities[&22]]
        );
    }
}
