//! Fan-out of follow-on work after an event's actions are durably committed.
//!
//! Everything here is at-least-once: the scrape queue dedups by content id,
//! the notification and cache queues by action id, and all downstream
//! consumers are required to be idempotent at their own boundary.
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use ingest_common::pgqueue::{NewJob, PgQueue};

use crate::content::ContentStore;
use crate::error::EventError;
use crate::types::{ActionType, NormalizedAction, NormalizedEvent};

/// Payload of a scrape-queue job. When `channel` is set the job attaches
/// channel metadata to a cast instead of scraping a URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeJob {
    pub content_id: String,
    #[serde(default)]
    pub channel: bool,
}

/// Notification-candidate payload, consumed by the external notification
/// pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationCandidate {
    pub action_id: Uuid,
    pub action_type: ActionType,
    pub actor_entity_id: Uuid,
    pub target_entity_ids: Vec<Uuid>,
    pub content_ids: Vec<String>,
}

/// Cache-invalidation payload for entities whose follow graph changed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheInvalidation {
    pub action_id: Uuid,
    pub entity_ids: Vec<Uuid>,
}

pub struct FanoutDispatcher {
    scrape_queue: PgQueue,
    notification_queue: PgQueue,
    cache_queue: PgQueue,
    max_job_attempts: i32,
}

impl FanoutDispatcher {
    pub fn new(
        scrape_queue: PgQueue,
        notification_queue: PgQueue,
        cache_queue: PgQueue,
        max_job_attempts: i32,
    ) -> Self {
        Self {
            scrape_queue,
            notification_queue,
            cache_queue,
            max_job_attempts,
        }
    }

    /// Enqueue all follow-on work for a committed event. `committed` pairs
    /// each normalized action with the id of its stored row.
    pub async fn dispatch(
        &self,
        normalized: &NormalizedEvent,
        committed: &[(Uuid, NormalizedAction)],
        contents: &ContentStore,
    ) -> Result<(), EventError> {
        for url in &normalized.unscraped_urls {
            // A URL embedded again after its scrape completed stays scraped;
            // only genuinely fresh URLs get a job.
            if contents.needs_scrape(url).await? {
                let job = ScrapeJob {
                    content_id: url.clone(),
                    channel: false,
                };
                self.scrape_queue
                    .enqueue(NewJob::new(url, self.max_job_attempts, &job))
                    .await?;
                metrics::counter!("fanout_scrape_jobs").increment(1);
            }
        }

        if normalized.channel_url.is_some() {
            // The channel-attach job carries the cast's content id; the
            // channel URL itself is read back from the content row.
            let cast_content_id = committed.iter().find_map(|(_, action)| match &action.data {
                crate::types::ActionData::Cast { content_id, .. } if !action.is_remove() => {
                    Some(content_id.clone())
                }
                _ => None,
            });
            if let Some(content_id) = cast_content_id {
                let job = ScrapeJob {
                    content_id: content_id.clone(),
                    channel: true,
                };
                self.scrape_queue
                    .enqueue(NewJob::new(&content_id, self.max_job_attempts, &job))
                    .await?;
                metrics::counter!("fanout_channel_jobs").increment(1);
            }
        }

        for (action_id, action) in committed {
            if matches!(
                action.action_type,
                ActionType::Follow | ActionType::Unfollow
            ) {
                let mut entity_ids = vec![action.entity_id];
                entity_ids.extend(action.referenced_entity_ids.iter().copied());
                let job = CacheInvalidation {
                    action_id: *action_id,
                    entity_ids,
                };
                self.cache_queue
                    .enqueue(NewJob::new(
                        &action_id.to_string(),
                        self.max_job_attempts,
                        &job,
                    ))
                    .await?;
                metrics::counter!("fanout_cache_invalidations").increment(1);
            }

            if self.is_notification_candidate(action) {
                let job = NotificationCandidate {
                    action_id: *action_id,
                    action_type: action.action_type,
                    actor_entity_id: action.entity_id,
                    target_entity_ids: action.referenced_entity_ids.clone(),
                    content_ids: action.referenced_content_ids.clone(),
                };
                self.notification_queue
                    .enqueue(NewJob::new(
                        &action_id.to_string(),
                        self.max_job_attempts,
                        &job,
                    ))
                    .await?;
                metrics::counter!("fanout_notification_candidates").increment(1);
            }
        }

        Ok(())
    }

    /// Likes, reposts, replies and follows notify, and only when they target
    /// someone other than the actor.
    fn is_notification_candidate(&self, action: &NormalizedAction) -> bool {
        matches!(
            action.action_type,
            ActionType::Like | ActionType::Repost | ActionType::Reply | ActionType::Follow
        ) && action
            .referenced_entity_ids
            .iter()
            .any(|target| *target != action.entity_id)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use sqlx::PgPool;

    use super::*;
    use crate::types::{ActionData, ContentData, ContentType, NewContent, UrlContent};

    fn dispatcher(db: &PgPool) -> FanoutDispatcher {
        FanoutDispatcher::new(
            PgQueue::new_from_pool("scrape", db.clone()),
            PgQueue::new_from_pool("notifications", db.clone()),
            PgQueue::new_from_pool("cache", db.clone()),
            3,
        )
    }

    fn committed_follow(actor: Uuid, target: Uuid) -> (Uuid, NormalizedAction) {
        (
            Uuid::now_v7(),
            NormalizedAction {
                event_id: 1,
                source_id: "1:follow:2".to_owned(),
                action_type: ActionType::Follow,
                entity_id: actor,
                referenced_entity_ids: vec![target],
                referenced_content_ids: vec![],
                data: ActionData::Follow {
                    target_entity_id: target,
                },
                occurred_at: Utc::now(),
            },
        )
    }

    fn event_with(committed: &[(Uuid, NormalizedAction)], urls: Vec<String>) -> NormalizedEvent {
        NormalizedEvent {
            event_id: 1,
            entity_id: committed[0].1.entity_id,
            actions: committed.iter().map(|(_, action)| action.clone()).collect(),
            contents: Vec::new(),
            unscraped_urls: urls,
            channel_url: None,
        }
    }

    async fn queued_keys(db: &PgPool, queue: &str) -> Vec<String> {
        sqlx::query_as::<_, (String,)>(
            "SELECT key FROM job_queue WHERE queue = $1 ORDER BY id",
        )
        .bind(queue)
        .fetch_all(db)
        .await
        .unwrap()
        .into_iter()
        .map(|(key,)| key)
        .collect()
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_follow_fans_out_cache_and_notification(db: PgPool) {
        let dispatcher = dispatcher(&db);
        let contents = ContentStore::new(db.clone());
        let committed = vec![committed_follow(Uuid::now_v7(), Uuid::now_v7())];
        let normalized = event_with(&committed, vec![]);

        dispatcher
            .dispatch(&normalized, &committed, &contents)
            .await
            .unwrap();

        let action_key = committed[0].0.to_string();
        assert_eq!(queued_keys(&db, "cache").await, vec![action_key.clone()]);
        assert_eq!(queued_keys(&db, "notifications").await, vec![action_key]);
        assert!(queued_keys(&db, "scrape").await.is_empty());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_self_targeted_actions_do_not_notify(db: PgPool) {
        let dispatcher = dispatcher(&db);
        let contents = ContentStore::new(db.clone());
        let actor = Uuid::now_v7();
        let mut committed = vec![committed_follow(actor, actor)];
        committed[0].1.referenced_entity_ids = vec![actor];
        let normalized = event_with(&committed, vec![]);

        dispatcher
            .dispatch(&normalized, &committed, &contents)
            .await
            .unwrap();

        assert!(queued_keys(&db, "notifications").await.is_empty());
        // The follow graph still changed, so the cache signal goes out.
        assert_eq!(queued_keys(&db, "cache").await.len(), 1);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_only_unscraped_urls_get_scrape_jobs(db: PgPool) {
        let dispatcher = dispatcher(&db);
        let contents = ContentStore::new(db.clone());
        let submitter = Uuid::now_v7();

        for url in ["https://example.com/new", "https://example.com/old"] {
            contents
                .insert(&NewContent {
                    content_id: url.to_owned(),
                    content_type: ContentType::Url,
                    submitter_id: submitter,
                    entity_ids: vec![submitter],
                    data: ContentData::Url(UrlContent {
                        url: url.to_owned(),
                        metadata: None,
                        frame: None,
                    }),
                    event_timestamp: Utc::now(),
                })
                .await
                .unwrap();
        }
        contents
            .apply_scrape("https://example.com/old", None, None)
            .await
            .unwrap();

        let committed = vec![committed_follow(submitter, Uuid::now_v7())];
        let normalized = event_with(
            &committed,
            vec![
                "https://example.com/new".to_owned(),
                "https://example.com/old".to_owned(),
            ],
        );

        dispatcher
            .dispatch(&normalized, &committed, &contents)
            .await
            .unwrap();

        assert_eq!(
            queued_keys(&db, "scrape").await,
            vec!["https://example.com/new"]
        );
    }
}
