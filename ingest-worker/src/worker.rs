//! The ingress worker: dequeue hub events, normalize them, commit actions and
//! content, then fan out follow-on work.
use std::sync::Arc;
use std::time;

use health::HealthHandle;
use ingest_common::pgqueue::{PgJob, PgQueue, RetryError};
use ingest_common::protocol::HubEvent;
use ingest_common::retry::RetryPolicy;
use tokio::sync::Semaphore;
use tracing::{error, warn};

use crate::content::ContentStore;
use crate::error::{EventError, WorkerError};
use crate::fanout::FanoutDispatcher;
use crate::identity::IdentityClient;
use crate::store::ActionStore;
use crate::transform;

/// Everything one event needs to be processed, cheap to clone into a task.
#[derive(Clone)]
pub struct EventProcessor {
    pub identity: IdentityClient,
    pub store: ActionStore,
    pub contents: ContentStore,
    pub fanout: Arc<FanoutDispatcher>,
    pub retry_policy: RetryPolicy,
}

impl EventProcessor {
    /// Normalize and commit one hub event. Safe to run any number of times
    /// for the same event: every write below is an idempotent upsert.
    async fn handle_event(&self, event: &HubEvent) -> Result<usize, EventError> {
        self.store.record_event(event).await?;

        let fids = transform::referenced_fids(event)?;
        let identities = self.identity.resolve_fids(&fids).await?;
        let normalized = transform::normalize(event, &identities)?;

        // Content first so actions never reference rows that do not exist.
        for content in &normalized.contents {
            self.contents.insert(content).await?;
        }

        let mut committed = Vec::with_capacity(normalized.actions.len());
        for action in &normalized.actions {
            let action_id = self.store.upsert_action(action).await?;
            committed.push((action_id, action.clone()));
        }

        let action_ids: Vec<_> = committed.iter().map(|(id, _)| *id).collect();
        self.store
            .upsert_user_event(normalized.event_id, normalized.entity_id, &action_ids)
            .await?;

        self.fanout
            .dispatch(&normalized, &committed, &self.contents)
            .await?;

        Ok(committed.len())
    }

    /// Drive a dequeued job to a terminal state: completed, scheduled for
    /// retry, or dead-lettered.
    pub async fn process_job(&self, job: PgJob<HubEvent>) -> Result<(), WorkerError> {
        let event_id = job.job.parameters.0.id;
        let attempt = job.job.attempt;

        match self.handle_event(&job.job.parameters.0).await {
            Ok(action_count) => {
                metrics::counter!("ingest_events_processed").increment(1);
                metrics::counter!("ingest_actions_committed").increment(action_count as u64);
                job.complete().await?;
                Ok(())
            }
            Err(event_error) if event_error.is_retryable() => {
                metrics::counter!("ingest_events_retried").increment(1);
                warn!(event_id, attempt, "transient failure: {}", event_error);

                let interval = self.retry_policy.retry_interval(attempt as u32);
                match job.retry(event_error.to_string(), interval).await {
                    Ok(_) => Ok(()),
                    Err(RetryError::RetryInvalidError(invalid)) => {
                        metrics::counter!("ingest_events_dead_lettered").increment(1);
                        error!(event_id, "attempts exhausted, dead-lettering: {}", event_error);
                        invalid.job.fail(event_error.to_string()).await?;
                        Ok(())
                    }
                    Err(RetryError::DatabaseError(database_error)) => Err(database_error.into()),
                }
            }
            Err(event_error) => {
                metrics::counter!("ingest_events_dead_lettered").increment(1);
                error!(event_id, "permanent failure, dead-lettering: {}", event_error);
                job.fail(event_error.to_string()).await?;
                Ok(())
            }
        }
    }
}

pub struct EventWorker {
    name: String,
    queue: PgQueue,
    processor: EventProcessor,
    poll_interval: time::Duration,
    max_concurrent_jobs: usize,
    liveness: HealthHandle,
}

impl EventWorker {
    pub fn new(
        name: &str,
        queue: PgQueue,
        processor: EventProcessor,
        poll_interval: time::Duration,
        max_concurrent_jobs: usize,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            name: name.to_owned(),
            queue,
            processor,
            poll_interval,
            max_concurrent_jobs,
            liveness,
        }
    }

    /// Wait until a job becomes available in the queue.
    async fn wait_for_job(&self) -> Result<PgJob<HubEvent>, WorkerError> {
        loop {
            self.liveness.report_healthy().await;
            if let Some(job) = self.queue.dequeue(&self.name).await? {
                return Ok(job);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Run until a queue-level error. Jobs run concurrently up to the
    /// configured limit; a job failure never takes the loop down.
    pub async fn run(&self) -> Result<(), WorkerError> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_jobs));

        loop {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore has been closed");

            let job = self.wait_for_job().await?;
            let processor = self.processor.clone();

            tokio::spawn(async move {
                if let Err(worker_error) = processor.process_job(job).await {
                    error!("failed to transition job to a terminal state: {}", worker_error);
                }
                drop(permit);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use sqlx::PgPool;

    use ingest_common::pgqueue::{JobStatus, NewJob};
    use ingest_common::protocol::HubEvent;

    use super::*;

    async fn job_status(db: &PgPool, key: &str) -> JobStatus {
        let (status,): (JobStatus,) =
            sqlx::query_as("SELECT status FROM job_queue WHERE key = $1")
                .bind(key)
                .fetch_one(db)
                .await
                .unwrap();
        status
    }

    fn processor(db: &PgPool) -> EventProcessor {
        EventProcessor {
            identity: IdentityClient::new("http://localhost:9", time::Duration::from_millis(100))
                .unwrap(),
            store: ActionStore::new(db.clone()),
            contents: ContentStore::new(db.clone()),
            fanout: Arc::new(FanoutDispatcher::new(
                PgQueue::new_from_pool("scrape", db.clone()),
                PgQueue::new_from_pool("notifications", db.clone()),
                PgQueue::new_from_pool("cache", db.clone()),
                3,
            )),
            retry_policy: RetryPolicy::default(),
        }
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_event_without_merge_body_is_dead_lettered(db: PgPool) {
        let queue = PgQueue::new_from_pool("hub_events", db.clone());
        let event = HubEvent {
            id: 900,
            event_type: "HUB_EVENT_TYPE_PRUNE_MESSAGE".to_owned(),
            merge_message_body: None,
        };
        queue.enqueue(NewJob::new("900", 3, &event)).await.unwrap();

        let job: PgJob<HubEvent> = queue.dequeue("test-worker").await.unwrap().unwrap();
        processor(&db).process_job(job).await.unwrap();

        // Malformed payloads are permanent failures, no retries.
        assert_eq!(job_status(&db, "900").await, JobStatus::Failed);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_identity_outage_schedules_a_retry(db: PgPool) {
        let queue = PgQueue::new_from_pool("hub_events", db.clone());
        let event: HubEvent = serde_json::from_value(serde_json::json!({
            "id": 901,
            "type": "HUB_EVENT_TYPE_MERGE_MESSAGE",
            "mergeMessageBody": {
                "message": {
                    "data": {
                        "type": "MESSAGE_TYPE_CAST_ADD",
                        "fid": 1,
                        "timestamp": 48994466,
                        "castAddBody": {"text": "gm"}
                    },
                    "hash": "0xaa"
                }
            }
        }))
        .unwrap();
        queue.enqueue(NewJob::new("901", 3, &event)).await.unwrap();

        let job: PgJob<HubEvent> = queue.dequeue("test-worker").await.unwrap().unwrap();
        // The identity client points at a closed port, so resolution fails
        // transiently and the job goes back to available with backoff.
        processor(&db).process_job(job).await.unwrap();

        assert_eq!(job_status(&db, "901").await, JobStatus::Available);

        let (error_count,): (Option<i32>,) =
            sqlx::query_as("SELECT array_length(errors, 1) FROM job_queue WHERE key = '901'")
                .fetch_one(&db)
                .await
                .unwrap();
        assert_eq!(error_count, Some(1));

        // The raw event was still recorded before the failure.
        let (logged,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM hub_event")
            .fetch_one(&db)
            .await
            .unwrap();
        assert_eq!(logged, 1);
    }
}
