//! The subscriber loop: page through the hub's event feed, enqueue each
//! merge-message event into the ingress queue, and periodically checkpoint the
//! cursor.
use std::time;

use health::HealthHandle;
use ingest_common::pgqueue::{NewJob, PgQueue};
use ingest_common::protocol::{HubEvent, HUB_EVENT_TYPE_MERGE_MESSAGE};
use tracing::{info, warn};

use crate::checkpoint::CheckpointStore;
use crate::error::SubscriberError;
use crate::hub::HubClient;

pub struct HubSubscriber {
    hub: HubClient,
    queue: PgQueue,
    checkpoints: CheckpointStore,
    max_event_attempts: i32,
    poll_interval: time::Duration,
    checkpoint_interval_events: u64,
    start_event_id: u64,
    liveness: HealthHandle,
}

impl HubSubscriber {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hub: HubClient,
        queue: PgQueue,
        checkpoints: CheckpointStore,
        max_event_attempts: u32,
        poll_interval: time::Duration,
        checkpoint_interval_events: u64,
        start_event_id: u64,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            hub,
            queue,
            checkpoints,
            max_event_attempts: max_event_attempts as i32,
            poll_interval,
            checkpoint_interval_events: checkpoint_interval_events.max(1),
            start_event_id,
            liveness,
        }
    }

    /// Run until the hub or the queue database becomes unreachable. Both are
    /// fatal: the process exits and resumes from the last checkpoint on
    /// restart. Events replayed between the checkpoint and the crash point are
    /// absorbed by the queue's key dedup.
    pub async fn run(&self) -> Result<(), SubscriberError> {
        let mut cursor = match self.checkpoints.last_event_id().await? {
            Some(checkpointed) => {
                info!(event_id = checkpointed, "resuming from checkpoint");
                checkpointed
            }
            None => {
                info!(event_id = self.start_event_id, "no checkpoint, starting fresh");
                self.start_event_id
            }
        };
        let mut events_since_checkpoint = 0u64;

        loop {
            let page = self.hub.events_page(cursor).await?;
            self.liveness.report_healthy().await;

            let caught_up = page.events.is_empty();

            for event in &page.events {
                metrics::counter!("hub_events_received").increment(1);

                if event.event_type == HUB_EVENT_TYPE_MERGE_MESSAGE {
                    self.enqueue(event).await?;
                }

                events_since_checkpoint += 1;
            }

            cursor = page.next_page_event_id;

            if events_since_checkpoint >= self.checkpoint_interval_events {
                // A missed checkpoint only means more replay after a restart,
                // so log and carry on rather than dying.
                match self.checkpoints.set_last_event_id(cursor).await {
                    Ok(()) => {
                        events_since_checkpoint = 0;
                        metrics::gauge!("hub_checkpoint_event_id").set(cursor as f64);
                    }
                    Err(error) => {
                        metrics::counter!("hub_checkpoint_failures").increment(1);
                        warn!("failed to persist checkpoint at {}: {}", cursor, error);
                    }
                }
            }

            if caught_up {
                tokio::time::sleep(self.poll_interval).await;
            }
        }
    }

    async fn enqueue(&self, event: &HubEvent) -> Result<(), SubscriberError> {
        let job = NewJob::new(&event.id.to_string(), self.max_event_attempts, event);

        let inserted = self.queue.enqueue(job).await?;
        if inserted {
            metrics::counter!("hub_events_enqueued").increment(1);
        } else {
            metrics::counter!("hub_events_deduplicated").increment(1);
        }

        Ok(())
    }
}
