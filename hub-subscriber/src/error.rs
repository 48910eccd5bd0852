use ingest_common::pgqueue;
use thiserror::Error;

/// Errors that kill the subscriber process. The hub feed is the single source
/// of truth for ordering, so losing it (or the queue database) is fatal and we
/// restart from the last persisted checkpoint.
#[derive(Error, Debug)]
pub enum SubscriberError {
    #[error("hub request failed: {0}")]
    HubRequestError(#[from] reqwest::Error),
    #[error("queue error: {0}")]
    QueueError(#[from] pgqueue::DatabaseError),
    #[error("database error: {0}")]
    DatabaseError(#[from] sqlx::Error),
}
