use ingest_common::pgqueue;
use ingest_common::protocol::UnsupportedReactionType;
use thiserror::Error;

/// Errors raised while processing a single hub event. Transient failures are
/// retried with backoff; permanent failures exhaust the item immediately into
/// the dead-letter state.
#[derive(Error, Debug)]
pub enum EventError {
    #[error("unsupported reaction type: {0}")]
    UnsupportedReactionType(#[from] UnsupportedReactionType),
    #[error("{message_type} event is missing required field {field}")]
    MissingField {
        message_type: &'static str,
        field: &'static str,
    },
    #[error("identity service returned {returned} identities for {requested} fids")]
    IdentityCountMismatch { requested: usize, returned: usize },
    #[error("no resolved identity for fid {0}")]
    UnresolvedFid(u64),
    #[error("unsupported link type: {0}")]
    UnsupportedLinkType(String),
    #[error("identity request failed: {0}")]
    IdentityRequestError(reqwest::Error),
    #[error("scrape request failed: {0}")]
    ScrapeRequestError(reqwest::Error),
    #[error("channel directory request failed: {0}")]
    ChannelDirectoryError(reqwest::Error),
    #[error("database error: {0}")]
    DatabaseError(#[from] sqlx::Error),
    #[error("queue error: {0}")]
    QueueError(#[from] pgqueue::DatabaseError),
}

impl EventError {
    /// Whether the failure is worth another attempt. Malformed payloads never
    /// are; external-dependency and database failures always are.
    pub fn is_retryable(&self) -> bool {
        match self {
            EventError::UnsupportedReactionType(_)
            | EventError::MissingField { .. }
            | EventError::IdentityCountMismatch { .. }
            | EventError::UnresolvedFid(_)
            | EventError::UnsupportedLinkType(_) => false,
            EventError::IdentityRequestError(_)
            | EventError::ScrapeRequestError(_)
            | EventError::ChannelDirectoryError(_)
            | EventError::DatabaseError(_)
            | EventError::QueueError(_) => true,
        }
    }
}

/// Errors that stop a worker loop rather than a single item.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("a database error occurred while polling the queue")]
    DatabaseError(#[from] pgqueue::DatabaseError),
    #[error("a parsing error occurred in the underlying queue")]
    QueueParseError(#[from] pgqueue::ParseError),
}
