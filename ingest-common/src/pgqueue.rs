//! # PgQueue
//!
//! A durable job queue implemented on top of a PostgreSQL table, shared by the
//! ingress, scrape, notification and cache-invalidation pipelines. Every job
//! carries a caller-provided key that doubles as the dedup key: enqueueing the
//! same key into the same queue twice is a no-op, which is what makes
//! at-least-once delivery from the hub safe to replay.
use std::str::FromStr;
use std::time;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use thiserror::Error;

/// Enumeration of parsing errors in PgQueue.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("{0} is not a valid JobStatus")]
    ParseJobStatusError(String),
}

/// Enumeration of database-related errors in PgQueue.
/// Errors that can originate from sqlx are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("pool creation failed with: {error}")]
    PoolCreationError { error: sqlx::Error },
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
}

/// An error that occurs when a job cannot be retried.
/// Returns the underlying job so that a client can fail it instead.
#[derive(Error, Debug)]
#[error("retry is an invalid state for this job: {error}")]
pub struct RetryInvalidError<T> {
    pub job: T,
    pub error: String,
}

/// Enumeration of errors that can occur when retrying a job.
/// They are in a separate enum as a failed retry returns the underlying job.
#[derive(Error, Debug)]
pub enum RetryError<T> {
    #[error(transparent)]
    DatabaseError(#[from] DatabaseError),
    #[error(transparent)]
    RetryInvalidError(#[from] RetryInvalidError<T>),
}

/// Enumeration of possible statuses for a Job.
#[derive(Debug, PartialEq, sqlx::Type)]
#[sqlx(type_name = "job_status")]
#[sqlx(rename_all = "lowercase")]
pub enum JobStatus {
    /// A job that is waiting in the queue to be picked up by a worker.
    Available,
    /// A job that was picked up by a worker and is currently being run.
    Running,
    /// A job that was successfully completed by a worker.
    Completed,
    /// A job that exhausted its attempts or failed permanently. The dead-letter
    /// state: rows stay around, with their error list, for manual inspection.
    Failed,
}

impl FromStr for JobStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(JobStatus::Available),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            invalid => Err(ParseError::ParseJobStatusError(invalid.to_owned())),
        }
    }
}

/// JobParameters are stored and read to and from a JSONB field, so we accept anything that fits `sqlx::types::Json`.
pub type JobParameters<J> = sqlx::types::Json<J>;

/// A Job to be executed by a worker dequeueing a PgQueue.
#[derive(sqlx::FromRow, Debug)]
pub struct Job<J> {
    /// A unique id identifying a job.
    pub id: i64,
    /// The queue this job belongs to.
    pub queue: String,
    /// Caller-provided identity of the work item (hub event id, content id, ...).
    /// Unique per queue; used for dedup on enqueue.
    pub key: String,
    /// A number corresponding to the current job attempt.
    pub attempt: i32,
    /// The current job's number of max attempts.
    pub max_attempts: i32,
    /// A datetime corresponding to when the job was last attempted.
    pub attempted_at: Option<DateTime<Utc>>,
    /// A vector of identifiers that have attempted this job. E.g. worker names, pod names, etc...
    pub attempted_by: Vec<String>,
    /// A datetime corresponding to when the job was created.
    pub created_at: DateTime<Utc>,
    /// A datetime corresponding to when the job is allowed to run. Pushed into
    /// the future by retries to implement backoff.
    pub scheduled_at: DateTime<Utc>,
    /// The current status of the job.
    pub status: JobStatus,
    /// Arbitrary job parameters stored as JSON.
    pub parameters: JobParameters<J>,
}

impl<J> Job<J> {
    /// Return true if this job attempt is greater or equal to the maximum number of possible attempts.
    pub fn is_gte_max_attempts(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// A dequeued `Job` holding a handle to the pool it came from, so it can be
/// transitioned to a terminal state. Jobs must be completed, failed or retried
/// before being dropped, otherwise they linger in `'running'` until a janitor
/// or operator requeues them.
#[derive(Debug)]
pub struct PgJob<J> {
    pub job: Job<J>,
    pool: PgPool,
}

impl<J: std::marker::Send> PgJob<J> {
    /// Consume the job to mark it as completed.
    pub async fn complete(self) -> Result<CompletedJob, DatabaseError> {
        let base_query = r#"
UPDATE
    job_queue
SET
    last_attempt_finished_at = NOW(),
    status = 'completed'::job_status
WHERE
    queue = $1
    AND id = $2
        "#;

        sqlx::query(base_query)
            .bind(&self.job.queue)
            .bind(self.job.id)
            .execute(&self.pool)
            .await
            .map_err(|error| DatabaseError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(CompletedJob {
            id: self.job.id,
            queue: self.job.queue,
        })
    }

    /// Consume the job to mark it as failed (dead-lettered), recording `error`.
    pub async fn fail<E: Serialize + std::marker::Sync + std::marker::Send>(
        self,
        error: E,
    ) -> Result<FailedJob<E>, DatabaseError> {
        let json_error = sqlx::types::Json(error);
        let base_query = r#"
UPDATE
    job_queue
SET
    last_attempt_finished_at = NOW(),
    status = 'failed'::job_status,
    errors = array_append(errors, $3)
WHERE
    queue = $1
    AND id = $2
        "#;

        sqlx::query(base_query)
            .bind(&self.job.queue)
            .bind(self.job.id)
            .bind(&json_error)
            .execute(&self.pool)
            .await
            .map_err(|error| DatabaseError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(FailedJob {
            id: self.job.id,
            error: json_error,
            queue: self.job.queue,
        })
    }

    /// Consume the job to schedule it for another attempt after `retry_interval`.
    /// Fails with `RetryInvalidError` when attempts are exhausted, handing the
    /// job back so the caller can `fail` it.
    pub async fn retry<E: Serialize + std::marker::Sync + std::marker::Send>(
        self,
        error: E,
        retry_interval: time::Duration,
    ) -> Result<RetriedJob, RetryError<PgJob<J>>> {
        if self.job.is_gte_max_attempts() {
            return Err(RetryError::from(RetryInvalidError {
                job: self,
                error: "maximum attempts reached".to_owned(),
            }));
        }

        let json_error = sqlx::types::Json(error);
        let base_query = r#"
UPDATE
    job_queue
SET
    last_attempt_finished_at = NOW(),
    status = 'available'::job_status,
    scheduled_at = NOW() + $3,
    errors = array_append(errors, $4)
WHERE
    queue = $1
    AND id = $2
        "#;

        sqlx::query(base_query)
            .bind(&self.job.queue)
            .bind(self.job.id)
            .bind(retry_interval)
            .bind(&json_error)
            .execute(&self.pool)
            .await
            .map_err(|error| {
                RetryError::from(DatabaseError::QueryError {
                    command: "UPDATE".to_owned(),
                    error,
                })
            })?;

        Ok(RetriedJob {
            id: self.job.id,
            queue: self.job.queue,
        })
    }
}

/// State a `Job` is transitioned to after successfully completing.
#[derive(Debug)]
pub struct CompletedJob {
    pub id: i64,
    pub queue: String,
}

/// State a `Job` is transitioned to after it has been enqueued for retrying.
#[derive(Debug)]
pub struct RetriedJob {
    pub id: i64,
    pub queue: String,
}

/// State a `Job` is transitioned to after exhausting all of its attempts.
#[derive(Debug)]
pub struct FailedJob<E> {
    pub id: i64,
    pub error: sqlx::types::Json<E>,
    pub queue: String,
}

/// A new job being created to be enqueued into a `PgQueue`.
#[derive(Debug)]
pub struct NewJob<J> {
    /// Caller-provided identity of the work item, unique per queue.
    pub key: String,
    /// The maximum amount of attempts this NewJob has to complete.
    pub max_attempts: i32,
    /// The JSON-serializable parameters for this NewJob.
    pub parameters: JobParameters<J>,
}

impl<J> NewJob<J> {
    pub fn new(key: &str, max_attempts: i32, parameters: J) -> Self {
        Self {
            key: key.to_owned(),
            max_attempts,
            parameters: sqlx::types::Json(parameters),
        }
    }
}

/// A queue implemented on top of a PostgreSQL table.
#[derive(Clone)]
pub struct PgQueue {
    /// A name to identify this PgQueue as multiple may share a table.
    name: String,
    /// A connection pool used to connect to the PostgreSQL database.
    pool: PgPool,
}

pub type PgQueueResult<T> = std::result::Result<T, DatabaseError>;

impl PgQueue {
    /// Initialize a new PgQueue by initializing a connection pool to the database in `url`.
    pub async fn new(
        queue_name: &str,
        url: &str,
        max_connections: u32,
        app_name: &'static str,
    ) -> PgQueueResult<Self> {
        let name = queue_name.to_owned();
        let options = PgConnectOptions::from_str(url)
            .map_err(|error| DatabaseError::PoolCreationError { error })?
            .application_name(app_name);
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy_with(options);

        Ok(Self { name, pool })
    }

    /// Initialize a new PgQueue from a provided connection pool.
    pub fn new_from_pool(queue_name: &str, pool: PgPool) -> Self {
        Self {
            name: queue_name.to_owned(),
            pool,
        }
    }

    /// Enqueue a `NewJob` into this PgQueue. Returns false when a job with the
    /// same key is already present, which callers treat as success: the work is
    /// either queued or already done (at-least-once delivery upstream means we
    /// will see the same key again).
    pub async fn enqueue<J: Serialize + std::marker::Sync>(
        &self,
        job: NewJob<J>,
    ) -> PgQueueResult<bool> {
        let base_query = r#"
INSERT INTO job_queue
    (queue, key, max_attempts, parameters, status)
VALUES
    ($1, $2, $3, $4, 'available'::job_status)
ON CONFLICT (queue, key) DO NOTHING
        "#;

        let result = sqlx::query(base_query)
            .bind(&self.name)
            .bind(&job.key)
            .bind(job.max_attempts)
            .bind(&job.parameters)
            .execute(&self.pool)
            .await
            .map_err(|error| DatabaseError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        Ok(result.rows_affected() > 0)
    }

    /// Dequeue the oldest available `Job` from this `PgQueue`, if any.
    /// The FOR UPDATE SKIP LOCKED clause ensures a job is handed to exactly one
    /// of any number of concurrently polling workers.
    pub async fn dequeue<
        J: DeserializeOwned + std::marker::Send + std::marker::Unpin + 'static,
    >(
        &self,
        attempted_by: &str,
    ) -> PgQueueResult<Option<PgJob<J>>> {
        let base_query = r#"
WITH available_in_queue AS (
    SELECT
        id
    FROM
        job_queue
    WHERE
        queue = $1
        AND status = 'available'
        AND scheduled_at <= NOW()
    ORDER BY
        id
    LIMIT 1
    FOR UPDATE SKIP LOCKED
)
UPDATE
    job_queue
SET
    attempted_at = NOW(),
    status = 'running'::job_status,
    attempt = job_queue.attempt + 1,
    attempted_by = array_append(attempted_by, $2::text)
FROM
    available_in_queue
WHERE
    job_queue.id = available_in_queue.id
RETURNING
    job_queue.*
        "#;

        let query_result: Result<Job<J>, sqlx::Error> = sqlx::query_as(base_query)
            .bind(&self.name)
            .bind(attempted_by)
            .fetch_one(&self.pool)
            .await;

        match query_result {
            Ok(job) => Ok(Some(PgJob {
                job,
                pool: self.pool.clone(),
            })),
            Err(sqlx::Error::RowNotFound) => Ok(None),
            Err(error) => Err(DatabaseError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            }),
        }
    }
}
