//! Persistence for the subscriber's resume cursor.
//!
//! A single-row table holds the last hub event id we are confident has been
//! enqueued. On restart the subscriber resumes from that id; events between the
//! checkpoint and the crash point are re-fetched and deduplicated downstream by
//! their queue key.
use sqlx::PgPool;

use crate::error::SubscriberError;

#[derive(Clone)]
pub struct CheckpointStore {
    pool: PgPool,
}

impl CheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The last persisted event id, if a checkpoint has ever been written.
    pub async fn last_event_id(&self) -> Result<Option<u64>, SubscriberError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT last_event_id FROM hub_checkpoint WHERE onerow = true")
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(id,)| id as u64))
    }

    pub async fn set_last_event_id(&self, event_id: u64) -> Result<(), SubscriberError> {
        sqlx::query(
            r#"
INSERT INTO hub_checkpoint (onerow, last_event_id, updated_at)
VALUES (true, $1, NOW())
ON CONFLICT (onerow) DO UPDATE SET
    last_event_id = EXCLUDED.last_event_id,
    updated_at = NOW()
            "#,
        )
        .bind(event_id as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[sqlx::test(migrations = "../migrations")]
    async fn test_no_checkpoint_on_fresh_database(db: PgPool) {
        let store = CheckpointStore::new(db);

        assert_eq!(store.last_event_id().await.unwrap(), None);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_checkpoint_roundtrip_and_overwrite(db: PgPool) {
        let store = CheckpointStore::new(db);

        store.set_last_event_id(310059807).await.unwrap();
        assert_eq!(store.last_event_id().await.unwrap(), Some(310059807));

        // The table holds exactly one row; a later checkpoint replaces it.
        store.set_last_event_id(310059900).await.unwrap();
        assert_eq!(store.last_event_id().await.unwrap(), Some(310059900));
    }
}
