//! Content records: created at most once per content id, then only touched by
//! targeted updates (scrape results, channel metadata) so concurrent writers
//! cannot clobber each other.
use sqlx::types::Json;
use sqlx::PgPool;

use crate::error::EventError;
use crate::types::{Channel, NewContent};

#[derive(Clone)]
pub struct ContentStore {
    pool: PgPool,
}

impl ContentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the content row if it does not exist yet. Returns whether this
    /// call created it; an existing row is left entirely untouched.
    pub async fn insert(&self, content: &NewContent) -> Result<bool, EventError> {
        let result = sqlx::query(
            r#"
INSERT INTO content
    (content_id, content_type, submitter_id, entity_ids, data, event_timestamp)
VALUES
    ($1, $2, $3, $4, $5, $6)
ON CONFLICT (content_id) DO NOTHING
            "#,
        )
        .bind(&content.content_id)
        .bind(content.content_type.as_str())
        .bind(content.submitter_id)
        .bind(&content.entity_ids)
        .bind(Json(&content.data))
        .bind(content.event_timestamp)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Whether the content exists and has not been scraped yet.
    pub async fn needs_scrape(&self, content_id: &str) -> Result<bool, EventError> {
        let row: Option<(bool,)> =
            sqlx::query_as("SELECT scraped_at IS NULL FROM content WHERE content_id = $1")
                .bind(content_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(unscraped,)| unscraped).unwrap_or(false))
    }

    /// The channel URL recorded in a cast's data, for the channel-attach job.
    pub async fn channel_url(&self, content_id: &str) -> Result<Option<String>, EventError> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT data->>'channel_url' FROM content WHERE content_id = $1")
                .bind(content_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.and_then(|(url,)| url))
    }

    /// Merge scraped metadata into the content's data blob and mark it
    /// scraped. Only the scrape-owned keys move.
    pub async fn apply_scrape(
        &self,
        content_id: &str,
        metadata: Option<&serde_json::Value>,
        frame: Option<&serde_json::Value>,
    ) -> Result<(), EventError> {
        let mut patch = serde_json::Map::new();
        if let Some(metadata) = metadata {
            patch.insert("metadata".to_owned(), metadata.clone());
        }
        if let Some(frame) = frame {
            patch.insert("frame".to_owned(), frame.clone());
        }

        sqlx::query(
            r#"
UPDATE content
SET data = data || $2::jsonb, scraped_at = NOW()
WHERE content_id = $1
            "#,
        )
        .bind(content_id)
        .bind(Json(serde_json::Value::Object(patch)))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Attach resolved channel metadata. A targeted single-column update so a
    /// concurrent scrape cannot be lost.
    pub async fn attach_channel(
        &self,
        content_id: &str,
        channel: &Channel,
    ) -> Result<(), EventError> {
        sqlx::query("UPDATE content SET channel = $2 WHERE content_id = $1")
            .bind(content_id)
            .bind(Json(channel))
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
