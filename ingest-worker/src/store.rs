//! Persistence for events, actions and user-event join rows.
//!
//! The reconciling upsert is the heart of the pipeline: one conditional
//! statement per action, keyed on `(source_id, kind)`, gated on the protocol
//! event timestamp so that whichever event happened last wins regardless of
//! the order workers process them in. Protocol timestamps have second
//! granularity, so the hub event id breaks ties. No read-then-write anywhere.
use ingest_common::protocol::HubEvent;
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::EventError;
use crate::types::NormalizedAction;

#[derive(Clone)]
pub struct ActionStore {
    pool: PgPool,
}

impl ActionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append the raw event to the event log. Redeliveries are no-ops.
    pub async fn record_event(&self, event: &HubEvent) -> Result<(), EventError> {
        sqlx::query(
            r#"
INSERT INTO hub_event (event_id, payload)
VALUES ($1, $2)
ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(event.id as i64)
        .bind(Json(event))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Reconcile one action against the store and return the id of the row
    /// that represents it.
    ///
    /// Key states are ABSENT, LIVE and REMOVED. An add inserts LIVE or revives
    /// a REMOVED row; a remove inserts a REMOVED tombstone (remove can arrive
    /// before its add) or retracts a LIVE row. The update only applies when
    /// the incoming event is not older than the one already reflected in the
    /// row, with the hub event id breaking same-second ties, so stale
    /// redeliveries lose. When the gate skips the update the existing row id
    /// is fetched instead and the call still succeeds.
    pub async fn upsert_action(&self, action: &NormalizedAction) -> Result<Uuid, EventError> {
        let id = if action.is_remove() {
            self.upsert_remove(action).await?
        } else {
            self.upsert_add(action).await?
        };

        match id {
            Some(id) => Ok(id),
            // The conditional update skipped: an event with a later timestamp
            // already won. Idempotency means that is a success.
            None => self.existing_action_id(action).await,
        }
    }

    async fn upsert_add(&self, action: &NormalizedAction) -> Result<Option<Uuid>, EventError> {
        let id: Option<(Uuid,)> = sqlx::query_as(
            r#"
INSERT INTO event_action
    (id, event_id, source_id, kind, action_type, entity_id,
     referenced_entity_ids, referenced_content_ids, data, last_event_at)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
ON CONFLICT (source_id, kind) DO UPDATE SET
    event_id = EXCLUDED.event_id,
    action_type = EXCLUDED.action_type,
    entity_id = EXCLUDED.entity_id,
    referenced_entity_ids = EXCLUDED.referenced_entity_ids,
    referenced_content_ids = EXCLUDED.referenced_content_ids,
    data = EXCLUDED.data,
    last_event_at = EXCLUDED.last_event_at,
    updated_at = NOW(),
    deleted_at = NULL
WHERE (event_action.last_event_at, event_action.event_id)
    <= (EXCLUDED.last_event_at, EXCLUDED.event_id)
RETURNING id
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(action.event_id)
        .bind(&action.source_id)
        .bind(action.kind().as_str())
        .bind(action.action_type.as_str())
        .bind(action.entity_id)
        .bind(&action.referenced_entity_ids)
        .bind(&action.referenced_content_ids)
        .bind(Json(&action.data))
        .bind(action.occurred_at)
        .fetch_optional(&self.pool)
        .await?;

        Ok(id.map(|(id,)| id))
    }

    async fn upsert_remove(&self, action: &NormalizedAction) -> Result<Option<Uuid>, EventError> {
        // Stored rows keep the asserting action type; removal lives in
        // deleted_at. On conflict only the retraction fields move, the
        // original payload is preserved for history.
        let id: Option<(Uuid,)> = sqlx::query_as(
            r#"
INSERT INTO event_action
    (id, event_id, source_id, kind, action_type, entity_id,
     referenced_entity_ids, referenced_content_ids, data, last_event_at, deleted_at)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW())
ON CONFLICT (source_id, kind) DO UPDATE SET
    event_id = EXCLUDED.event_id,
    last_event_at = EXCLUDED.last_event_at,
    updated_at = NOW(),
    deleted_at = NOW()
WHERE (event_action.last_event_at, event_action.event_id)
    <= (EXCLUDED.last_event_at, EXCLUDED.event_id)
RETURNING id
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(action.event_id)
        .bind(&action.source_id)
        .bind(action.kind().as_str())
        .bind(action.action_type.add_equivalent().as_str())
        .bind(action.entity_id)
        .bind(&action.referenced_entity_ids)
        .bind(&action.referenced_content_ids)
        .bind(Json(&action.data))
        .bind(action.occurred_at)
        .fetch_optional(&self.pool)
        .await?;

        Ok(id.map(|(id,)| id))
    }

    async fn existing_action_id(&self, action: &NormalizedAction) -> Result<Uuid, EventError> {
        let (id,): (Uuid,) = sqlx::query_as(
            "SELECT id FROM event_action WHERE source_id = $1 AND kind = $2",
        )
        .bind(&action.source_id)
        .bind(action.kind().as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    /// Link the raw event to the actions it produced.
    pub async fn upsert_user_event(
        &self,
        event_id: i64,
        entity_id: Uuid,
        action_ids: &[Uuid],
    ) -> Result<(), EventError> {
        sqlx::query(
            r#"
INSERT INTO user_event (event_id, entity_id, action_ids)
VALUES ($1, $2, $3)
ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(event_id)
        .bind(entity_id)
        .bind(action_ids)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
