//! Audit rows and realtime notifications.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::model::event::Event;
use crate::store::{AuditLog, Publisher};

/// Rows per INSERT when appending a batch.
pub const AUDIT_CHUNK: usize = 500;

impl super::Db {
    /// Most recent audit rows for one spool, newest first.
    pub async fn recent_events(&self, resource_id: &str, limit: i64) -> Result<Vec<AuditRow>> {
        let rows = sqlx::query_as(
            "SELECT resource_id, worker, track, event_type, detail, correlation_id, occurred_at
             FROM occupation_events WHERE resource_id = $1
             ORDER BY occurred_at DESC, id DESC LIMIT $2",
        )
        .bind(resource_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }
}

/// One stored audit row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AuditRow {
    pub resource_id: String,
    pub worker: String,
    pub track: Option<String>,
    pub event_type: String,
    pub detail: serde_json::Value,
    pub correlation_id: Uuid,
    pub occurred_at: DateTime<Utc>,
}

#[async_trait]
impl AuditLog for super::Db {
    async fn append(&self, event: &Event) -> Result<()> {
        self.append_batch(std::slice::from_ref(event)).await
    }

    async fn append_batch(&self, events: &[Event]) -> Result<()> {
        let mut tx = self.pool().begin().await?;

        for chunk in events.chunks(AUDIT_CHUNK) {
            let mut resource_ids = Vec::with_capacity(chunk.len());
            let mut workers = Vec::with_capacity(chunk.len());
            let mut tracks: Vec<Option<String>> = Vec::with_capacity(chunk.len());
            let mut event_types = Vec::with_capacity(chunk.len());
            let mut details = Vec::with_capacity(chunk.len());
            let mut correlation_ids = Vec::with_capacity(chunk.len());
            let mut occurred_at = Vec::with_capacity(chunk.len());

            for event in chunk {
                resource_ids.push(event.resource_id.to_string());
                workers.push(event.worker.to_string());
                tracks.push(event.track.map(|t| t.to_string()));
                event_types.push(event.event_type().to_string());
                details.push(event.detail());
                correlation_ids.push(event.correlation_id);
                occurred_at.push(event.timestamp);
            }

            sqlx::query(
                "INSERT INTO occupation_events
                    (resource_id, worker, track, event_type, detail, correlation_id, occurred_at)
                 SELECT * FROM UNNEST($1::text[], $2::text[], $3::text[], $4::text[],
                                      $5::jsonb[], $6::uuid[], $7::timestamptz[])",
            )
            .bind(&resource_ids)
            .bind(&workers)
            .bind(&tracks)
            .bind(&event_types)
            .bind(&details)
            .bind(&correlation_ids)
            .bind(&occurred_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl Publisher for super::Db {
    async fn publish(&self, channel: &str, event: &Event) -> Result<()> {
        let payload = serde_json::to_string(event)?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(payload)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}
