//! Lock table backend. Expired rows are treated as absent by every query.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::lock::{Lock, LockBackend, LockToken};
use crate::model::spool::{SpoolId, WorkerId};

fn unavailable(e: sqlx::Error) -> Error {
    Error::LockBackendUnavailable(e.to_string())
}

#[async_trait]
impl LockBackend for super::Db {
    async fn set_if_absent(&self, lock: &Lock) -> Result<bool> {
        let rows_affected = sqlx::query(
            "INSERT INTO occupation_locks (resource_id, owner, token, acquired_at, expires_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (resource_id) DO UPDATE
             SET owner = EXCLUDED.owner, token = EXCLUDED.token,
                 acquired_at = EXCLUDED.acquired_at, expires_at = EXCLUDED.expires_at
             WHERE occupation_locks.expires_at IS NOT NULL
               AND occupation_locks.expires_at <= now()",
        )
        .bind(lock.resource_id.as_str())
        .bind(lock.owner.as_str())
        .bind(lock.token.0)
        .bind(lock.acquired_at)
        .bind(lock.expires_at)
        .execute(self.pool())
        .await
        .map_err(unavailable)?
        .rows_affected();

        Ok(rows_affected == 1)
    }

    async fn compare_and_delete(&self, resource_id: &SpoolId, token: &LockToken) -> Result<bool> {
        let rows_affected =
            sqlx::query("DELETE FROM occupation_locks WHERE resource_id = $1 AND token = $2")
                .bind(resource_id.as_str())
                .bind(token.0)
                .execute(self.pool())
                .await
                .map_err(unavailable)?
                .rows_affected();

        Ok(rows_affected == 1)
    }

    async fn compare_and_extend(
        &self,
        resource_id: &SpoolId,
        token: &LockToken,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let rows_affected = sqlx::query(
            "UPDATE occupation_locks SET expires_at = $3
             WHERE resource_id = $1 AND token = $2
               AND (expires_at IS NULL OR expires_at > now())",
        )
        .bind(resource_id.as_str())
        .bind(token.0)
        .bind(expires_at)
        .execute(self.pool())
        .await
        .map_err(unavailable)?
        .rows_affected();

        Ok(rows_affected == 1)
    }

    async fn get(&self, resource_id: &SpoolId) -> Result<Option<Lock>> {
        let row: Option<LockRow> = sqlx::query_as(
            "SELECT resource_id, owner, token, acquired_at, expires_at FROM occupation_locks
             WHERE resource_id = $1 AND (expires_at IS NULL OR expires_at > now())",
        )
        .bind(resource_id.as_str())
        .fetch_optional(self.pool())
        .await
        .map_err(unavailable)?;

        Ok(row.map(LockRow::into_lock))
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(self.pool())
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct LockRow {
    resource_id: String,
    owner: String,
    token: Uuid,
    acquired_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

impl LockRow {
    fn into_lock(self) -> Lock {
        Lock {
            resource_id: SpoolId(self.resource_id),
            owner: WorkerId(self.owner),
            token: LockToken(self.token),
            acquired_at: self.acquired_at,
            expires_at: self.expires_at,
        }
    }
}
