//! Spool records: versioned reads and conditional partial writes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::spool::{
    Completion, HeldSpool, HolderUpdate, Spool, SpoolId, SpoolPatch, SubUnit, SubUnitId, Version,
    WorkerId,
};
use crate::model::track::{Track, TrackState};
use crate::store::RecordStore;

impl super::Db {
    /// Insert a new spool with its sub-units. Returns the initial version.
    pub async fn create_spool(&self, spool: &Spool) -> Result<Version> {
        let mut tx = self.pool().begin().await?;
        let version = Uuid::new_v4();

        sqlx::query("INSERT INTO spools (id, version) VALUES ($1, $2)")
            .bind(spool.id.as_str())
            .bind(version)
            .execute(&mut *tx)
            .await?;

        for (position, unit) in spool.sub_units.iter().enumerate() {
            let tracks: Vec<String> = unit.tracks.iter().map(|t| t.to_string()).collect();
            sqlx::query(
                "INSERT INTO sub_units (spool_id, id, size, tracks, position) VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(spool.id.as_str())
            .bind(unit.id.as_str())
            .bind(unit.size)
            .bind(&tracks)
            .bind(position as i32)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(Version::new(version.to_string()))
    }
}

#[async_trait]
impl RecordStore for super::Db {
    async fn read(&self, resource_id: &SpoolId) -> Result<Spool> {
        // One snapshot across the four tables.
        let mut tx = self.pool().begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await?;

        let row: Option<SpoolRow> =
            sqlx::query_as("SELECT id, holder, holder_since, version FROM spools WHERE id = $1")
                .bind(resource_id.as_str())
                .fetch_optional(&mut *tx)
                .await?;
        let row = row.ok_or_else(|| Error::NotFound(format!("spool {resource_id}")))?;

        let tracks: Vec<TrackRow> = sqlx::query_as(
            "SELECT track, status, worker, history, cycle_count FROM spool_tracks WHERE spool_id = $1",
        )
        .bind(resource_id.as_str())
        .fetch_all(&mut *tx)
        .await?;

        let units: Vec<SubUnitRow> = sqlx::query_as(
            "SELECT id, size, tracks FROM sub_units WHERE spool_id = $1 ORDER BY position, id",
        )
        .bind(resource_id.as_str())
        .fetch_all(&mut *tx)
        .await?;

        let completions: Vec<CompletionRow> = sqlx::query_as(
            "SELECT sub_unit_id, track, worker, completed_at FROM sub_unit_completions WHERE spool_id = $1",
        )
        .bind(resource_id.as_str())
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;
        row.try_into_spool(tracks, units, completions)
    }

    async fn conditional_write(
        &self,
        resource_id: &SpoolId,
        expected: &Version,
        patch: &SpoolPatch,
    ) -> Result<Version> {
        let conflict = || Error::VersionConflict {
            resource_id: resource_id.clone(),
            expected: expected.to_string(),
        };
        let expected_uuid = Uuid::parse_str(expected.as_str()).map_err(|_| conflict())?;
        let next = Uuid::new_v4();

        let (touch_holder, holder, holder_since) = match &patch.holder {
            None => (false, None, None),
            Some(HolderUpdate::Set { worker, since }) => (true, Some(worker.as_str()), Some(*since)),
            Some(HolderUpdate::Clear) => (true, None, None),
        };

        let mut tx = self.pool().begin().await?;

        // The version check and the bump happen in one statement.
        let rows_affected = sqlx::query(
            "UPDATE spools SET version = $1, updated_at = now(),
                    holder = CASE WHEN $2 THEN $3 ELSE holder END,
                    holder_since = CASE WHEN $2 THEN $4 ELSE holder_since END
             WHERE id = $5 AND version = $6",
        )
        .bind(next)
        .bind(touch_holder)
        .bind(holder)
        .bind(holder_since)
        .bind(resource_id.as_str())
        .bind(expected_uuid)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM spools WHERE id = $1")
                .bind(resource_id.as_str())
                .fetch_optional(&mut *tx)
                .await?;
            return Err(match exists {
                Some(_) => conflict(),
                None => Error::NotFound(format!("spool {resource_id}")),
            });
        }

        for (track, state) in &patch.tracks {
            let history: Vec<String> = state.history.iter().map(|w| w.to_string()).collect();
            sqlx::query(
                "INSERT INTO spool_tracks (spool_id, track, status, worker, history, cycle_count)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (spool_id, track) DO UPDATE
                 SET status = EXCLUDED.status, worker = EXCLUDED.worker,
                     history = EXCLUDED.history, cycle_count = EXCLUDED.cycle_count",
            )
            .bind(resource_id.as_str())
            .bind(track.as_str())
            .bind(state.status.as_str())
            .bind(state.worker.as_ref().map(|w| w.as_str()))
            .bind(&history)
            .bind(state.cycle_count as i32)
            .execute(&mut *tx)
            .await?;
        }

        for track in &patch.reset_progress {
            sqlx::query("DELETE FROM sub_unit_completions WHERE spool_id = $1 AND track = $2")
                .bind(resource_id.as_str())
                .bind(track.as_str())
                .execute(&mut *tx)
                .await?;
        }

        if !patch.completions.is_empty() {
            let mut sub_units = Vec::with_capacity(patch.completions.len());
            let mut tracks = Vec::with_capacity(patch.completions.len());
            let mut workers = Vec::with_capacity(patch.completions.len());
            let mut completed_at = Vec::with_capacity(patch.completions.len());
            for c in &patch.completions {
                sub_units.push(c.sub_unit.to_string());
                tracks.push(c.track.to_string());
                workers.push(c.worker.to_string());
                completed_at.push(c.completed_at);
            }

            // All selected sub-units in a single statement.
            sqlx::query(
                "INSERT INTO sub_unit_completions (spool_id, sub_unit_id, track, worker, completed_at)
                 SELECT $1, * FROM UNNEST($2::text[], $3::text[], $4::text[], $5::timestamptz[])",
            )
            .bind(resource_id.as_str())
            .bind(&sub_units)
            .bind(&tracks)
            .bind(&workers)
            .bind(&completed_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(Version::new(next.to_string()))
    }

    async fn list_held(&self) -> Result<Vec<HeldSpool>> {
        let rows: Vec<(String, String, Option<DateTime<Utc>>)> = sqlx::query_as(
            "SELECT id, holder, holder_since FROM spools WHERE holder IS NOT NULL ORDER BY id",
        )
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, holder, holder_since)| HeldSpool {
                id: SpoolId(id),
                holder: WorkerId(holder),
                holder_since,
            })
            .collect())
    }
}

/// Internal row types for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct SpoolRow {
    id: String,
    holder: Option<String>,
    holder_since: Option<DateTime<Utc>>,
    version: Uuid,
}

#[derive(sqlx::FromRow)]
struct TrackRow {
    track: String,
    status: String,
    worker: Option<String>,
    history: Vec<String>,
    cycle_count: i32,
}

#[derive(sqlx::FromRow)]
struct SubUnitRow {
    id: String,
    size: f64,
    tracks: Vec<String>,
}

#[derive(sqlx::FromRow)]
struct CompletionRow {
    sub_unit_id: String,
    track: String,
    worker: String,
    completed_at: DateTime<Utc>,
}

impl SpoolRow {
    fn try_into_spool(
        self,
        tracks: Vec<TrackRow>,
        units: Vec<SubUnitRow>,
        completions: Vec<CompletionRow>,
    ) -> Result<Spool> {
        let mut spool = Spool::new(SpoolId(self.id), Vec::new());
        spool.holder = self.holder.map(WorkerId);
        spool.holder_since = self.holder_since;
        spool.version = Version::new(self.version.to_string());

        for row in tracks {
            let track: Track = row.track.parse()?;
            spool.tracks.insert(
                track,
                TrackState {
                    status: row.status.parse()?,
                    worker: row.worker.map(WorkerId),
                    history: row.history.into_iter().map(WorkerId).collect(),
                    cycle_count: row.cycle_count.max(0) as u32,
                },
            );
        }

        for row in units {
            let tracks = row
                .tracks
                .iter()
                .map(|t| t.parse())
                .collect::<Result<Vec<Track>>>()?;
            spool
                .sub_units
                .push(SubUnit::new(SubUnitId(row.id), row.size).with_tracks(tracks));
        }

        for row in completions {
            let track: Track = row.track.parse()?;
            let id = SubUnitId(row.sub_unit_id);
            if let Some(unit) = spool.sub_units.iter_mut().find(|s| s.id == id) {
                unit.completions.insert(
                    track,
                    Completion {
                        worker: WorkerId(row.worker),
                        completed_at: row.completed_at,
                    },
                );
            }
        }

        Ok(spool)
    }
}
