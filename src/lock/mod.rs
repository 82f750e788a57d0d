//! Distributed mutual exclusion over spools.
//!
//! A [`LockBackend`] provides the two atomic primitives (set-if-absent with
//! optional expiry, compare-and-delete); [`LockService`] layers ownership
//! tokens, lazy abandonment cleanup and startup reconciliation on top.
//! The record store's holder field is the source of truth; locks are the
//! fast exclusion path in front of it.

pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::spool::{SpoolId, WorkerId};
use crate::store::RecordStore;
use crate::telemetry::metrics;

pub use memory::MemoryLockBackend;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Ownership token handed to whoever acquired a lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockToken(pub Uuid);

impl LockToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LockToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether a lock self-expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Expires after the given duration unless extended.
    Ttl(Duration),
    /// Lives until released or cleaned up as abandoned.
    Persistent,
}

impl LockMode {
    pub fn as_str(self) -> &'static str {
        match self {
            LockMode::Ttl(_) => "ttl",
            LockMode::Persistent => "persistent",
        }
    }
}

/// How exclusion was obtained for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockGrant {
    /// A real lock from the backend.
    Locked(LockToken),
    /// Backend unavailable; only the record store's holder field guards the
    /// spool.
    Advisory,
}

impl LockGrant {
    pub fn token(&self) -> Option<&LockToken> {
        match self {
            LockGrant::Locked(token) => Some(token),
            LockGrant::Advisory => None,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, LockGrant::Advisory)
    }
}

/// A live lock entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Lock {
    pub resource_id: SpoolId,
    pub owner: WorkerId,
    pub token: LockToken,
    pub acquired_at: DateTime<Utc>,
    /// `None` for persistent locks.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Lock {
    pub fn new(resource_id: SpoolId, owner: WorkerId, mode: LockMode, now: DateTime<Utc>) -> Self {
        Self {
            resource_id,
            owner,
            token: LockToken::new(),
            acquired_at: now,
            expires_at: expiry(mode, now),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn mode(&self) -> &'static str {
        if self.expires_at.is_some() {
            "ttl"
        } else {
            "persistent"
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.acquired_at
    }
}

fn expiry(mode: LockMode, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match mode {
        LockMode::Ttl(ttl) => Some(now + to_chrono(ttl)),
        LockMode::Persistent => None,
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

/// Outcome of startup reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub recreated: usize,
    pub already_locked: usize,
    pub skipped_stale: usize,
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

/// Infrastructure primitives a lock backend must provide atomically.
///
/// Expired entries must be treated as absent by every operation. Backends
/// report infrastructure faults as [`Error::LockBackendUnavailable`].
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Store `lock` if no live entry exists for its resource. Returns whether
    /// it was stored.
    async fn set_if_absent(&self, lock: &Lock) -> Result<bool>;

    /// Delete the entry only if its token matches. Returns whether a delete
    /// happened.
    async fn compare_and_delete(&self, resource_id: &SpoolId, token: &LockToken) -> Result<bool>;

    /// Move the expiry of a live entry whose token matches.
    async fn compare_and_extend(
        &self,
        resource_id: &SpoolId,
        token: &LockToken,
        expires_at: DateTime<Utc>,
    ) -> Result<bool>;

    async fn get(&self, resource_id: &SpoolId) -> Result<Option<Lock>>;

    /// Cheap liveness check.
    async fn ping(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Thresholds governing abandonment.
#[derive(Debug, Clone, Copy)]
pub struct LockSettings {
    /// Locks older than this whose spool record disagrees are abandoned.
    pub abandonment: Duration,
    /// Holders older than this are not restored at startup.
    pub staleness: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            abandonment: Duration::from_secs(8 * 60 * 60),
            staleness: Duration::from_secs(8 * 60 * 60),
        }
    }
}

/// Lock service over a backend, consulting the record store for abandonment.
pub struct LockService {
    backend: Arc<dyn LockBackend>,
    store: Arc<dyn RecordStore>,
    settings: LockSettings,
}

impl LockService {
    pub fn new(
        backend: Arc<dyn LockBackend>,
        store: Arc<dyn RecordStore>,
        settings: LockSettings,
    ) -> Self {
        Self {
            backend,
            store,
            settings,
        }
    }

    /// Take the lock on `resource_id` for `owner`.
    ///
    /// On contention, the contested lock alone is checked for abandonment and
    /// one more attempt is made if it was cleaned up.
    pub async fn acquire(
        &self,
        resource_id: &SpoolId,
        owner: &WorkerId,
        mode: LockMode,
    ) -> Result<LockToken> {
        let lock = Lock::new(resource_id.clone(), owner.clone(), mode, Utc::now());
        if self.record("acquire", self.backend.set_if_absent(&lock).await)? {
            debug!(%resource_id, %owner, mode = mode.as_str(), "lock acquired");
            return Ok(lock.token);
        }

        if self.lazy_cleanup(resource_id).await? {
            let lock = Lock::new(resource_id.clone(), owner.clone(), mode, Utc::now());
            if self.record("acquire", self.backend.set_if_absent(&lock).await)? {
                info!(%resource_id, %owner, "lock acquired after abandoned lock cleanup");
                return Ok(lock.token);
            }
        }

        let holder = self.get_owner(resource_id).await?.map(|(owner, _)| owner);
        metrics::lock_operations().add(
            1,
            &[
                KeyValue::new("operation", "acquire"),
                KeyValue::new("result", "occupied"),
            ],
        );
        Err(Error::AlreadyOccupied {
            resource_id: resource_id.clone(),
            holder,
        })
    }

    /// Release the lock if `owner` holds it with `token`. Absent or foreign
    /// locks yield `false`, never an error.
    pub async fn release(
        &self,
        resource_id: &SpoolId,
        owner: &WorkerId,
        token: &LockToken,
    ) -> Result<bool> {
        match self.backend.get(resource_id).await {
            Ok(Some(lock)) if &lock.owner != owner => {
                debug!(%resource_id, %owner, holder = %lock.owner, "release refused: foreign owner");
                return Ok(false);
            }
            Ok(None) => return Ok(false),
            Ok(Some(_)) => {}
            Err(e) => return Err(e),
        }
        let released = self.record(
            "release",
            self.backend.compare_and_delete(resource_id, token).await,
        )?;
        if released {
            debug!(%resource_id, %owner, "lock released");
        }
        Ok(released)
    }

    /// Push out the expiry of a TTL lock. Persistent locks never expire, so
    /// extending one is a successful no-op.
    pub async fn extend(
        &self,
        resource_id: &SpoolId,
        owner: &WorkerId,
        token: &LockToken,
        new_ttl: Duration,
    ) -> Result<bool> {
        let Some(lock) = self.backend.get(resource_id).await? else {
            return Err(Error::LockExpired {
                resource_id: resource_id.clone(),
            });
        };
        if &lock.owner != owner || &lock.token != token {
            return Ok(false);
        }
        if lock.expires_at.is_none() {
            return Ok(true);
        }
        let expires_at = Utc::now() + to_chrono(new_ttl);
        let extended = self.record(
            "extend",
            self.backend
                .compare_and_extend(resource_id, token, expires_at)
                .await,
        )?;
        if !extended {
            // Expired between the read and the write.
            return Err(Error::LockExpired {
                resource_id: resource_id.clone(),
            });
        }
        Ok(true)
    }

    pub async fn get_owner(&self, resource_id: &SpoolId) -> Result<Option<(WorkerId, LockToken)>> {
        Ok(self
            .backend
            .get(resource_id)
            .await?
            .map(|lock| (lock.owner, lock.token)))
    }

    pub async fn get_lock(&self, resource_id: &SpoolId) -> Result<Option<Lock>> {
        self.backend.get(resource_id).await
    }

    /// Whether a holder recorded at `since` is past the staleness threshold.
    /// A holder with no recorded start is always stale.
    pub fn is_stale(&self, since: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        let staleness = to_chrono(self.settings.staleness);
        since.is_none_or(|since| now - since > staleness)
    }

    /// Whether the backend currently answers.
    pub async fn health(&self) -> Result<()> {
        self.backend.ping().await
    }

    /// Remove the lock on one contested resource if it is older than the
    /// abandonment threshold and the spool record names a different holder
    /// (or none). Returns whether a lock was removed.
    pub async fn lazy_cleanup(&self, resource_id: &SpoolId) -> Result<bool> {
        let Some(lock) = self.backend.get(resource_id).await? else {
            return Ok(false);
        };
        let now = Utc::now();
        if lock.age(now) < to_chrono(self.settings.abandonment) {
            return Ok(false);
        }

        let spool = self.store.read(resource_id).await?;
        if spool.holder.as_ref() == Some(&lock.owner) {
            return Ok(false);
        }

        let removed = self.record(
            "cleanup",
            self.backend
                .compare_and_delete(resource_id, &lock.token)
                .await,
        )?;
        if removed {
            warn!(
                %resource_id,
                owner = %lock.owner,
                age_secs = lock.age(now).num_seconds(),
                "removed abandoned lock"
            );
        }
        Ok(removed)
    }

    /// Recreate locks for every spool the record store says is held, unless
    /// the holder is older than the staleness threshold.
    pub async fn reconcile_from_source_of_truth(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let now = Utc::now();

        for held in self.store.list_held().await? {
            if self.is_stale(held.holder_since, now) {
                warn!(
                    resource_id = %held.id,
                    holder = %held.holder,
                    "holder is stale, not restoring lock; next start reclaims the spool"
                );
                report.skipped_stale += 1;
                continue;
            }

            let mut lock = Lock::new(held.id.clone(), held.holder.clone(), LockMode::Persistent, now);
            if let Some(since) = held.holder_since {
                lock.acquired_at = since;
            }
            if self.backend.set_if_absent(&lock).await? {
                info!(resource_id = %held.id, holder = %held.holder, "restored lock from record");
                report.recreated += 1;
            } else {
                report.already_locked += 1;
            }
        }

        info!(
            recreated = report.recreated,
            already_locked = report.already_locked,
            skipped_stale = report.skipped_stale,
            "lock reconciliation finished"
        );
        Ok(report)
    }

    fn record(&self, operation: &'static str, result: Result<bool>) -> Result<bool> {
        let label = match &result {
            Ok(true) => "ok",
            Ok(false) => "miss",
            Err(_) => "error",
        };
        metrics::lock_operations().add(
            1,
            &[
                KeyValue::new("operation", operation),
                KeyValue::new("result", label),
            ],
        );
        result
    }
}
