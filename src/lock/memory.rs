//! In-process lock backend.
//!
//! Atomicity comes from dashmap's per-shard entry locking. Useful for tests
//! and single-process deployments; can be switched offline to exercise the
//! degraded path.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::{Lock, LockBackend, LockToken};
use crate::error::{Error, Result};
use crate::model::spool::SpoolId;

#[derive(Default)]
pub struct MemoryLockBackend {
    locks: DashMap<SpoolId, Lock>,
    offline: AtomicBool,
}

impl MemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the backend going down (or coming back).
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Plant a lock directly, bypassing set-if-absent. For seeding aged or
    /// foreign locks.
    pub fn insert(&self, lock: Lock) {
        self.locks.insert(lock.resource_id.clone(), lock);
    }

    /// Number of live locks.
    pub fn len(&self) -> usize {
        let now = Utc::now();
        self.locks.iter().filter(|l| !l.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(Error::LockBackendUnavailable(
                "in-memory lock backend is offline".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl LockBackend for MemoryLockBackend {
    async fn set_if_absent(&self, lock: &Lock) -> Result<bool> {
        self.check_online()?;
        let now = Utc::now();
        match self.locks.entry(lock.resource_id.clone()) {
            Entry::Occupied(mut existing) => {
                if existing.get().is_expired(now) {
                    existing.insert(lock.clone());
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(lock.clone());
                Ok(true)
            }
        }
    }

    async fn compare_and_delete(&self, resource_id: &SpoolId, token: &LockToken) -> Result<bool> {
        self.check_online()?;
        Ok(self
            .locks
            .remove_if(resource_id, |_, lock| &lock.token == token)
            .is_some())
    }

    async fn compare_and_extend(
        &self,
        resource_id: &SpoolId,
        token: &LockToken,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        self.check_online()?;
        let now = Utc::now();
        match self.locks.get_mut(resource_id) {
            Some(mut lock) if &lock.token == token && !lock.is_expired(now) => {
                lock.expires_at = Some(expires_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, resource_id: &SpoolId) -> Result<Option<Lock>> {
        self.check_online()?;
        let now = Utc::now();
        Ok(self
            .locks
            .get(resource_id)
            .map(|lock| lock.value().clone())
            .filter(|lock| !lock.is_expired(now)))
    }

    async fn ping(&self) -> Result<()> {
        self.check_online()
    }
}
