//! In-memory collaborators for tests and local runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{AuditLog, Publisher, RecordStore, check_batch};
use crate::error::{Error, Result};
use crate::model::event::Event;
use crate::model::spool::{HeldSpool, Spool, SpoolId, SpoolPatch, Version};

// ---------------------------------------------------------------------------
// Record store
// ---------------------------------------------------------------------------

/// Versioned spool records behind a mutex. Versions are a per-store counter.
#[derive(Default)]
pub struct MemoryRecordStore {
    spools: Mutex<HashMap<SpoolId, Spool>>,
    next_version: AtomicU64,
    accepted_writes: AtomicUsize,
    rejected_writes: AtomicUsize,
    sub_unit_writes: AtomicUsize,
    batch_writes: AtomicUsize,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a spool, issuing it a fresh version.
    pub fn seed(&self, mut spool: Spool) -> Version {
        let version = self.issue_version();
        spool.version = version.clone();
        self.spools.lock().insert(spool.id.clone(), spool);
        version
    }

    /// Snapshot without going through the async trait.
    pub fn get(&self, resource_id: &SpoolId) -> Option<Spool> {
        self.spools.lock().get(resource_id).cloned()
    }

    pub fn accepted_writes(&self) -> usize {
        self.accepted_writes.load(Ordering::SeqCst)
    }

    pub fn rejected_writes(&self) -> usize {
        self.rejected_writes.load(Ordering::SeqCst)
    }

    /// Total sub-unit completions written across all accepted writes.
    pub fn sub_unit_writes(&self) -> usize {
        self.sub_unit_writes.load(Ordering::SeqCst)
    }

    /// Calls to [`RecordStore::batch_conditional_write`], accepted or not.
    pub fn batch_writes(&self) -> usize {
        self.batch_writes.load(Ordering::SeqCst)
    }

    fn issue_version(&self) -> Version {
        let n = self.next_version.fetch_add(1, Ordering::SeqCst) + 1;
        Version::new(format!("v{n}"))
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn read(&self, resource_id: &SpoolId) -> Result<Spool> {
        self.get(resource_id)
            .ok_or_else(|| Error::NotFound(format!("spool {resource_id}")))
    }

    async fn conditional_write(
        &self,
        resource_id: &SpoolId,
        expected: &Version,
        patch: &SpoolPatch,
    ) -> Result<Version> {
        let mut spools = self.spools.lock();
        let current = spools
            .get(resource_id)
            .ok_or_else(|| Error::NotFound(format!("spool {resource_id}")))?;

        if &current.version != expected {
            self.rejected_writes.fetch_add(1, Ordering::SeqCst);
            return Err(Error::VersionConflict {
                resource_id: resource_id.clone(),
                expected: expected.to_string(),
            });
        }

        let version = self.issue_version();
        let next = patch.apply_to(current, version.clone());
        spools.insert(resource_id.clone(), next);

        self.accepted_writes.fetch_add(1, Ordering::SeqCst);
        self.sub_unit_writes
            .fetch_add(patch.completions.len(), Ordering::SeqCst);
        Ok(version)
    }

    async fn batch_conditional_write(
        &self,
        resource_id: &SpoolId,
        expected: &Version,
        patch: &SpoolPatch,
    ) -> Result<Version> {
        self.batch_writes.fetch_add(1, Ordering::SeqCst);
        check_batch(resource_id, &patch.completions)?;
        self.conditional_write(resource_id, expected, patch).await
    }

    async fn list_held(&self) -> Result<Vec<HeldSpool>> {
        let spools = self.spools.lock();
        let mut held: Vec<HeldSpool> = spools
            .values()
            .filter_map(|s| {
                s.holder.as_ref().map(|holder| HeldSpool {
                    id: s.id.clone(),
                    holder: holder.clone(),
                    holder_since: s.holder_since,
                })
            })
            .collect();
        held.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(held)
    }
}

// ---------------------------------------------------------------------------
// Audit log
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryAuditLog {
    events: Mutex<Vec<Event>>,
    failing: AtomicBool,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every append fail, to exercise best-effort handling.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Events of one type, by wire name.
    pub fn of_type(&self, event_type: &str) -> Vec<Event> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect()
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(Error::Other("audit log unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl AuditLog for MemoryAuditLog {
    async fn append(&self, event: &Event) -> Result<()> {
        self.check()?;
        self.events.lock().push(event.clone());
        Ok(())
    }

    async fn append_batch(&self, events: &[Event]) -> Result<()> {
        self.check()?;
        self.events.lock().extend_from_slice(events);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryPublisher {
    published: Mutex<Vec<(String, Event)>>,
    failing: AtomicBool,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<(String, Event)> {
        self.published.lock().clone()
    }

    pub fn on_channel(&self, channel: &str) -> Vec<Event> {
        self.published
            .lock()
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, e)| e.clone())
            .collect()
    }
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(&self, channel: &str, event: &Event) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Other("publisher unavailable".to_string()));
        }
        self.published
            .lock()
            .push((channel.to_string(), event.clone()));
        Ok(())
    }
}
