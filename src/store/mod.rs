//! Contracts for the collaborators the occupation core writes through.
//!
//! The record store is the versioned source of truth for spools. The audit
//! log and realtime publisher are best-effort sinks: their failures are
//! logged by callers and never fail an occupation operation.

pub mod memory;

use std::collections::HashSet;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::model::event::Event;
use crate::model::spool::{HeldSpool, Spool, SpoolId, SpoolPatch, SubUnitCompletion, Version};

pub use memory::{MemoryAuditLog, MemoryPublisher, MemoryRecordStore};

/// Versioned persistence for spools.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn read(&self, resource_id: &SpoolId) -> Result<Spool>;

    /// Apply `patch` only if the stored version still equals `expected`.
    /// Returns the new version, or [`crate::error::Error::VersionConflict`].
    /// Fields the patch leaves empty must not be rewritten.
    async fn conditional_write(
        &self,
        resource_id: &SpoolId,
        expected: &Version,
        patch: &SpoolPatch,
    ) -> Result<Version>;

    /// Conditional write carrying a batch of sub-unit completions in
    /// `patch.completions`. The batch and the patch's other fields commit
    /// together or not at all.
    async fn batch_conditional_write(
        &self,
        resource_id: &SpoolId,
        expected: &Version,
        patch: &SpoolPatch,
    ) -> Result<Version> {
        check_batch(resource_id, &patch.completions)?;
        self.conditional_write(resource_id, expected, patch).await
    }

    /// Every spool whose holder field is set.
    async fn list_held(&self) -> Result<Vec<HeldSpool>>;
}

/// A completion batch names each sub-unit at most once per track.
pub fn check_batch(resource_id: &SpoolId, completions: &[SubUnitCompletion]) -> Result<()> {
    let mut seen = HashSet::new();
    for c in completions {
        if !seen.insert((&c.sub_unit, c.track)) {
            return Err(Error::InvalidSelection {
                resource_id: resource_id.clone(),
                sub_unit: c.sub_unit.clone(),
                reason: format!("{} recorded twice in one batch", c.track),
            });
        }
    }
    Ok(())
}

/// Append-only audit trail. Implementations chunk large batches themselves.
#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn append(&self, event: &Event) -> Result<()>;

    async fn append_batch(&self, events: &[Event]) -> Result<()> {
        for event in events {
            self.append(event).await?;
        }
        Ok(())
    }
}

/// Realtime fan-out to connected clients. No delivery guarantee.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, channel: &str, event: &Event) -> Result<()>;
}

/// Channel carrying every event for one spool.
pub fn spool_channel(resource_id: &SpoolId) -> String {
    format!("spool:{resource_id}")
}

/// Channel carrying every occupation event.
pub const GLOBAL_CHANNEL: &str = "occupation";
