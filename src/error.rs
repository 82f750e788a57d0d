//! Error types for spool-occupation.
//!
//! Business-rule violations carry enough context (current holder, missing
//! prerequisite) for the API layer to build a user-facing message.

use thiserror::Error;

use crate::model::spool::{SpoolId, SubUnitId, WorkerId};
use crate::model::track::{Track, TrackStatus};

#[derive(Debug, Error)]
pub enum Error {
    #[error("spool {resource_id} is already occupied by {}", display_holder(.holder))]
    AlreadyOccupied {
        resource_id: SpoolId,
        holder: Option<WorkerId>,
    },

    #[error("worker {worker} does not hold spool {resource_id} (holder: {})", display_holder(.holder))]
    Ownership {
        resource_id: SpoolId,
        worker: WorkerId,
        holder: Option<WorkerId>,
    },

    #[error("gave up writing spool {resource_id} after {attempts} version conflicts")]
    ConflictExhausted { resource_id: SpoolId, attempts: u32 },

    #[error("version conflict on spool {resource_id}: expected {expected}")]
    VersionConflict {
        resource_id: SpoolId,
        expected: String,
    },

    #[error("spool {resource_id} changed underneath the caller: expected {expected} available sub-units, found {actual}")]
    StaleSelection {
        resource_id: SpoolId,
        expected: usize,
        actual: usize,
    },

    #[error("sub-unit {sub_unit} on spool {resource_id} cannot be selected: {reason}")]
    InvalidSelection {
        resource_id: SpoolId,
        sub_unit: SubUnitId,
        reason: String,
    },

    #[error("cannot start {track} on spool {resource_id}: {missing}")]
    PrerequisiteNotMet {
        resource_id: SpoolId,
        track: Track,
        missing: String,
    },

    #[error("{track} on spool {resource_id} is blocked after {cycles} rework cycles (limit {bound})")]
    CycleLimitExceeded {
        resource_id: SpoolId,
        track: Track,
        cycles: u32,
        bound: u32,
    },

    #[error("invalid {track} transition: {from} -> {to}")]
    InvalidTransition {
        track: Track,
        from: TrackStatus,
        to: TrackStatus,
    },

    #[error("lock on spool {resource_id} has expired or was never taken")]
    LockExpired { resource_id: SpoolId },

    #[error("lock backend unavailable: {0}")]
    LockBackendUnavailable(String),

    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether a caller may reasonably retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConflictExhausted { .. }
                | Error::VersionConflict { .. }
                | Error::StaleSelection { .. }
                | Error::LockBackendUnavailable(_)
        )
    }
}

fn display_holder(holder: &Option<WorkerId>) -> String {
    holder
        .as_ref()
        .map(|w| w.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

pub type Result<T> = std::result::Result<T, Error>;
