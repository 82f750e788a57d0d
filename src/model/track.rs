//! Operation tracks and their per-track lifecycle state.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::spool::WorkerId;

// ---------------------------------------------------------------------------
// Track
// ---------------------------------------------------------------------------

/// An independent operation lane applied to a spool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Track {
    Assembly,
    Welding,
}

impl Track {
    /// All tracks, in shop-floor order.
    pub const ALL: [Track; 2] = [Track::Assembly, Track::Welding];

    /// The track whose sub-unit work must precede this one, if any.
    pub fn upstream(self) -> Option<Track> {
        match self {
            Track::Assembly => None,
            Track::Welding => Some(Track::Assembly),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Track::Assembly => "assembly",
            Track::Welding => "welding",
        }
    }
}

impl std::fmt::Display for Track {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Track {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "assembly" => Ok(Track::Assembly),
            "welding" => Ok(Track::Welding),
            other => Err(Error::Other(format!("unknown track: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Track status
// ---------------------------------------------------------------------------

/// Lifecycle state of one track on one spool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackStatus {
    /// Not started.
    #[default]
    Pending,
    /// A worker holds the spool and is working this track.
    InProgress,
    /// Partial progress recorded, spool released.
    Paused,
    /// All applicable sub-units done. Terminal unless reopened by rework.
    Completed,
    /// Rework limit reached. Terminal unless a supervisor resets it.
    Blocked,
}

impl TrackStatus {
    /// Structural transition table. Guard conditions (holder, rework bound)
    /// are checked by the state machine engine on top of this.
    pub fn can_transition_to(self, to: TrackStatus) -> bool {
        use TrackStatus::*;
        matches!(
            (self, to),
            (Pending, InProgress)
                | (Paused, InProgress)
                | (InProgress, Paused)
                | (InProgress, Completed)
                | (InProgress, Pending)     // cancelled before any progress
                | (Completed, Pending)      // rework reopen
                | (Paused, Pending)         // rework reopen
                | (Completed, Blocked)
                | (Paused, Blocked)
                | (Blocked, Pending) // supervisor override
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TrackStatus::Completed | TrackStatus::Blocked)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TrackStatus::Pending => "pending",
            TrackStatus::InProgress => "in_progress",
            TrackStatus::Paused => "paused",
            TrackStatus::Completed => "completed",
            TrackStatus::Blocked => "blocked",
        }
    }
}

impl std::fmt::Display for TrackStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TrackStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TrackStatus::Pending),
            "in_progress" => Ok(TrackStatus::InProgress),
            "paused" => Ok(TrackStatus::Paused),
            "completed" => Ok(TrackStatus::Completed),
            "blocked" => Ok(TrackStatus::Blocked),
            other => Err(Error::Other(format!("unknown track status: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Track state
// ---------------------------------------------------------------------------

/// Persisted state of one track on one spool.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TrackState {
    pub status: TrackStatus,

    /// Worker currently responsible while in progress.
    pub worker: Option<WorkerId>,

    /// Every worker who has started this track, oldest first.
    pub history: Vec<WorkerId>,

    /// Rework cycles granted so far.
    pub cycle_count: u32,
}

impl TrackState {
    pub fn pending() -> Self {
        Self::default()
    }
}
