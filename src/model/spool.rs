//! Spools, their sub-units, and the patches that mutate them.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::track::{Track, TrackState};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Stable key of a spool (its shop tag).
    SpoolId
);
string_id!(
    /// Identifier of a shop-floor worker.
    WorkerId
);
string_id!(
    /// Identifier of a sub-unit (weld joint) within its spool.
    SubUnitId
);
string_id!(
    /// Opaque version token issued by the record store on every accepted write.
    Version
);

// ---------------------------------------------------------------------------
// Sub-units
// ---------------------------------------------------------------------------

/// Who finished a sub-unit on a track, and when.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub worker: WorkerId,
    pub completed_at: DateTime<Utc>,
}

/// A finer-grained child of a spool with its own per-track completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubUnit {
    pub id: SubUnitId,

    /// Size metric (joint diameter) used to weight percentage-complete.
    pub size: f64,

    /// Tracks that apply to this sub-unit. Field joints skip shop welding, etc.
    pub tracks: BTreeSet<Track>,

    pub completions: BTreeMap<Track, Completion>,
}

impl SubUnit {
    /// A sub-unit to which every track applies.
    pub fn new(id: impl Into<SubUnitId>, size: f64) -> Self {
        Self {
            id: id.into(),
            size,
            tracks: Track::ALL.into_iter().collect(),
            completions: BTreeMap::new(),
        }
    }

    pub fn with_tracks(mut self, tracks: impl IntoIterator<Item = Track>) -> Self {
        self.tracks = tracks.into_iter().collect();
        self
    }

    pub fn completed(mut self, track: Track, worker: impl Into<WorkerId>) -> Self {
        self.completions.insert(
            track,
            Completion {
                worker: worker.into(),
                completed_at: Utc::now(),
            },
        );
        self
    }

    pub fn applies_to(&self, track: Track) -> bool {
        self.tracks.contains(&track)
    }

    pub fn is_completed(&self, track: Track) -> bool {
        self.completions.contains_key(&track)
    }

    /// Applicable, not yet done, and upstream work (if it applies) finished.
    pub fn is_available(&self, track: Track) -> bool {
        if !self.applies_to(track) || self.is_completed(track) {
            return false;
        }
        match track.upstream() {
            Some(up) if self.applies_to(up) => self.is_completed(up),
            _ => true,
        }
    }
}

// ---------------------------------------------------------------------------
// Spool
// ---------------------------------------------------------------------------

/// A spool as read from the record store. Immutable value plus version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spool {
    pub id: SpoolId,

    /// Worker currently occupying the spool. Non-null iff occupied.
    pub holder: Option<WorkerId>,
    pub holder_since: Option<DateTime<Utc>>,

    pub version: Version,

    /// Per-track state. A missing entry means the track is pending.
    pub tracks: BTreeMap<Track, TrackState>,

    pub sub_units: Vec<SubUnit>,
}

impl Spool {
    /// A free spool with all tracks pending.
    pub fn new(id: impl Into<SpoolId>, sub_units: Vec<SubUnit>) -> Self {
        Self {
            id: id.into(),
            holder: None,
            holder_since: None,
            version: Version::new("0"),
            tracks: BTreeMap::new(),
            sub_units,
        }
    }

    pub fn is_occupied(&self) -> bool {
        self.holder.is_some()
    }

    pub fn track_state(&self, track: Track) -> TrackState {
        self.tracks.get(&track).cloned().unwrap_or_default()
    }

    pub fn sub_unit(&self, id: &SubUnitId) -> Option<&SubUnit> {
        self.sub_units.iter().find(|s| &s.id == id)
    }

    pub fn applicable(&self, track: Track) -> impl Iterator<Item = &SubUnit> {
        self.sub_units.iter().filter(move |s| s.applies_to(track))
    }

    /// Tracks with at least one applicable sub-unit. A spool without
    /// sub-units counts every track.
    pub fn relevant_tracks(&self) -> BTreeSet<Track> {
        if self.sub_units.is_empty() {
            return Track::ALL.into_iter().collect();
        }
        Track::ALL
            .into_iter()
            .filter(|t| self.applicable(*t).next().is_some())
            .collect()
    }

    /// Sub-units a worker could record on this track right now.
    pub fn available(&self, track: Track) -> impl Iterator<Item = &SubUnit> {
        self.sub_units.iter().filter(move |s| s.is_available(track))
    }

    /// Applicable sub-units not yet completed on this track.
    pub fn remaining(&self, track: Track) -> impl Iterator<Item = &SubUnit> {
        self.applicable(track).filter(move |s| !s.is_completed(track))
    }

    pub fn progress(&self, track: Track) -> Progress {
        let mut progress = Progress::default();
        for unit in self.applicable(track) {
            progress.total += 1;
            progress.total_size += unit.size;
            if unit.is_completed(track) {
                progress.completed += 1;
                progress.completed_size += unit.size;
            }
        }
        progress
    }
}

/// Sub-unit progress on one track.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
    pub completed_size: f64,
    pub total_size: f64,
}

impl Progress {
    /// Size-weighted percentage complete, 0.0..=100.0.
    pub fn percent(&self) -> f64 {
        if self.total_size > 0.0 {
            self.completed_size / self.total_size * 100.0
        } else if self.total > 0 {
            self.completed as f64 / self.total as f64 * 100.0
        } else {
            0.0
        }
    }
}

/// Minimal projection used for startup lock reconciliation.
#[derive(Debug, Clone)]
pub struct HeldSpool {
    pub id: SpoolId,
    pub holder: WorkerId,
    pub holder_since: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Patch
// ---------------------------------------------------------------------------

/// Change to the holder fields.
#[derive(Debug, Clone, PartialEq)]
pub enum HolderUpdate {
    Set {
        worker: WorkerId,
        since: DateTime<Utc>,
    },
    Clear,
}

/// One sub-unit completion to record.
#[derive(Debug, Clone, PartialEq)]
pub struct SubUnitCompletion {
    pub sub_unit: SubUnitId,
    pub track: Track,
    pub worker: WorkerId,
    pub completed_at: DateTime<Utc>,
}

/// Partial-field write against a spool. Fields left empty are not touched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpoolPatch {
    pub holder: Option<HolderUpdate>,
    pub tracks: BTreeMap<Track, TrackState>,
    pub completions: Vec<SubUnitCompletion>,
    /// Tracks whose sub-unit completions are wiped (rework reopen).
    pub reset_progress: BTreeSet<Track>,
}

impl SpoolPatch {
    pub fn is_empty(&self) -> bool {
        self.holder.is_none()
            && self.tracks.is_empty()
            && self.completions.is_empty()
            && self.reset_progress.is_empty()
    }

    /// The spool as it reads after this patch is accepted under `version`.
    pub fn apply_to(&self, spool: &Spool, version: Version) -> Spool {
        let mut next = spool.clone();
        next.version = version;

        match &self.holder {
            Some(HolderUpdate::Set { worker, since }) => {
                next.holder = Some(worker.clone());
                next.holder_since = Some(*since);
            }
            Some(HolderUpdate::Clear) => {
                next.holder = None;
                next.holder_since = None;
            }
            None => {}
        }

        for (track, state) in &self.tracks {
            next.tracks.insert(*track, state.clone());
        }

        for track in &self.reset_progress {
            for unit in &mut next.sub_units {
                unit.completions.remove(track);
            }
        }

        for c in &self.completions {
            if let Some(unit) = next.sub_units.iter_mut().find(|s| s.id == c.sub_unit) {
                unit.completions.insert(
                    c.track,
                    Completion {
                        worker: c.worker.clone(),
                        completed_at: c.completed_at,
                    },
                );
            }
        }

        next
    }
}
