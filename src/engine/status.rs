//! Composite status: the human-readable summary of a spool.
//!
//! Derived on every read from the holder and the track states; never stored.

use std::collections::{BTreeMap, BTreeSet};

use crate::model::spool::WorkerId;
use crate::model::track::{Track, TrackState, TrackStatus};

/// Render the composite status, e.g.
/// `"Occupied by W-12 | assembly done | welding in progress"`.
///
/// Only `relevant` tracks count towards "Complete" and "Blocked". The rest
/// render as `n/a`.
pub fn composite_status(
    holder: Option<&WorkerId>,
    tracks: &BTreeMap<Track, TrackState>,
    relevant: &BTreeSet<Track>,
) -> String {
    let status_of = |track: Track| tracks.get(&track).map(|s| s.status).unwrap_or_default();

    let head = match holder {
        Some(worker) => format!("Occupied by {worker}"),
        None if !relevant.is_empty()
            && relevant
                .iter()
                .all(|t| status_of(*t) == TrackStatus::Completed) =>
        {
            "Complete".to_string()
        }
        None if relevant
            .iter()
            .any(|t| status_of(*t) == TrackStatus::Blocked) =>
        {
            "Blocked".to_string()
        }
        None => "Free".to_string(),
    };

    let mut out = head;
    for track in Track::ALL {
        out.push_str(" | ");
        out.push_str(track.as_str());
        out.push(' ');
        if relevant.contains(&track) {
            out.push_str(label(status_of(track)));
        } else {
            out.push_str("n/a");
        }
    }
    out
}

fn label(status: TrackStatus) -> &'static str {
    match status {
        TrackStatus::Pending => "pending",
        TrackStatus::InProgress => "in progress",
        TrackStatus::Paused => "paused",
        TrackStatus::Completed => "done",
        TrackStatus::Blocked => "blocked",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all() -> BTreeSet<Track> {
        Track::ALL.into_iter().collect()
    }

    fn state(status: TrackStatus) -> TrackState {
        TrackState {
            status,
            ..Default::default()
        }
    }

    #[test]
    fn free_spool_with_no_tracks() {
        assert_eq!(
            composite_status(None, &BTreeMap::new(), &all()),
            "Free | assembly pending | welding pending"
        );
    }

    #[test]
    fn occupied_spool() {
        let tracks = BTreeMap::from([
            (Track::Assembly, state(TrackStatus::Completed)),
            (Track::Welding, state(TrackStatus::InProgress)),
        ]);
        let worker = WorkerId::new("W-12");
        assert_eq!(
            composite_status(Some(&worker), &tracks, &all()),
            "Occupied by W-12 | assembly done | welding in progress"
        );
    }

    #[test]
    fn all_done_and_blocked_heads() {
        let done = BTreeMap::from([
            (Track::Assembly, state(TrackStatus::Completed)),
            (Track::Welding, state(TrackStatus::Completed)),
        ]);
        assert!(composite_status(None, &done, &all()).starts_with("Complete |"));

        let blocked = BTreeMap::from([(Track::Welding, state(TrackStatus::Blocked))]);
        assert!(composite_status(None, &blocked, &all()).starts_with("Blocked |"));
    }

    #[test]
    fn irrelevant_tracks_do_not_hold_back_complete() {
        let tracks = BTreeMap::from([(Track::Assembly, state(TrackStatus::Completed))]);
        let assembly_only = BTreeSet::from([Track::Assembly]);
        assert_eq!(
            composite_status(None, &tracks, &assembly_only),
            "Complete | assembly done | welding n/a"
        );
        assert!(composite_status(None, &tracks, &all()).starts_with("Free |"));
    }

    #[test]
    fn is_pure() {
        let tracks = BTreeMap::from([(Track::Assembly, state(TrackStatus::Paused))]);
        let worker = WorkerId::new("W-1");
        let first = composite_status(Some(&worker), &tracks, &all());
        for _ in 0..10 {
            assert_eq!(composite_status(Some(&worker), &tracks, &all()), first);
        }
    }
}
