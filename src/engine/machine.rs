//! Per-track state machine.
//!
//! Pure: every operation takes a spool snapshot and returns the resulting
//! [`Transition`] plus the side effects the caller must carry out. Nothing
//! here touches a lock, a store, or a clock.

use crate::engine::rework::ReworkCycleGuard;
use crate::engine::status::composite_status;
use crate::error::{Error, Result};
use crate::lock::LockGrant;
use crate::model::spool::{Spool, WorkerId};
use crate::model::track::{Track, TrackState, TrackStatus};

/// Proof that a worker obtained exclusion over a spool for this request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Occupancy {
    pub worker: WorkerId,
    pub grant: LockGrant,
}

/// Work the caller must do after a transition is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    ReleaseLock,
    /// Wipe this track's sub-unit completions.
    ResetSubUnitProgress,
    /// Every track on the spool is now complete.
    DownstreamQueue,
    ReworkReopened { cycle: u32 },
    BlockedEscalated { cycle: u32, bound: u32 },
}

/// Result of one track transition.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub track: Track,
    pub from: TrackStatus,
    pub to: TrackStatus,
    pub state: TrackState,
    pub effects: Vec<Effect>,
}

impl Transition {
    pub fn has(&self, effect: Effect) -> bool {
        self.effects.contains(&effect)
    }
}

// ---------------------------------------------------------------------------
// Track machine
// ---------------------------------------------------------------------------

/// One track's machine. Built only through [`TrackMachine::hydrate`], which
/// initialises first and applies persisted state last, so hydrated state can
/// never be overwritten by a late default.
#[derive(Debug, Clone)]
pub struct TrackMachine {
    track: Track,
    state: TrackState,
}

impl TrackMachine {
    fn initial(track: Track) -> Self {
        Self {
            track,
            state: TrackState::pending(),
        }
    }

    pub fn hydrate(track: Track, persisted: Option<&TrackState>) -> Self {
        let mut machine = Self::initial(track);
        if let Some(state) = persisted {
            machine.state = state.clone();
        }
        machine
    }

    pub fn track(&self) -> Track {
        self.track
    }

    pub fn status(&self) -> TrackStatus {
        self.state.status
    }

    pub fn state(&self) -> &TrackState {
        &self.state
    }

    fn move_to(&mut self, to: TrackStatus) -> Result<TrackStatus> {
        let from = self.state.status;
        if !from.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                track: self.track,
                from,
                to,
            });
        }
        self.state.status = to;
        Ok(from)
    }

    fn finish(self, from: TrackStatus, effects: Vec<Effect>) -> Transition {
        Transition {
            track: self.track,
            from,
            to: self.state.status,
            state: self.state,
            effects,
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Drives track machines against spool snapshots.
#[derive(Debug, Clone, Copy, Default)]
pub struct StateMachineEngine {
    guard: ReworkCycleGuard,
}

impl StateMachineEngine {
    pub fn new(guard: ReworkCycleGuard) -> Self {
        Self { guard }
    }

    pub fn guard(&self) -> &ReworkCycleGuard {
        &self.guard
    }

    pub fn machine(&self, spool: &Spool, track: Track) -> TrackMachine {
        TrackMachine::hydrate(track, spool.tracks.get(&track))
    }

    /// Composite status for a snapshot.
    pub fn composite(&self, spool: &Spool) -> String {
        composite_status(spool.holder.as_ref(), &spool.tracks, &spool.relevant_tracks())
    }

    /// pending | paused → in_progress. The occupancy must belong to the
    /// spool's holder, or the spool must be free and about to be taken.
    pub fn start(&self, spool: &Spool, track: Track, occupancy: &Occupancy) -> Result<Transition> {
        match &spool.holder {
            Some(holder) if holder != &occupancy.worker => {
                return Err(Error::AlreadyOccupied {
                    resource_id: spool.id.clone(),
                    holder: Some(holder.clone()),
                });
            }
            _ => {}
        }

        let mut machine = self.machine(spool, track);
        if machine.status() == TrackStatus::Blocked {
            return Err(Error::CycleLimitExceeded {
                resource_id: spool.id.clone(),
                track,
                cycles: machine.state.cycle_count,
                bound: self.guard.bound(),
            });
        }

        let from = machine.move_to(TrackStatus::InProgress)?;
        machine.state.worker = Some(occupancy.worker.clone());
        if machine.state.history.last() != Some(&occupancy.worker) {
            machine.state.history.push(occupancy.worker.clone());
        }
        Ok(machine.finish(from, vec![]))
    }

    /// in_progress → paused. Sub-unit progress is left as is.
    pub fn pause(&self, spool: &Spool, track: Track, occupancy: &Occupancy) -> Result<Transition> {
        let mut machine = self.held_machine(spool, track, occupancy)?;
        let from = machine.move_to(TrackStatus::Paused)?;
        machine.state.worker = None;
        Ok(machine.finish(from, vec![Effect::ReleaseLock]))
    }

    /// in_progress → completed. Signals the downstream queue when this was
    /// the last incomplete track on the spool.
    pub fn complete(&self, spool: &Spool, track: Track, occupancy: &Occupancy) -> Result<Transition> {
        let mut machine = self.held_machine(spool, track, occupancy)?;
        let from = machine.move_to(TrackStatus::Completed)?;
        machine.state.worker = None;

        let mut effects = vec![Effect::ReleaseLock];
        let others_done = spool
            .relevant_tracks()
            .into_iter()
            .filter(|t| *t != track)
            .all(|t| spool.track_state(t).status == TrackStatus::Completed);
        if others_done {
            effects.push(Effect::DownstreamQueue);
        }
        Ok(machine.finish(from, effects))
    }

    /// in_progress → paused or pending, for a session that recorded nothing.
    pub fn cancel(&self, spool: &Spool, track: Track, occupancy: &Occupancy) -> Result<Transition> {
        let mut machine = self.held_machine(spool, track, occupancy)?;
        let to = if spool.progress(track).completed > 0 {
            TrackStatus::Paused
        } else {
            TrackStatus::Pending
        };
        let from = machine.move_to(to)?;
        machine.state.worker = None;
        Ok(machine.finish(from, vec![Effect::ReleaseLock]))
    }

    /// The holder abandoned the spool. Their in-progress track goes back to
    /// paused, or pending if nothing was ever recorded on it; sub-unit
    /// progress stays. `None` when the holder had no track in progress.
    pub fn reclaim(&self, spool: &Spool) -> Result<Option<Transition>> {
        let Some(holder) = &spool.holder else {
            return Ok(None);
        };
        let Some(track) = self.active_track(spool, holder) else {
            return Ok(None);
        };
        let mut machine = self.machine(spool, track);
        let to = if spool.progress(track).completed > 0 {
            TrackStatus::Paused
        } else {
            TrackStatus::Pending
        };
        let from = machine.move_to(to)?;
        machine.state.worker = None;
        Ok(Some(machine.finish(from, vec![])))
    }

    /// Inspection failed. Grants another rework cycle (back to pending, with
    /// the track's sub-unit progress wiped) unless the guard says the
    /// allowance is used up, in which case the track is blocked instead.
    pub fn reject_and_reopen(&self, spool: &Spool, track: Track) -> Result<Transition> {
        let mut machine = self.machine(spool, track);
        let granted = machine.state.cycle_count;
        let cycle = granted.saturating_add(1);

        if !matches!(
            machine.status(),
            TrackStatus::Completed | TrackStatus::Paused
        ) {
            return Err(Error::InvalidTransition {
                track,
                from: machine.status(),
                to: TrackStatus::Pending,
            });
        }

        if self.guard.is_exceeded(granted) {
            let from = machine.move_to(TrackStatus::Blocked)?;
            machine.state.cycle_count = cycle;
            machine.state.worker = None;
            return Ok(machine.finish(
                from,
                vec![Effect::BlockedEscalated {
                    cycle,
                    bound: self.guard.bound(),
                }],
            ));
        }

        let from = machine.move_to(TrackStatus::Pending)?;
        machine.state.cycle_count = cycle;
        machine.state.worker = None;
        Ok(machine.finish(
            from,
            vec![Effect::ResetSubUnitProgress, Effect::ReworkReopened { cycle }],
        ))
    }

    /// Supervisor override: blocked → pending with the cycle count reset.
    pub fn override_block(&self, spool: &Spool, track: Track) -> Result<Transition> {
        let mut machine = self.machine(spool, track);
        let from = machine.move_to(TrackStatus::Pending)?;
        if from != TrackStatus::Blocked {
            return Err(Error::InvalidTransition {
                track,
                from,
                to: TrackStatus::Pending,
            });
        }
        machine.state.cycle_count = self.guard.reset(machine.state.cycle_count);
        Ok(machine.finish(from, vec![Effect::ResetSubUnitProgress]))
    }

    /// The in-progress track the given worker is working on, if any.
    pub fn active_track(&self, spool: &Spool, worker: &WorkerId) -> Option<Track> {
        Track::ALL.into_iter().find(|t| {
            let state = spool.track_state(*t);
            state.status == TrackStatus::InProgress && state.worker.as_ref() == Some(worker)
        })
    }

    /// Machine for a track the occupancy's worker must be actively holding.
    fn held_machine(
        &self,
        spool: &Spool,
        track: Track,
        occupancy: &Occupancy,
    ) -> Result<TrackMachine> {
        let machine = self.machine(spool, track);
        let holds_spool = spool.holder.as_ref() == Some(&occupancy.worker);
        let works_track = machine.state.worker.as_ref() == Some(&occupancy.worker);

        if machine.status() == TrackStatus::InProgress && !(holds_spool && works_track) {
            return Err(Error::Ownership {
                resource_id: spool.id.clone(),
                worker: occupancy.worker.clone(),
                holder: spool.holder.clone(),
            });
        }
        Ok(machine)
    }
}
