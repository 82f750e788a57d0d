//! Occupation orchestrator: the Start / Stop use cases.
//!
//! Each request runs top to bottom: validate against a snapshot, take the
//! lock, drive the state machine inside a versioned write, release, then
//! emit events. Nothing below calls back up into the orchestrator.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use tracing::{Instrument, Span, debug, info, warn};
use uuid::Uuid;

use crate::config::OccupationPolicy;
use crate::conflict::{Committed, ConflictService};
use crate::engine::machine::{Effect, Occupancy, StateMachineEngine, Transition};
use crate::error::{Error, Result};
use crate::lock::{LockGrant, LockMode, LockService, LockToken};
use crate::model::event::{Event, EventKind};
use crate::model::spool::{
    HolderUpdate, Progress, Spool, SpoolId, SpoolPatch, SubUnitCompletion, SubUnitId, Version,
    WorkerId,
};
use crate::model::track::{Track, TrackState, TrackStatus};
use crate::store::{AuditLog, GLOBAL_CHANNEL, Publisher, RecordStore, spool_channel};
use crate::telemetry::metrics;
use crate::telemetry::occupation::{record_outcome, record_track_transition, start_occupation_span};

// ---------------------------------------------------------------------------
// Requests and outcomes
// ---------------------------------------------------------------------------

/// A stop-of-work request. Build with [`StopRequest::new`].
#[derive(Debug, Clone)]
pub struct StopRequest {
    pub resource_id: SpoolId,
    pub worker: WorkerId,
    /// Sub-units finished during this session. Empty means cancel.
    pub selection: Vec<SubUnitId>,
    /// Token returned by Start. When given, it must match the live lock.
    pub token: Option<LockToken>,
    /// Available count the caller's screen was built from.
    pub expected_available: Option<usize>,
}

impl StopRequest {
    pub fn new(
        resource_id: impl Into<SpoolId>,
        worker: impl Into<WorkerId>,
        selection: impl IntoIterator<Item = SubUnitId>,
    ) -> Self {
        Self {
            resource_id: resource_id.into(),
            worker: worker.into(),
            selection: selection.into_iter().collect(),
            token: None,
            expected_available: None,
        }
    }

    pub fn token(mut self, token: LockToken) -> Self {
        self.token = Some(token);
        self
    }

    pub fn expect_available(mut self, count: usize) -> Self {
        self.expected_available = Some(count);
        self
    }
}

#[derive(Debug, Clone)]
pub struct StartOutcome {
    pub resource_id: SpoolId,
    pub track: Track,
    pub grant: LockGrant,
    pub version: Version,
    pub status: String,
    /// Holder whose abandoned session this start took over.
    pub reclaimed_from: Option<WorkerId>,
}

/// What Stop decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopAction {
    Completed,
    Paused,
    Cancelled,
}

impl StopAction {
    pub fn as_str(self) -> &'static str {
        match self {
            StopAction::Completed => "completed",
            StopAction::Paused => "paused",
            StopAction::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StopOutcome {
    pub resource_id: SpoolId,
    pub track: Track,
    pub action: StopAction,
    pub recorded: Vec<SubUnitId>,
    pub version: Version,
    pub progress: Progress,
    pub status: String,
}

/// Result of an inspection reject or a supervisor override.
#[derive(Debug, Clone)]
pub struct InspectionOutcome {
    pub resource_id: SpoolId,
    pub track: Track,
    pub track_status: TrackStatus,
    pub cycle_count: u32,
    pub version: Version,
    pub status: String,
}

/// What the lock backend says about a spool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockView {
    Held(WorkerId),
    Free,
    /// The backend could not be reached.
    Unknown,
}

/// Read model for one spool.
#[derive(Debug, Clone)]
pub struct OccupationStatus {
    pub resource_id: SpoolId,
    pub holder: Option<WorkerId>,
    pub holder_since: Option<DateTime<Utc>>,
    pub lock: LockView,
    pub composite: String,
    pub tracks: BTreeMap<Track, TrackState>,
    pub progress: BTreeMap<Track, Progress>,
    pub version: Version,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct OccupationOrchestrator {
    store: Arc<dyn RecordStore>,
    locks: Arc<LockService>,
    conflicts: ConflictService,
    engine: StateMachineEngine,
    audit: Arc<dyn AuditLog>,
    publisher: Arc<dyn Publisher>,
    lock_mode: LockMode,
}

impl OccupationOrchestrator {
    pub fn new(
        store: Arc<dyn RecordStore>,
        locks: Arc<LockService>,
        audit: Arc<dyn AuditLog>,
        publisher: Arc<dyn Publisher>,
        policy: &OccupationPolicy,
    ) -> Self {
        Self {
            conflicts: ConflictService::new(
                Arc::clone(&store),
                policy.conflict.max_attempts,
                policy.backoff(),
            ),
            engine: StateMachineEngine::new(policy.rework_guard()),
            lock_mode: policy.lock_mode(),
            store,
            locks,
            audit,
            publisher,
        }
    }

    pub fn engine(&self) -> &StateMachineEngine {
        &self.engine
    }

    pub fn locks(&self) -> &LockService {
        &self.locks
    }

    // -----------------------------------------------------------------------
    // Start
    // -----------------------------------------------------------------------

    /// Occupy `resource_id` for `worker` and put `track` in progress.
    pub async fn start(
        &self,
        resource_id: &SpoolId,
        worker: &WorkerId,
        track: Track,
    ) -> Result<StartOutcome> {
        let correlation_id = Uuid::new_v4();
        let span = start_occupation_span("start", resource_id, worker, &correlation_id);
        let began = Instant::now();

        let result = self
            .start_inner(resource_id, worker, track, correlation_id, &span)
            .instrument(span.clone())
            .await;

        let label = result.as_ref().map(|_| "started");
        self.finish("start", &span, began, label);
        result
    }

    async fn start_inner(
        &self,
        resource_id: &SpoolId,
        worker: &WorkerId,
        track: Track,
        correlation_id: Uuid,
        span: &Span,
    ) -> Result<StartOutcome> {
        // Fail fast on business rules before touching the lock.
        let snapshot = self.store.read(resource_id).await?;
        let abandoned = self.abandoned_session(&snapshot).await?;
        match &abandoned {
            Some(_) => {
                let (released, _) = release_abandoned(&self.engine, &snapshot)?;
                self.check_start_prerequisites(&released, worker, track)?;
            }
            None => self.check_start_prerequisites(&snapshot, worker, track)?,
        }

        let grant = self.acquire(resource_id, worker).await?;
        let occupancy = Occupancy {
            worker: worker.clone(),
            grant: grant.clone(),
        };

        let engine = self.engine;
        let mut transition: Option<Transition> = None;
        let mut took_over = false;
        let mut reclaimed: Option<Transition> = None;
        let committed = self
            .conflicts
            .update(resource_id, |fresh| {
                // Take over only the session judged abandoned, never one
                // that started since.
                let takeover = abandoned.as_ref().is_some_and(|a| a.matches(fresh));
                let (base, released) = if takeover {
                    release_abandoned(&engine, fresh)?
                } else {
                    (fresh.clone(), None)
                };

                let t = engine.start(&base, track, &occupancy)?;
                let mut patch = SpoolPatch {
                    holder: Some(HolderUpdate::Set {
                        worker: worker.clone(),
                        since: Utc::now(),
                    }),
                    ..Default::default()
                };
                if let Some(r) = released.as_ref().filter(|r| r.track != track) {
                    patch.tracks.insert(r.track, r.state.clone());
                }
                patch.tracks.insert(track, t.state.clone());
                transition = Some(t);
                took_over = takeover;
                reclaimed = released;
                Ok(patch)
            })
            .await;

        let committed = match committed {
            Ok(c) => c,
            Err(e) => {
                self.release_quietly(resource_id, worker, &grant).await;
                return Err(e);
            }
        };
        let transition = transition.ok_or_else(|| Error::Other("start produced no transition".into()))?;

        let mut events = Vec::with_capacity(2);
        let reclaimed_from = match abandoned.filter(|_| took_over) {
            Some(abandoned) => {
                if let Some(r) = &reclaimed {
                    self.record_transition(span, r);
                }
                warn!(
                    %resource_id,
                    holder = %abandoned.holder,
                    reason = abandoned.reason,
                    %worker,
                    "abandoned session reclaimed"
                );
                metrics::abandoned_sessions().add(1, &[KeyValue::new("reason", abandoned.reason)]);
                events.push(self.event(
                    EventKind::SessionAbandoned {
                        holder: abandoned.holder.clone(),
                        held_since: abandoned.since,
                        reason: abandoned.reason.to_string(),
                    },
                    resource_id,
                    worker,
                    reclaimed.as_ref().map(|r| r.track),
                    correlation_id,
                ));
                Some(abandoned.holder)
            }
            None => None,
        };
        self.record_transition(span, &transition);

        info!(
            %resource_id,
            %worker,
            %track,
            degraded = grant.is_degraded(),
            "spool occupied"
        );

        events.push(self.event(
            EventKind::Started,
            resource_id,
            worker,
            Some(track),
            correlation_id,
        ));
        self.emit(events).await;

        Ok(StartOutcome {
            resource_id: resource_id.clone(),
            track,
            grant,
            version: committed.version,
            status: self.engine.composite(&committed.after),
            reclaimed_from,
        })
    }

    /// A record holder with no live lock behind it has abandoned the spool
    /// once it is past the staleness threshold or, in TTL mode, once the
    /// lock it took has expired. A holder with a live lock is never
    /// abandoned, and nothing is judged while the lock backend is down.
    async fn abandoned_session(&self, spool: &Spool) -> Result<Option<Abandoned>> {
        let Some(holder) = &spool.holder else {
            return Ok(None);
        };
        match self.locks.get_lock(&spool.id).await {
            Ok(Some(_)) => return Ok(None),
            Ok(None) => {}
            Err(Error::LockBackendUnavailable(reason)) => {
                debug!(resource_id = %spool.id, %reason, "lock backend unavailable, holder kept");
                return Ok(None);
            }
            Err(e) => return Err(e),
        }

        let now = Utc::now();
        let reason = if self.locks.is_stale(spool.holder_since, now) {
            "stale"
        } else if ttl_elapsed(self.lock_mode, spool.holder_since, now) {
            "lock_expired"
        } else {
            return Ok(None);
        };
        Ok(Some(Abandoned {
            holder: holder.clone(),
            since: spool.holder_since,
            reason,
        }))
    }

    fn check_start_prerequisites(&self, spool: &Spool, worker: &WorkerId, track: Track) -> Result<()> {
        if let Some(holder) = &spool.holder {
            return Err(Error::AlreadyOccupied {
                resource_id: spool.id.clone(),
                holder: Some(holder.clone()),
            });
        }

        // Dry run of the transition itself: blocked, completed, etc.
        self.engine.start(
            spool,
            track,
            &Occupancy {
                worker: worker.clone(),
                grant: LockGrant::Advisory,
            },
        )?;

        if spool.applicable(track).next().is_none() {
            return Err(Error::PrerequisiteNotMet {
                resource_id: spool.id.clone(),
                track,
                missing: format!("no sub-unit requires {track}"),
            });
        }

        if let Some(upstream) = track.upstream() {
            let gated: Vec<_> = spool
                .remaining(track)
                .filter(|s| s.applies_to(upstream))
                .collect();
            let any_ready = spool.available(track).next().is_some();
            if !gated.is_empty() && !any_ready {
                return Err(Error::PrerequisiteNotMet {
                    resource_id: spool.id.clone(),
                    track,
                    missing: format!("{upstream} must be completed on at least one sub-unit"),
                });
            }
        }

        if spool.available(track).next().is_none() {
            return Err(Error::PrerequisiteNotMet {
                resource_id: spool.id.clone(),
                track,
                missing: "no sub-units left to work".to_string(),
            });
        }
        Ok(())
    }

    /// Take the lock, or fall back to advisory exclusion if the backend is
    /// down.
    async fn acquire(&self, resource_id: &SpoolId, worker: &WorkerId) -> Result<LockGrant> {
        match self.locks.acquire(resource_id, worker, self.lock_mode).await {
            Ok(token) => Ok(LockGrant::Locked(token)),
            Err(Error::LockBackendUnavailable(reason)) => {
                warn!(
                    %resource_id,
                    %worker,
                    %reason,
                    "lock backend unavailable, falling back to record-store holder"
                );
                metrics::degraded_fallbacks().add(1, &[KeyValue::new("operation", "start")]);
                Ok(LockGrant::Advisory)
            }
            Err(e) => Err(e),
        }
    }

    // -----------------------------------------------------------------------
    // Stop
    // -----------------------------------------------------------------------

    /// End the worker's session. The selection decides the outcome: every
    /// remaining sub-unit completes the track, some pauses it, none cancels.
    pub async fn stop(&self, request: StopRequest) -> Result<StopOutcome> {
        let correlation_id = Uuid::new_v4();
        let span = start_occupation_span(
            "stop",
            &request.resource_id,
            &request.worker,
            &correlation_id,
        );
        let began = Instant::now();

        let result = self
            .stop_inner(&request, correlation_id, &span)
            .instrument(span.clone())
            .await;

        let label = result.as_ref().map(|o| o.action.as_str());
        self.finish("stop", &span, began, label);
        result
    }

    async fn stop_inner(
        &self,
        request: &StopRequest,
        correlation_id: Uuid,
        span: &Span,
    ) -> Result<StopOutcome> {
        let resource_id = &request.resource_id;
        let worker = &request.worker;

        let snapshot = self.store.read(resource_id).await?;
        let track = self.owned_track(&snapshot, worker)?;
        let grant = self.verify_lock(request).await?;
        validate_selection(&snapshot, track, &request.selection)?;

        let occupancy = Occupancy {
            worker: worker.clone(),
            grant: grant.clone(),
        };
        let engine = self.engine;
        let mut decision: Option<(Transition, StopAction)> = None;

        let committed = self
            .conflicts
            .update(resource_id, |fresh| {
                // Re-validate against the data the write is conditioned on.
                if self.owned_track(fresh, worker)? != track {
                    return Err(Error::Ownership {
                        resource_id: fresh.id.clone(),
                        worker: worker.clone(),
                        holder: fresh.holder.clone(),
                    });
                }
                if let Some(expected) = request.expected_available {
                    let actual = fresh.available(track).count();
                    if actual != expected {
                        return Err(Error::StaleSelection {
                            resource_id: fresh.id.clone(),
                            expected,
                            actual,
                        });
                    }
                }
                validate_selection(fresh, track, &request.selection)?;

                let mut patch = SpoolPatch {
                    holder: Some(HolderUpdate::Clear),
                    ..Default::default()
                };

                let (t, action) = if request.selection.is_empty() {
                    (engine.cancel(fresh, track, &occupancy)?, StopAction::Cancelled)
                } else {
                    let selected: BTreeSet<&SubUnitId> = request.selection.iter().collect();
                    let full = fresh.remaining(track).all(|s| selected.contains(&s.id));
                    let now = Utc::now();
                    patch.completions = request
                        .selection
                        .iter()
                        .map(|id| SubUnitCompletion {
                            sub_unit: id.clone(),
                            track,
                            worker: worker.clone(),
                            completed_at: now,
                        })
                        .collect();
                    if full {
                        (engine.complete(fresh, track, &occupancy)?, StopAction::Completed)
                    } else {
                        (engine.pause(fresh, track, &occupancy)?, StopAction::Paused)
                    }
                };

                patch.tracks.insert(track, t.state.clone());
                decision = Some((t, action));
                Ok(patch)
            })
            .await?;

        let (transition, action) =
            decision.ok_or_else(|| Error::Other("stop produced no transition".into()))?;
        self.record_transition(span, &transition);

        if transition.has(Effect::ReleaseLock) {
            self.release_quietly(resource_id, worker, &grant).await;
        }

        let after = &committed.after;
        let remaining = after.remaining(track).count();
        info!(
            %resource_id,
            %worker,
            %track,
            action = action.as_str(),
            recorded = request.selection.len(),
            remaining,
            "spool released"
        );

        let mut events = Vec::with_capacity(request.selection.len() + 2);
        let summary = match action {
            StopAction::Cancelled => EventKind::Cancelled,
            StopAction::Paused => EventKind::Paused {
                completed: request.selection.clone(),
                remaining,
            },
            StopAction::Completed => EventKind::Completed {
                completed: request.selection.clone(),
            },
        };
        events.push(self.event(summary, resource_id, worker, Some(track), correlation_id));
        for id in &request.selection {
            let size = after.sub_unit(id).map(|s| s.size).unwrap_or_default();
            events.push(self.event(
                EventKind::SubUnitCompleted {
                    sub_unit: id.clone(),
                    size,
                },
                resource_id,
                worker,
                Some(track),
                correlation_id,
            ));
        }
        if transition.has(Effect::DownstreamQueue) {
            events.push(self.event(
                EventKind::DownstreamQueueTriggered,
                resource_id,
                worker,
                None,
                correlation_id,
            ));
        }
        self.emit(events).await;

        Ok(StopOutcome {
            resource_id: resource_id.clone(),
            track,
            action,
            recorded: request.selection.clone(),
            version: committed.version,
            progress: after.progress(track),
            status: self.engine.composite(after),
        })
    }

    /// The track `worker` has in progress on a spool they hold.
    fn owned_track(&self, spool: &Spool, worker: &WorkerId) -> Result<Track> {
        if spool.holder.as_ref() != Some(worker) {
            return Err(Error::Ownership {
                resource_id: spool.id.clone(),
                worker: worker.clone(),
                holder: spool.holder.clone(),
            });
        }
        self.engine
            .active_track(spool, worker)
            .ok_or_else(|| Error::Ownership {
                resource_id: spool.id.clone(),
                worker: worker.clone(),
                holder: spool.holder.clone(),
            })
    }

    /// Check the live lock against the caller. A supplied token must match;
    /// a missing lock with a supplied token means the session is stale.
    async fn verify_lock(&self, request: &StopRequest) -> Result<LockGrant> {
        let resource_id = &request.resource_id;
        let worker = &request.worker;
        let ownership = |holder: Option<WorkerId>| Error::Ownership {
            resource_id: resource_id.clone(),
            worker: worker.clone(),
            holder,
        };

        match self.locks.get_owner(resource_id).await {
            Ok(Some((owner, token))) => {
                if &owner != worker {
                    return Err(ownership(Some(owner)));
                }
                if request.token.as_ref().is_some_and(|t| t != &token) {
                    return Err(ownership(Some(owner)));
                }
                Ok(LockGrant::Locked(token))
            }
            Ok(None) => {
                if request.token.is_some() {
                    return Err(ownership(None));
                }
                debug!(%resource_id, %worker, "no live lock, relying on record holder");
                Ok(LockGrant::Advisory)
            }
            Err(Error::LockBackendUnavailable(reason)) => {
                warn!(
                    %resource_id,
                    %worker,
                    %reason,
                    "lock backend unavailable, verifying ownership from record holder"
                );
                metrics::degraded_fallbacks().add(1, &[KeyValue::new("operation", "stop")]);
                Ok(LockGrant::Advisory)
            }
            Err(e) => Err(e),
        }
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    /// Inspection rejected the track's work: reopen it for rework, or block it
    /// once the rework allowance is used up.
    pub async fn reject(
        &self,
        resource_id: &SpoolId,
        track: Track,
        inspector: &WorkerId,
    ) -> Result<InspectionOutcome> {
        let correlation_id = Uuid::new_v4();
        let span = start_occupation_span("reject", resource_id, inspector, &correlation_id);
        let began = Instant::now();

        let result = async {
            let (transition, committed) = self
                .apply_inspection(resource_id, track, |engine, spool| {
                    engine.reject_and_reopen(spool, track)
                })
                .await?;
            self.record_transition(&span, &transition);

            let kind = transition.effects.iter().find_map(|effect| match *effect {
                Effect::ReworkReopened { cycle } => Some(EventKind::ReworkReopened { cycle }),
                Effect::BlockedEscalated { cycle, bound } => {
                    Some(EventKind::BlockedEscalated { cycle, bound })
                }
                _ => None,
            });
            if transition.to == TrackStatus::Blocked {
                warn!(
                    %resource_id,
                    %track,
                    cycles = transition.state.cycle_count,
                    "rework limit reached, track blocked"
                );
            }
            if let Some(kind) = kind {
                self.emit(vec![self.event(
                    kind,
                    resource_id,
                    inspector,
                    Some(track),
                    correlation_id,
                )])
                .await;
            }
            Ok::<_, Error>(self.inspection_outcome(resource_id, &transition, committed))
        }
        .instrument(span.clone())
        .await;

        let label = result.as_ref().map(|o| o.track_status.as_str());
        self.finish("reject", &span, began, label);
        result
    }

    /// Supervisor override: unblock a track and reset its rework count.
    pub async fn override_block(
        &self,
        resource_id: &SpoolId,
        track: Track,
        supervisor: &WorkerId,
    ) -> Result<InspectionOutcome> {
        let correlation_id = Uuid::new_v4();
        let span = start_occupation_span("override", resource_id, supervisor, &correlation_id);
        let began = Instant::now();

        let result = async {
            let (transition, committed) = self
                .apply_inspection(resource_id, track, |engine, spool| {
                    engine.override_block(spool, track)
                })
                .await?;
            self.record_transition(&span, &transition);
            info!(%resource_id, %track, %supervisor, "blocked track reset by supervisor");
            Ok::<_, Error>(self.inspection_outcome(resource_id, &transition, committed))
        }
        .instrument(span.clone())
        .await;

        let label = result.as_ref().map(|o| o.track_status.as_str());
        self.finish("override", &span, began, label);
        result
    }

    /// Versioned write of an inspection transition on a free spool.
    async fn apply_inspection<F>(
        &self,
        resource_id: &SpoolId,
        track: Track,
        decide: F,
    ) -> Result<(Transition, Committed)>
    where
        F: Fn(&StateMachineEngine, &Spool) -> Result<Transition> + Send + Sync,
    {
        let engine = self.engine;
        let mut transition: Option<Transition> = None;
        let committed = self
            .conflicts
            .update(resource_id, |fresh| {
                if let Some(holder) = &fresh.holder {
                    return Err(Error::AlreadyOccupied {
                        resource_id: fresh.id.clone(),
                        holder: Some(holder.clone()),
                    });
                }
                let t = decide(&engine, fresh)?;
                let mut patch = SpoolPatch::default();
                patch.tracks.insert(track, t.state.clone());
                if t.has(Effect::ResetSubUnitProgress) {
                    patch.reset_progress.insert(track);
                }
                transition = Some(t);
                Ok(patch)
            })
            .await?;
        let transition =
            transition.ok_or_else(|| Error::Other("inspection produced no transition".into()))?;
        Ok((transition, committed))
    }

    fn inspection_outcome(
        &self,
        resource_id: &SpoolId,
        transition: &Transition,
        committed: Committed,
    ) -> InspectionOutcome {
        InspectionOutcome {
            resource_id: resource_id.clone(),
            track: transition.track,
            track_status: transition.to,
            cycle_count: transition.state.cycle_count,
            status: self.engine.composite(&committed.after),
            version: committed.version,
        }
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Current holder, composite status and per-track progress.
    pub async fn status(&self, resource_id: &SpoolId) -> Result<OccupationStatus> {
        let spool = self.store.read(resource_id).await?;
        let lock = match self.locks.get_owner(resource_id).await {
            Ok(Some((owner, _))) => LockView::Held(owner),
            Ok(None) => LockView::Free,
            Err(Error::LockBackendUnavailable(reason)) => {
                warn!(%resource_id, %reason, "lock backend unavailable, lock owner unknown");
                LockView::Unknown
            }
            Err(e) => return Err(e),
        };

        if let LockView::Held(owner) = &lock {
            if spool.holder.as_ref() != Some(owner) {
                debug!(%resource_id, lock_owner = %owner, "lock owner and record holder disagree");
            }
        }

        let progress = Track::ALL
            .into_iter()
            .map(|t| (t, spool.progress(t)))
            .collect();
        let tracks = Track::ALL
            .into_iter()
            .map(|t| (t, spool.track_state(t)))
            .collect();

        Ok(OccupationStatus {
            resource_id: spool.id.clone(),
            holder: spool.holder.clone(),
            holder_since: spool.holder_since,
            lock,
            composite: self.engine.composite(&spool),
            tracks,
            progress,
            version: spool.version,
        })
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn release_quietly(&self, resource_id: &SpoolId, worker: &WorkerId, grant: &LockGrant) {
        let Some(token) = grant.token() else {
            return;
        };
        match self.locks.release(resource_id, worker, token).await {
            Ok(true) => {}
            Ok(false) => debug!(%resource_id, %worker, "lock already gone at release"),
            Err(e) => warn!(%resource_id, %worker, "lock release failed: {e}"),
        }
    }

    fn record_transition(&self, span: &Span, t: &Transition) {
        record_track_transition(span, t.track.as_str(), t.from.as_str(), t.to.as_str());
        metrics::track_transitions().add(
            1,
            &[
                KeyValue::new("track", t.track.as_str()),
                KeyValue::new("from", t.from.as_str()),
                KeyValue::new("to", t.to.as_str()),
            ],
        );
    }

    /// Build an event, dropping it with a warning if it fails validation.
    fn event(
        &self,
        kind: EventKind,
        resource_id: &SpoolId,
        worker: &WorkerId,
        track: Option<Track>,
        correlation_id: Uuid,
    ) -> Option<Event> {
        match Event::new(kind, resource_id, worker, track, correlation_id) {
            Ok(event) => Some(event),
            Err(e) => {
                warn!(%resource_id, "dropping invalid event: {e}");
                metrics::events_dropped().add(1, &[KeyValue::new("sink", "validation")]);
                None
            }
        }
    }

    /// Best effort: append to the audit log in one batch, then publish each
    /// event on the spool and global channels. Failures are logged only.
    async fn emit(&self, events: Vec<Option<Event>>) {
        let events: Vec<Event> = events.into_iter().flatten().collect();
        if events.is_empty() {
            return;
        }

        let appended = match events.as_slice() {
            [single] => self.audit.append(single).await,
            many => self.audit.append_batch(many).await,
        };
        if let Err(e) = appended {
            warn!(count = events.len(), "audit append failed: {e}");
            metrics::events_dropped().add(events.len() as u64, &[KeyValue::new("sink", "audit")]);
        }

        for event in &events {
            for channel in [spool_channel(&event.resource_id), GLOBAL_CHANNEL.to_string()] {
                if let Err(e) = self.publisher.publish(&channel, event).await {
                    warn!(%channel, event_type = event.event_type(), "publish failed: {e}");
                    metrics::events_dropped().add(1, &[KeyValue::new("sink", "publisher")]);
                }
            }
        }
    }

    fn finish(
        &self,
        operation: &'static str,
        span: &Span,
        began: Instant,
        result: std::result::Result<&str, &Error>,
    ) {
        let outcome = match result {
            Ok(label) => label.to_string(),
            Err(e) => error_label(e).to_string(),
        };
        record_outcome(span, &outcome);
        metrics::operation_duration_ms().record(
            began.elapsed().as_secs_f64() * 1000.0,
            &[
                KeyValue::new("operation", operation),
                KeyValue::new("outcome", outcome),
            ],
        );
    }
}

/// A holder whose session ended without a Stop.
#[derive(Debug, Clone)]
struct Abandoned {
    holder: WorkerId,
    since: Option<DateTime<Utc>>,
    reason: &'static str,
}

impl Abandoned {
    /// Whether `spool` still carries this exact session.
    fn matches(&self, spool: &Spool) -> bool {
        spool.holder.as_ref() == Some(&self.holder) && spool.holder_since == self.since
    }
}

/// `spool` with its holder cleared and the holder's in-progress track
/// reclaimed, plus that track's transition.
fn release_abandoned(
    engine: &StateMachineEngine,
    spool: &Spool,
) -> Result<(Spool, Option<Transition>)> {
    let reclaimed = engine.reclaim(spool)?;
    let mut released = spool.clone();
    released.holder = None;
    released.holder_since = None;
    if let Some(t) = &reclaimed {
        released.tracks.insert(t.track, t.state.clone());
    }
    Ok((released, reclaimed))
}

/// Whether a TTL lock taken at `since` would have expired by `now`.
fn ttl_elapsed(mode: LockMode, since: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    let LockMode::Ttl(ttl) = mode else {
        return false;
    };
    let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
    since.is_some_and(|since| now - since >= ttl)
}

/// Every selected id must exist, apply to the track, be available, and be
/// listed once.
fn validate_selection(spool: &Spool, track: Track, selection: &[SubUnitId]) -> Result<()> {
    let invalid = |id: &SubUnitId, reason: String| Error::InvalidSelection {
        resource_id: spool.id.clone(),
        sub_unit: id.clone(),
        reason,
    };

    let mut seen = BTreeSet::new();
    for id in selection {
        if !seen.insert(id) {
            return Err(invalid(id, "listed more than once".to_string()));
        }
        let unit = spool
            .sub_unit(id)
            .ok_or_else(|| invalid(id, "no such sub-unit".to_string()))?;
        if !unit.applies_to(track) {
            return Err(invalid(id, format!("{track} does not apply")));
        }
        if unit.is_completed(track) {
            return Err(invalid(id, format!("{track} already completed")));
        }
        if !unit.is_available(track) {
            let upstream = track.upstream().map(|t| t.as_str()).unwrap_or("upstream");
            return Err(invalid(id, format!("{upstream} not completed yet")));
        }
    }
    Ok(())
}

fn error_label(e: &Error) -> &'static str {
    match e {
        Error::AlreadyOccupied { .. } => "already_occupied",
        Error::Ownership { .. } => "ownership",
        Error::ConflictExhausted { .. } | Error::VersionConflict { .. } => "conflict",
        Error::StaleSelection { .. } => "stale_selection",
        Error::InvalidSelection { .. } => "invalid_selection",
        Error::PrerequisiteNotMet { .. } => "prerequisite",
        Error::CycleLimitExceeded { .. } => "cycle_limit",
        Error::InvalidTransition { .. } => "invalid_transition",
        Error::NotFound(_) => "not_found",
        _ => "error",
    }
}
