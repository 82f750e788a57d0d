//! Start / Stop scenarios against in-memory collaborators.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use spool_occupation::config::OccupationPolicy;
use spool_occupation::engine::{LockView, OccupationOrchestrator, StopAction, StopRequest};
use spool_occupation::error::Error;
use spool_occupation::lock::{LockService, MemoryLockBackend};
use spool_occupation::model::event::EventKind;
use spool_occupation::model::spool::{Spool, SpoolId, SubUnit, SubUnitId, WorkerId};
use spool_occupation::model::track::{Track, TrackState, TrackStatus};
use spool_occupation::store::{MemoryAuditLog, MemoryPublisher, MemoryRecordStore};

struct Harness {
    store: Arc<MemoryRecordStore>,
    backend: Arc<MemoryLockBackend>,
    audit: Arc<MemoryAuditLog>,
    publisher: Arc<MemoryPublisher>,
    orchestrator: Arc<OccupationOrchestrator>,
}

fn harness() -> Harness {
    harness_with("")
}

/// Harness with extra policy sections appended to the fast-retry defaults.
fn harness_with(extra: &str) -> Harness {
    let policy = OccupationPolicy::from_toml_str(&format!(
        r#"
        [conflict]
        max_attempts = 10
        base_delay_ms = 1
        max_delay_ms = 5
        {extra}
        "#
    ))
    .unwrap();

    let store = Arc::new(MemoryRecordStore::new());
    let backend = Arc::new(MemoryLockBackend::new());
    let audit = Arc::new(MemoryAuditLog::new());
    let publisher = Arc::new(MemoryPublisher::new());
    let locks = Arc::new(LockService::new(
        backend.clone(),
        store.clone(),
        policy.lock_settings(),
    ));
    let orchestrator = Arc::new(OccupationOrchestrator::new(
        store.clone(),
        locks,
        audit.clone(),
        publisher.clone(),
        &policy,
    ));

    Harness {
        store,
        backend,
        audit,
        publisher,
        orchestrator,
    }
}

/// R-1 with five joints J1..J5.
fn five_joint_spool() -> Spool {
    Spool::new(
        "R-1",
        vec![
            SubUnit::new("J1", 2.0),
            SubUnit::new("J2", 2.0),
            SubUnit::new("J3", 4.0),
            SubUnit::new("J4", 4.0),
            SubUnit::new("J5", 6.0),
        ],
    )
}

fn r1() -> SpoolId {
    SpoolId::new("R-1")
}

fn joints(ids: &[&str]) -> Vec<SubUnitId> {
    ids.iter().map(|id| SubUnitId::new(*id)).collect()
}

const ALL: [&str; 5] = ["J1", "J2", "J3", "J4", "J5"];

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_starts_admit_exactly_one_worker() {
    let h = harness();
    h.store.seed(five_joint_spool());

    let mut handles = Vec::new();
    for i in 0..10 {
        let orchestrator = h.orchestrator.clone();
        handles.push(tokio::spawn(async move {
            orchestrator
                .start(&r1(), &WorkerId::new(format!("w{i}")), Track::Assembly)
                .await
        }));
    }

    let mut winners = 0;
    let mut occupied = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => winners += 1,
            Err(Error::AlreadyOccupied { .. }) => occupied += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(occupied, 9);

    let spool = h.store.get(&r1()).unwrap();
    assert!(spool.holder.is_some());
    assert_eq!(h.audit.of_type("started").len(), 1);
    assert_eq!(h.backend.len(), 1);
}

#[tokio::test]
async fn partial_selection_pauses_in_one_write() {
    let h = harness();
    h.store.seed(five_joint_spool());
    let w1 = WorkerId::new("w1");

    let started = h.orchestrator.start(&r1(), &w1, Track::Assembly).await.unwrap();
    let token = started.grant.token().cloned().unwrap();
    assert!(started.status.starts_with("Occupied by w1"));

    let outcome = h
        .orchestrator
        .stop(StopRequest::new(r1(), w1.clone(), joints(&["J1", "J2", "J3"])).token(token))
        .await
        .unwrap();

    assert_eq!(outcome.action, StopAction::Paused);
    assert_eq!(outcome.progress.completed, 3);
    assert_eq!(outcome.progress.total, 5);
    assert!(h.backend.is_empty(), "lock released after pause");

    // One write for start, one batched write for the stop.
    assert_eq!(h.store.accepted_writes(), 2);
    assert_eq!(h.store.batch_writes(), 1);
    assert_eq!(h.store.sub_unit_writes(), 3);

    assert_eq!(h.audit.of_type("paused").len(), 1);
    assert_eq!(h.audit.of_type("sub_unit_completed").len(), 3);

    let spool = h.store.get(&r1()).unwrap();
    assert_eq!(spool.holder, None);
    assert_eq!(spool.track_state(Track::Assembly).status, TrackStatus::Paused);
    assert_eq!(spool.remaining(Track::Assembly).count(), 2);
}

#[tokio::test]
async fn remaining_selection_completes_track() {
    let h = harness();
    h.store.seed(five_joint_spool());
    let (w1, w2) = (WorkerId::new("w1"), WorkerId::new("w2"));

    h.orchestrator.start(&r1(), &w1, Track::Assembly).await.unwrap();
    h.orchestrator
        .stop(StopRequest::new(r1(), w1, joints(&["J1", "J2", "J3"])))
        .await
        .unwrap();

    h.orchestrator.start(&r1(), &w2, Track::Assembly).await.unwrap();
    let outcome = h
        .orchestrator
        .stop(StopRequest::new(r1(), w2.clone(), joints(&["J4", "J5"])).expect_available(2))
        .await
        .unwrap();

    assert_eq!(outcome.action, StopAction::Completed);
    assert_eq!(outcome.progress.completed, 5);
    assert!((outcome.progress.percent() - 100.0).abs() < f64::EPSILON);
    assert_eq!(h.audit.of_type("completed").len(), 1);
    // Welding is still pending, so nothing goes downstream yet.
    assert!(h.audit.of_type("downstream_queue_triggered").is_empty());

    let spool = h.store.get(&r1()).unwrap();
    let assembly = spool.track_state(Track::Assembly);
    assert_eq!(assembly.status, TrackStatus::Completed);
    assert_eq!(assembly.history, vec![WorkerId::new("w1"), w2]);
}

#[tokio::test]
async fn second_worker_finishing_only_track_triggers_downstream() {
    let h = harness();
    // Field joints: assembly is the only track that applies.
    h.store.seed(Spool::new(
        "R-1",
        ALL.iter()
            .map(|id| SubUnit::new(*id, 3.0).with_tracks([Track::Assembly]))
            .collect(),
    ));
    let (a, b) = (WorkerId::new("A"), WorkerId::new("B"));

    h.orchestrator.start(&r1(), &a, Track::Assembly).await.unwrap();
    let paused = h
        .orchestrator
        .stop(StopRequest::new(r1(), a, joints(&["J1", "J2", "J3"])))
        .await
        .unwrap();
    assert_eq!(paused.action, StopAction::Paused);
    assert!(h.backend.is_empty());

    h.orchestrator.start(&r1(), &b, Track::Assembly).await.unwrap();
    let completed = h
        .orchestrator
        .stop(StopRequest::new(r1(), b, joints(&["J4", "J5"])))
        .await
        .unwrap();
    assert_eq!(completed.action, StopAction::Completed);
    assert_eq!(h.audit.of_type("downstream_queue_triggered").len(), 1);
}

#[tokio::test]
async fn completing_last_track_triggers_downstream() {
    let h = harness();
    h.store.seed(five_joint_spool());
    let (fitter, welder) = (WorkerId::new("fitter"), WorkerId::new("welder"));

    h.orchestrator.start(&r1(), &fitter, Track::Assembly).await.unwrap();
    h.orchestrator
        .stop(StopRequest::new(r1(), fitter, joints(&ALL)))
        .await
        .unwrap();

    h.orchestrator.start(&r1(), &welder, Track::Welding).await.unwrap();
    let outcome = h
        .orchestrator
        .stop(StopRequest::new(r1(), welder, joints(&ALL)))
        .await
        .unwrap();

    assert_eq!(outcome.action, StopAction::Completed);
    assert!(outcome.status.starts_with("Complete"));
    assert_eq!(h.audit.of_type("downstream_queue_triggered").len(), 1);

    let downstream = &h.audit.of_type("downstream_queue_triggered")[0];
    assert_eq!(downstream.track, None);
    let related: Vec<_> = h
        .audit
        .events()
        .into_iter()
        .filter(|e| e.correlation_id == downstream.correlation_id)
        .collect();
    // completed + 5 sub-units + downstream, all from one request.
    assert_eq!(related.len(), 7);
}

#[tokio::test]
async fn empty_selection_cancels_without_writes() {
    let h = harness();
    h.store.seed(five_joint_spool());
    let w1 = WorkerId::new("w1");

    h.orchestrator.start(&r1(), &w1, Track::Assembly).await.unwrap();
    let outcome = h
        .orchestrator
        .stop(StopRequest::new(r1(), w1, Vec::new()))
        .await
        .unwrap();

    assert_eq!(outcome.action, StopAction::Cancelled);
    assert_eq!(h.store.sub_unit_writes(), 0);
    assert_eq!(h.store.batch_writes(), 0);
    assert_eq!(h.audit.of_type("cancelled").len(), 1);
    assert_eq!(h.audit.events().len(), 2, "started + cancelled only");
    assert!(h.backend.is_empty());

    let spool = h.store.get(&r1()).unwrap();
    assert_eq!(spool.holder, None);
    assert_eq!(spool.track_state(Track::Assembly).status, TrackStatus::Pending);
}

#[tokio::test]
async fn cancel_after_partial_progress_returns_to_paused() {
    let h = harness();
    h.store.seed(five_joint_spool());
    let w1 = WorkerId::new("w1");

    h.orchestrator.start(&r1(), &w1, Track::Assembly).await.unwrap();
    h.orchestrator
        .stop(StopRequest::new(r1(), w1.clone(), joints(&["J1"])))
        .await
        .unwrap();
    h.orchestrator.start(&r1(), &w1, Track::Assembly).await.unwrap();
    h.orchestrator
        .stop(StopRequest::new(r1(), w1, Vec::new()))
        .await
        .unwrap();

    let spool = h.store.get(&r1()).unwrap();
    assert_eq!(spool.track_state(Track::Assembly).status, TrackStatus::Paused);
}

#[tokio::test]
async fn start_degrades_when_lock_backend_is_down() {
    let h = harness();
    h.store.seed(five_joint_spool());
    h.backend.set_offline(true);

    let (w1, w2) = (WorkerId::new("w1"), WorkerId::new("w2"));
    let outcome = h.orchestrator.start(&r1(), &w1, Track::Assembly).await.unwrap();
    assert!(outcome.grant.is_degraded());
    assert_eq!(h.store.get(&r1()).unwrap().holder, Some(w1.clone()));

    // The holder field alone still excludes others.
    let err = h
        .orchestrator
        .start(&r1(), &w2, Track::Assembly)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyOccupied { .. }));

    let stopped = h
        .orchestrator
        .stop(StopRequest::new(r1(), w1, joints(&["J1"])))
        .await
        .unwrap();
    assert_eq!(stopped.action, StopAction::Paused);
}

/// R-1 held by "gone" since `held_for` ago, with assembly in progress and
/// J1 already recorded.
fn abandoned_spool(held_for: chrono::Duration) -> Spool {
    let gone = WorkerId::new("gone");
    let mut spool = five_joint_spool();
    spool.sub_units[0] = SubUnit::new("J1", 2.0).completed(Track::Assembly, "gone");
    spool.holder = Some(gone.clone());
    spool.holder_since = Some(Utc::now() - held_for);
    spool.tracks.insert(
        Track::Assembly,
        TrackState {
            status: TrackStatus::InProgress,
            worker: Some(gone.clone()),
            history: vec![gone],
            cycle_count: 0,
        },
    );
    spool
}

#[tokio::test]
async fn stale_holder_is_reclaimed_by_next_start() {
    let h = harness();
    h.store.seed(abandoned_spool(chrono::Duration::hours(30)));

    let report = h.orchestrator.locks().reconcile_from_source_of_truth().await.unwrap();
    assert_eq!(report.skipped_stale, 1);
    assert!(h.backend.is_empty());

    let w2 = WorkerId::new("w2");
    let started = h.orchestrator.start(&r1(), &w2, Track::Assembly).await.unwrap();
    assert_eq!(started.reclaimed_from, Some(WorkerId::new("gone")));
    assert!(started.grant.token().is_some());

    let spool = h.store.get(&r1()).unwrap();
    assert_eq!(spool.holder, Some(w2.clone()));
    let assembly = spool.track_state(Track::Assembly);
    assert_eq!(assembly.status, TrackStatus::InProgress);
    assert_eq!(assembly.worker, Some(w2.clone()));
    assert_eq!(assembly.history, vec![WorkerId::new("gone"), w2.clone()]);
    // Work recorded before the session was abandoned is kept.
    assert_eq!(spool.progress(Track::Assembly).completed, 1);

    let abandoned = h.audit.of_type("session_abandoned");
    assert_eq!(abandoned.len(), 1);
    assert_eq!(abandoned[0].track, Some(Track::Assembly));
    assert!(matches!(
        &abandoned[0].kind,
        EventKind::SessionAbandoned { holder, reason, .. }
            if holder.as_str() == "gone" && reason == "stale"
    ));
    let started_event = &h.audit.of_type("started")[0];
    assert_eq!(started_event.correlation_id, abandoned[0].correlation_id);

    // The abandoned worker can no longer stop the session.
    let err = h
        .orchestrator
        .stop(StopRequest::new(r1(), "gone", joints(&["J2"])))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Ownership { .. }));

    let outcome = h
        .orchestrator
        .stop(StopRequest::new(r1(), w2, joints(&["J2", "J3", "J4", "J5"])))
        .await
        .unwrap();
    assert_eq!(outcome.action, StopAction::Completed);
}

#[tokio::test]
async fn recent_holder_without_lock_is_not_reclaimed() {
    let h = harness();
    h.store.seed(abandoned_spool(chrono::Duration::minutes(5)));

    let err = h
        .orchestrator
        .start(&r1(), &WorkerId::new("w2"), Track::Assembly)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyOccupied { holder: Some(_), .. }));
    assert!(h.audit.of_type("session_abandoned").is_empty());
}

#[tokio::test]
async fn stale_holder_is_kept_while_lock_backend_is_down() {
    let h = harness();
    h.store.seed(abandoned_spool(chrono::Duration::hours(30)));
    h.backend.set_offline(true);

    let err = h
        .orchestrator
        .start(&r1(), &WorkerId::new("w2"), Track::Assembly)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyOccupied { .. }));
    assert_eq!(h.store.get(&r1()).unwrap().holder, Some(WorkerId::new("gone")));
}

#[tokio::test]
async fn expired_ttl_session_frees_the_spool() {
    let h = harness_with("[lock]\nmode = \"ttl\"\nttl_secs = 1");
    h.store.seed(five_joint_spool());
    let (w1, w2) = (WorkerId::new("w1"), WorkerId::new("w2"));

    h.orchestrator.start(&r1(), &w1, Track::Assembly).await.unwrap();
    let err = h
        .orchestrator
        .start(&r1(), &w2, Track::Welding)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyOccupied { .. }));

    tokio::time::sleep(Duration::from_millis(1_200)).await;
    assert!(h.backend.is_empty(), "ttl lock expired");

    let started = h.orchestrator.start(&r1(), &w2, Track::Assembly).await.unwrap();
    assert_eq!(started.reclaimed_from, Some(w1.clone()));

    let spool = h.store.get(&r1()).unwrap();
    assert_eq!(spool.holder, Some(w2));
    assert_eq!(h.audit.of_type("session_abandoned").len(), 1);
    assert!(matches!(
        &h.audit.of_type("session_abandoned")[0].kind,
        EventKind::SessionAbandoned { reason, .. } if reason == "lock_expired"
    ));

    let err = h
        .orchestrator
        .stop(StopRequest::new(r1(), w1, joints(&["J1"])))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Ownership { .. }));
}

#[tokio::test]
async fn stale_token_is_rejected() {
    let h = harness();
    h.store.seed(five_joint_spool());
    let w1 = WorkerId::new("w1");

    let first = h.orchestrator.start(&r1(), &w1, Track::Assembly).await.unwrap();
    let old_token = first.grant.token().cloned().unwrap();
    h.orchestrator
        .stop(StopRequest::new(r1(), w1.clone(), joints(&["J1"])))
        .await
        .unwrap();

    h.orchestrator.start(&r1(), &w1, Track::Assembly).await.unwrap();
    let err = h
        .orchestrator
        .stop(StopRequest::new(r1(), w1, joints(&["J2"])).token(old_token))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Ownership { .. }));
    assert_eq!(h.store.sub_unit_writes(), 1);
}

#[tokio::test]
async fn stop_by_non_holder_is_rejected() {
    let h = harness();
    h.store.seed(five_joint_spool());

    h.orchestrator
        .start(&r1(), &WorkerId::new("w1"), Track::Assembly)
        .await
        .unwrap();
    let err = h
        .orchestrator
        .stop(StopRequest::new(r1(), "w2", joints(&["J1"])))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Ownership { holder: Some(_), .. }));
}

#[tokio::test]
async fn stale_available_count_is_rejected() {
    let h = harness();
    h.store.seed(five_joint_spool());
    let w1 = WorkerId::new("w1");

    h.orchestrator.start(&r1(), &w1, Track::Assembly).await.unwrap();
    let err = h
        .orchestrator
        .stop(StopRequest::new(r1(), w1, joints(&["J1"])).expect_available(4))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::StaleSelection {
            expected: 4,
            actual: 5,
            ..
        }
    ));
    assert_eq!(h.store.sub_unit_writes(), 0);
}

#[tokio::test]
async fn invalid_selection_is_rejected() {
    let h = harness();
    h.store.seed(five_joint_spool());
    let w1 = WorkerId::new("w1");

    h.orchestrator.start(&r1(), &w1, Track::Assembly).await.unwrap();

    let err = h
        .orchestrator
        .stop(StopRequest::new(r1(), w1.clone(), joints(&["J9"])))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidSelection { .. }));

    let err = h
        .orchestrator
        .stop(StopRequest::new(r1(), w1, joints(&["J1", "J1"])))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidSelection { .. }));
}

#[tokio::test]
async fn welding_requires_assembled_joints() {
    let h = harness();
    h.store.seed(five_joint_spool());

    let err = h
        .orchestrator
        .start(&r1(), &WorkerId::new("welder"), Track::Welding)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::PrerequisiteNotMet {
            track: Track::Welding,
            ..
        }
    ));
    assert!(h.backend.is_empty(), "no lock taken on prerequisite failure");
    assert!(h.audit.events().is_empty());
}

#[tokio::test]
async fn welding_only_records_assembled_joints() {
    let h = harness();
    h.store.seed(five_joint_spool());
    let (fitter, welder) = (WorkerId::new("fitter"), WorkerId::new("welder"));

    h.orchestrator.start(&r1(), &fitter, Track::Assembly).await.unwrap();
    h.orchestrator
        .stop(StopRequest::new(r1(), fitter, joints(&["J1", "J2"])))
        .await
        .unwrap();

    h.orchestrator.start(&r1(), &welder, Track::Welding).await.unwrap();
    let err = h
        .orchestrator
        .stop(StopRequest::new(r1(), welder.clone(), joints(&["J3"])))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidSelection { .. }));

    let outcome = h
        .orchestrator
        .stop(StopRequest::new(r1(), welder, joints(&["J1", "J2"])))
        .await
        .unwrap();
    // J3..J5 still need welding once assembled.
    assert_eq!(outcome.action, StopAction::Paused);
}

async fn complete_assembly(h: &Harness, worker: &str) {
    let worker = WorkerId::new(worker);
    h.orchestrator
        .start(&r1(), &worker, Track::Assembly)
        .await
        .unwrap();
    h.orchestrator
        .stop(StopRequest::new(r1(), worker, joints(&ALL)))
        .await
        .unwrap();
}

#[tokio::test]
async fn fourth_rejection_blocks_track() {
    let h = harness();
    h.store.seed(five_joint_spool());
    let inspector = WorkerId::new("qc");

    for cycle in 1..=3 {
        complete_assembly(&h, "fitter").await;
        let outcome = h
            .orchestrator
            .reject(&r1(), Track::Assembly, &inspector)
            .await
            .unwrap();
        assert_eq!(outcome.track_status, TrackStatus::Pending);
        assert_eq!(outcome.cycle_count, cycle);
        let spool = h.store.get(&r1()).unwrap();
        assert_eq!(spool.progress(Track::Assembly).completed, 0, "rework wipes progress");
    }

    complete_assembly(&h, "fitter").await;
    let outcome = h
        .orchestrator
        .reject(&r1(), Track::Assembly, &inspector)
        .await
        .unwrap();
    assert_eq!(outcome.track_status, TrackStatus::Blocked);
    assert!(outcome.status.starts_with("Blocked"));
    assert_eq!(h.audit.of_type("rework_reopened").len(), 3);
    assert_eq!(h.audit.of_type("blocked_escalated").len(), 1);

    let err = h
        .orchestrator
        .start(&r1(), &WorkerId::new("fitter"), Track::Assembly)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CycleLimitExceeded { .. }));

    let unblocked = h
        .orchestrator
        .override_block(&r1(), Track::Assembly, &WorkerId::new("supervisor"))
        .await
        .unwrap();
    assert_eq!(unblocked.track_status, TrackStatus::Pending);
    assert_eq!(unblocked.cycle_count, 0);
    h.orchestrator
        .start(&r1(), &WorkerId::new("fitter"), Track::Assembly)
        .await
        .unwrap();
}

#[tokio::test]
async fn reject_refused_while_occupied() {
    let h = harness();
    h.store.seed(five_joint_spool());
    complete_assembly(&h, "fitter").await;

    h.orchestrator
        .start(&r1(), &WorkerId::new("fitter"), Track::Welding)
        .await
        .unwrap();
    let err = h
        .orchestrator
        .reject(&r1(), Track::Assembly, &WorkerId::new("qc"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyOccupied { .. }));
}

#[tokio::test]
async fn sink_failures_do_not_fail_operations() {
    let h = harness();
    h.store.seed(five_joint_spool());
    h.audit.set_failing(true);
    h.publisher.set_failing(true);
    let w1 = WorkerId::new("w1");

    h.orchestrator.start(&r1(), &w1, Track::Assembly).await.unwrap();
    let outcome = h
        .orchestrator
        .stop(StopRequest::new(r1(), w1, joints(&["J1", "J2"])))
        .await
        .unwrap();

    assert_eq!(outcome.action, StopAction::Paused);
    assert!(h.audit.events().is_empty());
    assert!(h.publisher.published().is_empty());
    assert_eq!(h.store.sub_unit_writes(), 2);
}

#[tokio::test]
async fn events_fan_out_to_spool_and_global_channels() {
    let h = harness();
    h.store.seed(five_joint_spool());

    h.orchestrator
        .start(&r1(), &WorkerId::new("w1"), Track::Assembly)
        .await
        .unwrap();

    assert_eq!(h.publisher.on_channel("spool:R-1").len(), 1);
    assert_eq!(h.publisher.on_channel("occupation").len(), 1);
}

#[tokio::test]
async fn status_reports_holder_and_progress() {
    let h = harness();
    h.store.seed(five_joint_spool());
    let w1 = WorkerId::new("w1");

    h.orchestrator.start(&r1(), &w1, Track::Assembly).await.unwrap();
    let status = h.orchestrator.status(&r1()).await.unwrap();

    assert_eq!(status.holder, Some(w1.clone()));
    assert_eq!(status.lock, LockView::Held(w1.clone()));
    assert_eq!(
        status.composite,
        "Occupied by w1 | assembly in progress | welding pending"
    );
    assert_eq!(status.progress[&Track::Assembly].total, 5);

    h.orchestrator
        .stop(StopRequest::new(r1(), w1, Vec::new()))
        .await
        .unwrap();
    let status = h.orchestrator.status(&r1()).await.unwrap();
    assert_eq!(status.lock, LockView::Free);

    h.backend.set_offline(true);
    let status = h.orchestrator.status(&r1()).await.unwrap();
    assert_eq!(status.lock, LockView::Unknown);
}

#[tokio::test]
async fn status_of_single_track_spool_reads_complete() {
    let h = harness();
    h.store.seed(Spool::new(
        "R-1",
        ALL.iter()
            .map(|id| SubUnit::new(*id, 1.0).with_tracks([Track::Assembly]))
            .collect(),
    ));
    complete_assembly(&h, "fitter").await;

    let status = h.orchestrator.status(&r1()).await.unwrap();
    assert_eq!(status.composite, "Complete | assembly done | welding n/a");
    assert_eq!(h.audit.of_type("downstream_queue_triggered").len(), 1);
}

#[tokio::test]
async fn unknown_spool_is_not_found() {
    let h = harness();
    let err = h
        .orchestrator
        .start(&SpoolId::new("nope"), &WorkerId::new("w1"), Track::Assembly)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}
