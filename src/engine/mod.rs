//! Occupation engine: per-track state machines, the rework guard, and the
//! orchestrator that drives Start / Stop through locks and versioned writes.

pub mod machine;
pub mod orchestrator;
pub mod rework;
pub mod status;

pub use machine::{Effect, Occupancy, StateMachineEngine, TrackMachine, Transition};
pub use orchestrator::{
    InspectionOutcome, LockView, OccupationOrchestrator, OccupationStatus, StartOutcome, StopAction,
    StopOutcome, StopRequest,
};
pub use rework::ReworkCycleGuard;
pub use status::composite_status;
