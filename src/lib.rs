//! # spool-occupation
//!
//! Exclusive occupation of shop-floor spools by workers, with per-track
//! progress (assembly, welding), rework limits, and an audit trail.
//!
//! Locks and records live in Postgres; in-memory collaborators back the
//! tests. OpenTelemetry observability throughout.

pub mod config;
pub mod conflict;
pub mod db;
pub mod engine;
pub mod error;
pub mod lock;
pub mod model;
pub mod store;
pub mod telemetry;
