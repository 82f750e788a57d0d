//! Core data model.
//!
//! A spool is a physical work unit on the shop floor. It is occupied by at
//! most one worker at a time, carries an opaque version token for optimistic
//! writes, and progresses independently along each operation track.

pub mod event;
pub mod spool;
pub mod track;
