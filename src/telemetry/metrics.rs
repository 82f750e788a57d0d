//! Metric instrument factories for spool-occupation.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"spool-occupation"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("spool-occupation")
}

/// Counter: lock backend operations.
/// Labels: `operation` ("acquire" | "release" | "extend" | "cleanup"),
/// `result` ("ok" | "miss" | "occupied" | "error").
pub fn lock_operations() -> Counter<u64> {
    meter()
        .u64_counter("occupation.lock.operations")
        .with_description("Number of lock backend operations")
        .build()
}

/// Counter: conditional writes rejected on a stale version.
/// Labels: `exhausted`.
pub fn version_conflicts() -> Counter<u64> {
    meter()
        .u64_counter("occupation.version.conflicts")
        .with_description("Conditional writes rejected on version mismatch")
        .build()
}

/// Counter: track state transitions.
/// Labels: `track`, `from`, `to`.
pub fn track_transitions() -> Counter<u64> {
    meter()
        .u64_counter("occupation.track.transitions")
        .with_description("Number of track state transitions")
        .build()
}

/// Counter: requests served with advisory exclusion because the lock
/// backend was down.
/// Labels: `operation`.
pub fn degraded_fallbacks() -> Counter<u64> {
    meter()
        .u64_counter("occupation.degraded.fallbacks")
        .with_description("Operations that fell back to record-store exclusion")
        .build()
}

/// Counter: spools reclaimed from a holder whose session was abandoned.
/// Labels: `reason` ("stale" | "lock_expired").
pub fn abandoned_sessions() -> Counter<u64> {
    meter()
        .u64_counter("occupation.sessions.abandoned")
        .with_description("Spools taken over from abandoned sessions")
        .build()
}

/// Counter: events that could not be delivered to a sink.
/// Labels: `sink` ("audit" | "publisher").
pub fn events_dropped() -> Counter<u64> {
    meter()
        .u64_counter("occupation.events.dropped")
        .with_description("Events lost to audit or publisher failures")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`, `outcome`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("occupation.operation.duration_ms")
        .with_description("Occupation operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
