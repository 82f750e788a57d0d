//! Occupation span helpers.
//!
//! Provides span creation and transition recording for requests flowing
//! through the orchestrator.

use tracing::Span;
use uuid::Uuid;

use crate::model::spool::{SpoolId, WorkerId};

/// Start a span for one occupation request.
///
/// The `occupation.track` and `occupation.outcome` fields are declared empty
/// and filled in as the request progresses.
pub fn start_occupation_span(
    operation: &str,
    resource_id: &SpoolId,
    worker: &WorkerId,
    correlation_id: &Uuid,
) -> Span {
    tracing::info_span!(
        "occupation.request",
        "occupation.operation" = operation,
        "occupation.resource_id" = %resource_id,
        "occupation.worker" = %worker,
        "occupation.correlation_id" = %correlation_id,
        "occupation.track" = tracing::field::Empty,
        "occupation.outcome" = tracing::field::Empty,
    )
}

/// Record a track transition as an event scoped to the given span.
pub fn record_track_transition(span: &Span, track: &str, from: &str, to: &str) {
    span.record("occupation.track", track);
    span.in_scope(|| {
        tracing::info!(track, from, to, "track_transition");
    });
}

/// Record the final outcome label on the span.
pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("occupation.outcome", outcome);
}
