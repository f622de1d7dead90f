//! Span helpers for event dispatch and build lifecycle.

use tracing::Span;
use uuid::Uuid;

use crate::model::{ArtifactBuild, BuildState};

/// Start a span covering the dispatch of one inbound event.
///
/// `correlation_id` ties together the logs of one delivery attempt; the
/// `event.handlers` field is filled in once routing is known.
pub fn start_event_span(kind: &str, message_id: &str, correlation_id: &Uuid) -> Span {
    tracing::info_span!(
        "event.dispatch",
        "event.kind" = kind,
        "event.message_id" = message_id,
        "event.correlation_id" = %correlation_id,
        "event.handlers" = tracing::field::Empty,
    )
}

/// Record a build state change as an event inside `span`.
pub fn record_build_transition(span: &Span, build: &ArtifactBuild, to: BuildState) {
    span.in_scope(|| {
        tracing::info!(
            build = %build.id,
            name = %build.name,
            from = %build.state,
            to = %to,
            "build_transition"
        );
    });
}
