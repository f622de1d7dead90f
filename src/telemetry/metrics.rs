//! Metric instrument factories.
//!
//! Instruments come from the `"freshet"` meter of the globally registered
//! `MeterProvider`; without an OTLP endpoint they are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("freshet")
}

/// Counter: inbound events run through a handler.
/// Labels: `event`, `handler`, `result` ("ok" | "error").
pub fn events_handled() -> Counter<u64> {
    meter()
        .u64_counter("freshet.events.handled")
        .with_description("Inbound events processed by a handler")
        .build()
}

/// Counter: inbound events no handler accepted.
/// Labels: `event`.
pub fn events_unhandled() -> Counter<u64> {
    meter()
        .u64_counter("freshet.events.unhandled")
        .with_description("Inbound events with no matching handler")
        .build()
}

/// Counter: artifact build rows created.
/// Labels: `artifact_type`, `state` ("planned" | "failed" | "build").
pub fn builds_created() -> Counter<u64> {
    meter()
        .u64_counter("freshet.builds.created")
        .with_description("Artifact builds recorded")
        .build()
}

/// Counter: artifact build state transitions.
/// Labels: `from`, `to`.
pub fn build_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("freshet.builds.state_transitions")
        .with_description("Artifact build state transitions")
        .build()
}

/// Counter: candidates or events turned away by allow/block rules.
/// Labels: `handler`, `artifact_type`, `reason`.
pub fn rules_rejections() -> Counter<u64> {
    meter()
        .u64_counter("freshet.rules.rejections")
        .with_description("Rebuilds rejected by allow/block rules")
        .build()
}

/// Counter: composes that failed or expired, stalling their events' builds.
/// Labels: `state`.
pub fn composes_unusable() -> Counter<u64> {
    meter()
        .u64_counter("freshet.composes.unusable")
        .with_description("Composes that failed or expired before builds started")
        .build()
}

/// Counter: retries of collaborator calls.
/// Labels: `op`.
pub fn retry_attempts() -> Counter<u64> {
    meter()
        .u64_counter("freshet.retry.attempts")
        .with_description("Retried collaborator calls")
        .build()
}

/// Counter: ingress queue operations (create, send, read, archive).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("freshet.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Histogram: dispatch duration in milliseconds.
/// Labels: `event`.
pub fn dispatch_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("freshet.dispatch.duration_ms")
        .with_description("Time spent dispatching one inbound event")
        .with_unit("ms")
        .build()
}
