//! Routes inbound events to handlers.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use opentelemetry::KeyValue;
use tracing::{Instrument, debug, error, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::event::InboundEvent;
use crate::handler::Handler;
use crate::telemetry::metrics;
use crate::telemetry::spans::start_event_span;

/// Upper bound on events processed for one root event, so a handler bug
/// that keeps emitting follow-ups cannot spin forever.
const MAX_CHAIN_LEN: usize = 10_000;

pub struct Dispatcher {
    handlers: Vec<Arc<dyn Handler>>,
}

impl Dispatcher {
    pub fn new(handlers: Vec<Arc<dyn Handler>>) -> Self {
        Self { handlers }
    }

    pub fn handlers(&self) -> impl Iterator<Item = &dyn Handler> {
        self.handlers.iter().map(|h| h.as_ref())
    }

    /// Run every handler accepting `event` and collect their follow-ups.
    ///
    /// A failing handler does not stop the others; the first error is
    /// returned once all of them ran, and the follow-ups are dropped with it.
    pub async fn dispatch(&self, event: &InboundEvent) -> Result<Vec<InboundEvent>> {
        let span = start_event_span(event.kind(), event.message_id(), &Uuid::new_v4());
        let started = Instant::now();

        let result = async {
            let accepting: Vec<&Arc<dyn Handler>> =
                self.handlers.iter().filter(|h| h.can_handle(event)).collect();
            let names: Vec<&str> = accepting.iter().map(|h| h.name()).collect();
            tracing::Span::current().record("event.handlers", names.join(",").as_str());

            if accepting.is_empty() {
                debug!("no handler for event");
                metrics::events_unhandled().add(1, &[KeyValue::new("event", event.kind())]);
                return Ok(Vec::new());
            }

            let mut follow_ups = Vec::new();
            let mut first_error: Option<Error> = None;
            for handler in accepting {
                let outcome = handler.handle(event).await;
                metrics::events_handled().add(
                    1,
                    &[
                        KeyValue::new("event", event.kind()),
                        KeyValue::new("handler", handler.name()),
                        KeyValue::new("result", if outcome.is_ok() { "ok" } else { "error" }),
                    ],
                );
                match outcome {
                    Ok(events) => follow_ups.extend(events),
                    Err(e) => {
                        error!(handler = handler.name(), error = %e, "handler failed");
                        first_error.get_or_insert(e);
                    }
                }
            }

            match first_error {
                Some(e) => Err(e),
                None => Ok(follow_ups),
            }
        }
        .instrument(span)
        .await;

        metrics::dispatch_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("event", event.kind())],
        );
        result
    }

    /// Dispatch `event` and, breadth-first, every follow-up it causes.
    /// Returns how many events were dispatched.
    ///
    /// A failed dispatch is logged and does not stop the chain; the first
    /// error is returned at the end.
    pub async fn process(&self, event: InboundEvent) -> Result<usize> {
        let mut queue = VecDeque::from([event]);
        let mut dispatched = 0;
        let mut first_error: Option<Error> = None;

        while let Some(next) = queue.pop_front() {
            if dispatched == MAX_CHAIN_LEN {
                return Err(Error::Other(format!(
                    "follow-up chain exceeded {MAX_CHAIN_LEN} events, {} still queued",
                    queue.len() + 1
                )));
            }
            dispatched += 1;
            match self.dispatch(&next).await {
                Ok(follow_ups) => queue.extend(follow_ups),
                Err(e) => {
                    error!(message_id = next.message_id(), error = %e, "dispatch failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        info!(dispatched, "event chain processed");
        match first_error {
            Some(e) => Err(e),
            None => Ok(dispatched),
        }
    }
}
