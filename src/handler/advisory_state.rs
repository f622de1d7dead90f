use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{Context, Handler};
use crate::error::Result;
use crate::event::InboundEvent;

/// Advisory states in which all of the advisory's RPMs are signed.
const SIGNED_STATES: [&str; 4] = ["REL_PREP", "PUSH_READY", "IN_PUSH", "SHIPPED_LIVE"];

const SHIPPED_LIVE: &str = "SHIPPED_LIVE";

/// Catches advisories whose signing notification was missed, and marks
/// events released once their advisory ships.
pub struct AdvisoryStateChangedHandler {
    ctx: Arc<Context>,
}

impl AdvisoryStateChangedHandler {
    pub const NAME: &'static str = "AdvisoryStateChangedHandler";

    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Handler for AdvisoryStateChangedHandler {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn can_handle(&self, event: &InboundEvent) -> bool {
        matches!(event, InboundEvent::AdvisoryStateChanged { .. })
    }

    async fn handle(&self, event: &InboundEvent) -> Result<Vec<InboundEvent>> {
        let InboundEvent::AdvisoryStateChanged {
            message_id,
            advisory_id,
            state,
        } = event
        else {
            return Ok(Vec::new());
        };

        if !SIGNED_STATES.contains(&state.as_str()) {
            debug!(advisory_id, state = %state, "advisory state not interesting");
            return Ok(Vec::new());
        }

        let store = self.ctx.store.as_ref();
        let existing = store.find_events_by_search_key(&advisory_id.to_string()).await?;

        if state == SHIPPED_LIVE {
            for e in existing.iter().filter(|e| !e.released) {
                store.mark_released(e.id).await?;
                info!(event_id = %e.id, advisory_id, "event released");
            }
        }

        if !existing.is_empty() {
            return Ok(Vec::new());
        }

        let tracker = &self.ctx.tracker;
        let advisory_id = *advisory_id;
        let advisories = self
            .ctx
            .retry
            .run_transient("advisories_from_event", || {
                tracker.advisories_from_event(advisory_id)
            })
            .await?;

        let rpm_advisories: Vec<_> = advisories
            .into_iter()
            .filter(|a| a.has_rpm_content())
            .collect();
        let single = rpm_advisories.len() == 1;

        Ok(rpm_advisories
            .into_iter()
            .map(|advisory| {
                info!(advisory = %advisory.name, state = %state, "advisory signed, rebuilding");
                let message_id = if single {
                    format!("{message_id}:rpms-signed")
                } else {
                    format!("{message_id}:rpms-signed:{}", advisory.id)
                };
                InboundEvent::AdvisoryRpmsSigned {
                    message_id,
                    advisory,
                }
            })
            .collect())
    }
}
