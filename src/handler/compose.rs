use std::sync::Arc;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use tracing::{info, warn};

use super::{Context, Handler};
use crate::error::Result;
use crate::event::{ComposeState, InboundEvent};
use crate::telemetry::metrics;

/// Starts the root builds of events that were waiting for their compose.
pub struct ComposeDoneHandler {
    ctx: Arc<Context>,
}

impl ComposeDoneHandler {
    pub const NAME: &'static str = "ComposeDoneHandler";

    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Handler for ComposeDoneHandler {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn can_handle(&self, event: &InboundEvent) -> bool {
        matches!(event, InboundEvent::ComposeStateChanged { .. })
    }

    async fn handle(&self, event: &InboundEvent) -> Result<Vec<InboundEvent>> {
        let InboundEvent::ComposeStateChanged {
            compose_id, state, ..
        } = event
        else {
            return Ok(Vec::new());
        };

        let store = self.ctx.store.as_ref();
        match state {
            ComposeState::Done => {}
            ComposeState::Failed | ComposeState::Expired => {
                let stalled = store.find_events_by_compose_id(*compose_id).await?;
                metrics::composes_unusable().add(
                    1,
                    &[KeyValue::new("state", format!("{state:?}").to_lowercase())],
                );
                warn!(
                    compose_id,
                    ?state,
                    events = ?stalled.iter().map(|e| e.id.0).collect::<Vec<_>>(),
                    "compose unusable, its builds stay planned"
                );
                return Ok(Vec::new());
            }
            ComposeState::Wait | ComposeState::Generating => {
                info!(compose_id, ?state, "compose not ready yet");
                return Ok(Vec::new());
            }
        }

        let events = store.find_events_by_compose_id(*compose_id).await?;
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let repo_urls = match self.ctx.composes.as_ref() {
            Some(composes) => {
                let compose_id = *compose_id;
                vec![
                    self.ctx
                        .retry
                        .run_transient("compose_repo_url", || composes.repo_url(compose_id))
                        .await?,
                ]
            }
            None => Vec::new(),
        };

        let mut follow_ups = Vec::new();
        for e in events {
            let roots: Vec<_> = store
                .builds_for_event(e.id)
                .await?
                .into_iter()
                .filter(|b| b.dep_on.is_none())
                .collect();
            info!(event_id = %e.id, compose_id, roots = roots.len(), "compose done, submitting");
            follow_ups.extend(self.ctx.submit_ready(roots, &repo_urls).await?);
        }
        Ok(follow_ups)
    }
}
