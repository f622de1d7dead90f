use std::sync::Arc;

use async_trait::async_trait;
use tracing::{Span, debug, info, warn};

use super::{Context, Handler};
use crate::error::Result;
use crate::event::{InboundEvent, TaskState};
use crate::model::{ArtifactBuild, BuildState, EventId};
use crate::store::Transition;
use crate::telemetry::spans::record_build_transition;

/// Follows build-system tasks: finishes the build and starts its
/// dependents, or records the failure.
pub struct BuildTaskStateChangedHandler {
    ctx: Arc<Context>,
}

impl BuildTaskStateChangedHandler {
    pub const NAME: &'static str = "BuildTaskStateChangedHandler";

    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Handler for BuildTaskStateChangedHandler {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn can_handle(&self, event: &InboundEvent) -> bool {
        matches!(event, InboundEvent::BuildTaskStateChanged { .. })
    }

    async fn handle(&self, event: &InboundEvent) -> Result<Vec<InboundEvent>> {
        let InboundEvent::BuildTaskStateChanged {
            task_id,
            state,
            reason,
            ..
        } = event
        else {
            return Ok(Vec::new());
        };

        let store = self.ctx.store.as_ref();
        let Some(build) = store.find_build_by_build_id(*task_id).await? else {
            debug!(task_id, "task is not one of ours");
            return Ok(Vec::new());
        };
        if *state == TaskState::Open {
            return Ok(Vec::new());
        }
        match (build.state, state) {
            (BuildState::Build, _) => {}
            // Redelivered after dependents failed to start.
            (BuildState::Done, TaskState::Closed) => {
                info!(build = %build.id, task_id, "build already done, resuming dependents");
                return self.submit_dependents(&build).await;
            }
            _ => {
                warn!(
                    build = %build.id,
                    task_id,
                    state = %build.state,
                    "task update for a build that is not building, ignoring"
                );
                return Ok(Vec::new());
            }
        }

        match state {
            TaskState::Closed => {
                record_build_transition(&Span::current(), &build, BuildState::Done);
                store.transition_build(build.id, Transition::done()).await?;
                info!(build = %build.id, name = %build.name, task_id, "build done");
                self.submit_dependents(&build).await
            }
            TaskState::Failed | TaskState::Canceled => {
                let reason = reason.clone().unwrap_or_else(|| {
                    let verb = if *state == TaskState::Failed { "failed" } else { "was canceled" };
                    format!("Build task {task_id} {verb}")
                });
                record_build_transition(&Span::current(), &build, BuildState::Failed);
                store
                    .transition_build(build.id, Transition::failed(reason.clone()))
                    .await?;
                warn!(build = %build.id, name = %build.name, task_id, %reason, "build failed");
                Ok(Vec::new())
            }
            TaskState::Open => Ok(Vec::new()),
        }
    }
}

impl BuildTaskStateChangedHandler {
    async fn submit_dependents(&self, build: &ArtifactBuild) -> Result<Vec<InboundEvent>> {
        let dependents = self.ctx.store.dependent_builds(build.id).await?;
        let repo_urls = self.repo_urls(build.event_id).await?;
        self.ctx.submit_ready(dependents, &repo_urls).await
    }

    /// Repositories of the event's compose, if it has one.
    async fn repo_urls(&self, event_id: EventId) -> Result<Vec<String>> {
        let Some(composes) = self.ctx.composes.as_ref().filter(|_| !self.ctx.dry_run) else {
            return Ok(Vec::new());
        };
        let Some(compose_id) = self.ctx.store.get_event(event_id).await?.compose_id else {
            return Ok(Vec::new());
        };
        let url = self
            .ctx
            .retry
            .run_transient("compose_repo_url", || composes.repo_url(compose_id))
            .await?;
        Ok(vec![url])
    }
}
