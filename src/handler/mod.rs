//! Event handlers.
//!
//! A handler reacts to one or more kinds of [`InboundEvent`], persists what
//! it learned, and may return follow-up events for the dispatcher.

mod advisory_state;
mod build_task;
mod compose;
mod rpm_advisory;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{Span, error, info};

use crate::clients::{
    AdvisoryTracker, BuildSubmitter, CandidateResolver, ComposeService, DryRunSubmitter,
    Unconfigured,
};
use crate::error::Result;
use crate::event::{InboundEvent, TaskState};
use crate::model::{ArtifactBuild, BuildState};
use crate::retry::RetryPolicy;
use crate::rules::RuleLists;
use crate::store::{Store, Transition};
use crate::telemetry::spans::record_build_transition;

pub use advisory_state::AdvisoryStateChangedHandler;
pub use build_task::BuildTaskStateChangedHandler;
pub use compose::ComposeDoneHandler;
pub use rpm_advisory::RebuildImagesOnRpmAdvisory;

#[async_trait]
pub trait Handler: Send + Sync {
    /// Stable name, also the key of the handler's allow/block rules.
    fn name(&self) -> &'static str;

    fn can_handle(&self, event: &InboundEvent) -> bool;

    /// Process the event and return follow-up events, possibly none.
    async fn handle(&self, event: &InboundEvent) -> Result<Vec<InboundEvent>>;
}

/// Everything handlers share: storage, rules, retry policy and collaborators.
pub struct Context {
    pub store: Arc<dyn Store>,
    pub rules: Arc<RuleLists>,
    pub retry: RetryPolicy,
    /// Record builds but never submit them.
    pub dry_run: bool,
    pub resolver: Arc<dyn CandidateResolver>,
    pub submitter: Arc<dyn BuildSubmitter>,
    pub tracker: Arc<dyn AdvisoryTracker>,
    /// When set, planned builds wait for a compose before submission.
    pub composes: Option<Arc<dyn ComposeService>>,
    /// Appended to the release of rebuilt image NVRs.
    pub release_suffix: String,
    fake_ids: DryRunSubmitter,
}

impl Context {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            rules: Arc::new(RuleLists::default()),
            retry: RetryPolicy::default(),
            dry_run: false,
            resolver: Arc::new(Unconfigured),
            submitter: Arc::new(Unconfigured),
            tracker: Arc::new(Unconfigured),
            composes: None,
            release_suffix: String::new(),
            fake_ids: DryRunSubmitter::new(),
        }
    }

    pub fn rules(mut self, rules: Arc<RuleLists>) -> Self {
        self.rules = rules;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn CandidateResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn submitter(mut self, submitter: Arc<dyn BuildSubmitter>) -> Self {
        self.submitter = submitter;
        self
    }

    pub fn tracker(mut self, tracker: Arc<dyn AdvisoryTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn composes(mut self, composes: Arc<dyn ComposeService>) -> Self {
        self.composes = Some(composes);
        self
    }

    pub fn release_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.release_suffix = suffix.into();
        self
    }

    /// Submit every build in `builds` that is ready: still planned, with no
    /// dependency or a finished one.
    ///
    /// A failed submission leaves its build planned; the first such error is
    /// returned after the remaining builds were tried. In dry run no build is
    /// submitted; each gets a fake task id and a synthetic "closed" event is
    /// returned so dependents proceed.
    pub(crate) async fn submit_ready(
        &self,
        builds: Vec<ArtifactBuild>,
        repo_urls: &[String],
    ) -> Result<Vec<InboundEvent>> {
        let mut follow_ups = Vec::new();
        let mut first_error = None;

        for build in builds {
            if build.state != BuildState::Planned {
                continue;
            }
            if let Some(parent) = build.dep_on {
                if self.store.get_build(parent).await?.state != BuildState::Done {
                    continue;
                }
            }

            let task_id = if self.dry_run {
                self.fake_ids.next_id()
            } else {
                let submitter = &self.submitter;
                let build = &build;
                match self
                    .retry
                    .run_transient("submit_build", || submitter.submit(build, repo_urls))
                    .await
                {
                    Ok(id) => id,
                    Err(e) => {
                        error!(build = %build.id, name = %build.name, error = %e, "build submission failed");
                        first_error.get_or_insert(e);
                        continue;
                    }
                }
            };

            record_build_transition(&Span::current(), &build, BuildState::Build);
            self.store
                .transition_build(build.id, Transition::submitted(task_id))
                .await?;
            info!(build = %build.id, name = %build.name, task_id, dry_run = self.dry_run, "build submitted");

            if self.dry_run {
                follow_ups.push(InboundEvent::BuildTaskStateChanged {
                    message_id: format!("dry-run:task:{task_id}"),
                    task_id,
                    state: TaskState::Closed,
                    reason: None,
                });
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(follow_ups),
        }
    }
}

/// The standard handler set, in dispatch order.
pub fn default_handlers(ctx: Arc<Context>) -> Vec<Arc<dyn Handler>> {
    vec![
        Arc::new(RebuildImagesOnRpmAdvisory::new(ctx.clone())),
        Arc::new(AdvisoryStateChangedHandler::new(ctx.clone())),
        Arc::new(BuildTaskStateChangedHandler::new(ctx.clone())),
        Arc::new(ComposeDoneHandler::new(ctx)),
    ]
}
