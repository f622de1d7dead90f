//! Batch scheduler.
//!
//! Turns a leveled parent/child tree of candidate builds into persisted
//! [`ArtifactBuild`] rows. Level 0 holds base images, level N holds images
//! built on top of level N-1. A node whose parent failed is recorded as
//! failed too and never attempted.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::Utc;
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::{
    ArtifactBuild, ArtifactType, BuildArgs, BuildState, Event, EventId, NewBuild, rebuilt_nvr,
};
use crate::rules::{Attributes, Decision, RuleLists};
use crate::store::Store;
use crate::telemetry::metrics;

/// A build the resolver proposes for an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub name: String,
    /// Name of the candidate this one is built on, if any.
    #[serde(default)]
    pub parent: Option<String>,
    /// Resolution error. A candidate with an error is recorded as failed.
    #[serde(default)]
    pub error: Option<String>,
    /// NVR of the currently published artifact.
    #[serde(default)]
    pub nvr: Option<String>,
    #[serde(default)]
    pub build_args: BuildArgs,
    /// Extra attributes for allow/block rules.
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default = "default_artifact_type")]
    pub artifact_type: ArtifactType,
}

fn default_artifact_type() -> ArtifactType {
    ArtifactType::Image
}

impl Candidate {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: None,
            error: None,
            nvr: None,
            build_args: BuildArgs::default(),
            attributes: Attributes::new(),
            artifact_type: ArtifactType::Image,
        }
    }

    pub fn parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn nvr(mut self, nvr: impl Into<String>) -> Self {
        self.nvr = Some(nvr.into());
        self
    }

    pub fn args(mut self, build_args: BuildArgs) -> Self {
        self.build_args = build_args;
        self
    }

    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn artifact_type(mut self, artifact_type: ArtifactType) -> Self {
        self.artifact_type = artifact_type;
        self
    }
}

/// Per-candidate allow/block filtering.
#[derive(Debug, Clone, Copy)]
pub struct ScheduleFilter<'a> {
    pub rules: &'a RuleLists,
    pub handler: &'a str,
    /// Attributes shared by every candidate, e.g. the advisory's.
    pub base: &'a Attributes,
}

impl ScheduleFilter<'_> {
    fn decide(&self, candidate: &Candidate) -> Decision {
        let mut attrs = self.base.clone();
        attrs.insert("image_name".into(), candidate.name.clone().into());
        attrs.extend(
            candidate
                .attributes
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        self.rules.decide(self.handler, candidate.artifact_type, &attrs)
    }
}

/// What happened to one candidate.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutcome {
    Created(ArtifactBuild),
    /// Filtered out by allow/block rules. Not persisted.
    Rejected(Decision),
    /// Covered by a finished build of an earlier unreleased event. Not
    /// persisted.
    Reused(EventId),
    /// A candidate with the same name appeared earlier in the input.
    Duplicate,
    /// Storage refused the row.
    Invalid(String),
}

/// Outcomes of a [`BatchScheduler::record_batches`] run in processing order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScheduleReport {
    pub nodes: Vec<(String, NodeOutcome)>,
}

impl ScheduleReport {
    pub fn created(&self) -> impl Iterator<Item = &ArtifactBuild> {
        self.nodes.iter().filter_map(|(_, outcome)| match outcome {
            NodeOutcome::Created(build) => Some(build),
            _ => None,
        })
    }

    pub fn outcome(&self, name: &str) -> Option<&NodeOutcome> {
        self.nodes.iter().find(|(n, _)| n == name).map(|(_, o)| o)
    }

    /// Created builds waiting for submission.
    pub fn planned(&self) -> impl Iterator<Item = &ArtifactBuild> {
        self.created().filter(|b| b.state == BuildState::Planned)
    }
}

pub struct BatchScheduler<'a> {
    store: &'a dyn Store,
    filter: Option<ScheduleFilter<'a>>,
    reused: Option<&'a BTreeMap<String, ArtifactBuild>>,
    release_suffix: &'a str,
}

impl<'a> BatchScheduler<'a> {
    pub fn new(store: &'a dyn Store) -> Self {
        Self {
            store,
            filter: None,
            reused: None,
            release_suffix: "",
        }
    }

    pub fn filter(mut self, filter: ScheduleFilter<'a>) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Builds of other events covering candidate names, see
    /// [`crate::dedup::reused_names`].
    ///
    /// Only finished covering builds are reused. A failed one fails the
    /// node's children; an unfinished one is rebuilt in this event so its
    /// children wait for it.
    pub fn reuse(mut self, reused: &'a BTreeMap<String, ArtifactBuild>) -> Self {
        self.reused = Some(reused);
        self
    }

    /// Appended to the release of rebuilt image NVRs.
    pub fn release_suffix(mut self, suffix: &'a str) -> Self {
        self.release_suffix = suffix;
        self
    }

    /// Persist `levels` under `event`, level by level, node by node.
    ///
    /// A parent that is absent from this run (rejected, reused after a
    /// successful build, or never proposed) leaves the node root-level. A
    /// parent reused after a failed build, or proposed in this run but not
    /// yet processed, fails the node instead. Storage errors other
    /// than constraint violations abort the run; rows written so far stay.
    pub async fn record_batches(
        &self,
        event: &Event,
        levels: &[Vec<Candidate>],
    ) -> Result<ScheduleReport> {
        let proposed: BTreeSet<&str> = levels.iter().flatten().map(|c| c.name.as_str()).collect();
        let mut processed: BTreeSet<&str> = BTreeSet::new();
        let mut built: HashMap<&str, ArtifactBuild> = HashMap::new();
        let mut failed_elsewhere: HashMap<&str, EventId> = HashMap::new();
        let mut report = ScheduleReport::default();
        let timestamp = Utc::now().timestamp();

        for (level, candidates) in levels.iter().enumerate() {
            for candidate in candidates {
                let name = candidate.name.as_str();
                let misordered = candidate.parent.as_deref().filter(|p| {
                    *p == name || (proposed.contains(p) && !processed.contains(p))
                });
                if !processed.insert(name) {
                    warn!(event_id = %event.id, name, "duplicate candidate skipped");
                    report.nodes.push((name.to_string(), NodeOutcome::Duplicate));
                    continue;
                }

                if let Some(filter) = &self.filter {
                    let decision = filter.decide(candidate);
                    if !decision.is_allowed() {
                        info!(
                            event_id = %event.id,
                            handler = filter.handler,
                            artifact_type = %candidate.artifact_type,
                            name,
                            reason = %decision,
                            "candidate rejected by rules"
                        );
                        metrics::rules_rejections().add(
                            1,
                            &[
                                KeyValue::new("handler", filter.handler.to_string()),
                                KeyValue::new("artifact_type", candidate.artifact_type.as_str()),
                                KeyValue::new("reason", decision.to_string()),
                            ],
                        );
                        report.nodes.push((name.to_string(), NodeOutcome::Rejected(decision)));
                        continue;
                    }
                }

                if let Some(covering) = self.reused.and_then(|r| r.get(name)) {
                    match covering.state {
                        BuildState::Done | BuildState::Failed => {
                            info!(
                                event_id = %event.id,
                                name,
                                covering_event = %covering.event_id,
                                covering_build = %covering.id,
                                state = %covering.state,
                                "covered by earlier event"
                            );
                            if covering.state == BuildState::Failed {
                                failed_elsewhere.insert(name, covering.event_id);
                            }
                            report
                                .nodes
                                .push((name.to_string(), NodeOutcome::Reused(covering.event_id)));
                            continue;
                        }
                        BuildState::Planned | BuildState::Build => {
                            info!(
                                event_id = %event.id,
                                name,
                                covering_event = %covering.event_id,
                                covering_build = %covering.id,
                                state = %covering.state,
                                "covering build unfinished, rebuilding here"
                            );
                        }
                    }
                }

                let parent = match misordered {
                    Some(_) => None,
                    None => candidate.parent.as_deref().and_then(|p| built.get(p)),
                };

                let mut build_args = candidate.build_args.clone();
                build_args.parent = parent.map(|p| p.name.clone());

                let mut new = NewBuild::new(event.id, name, candidate.artifact_type).args(build_args);
                if let Some(p) = parent {
                    new = new.dep_on(p.id);
                }
                if let Some(nvr) = candidate.nvr.as_deref() {
                    match rebuilt_nvr(candidate.artifact_type, nvr, self.release_suffix, timestamp) {
                        Some(rebuilt) => new = new.rebuilt_nvr(rebuilt),
                        None if candidate.artifact_type == ArtifactType::Image => {
                            warn!(event_id = %event.id, name, nvr, "unparsable NVR, no rebuilt NVR");
                        }
                        None => {}
                    }
                }
                let failed_dependency = candidate
                    .parent
                    .as_deref()
                    .and_then(|p| failed_elsewhere.get_key_value(p));
                new = if let Some(p) = misordered {
                    new.failed(format!(
                        "Cannot build artifact, because its dependency \"{p}\" is scheduled after it"
                    ))
                } else if let Some(error) = &candidate.error {
                    new.failed(error.clone())
                } else if let Some((p, owner)) = failed_dependency {
                    new.failed(format!(
                        "Cannot build artifact, because its dependency \"{p}\" failed in event {owner}"
                    ))
                } else if let Some(p) = parent.filter(|p| p.state == BuildState::Failed) {
                    new.failed(format!(
                        "Cannot build artifact, because its dependency \"{}\" failed",
                        p.name
                    ))
                } else {
                    new
                };

                match self.store.create_build(new).await {
                    Ok(build) => {
                        debug!(
                            event_id = %event.id,
                            level,
                            name,
                            build = %build.id,
                            state = %build.state,
                            "build recorded"
                        );
                        built.insert(name, build.clone());
                        report.nodes.push((name.to_string(), NodeOutcome::Created(build)));
                    }
                    Err(Error::ConstraintViolation(reason)) => {
                        warn!(event_id = %event.id, name, %reason, "build rejected by storage");
                        report.nodes.push((name.to_string(), NodeOutcome::Invalid(reason)));
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let created = report.created().count();
        info!(
            event_id = %event.id,
            candidates = report.nodes.len(),
            created,
            planned = report.planned().count(),
            "batches recorded"
        );
        Ok(report)
    }
}
