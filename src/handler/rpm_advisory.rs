use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use tracing::{debug, info, warn};

use super::{Context, Handler};
use crate::dedup;
use crate::error::Result;
use crate::event::InboundEvent;
use crate::model::{Advisory, ArtifactBuild, ArtifactType, BuildState, Event, NewEvent};
use crate::scheduler::{BatchScheduler, Candidate, ScheduleFilter};
use crate::telemetry::metrics;

/// Rebuilds the images shipping RPMs of a freshly signed advisory, and
/// serves operator-requested manual rebuilds.
pub struct RebuildImagesOnRpmAdvisory {
    ctx: Arc<Context>,
}

impl RebuildImagesOnRpmAdvisory {
    pub const NAME: &'static str = "RebuildImagesOnRpmAdvisory";

    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Handler for RebuildImagesOnRpmAdvisory {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn can_handle(&self, event: &InboundEvent) -> bool {
        matches!(
            event,
            InboundEvent::AdvisoryRpmsSigned { .. } | InboundEvent::ManualRebuild { .. }
        )
    }

    async fn handle(&self, event: &InboundEvent) -> Result<Vec<InboundEvent>> {
        let (advisory, requested) = match event {
            InboundEvent::AdvisoryRpmsSigned { advisory, .. } => (advisory, &[][..]),
            InboundEvent::ManualRebuild { advisory, images, .. } => (advisory, images.as_slice()),
            _ => return Ok(Vec::new()),
        };

        if !advisory.has_rpm_content() {
            info!(advisory = %advisory.name, "advisory has no RPM content, skipping");
            return Ok(Vec::new());
        }

        let attrs = advisory.attributes();
        let gate = self.ctx.rules.decide_partial(Self::NAME, ArtifactType::Image, &attrs);
        if !gate.is_allowed() {
            info!(
                handler = Self::NAME,
                advisory = %advisory.name,
                reason = %gate,
                "advisory rejected by rules"
            );
            metrics::rules_rejections().add(
                1,
                &[
                    KeyValue::new("handler", Self::NAME),
                    KeyValue::new("artifact_type", ArtifactType::Image.as_str()),
                    KeyValue::new("reason", gate.to_string()),
                ],
            );
            return Ok(Vec::new());
        }

        let store = self.ctx.store.as_ref();
        let db_event = store
            .get_or_create_event(NewEvent::new(
                event.message_id(),
                event.search_key(),
                event.event_type(),
            ))
            .await?;
        let existing = store.builds_for_event(db_event.id).await?;
        if !existing.is_empty() {
            info!(
                event_id = %db_event.id,
                builds = existing.len(),
                "event already has builds, resuming"
            );
            return self.start_builds(advisory, &db_event, existing).await;
        }

        let resolver = &self.ctx.resolver;
        let mut levels = self
            .ctx
            .retry
            .run_transient("find_images_to_rebuild", || {
                resolver.find_images_to_rebuild(advisory)
            })
            .await?;
        if !requested.is_empty() {
            levels = restrict_to(levels, requested);
        }

        let candidates: BTreeMap<String, &Candidate> = levels
            .iter()
            .flatten()
            .map(|c| (c.name.clone(), c))
            .collect();
        if candidates.is_empty() {
            info!(event_id = %db_event.id, advisory = %advisory.name, "no images to rebuild");
            return Ok(Vec::new());
        }

        let others = dedup::find_events_to_include(store, &db_event, &candidates).await?;
        let reused = dedup::reused_names(store, &others, &candidates).await?;
        if !others.is_empty() {
            info!(
                event_id = %db_event.id,
                events = ?others.iter().map(|e| e.id.0).collect::<Vec<_>>(),
                reused = reused.len(),
                "earlier unreleased events cover some images"
            );
        }

        let report = BatchScheduler::new(store)
            .filter(ScheduleFilter {
                rules: &self.ctx.rules,
                handler: Self::NAME,
                base: &attrs,
            })
            .reuse(&reused)
            .release_suffix(&self.ctx.release_suffix)
            .record_batches(&db_event, &levels)
            .await?;

        let planned: Vec<ArtifactBuild> = report.planned().cloned().collect();
        self.start_builds(advisory, &db_event, planned).await
    }
}

impl RebuildImagesOnRpmAdvisory {
    /// Request the event's compose, or submit its ready builds when no
    /// compose service is in use. Safe to repeat: submitted builds and a
    /// requested compose are not redone.
    async fn start_builds(
        &self,
        advisory: &Advisory,
        db_event: &Event,
        builds: Vec<ArtifactBuild>,
    ) -> Result<Vec<InboundEvent>> {
        let planned = builds.iter().filter(|b| b.state == BuildState::Planned).count();
        if planned == 0 {
            return Ok(Vec::new());
        }

        let Some(composes) = self.ctx.composes.as_ref().filter(|_| !self.ctx.dry_run) else {
            return self.ctx.submit_ready(builds, &[]).await;
        };
        if let Some(compose_id) = db_event.compose_id {
            debug!(event_id = %db_event.id, compose_id, "compose already requested");
            return Ok(Vec::new());
        }

        let compose = self
            .ctx
            .retry
            .run_transient("request_compose", || composes.request_compose(advisory))
            .await?;
        self.ctx.store.set_compose_id(db_event.id, compose.id).await?;
        info!(
            event_id = %db_event.id,
            compose_id = compose.id,
            repo_url = %compose.repo_url,
            planned,
            "waiting for compose before submitting builds"
        );
        Ok(Vec::new())
    }
}

/// Keep only the requested images and the images they are built on.
fn restrict_to(levels: Vec<Vec<Candidate>>, requested: &[String]) -> Vec<Vec<Candidate>> {
    let parents: HashMap<&str, Option<&str>> = levels
        .iter()
        .flatten()
        .map(|c| (c.name.as_str(), c.parent.as_deref()))
        .collect();

    let mut keep: BTreeSet<String> = BTreeSet::new();
    for name in requested {
        if !parents.contains_key(name.as_str()) {
            warn!(image = %name, "requested image is not affected by the advisory");
            continue;
        }
        let mut next = Some(name.as_str());
        while let Some(current) = next {
            if !keep.insert(current.to_string()) {
                break;
            }
            next = parents.get(current).copied().flatten();
        }
    }

    levels
        .into_iter()
        .map(|level| level.into_iter().filter(|c| keep.contains(&c.name)).collect::<Vec<_>>())
        .filter(|level| !level.is_empty())
        .collect()
}
