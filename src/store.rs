//! Persistence seam.
//!
//! Everything that reads or writes events and builds goes through [`Store`].
//! Two backends implement it: [`crate::storage::MemoryStore`] and the
//! Postgres-backed [`crate::db::Db`].

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{
    ArtifactBuild, ArtifactType, BuildId, BuildState, Event, EventId, EventType, NewBuild,
    NewEvent,
};

/// Filter for [`Store::list_events`].
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub event_type: Option<EventType>,
    pub search_key: Option<String>,
    pub released: Option<bool>,
    pub limit: Option<usize>,
}

impl EventFilter {
    pub(crate) fn accepts(&self, event: &Event) -> bool {
        self.event_type.is_none_or(|t| t == event.event_type)
            && self.search_key.as_deref().is_none_or(|k| k == event.search_key)
            && self.released.is_none_or(|r| r == event.released)
    }
}

/// Filter for [`Store::list_builds`].
#[derive(Debug, Clone, Default)]
pub struct BuildFilter {
    pub event_id: Option<EventId>,
    pub name: Option<String>,
    pub state: Option<BuildState>,
    pub artifact_type: Option<ArtifactType>,
    pub limit: Option<usize>,
}

impl BuildFilter {
    pub(crate) fn accepts(&self, build: &ArtifactBuild) -> bool {
        self.event_id.is_none_or(|id| id == build.event_id)
            && self.name.as_deref().is_none_or(|n| n == build.name)
            && self.state.is_none_or(|s| s == build.state)
            && self.artifact_type.is_none_or(|t| t == build.artifact_type)
    }
}

/// A requested state change for [`Store::transition_build`].
#[derive(Debug, Clone)]
pub struct Transition {
    pub to: BuildState,
    pub reason: Option<String>,
    /// External job id, recorded when moving to `Build`.
    pub build_id: Option<i64>,
}

impl Transition {
    pub fn submitted(build_id: i64) -> Self {
        Self {
            to: BuildState::Build,
            reason: None,
            build_id: Some(build_id),
        }
    }

    pub fn done() -> Self {
        Self {
            to: BuildState::Done,
            reason: None,
            build_id: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            to: BuildState::Failed,
            reason: Some(reason.into()),
            build_id: None,
        }
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Return the event with this message id, creating it if absent.
    /// Redelivering a message never creates a second row.
    async fn get_or_create_event(&self, new: NewEvent) -> Result<Event>;

    /// Insert a build. Fails with `ConstraintViolation` if `dep_on` is unknown
    /// or owned by another event, or if a failed build carries no reason.
    async fn create_build(&self, new: NewBuild) -> Result<ArtifactBuild>;

    /// Mark an event released. Releasing twice is a no-op.
    async fn mark_released(&self, id: EventId) -> Result<()>;

    /// Distinct unreleased events, other than `exclude`, owning at least one
    /// build whose name is in `names`.
    async fn find_unreleased_events_with_builds(
        &self,
        names: &BTreeSet<String>,
        exclude: EventId,
    ) -> Result<Vec<Event>>;

    async fn get_event(&self, id: EventId) -> Result<Event>;

    async fn get_build(&self, id: BuildId) -> Result<ArtifactBuild>;

    async fn find_events_by_search_key(&self, search_key: &str) -> Result<Vec<Event>>;

    async fn find_events_by_compose_id(&self, compose_id: i64) -> Result<Vec<Event>>;

    /// Look up a build by its external job id.
    async fn find_build_by_build_id(&self, build_id: i64) -> Result<Option<ArtifactBuild>>;

    /// All builds of an event in creation order.
    async fn builds_for_event(&self, event_id: EventId) -> Result<Vec<ArtifactBuild>>;

    /// Builds whose `dep_on` is `parent`.
    async fn dependent_builds(&self, parent: BuildId) -> Result<Vec<ArtifactBuild>>;

    async fn set_compose_id(&self, id: EventId, compose_id: i64) -> Result<()>;

    /// Move a build along the state machine. Terminal states stamp
    /// `completed_at`; invalid moves fail with `InvalidTransition`.
    async fn transition_build(&self, id: BuildId, transition: Transition) -> Result<ArtifactBuild>;

    /// Events newest first.
    async fn list_events(&self, filter: &EventFilter) -> Result<Vec<Event>>;

    /// Builds newest first.
    async fn list_builds(&self, filter: &BuildFilter) -> Result<Vec<ArtifactBuild>>;
}
