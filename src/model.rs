//! Core data model.
//!
//! An event is an observed upstream change (an advisory got signed, a parent
//! image was rebuilt, a compose finished). It owns a forest of artifact
//! builds connected by `dep_on` edges, one tree per rebuilt base image.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::rules::Attributes;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Sequential event identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId(pub i64);

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// Sequential artifact build identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BuildId(pub i64);

impl std::fmt::Display for BuildId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// Which kind of trigger produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    AdvisoryRpmsSigned,
    AdvisoryStateChanged,
    BuildTaskStateChanged,
    ComposeStateChanged,
    ManualRebuild,
    Testing,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::AdvisoryRpmsSigned => "advisory_rpms_signed",
            EventType::AdvisoryStateChanged => "advisory_state_changed",
            EventType::BuildTaskStateChanged => "build_task_state_changed",
            EventType::ComposeStateChanged => "compose_state_changed",
            EventType::ManualRebuild => "manual_rebuild",
            EventType::Testing => "testing",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "advisory_rpms_signed" => Ok(EventType::AdvisoryRpmsSigned),
            "advisory_state_changed" => Ok(EventType::AdvisoryStateChanged),
            "build_task_state_changed" => Ok(EventType::BuildTaskStateChanged),
            "compose_state_changed" => Ok(EventType::ComposeStateChanged),
            "manual_rebuild" => Ok(EventType::ManualRebuild),
            "testing" => Ok(EventType::Testing),
            _ => Err(Error::Other(format!("unknown event type: {s}"))),
        }
    }
}

/// A persisted trigger and the root of its build forest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    /// Opaque id of the inbound message. Unique.
    pub message_id: String,
    /// Business key, e.g. the advisory id. Several events may share it.
    pub search_key: String,
    pub event_type: EventType,
    /// Set once the upstream change is published. Released events are never
    /// reused by dedup.
    pub released: bool,
    /// Compose generated to support this event's builds.
    pub compose_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters for [`crate::store::Store::get_or_create_event`].
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub(crate) message_id: String,
    pub(crate) search_key: String,
    pub(crate) event_type: EventType,
    pub(crate) released: bool,
}

impl NewEvent {
    pub fn new(
        message_id: impl Into<String>,
        search_key: impl Into<String>,
        event_type: EventType,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            search_key: search_key.into(),
            event_type,
            released: false,
        }
    }

    /// Create the event already released. Only meaningful for imports and tests.
    pub fn released(mut self, released: bool) -> Self {
        self.released = released;
        self
    }
}

// ---------------------------------------------------------------------------
// Artifact build
// ---------------------------------------------------------------------------

/// Kind of artifact being rebuilt.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    Module,
    Image,
    RpmContainer,
}

impl ArtifactType {
    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactType::Module => "module",
            ArtifactType::Image => "image",
            ArtifactType::RpmContainer => "rpm_container",
        }
    }
}

impl std::fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ArtifactType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "module" => Ok(ArtifactType::Module),
            "image" => Ok(ArtifactType::Image),
            "rpm_container" => Ok(ArtifactType::RpmContainer),
            _ => Err(Error::Other(format!("unknown artifact type: {s}"))),
        }
    }
}

/// Lifecycle state of an artifact build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    /// Recorded, waiting for its dependency (or compose) before submission.
    Planned,
    /// Submitted to the build system.
    Build,
    /// Built successfully. Terminal.
    Done,
    /// Failed, or never attempted because an ancestor failed. Terminal.
    Failed,
}

impl BuildState {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: BuildState) -> bool {
        use BuildState::*;
        matches!((self, to), (Planned, Build) | (Build, Done) | (Build, Failed))
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, BuildState::Done | BuildState::Failed)
    }
}

impl std::fmt::Display for BuildState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BuildState::Planned => "planned",
            BuildState::Build => "build",
            BuildState::Done => "done",
            BuildState::Failed => "failed",
        };
        f.pad(s)
    }
}

impl FromStr for BuildState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "planned" => Ok(BuildState::Planned),
            "build" => Ok(BuildState::Build),
            "done" => Ok(BuildState::Done),
            "failed" => Ok(BuildState::Failed),
            _ => Err(Error::Other(format!("unknown build state: {s}"))),
        }
    }
}

/// Build-time parameters. Stored as JSON and read back unchanged; keys the
/// engine does not know about survive in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildArgs {
    pub repository: Option<String>,
    pub commit: Option<String>,
    pub target: Option<String>,
    pub branch: Option<String>,
    /// Name of the resolved parent build, if any.
    pub parent: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A single artifact rebuild tracked under an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactBuild {
    pub id: BuildId,
    pub event_id: EventId,
    pub name: String,
    pub artifact_type: ArtifactType,
    pub state: BuildState,
    /// Why the build is in its current state. Always set for failures.
    pub state_reason: Option<String>,
    /// External build-system job id, once submitted.
    pub build_id: Option<i64>,
    pub build_args: BuildArgs,
    /// The build this one waits for.
    pub dep_on: Option<BuildId>,
    pub rebuilt_nvr: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Parameters for [`crate::store::Store::create_build`].
#[derive(Debug, Clone)]
pub struct NewBuild {
    pub(crate) event_id: EventId,
    pub(crate) name: String,
    pub(crate) artifact_type: ArtifactType,
    pub(crate) state: BuildState,
    pub(crate) state_reason: Option<String>,
    pub(crate) build_id: Option<i64>,
    pub(crate) build_args: BuildArgs,
    pub(crate) dep_on: Option<BuildId>,
    pub(crate) rebuilt_nvr: Option<String>,
}

impl NewBuild {
    pub fn new(event_id: EventId, name: impl Into<String>, artifact_type: ArtifactType) -> Self {
        Self {
            event_id,
            name: name.into(),
            artifact_type,
            state: BuildState::Planned,
            state_reason: None,
            build_id: None,
            build_args: BuildArgs::default(),
            dep_on: None,
            rebuilt_nvr: None,
        }
    }

    /// Create the build directly as failed. It will never be attempted.
    pub fn failed(mut self, reason: impl Into<String>) -> Self {
        self.state = BuildState::Failed;
        self.state_reason = Some(reason.into());
        self
    }

    /// Record an already-submitted build (imports, tests).
    pub fn submitted(mut self, build_id: i64) -> Self {
        self.state = BuildState::Build;
        self.build_id = Some(build_id);
        self
    }

    pub fn args(mut self, build_args: BuildArgs) -> Self {
        self.build_args = build_args;
        self
    }

    pub fn dep_on(mut self, parent: BuildId) -> Self {
        self.dep_on = Some(parent);
        self
    }

    pub fn rebuilt_nvr(mut self, nvr: impl Into<String>) -> Self {
        self.rebuilt_nvr = Some(nvr.into());
        self
    }

    /// Check the row-local invariants before it reaches storage.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::ConstraintViolation("build name is empty".to_string()));
        }
        match self.state {
            BuildState::Failed if self.state_reason.is_none() => Err(Error::ConstraintViolation(
                format!("failed build {} has no state reason", self.name),
            )),
            BuildState::Done => Err(Error::ConstraintViolation(format!(
                "build {} cannot be created as done",
                self.name
            ))),
            _ => Ok(()),
        }
    }
}

/// NVR a rebuild of `nvr` is released under, or `None` when the artifact
/// type keeps its own NVR or `nvr` is not `name-version-release`.
///
/// Images keep name and version; the release becomes
/// `<major>.<timestamp><suffix>` where `<major>` is the part of the old
/// release before the first dot.
pub fn rebuilt_nvr(
    artifact_type: ArtifactType,
    nvr: &str,
    release_suffix: &str,
    timestamp: i64,
) -> Option<String> {
    if artifact_type != ArtifactType::Image {
        return None;
    }
    let (name_version, release) = nvr.rsplit_once('-')?;
    let (name, version) = name_version.rsplit_once('-')?;
    if name.is_empty() || version.is_empty() || release.is_empty() {
        return None;
    }
    let major = release.split('.').next().unwrap_or(release);
    Some(format!("{name}-{version}-{major}.{timestamp}{release_suffix}"))
}

// ---------------------------------------------------------------------------
// Advisory
// ---------------------------------------------------------------------------

/// An errata advisory as reported by the advisory tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Advisory {
    pub id: i64,
    /// e.g. "RHSA-2017:1234".
    pub name: String,
    /// Lifecycle state, e.g. "QE", "SHIPPED_LIVE".
    pub state: String,
    pub security_impact: String,
    #[serde(default)]
    pub content_types: Vec<String>,
}

impl Advisory {
    pub fn has_rpm_content(&self) -> bool {
        self.content_types.iter().any(|t| t == "rpm")
    }

    /// Attributes the rule engine sees for this advisory.
    pub fn attributes(&self) -> Attributes {
        let mut attrs = Attributes::new();
        attrs.insert("advisory_id".into(), self.id.into());
        attrs.insert("advisory_name".into(), self.name.clone().into());
        attrs.insert("advisory_state".into(), self.state.clone().into());
        attrs.insert(
            "advisory_security_impact".into(),
            self.security_impact.clone().into(),
        );
        attrs.insert(
            "advisory_content_types".into(),
            serde_json::Value::from(self.content_types.clone()),
        );
        attrs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_state_machine_moves_forward_only() {
        use BuildState::*;
        assert!(Planned.can_transition_to(Build));
        assert!(Build.can_transition_to(Done));
        assert!(Build.can_transition_to(Failed));

        assert!(!Build.can_transition_to(Planned));
        assert!(!Failed.can_transition_to(Planned));
        assert!(!Done.can_transition_to(Build));
        assert!(!Planned.can_transition_to(Done));
        assert!(Done.is_terminal() && Failed.is_terminal());
    }

    #[test]
    fn rebuilt_nvr_bumps_image_release() {
        assert_eq!(
            rebuilt_nvr(ArtifactType::Image, "openssl-container-1.0-12.3", "", 1500000000).as_deref(),
            Some("openssl-container-1.0-12.1500000000")
        );
        assert_eq!(
            rebuilt_nvr(ArtifactType::Image, "foo-2-1", ".fm", 42).as_deref(),
            Some("foo-2-1.42.fm")
        );
        assert_eq!(rebuilt_nvr(ArtifactType::Module, "foo-2-1", "", 42), None);
        assert_eq!(rebuilt_nvr(ArtifactType::Image, "not-an", "", 42), None);
    }

    #[test]
    fn states_and_types_parse_from_display() {
        for state in [
            BuildState::Planned,
            BuildState::Build,
            BuildState::Done,
            BuildState::Failed,
        ] {
            assert_eq!(state.to_string().parse::<BuildState>().unwrap(), state);
        }
        assert_eq!("image".parse::<ArtifactType>().unwrap(), ArtifactType::Image);
        assert!("container".parse::<ArtifactType>().is_err());
        assert_eq!(
            "manual_rebuild".parse::<EventType>().unwrap(),
            EventType::ManualRebuild
        );
    }

    #[test]
    fn build_args_keep_unknown_keys() {
        let raw = serde_json::json!({
            "repository": "foo_repo",
            "commit": "foo_123",
            "target": "t1",
            "branch": "mybranch",
            "parent": null,
            "arch_override": "x86_64 aarch64",
        });
        let args: BuildArgs = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(args.repository.as_deref(), Some("foo_repo"));
        assert_eq!(args.extra["arch_override"], "x86_64 aarch64");
        assert_eq!(serde_json::to_value(&args).unwrap(), raw);
    }

    #[test]
    fn failed_build_requires_reason() {
        let mut new = NewBuild::new(EventId(1), "foo", ArtifactType::Image);
        new.state = BuildState::Failed;
        assert!(matches!(new.validate(), Err(Error::ConstraintViolation(_))));
        let new = NewBuild::new(EventId(1), "foo", ArtifactType::Image).failed("boom");
        assert!(new.validate().is_ok());
    }
}
