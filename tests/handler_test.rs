//! Integration tests for event handlers, run against the in-memory store
//! with scripted collaborators.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use freshet::clients::{AdvisoryTracker, BuildSubmitter, CandidateResolver, Compose, ComposeService};
use freshet::engine::Dispatcher;
use freshet::error::{Error, Result};
use freshet::event::{ComposeState, InboundEvent, TaskState};
use freshet::handler::{
    AdvisoryStateChangedHandler, BuildTaskStateChangedHandler, ComposeDoneHandler, Context,
    Handler, RebuildImagesOnRpmAdvisory, default_handlers,
};
use freshet::model::*;
use freshet::retry::RetryPolicy;
use freshet::rules::{Matcher, Rule, RuleLists};
use freshet::scheduler::Candidate;
use freshet::storage::MemoryStore;
use freshet::store::{EventFilter, Store};

// ---------------------------------------------------------------------------
// Scripted collaborators
// ---------------------------------------------------------------------------

struct StaticResolver(Vec<Vec<Candidate>>);

#[async_trait]
impl CandidateResolver for StaticResolver {
    async fn find_images_to_rebuild(&self, _advisory: &Advisory) -> Result<Vec<Vec<Candidate>>> {
        Ok(self.0.clone())
    }
}

/// Hands out task ids 1, 2, 3, ... and remembers what it was asked to build.
#[derive(Default)]
struct RecordingSubmitter {
    next_id: AtomicI64,
    submitted: Mutex<Vec<(String, Vec<String>)>>,
}

impl RecordingSubmitter {
    fn names(&self) -> Vec<String> {
        self.submitted.lock().unwrap().iter().map(|(n, _)| n.clone()).collect()
    }
}

#[async_trait]
impl BuildSubmitter for RecordingSubmitter {
    async fn submit(&self, build: &ArtifactBuild, repo_urls: &[String]) -> Result<i64> {
        self.submitted
            .lock()
            .unwrap()
            .push((build.name.clone(), repo_urls.to_vec()));
        Ok(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

struct RejectingSubmitter;

#[async_trait]
impl BuildSubmitter for RejectingSubmitter {
    async fn submit(&self, _build: &ArtifactBuild, _repo_urls: &[String]) -> Result<i64> {
        Err(Error::Collaborator("build system refused the build".to_string()))
    }
}

struct StaticTracker(Vec<Advisory>);

#[async_trait]
impl AdvisoryTracker for StaticTracker {
    async fn advisories_from_event(&self, _advisory_id: i64) -> Result<Vec<Advisory>> {
        Ok(self.0.clone())
    }
}

struct FixedCompose;

#[async_trait]
impl ComposeService for FixedCompose {
    async fn request_compose(&self, _advisory: &Advisory) -> Result<Compose> {
        Ok(Compose {
            id: 5,
            repo_url: "http://composes/5/compose.repo".to_string(),
        })
    }

    async fn repo_url(&self, compose_id: i64) -> Result<String> {
        Ok(format!("http://composes/{compose_id}/compose.repo"))
    }
}

/// Fails every call with a transient error until `recover` is called.
struct FlakySubmitter {
    down: AtomicBool,
    inner: RecordingSubmitter,
}

impl FlakySubmitter {
    fn down() -> Self {
        Self {
            down: AtomicBool::new(true),
            inner: RecordingSubmitter::default(),
        }
    }

    fn recover(&self) {
        self.down.store(false, Ordering::Relaxed);
    }
}

#[async_trait]
impl BuildSubmitter for FlakySubmitter {
    async fn submit(&self, build: &ArtifactBuild, repo_urls: &[String]) -> Result<i64> {
        if self.down.load(Ordering::Relaxed) {
            return Err(Error::Transient("build system unavailable".to_string()));
        }
        self.inner.submit(build, repo_urls).await
    }
}

/// [`FixedCompose`] behind an outage switch, counting granted requests.
struct FlakyCompose {
    down: AtomicBool,
    requests: AtomicUsize,
}

impl FlakyCompose {
    fn down() -> Self {
        Self {
            down: AtomicBool::new(true),
            requests: AtomicUsize::new(0),
        }
    }

    fn recover(&self) {
        self.down.store(false, Ordering::Relaxed);
    }
}

#[async_trait]
impl ComposeService for FlakyCompose {
    async fn request_compose(&self, advisory: &Advisory) -> Result<Compose> {
        if self.down.load(Ordering::Relaxed) {
            return Err(Error::Transient("compose service unavailable".to_string()));
        }
        self.requests.fetch_add(1, Ordering::Relaxed);
        FixedCompose.request_compose(advisory).await
    }

    async fn repo_url(&self, compose_id: i64) -> Result<String> {
        FixedCompose.repo_url(compose_id).await
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn advisory(id: i64, name: &str, impact: &str) -> Advisory {
    Advisory {
        id,
        name: name.to_string(),
        state: "REL_PREP".to_string(),
        security_impact: impact.to_string(),
        content_types: vec!["rpm".to_string()],
    }
}

fn signed(message_id: &str, advisory: Advisory) -> InboundEvent {
    InboundEvent::AdvisoryRpmsSigned {
        message_id: message_id.to_string(),
        advisory,
    }
}

fn tree() -> Vec<Vec<Candidate>> {
    vec![
        vec![Candidate::new("base")],
        vec![
            Candidate::new("app1").parent("base"),
            Candidate::new("app2").parent("base"),
            Candidate::new("broken").parent("base").error("no dist-git repository"),
        ],
        vec![Candidate::new("app1-ext").parent("app1")],
    ]
}

fn quick_retry() -> RetryPolicy {
    RetryPolicy::new(Duration::from_millis(20), Duration::from_millis(5))
}

fn context(store: Arc<MemoryStore>) -> Context {
    Context::new(store).retry(quick_retry())
}

async fn builds_named(store: &MemoryStore, message_id: &str) -> Vec<ArtifactBuild> {
    let events = store.list_events(&EventFilter::default()).await.unwrap();
    let event = events
        .iter()
        .find(|e| e.message_id == message_id)
        .expect("event recorded");
    store.builds_for_event(event.id).await.unwrap()
}

fn find<'a>(builds: &'a [ArtifactBuild], name: &str) -> &'a ArtifactBuild {
    builds.iter().find(|b| b.name == name).expect("build recorded")
}

// ---------------------------------------------------------------------------
// Advisory state changes
// ---------------------------------------------------------------------------

fn state_changed(state: &str) -> InboundEvent {
    InboundEvent::AdvisoryStateChanged {
        message_id: "msg-state".to_string(),
        advisory_id: 123,
        state: state.to_string(),
    }
}

#[tokio::test]
async fn signed_states_emit_rpms_signed_when_no_event_exists() {
    for state in ["REL_PREP", "PUSH_READY", "IN_PUSH", "SHIPPED_LIVE"] {
        let store = Arc::new(MemoryStore::new());
        let ctx = context(store)
            .tracker(Arc::new(StaticTracker(vec![advisory(123, "RHSA-2017:123", "Critical")])));
        let handler = AdvisoryStateChangedHandler::new(Arc::new(ctx));

        let follow_ups = handler.handle(&state_changed(state)).await.unwrap();
        assert_eq!(follow_ups.len(), 1, "{state}");
        match &follow_ups[0] {
            InboundEvent::AdvisoryRpmsSigned { message_id, advisory } => {
                assert_eq!(message_id, "msg-state:rpms-signed");
                assert_eq!(advisory.id, 123);
            }
            other => panic!("unexpected follow-up {other:?}"),
        }
    }
}

#[tokio::test]
async fn other_states_emit_nothing() {
    for state in ["NEW_FILES", "QE", "UNKNOWN"] {
        let store = Arc::new(MemoryStore::new());
        let ctx = context(store)
            .tracker(Arc::new(StaticTracker(vec![advisory(123, "RHSA-2017:123", "Critical")])));
        let handler = AdvisoryStateChangedHandler::new(Arc::new(ctx));
        assert!(handler.handle(&state_changed(state)).await.unwrap().is_empty(), "{state}");
    }
}

#[tokio::test]
async fn shipped_live_releases_existing_events() {
    let store = Arc::new(MemoryStore::new());
    let event = store
        .get_or_create_event(NewEvent::new("msg-1", "123", EventType::AdvisoryRpmsSigned))
        .await
        .unwrap();
    let other = store
        .get_or_create_event(NewEvent::new("msg-2", "456", EventType::AdvisoryRpmsSigned))
        .await
        .unwrap();
    let handler = AdvisoryStateChangedHandler::new(Arc::new(context(store.clone())));

    assert!(handler.handle(&state_changed("SHIPPED_LIVE")).await.unwrap().is_empty());
    assert!(store.get_event(event.id).await.unwrap().released);
    assert!(!store.get_event(other.id).await.unwrap().released);
}

#[tokio::test]
async fn known_advisory_is_not_signed_again() {
    let store = Arc::new(MemoryStore::new());
    store
        .get_or_create_event(NewEvent::new("msg-1", "123", EventType::AdvisoryRpmsSigned))
        .await
        .unwrap();
    let handler = AdvisoryStateChangedHandler::new(Arc::new(context(store)));
    assert!(handler.handle(&state_changed("REL_PREP")).await.unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Build task state changes
// ---------------------------------------------------------------------------

/// An event whose base image is building as task 10, with three planned
/// dependents.
async fn building_tree(store: &MemoryStore) -> (ArtifactBuild, Vec<ArtifactBuild>) {
    let event = store
        .get_or_create_event(NewEvent::new("msg-1", "123", EventType::AdvisoryRpmsSigned))
        .await
        .unwrap();
    let base = store
        .create_build(NewBuild::new(event.id, "base", ArtifactType::Image).submitted(10))
        .await
        .unwrap();
    let mut children = Vec::new();
    for name in ["child1", "child2", "child3"] {
        children.push(
            store
                .create_build(NewBuild::new(event.id, name, ArtifactType::Image).dep_on(base.id))
                .await
                .unwrap(),
        );
    }
    (base, children)
}

fn task(task_id: i64, state: TaskState) -> InboundEvent {
    InboundEvent::BuildTaskStateChanged {
        message_id: format!("task-{task_id}"),
        task_id,
        state,
        reason: None,
    }
}

#[tokio::test]
async fn closed_task_completes_build_and_submits_dependents() {
    let store = Arc::new(MemoryStore::new());
    let (base, children) = building_tree(&store).await;
    let submitter = Arc::new(RecordingSubmitter::default());
    let handler = BuildTaskStateChangedHandler::new(Arc::new(
        context(store.clone()).submitter(submitter.clone()),
    ));

    let follow_ups = handler.handle(&task(10, TaskState::Closed)).await.unwrap();
    assert!(follow_ups.is_empty());

    let base = store.get_build(base.id).await.unwrap();
    assert_eq!(base.state, BuildState::Done);
    assert!(base.completed_at.is_some());

    assert_eq!(submitter.names(), vec!["child1", "child2", "child3"]);
    let mut task_ids = Vec::new();
    for child in children {
        let child = store.get_build(child.id).await.unwrap();
        assert_eq!(child.state, BuildState::Build);
        task_ids.push(child.build_id.unwrap());
    }
    assert_eq!(task_ids, vec![1, 2, 3]);
}

#[tokio::test]
async fn failed_task_fails_build_only() {
    let store = Arc::new(MemoryStore::new());
    let (base, children) = building_tree(&store).await;
    let submitter = Arc::new(RecordingSubmitter::default());
    let handler = BuildTaskStateChangedHandler::new(Arc::new(
        context(store.clone()).submitter(submitter.clone()),
    ));

    handler.handle(&task(10, TaskState::Failed)).await.unwrap();

    let base = store.get_build(base.id).await.unwrap();
    assert_eq!(base.state, BuildState::Failed);
    assert_eq!(base.state_reason.as_deref(), Some("Build task 10 failed"));
    assert!(submitter.names().is_empty());
    for child in children {
        assert_eq!(store.get_build(child.id).await.unwrap().state, BuildState::Planned);
    }
}

#[tokio::test]
async fn unknown_and_stale_tasks_are_ignored() {
    let store = Arc::new(MemoryStore::new());
    let (base, _) = building_tree(&store).await;
    let handler = BuildTaskStateChangedHandler::new(Arc::new(context(store.clone())));

    assert!(handler.handle(&task(99, TaskState::Closed)).await.unwrap().is_empty());
    assert!(handler.handle(&task(10, TaskState::Open)).await.unwrap().is_empty());
    assert_eq!(store.get_build(base.id).await.unwrap().state, BuildState::Build);

    store
        .transition_build(base.id, freshet::store::Transition::done())
        .await
        .unwrap();
    // A late failure for a finished build does not move it back.
    handler.handle(&task(10, TaskState::Failed)).await.unwrap();
    assert_eq!(store.get_build(base.id).await.unwrap().state, BuildState::Done);
}

#[tokio::test]
async fn rejected_submission_leaves_build_planned() {
    let store = Arc::new(MemoryStore::new());
    let (_, children) = building_tree(&store).await;
    let handler = BuildTaskStateChangedHandler::new(Arc::new(
        context(store.clone()).submitter(Arc::new(RejectingSubmitter)),
    ));

    let err = handler.handle(&task(10, TaskState::Closed)).await.unwrap_err();
    assert!(matches!(err, Error::Collaborator(_)));
    for child in children {
        assert_eq!(store.get_build(child.id).await.unwrap().state, BuildState::Planned);
    }
}

#[tokio::test]
async fn closed_task_redelivery_submits_dependents() {
    let store = Arc::new(MemoryStore::new());
    let (base, children) = building_tree(&store).await;
    let submitter = Arc::new(FlakySubmitter::down());
    let handler = BuildTaskStateChangedHandler::new(Arc::new(
        context(store.clone()).submitter(submitter.clone()),
    ));

    let err = handler.handle(&task(10, TaskState::Closed)).await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(store.get_build(base.id).await.unwrap().state, BuildState::Done);
    for child in &children {
        assert_eq!(store.get_build(child.id).await.unwrap().state, BuildState::Planned);
    }

    submitter.recover();
    assert!(handler.handle(&task(10, TaskState::Closed)).await.unwrap().is_empty());
    assert_eq!(submitter.inner.names(), vec!["child1", "child2", "child3"]);
    for child in &children {
        assert_eq!(store.get_build(child.id).await.unwrap().state, BuildState::Build);
    }

    // Once everything started, another copy submits nothing new.
    handler.handle(&task(10, TaskState::Closed)).await.unwrap();
    assert_eq!(submitter.inner.names().len(), 3);
}

// ---------------------------------------------------------------------------
// RPM advisories
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rpms_signed_records_tree_and_submits_roots() {
    let store = Arc::new(MemoryStore::new());
    let submitter = Arc::new(RecordingSubmitter::default());
    let ctx = context(store.clone())
        .resolver(Arc::new(StaticResolver(tree())))
        .submitter(submitter.clone());
    let handler = RebuildImagesOnRpmAdvisory::new(Arc::new(ctx));

    let event = signed("msg-1", advisory(123, "RHSA-2017:123", "Critical"));
    assert!(handler.handle(&event).await.unwrap().is_empty());

    let builds = builds_named(&store, "msg-1").await;
    assert_eq!(builds.len(), 5);
    assert_eq!(find(&builds, "base").state, BuildState::Build);
    assert_eq!(find(&builds, "app1").state, BuildState::Planned);
    assert_eq!(find(&builds, "broken").state, BuildState::Failed);
    assert_eq!(submitter.names(), vec!["base"]);

    // Redelivery of the same message changes nothing.
    assert!(handler.handle(&event).await.unwrap().is_empty());
    assert_eq!(builds_named(&store, "msg-1").await.len(), 5);
    assert_eq!(submitter.names(), vec!["base"]);
}

#[tokio::test]
async fn submission_outage_is_resumed_on_redelivery() {
    let store = Arc::new(MemoryStore::new());
    let submitter = Arc::new(FlakySubmitter::down());
    let ctx = context(store.clone())
        .resolver(Arc::new(StaticResolver(tree())))
        .submitter(submitter.clone());
    let handler = RebuildImagesOnRpmAdvisory::new(Arc::new(ctx));
    let event = signed("msg-1", advisory(123, "RHSA-2017:123", "Critical"));

    let err = handler.handle(&event).await.unwrap_err();
    assert!(err.is_transient());
    let builds = builds_named(&store, "msg-1").await;
    assert_eq!(builds.len(), 5);
    assert_eq!(find(&builds, "base").state, BuildState::Planned);

    submitter.recover();
    assert!(handler.handle(&event).await.unwrap().is_empty());
    let builds = builds_named(&store, "msg-1").await;
    assert_eq!(builds.len(), 5);
    assert_eq!(find(&builds, "base").state, BuildState::Build);
    assert_eq!(find(&builds, "app1").state, BuildState::Planned);
    assert_eq!(submitter.inner.names(), vec!["base"]);
}

#[tokio::test]
async fn compose_outage_is_resumed_on_redelivery() {
    let store = Arc::new(MemoryStore::new());
    let composes = Arc::new(FlakyCompose::down());
    let submitter = Arc::new(RecordingSubmitter::default());
    let ctx = context(store.clone())
        .resolver(Arc::new(StaticResolver(tree())))
        .submitter(submitter.clone())
        .composes(composes.clone());
    let handler = RebuildImagesOnRpmAdvisory::new(Arc::new(ctx));
    let event = signed("msg-1", advisory(123, "RHSA-2017:123", "Critical"));

    let err = handler.handle(&event).await.unwrap_err();
    assert!(err.is_transient());
    assert!(store.find_events_by_compose_id(5).await.unwrap().is_empty());

    composes.recover();
    assert!(handler.handle(&event).await.unwrap().is_empty());
    let events = store.find_events_by_compose_id(5).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].message_id, "msg-1");

    // The compose is requested once; builds wait for it.
    handler.handle(&event).await.unwrap();
    assert_eq!(composes.requests.load(Ordering::Relaxed), 1);
    assert!(submitter.names().is_empty());
    assert_eq!(builds_named(&store, "msg-1").await.len(), 5);
}

#[tokio::test]
async fn advisory_without_rpms_is_skipped() {
    let store = Arc::new(MemoryStore::new());
    let ctx = context(store.clone()).resolver(Arc::new(StaticResolver(tree())));
    let handler = RebuildImagesOnRpmAdvisory::new(Arc::new(ctx));

    let mut docker_only = advisory(123, "RHBA-2017:123", "None");
    docker_only.content_types = vec!["docker".to_string()];
    handler.handle(&signed("msg-1", docker_only)).await.unwrap();
    assert!(store.list_events(&EventFilter::default()).await.unwrap().is_empty());
}

#[tokio::test]
async fn allowlist_gates_advisories() {
    let store = Arc::new(MemoryStore::new());
    let rules = RuleLists::new().allow(
        RebuildImagesOnRpmAdvisory::NAME,
        ArtifactType::Image,
        Rule::field("advisory_name", Matcher::pattern("RHSA-.*").unwrap()),
    );
    let ctx = context(store.clone())
        .rules(Arc::new(rules))
        .dry_run(true)
        .resolver(Arc::new(StaticResolver(tree())));
    let handler = RebuildImagesOnRpmAdvisory::new(Arc::new(ctx));

    handler
        .handle(&signed("msg-rhba", advisory(1, "RHBA-2017:1", "Critical")))
        .await
        .unwrap();
    assert!(store.list_events(&EventFilter::default()).await.unwrap().is_empty());

    handler
        .handle(&signed("msg-rhsa", advisory(2, "RHSA-2017:2", "Low")))
        .await
        .unwrap();
    assert_eq!(builds_named(&store, "msg-rhsa").await.len(), 5);
}

#[tokio::test]
async fn finished_builds_of_unreleased_events_are_reused() {
    let store = Arc::new(MemoryStore::new());
    let ctx = Arc::new(
        context(store.clone())
            .dry_run(true)
            .resolver(Arc::new(StaticResolver(tree()))),
    );
    let dispatcher = Dispatcher::new(default_handlers(ctx));

    dispatcher
        .process(signed("msg-1", advisory(1, "RHSA-2017:1", "Critical")))
        .await
        .unwrap();
    dispatcher
        .process(signed("msg-2", advisory(2, "RHSA-2017:2", "Critical")))
        .await
        .unwrap();

    assert_eq!(builds_named(&store, "msg-1").await.len(), 5);
    assert!(builds_named(&store, "msg-2").await.is_empty());
}

#[tokio::test]
async fn unfinished_builds_of_unreleased_events_are_rebuilt() {
    let store = Arc::new(MemoryStore::new());
    let ctx = context(store.clone())
        .dry_run(true)
        .resolver(Arc::new(StaticResolver(tree())));
    let handler = RebuildImagesOnRpmAdvisory::new(Arc::new(ctx));

    // Without the dispatcher the synthetic task events are not followed,
    // so msg-1 stops with base building and its dependents planned.
    handler
        .handle(&signed("msg-1", advisory(1, "RHSA-2017:1", "Critical")))
        .await
        .unwrap();
    handler
        .handle(&signed("msg-2", advisory(2, "RHSA-2017:2", "Critical")))
        .await
        .unwrap();

    let builds = builds_named(&store, "msg-2").await;
    let mut names: Vec<&str> = builds.iter().map(|b| b.name.as_str()).collect();
    names.sort();
    // "broken" failed in msg-1 and stays covered by it.
    assert_eq!(names, vec!["app1", "app1-ext", "app2", "base"]);
    assert_eq!(find(&builds, "app1").dep_on, Some(find(&builds, "base").id));
}

#[tokio::test]
async fn manual_rebuild_restricts_to_requested_images() {
    let store = Arc::new(MemoryStore::new());
    let ctx = context(store.clone())
        .dry_run(true)
        .resolver(Arc::new(StaticResolver(tree())));
    let handler = RebuildImagesOnRpmAdvisory::new(Arc::new(ctx));

    let event = InboundEvent::ManualRebuild {
        message_id: "manual-1".to_string(),
        advisory: advisory(1, "RHSA-2017:1", "Critical"),
        images: vec!["app2".to_string()],
    };
    handler.handle(&event).await.unwrap();

    let mut names: Vec<String> = builds_named(&store, "manual-1")
        .await
        .into_iter()
        .map(|b| b.name)
        .collect();
    names.sort();
    assert_eq!(names, vec!["app2", "base"]);
}

#[tokio::test]
async fn compose_gates_submission() {
    let store = Arc::new(MemoryStore::new());
    let submitter = Arc::new(RecordingSubmitter::default());
    let ctx = Arc::new(
        context(store.clone())
            .resolver(Arc::new(StaticResolver(tree())))
            .submitter(submitter.clone())
            .composes(Arc::new(FixedCompose)),
    );
    let dispatcher = Dispatcher::new(default_handlers(ctx));

    dispatcher
        .process(signed("msg-1", advisory(123, "RHSA-2017:123", "Critical")))
        .await
        .unwrap();
    let events = store.find_events_by_compose_id(5).await.unwrap();
    assert_eq!(events.len(), 1);
    assert!(submitter.names().is_empty());
    assert!(
        store
            .builds_for_event(events[0].id)
            .await
            .unwrap()
            .iter()
            .all(|b| b.state != BuildState::Build)
    );

    dispatcher
        .process(InboundEvent::ComposeStateChanged {
            message_id: "compose-5".to_string(),
            compose_id: 5,
            state: ComposeState::Done,
        })
        .await
        .unwrap();
    let submitted = submitter.submitted.lock().unwrap().clone();
    assert_eq!(
        submitted,
        vec![("base".to_string(), vec!["http://composes/5/compose.repo".to_string()])]
    );
}

#[tokio::test]
async fn unusable_compose_leaves_builds_planned() {
    let store = Arc::new(MemoryStore::new());
    let submitter = Arc::new(RecordingSubmitter::default());
    let ctx = Arc::new(
        context(store.clone())
            .resolver(Arc::new(StaticResolver(tree())))
            .submitter(submitter.clone())
            .composes(Arc::new(FixedCompose)),
    );
    RebuildImagesOnRpmAdvisory::new(ctx.clone())
        .handle(&signed("msg-1", advisory(123, "RHSA-2017:123", "Critical")))
        .await
        .unwrap();

    let handler = ComposeDoneHandler::new(ctx);
    for state in [ComposeState::Failed, ComposeState::Expired] {
        let follow_ups = handler
            .handle(&InboundEvent::ComposeStateChanged {
                message_id: "compose-5".to_string(),
                compose_id: 5,
                state,
            })
            .await
            .unwrap();
        assert!(follow_ups.is_empty());
    }
    assert!(submitter.names().is_empty());
    let builds = builds_named(&store, "msg-1").await;
    assert_eq!(find(&builds, "base").state, BuildState::Planned);
}

// ---------------------------------------------------------------------------
// Whole chains
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dry_run_chain_completes_tree() {
    let store = Arc::new(MemoryStore::new());
    let ctx = Arc::new(
        context(store.clone())
            .dry_run(true)
            .tracker(Arc::new(StaticTracker(vec![advisory(123, "RHSA-2017:123", "Critical")])))
            .resolver(Arc::new(StaticResolver(tree()))),
    );
    let dispatcher = Dispatcher::new(default_handlers(ctx));

    // state change -> rpms signed -> one closed task per built image
    let dispatched = dispatcher.process(state_changed("REL_PREP")).await.unwrap();
    assert_eq!(dispatched, 2 + 4);

    let builds = builds_named(&store, "msg-state:rpms-signed").await;
    for build in &builds {
        let expected = if build.name == "broken" {
            BuildState::Failed
        } else {
            BuildState::Done
        };
        assert_eq!(build.state, expected, "{}", build.name);
    }
}
