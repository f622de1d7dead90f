//! In-memory storage backend.
//!
//! Events and builds live in append-only arenas; an id is the arena index
//! plus one, so ids stay sequential and stable. Used by tests and dry runs.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{Error, Result};
use crate::model::{ArtifactBuild, BuildId, BuildState, Event, EventId, NewBuild, NewEvent};
use crate::store::{BuildFilter, EventFilter, Store, Transition};

#[derive(Default)]
struct Arena {
    events: Vec<Event>,
    builds: Vec<ArtifactBuild>,
    by_message_id: HashMap<String, EventId>,
}

impl Arena {
    fn event(&self, id: EventId) -> Result<&Event> {
        index(id.0)
            .and_then(|i| self.events.get(i))
            .ok_or_else(|| Error::NotFound(format!("event {id}")))
    }

    fn event_mut(&mut self, id: EventId) -> Result<&mut Event> {
        index(id.0)
            .and_then(|i| self.events.get_mut(i))
            .ok_or_else(|| Error::NotFound(format!("event {id}")))
    }

    fn build(&self, id: BuildId) -> Result<&ArtifactBuild> {
        index(id.0)
            .and_then(|i| self.builds.get(i))
            .ok_or_else(|| Error::NotFound(format!("build {id}")))
    }

    fn build_mut(&mut self, id: BuildId) -> Result<&mut ArtifactBuild> {
        index(id.0)
            .and_then(|i| self.builds.get_mut(i))
            .ok_or_else(|| Error::NotFound(format!("build {id}")))
    }
}

fn index(id: i64) -> Option<usize> {
    usize::try_from(id).ok()?.checked_sub(1)
}

fn next_id(len: usize) -> i64 {
    i64::try_from(len).map_or(i64::MAX, |n| n + 1)
}

/// [`Store`] backed by process memory.
#[derive(Default)]
pub struct MemoryStore {
    arena: Mutex<Arena>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn arena(&self) -> Result<MutexGuard<'_, Arena>> {
        self.arena
            .lock()
            .map_err(|_| Error::Other("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_or_create_event(&self, new: NewEvent) -> Result<Event> {
        let mut arena = self.arena()?;
        if let Some(id) = arena.by_message_id.get(&new.message_id).copied() {
            return arena.event(id).cloned();
        }

        let now = Utc::now();
        let event = Event {
            id: EventId(next_id(arena.events.len())),
            message_id: new.message_id,
            search_key: new.search_key,
            event_type: new.event_type,
            released: new.released,
            compose_id: None,
            created_at: now,
            updated_at: now,
        };
        arena
            .by_message_id
            .insert(event.message_id.clone(), event.id);
        arena.events.push(event.clone());
        Ok(event)
    }

    async fn create_build(&self, new: NewBuild) -> Result<ArtifactBuild> {
        new.validate()?;
        let mut arena = self.arena()?;
        arena.event(new.event_id)?;
        if let Some(parent) = new.dep_on {
            match arena.build(parent) {
                Ok(p) if p.event_id == new.event_id => {}
                Ok(p) => {
                    return Err(Error::ConstraintViolation(format!(
                        "dependency {parent} of {} belongs to event {}, not {}",
                        new.name, p.event_id, new.event_id
                    )));
                }
                Err(_) => {
                    return Err(Error::ConstraintViolation(format!(
                        "dependency {parent} of {} does not exist",
                        new.name
                    )));
                }
            }
        }

        let now = Utc::now();
        let build = ArtifactBuild {
            id: BuildId(next_id(arena.builds.len())),
            event_id: new.event_id,
            name: new.name,
            artifact_type: new.artifact_type,
            completed_at: new.state.is_terminal().then_some(now),
            state: new.state,
            state_reason: new.state_reason,
            build_id: new.build_id,
            build_args: new.build_args,
            dep_on: new.dep_on,
            rebuilt_nvr: new.rebuilt_nvr,
            created_at: now,
            updated_at: now,
        };
        arena.builds.push(build.clone());
        Ok(build)
    }

    async fn mark_released(&self, id: EventId) -> Result<()> {
        let mut arena = self.arena()?;
        let event = arena.event_mut(id)?;
        if !event.released {
            event.released = true;
            event.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn find_unreleased_events_with_builds(
        &self,
        names: &BTreeSet<String>,
        exclude: EventId,
    ) -> Result<Vec<Event>> {
        let arena = self.arena()?;
        let owners: BTreeSet<EventId> = arena
            .builds
            .iter()
            .filter(|b| b.event_id != exclude && names.contains(&b.name))
            .map(|b| b.event_id)
            .collect();
        owners
            .into_iter()
            .map(|id| arena.event(id).cloned())
            .filter(|e| e.as_ref().map_or(true, |e| !e.released))
            .collect()
    }

    async fn get_event(&self, id: EventId) -> Result<Event> {
        self.arena()?.event(id).cloned()
    }

    async fn get_build(&self, id: BuildId) -> Result<ArtifactBuild> {
        self.arena()?.build(id).cloned()
    }

    async fn find_events_by_search_key(&self, search_key: &str) -> Result<Vec<Event>> {
        Ok(self
            .arena()?
            .events
            .iter()
            .filter(|e| e.search_key == search_key)
            .cloned()
            .collect())
    }

    async fn find_events_by_compose_id(&self, compose_id: i64) -> Result<Vec<Event>> {
        Ok(self
            .arena()?
            .events
            .iter()
            .filter(|e| e.compose_id == Some(compose_id))
            .cloned()
            .collect())
    }

    async fn find_build_by_build_id(&self, build_id: i64) -> Result<Option<ArtifactBuild>> {
        // Latest submission wins if an external id was ever reused.
        Ok(self
            .arena()?
            .builds
            .iter()
            .rev()
            .find(|b| b.build_id == Some(build_id))
            .cloned())
    }

    async fn builds_for_event(&self, event_id: EventId) -> Result<Vec<ArtifactBuild>> {
        Ok(self
            .arena()?
            .builds
            .iter()
            .filter(|b| b.event_id == event_id)
            .cloned()
            .collect())
    }

    async fn dependent_builds(&self, parent: BuildId) -> Result<Vec<ArtifactBuild>> {
        Ok(self
            .arena()?
            .builds
            .iter()
            .filter(|b| b.dep_on == Some(parent))
            .cloned()
            .collect())
    }

    async fn set_compose_id(&self, id: EventId, compose_id: i64) -> Result<()> {
        let mut arena = self.arena()?;
        let event = arena.event_mut(id)?;
        event.compose_id = Some(compose_id);
        event.updated_at = Utc::now();
        Ok(())
    }

    async fn transition_build(&self, id: BuildId, transition: Transition) -> Result<ArtifactBuild> {
        let mut arena = self.arena()?;
        let build = arena.build_mut(id)?;
        if !build.state.can_transition_to(transition.to) {
            return Err(Error::InvalidTransition {
                from: build.state,
                to: transition.to,
            });
        }
        if transition.to == BuildState::Failed && transition.reason.is_none() {
            return Err(Error::ConstraintViolation(format!(
                "build {id} cannot fail without a reason"
            )));
        }

        let now = Utc::now();
        build.state = transition.to;
        if transition.reason.is_some() {
            build.state_reason = transition.reason;
        }
        if transition.build_id.is_some() {
            build.build_id = transition.build_id;
        }
        if transition.to.is_terminal() {
            build.completed_at = Some(now);
        }
        build.updated_at = now;
        Ok(build.clone())
    }

    async fn list_events(&self, filter: &EventFilter) -> Result<Vec<Event>> {
        let arena = self.arena()?;
        let events = arena.events.iter().rev().filter(|e| filter.accepts(e));
        Ok(match filter.limit {
            Some(n) => events.take(n).cloned().collect(),
            None => events.cloned().collect(),
        })
    }

    async fn list_builds(&self, filter: &BuildFilter) -> Result<Vec<ArtifactBuild>> {
        let arena = self.arena()?;
        let builds = arena.builds.iter().rev().filter(|b| filter.accepts(b));
        Ok(match filter.limit {
            Some(n) => builds.take(n).cloned().collect(),
            None => builds.cloned().collect(),
        })
    }
}
