//! Event deduplication.
//!
//! Before scheduling new builds for an event, find earlier events that are
//! still unreleased and already own builds of the same artifacts. Their
//! builds cover the new event too, so those artifacts need not be rebuilt.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::Result;
use crate::model::{ArtifactBuild, Event};
use crate::store::Store;

/// Distinct unreleased events, other than `current`, owning a build named
/// like one of the `candidates` keys. Order is not significant.
pub async fn find_events_to_include<T>(
    store: &dyn Store,
    current: &Event,
    candidates: &BTreeMap<String, T>,
) -> Result<Vec<Event>> {
    if candidates.is_empty() {
        return Ok(Vec::new());
    }
    let names: BTreeSet<String> = candidates.keys().cloned().collect();
    let mut events = store
        .find_unreleased_events_with_builds(&names, current.id)
        .await?;

    let mut seen = BTreeSet::new();
    events.retain(|e| e.id != current.id && !e.released && seen.insert(e.id));
    Ok(events)
}

/// Builds of one of `events` named like a candidate, keyed by name. When
/// several events own the name, the earliest event's build wins.
pub async fn reused_names<T>(
    store: &dyn Store,
    events: &[Event],
    candidates: &BTreeMap<String, T>,
) -> Result<BTreeMap<String, ArtifactBuild>> {
    let mut reused: BTreeMap<String, ArtifactBuild> = BTreeMap::new();
    for event in events {
        for build in store.builds_for_event(event.id).await? {
            if !candidates.contains_key(&build.name) {
                continue;
            }
            match reused.get(&build.name) {
                Some(covering) if covering.event_id <= build.event_id => {}
                _ => {
                    reused.insert(build.name.clone(), build);
                }
            }
        }
    }
    Ok(reused)
}
