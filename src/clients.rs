//! Collaborator seams.
//!
//! Freshet talks to a build system, an advisory tracker, a compose service
//! and an image-metadata service. Only their interfaces live here; concrete
//! clients plug in through these traits.

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{Advisory, ArtifactBuild};
use crate::scheduler::Candidate;

/// Finds the images affected by an advisory.
#[async_trait]
pub trait CandidateResolver: Send + Sync {
    /// Candidates grouped by level: level 0 are base images, each later
    /// level builds on the previous one.
    async fn find_images_to_rebuild(&self, advisory: &Advisory) -> Result<Vec<Vec<Candidate>>>;
}

/// Submits builds to the build system.
#[async_trait]
pub trait BuildSubmitter: Send + Sync {
    /// Start a build, returning the external task id.
    async fn submit(&self, build: &ArtifactBuild, repo_urls: &[String]) -> Result<i64>;
}

#[async_trait]
pub trait AdvisoryTracker: Send + Sync {
    /// Advisories referenced by an advisory id, usually exactly one.
    async fn advisories_from_event(&self, advisory_id: i64) -> Result<Vec<Advisory>>;
}

/// A generated compose: a yum repository holding the advisory's packages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Compose {
    pub id: i64,
    pub repo_url: String,
}

#[async_trait]
pub trait ComposeService: Send + Sync {
    async fn request_compose(&self, advisory: &Advisory) -> Result<Compose>;

    async fn repo_url(&self, compose_id: i64) -> Result<String>;
}

/// Stand-in for a collaborator that has not been configured. Every call
/// fails without retrying.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unconfigured;

impl Unconfigured {
    fn err<T>(what: &str) -> Result<T> {
        Err(Error::Collaborator(format!("no {what} configured")))
    }
}

#[async_trait]
impl CandidateResolver for Unconfigured {
    async fn find_images_to_rebuild(&self, _advisory: &Advisory) -> Result<Vec<Vec<Candidate>>> {
        Self::err("candidate resolver")
    }
}

#[async_trait]
impl BuildSubmitter for Unconfigured {
    async fn submit(&self, _build: &ArtifactBuild, _repo_urls: &[String]) -> Result<i64> {
        Self::err("build submitter")
    }
}

#[async_trait]
impl AdvisoryTracker for Unconfigured {
    async fn advisories_from_event(&self, _advisory_id: i64) -> Result<Vec<Advisory>> {
        Self::err("advisory tracker")
    }
}

#[async_trait]
impl ComposeService for Unconfigured {
    async fn request_compose(&self, _advisory: &Advisory) -> Result<Compose> {
        Self::err("compose service")
    }

    async fn repo_url(&self, _compose_id: i64) -> Result<String> {
        Self::err("compose service")
    }
}

/// Pretends to submit builds, handing out ids from a process-local counter.
#[derive(Debug)]
pub struct DryRunSubmitter {
    next_id: AtomicI64,
}

impl DryRunSubmitter {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first_id: i64) -> Self {
        Self {
            next_id: AtomicI64::new(first_id),
        }
    }

    pub fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for DryRunSubmitter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BuildSubmitter for DryRunSubmitter {
    async fn submit(&self, build: &ArtifactBuild, _repo_urls: &[String]) -> Result<i64> {
        let id = self.next_id();
        tracing::info!(build = %build.id, name = %build.name, task_id = id, "dry run: build not submitted");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_collaborators_fail_permanently() {
        let err = AdvisoryTracker::advisories_from_event(&Unconfigured, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Collaborator(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn dry_run_ids_are_sequential() {
        let submitter = DryRunSubmitter::new();
        assert_eq!(submitter.next_id(), 1);
        assert_eq!(submitter.next_id(), 2);
    }
}
