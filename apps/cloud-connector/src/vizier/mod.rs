//! Orchestrator surface and data-plane health probe.
//!
//! The bridge never talks to the workload orchestrator directly; everything
//! it needs (cluster metadata, workload state, the updater job and secret
//! lifecycle) goes through [`VizierInfo`]. Production uses the HTTP client in
//! [`api`]; tests script the trait.

use std::collections::HashMap;
use std::time::{Instant, SystemTime};

use async_trait::async_trait;
use bridge_proto::{ClusterInfo, PodStatus};
use thiserror::Error;
use uuid::Uuid;

pub mod api;
pub mod health;

#[derive(Debug, Error)]
pub enum VizierError {
    #[error("orchestrator request failed: {0}")]
    Request(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("manifest render failed: {0}")]
    Render(String),
    #[error("cluster id persistence failed: {0}")]
    Persist(String),
}

/// A rendered job manifest, ready to hand to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobManifest {
    pub yaml: String,
}

/// Minimal view of an existing job, enough for the startup probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSummary {
    pub name: String,
}

/// Snapshot of workload state used to populate heartbeats.
#[derive(Debug, Clone, Default)]
pub struct WorkloadState {
    pub pod_statuses: HashMap<String, PodStatus>,
    pub num_nodes: i32,
    pub last_updated: Option<SystemTime>,
}

#[async_trait]
pub trait VizierInfo: Send + Sync {
    /// Externally reachable proxy address and port of this vizier.
    async fn address(&self) -> Result<(String, i32), VizierError>;

    async fn cluster_info(&self) -> Result<ClusterInfo, VizierError>;

    /// Never fails; an unreachable orchestrator yields an empty snapshot.
    async fn workload_state(&self) -> WorkloadState;

    async fn render_job(
        &self,
        template: &str,
        image_tags: &HashMap<String, String>,
        env_substitutions: &HashMap<String, String>,
    ) -> Result<JobManifest, VizierError>;

    async fn launch_job(&self, job: &JobManifest) -> Result<(), VizierError>;

    /// `Ok(None)` means the job does not exist.
    async fn get_job(&self, name: &str) -> Result<Option<JobSummary>, VizierError>;

    /// Blocks until the job terminates; `Ok(true)` on success.
    async fn wait_job_completion(&self, name: &str) -> Result<bool, VizierError>;

    async fn delete_job(&self, name: &str) -> Result<(), VizierError>;

    /// Creates or replaces a named secret.
    async fn create_secret(
        &self,
        name: &str,
        data: HashMap<String, String>,
    ) -> Result<(), VizierError>;

    async fn cluster_uid(&self) -> Result<String, VizierError>;

    /// Persists the cloud-assigned identity so future restarts skip
    /// enrollment.
    async fn persist_cluster_id(&self, id: Uuid) -> Result<(), VizierError>;
}

/// Last data-plane health observation. `observed_at` is `None` until the
/// first probe completes.
#[derive(Debug, Clone, Default)]
pub struct HealthObservation {
    pub observed_at: Option<Instant>,
    pub error: Option<String>,
}

/// Read side of the data-plane health probe. Implementations keep a cached
/// observation current in the background.
pub trait VizierHealthChecker: Send + Sync {
    fn status(&self) -> HealthObservation;
}
