//! Remote execution substrates.
//!
//! An [`Executor`] owns one substrate (Fargate or Kubernetes), runs a single
//! build task on it, and blocks until the remote container terminates. A
//! clean remote exit returns `Ok(())` even when the worker reports a build
//! failure; those arrive through the result callback, not through the
//! executor. Errors signal executor-level anomalies only.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

pub mod env;
mod ecs;
mod k8s;
pub mod resources;

pub use ecs::{EcsConfig, EcsExecutor};
pub use env::StorageSettings;
pub use k8s::{K8sExecutor, K8sSettings};

use std::sync::Arc;

use async_trait::async_trait;
use kiln_manifest::EffectiveConfig;
use kiln_state::BuildState;
use thiserror::Error;

/// Name of the worker container in every task definition and job spec.
pub const AGENT_CONTAINER_NAME: &str = "agent";

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Resources(#[from] resources::ResourceError),

    /// The remote API refused the task.
    #[error("dispatch failed: {0}")]
    Dispatch(String),

    /// The task vanished between dispatch and termination.
    #[error("task lost: {0}")]
    Lost(String),

    /// The task terminated abnormally or its final state was unreadable.
    #[error("{0}")]
    Remote(String),
}

/// One remote build task, as handed to an executor by the orchestrator.
#[derive(Debug, Clone, Copy)]
pub struct TaskSpec<'a> {
    pub build_id: &'a str,
    pub task_id: &'a str,
    /// Ordinal of this task within the build, for worker-side log coloring.
    pub color_index: usize,
    pub config: &'a EffectiveConfig,
    /// Resolved per-task push destination, if this target pushes.
    pub destination: Option<&'a str>,
    pub context_bucket: &'a str,
    pub context_key: &'a str,
    pub ingest_url: &'a str,
}

/// Dispatch one task and block until it terminates remotely.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn dispatch(
        &self,
        state: Arc<BuildState>,
        task: TaskSpec<'_>,
    ) -> Result<(), ExecutorError>;
}
