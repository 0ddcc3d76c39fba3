//! Per-build in-memory state.
//!
//! A [`BuildState`] is created at submit time, mutated concurrently by task
//! supervisors, the log-ingest endpoint, and the result endpoint, and
//! terminated exactly once by the orchestrator's finalizer. The [`Registry`]
//! owns every live state, keyed by build id.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

mod build;
mod registry;

pub use build::{BuildShape, BuildState, LOG_CHANNEL_CAPACITY};
pub use registry::Registry;

use serde::{Deserialize, Serialize};

/// Severity of a build log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One line of build output, streamed to the client as JSON-lines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub ts: jiff::Timestamp,
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            ts: jiff::Timestamp::now(),
            level,
            message: message.into(),
        }
    }
}

/// A worker's final report for one task, posted to the result endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    #[serde(default)]
    pub task_id: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub image_digest: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error: String,
}
