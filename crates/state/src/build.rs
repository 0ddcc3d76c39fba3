//! The central per-build record.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};

use crate::{LogEntry, LogLevel, TaskResult};

/// Bound on buffered log lines; overflow is dropped to keep builds live.
pub const LOG_CHANNEL_CAPACITY: usize = 4096;

const RESULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Shape of a build, fixed at submit time.
#[derive(Debug, Clone, Default)]
pub struct BuildShape {
    pub total_tasks: usize,
    /// At most one pushing task.
    pub is_single_arch: bool,
    /// Two pushing tasks share an architecture.
    pub has_duplicate_arch: bool,
    /// The multi-arch target reference from the global block.
    pub global_destination: Option<String>,
}

struct Inner {
    log_tx: Option<mpsc::Sender<LogEntry>>,
    log_rx: Option<mpsc::Receiver<LogEntry>>,
    task_arn_by_id: HashMap<String, String>,
    id_by_task_arn: HashMap<String, String>,
    ingest_started: HashSet<String>,
    ingest_done: HashSet<String>,
    ingest_done_count: usize,
    results: HashMap<String, TaskResult>,
    results_received: usize,
    first_error: Option<String>,
    finished: bool,
    closed: bool,
}

/// Per-build state. One instance per submitted build, shared by reference
/// between the orchestrator, its supervisors, and the HTTP handlers.
///
/// A single read-write lock guards every internal map and counter. The log
/// channel's sender lives under that lock: `finish` takes it, so a producer
/// racing the close observes `None` and drops the line instead of sending on
/// a closed channel.
pub struct BuildState {
    id: String,
    shape: BuildShape,
    inner: RwLock<Inner>,
    done_tx: watch::Sender<bool>,
}

impl BuildState {
    pub fn new(id: impl Into<String>, shape: BuildShape) -> Self {
        let (log_tx, log_rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
        let (done_tx, _) = watch::channel(false);
        Self {
            id: id.into(),
            shape,
            inner: RwLock::new(Inner {
                log_tx: Some(log_tx),
                log_rx: Some(log_rx),
                task_arn_by_id: HashMap::new(),
                id_by_task_arn: HashMap::new(),
                ingest_started: HashSet::new(),
                ingest_done: HashSet::new(),
                ingest_done_count: 0,
                results: HashMap::new(),
                results_received: 0,
                first_error: None,
                finished: false,
                closed: false,
            }),
            done_tx,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn total_tasks(&self) -> usize {
        self.shape.total_tasks
    }

    pub fn is_single_arch(&self) -> bool {
        self.shape.is_single_arch
    }

    pub fn has_duplicate_arch(&self) -> bool {
        self.shape.has_duplicate_arch
    }

    pub fn global_destination(&self) -> Option<&str> {
        self.shape.global_destination.as_deref()
    }

    /// Append one log line. Non-blocking: a full channel drops the entry,
    /// and appends after [`finish`](Self::finish) are no-ops.
    pub fn append_log(&self, level: LogLevel, message: impl Into<String>) {
        let inner = self.inner.read();
        if inner.finished {
            return;
        }
        if let Some(tx) = &inner.log_tx {
            let _ = tx.try_send(LogEntry::new(level, message));
        }
    }

    /// Hand out the single log consumer. Returns `None` once taken.
    pub fn take_log_receiver(&self) -> Option<mpsc::Receiver<LogEntry>> {
        self.inner.write().log_rx.take()
    }

    /// Completion signal; flips to `true` exactly once, inside `finish`.
    pub fn done_rx(&self) -> watch::Receiver<bool> {
        self.done_tx.subscribe()
    }

    /// Link a task id to the executor's opaque handle, both directions.
    pub fn set_task_handle(&self, task_id: &str, handle: &str) {
        let mut inner = self.inner.write();
        inner
            .task_arn_by_id
            .insert(task_id.to_string(), handle.to_string());
        inner
            .id_by_task_arn
            .insert(handle.to_string(), task_id.to_string());
    }

    pub fn handle_for_task(&self, task_id: &str) -> Option<String> {
        self.inner.read().task_arn_by_id.get(task_id).cloned()
    }

    pub fn task_for_handle(&self, handle: &str) -> Option<String> {
        self.inner.read().id_by_task_arn.get(handle).cloned()
    }

    pub fn mark_ingest_started(&self, task_id: &str) {
        self.inner.write().ingest_started.insert(task_id.to_string());
    }

    pub fn ingest_started_for(&self, task_id: &str) -> bool {
        self.inner.read().ingest_started.contains(task_id)
    }

    /// Idempotently mark a task's ingest stream as drained. Returns `true`
    /// only on the transition that completes the last outstanding ingest.
    pub fn mark_ingest_done(&self, task_id: &str) -> bool {
        let mut inner = self.inner.write();
        if !inner.ingest_done.insert(task_id.to_string()) {
            return false;
        }
        inner.ingest_done_count += 1;
        inner.ingest_done_count == self.shape.total_tasks
    }

    pub fn ingest_done_for(&self, task_id: &str) -> bool {
        self.inner.read().ingest_done.contains(task_id)
    }

    /// Record a worker result. The first value for a task id wins: a repeat
    /// with the same digest is a no-op, a repeat with a different digest is
    /// rejected and logged.
    pub fn set_result(
        &self,
        task_id: &str,
        arch: &str,
        image_digest: &str,
        success: bool,
        error: &str,
    ) {
        let mut inner = self.inner.write();
        if let Some(existing) = inner.results.get(task_id) {
            if existing.image_digest == image_digest {
                debug!(build = %self.id, task = task_id, "duplicate result ignored");
                append_locked(
                    &inner,
                    LogLevel::Debug,
                    format!("duplicate result for task {task_id} ignored"),
                );
            } else {
                error!(
                    build = %self.id,
                    task = task_id,
                    have = %existing.image_digest,
                    got = %image_digest,
                    "conflicting duplicate result rejected"
                );
                append_locked(
                    &inner,
                    LogLevel::Error,
                    format!(
                        "conflicting result for task {task_id} rejected: kept {} over {}",
                        existing.image_digest, image_digest
                    ),
                );
            }
            return;
        }

        inner.results.insert(
            task_id.to_string(),
            TaskResult {
                task_id: task_id.to_string(),
                arch: arch.to_string(),
                image_digest: image_digest.to_string(),
                success,
                error: error.to_string(),
            },
        );
        inner.results_received += 1;

        if !success && inner.first_error.is_none() {
            let message = if error.is_empty() {
                format!("task {task_id} reported failure")
            } else {
                format!("task {task_id} failed: {error}")
            };
            inner.first_error = Some(message);
        }
    }

    pub fn result_for(&self, task_id: &str) -> Option<TaskResult> {
        self.inner.read().results.get(task_id).cloned()
    }

    /// Snapshot of all accepted results, keyed by task id.
    pub fn results(&self) -> HashMap<String, TaskResult> {
        self.inner.read().results.clone()
    }

    pub fn results_received(&self) -> usize {
        self.inner.read().results_received
    }

    pub fn all_results_received(&self) -> bool {
        let inner = self.inner.read();
        inner.results_received >= self.shape.total_tasks
    }

    /// Bounded wait for the full result set. Returns whether every expected
    /// callback landed within the deadline.
    pub async fn wait_results(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.all_results_received() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(RESULT_POLL_INTERVAL).await;
        }
    }

    /// Record the first error; later calls are ignored.
    pub fn set_error(&self, error: impl Into<String>) {
        let mut inner = self.inner.write();
        if inner.first_error.is_none() {
            inner.first_error = Some(error.into());
        }
    }

    pub fn error(&self) -> Option<String> {
        self.inner.read().first_error.clone()
    }

    pub fn has_error(&self) -> bool {
        self.inner.read().first_error.is_some()
    }

    pub fn finished(&self) -> bool {
        self.inner.read().finished
    }

    /// Terminal transition: emit the per-task summary and the final verdict
    /// line, then close the log and done channels. Idempotent; only the
    /// first call has any effect.
    pub fn finish(&self, error: Option<String>) {
        let mut inner = self.inner.write();
        if inner.finished {
            return;
        }
        inner.finished = true;

        if let Some(error) = error
            && inner.first_error.is_none()
        {
            inner.first_error = Some(error);
        }

        let task_ids: BTreeSet<String> = inner
            .results
            .keys()
            .chain(inner.task_arn_by_id.keys())
            .cloned()
            .collect();
        for task_id in &task_ids {
            let (level, line) = match inner.results.get(task_id) {
                Some(result) if result.success => (
                    LogLevel::Info,
                    format!("task {task_id}: ok digest={}", result.image_digest),
                ),
                Some(result) => (
                    LogLevel::Error,
                    format!("task {task_id}: failed: {}", result.error),
                ),
                None => (LogLevel::Warn, format!("task {task_id}: no result received")),
            };
            append_locked(&inner, level, line);
        }

        match &inner.first_error {
            None => append_locked(&inner, LogLevel::Info, "BUILD SUCCEEDED"),
            Some(error) => {
                append_locked(&inner, LogLevel::Error, error.clone());
                append_locked(&inner, LogLevel::Error, "BUILD FAILED");
            }
        }

        // Closing: dropping the sender transitions the consumer to EOF once
        // it drains the buffer. Producers racing this see `None` and no-op.
        inner.closed = true;
        let log_tx = inner.log_tx.take();
        drop(inner);
        drop(log_tx);

        let _ = self.done_tx.send(true);
    }
}

fn append_locked(inner: &Inner, level: LogLevel, message: impl Into<String>) {
    if let Some(tx) = &inner.log_tx {
        if tx.try_send(LogEntry::new(level, message)).is_err() {
            warn!("log channel full, dropping entry");
        }
    }
}

impl std::fmt::Debug for BuildState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("BuildState")
            .field("id", &self.id)
            .field("total_tasks", &self.shape.total_tasks)
            .field("results_received", &inner.results_received)
            .field("finished", &inner.finished)
            .field("closed", &inner.closed)
            .field("first_error", &inner.first_error)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(total: usize) -> BuildState {
        BuildState::new(
            "b-test",
            BuildShape {
                total_tasks: total,
                ..Default::default()
            },
        )
    }

    #[test]
    fn duplicate_result_does_not_increment() {
        let st = state(2);
        st.set_result("amd64", "amd64", "sha256:a", true, "");
        st.set_result("amd64", "amd64", "sha256:a", true, "");
        assert_eq!(st.results_received(), 1);
        assert_eq!(st.results().len(), 1);
    }

    #[test]
    fn conflicting_result_keeps_first() {
        let st = state(2);
        st.set_result("amd64", "amd64", "sha256:a", true, "");
        st.set_result("amd64", "amd64", "sha256:b", true, "");
        assert_eq!(st.result_for("amd64").unwrap().image_digest, "sha256:a");
        assert_eq!(st.results_received(), 1);
    }

    #[test]
    fn failed_result_sets_sticky_error() {
        let st = state(1);
        st.set_result("amd64", "amd64", "", false, "exit=1");
        assert!(st.has_error());
        assert_eq!(st.error().unwrap(), "task amd64 failed: exit=1");

        // A later error does not displace it.
        st.set_error("other");
        assert_eq!(st.error().unwrap(), "task amd64 failed: exit=1");
    }

    #[test]
    fn set_error_is_sticky() {
        let st = state(1);
        st.set_error("first");
        st.set_error("second");
        st.set_error("third");
        assert_eq!(st.error().unwrap(), "first");
    }

    #[test]
    fn ingest_done_completes_once() {
        let st = state(2);
        assert!(!st.mark_ingest_done("amd64"));
        assert!(!st.mark_ingest_done("amd64"));
        assert!(st.mark_ingest_done("arm64"));
        assert!(!st.mark_ingest_done("arm64"));
    }

    #[tokio::test]
    async fn finish_is_single_shot_and_closes_logs() {
        let st = state(1);
        let mut rx = st.take_log_receiver().unwrap();
        st.set_result("amd64", "amd64", "sha256:a", true, "");

        st.finish(None);
        st.finish(Some("late".into()));
        assert!(st.error().is_none());

        let mut lines = Vec::new();
        while let Some(entry) = rx.recv().await {
            lines.push(entry.message);
        }
        // Receiver reached EOF, summary precedes verdict.
        assert_eq!(lines.last().unwrap(), "BUILD SUCCEEDED");
        assert!(lines.iter().any(|l| l.contains("task amd64: ok")));
    }

    #[tokio::test]
    async fn finish_failure_emits_error_then_verdict() {
        let st = state(1);
        let mut rx = st.take_log_receiver().unwrap();
        st.finish(Some("task amd64 failed: exit=1".into()));

        let mut lines = Vec::new();
        while let Some(entry) = rx.recv().await {
            lines.push(entry.message);
        }
        assert_eq!(lines.last().unwrap(), "BUILD FAILED");
        assert!(lines.iter().any(|l| l.contains("exit=1")));
    }

    #[tokio::test]
    async fn appends_after_finish_are_dropped() {
        let st = state(1);
        let mut rx = st.take_log_receiver().unwrap();
        st.finish(None);
        st.append_log(LogLevel::Info, "too late");

        let mut lines = Vec::new();
        while let Some(entry) = rx.recv().await {
            lines.push(entry.message);
        }
        assert!(!lines.iter().any(|l| l == "too late"));
    }

    #[tokio::test]
    async fn wait_results_times_out_on_shortfall() {
        let st = state(3);
        st.set_result("a", "amd64", "sha256:a", true, "");
        st.set_result("b", "arm64", "sha256:b", true, "");
        assert!(!st.wait_results(Duration::from_millis(50)).await);
        assert_eq!(st.results_received(), 2);
    }

    #[tokio::test]
    async fn wait_results_returns_once_complete() {
        let st = std::sync::Arc::new(state(1));
        let waiter = st.clone();
        let handle =
            tokio::spawn(async move { waiter.wait_results(Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        st.set_result("amd64", "amd64", "sha256:a", true, "");
        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn done_signal_fires_on_finish() {
        let st = state(0);
        let mut done = st.done_rx();
        assert!(!*done.borrow());
        st.finish(None);
        done.changed().await.unwrap();
        assert!(*done.borrow());
    }

    #[test]
    fn task_handles_map_both_ways() {
        let st = state(1);
        st.set_task_handle("amd64", "arn:aws:ecs:task/123");
        assert_eq!(st.handle_for_task("amd64").unwrap(), "arn:aws:ecs:task/123");
        assert_eq!(st.task_for_handle("arn:aws:ecs:task/123").unwrap(), "amd64");
    }
}
