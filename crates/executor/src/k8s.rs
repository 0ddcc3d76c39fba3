//! Kubernetes executor: one-shot batch jobs with watch-based completion.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, LocalObjectReference, Pod, PodSpec, PodTemplateSpec, ResourceRequirements,
    Toleration,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kiln_state::{BuildState, LogLevel};
use kube::api::{Api, ListParams, PostParams, WatchEvent, WatchParams};
use tracing::{debug, info, warn};

use crate::env::{StorageSettings, worker_env};
use crate::resources::{k8s_cpu_quantity, k8s_memory_quantity, parse_cpu_units, parse_memory_mb};
use crate::{AGENT_CONTAINER_NAME, Executor, ExecutorError, TaskSpec};

/// Hard ceiling on one job's supervision, independent of the outer
/// per-task deadline.
const DISPATCH_DEADLINE: Duration = Duration::from_secs(30 * 60);
/// Observability tick while the watch is quiet.
const WATCH_TICK: Duration = Duration::from_secs(5);
/// Jobs clean themselves up half an hour after finishing.
const JOB_TTL_SECONDS: i32 = 1800;

const RESULT_WAIT: Duration = Duration::from_secs(30);
const INGEST_DRAIN_WAIT: Duration = Duration::from_secs(90);
const SOFT_WAIT_POLL: Duration = Duration::from_millis(100);

/// Server-side job wiring; everything beyond the namespace is optional and
/// defaults to the cluster's own defaults.
#[derive(Debug, Clone)]
pub struct K8sSettings {
    pub namespace: String,
    pub agent_image: String,
    pub service_account: Option<String>,
    pub node_selector: BTreeMap<String, String>,
    /// Taint keys tolerated with `Exists` / `NoSchedule`.
    pub tolerations: Vec<String>,
    pub image_pull_secrets: Vec<String>,
}

impl Default for K8sSettings {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            agent_image: String::new(),
            service_account: None,
            node_selector: BTreeMap::new(),
            tolerations: Vec::new(),
            image_pull_secrets: Vec::new(),
        }
    }
}

/// Runs build tasks as one-shot Kubernetes jobs.
pub struct K8sExecutor {
    client: kube::Client,
    settings: K8sSettings,
    storage: StorageSettings,
    controller_url: String,
}

impl K8sExecutor {
    pub fn new(
        client: kube::Client,
        settings: K8sSettings,
        storage: StorageSettings,
        controller_url: impl Into<String>,
    ) -> Self {
        Self {
            client,
            settings,
            storage,
            controller_url: controller_url.into(),
        }
    }

    fn jobs(&self) -> Api<Job> {
        Api::namespaced(self.client.clone(), &self.settings.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.settings.namespace)
    }

    fn build_job(&self, task: &TaskSpec<'_>) -> Result<Job, ExecutorError> {
        let config = task.config;

        let env: Vec<EnvVar> = worker_env(task, &self.storage, &self.controller_url)
            .into_iter()
            .map(|(name, value)| EnvVar {
                name,
                value: Some(value),
                ..Default::default()
            })
            .collect();

        let cpu = parse_cpu_units(&config.cpu)?;
        let memory = parse_memory_mb(&config.memory)?;
        let resources = (cpu > 0 || memory > 0).then(|| {
            let mut limits = BTreeMap::new();
            if cpu > 0 {
                limits.insert("cpu".to_string(), Quantity(k8s_cpu_quantity(cpu)));
            }
            if memory > 0 {
                limits.insert("memory".to_string(), Quantity(k8s_memory_quantity(memory)));
            }
            ResourceRequirements {
                requests: Some(limits.clone()),
                limits: Some(limits),
                ..Default::default()
            }
        });

        let mut node_selector = self.settings.node_selector.clone();
        node_selector
            .entry("kubernetes.io/arch".to_string())
            .or_insert_with(|| config.arch.clone());

        let tolerations: Vec<Toleration> = self
            .settings
            .tolerations
            .iter()
            .map(|key| Toleration {
                key: Some(key.clone()),
                operator: Some("Exists".to_string()),
                effect: Some("NoSchedule".to_string()),
                ..Default::default()
            })
            .collect();

        let image_pull_secrets: Vec<LocalObjectReference> = self
            .settings
            .image_pull_secrets
            .iter()
            .map(|name| LocalObjectReference {
                name: name.clone(),
            })
            .collect();

        let labels: BTreeMap<String, String> = [
            ("kiln/build".to_string(), sanitize_name(task.build_id)),
            ("kiln/task".to_string(), sanitize_name(task.task_id)),
            ("kiln/arch".to_string(), sanitize_name(&config.arch)),
        ]
        .into();

        Ok(Job {
            metadata: ObjectMeta {
                generate_name: Some(job_name_prefix(task.build_id, task.task_id)),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(JobSpec {
                backoff_limit: Some(0),
                ttl_seconds_after_finished: Some(JOB_TTL_SECONDS),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        restart_policy: Some("Never".to_string()),
                        service_account_name: self.settings.service_account.clone(),
                        node_selector: Some(node_selector),
                        tolerations: (!tolerations.is_empty()).then_some(tolerations),
                        image_pull_secrets: (!image_pull_secrets.is_empty())
                            .then_some(image_pull_secrets),
                        containers: vec![Container {
                            name: AGENT_CONTAINER_NAME.to_string(),
                            image: Some(self.settings.agent_image.clone()),
                            env: Some(env),
                            resources,
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    /// Watch the named job until a terminal condition lands. Returns the
    /// job-level error, if any. A watch that closes without a verdict falls
    /// back to a one-shot get before re-watching.
    async fn supervise(&self, name: &str, task_id: &str) -> Option<String> {
        let jobs = self.jobs();
        let deadline = tokio::time::sleep(DISPATCH_DEADLINE);
        tokio::pin!(deadline);
        let mut ticker = tokio::time::interval(WATCH_TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let params = WatchParams::default()
                .fields(&format!("metadata.name={name}"))
                .timeout(290);
            let mut stream = match jobs.watch(&params, "0").await {
                Ok(stream) => stream.boxed(),
                Err(err) => {
                    warn!(job = name, error = %err, "job watch failed, probing directly");
                    match self.probe_job(&jobs, name).await {
                        Ok(Some(outcome)) => return outcome,
                        Ok(None) => {
                            tokio::time::sleep(WATCH_TICK).await;
                            continue;
                        }
                        Err(message) => return Some(message),
                    }
                }
            };

            loop {
                tokio::select! {
                    () = &mut deadline => {
                        return Some(format!("task {task_id}: job supervision deadline exceeded"));
                    }
                    _ = ticker.tick() => {
                        debug!(job = name, task = task_id, "job still running");
                    }
                    event = stream.try_next() => match event {
                        Ok(Some(WatchEvent::Modified(job) | WatchEvent::Deleted(job))) => {
                            if let Some(outcome) = job_outcome(&job) {
                                return outcome;
                            }
                        }
                        Ok(Some(WatchEvent::Added(_) | WatchEvent::Bookmark(_))) => {}
                        Ok(Some(WatchEvent::Error(err))) => {
                            warn!(job = name, error = %err, "watch error event");
                        }
                        Ok(None) => {
                            // Stream expired without a verdict.
                            match self.probe_job(&jobs, name).await {
                                Ok(Some(outcome)) => return outcome,
                                Ok(None) => break,
                                Err(message) => return Some(message),
                            }
                        }
                        Err(err) => {
                            warn!(job = name, error = %err, "watch stream error");
                            match self.probe_job(&jobs, name).await {
                                Ok(Some(outcome)) => return outcome,
                                Ok(None) => break,
                                Err(message) => return Some(message),
                            }
                        }
                    }
                }
            }
        }
    }

    /// One-shot get + condition inspection. `Ok(Some(..))` is a terminal
    /// verdict, `Ok(None)` means the job is still running.
    async fn probe_job(
        &self,
        jobs: &Api<Job>,
        name: &str,
    ) -> Result<Option<Option<String>>, String> {
        match jobs.get(name).await {
            Ok(job) => Ok(job_outcome(&job)),
            Err(err) => Err(format!("job {name}: final-state probe failed: {err}")),
        }
    }

    /// List the job's pods and derive success from the agent container's
    /// terminated exit code.
    async fn inspect_exit(
        &self,
        state: &BuildState,
        task_id: &str,
        name: &str,
    ) -> Result<(), ExecutorError> {
        let params = ListParams::default().labels(&format!("job-name={name}"));
        let pods = self
            .pods()
            .list(&params)
            .await
            .map_err(|err| ExecutorError::Remote(format!("task {task_id}: pod list: {err}")))?;

        let Some(pod) = pods.items.first() else {
            return Err(ExecutorError::Lost(format!(
                "task {task_id}: no pods found for job {name}"
            )));
        };

        let phase = pod
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or("Unknown");
        if phase == "Pending" || phase == "Unknown" {
            return Err(ExecutorError::Remote(format!(
                "task {task_id}: pod never started (phase {phase})"
            )));
        }

        let terminated = pod
            .status
            .as_ref()
            .and_then(|s| s.container_statuses.as_ref())
            .and_then(|statuses| statuses.iter().find(|c| c.name == AGENT_CONTAINER_NAME))
            .and_then(|c| c.state.as_ref())
            .and_then(|s| s.terminated.as_ref());

        match terminated {
            Some(t) if t.exit_code == 0 => {
                state.append_log(
                    LogLevel::Info,
                    format!("task {task_id}: remote container exited cleanly"),
                );
                Ok(())
            }
            Some(t) => Err(ExecutorError::Remote(format!(
                "task {task_id}: agent container exited with code {} ({})",
                t.exit_code,
                t.reason.as_deref().unwrap_or("no reason")
            ))),
            None => Err(ExecutorError::Remote(format!(
                "task {task_id}: agent container never reached a terminated state"
            ))),
        }
    }

    /// Soft waits: give the worker a window to post its result and for the
    /// ingest stream to drain before the supervisor returns.
    async fn drain_task(&self, state: &BuildState, task_id: &str) {
        if !wait_until(RESULT_WAIT, || state.result_for(task_id).is_some()).await {
            warn!(task = task_id, "result callback not received in time");
            state.append_log(
                LogLevel::Warn,
                format!("task {task_id}: result callback still outstanding"),
            );
        }
        if !wait_until(INGEST_DRAIN_WAIT, || state.ingest_done_for(task_id)).await {
            warn!(task = task_id, "log ingest did not finish in time");
        }
        state.mark_ingest_done(task_id);
    }
}

#[async_trait]
impl Executor for K8sExecutor {
    async fn dispatch(
        &self,
        state: Arc<BuildState>,
        task: TaskSpec<'_>,
    ) -> Result<(), ExecutorError> {
        let job = self.build_job(&task)?;
        let created = self
            .jobs()
            .create(&PostParams::default(), &job)
            .await
            .map_err(|err| ExecutorError::Dispatch(format!("create job: {err}")))?;
        let name = created
            .metadata
            .name
            .clone()
            .ok_or_else(|| ExecutorError::Dispatch("created job has no name".to_string()))?;

        state.set_task_handle(task.task_id, &name);
        info!(build = task.build_id, task = task.task_id, job = %name, "kubernetes job created");
        state.append_log(
            LogLevel::Info,
            format!("task {}: kubernetes job {name} created", task.task_id),
        );

        let job_error = self.supervise(&name, task.task_id).await;
        let exit = self.inspect_exit(&state, task.task_id, &name).await;

        self.drain_task(&state, task.task_id).await;

        match (exit, job_error) {
            (Err(err), _) => Err(err),
            (Ok(()), Some(message)) => Err(ExecutorError::Remote(message)),
            (Ok(()), None) => Ok(()),
        }
    }
}

/// Inspect job conditions. `None` = not terminal; `Some(None)` = complete;
/// `Some(Some(reason))` = failed.
fn job_outcome(job: &Job) -> Option<Option<String>> {
    let conditions = job.status.as_ref()?.conditions.as_ref()?;
    for condition in conditions {
        if condition.status != "True" {
            continue;
        }
        match condition.type_.as_str() {
            "Complete" => return Some(None),
            "Failed" => {
                let reason = condition
                    .reason
                    .as_deref()
                    .or(condition.message.as_deref())
                    .unwrap_or("unknown");
                return Some(Some(format!("job failed: {reason}")));
            }
            _ => {}
        }
    }
    None
}

async fn wait_until(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(SOFT_WAIT_POLL).await;
    }
}

/// Job names must be DNS-safe and leave room for the server's random
/// suffix.
fn job_name_prefix(build_id: &str, task_id: &str) -> String {
    let raw = format!("build-{}-{}", sanitize_name(build_id), sanitize_name(task_id));
    let mut prefix = raw;
    prefix.truncate(52);
    let trimmed = prefix.trim_end_matches('-').to_string();
    format!("{trimmed}-")
}

fn sanitize_name(value: &str) -> String {
    let sanitized: String = value
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    sanitized.trim_matches('-').to_string()
}
