//! Plan, fan out, supervise, assemble, finalize.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use kiln_executor::{Executor, TaskSpec};
use kiln_manifest::reference::task_destination;
use kiln_manifest::{
    EffectiveConfig, ManifestError, Platform, RegistryCredential, ResolveDefaults, ResolvedPlan,
};
use kiln_state::{BuildShape, BuildState, LogLevel, Registry};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::assemble::plan_entries;
use crate::push::ManifestPusher;

/// Tunables handed to the orchestrator at startup.
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Public base URL for worker callbacks.
    pub controller_url: String,
    /// Per-task supervision deadline (`BUILD_TASK_TIMEOUT`).
    pub task_timeout: Duration,
    /// Finalizer's bounded wait for the full result set
    /// (`BUILD_RESULT_TIMEOUT`).
    pub result_timeout: Duration,
    pub defaults: ResolveDefaults,
}

/// Owns the build lifecycle: resolves the manifest, fans one supervisor out
/// per target, collects results through the shared [`BuildState`], and
/// finalizes exactly once.
pub struct Orchestrator {
    registry: Arc<Registry>,
    pusher: Arc<dyn ManifestPusher>,
    options: OrchestratorOptions,
    ecs: Option<Arc<dyn Executor>>,
    k8s: Option<Arc<dyn Executor>>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<Registry>,
        pusher: Arc<dyn ManifestPusher>,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            registry,
            pusher,
            options,
            ecs: None,
            k8s: None,
        }
    }

    pub fn with_ecs(mut self, executor: Arc<dyn Executor>) -> Self {
        self.ecs = Some(executor);
        self
    }

    pub fn with_k8s(mut self, executor: Arc<dyn Executor>) -> Self {
        self.k8s = Some(executor);
        self
    }

    /// Validate and launch a build. Validation failures surface here;
    /// everything later flows through the build's log stream.
    pub fn start_build(
        self: &Arc<Self>,
        manifest_bytes: &[u8],
        context_bucket: &str,
        context_key: &str,
        service_name: Option<&str>,
    ) -> Result<(String, Arc<BuildState>), ManifestError> {
        let manifest = kiln_manifest::parse(manifest_bytes)?;
        let plan = kiln_manifest::resolve(&manifest, &self.options.defaults)?;

        let pushing: Vec<&EffectiveConfig> =
            plan.configs.iter().filter(|c| c.pushes()).collect();
        let is_single_arch = pushing.len() <= 1;
        let has_duplicate_arch = {
            let mut seen = HashSet::new();
            pushing.iter().any(|c| !seen.insert(c.arch.as_str()))
        };

        let build_id = generate_build_id(service_name);
        let state = Arc::new(BuildState::new(
            &build_id,
            BuildShape {
                total_tasks: plan.configs.len(),
                is_single_arch,
                has_duplicate_arch,
                global_destination: plan.global_destination.clone(),
            },
        ));
        self.registry.register(state.clone());

        info!(
            build = %build_id,
            tasks = plan.configs.len(),
            single_arch = is_single_arch,
            "build accepted"
        );
        state.append_log(
            LogLevel::Info,
            format!("build {build_id}: {} task(s) planned", plan.configs.len()),
        );

        let task_ids = task_identifiers(&plan.configs);
        let mut supervisors = Vec::with_capacity(plan.configs.len());
        for (index, (config, task_id)) in plan.configs.iter().zip(&task_ids).enumerate() {
            let destination = task_destination(
                config,
                plan.global_destination.as_deref(),
                task_id,
                is_single_arch,
                has_duplicate_arch,
            );
            let handle = tokio::spawn(supervise_task(
                self.clone(),
                state.clone(),
                SupervisedTask {
                    task_id: task_id.clone(),
                    color_index: index,
                    config: config.clone(),
                    destination,
                    context_bucket: context_bucket.to_string(),
                    context_key: context_key.to_string(),
                },
            ));
            supervisors.push((task_id.clone(), handle));
        }

        let orchestrator = self.clone();
        let finalizer_state = state.clone();
        tokio::spawn(async move {
            orchestrator
                .finalize(finalizer_state, plan, task_ids, supervisors)
                .await;
        });

        Ok((build_id, state))
    }

    /// Join every supervisor, enforce the result deadline, assemble when
    /// warranted, and terminate the state exactly once.
    async fn finalize(
        &self,
        state: Arc<BuildState>,
        plan: ResolvedPlan,
        task_ids: Vec<String>,
        supervisors: Vec<(String, JoinHandle<()>)>,
    ) {
        for (task_id, handle) in supervisors {
            if let Err(err) = handle.await {
                let message = if err.is_panic() {
                    format!("task {task_id}: supervisor panicked")
                } else {
                    format!("task {task_id}: supervisor aborted")
                };
                error!(build = %state.id(), task = %task_id, "supervisor did not return cleanly");
                state.append_log(LogLevel::Error, message.clone());
                state.set_error(message);
            }
        }

        if !state.wait_results(self.options.result_timeout).await {
            let message = format!(
                "timeout waiting for agent results ({}/{} received)",
                state.results_received(),
                state.total_tasks()
            );
            warn!(build = %state.id(), "{message}");
            state.append_log(LogLevel::Error, message.clone());
            state.set_error(message);
        }

        if !state.is_single_arch() && !state.has_error() {
            self.assemble(&state, &plan, &task_ids).await;
        }

        state.finish(None);
        info!(build = %state.id(), failed = state.has_error(), "build finalized");
    }

    async fn assemble(&self, state: &BuildState, plan: &ResolvedPlan, task_ids: &[String]) {
        let Some(global) = state.global_destination() else {
            // Every target pushed to an explicit reference; nothing to bind.
            state.append_log(
                LogLevel::Info,
                "no global destination, skipping manifest list",
            );
            return;
        };

        let results = state.results();
        let entries = match plan_entries(
            &plan.configs,
            task_ids,
            &results,
            global,
            state.is_single_arch(),
            state.has_duplicate_arch(),
        ) {
            Ok(entries) => entries,
            Err(err) => {
                let message = format!("manifest assembly failed: {err}");
                state.append_log(LogLevel::Error, message.clone());
                state.set_error(message);
                return;
            }
        };

        state.append_log(
            LogLevel::Info,
            format!("pushing manifest list to {global} ({} entries)", entries.len()),
        );
        let credentials = collect_credentials(&plan.configs);
        if let Err(err) = self.pusher.push_list(global, &entries, &credentials).await {
            let message = format!("manifest list push failed: {err}");
            state.append_log(LogLevel::Error, message.clone());
            state.set_error(message);
        } else {
            state.append_log(LogLevel::Info, format!("manifest list pushed to {global}"));
        }
    }
}

struct SupervisedTask {
    task_id: String,
    color_index: usize,
    config: EffectiveConfig,
    destination: Option<String>,
    context_bucket: String,
    context_key: String,
}

/// One supervisor: pick the executor, dispatch under the task deadline,
/// and record any failure as the build's sticky error. Sibling tasks are
/// never interrupted.
async fn supervise_task(
    orchestrator: Arc<Orchestrator>,
    state: Arc<BuildState>,
    task: SupervisedTask,
) {
    let executor = match task.config.platform {
        Platform::Ecs => orchestrator.ecs.clone(),
        Platform::K8s => orchestrator.k8s.clone(),
    };
    let Some(executor) = executor else {
        let message = format!(
            "task {}: no {} executor configured",
            task.task_id, task.config.platform
        );
        state.append_log(LogLevel::Error, message.clone());
        state.set_error(message);
        return;
    };

    let ingest_url = format!(
        "{}/build/{}/logs/ingest?task={}",
        orchestrator.options.controller_url,
        state.id(),
        task.task_id
    );
    let spec = TaskSpec {
        build_id: state.id(),
        task_id: &task.task_id,
        color_index: task.color_index,
        config: &task.config,
        destination: task.destination.as_deref(),
        context_bucket: &task.context_bucket,
        context_key: &task.context_key,
        ingest_url: &ingest_url,
    };

    let dispatch = executor.dispatch(state.clone(), spec);
    match tokio::time::timeout(orchestrator.options.task_timeout, dispatch).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            let message = err.to_string();
            state.append_log(LogLevel::Error, message.clone());
            state.set_error(message);
        }
        Err(_) => {
            let message = format!(
                "task {}: supervision timed out after {:?}",
                task.task_id, orchestrator.options.task_timeout
            );
            state.append_log(LogLevel::Error, message.clone());
            state.set_error(message);
        }
    }
}

/// Synthetic routing ids: plain `<arch>`, or `<arch>-<index>` as soon as
/// any two targets share an architecture.
pub fn task_identifiers(configs: &[EffectiveConfig]) -> Vec<String> {
    let mut seen = HashSet::new();
    let duplicated = configs.iter().any(|c| !seen.insert(c.arch.as_str()));
    configs
        .iter()
        .enumerate()
        .map(|(index, config)| {
            if duplicated {
                format!("{}-{index}", config.arch)
            } else {
                config.arch.clone()
            }
        })
        .collect()
}

fn collect_credentials(configs: &[EffectiveConfig]) -> Vec<RegistryCredential> {
    let mut seen = HashSet::new();
    let mut credentials = Vec::new();
    for config in configs {
        for credential in &config.credentials {
            if seen.insert(credential.registry.clone()) {
                credentials.push(credential.clone());
            }
        }
    }
    credentials
}

/// `b-<unix-nano>-<4-hex>-<service>` with a service name, else
/// `b-<unix-nano>-<8-hex-uuid>`.
fn generate_build_id(service_name: Option<&str>) -> String {
    let nanos = jiff::Timestamp::now().as_nanosecond();
    match service_name {
        Some(service) if !service.is_empty() => {
            format!("b-{nanos}-{:04x}-{service}", rand::random::<u16>())
        }
        _ => {
            let uuid = uuid::Uuid::new_v4().simple().to_string();
            format!("b-{nanos}-{}", &uuid[..8])
        }
    }
}
