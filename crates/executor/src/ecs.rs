//! Fargate executor: task-definition caching plus run-and-poll supervision.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use aws_sdk_ecs::error::DisplayErrorContext;
use aws_sdk_ecs::types::{
    AssignPublicIp, AwsVpcConfiguration, Compatibility, ContainerDefinition, ContainerOverride,
    CpuArchitecture, KeyValuePair, LaunchType, LogConfiguration, LogDriver, NetworkConfiguration,
    NetworkMode, OsFamily, RepositoryCredentials, RuntimePlatform, TaskOverride,
};
use async_trait::async_trait;
use kiln_state::{BuildState, LogLevel};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::env::{StorageSettings, worker_env};
use crate::resources::{fargate_normalize, parse_cpu_units, parse_memory_mb};
use crate::{AGENT_CONTAINER_NAME, Executor, ExecutorError, TaskSpec};

const STOP_POLL_INTERVAL: Duration = Duration::from_secs(3);
const REGISTER_RACE_BACKOFF: Duration = Duration::from_millis(500);

/// Cluster-level wiring read from the environment at startup.
#[derive(Debug, Clone, Default)]
pub struct EcsConfig {
    pub cluster: String,
    pub region: String,
    pub subnets: Vec<String>,
    pub security_groups: Vec<String>,
    pub execution_role_arn: Option<String>,
    pub task_role_arn: Option<String>,
    pub log_group: Option<String>,
    pub agent_image: String,
    pub agent_image_secret_arn: Option<String>,
    /// Task-definition family prefix; families are keyed
    /// `<prefix>-<arch>-<cpu>-<mem>`.
    pub task_family_prefix: String,
}

/// Runs build tasks as one-shot Fargate tasks.
///
/// Task definitions are materialized once per (arch, cpu, memory) triple and
/// cached by family name for the life of the process.
pub struct EcsExecutor {
    client: aws_sdk_ecs::Client,
    config: EcsConfig,
    storage: StorageSettings,
    controller_url: String,
    // Serializes the cache-miss path so concurrent tasks with the same
    // shape do not race RegisterTaskDefinition.
    families: Mutex<HashSet<String>>,
}

impl EcsExecutor {
    pub fn new(
        client: aws_sdk_ecs::Client,
        config: EcsConfig,
        storage: StorageSettings,
        controller_url: impl Into<String>,
    ) -> Self {
        Self {
            client,
            config,
            storage,
            controller_url: controller_url.into(),
            families: Mutex::new(HashSet::new()),
        }
    }

    /// Ensure a task definition exists for the given shape, returning its
    /// family name.
    async fn ensure_task_definition(
        &self,
        arch: &str,
        cpu: u32,
        memory: u32,
    ) -> Result<String, ExecutorError> {
        let family = format!("{}-{arch}-{cpu}-{memory}", self.config.task_family_prefix);

        let mut families = self.families.lock().await;
        if families.contains(&family) {
            return Ok(family);
        }

        if self.family_exists(&family).await {
            debug!(family, "task definition already registered");
            families.insert(family.clone());
            return Ok(family);
        }

        match self.register_task_definition(&family, arch, cpu, memory).await {
            Ok(()) => {
                info!(family, arch, cpu, memory, "registered task definition");
                families.insert(family.clone());
                Ok(family)
            }
            Err(message) if is_register_race(&message) => {
                // Another registrant got there first; give it a beat and
                // accept its definition.
                tokio::time::sleep(REGISTER_RACE_BACKOFF).await;
                if self.family_exists(&family).await {
                    families.insert(family.clone());
                    Ok(family)
                } else {
                    Err(ExecutorError::Dispatch(message))
                }
            }
            Err(message) => Err(ExecutorError::Dispatch(message)),
        }
    }

    async fn family_exists(&self, family: &str) -> bool {
        match self
            .client
            .describe_task_definition()
            .task_definition(family)
            .send()
            .await
        {
            Ok(out) => out.task_definition().is_some(),
            Err(err) => {
                debug!(family, error = %DisplayErrorContext(&err), "describe missed");
                false
            }
        }
    }

    async fn register_task_definition(
        &self,
        family: &str,
        arch: &str,
        cpu: u32,
        memory: u32,
    ) -> Result<(), String> {
        let mut container = ContainerDefinition::builder()
            .name(AGENT_CONTAINER_NAME)
            .image(&self.config.agent_image)
            .essential(true);
        if let Some(secret) = &self.config.agent_image_secret_arn {
            let credentials = RepositoryCredentials::builder()
                .credentials_parameter(secret)
                .build()
                .map_err(|err| format!("repository credentials: {err}"))?;
            container = container.repository_credentials(credentials);
        }
        if let Some(group) = &self.config.log_group {
            let logs = LogConfiguration::builder()
                .log_driver(LogDriver::Awslogs)
                .options("awslogs-group", group)
                .options("awslogs-region", &self.config.region)
                .options("awslogs-stream-prefix", family)
                .build()
                .map_err(|err| format!("log configuration: {err}"))?;
            container = container.log_configuration(logs);
        }

        let mut request = self
            .client
            .register_task_definition()
            .family(family)
            .network_mode(NetworkMode::Awsvpc)
            .requires_compatibilities(Compatibility::Fargate)
            .cpu(cpu.to_string())
            .memory(memory.to_string())
            .runtime_platform(
                RuntimePlatform::builder()
                    .cpu_architecture(cpu_architecture(arch))
                    .operating_system_family(OsFamily::Linux)
                    .build(),
            )
            .container_definitions(container.build());
        if let Some(role) = &self.config.execution_role_arn {
            request = request.execution_role_arn(role);
        }
        if let Some(role) = &self.config.task_role_arn {
            request = request.task_role_arn(role);
        }

        request
            .send()
            .await
            .map(|_| ())
            .map_err(|err| format!("register task definition: {}", DisplayErrorContext(&err)))
    }

    async fn run_task(
        &self,
        family: &str,
        task: &TaskSpec<'_>,
    ) -> Result<String, ExecutorError> {
        let environment: Vec<KeyValuePair> = worker_env(task, &self.storage, &self.controller_url)
            .into_iter()
            .map(|(name, value)| KeyValuePair::builder().name(name).value(value).build())
            .collect();

        let vpc = AwsVpcConfiguration::builder()
            .set_subnets(Some(self.config.subnets.clone()))
            .set_security_groups(Some(self.config.security_groups.clone()))
            .assign_public_ip(AssignPublicIp::Enabled)
            .build()
            .map_err(|err| ExecutorError::Dispatch(format!("network configuration: {err}")))?;

        let overrides = TaskOverride::builder()
            .container_overrides(
                ContainerOverride::builder()
                    .name(AGENT_CONTAINER_NAME)
                    .set_environment(Some(environment))
                    .build(),
            )
            .build();

        let out = self
            .client
            .run_task()
            .cluster(&self.config.cluster)
            .task_definition(family)
            .launch_type(LaunchType::Fargate)
            .platform_version("LATEST")
            .count(1)
            .network_configuration(NetworkConfiguration::builder().awsvpc_configuration(vpc).build())
            .overrides(overrides)
            .send()
            .await
            .map_err(|err| {
                ExecutorError::Dispatch(format!("run task: {}", DisplayErrorContext(&err)))
            })?;

        if let Some(arn) = out.tasks().first().and_then(|t| t.task_arn()) {
            return Ok(arn.to_string());
        }
        let reasons: Vec<String> = out
            .failures()
            .iter()
            .map(|f| f.reason().unwrap_or("unknown").to_string())
            .collect();
        Err(ExecutorError::Dispatch(format!(
            "run task returned no task: {}",
            reasons.join(", ")
        )))
    }

    /// Poll until the task stops, then derive success from the agent
    /// container's exit code.
    async fn wait_for_stop(
        &self,
        state: &BuildState,
        task_id: &str,
        arn: &str,
    ) -> Result<(), ExecutorError> {
        loop {
            tokio::time::sleep(STOP_POLL_INTERVAL).await;

            let described = match self
                .client
                .describe_tasks()
                .cluster(&self.config.cluster)
                .tasks(arn)
                .send()
                .await
            {
                Ok(out) => out,
                Err(err) => {
                    warn!(task = task_id, error = %DisplayErrorContext(&err), "describe failed, retrying");
                    continue;
                }
            };

            let Some(remote) = described.tasks().first() else {
                return Err(ExecutorError::Lost(format!(
                    "task {task_id}: {arn} disappeared from the cluster"
                )));
            };

            let status = remote.last_status().unwrap_or("UNKNOWN");
            debug!(task = task_id, status, "fargate task status");
            if status != "STOPPED" {
                continue;
            }

            let exit_code = remote
                .containers()
                .iter()
                .find(|c| c.name() == Some(AGENT_CONTAINER_NAME))
                .and_then(|c| c.exit_code());
            return match exit_code {
                Some(0) => {
                    state.append_log(
                        LogLevel::Info,
                        format!("task {task_id}: remote container exited cleanly"),
                    );
                    Ok(())
                }
                Some(code) => Err(ExecutorError::Remote(format!(
                    "task {task_id}: agent container exited with code {code}"
                ))),
                None => Err(ExecutorError::Remote(format!(
                    "task {task_id}: task stopped without an exit code: {}",
                    remote.stopped_reason().unwrap_or("no reason reported")
                ))),
            };
        }
    }

    /// Deregister every task definition this process registered. Invoked on
    /// shutdown when `CLEANUP_ECS_TASK_DEFINITIONS` is set.
    pub async fn cleanup_task_definitions(&self) {
        let families: Vec<String> = self.families.lock().await.drain().collect();
        for family in families {
            let described = match self
                .client
                .describe_task_definition()
                .task_definition(&family)
                .send()
                .await
            {
                Ok(out) => out,
                Err(err) => {
                    warn!(family, error = %DisplayErrorContext(&err), "cleanup describe failed");
                    continue;
                }
            };
            let Some(arn) = described
                .task_definition()
                .and_then(|td| td.task_definition_arn())
            else {
                continue;
            };
            match self
                .client
                .deregister_task_definition()
                .task_definition(arn)
                .send()
                .await
            {
                Ok(_) => info!(family, "deregistered task definition"),
                Err(err) => {
                    warn!(family, error = %DisplayErrorContext(&err), "deregister failed");
                }
            }
        }
    }
}

#[async_trait]
impl Executor for EcsExecutor {
    async fn dispatch(
        &self,
        state: Arc<BuildState>,
        task: TaskSpec<'_>,
    ) -> Result<(), ExecutorError> {
        let cpu = parse_cpu_units(&task.config.cpu)?;
        let memory = parse_memory_mb(&task.config.memory)?;
        let (cpu, memory) = fargate_normalize(cpu, memory);

        let family = self
            .ensure_task_definition(&task.config.arch, cpu, memory)
            .await?;
        let arn = self.run_task(&family, &task).await?;
        state.set_task_handle(task.task_id, &arn);
        info!(build = task.build_id, task = task.task_id, %arn, "fargate task started");
        state.append_log(
            LogLevel::Info,
            format!("task {}: fargate task dispatched ({family})", task.task_id),
        );

        self.wait_for_stop(&state, task.task_id, &arn).await
    }
}

fn cpu_architecture(arch: &str) -> CpuArchitecture {
    match arch {
        "arm64" | "arm" => CpuArchitecture::Arm64,
        _ => CpuArchitecture::X8664,
    }
}

fn is_register_race(message: &str) -> bool {
    message.contains("Too many concurrent attempts") || message.contains("in use")
}
