//! Controller configuration, read from the process environment.

use std::path::PathBuf;
use std::time::Duration;

use kiln_executor::{EcsConfig, K8sSettings, StorageSettings};
use kiln_manifest::ResolveDefaults;
use thiserror::Error;

const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const DEFAULT_RESULT_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_TASK_FAMILY: &str = "build-agent";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    Missing(&'static str),

    #[error("invalid duration in {name}: {value:?}")]
    InvalidDuration { name: &'static str, value: String },
}

/// Everything the controller reads from its environment at startup.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Public base URL of this controller, handed to workers for callbacks.
    pub controller_url: String,
    /// Bucket holding uploaded build contexts.
    pub context_bucket: String,
    pub storage: StorageSettings,
    pub ecs: EcsConfig,
    pub k8s: K8sSettings,
    /// Explicit kubeconfig path; unset means in-cluster/default inference.
    pub k8s_config_path: Option<PathBuf>,
    pub task_timeout: Duration,
    pub result_timeout: Duration,
    pub defaults: ResolveDefaults,
    pub cleanup_task_definitions: bool,
    /// Shared opaque token for inbound HTTP; unset leaves the API open.
    pub auth_token: Option<String>,
}

impl ControllerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let controller_url = require("CONTROLLER_URL")?;
        let agent_image = require("AGENT_IMAGE")?;
        let context_bucket = require("S3_BUCKET")?;

        let region = var("AWS_REGION").unwrap_or_else(|| "us-east-1".to_string());
        let ecs = EcsConfig {
            cluster: var("ECS_CLUSTER").unwrap_or_default(),
            region: region.clone(),
            subnets: var_list("ECS_SUBNETS"),
            security_groups: var_list("ECS_SECURITY_GROUPS"),
            execution_role_arn: var("ECS_EXEC_ROLE_ARN"),
            task_role_arn: var("ECS_TASK_ROLE_ARN"),
            log_group: var("ECS_LOG_GROUP"),
            agent_image: agent_image.clone(),
            agent_image_secret_arn: var("AGENT_IMAGE_SECRET_ARN"),
            task_family_prefix: var("AGENT_TASK_FAMILY")
                .unwrap_or_else(|| DEFAULT_TASK_FAMILY.to_string()),
        };

        let k8s = K8sSettings {
            namespace: var("K8S_NAMESPACE").unwrap_or_else(|| "default".to_string()),
            agent_image,
            ..Default::default()
        };

        let storage = StorageSettings {
            endpoint: var("S3_ENDPOINT").unwrap_or_default(),
            region: var("S3_REGION").unwrap_or(region),
            use_ssl: var("S3_USE_SSL").is_none_or(|v| is_truthy(&v)),
            access_key: var("S3_ACCESS_KEY").unwrap_or_default(),
            secret_key: var("S3_SECRET_KEY").unwrap_or_default(),
        };

        Ok(Self {
            controller_url,
            context_bucket,
            storage,
            ecs,
            k8s,
            k8s_config_path: var("K8S_CONFIG_PATH").map(PathBuf::from),
            task_timeout: duration_var("BUILD_TASK_TIMEOUT", DEFAULT_TASK_TIMEOUT)?,
            result_timeout: duration_var("BUILD_RESULT_TIMEOUT", DEFAULT_RESULT_TIMEOUT)?,
            defaults: ResolveDefaults {
                cpu: var("DEFAULT_BUILD_CPU"),
                memory: var("DEFAULT_BUILD_MEMORY"),
            },
            cleanup_task_definitions: var("CLEANUP_ECS_TASK_DEFINITIONS")
                .is_some_and(|v| is_truthy(&v)),
            auth_token: var("SERVER_AUTH_TOKEN"),
        })
    }
}

fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

fn require(name: &'static str) -> Result<String, ConfigError> {
    var(name).ok_or(ConfigError::Missing(name))
}

fn var_list(name: &str) -> Vec<String> {
    var(name)
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn is_truthy(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn duration_var(name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match var(name) {
        None => Ok(default),
        Some(value) => parse_duration(&value).ok_or(ConfigError::InvalidDuration {
            name,
            value,
        }),
    }
}

/// Parse `90`, `90s`, `15m`, or `2h` into a duration; bare numbers are
/// seconds.
fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let (number, factor) = if let Some(rest) = value.strip_suffix('s') {
        (rest, 1)
    } else if let Some(rest) = value.strip_suffix('m') {
        (rest, 60)
    } else if let Some(rest) = value.strip_suffix('h') {
        (rest, 3600)
    } else {
        return None;
    };
    let amount = number.parse::<u64>().ok()?;
    Some(Duration::from_secs(amount * factor))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_parse() {
        assert_eq!(parse_duration("90"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("90s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("15m"), Some(Duration::from_secs(900)));
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn truthiness() {
        assert!(is_truthy("true"));
        assert!(is_truthy("1"));
        assert!(is_truthy("YES"));
        assert!(!is_truthy("false"));
        assert!(!is_truthy("0"));
    }
}
