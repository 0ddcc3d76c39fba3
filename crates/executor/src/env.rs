//! The environment contract handed to every worker container.
//!
//! This is the only machine-readable interface between the controller and
//! the worker image: the worker reads its task identity, the context
//! location, the callback endpoints, and every image-builder knob from
//! these variables.

use std::collections::BTreeMap;

use crate::TaskSpec;

/// Object-storage coordinates forwarded to workers so they can fetch the
/// build context. The controller itself never touches the bucket.
#[derive(Debug, Clone, Default)]
pub struct StorageSettings {
    pub endpoint: String,
    pub region: String,
    pub use_ssl: bool,
    pub access_key: String,
    pub secret_key: String,
}

/// Variant tag for architectures that carry one in platform descriptors.
pub fn arch_variant(arch: &str) -> Option<&'static str> {
    match arch {
        "arm64" => Some("v8"),
        "arm" => Some("v7"),
        _ => None,
    }
}

/// Assemble the full worker environment for one task. User-supplied env
/// keys are applied last and win on collision.
pub fn worker_env(
    task: &TaskSpec<'_>,
    storage: &StorageSettings,
    controller_url: &str,
) -> Vec<(String, String)> {
    let config = task.config;
    let mut env = BTreeMap::new();
    let mut set = |key: &str, value: String| {
        env.insert(key.to_string(), value);
    };

    set("BUILD_ID", task.build_id.to_string());
    set("BUILD_TASK_ID", task.task_id.to_string());
    set("TASK_COLOR_INDEX", task.color_index.to_string());
    set("EXECUTOR_PLATFORM", config.platform.to_string());

    // The worker runs natively on the target architecture, so build and
    // target platforms coincide.
    let platform = format!("linux/{}", config.arch);
    for prefix in ["TARGET", "BUILD"] {
        set(&format!("{prefix}PLATFORM"), platform.clone());
        set(&format!("{prefix}OS"), "linux".to_string());
        set(&format!("{prefix}ARCH"), config.arch.clone());
        if let Some(variant) = arch_variant(&config.arch) {
            set(&format!("{prefix}VARIANT"), variant.to_string());
        }
    }

    set("STORAGE_ENDPOINT", storage.endpoint.clone());
    set("STORAGE_REGION", storage.region.clone());
    set("STORAGE_USE_SSL", storage.use_ssl.to_string());
    set("STORAGE_ACCESS_KEY", storage.access_key.clone());
    set("STORAGE_SECRET_KEY", storage.secret_key.clone());
    set("CONTEXT_BUCKET", task.context_bucket.to_string());
    set("CONTEXT_KEY", task.context_key.to_string());
    set("CONTROLLER_URL", controller_url.to_string());
    set("INGEST_URL", task.ingest_url.to_string());

    if let Some(destination) = task.destination {
        set("KANIKO_DESTINATION", destination.to_string());
    }
    if let Some(context) = &config.context {
        set("KANIKO_CONTEXT", context.clone());
    }
    if let Some(dockerfile) = &config.dockerfile {
        set("KANIKO_DOCKERFILE", dockerfile.clone());
    }
    if !config.build_args.is_empty() {
        set(
            "KANIKO_BUILD_ARGS",
            serde_json::to_string(&config.build_args).unwrap_or_default(),
        );
    }
    if !config.credentials.is_empty() {
        set(
            "KANIKO_CREDENTIALS_JSON",
            serde_json::to_string(&config.credentials).unwrap_or_default(),
        );
    }

    let cache = &config.cache;
    if let Some(enable) = cache.enable {
        set("KANIKO_CACHE_ENABLE", enable.to_string());
    }
    if let Some(repo) = &cache.repo {
        set("KANIKO_CACHE_REPO", repo.clone());
    }
    if let Some(ttl) = &cache.ttl {
        set("KANIKO_CACHE_TTL", ttl.clone());
    }
    if let Some(copy_layers) = cache.copy_layers {
        set("KANIKO_CACHE_COPY_LAYERS", copy_layers.to_string());
    }
    if let Some(run_layers) = cache.run_layers {
        set("KANIKO_CACHE_RUN_LAYERS", run_layers.to_string());
    }
    if let Some(compressed) = cache.compressed {
        set("KANIKO_CACHE_COMPRESSED", compressed.to_string());
    }

    if let Some(mode) = &config.snapshot_mode {
        set("KANIKO_SNAPSHOT_MODE", mode.clone());
    }
    if let Some(use_new_run) = config.use_new_run {
        set("KANIKO_USE_NEW_RUN", use_new_run.to_string());
    }
    if let Some(cleanup) = config.cleanup {
        set("KANIKO_CLEANUP", cleanup.to_string());
    }
    if let Some(custom) = &config.custom_platform {
        set("KANIKO_CUSTOM_PLATFORM", custom.clone());
    }
    if let Some(no_push) = config.no_push {
        set("KANIKO_NO_PUSH", no_push.to_string());
    }
    if !config.ignore_paths.is_empty() {
        set("KANIKO_IGNORE_PATH", config.ignore_paths.join(","));
    }
    if let Some(flags) = &config.extra_flags {
        set("KANIKO_EXTRA_FLAGS", flags.clone());
    }
    if let Some(script) = &config.pre_script {
        set("PRE_SCRIPT", script.clone());
    }
    if let Some(script) = &config.post_script {
        set("POST_SCRIPT", script.clone());
    }

    for (key, value) in &config.env {
        env.insert(key.clone(), value.clone());
    }

    env.into_iter().collect()
}
