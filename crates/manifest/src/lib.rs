//! Build manifest schema and resolution.
//!
//! A manifest carries one `global` block plus a `bake` list of per-target
//! blocks. [`resolve`] merges the two into one [`EffectiveConfig`] per bake
//! entry, in source order.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

pub mod reference;
mod resolve;
mod schema;

pub use resolve::{ResolveDefaults, ResolvedPlan, resolve};
pub use schema::{
    BuildBlock, BuildManifest, CacheBlock, KanikoBlock, Platform, RegistryCredential,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("empty manifest")]
    Empty,

    #[error("invalid manifest yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("manifest has no bake targets")]
    NoTargets,

    #[error("bake entry {index}: target architecture is required")]
    MissingArch { index: usize },

    #[error("bake entry {index}: unknown platform {platform:?}")]
    UnknownPlatform { index: usize, platform: String },
}

/// Parse manifest bytes into the raw YAML document shape.
pub fn parse(bytes: &[u8]) -> Result<BuildManifest, ManifestError> {
    if bytes.is_empty() {
        return Err(ManifestError::Empty);
    }
    Ok(serde_yaml::from_slice(bytes)?)
}

/// Cache knobs for the image builder, merged field by field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheSettings {
    pub enable: Option<bool>,
    pub repo: Option<String>,
    pub ttl: Option<String>,
    pub copy_layers: Option<bool>,
    pub run_layers: Option<bool>,
    pub compressed: Option<bool>,
}

/// The fully-merged build plan for one target. Immutable once resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveConfig {
    pub platform: Platform,
    pub arch: String,
    /// Raw CPU request string; empty when neither manifest nor defaults set it.
    pub cpu: String,
    /// Raw memory request string; empty when neither manifest nor defaults set it.
    pub memory: String,
    pub env: std::collections::BTreeMap<String, String>,
    pub pre_script: Option<String>,
    pub post_script: Option<String>,
    pub credentials: Vec<RegistryCredential>,
    pub context: Option<String>,
    pub dockerfile: Option<String>,
    pub build_args: std::collections::BTreeMap<String, String>,
    /// Per-target push destination. Deliberately not inherited from the
    /// global block: an absent destination marks the global reference as the
    /// multi-arch target.
    pub destination: Option<String>,
    pub cache: CacheSettings,
    pub snapshot_mode: Option<String>,
    pub use_new_run: Option<bool>,
    pub cleanup: Option<bool>,
    pub custom_platform: Option<String>,
    pub no_push: Option<bool>,
    pub ignore_paths: Vec<String>,
    pub extra_flags: Option<String>,
}

impl EffectiveConfig {
    /// Whether this target pushes an image (no-push unset or false).
    pub fn pushes(&self) -> bool {
        !self.no_push.unwrap_or(false)
    }
}
