//! Raw YAML document shape, before any merging.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

/// Keep explicit `null` distinguishable from a missing key: an absent field
/// stays `None` via `default`, while a present field (null included) lands
/// in `Some`.
fn tri_state<'de, D>(deserializer: D) -> Result<Option<Option<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(Some)
}

/// Execution substrate for a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Platform {
    #[default]
    Ecs,
    K8s,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ecs => "ecs",
            Self::K8s => "k8s",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ecs" => Ok(Self::Ecs),
            "k8s" => Ok(Self::K8s),
            _ => Err(()),
        }
    }
}

/// One registry credential entry, forwarded to the worker verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryCredential {
    pub registry: String,
    pub username: String,
    pub password: String,
}

/// Top-level manifest document: a `global` block and a `bake` list.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BuildManifest {
    pub global: Option<BuildBlock>,
    #[serde(default)]
    pub bake: Vec<BuildBlock>,
}

/// A single block, used both for `global` and for each `bake` entry.
///
/// `pre-script` and `post-script` are tri-state: a missing key inherits the
/// global value, an explicit `null` clears it, and a string overrides it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BuildBlock {
    pub platform: Option<String>,
    pub arch: Option<String>,
    pub cpu: Option<String>,
    pub memory: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "tri_state")]
    pub pre_script: Option<Option<String>>,
    #[serde(default, deserialize_with = "tri_state")]
    pub post_script: Option<Option<String>>,
    pub kaniko: Option<KanikoBlock>,
}

/// Image-builder knobs nested under `kaniko:`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct KanikoBlock {
    pub destination: Option<String>,
    pub context: Option<String>,
    pub dockerfile: Option<String>,
    #[serde(default)]
    pub build_args: BTreeMap<String, String>,
    #[serde(default)]
    pub credentials: Vec<RegistryCredential>,
    pub cache: Option<CacheBlock>,
    pub snapshot_mode: Option<String>,
    pub use_new_run: Option<bool>,
    pub cleanup: Option<bool>,
    pub custom_platform: Option<String>,
    pub no_push: Option<bool>,
    #[serde(default)]
    pub ignore_path: Vec<String>,
    pub extra_flags: Option<String>,
}

/// Layer-cache sub-document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CacheBlock {
    pub enable: Option<bool>,
    pub repo: Option<String>,
    pub ttl: Option<String>,
    pub copy_layers: Option<bool>,
    pub run_layers: Option<bool>,
    pub compressed: Option<bool>,
}
