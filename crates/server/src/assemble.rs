//! Plan the manifest list for a finished multi-arch build.

use std::collections::HashMap;

use kiln_executor::env::arch_variant;
use kiln_manifest::EffectiveConfig;
use kiln_manifest::reference::task_destination;
use kiln_state::TaskResult;
use thiserror::Error;

use crate::push::ManifestEntry;

#[derive(Debug, Error)]
pub enum AssembleError {
    #[error("missing results for tasks [{}], have [{}]", expected.join(", "), observed.join(", "))]
    MissingResults {
        expected: Vec<String>,
        observed: Vec<String>,
    },
}

/// Compute the manifest-list entries for every pushing task, re-deriving
/// each task's pushed reference exactly as it was derived at dispatch.
///
/// `task_ids` is parallel to `configs`. Missing results abort the plan with
/// a diagnostic naming both sides.
pub fn plan_entries(
    configs: &[EffectiveConfig],
    task_ids: &[String],
    results: &HashMap<String, TaskResult>,
    global_destination: &str,
    is_single_arch: bool,
    has_duplicate_arch: bool,
) -> Result<Vec<ManifestEntry>, AssembleError> {
    let mut entries = Vec::new();
    let mut missing = Vec::new();

    for (config, task_id) in configs.iter().zip(task_ids) {
        if !config.pushes() {
            continue;
        }
        if !results.contains_key(task_id) {
            missing.push(task_id.clone());
            continue;
        }
        let image = task_destination(
            config,
            Some(global_destination),
            task_id,
            is_single_arch,
            has_duplicate_arch,
        )
        .unwrap_or_else(|| global_destination.to_string());
        entries.push(ManifestEntry {
            image,
            os: "linux".to_string(),
            arch: config.arch.clone(),
            variant: arch_variant(&config.arch).map(str::to_string),
        });
    }

    if !missing.is_empty() {
        let mut observed: Vec<String> = results.keys().cloned().collect();
        observed.sort();
        return Err(AssembleError::MissingResults {
            expected: missing,
            observed,
        });
    }

    Ok(entries)
}
