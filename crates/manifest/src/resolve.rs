//! Merge the global block into each bake entry.

use std::collections::BTreeMap;

use crate::schema::{BuildBlock, BuildManifest, CacheBlock, KanikoBlock, Platform};
use crate::{CacheSettings, EffectiveConfig, ManifestError};

/// Fallback resource requests applied when neither block sets them,
/// sourced from `DEFAULT_BUILD_CPU` / `DEFAULT_BUILD_MEMORY`.
#[derive(Debug, Clone, Default)]
pub struct ResolveDefaults {
    pub cpu: Option<String>,
    pub memory: Option<String>,
}

/// Output of resolution: one config per bake entry, in source order, plus
/// the global destination used as the multi-arch target.
#[derive(Debug, Clone)]
pub struct ResolvedPlan {
    pub configs: Vec<EffectiveConfig>,
    pub global_destination: Option<String>,
}

/// Resolve a parsed manifest into per-target effective configs.
///
/// Fails on a missing arch, an unknown platform, or an empty bake list. No
/// partial plans are emitted.
pub fn resolve(
    manifest: &BuildManifest,
    defaults: &ResolveDefaults,
) -> Result<ResolvedPlan, ManifestError> {
    if manifest.bake.is_empty() {
        return Err(ManifestError::NoTargets);
    }

    let global = manifest.global.clone().unwrap_or_default();
    let global_kaniko = global.kaniko.clone().unwrap_or_default();

    let configs = manifest
        .bake
        .iter()
        .enumerate()
        .map(|(index, bake)| merge_one(index, &global, &global_kaniko, bake, defaults))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ResolvedPlan {
        configs,
        global_destination: global_kaniko.destination,
    })
}

fn merge_one(
    index: usize,
    global: &BuildBlock,
    global_kaniko: &KanikoBlock,
    bake: &BuildBlock,
    defaults: &ResolveDefaults,
) -> Result<EffectiveConfig, ManifestError> {
    let platform_raw = bake
        .platform
        .clone()
        .or_else(|| global.platform.clone())
        .unwrap_or_else(|| Platform::Ecs.as_str().to_string());
    let platform = platform_raw
        .parse::<Platform>()
        .map_err(|()| ManifestError::UnknownPlatform {
            index,
            platform: platform_raw,
        })?;

    let arch = bake
        .arch
        .clone()
        .or_else(|| global.arch.clone())
        .ok_or(ManifestError::MissingArch { index })?;

    let cpu = first_set(&bake.cpu, &global.cpu, &defaults.cpu);
    let memory = first_set(&bake.memory, &global.memory, &defaults.memory);

    let kaniko = bake.kaniko.clone().unwrap_or_default();

    // Credentials and ignore paths replace wholesale: a non-empty bake list
    // wins outright, otherwise the global list is used verbatim.
    let credentials = if kaniko.credentials.is_empty() {
        global_kaniko.credentials.clone()
    } else {
        kaniko.credentials.clone()
    };
    let ignore_paths = if kaniko.ignore_path.is_empty() {
        global_kaniko.ignore_path.clone()
    } else {
        kaniko.ignore_path.clone()
    };

    let cache = merge_cache(global_kaniko.cache.as_ref(), kaniko.cache.as_ref());

    Ok(EffectiveConfig {
        platform,
        arch,
        cpu,
        memory,
        env: merge_maps(&global.env, &bake.env),
        pre_script: tri_state(&bake.pre_script, &global.pre_script),
        post_script: tri_state(&bake.post_script, &global.post_script),
        credentials,
        context: kaniko.context.clone().or_else(|| global_kaniko.context.clone()),
        dockerfile: kaniko
            .dockerfile
            .clone()
            .or_else(|| global_kaniko.dockerfile.clone()),
        build_args: merge_maps(&global_kaniko.build_args, &kaniko.build_args),
        // Intentionally not inherited: an absent per-target destination
        // signals that the global reference is the multi-arch target.
        destination: kaniko.destination.clone(),
        cache,
        snapshot_mode: kaniko
            .snapshot_mode
            .clone()
            .or_else(|| global_kaniko.snapshot_mode.clone()),
        use_new_run: kaniko.use_new_run.or(global_kaniko.use_new_run),
        cleanup: kaniko.cleanup.or(global_kaniko.cleanup),
        custom_platform: kaniko
            .custom_platform
            .clone()
            .or_else(|| global_kaniko.custom_platform.clone()),
        no_push: kaniko.no_push.or(global_kaniko.no_push),
        ignore_paths,
        extra_flags: kaniko
            .extra_flags
            .clone()
            .or_else(|| global_kaniko.extra_flags.clone()),
    })
}

fn first_set(bake: &Option<String>, global: &Option<String>, default: &Option<String>) -> String {
    bake.clone()
        .or_else(|| global.clone())
        .or_else(|| default.clone())
        .unwrap_or_default()
}

fn tri_state(bake: &Option<Option<String>>, global: &Option<Option<String>>) -> Option<String> {
    match bake {
        Some(value) => value.clone(),
        None => global.clone().flatten(),
    }
}

fn merge_maps(
    global: &BTreeMap<String, String>,
    bake: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = global.clone();
    merged.extend(bake.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

/// Cache merge: a bake block without the sub-document inherits the global
/// one wholesale; a present sub-document merges field by field.
fn merge_cache(global: Option<&CacheBlock>, bake: Option<&CacheBlock>) -> CacheSettings {
    let from = |block: &CacheBlock| CacheSettings {
        enable: block.enable,
        repo: block.repo.clone(),
        ttl: block.ttl.clone(),
        copy_layers: block.copy_layers,
        run_layers: block.run_layers,
        compressed: block.compressed,
    };

    match (global, bake) {
        (_, None) => global.map(from).unwrap_or_default(),
        (None, Some(bake)) => from(bake),
        (Some(global), Some(bake)) => CacheSettings {
            enable: bake.enable.or(global.enable),
            repo: bake.repo.clone().or_else(|| global.repo.clone()),
            ttl: bake.ttl.clone().or_else(|| global.ttl.clone()),
            copy_layers: bake.copy_layers.or(global.copy_layers),
            run_layers: bake.run_layers.or(global.run_layers),
            compressed: bake.compressed.or(global.compressed),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse;

    fn resolve_yaml(yaml: &str) -> Result<ResolvedPlan, ManifestError> {
        resolve(&parse(yaml.as_bytes()).unwrap(), &ResolveDefaults::default())
    }

    #[test]
    fn empty_input_is_rejected() {
        assert!(matches!(parse(b""), Err(ManifestError::Empty)));
    }

    #[test]
    fn missing_arch_everywhere_is_fatal() {
        let err = resolve_yaml("bake:\n  - {}\n").unwrap_err();
        assert!(matches!(err, ManifestError::MissingArch { index: 0 }));
    }

    #[test]
    fn empty_bake_list_is_fatal() {
        let err = resolve_yaml("global:\n  arch: amd64\n").unwrap_err();
        assert!(matches!(err, ManifestError::NoTargets));
    }

    #[test]
    fn unknown_platform_is_fatal() {
        let err = resolve_yaml("bake:\n  - arch: amd64\n    platform: lambda\n").unwrap_err();
        assert!(matches!(err, ManifestError::UnknownPlatform { .. }));
    }

    #[test]
    fn single_empty_bake_inherits_global() {
        let plan = resolve_yaml(
            "global:\n  arch: amd64\n  platform: ecs\n  kaniko:\n    destination: \"r/a:v1\"\nbake:\n  - {}\n",
        )
        .unwrap();
        assert_eq!(plan.configs.len(), 1);
        let cfg = &plan.configs[0];
        assert_eq!(cfg.arch, "amd64");
        assert_eq!(cfg.platform, Platform::Ecs);
        // Destination is never inherited per target.
        assert_eq!(cfg.destination, None);
        assert_eq!(plan.global_destination.as_deref(), Some("r/a:v1"));
    }

    #[test]
    fn platform_defaults_to_ecs() {
        let plan = resolve_yaml("bake:\n  - arch: arm64\n").unwrap();
        assert_eq!(plan.configs[0].platform, Platform::Ecs);
    }

    #[test]
    fn env_and_build_args_union_with_bake_precedence() {
        let plan = resolve_yaml(
            "global:\n  arch: amd64\n  env:\n    A: g\n    B: g\n  kaniko:\n    build-args:\n      X: g\nbake:\n  - env:\n      B: b\n      C: b\n    kaniko:\n      build-args:\n        X: b\n        Y: b\n",
        )
        .unwrap();
        let cfg = &plan.configs[0];
        assert_eq!(cfg.env.get("A").unwrap(), "g");
        assert_eq!(cfg.env.get("B").unwrap(), "b");
        assert_eq!(cfg.env.get("C").unwrap(), "b");
        assert_eq!(cfg.build_args.get("X").unwrap(), "b");
        assert_eq!(cfg.build_args.get("Y").unwrap(), "b");
    }

    #[test]
    fn pre_script_tri_state() {
        // Missing inherits, explicit null clears, string overrides.
        let plan = resolve_yaml(
            "global:\n  arch: amd64\n  pre-script: \"echo g\"\nbake:\n  - {}\n  - pre-script: null\n  - pre-script: \"echo b\"\n",
        )
        .unwrap();
        assert_eq!(plan.configs[0].pre_script.as_deref(), Some("echo g"));
        assert_eq!(plan.configs[1].pre_script, None);
        assert_eq!(plan.configs[2].pre_script.as_deref(), Some("echo b"));
    }

    #[test]
    fn credentials_replace_wholesale() {
        let plan = resolve_yaml(
            "global:\n  arch: amd64\n  kaniko:\n    credentials:\n      - registry: g.io\n        username: gu\n        password: gp\n      - registry: g2.io\n        username: gu2\n        password: gp2\nbake:\n  - {}\n  - kaniko:\n      credentials:\n        - registry: b.io\n          username: bu\n          password: bp\n",
        )
        .unwrap();
        assert_eq!(plan.configs[0].credentials.len(), 2);
        assert_eq!(plan.configs[1].credentials.len(), 1);
        assert_eq!(plan.configs[1].credentials[0].registry, "b.io");
    }

    #[test]
    fn cache_inherits_wholesale_when_absent() {
        let plan = resolve_yaml(
            "global:\n  arch: amd64\n  kaniko:\n    cache:\n      enable: true\n      repo: r/cache\n      ttl: 24h\nbake:\n  - {}\n  - kaniko:\n      cache:\n        repo: r/other\n",
        )
        .unwrap();
        let inherited = &plan.configs[0].cache;
        assert_eq!(inherited.enable, Some(true));
        assert_eq!(inherited.repo.as_deref(), Some("r/cache"));
        assert_eq!(inherited.ttl.as_deref(), Some("24h"));

        let merged = &plan.configs[1].cache;
        assert_eq!(merged.enable, Some(true));
        assert_eq!(merged.repo.as_deref(), Some("r/other"));
    }

    #[test]
    fn cpu_memory_fall_back_to_defaults() {
        let manifest = parse(b"global:\n  arch: amd64\n  cpu: \"512\"\nbake:\n  - {}\n").unwrap();
        let defaults = ResolveDefaults {
            cpu: Some("1024".to_string()),
            memory: Some("2048".to_string()),
        };
        let plan = resolve(&manifest, &defaults).unwrap();
        assert_eq!(plan.configs[0].cpu, "512");
        assert_eq!(plan.configs[0].memory, "2048");
    }

    #[test]
    fn bake_order_is_preserved() {
        let plan = resolve_yaml("bake:\n  - arch: amd64\n  - arch: arm64\n  - arch: amd64\n")
            .unwrap();
        let archs: Vec<_> = plan.configs.iter().map(|c| c.arch.as_str()).collect();
        assert_eq!(archs, ["amd64", "arm64", "amd64"]);
    }
}
