//! Image reference helpers: tag splitting and per-target destinations.

use crate::EffectiveConfig;

/// Split a reference into base and tag. A single colon separates the two;
/// a colon followed by a path segment (`registry:5000/repo`) is a port, not
/// a tag.
pub fn split_reference(reference: &str) -> (&str, Option<&str>) {
    match reference.rsplit_once(':') {
        Some((base, tag)) if !tag.contains('/') => (base, Some(tag)),
        _ => (reference, None),
    }
}

/// Append `_<suffix>` to the tag component, inserting `latest` when the
/// reference has no tag.
pub fn append_arch_suffix(reference: &str, suffix: &str) -> String {
    let (base, tag) = split_reference(reference);
    format!("{base}:{}_{suffix}", tag.unwrap_or("latest"))
}

/// Where one target pushes its image, as exported to the worker and as
/// re-derived during manifest assembly.
///
/// An explicit per-target destination is used verbatim, except when it
/// collides with the global multi-arch target under duplicate archs. Without
/// one, single-arch builds push straight to the global reference and
/// multi-arch builds push to a suffixed variant of it.
pub fn task_destination(
    config: &EffectiveConfig,
    global_destination: Option<&str>,
    task_id: &str,
    is_single_arch: bool,
    has_duplicate_arch: bool,
) -> Option<String> {
    if let Some(dest) = &config.destination {
        if !is_single_arch && has_duplicate_arch && Some(dest.as_str()) == global_destination {
            return Some(append_arch_suffix(dest, task_id));
        }
        return Some(dest.clone());
    }

    let global = global_destination?;
    if is_single_arch {
        return Some(global.to_string());
    }
    let suffix = if has_duplicate_arch {
        task_id
    } else {
        config.arch.as_str()
    };
    Some(append_arch_suffix(global, suffix))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::{CacheSettings, Platform};

    fn config(arch: &str, destination: Option<&str>) -> EffectiveConfig {
        EffectiveConfig {
            platform: Platform::Ecs,
            arch: arch.to_string(),
            cpu: String::new(),
            memory: String::new(),
            env: Default::default(),
            pre_script: None,
            post_script: None,
            credentials: Vec::new(),
            context: None,
            dockerfile: None,
            build_args: Default::default(),
            destination: destination.map(str::to_string),
            cache: CacheSettings::default(),
            snapshot_mode: None,
            use_new_run: None,
            cleanup: None,
            custom_platform: None,
            no_push: None,
            ignore_paths: Vec::new(),
            extra_flags: None,
        }
    }

    #[test]
    fn suffix_with_tag() {
        assert_eq!(append_arch_suffix("r/a:v1", "amd64"), "r/a:v1_amd64");
    }

    #[test]
    fn suffix_without_tag_inserts_latest() {
        assert_eq!(append_arch_suffix("r/a", "arm64"), "r/a:latest_arm64");
    }

    #[test]
    fn port_is_not_a_tag() {
        assert_eq!(
            append_arch_suffix("reg:5000/a", "amd64"),
            "reg:5000/a:latest_amd64"
        );
        assert_eq!(
            append_arch_suffix("reg:5000/a:v2", "amd64"),
            "reg:5000/a:v2_amd64"
        );
    }

    #[test]
    fn single_arch_pushes_to_global() {
        let cfg = config("amd64", None);
        let dest = task_destination(&cfg, Some("r/a:v1"), "amd64", true, false);
        assert_eq!(dest.as_deref(), Some("r/a:v1"));
    }

    #[test]
    fn multi_arch_suffixes_per_arch() {
        let cfg = config("arm64", None);
        let dest = task_destination(&cfg, Some("r/a:v1"), "arm64", false, false);
        assert_eq!(dest.as_deref(), Some("r/a:v1_arm64"));
    }

    #[test]
    fn duplicate_arch_suffixes_per_task() {
        let cfg = config("amd64", None);
        let dest = task_destination(&cfg, Some("r/a:v1"), "amd64-1", false, true);
        assert_eq!(dest.as_deref(), Some("r/a:v1_amd64-1"));
    }

    #[test]
    fn explicit_destination_wins() {
        let cfg = config("amd64", Some("other/repo:x"));
        let dest = task_destination(&cfg, Some("r/a:v1"), "amd64", false, false);
        assert_eq!(dest.as_deref(), Some("other/repo:x"));
    }

    #[test]
    fn explicit_destination_equal_to_global_still_suffixed_under_duplicates() {
        let cfg = config("amd64", Some("r/a:v1"));
        let dest = task_destination(&cfg, Some("r/a:v1"), "amd64-0", false, true);
        assert_eq!(dest.as_deref(), Some("r/a:v1_amd64-0"));
    }

    #[test]
    fn no_destination_anywhere() {
        let cfg = config("amd64", None);
        assert_eq!(task_destination(&cfg, None, "amd64", false, false), None);
    }

    proptest! {
        // The suffixed reference always ends in `_<suffix>`, and an untagged
        // input gains the `latest` tag.
        #[test]
        fn suffix_always_lands_at_tag_end(
            base in "[a-z0-9./-]{1,40}",
            tag in proptest::option::of("[a-zA-Z0-9._-]{1,16}"),
            suffix in "[a-z0-9-]{1,12}",
        ) {
            let reference = match &tag {
                Some(tag) => format!("{base}:{tag}"),
                None => base.clone(),
            };
            let out = append_arch_suffix(&reference, &suffix);
            let expected_suffix = format!("_{}", suffix);
            prop_assert!(out.ends_with(&expected_suffix));
            if tag.is_none() && !base.contains(':') {
                prop_assert!(out.contains(":latest_"));
            }
        }
    }
}
