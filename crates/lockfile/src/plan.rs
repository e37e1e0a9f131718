//! Deterministic plan computation.
//!
//! A `ResolvedPlan` is a pure function of the packet identity, the source
//! tree fingerprint, the resolved pipeline steps, and the embedding model
//! entry; wall clock, environment, and machine never participate.

use crate::error::Result;
use crate::types::{InputsSection, ModelEntry, PacketSection, PipelineStep};
use cpm_packet::{canonical_json_sha256, compute_packet_id, fold_sha256, sha256_file};
use std::collections::BTreeMap;
use std::path::Path;

pub const TREE_HASH_DOMAIN: &str = "cpm.tree.v1";
const RESOLVED_CONFIG_DOMAIN: &str = "cpm.plan.resolved.v1";
const CONFIG_DOMAIN: &str = "cpm.plan.config.v1";

/// Unresolved description of one pipeline step.
#[derive(Debug, Clone)]
pub struct StepSpec {
    pub step: String,
    pub plugin: String,
    /// Version string resolved from the plugin registry; a plugin that
    /// cannot produce one must set `non_deterministic`.
    pub plugin_version: String,
    pub params: serde_json::Value,
    pub non_deterministic: bool,
}

#[derive(Debug, Clone)]
pub struct PlanInvocation {
    pub name: String,
    pub version: String,
    pub build_profile: String,
    /// Normalized (POSIX separators) source path recorded in the identity.
    pub source_path: String,
    pub steps: Vec<StepSpec>,
    pub model: ModelEntry,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPlan {
    pub packet: PacketSection,
    pub inputs: InputsSection,
    pub pipeline: Vec<PipelineStep>,
    pub models: Vec<ModelEntry>,
}

/// Compute the resolved plan for an invocation against a source tree.
pub fn plan(invocation: &PlanInvocation, source_root: &Path) -> Result<ResolvedPlan> {
    let file_hashes = hash_source_tree(source_root)?;
    let tree_hash = fold_tree_hash(&file_hashes);

    let pipeline: Vec<PipelineStep> = invocation
        .steps
        .iter()
        .map(|spec| {
            let config_hash = canonical_json_sha256(&spec.params)?;
            Ok(PipelineStep {
                step: spec.step.clone(),
                plugin: spec.plugin.clone(),
                plugin_version: spec.plugin_version.clone(),
                config_hash,
                params: spec.params.clone(),
                non_deterministic: spec.non_deterministic,
            })
        })
        .collect::<Result<_>>()?;

    // Identity config hash: the fold of per-step config hashes, labelled by
    // step name. The resolved id additionally pins plugin versions and the
    // model revision.
    let config_items: Vec<(String, String)> = pipeline
        .iter()
        .map(|step| (step.step.clone(), step.config_hash.clone()))
        .collect();
    let config_hash = fold_sha256(CONFIG_DOMAIN, &config_items);

    let mut resolved_items = config_items;
    for step in &pipeline {
        resolved_items.push((
            format!("{}#version", step.step),
            step.plugin_version.clone(),
        ));
    }
    resolved_items.push((
        "model#revision".to_string(),
        invocation.model.revision.clone().unwrap_or_default(),
    ));
    let resolved_config_hash = fold_sha256(RESOLVED_CONFIG_DOMAIN, &resolved_items);

    let packet_id = compute_packet_id(
        &invocation.name,
        &invocation.version,
        &invocation.build_profile,
        &invocation.source_path,
        &config_hash,
    );
    let resolved_packet_id = compute_packet_id(
        &invocation.name,
        &invocation.version,
        &invocation.build_profile,
        &invocation.source_path,
        &resolved_config_hash,
    );

    Ok(ResolvedPlan {
        packet: PacketSection {
            name: invocation.name.clone(),
            version: invocation.version.clone(),
            packet_id,
            resolved_packet_id,
            build_profile: invocation.build_profile.clone(),
        },
        inputs: InputsSection {
            tree_hash,
            file_hashes,
        },
        pipeline,
        models: vec![invocation.model.clone()],
    })
}

/// Tuple-sorted `(relpath, sha256(content))` for every regular file under
/// `root`.
pub fn hash_source_tree(root: &Path) -> Result<BTreeMap<String, String>> {
    let mut hashes = BTreeMap::new();
    walk(root, root, &mut hashes)?;
    Ok(hashes)
}

#[must_use]
pub fn fold_tree_hash(file_hashes: &BTreeMap<String, String>) -> String {
    let items: Vec<(String, String)> = file_hashes
        .iter()
        .map(|(path, hash)| (path.clone(), hash.clone()))
        .collect();
    fold_sha256(TREE_HASH_DOMAIN, &items)
}

fn walk(root: &Path, dir: &Path, hashes: &mut BTreeMap<String, String>) -> Result<()> {
    let mut entries: Vec<std::path::PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect();
    entries.sort();
    for path in entries {
        if path.is_dir() {
            walk(root, &path, hashes)?;
        } else if path.is_file() {
            let Ok(relative) = path.strip_prefix(root) else {
                continue;
            };
            let rel: Vec<String> = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            hashes.insert(rel.join("/"), sha256_file(&path)?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_invocation() -> PlanInvocation {
        PlanInvocation {
            name: "demo".into(),
            version: "1.0.0".into(),
            build_profile: "default".into(),
            source_path: "/src".into(),
            steps: vec![
                StepSpec {
                    step: "build".into(),
                    plugin: "cpm:builtin-builder".into(),
                    plugin_version: "0.4.0".into(),
                    params: serde_json::json!({"chunk_tokens": 800, "overlap_tokens": 120}),
                    non_deterministic: false,
                },
                StepSpec {
                    step: "embed".into(),
                    plugin: "cpm:http-embedder".into(),
                    plugin_version: "0.4.0".into(),
                    params: serde_json::json!({"model": "m", "max_seq_length": 1024}),
                    non_deterministic: false,
                },
            ],
            model: ModelEntry {
                provider: "openai-compatible".into(),
                model: "m".into(),
                revision: Some("r1".into()),
                dtype: "f16".into(),
                device_policy: "server".into(),
                normalize: true,
                max_seq_length: Some(1024),
                non_deterministic: false,
            },
        }
    }

    #[test]
    fn plan_is_deterministic_for_identical_inputs() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/a.py"), "print(1)\n").unwrap();
        std::fs::write(dir.path().join("top.md"), "# t\n").unwrap();

        let invocation = sample_invocation();
        let first = plan(&invocation, dir.path()).unwrap();
        let second = plan(&invocation, dir.path()).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.inputs.file_hashes.len(), 2);
        assert!(first.inputs.file_hashes.contains_key("src/a.py"));
    }

    #[test]
    fn content_change_moves_tree_hash_and_nothing_else() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.py"), "print(1)\n").unwrap();
        let invocation = sample_invocation();
        let before = plan(&invocation, dir.path()).unwrap();

        std::fs::write(dir.path().join("a.py"), "print(2)\n").unwrap();
        let after = plan(&invocation, dir.path()).unwrap();

        assert_ne!(before.inputs.tree_hash, after.inputs.tree_hash);
        assert_eq!(before.packet, after.packet);
        assert_eq!(before.pipeline, after.pipeline);
    }

    #[test]
    fn params_change_moves_both_packet_ids() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.py"), "print(1)\n").unwrap();
        let invocation = sample_invocation();
        let before = plan(&invocation, dir.path()).unwrap();

        let mut changed = sample_invocation();
        changed.steps[0].params = serde_json::json!({"chunk_tokens": 400, "overlap_tokens": 120});
        let after = plan(&changed, dir.path()).unwrap();

        assert_ne!(before.packet.packet_id, after.packet.packet_id);
        assert_ne!(
            before.packet.resolved_packet_id,
            after.packet.resolved_packet_id
        );
    }

    #[test]
    fn plugin_version_change_moves_only_resolved_id() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.py"), "print(1)\n").unwrap();
        let before = plan(&sample_invocation(), dir.path()).unwrap();

        let mut changed = sample_invocation();
        changed.steps[0].plugin_version = "0.5.0".into();
        let after = plan(&changed, dir.path()).unwrap();

        assert_eq!(before.packet.packet_id, after.packet.packet_id);
        assert_ne!(
            before.packet.resolved_packet_id,
            after.packet.resolved_packet_id
        );
    }
}
