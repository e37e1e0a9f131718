//! Lockfile engine: plan → render → write → verify.

pub mod error;
pub mod plan;
pub mod types;
pub mod verify;

pub use error::{LockfileError, Result};
pub use plan::{fold_tree_hash, hash_source_tree, plan, PlanInvocation, ResolvedPlan, StepSpec};
pub use types::{
    ArtifactsSection, InputsSection, Lockfile, ModelEntry, PacketSection, PipelineStep,
    ResolutionSection, LOCKFILE_VERSION,
};
pub use verify::{frozen_violations, plan_mismatches, verify, TierReport, VerifyReport};

use cpm_packet::{sha256_file, DOCS_FILE, INDEX_FILE, MANIFEST_FILE, VECTORS_FILE};
use std::path::Path;

/// Materialize a lockfile from a resolved plan and artifact hashes.
#[must_use]
pub fn render(
    plan: &ResolvedPlan,
    artifacts: ArtifactsSection,
    generated_at: String,
    cpm_version: &str,
    warnings: Vec<String>,
) -> Lockfile {
    Lockfile {
        lockfile_version: LOCKFILE_VERSION,
        packet: plan.packet.clone(),
        inputs: plan.inputs.clone(),
        pipeline: plan.pipeline.clone(),
        models: plan.models.clone(),
        artifacts,
        resolution: ResolutionSection {
            generated_at,
            cpm_version: cpm_version.to_string(),
            warnings,
        },
    }
}

/// Canonical JSON, written atomically (`<path>.tmp` + rename).
pub fn write(lockfile: &Lockfile, path: &Path) -> Result<()> {
    cpm_packet::write_canonical_json(path, lockfile)?;
    Ok(())
}

pub fn load(path: &Path) -> Result<Lockfile> {
    if !path.exists() {
        return Err(LockfileError::NotFound(path.display().to_string()));
    }
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

/// Hash the built packet's artifacts by the filename convention
/// (`docs.jsonl` → chunks, `vectors.f16.bin` → embeddings, the flat index,
/// `manifest.json`). Optional artifacts that are absent stay `None`.
pub fn artifact_hashes_from_dir(packet_dir: &Path) -> Result<ArtifactsSection> {
    let required = |rel: &str| -> Result<String> {
        let path = packet_dir.join(rel);
        if !path.exists() {
            return Err(LockfileError::NotFound(path.display().to_string()));
        }
        Ok(sha256_file(&path)?)
    };
    let optional = |rel: &str| -> Result<Option<String>> {
        let path = packet_dir.join(rel);
        if path.exists() {
            Ok(Some(sha256_file(&path)?))
        } else {
            Ok(None)
        }
    };

    Ok(ArtifactsSection {
        chunks_manifest_hash: required(DOCS_FILE)?,
        embeddings_hash: optional(VECTORS_FILE)?,
        index_hash: optional(INDEX_FILE)?,
        packet_manifest_hash: required(MANIFEST_FILE)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_plan(source: &Path) -> ResolvedPlan {
        let invocation = PlanInvocation {
            name: "demo".into(),
            version: "1.0.0".into(),
            build_profile: "default".into(),
            source_path: "/src".into(),
            steps: vec![StepSpec {
                step: "build".into(),
                plugin: "cpm:builtin-builder".into(),
                plugin_version: "0.4.0".into(),
                params: serde_json::json!({"chunk_tokens": 800}),
                non_deterministic: false,
            }],
            model: ModelEntry {
                provider: "openai-compatible".into(),
                model: "m".into(),
                revision: None,
                dtype: "f16".into(),
                device_policy: "server".into(),
                normalize: true,
                max_seq_length: Some(1024),
                non_deterministic: false,
            },
        };
        plan::plan(&invocation, source).unwrap()
    }

    fn write_packet_files(dir: &Path) {
        std::fs::create_dir_all(dir.join("faiss")).unwrap();
        std::fs::write(dir.join(DOCS_FILE), "{\"id\":\"a:0\"}\n").unwrap();
        std::fs::write(dir.join(VECTORS_FILE), [0u8; 16]).unwrap();
        std::fs::write(dir.join(INDEX_FILE), b"CPMI").unwrap();
        std::fs::write(dir.join(MANIFEST_FILE), "{}\n").unwrap();
    }

    #[test]
    fn lockfile_roundtrip_verifies_clean() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("src");
        let packet = tmp.path().join("packet");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(source.join("a.py"), "print(1)\n").unwrap();
        write_packet_files(&packet);

        let resolved = sample_plan(&source);
        let artifacts = artifact_hashes_from_dir(&packet).unwrap();
        let lockfile = render(
            &resolved,
            artifacts,
            "2024-01-01T00:00:00Z".into(),
            "0.4.0",
            vec![],
        );

        let path = packet.join(cpm_packet::LOCKFILE_DEFAULT_NAME);
        write(&lockfile, &path).unwrap();
        let loaded = load(&path).unwrap();
        assert_eq!(loaded, lockfile);

        let report = verify(&loaded, &resolved, &packet, true).unwrap();
        assert!(report.all_passed(), "{}", report.summary());
    }

    #[test]
    fn write_is_byte_stable() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("src");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(source.join("a.py"), "print(1)\n").unwrap();

        let resolved = sample_plan(&source);
        let lockfile = render(
            &resolved,
            ArtifactsSection {
                chunks_manifest_hash: "c".into(),
                embeddings_hash: None,
                index_hash: None,
                packet_manifest_hash: "m".into(),
            },
            "2024-01-01T00:00:00Z".into(),
            "0.4.0",
            vec![],
        );

        let first = tmp.path().join("a.lock.json");
        let second = tmp.path().join("b.lock.json");
        write(&lockfile, &first).unwrap();
        write(&lockfile, &second).unwrap();
        assert_eq!(
            std::fs::read(&first).unwrap(),
            std::fs::read(&second).unwrap()
        );
    }

    #[test]
    fn artifact_tamper_fails_only_artifact_tier() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("src");
        let packet = tmp.path().join("packet");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(source.join("a.py"), "print(1)\n").unwrap();
        write_packet_files(&packet);

        let resolved = sample_plan(&source);
        let artifacts = artifact_hashes_from_dir(&packet).unwrap();
        let lockfile = render(
            &resolved,
            artifacts,
            "2024-01-01T00:00:00Z".into(),
            "0.4.0",
            vec![],
        );

        std::fs::write(packet.join(DOCS_FILE), "tampered\n").unwrap();
        let report = verify(&lockfile, &resolved, &packet, false).unwrap();
        assert!(report.plan.passed);
        assert!(!report.artifacts.passed);
        assert!(report.frozen.passed);
        assert!(report.artifacts.mismatches[0].contains(DOCS_FILE));
    }

    #[test]
    fn source_change_fails_plan_tier_with_file_diff() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("src");
        let packet = tmp.path().join("packet");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(source.join("a.py"), "print(1)\n").unwrap();
        write_packet_files(&packet);

        let resolved = sample_plan(&source);
        let artifacts = artifact_hashes_from_dir(&packet).unwrap();
        let lockfile = render(
            &resolved,
            artifacts,
            "2024-01-01T00:00:00Z".into(),
            "0.4.0",
            vec![],
        );

        std::fs::write(source.join("b.py"), "print(2)\n").unwrap();
        let fresh = sample_plan(&source);
        let report = verify(&lockfile, &fresh, &packet, false).unwrap();
        assert!(!report.plan.passed);
        assert!(report
            .plan
            .mismatches
            .iter()
            .any(|m| m.contains("b.py") && m.contains("added")));
        assert!(report.artifacts.passed);
    }

    #[test]
    fn frozen_tier_rejects_non_deterministic_markers() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("src");
        let packet = tmp.path().join("packet");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(source.join("a.py"), "print(1)\n").unwrap();
        write_packet_files(&packet);

        let resolved = sample_plan(&source);
        let artifacts = artifact_hashes_from_dir(&packet).unwrap();
        let mut lockfile = render(
            &resolved,
            artifacts,
            "2024-01-01T00:00:00Z".into(),
            "0.4.0",
            vec![],
        );
        lockfile.models[0].non_deterministic = true;

        let unfrozen = verify(&lockfile, &resolved, &packet, false).unwrap();
        assert!(unfrozen.frozen.passed);

        let frozen = verify(&lockfile, &resolved, &packet, true).unwrap();
        assert!(!frozen.frozen.passed);
        assert!(frozen.frozen.mismatches[0].contains("non-deterministic"));
    }
}
