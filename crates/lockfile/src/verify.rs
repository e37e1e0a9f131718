//! Three-tier verification: plan match, artifact hashes, frozen
//! determinism. Each tier reports independently; nothing here decides
//! whether a mismatch is fatal.

use crate::error::Result;
use crate::plan::ResolvedPlan;
use crate::types::Lockfile;
use cpm_packet::{sha256_file, DOCS_FILE, INDEX_FILE, MANIFEST_FILE, VECTORS_FILE};
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TierReport {
    pub passed: bool,
    pub mismatches: Vec<String>,
}

impl TierReport {
    fn from_mismatches(mismatches: Vec<String>) -> Self {
        Self {
            passed: mismatches.is_empty(),
            mismatches,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VerifyReport {
    pub plan: TierReport,
    pub artifacts: TierReport,
    pub frozen: TierReport,
}

impl VerifyReport {
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.plan.passed && self.artifacts.passed && self.frozen.passed
    }

    #[must_use]
    pub fn summary(&self) -> String {
        let mut lines = Vec::new();
        for (tier, report) in [
            ("plan", &self.plan),
            ("artifacts", &self.artifacts),
            ("frozen", &self.frozen),
        ] {
            if report.passed {
                lines.push(format!("{tier}: ok"));
            } else {
                lines.push(format!("{tier}: FAILED"));
                for mismatch in &report.mismatches {
                    lines.push(format!("  - {mismatch}"));
                }
            }
        }
        lines.join("\n")
    }
}

/// Compare the lockfile against a freshly computed plan and the artifacts
/// on disk. `frozen` additionally rejects any `non_deterministic` marker.
pub fn verify(
    lockfile: &Lockfile,
    plan: &ResolvedPlan,
    packet_dir: &Path,
    frozen: bool,
) -> Result<VerifyReport> {
    Ok(VerifyReport {
        plan: TierReport::from_mismatches(plan_mismatches(lockfile, plan)),
        artifacts: TierReport::from_mismatches(artifact_mismatches(lockfile, packet_dir)?),
        frozen: TierReport::from_mismatches(if frozen {
            frozen_violations(lockfile)
        } else {
            Vec::new()
        }),
    })
}

/// Section-by-section diff of the `packet`, `inputs`, `pipeline`, and
/// `models` sections.
#[must_use]
pub fn plan_mismatches(lockfile: &Lockfile, plan: &ResolvedPlan) -> Vec<String> {
    let mut mismatches = Vec::new();
    if lockfile.packet != plan.packet {
        mismatches.push(section_diff("packet", &lockfile.packet, &plan.packet));
    }
    if lockfile.inputs.tree_hash != plan.inputs.tree_hash {
        mismatches.push(format!(
            "inputs.tree_hash: locked {} vs planned {}",
            lockfile.inputs.tree_hash, plan.inputs.tree_hash
        ));
        for (path, planned) in &plan.inputs.file_hashes {
            match lockfile.inputs.file_hashes.get(path) {
                Some(locked) if locked == planned => {}
                Some(_) => mismatches.push(format!("inputs.file_hashes[{path}]: changed")),
                None => mismatches.push(format!("inputs.file_hashes[{path}]: added")),
            }
        }
        for path in lockfile.inputs.file_hashes.keys() {
            if !plan.inputs.file_hashes.contains_key(path) {
                mismatches.push(format!("inputs.file_hashes[{path}]: removed"));
            }
        }
    }
    if lockfile.pipeline != plan.pipeline {
        mismatches.push(section_diff("pipeline", &lockfile.pipeline, &plan.pipeline));
    }
    if lockfile.models != plan.models {
        mismatches.push(section_diff("models", &lockfile.models, &plan.models));
    }
    mismatches
}

fn section_diff<T: serde::Serialize>(name: &str, locked: &T, planned: &T) -> String {
    let locked = serde_json::to_string(locked).unwrap_or_default();
    let planned = serde_json::to_string(planned).unwrap_or_default();
    format!("{name}: locked {locked} vs planned {planned}")
}

/// Filename-convention artifact check: every recorded hash must match the
/// current SHA-256 of the named file.
fn artifact_mismatches(lockfile: &Lockfile, packet_dir: &Path) -> Result<Vec<String>> {
    let mut mismatches = Vec::new();
    let expectations: [(&str, Option<&String>); 4] = [
        (DOCS_FILE, Some(&lockfile.artifacts.chunks_manifest_hash)),
        (VECTORS_FILE, lockfile.artifacts.embeddings_hash.as_ref()),
        (INDEX_FILE, lockfile.artifacts.index_hash.as_ref()),
        (MANIFEST_FILE, Some(&lockfile.artifacts.packet_manifest_hash)),
    ];
    for (rel, expected) in expectations {
        let Some(expected) = expected else {
            continue;
        };
        let path = packet_dir.join(rel);
        if !path.exists() {
            mismatches.push(format!("artifacts[{rel}]: file missing"));
            continue;
        }
        let actual = sha256_file(&path)?;
        if &actual != expected {
            mismatches.push(format!(
                "artifacts[{rel}]: locked {expected} vs on-disk {actual}"
            ));
        }
    }
    Ok(mismatches)
}

#[must_use]
pub fn frozen_violations(lockfile: &Lockfile) -> Vec<String> {
    let mut violations = Vec::new();
    for step in &lockfile.pipeline {
        if step.non_deterministic {
            violations.push(format!("pipeline step '{}' is non-deterministic", step.step));
        }
    }
    for model in &lockfile.models {
        if model.non_deterministic {
            violations.push(format!("model '{}' is non-deterministic", model.model));
        }
    }
    violations
}
