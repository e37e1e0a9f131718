//! Evidence digest: query, dedupe, truncate to a character budget, and a
//! short deterministic summary.

use crate::error::Result;
use crate::query::{QueryEngine, QueryHit, MAX_QUERY_K};
use cpm_oci::OciRef;
use serde::Serialize;
use std::collections::HashSet;

pub const DEFAULT_EVIDENCE_MAX_CHARS: usize = 1200;
const MIN_EVIDENCE_MAX_CHARS: usize = 64;
const SUMMARY_LINES: usize = 6;

#[derive(Debug, Clone, Serialize)]
pub struct EvidenceDigest {
    pub digest: String,
    pub pinned_uri: String,
    pub question: String,
    pub evidence: Vec<QueryHit>,
    pub summary: String,
}

pub async fn evidence_digest(
    engine: &QueryEngine,
    reference: &OciRef,
    question: &str,
    k: usize,
    max_chars: usize,
) -> Result<EvidenceDigest> {
    let result = engine
        .query(reference, question, k.clamp(1, MAX_QUERY_K))
        .await?;

    // Dedupe by (path, snippet); the first occurrence (highest rank) wins.
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut deduped: Vec<QueryHit> = Vec::new();
    for hit in result.results {
        if seen.insert((hit.path.clone(), hit.snippet.clone())) {
            deduped.push(hit);
        }
    }

    let budget = max_chars.max(MIN_EVIDENCE_MAX_CHARS);
    let mut used = 0usize;
    let mut evidence = Vec::new();
    for mut hit in deduped {
        if used >= budget {
            break;
        }
        let room = budget - used;
        let snippet: String = hit.snippet.chars().take(room).collect();
        let snippet = snippet.trim().to_string();
        if snippet.is_empty() {
            continue;
        }
        used += snippet.chars().count();
        hit.snippet = snippet;
        evidence.push(hit);
    }

    let summary = evidence
        .iter()
        .take(SUMMARY_LINES)
        .map(|hit| format!("- {}: {}", hit.path, hit.snippet))
        .collect::<Vec<_>>()
        .join("\n");

    Ok(EvidenceDigest {
        digest: result.digest,
        pinned_uri: result.pinned_uri,
        question: question.to_string(),
        evidence,
        summary,
    })
}
