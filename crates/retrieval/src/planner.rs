//! Intent planner: deterministic candidate selection over metadata-only
//! lookups, with a single probe query per top-tied candidate when metadata
//! scores cannot separate them.

use crate::error::{Result, RetrievalError};
use crate::query::QueryEngine;
use cpm_oci::OciRef;
use serde::Serialize;

const MAX_CANDIDATES: usize = 3;
const PROBE_K: usize = 3;

#[derive(Debug, Clone, Default)]
pub struct PlanConstraints {
    pub name: Option<String>,
    pub version: Option<String>,
    pub alias: Option<String>,
    pub entrypoint: Option<String>,
    pub kind: Option<String>,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentKind {
    /// Metadata alone answers the intent.
    Lookup,
    /// Retrieval over packet content is needed.
    Query,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanChoice {
    pub pinned_uri: String,
    pub entrypoint: Option<String>,
    pub args_template: serde_json::Value,
    pub why: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanFallback {
    pub pinned_uri: String,
    pub entrypoint: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanResult {
    pub intent: IntentKind,
    pub selected: Vec<PlanChoice>,
    pub fallbacks: Vec<PlanFallback>,
}

#[derive(Debug, Clone)]
struct Candidate {
    pinned_uri: String,
    name: String,
    version: String,
    kind: Option<String>,
    entrypoints: Vec<String>,
    capabilities: Vec<String>,
    tags: Vec<String>,
}

/// Plan which packet(s) should serve an intent. Name hints come from the
/// explicit list, the constraints, or a `packet:<name>` marker inside the
/// intent text; without any hint planning is refused (deterministic output
/// requires a bounded candidate set).
pub async fn plan_from_intent(
    engine: &QueryEngine,
    registry_base: Option<&str>,
    intent: &str,
    name_hints: &[String],
    constraints: &PlanConstraints,
) -> Result<PlanResult> {
    let mut hints: Vec<String> = name_hints.to_vec();
    if hints.is_empty() {
        if let Some(name) = &constraints.name {
            hints.push(name.clone());
        } else if let Some(name) = extract_name_hint(intent) {
            hints.push(name);
        }
    }
    if hints.is_empty() {
        return Err(RetrievalError::InvalidInput(
            "planning needs a name hint (name_hints, constraints.name, or 'packet:<name>' in the intent)"
                .to_string(),
        ));
    }
    hints.truncate(MAX_CANDIDATES);

    let tag = constraints
        .version
        .clone()
        .or_else(|| constraints.alias.clone())
        .unwrap_or_else(|| "latest".to_string());

    let mut candidates = Vec::new();
    for hint in &hints {
        let reference = OciRef::normalize(&format!("{hint}:{tag}"), registry_base)
            .map_err(RetrievalError::Oci)?;
        match engine.resolver().lookup_metadata(&reference).await {
            Ok(lookup) => candidates.push(Candidate {
                pinned_uri: lookup.pinned_uri,
                name: lookup.metadata.packet.name,
                version: lookup.metadata.packet.version,
                kind: lookup.metadata.packet.kind,
                entrypoints: lookup.metadata.packet.entrypoints,
                capabilities: lookup.metadata.packet.capabilities,
                tags: lookup.metadata.packet.tags,
            }),
            Err(err) => log::debug!("planner: candidate '{hint}' skipped: {err}"),
        }
    }
    let candidates = filter_candidates(candidates, constraints);
    if candidates.is_empty() {
        return Err(RetrievalError::InvalidInput(
            "no candidate packet matched the constraints".to_string(),
        ));
    }

    let mut scored: Vec<(i64, Candidate)> = candidates
        .into_iter()
        .map(|candidate| (metadata_score(&candidate, intent, constraints), candidate))
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.pinned_uri.cmp(&b.1.pinned_uri)));

    // Probe queries only when metadata scores are indistinguishable at the
    // top; one probe per tied candidate keeps the plan deterministic.
    if scored.len() >= 2 && scored[0].0 == scored[1].0 {
        let tied = scored.iter().take_while(|(s, _)| *s == scored[0].0).count();
        for idx in 0..tied.min(MAX_CANDIDATES) {
            let reference =
                OciRef::parse(&scored[idx].1.pinned_uri).map_err(RetrievalError::Oci)?;
            match engine.query(&reference, intent, PROBE_K).await {
                Ok(result) => scored[idx].0 += result.results.len() as i64,
                Err(err) => {
                    log::debug!("planner probe failed for {}: {err}", scored[idx].1.pinned_uri);
                }
            }
        }
        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.pinned_uri.cmp(&b.1.pinned_uri)));
    }

    let intent_kind = classify_intent(intent, &scored[0].1);
    let selected = scored
        .iter()
        .take(2)
        .map(|(_, candidate)| PlanChoice {
            pinned_uri: candidate.pinned_uri.clone(),
            entrypoint: select_entrypoint(candidate, constraints),
            args_template: serde_json::json!({
                "ref": candidate.pinned_uri,
                "q": "{question}",
                "k": 5,
            }),
            why: why_candidate(candidate, intent),
        })
        .collect();
    let fallbacks = scored
        .iter()
        .skip(2)
        .take(2)
        .map(|(_, candidate)| PlanFallback {
            pinned_uri: candidate.pinned_uri.clone(),
            entrypoint: select_entrypoint(candidate, constraints),
        })
        .collect();

    Ok(PlanResult {
        intent: intent_kind,
        selected,
        fallbacks,
    })
}

fn extract_name_hint(intent: &str) -> Option<String> {
    let lowered = intent.to_lowercase();
    let start = lowered.find("packet:")? + "packet:".len();
    let tail = intent[start..].trim_start();
    let token = tail
        .split_whitespace()
        .next()?
        .trim_matches(|ch: char| ch == ',' || ch == '.');
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

fn filter_candidates(candidates: Vec<Candidate>, constraints: &PlanConstraints) -> Vec<Candidate> {
    let mut filtered: Vec<Candidate> = candidates
        .into_iter()
        .filter(|candidate| {
            if let Some(kind) = &constraints.kind {
                if candidate.kind.as_deref() != Some(kind.as_str()) {
                    return false;
                }
            }
            if let Some(entrypoint) = &constraints.entrypoint {
                if !candidate.entrypoints.contains(entrypoint) {
                    return false;
                }
            }
            constraints
                .capabilities
                .iter()
                .all(|cap| candidate.capabilities.contains(cap))
        })
        .collect();
    filtered.sort_by(|a, b| {
        (&a.name, &a.version, &a.pinned_uri).cmp(&(&b.name, &b.version, &b.pinned_uri))
    });
    filtered
}

/// Metadata-only features: entrypoint match outranks kind match outranks
/// capability mentions.
fn metadata_score(candidate: &Candidate, intent: &str, constraints: &PlanConstraints) -> i64 {
    let lowered = intent.to_lowercase();
    let mut score = 0;
    if let Some(entrypoint) = &constraints.entrypoint {
        if candidate.entrypoints.contains(entrypoint) {
            score += 5;
        }
    }
    if let Some(kind) = &candidate.kind {
        if !kind.is_empty() && lowered.contains(&kind.to_lowercase()) {
            score += 2;
        }
    }
    for capability in &candidate.capabilities {
        if lowered.contains(&capability.to_lowercase()) {
            score += 1;
        }
    }
    score
}

/// Metadata-sufficient intents (every content word already appears in the
/// candidate's metadata vocabulary) classify as `lookup`.
fn classify_intent(intent: &str, top: &Candidate) -> IntentKind {
    let mut vocabulary: Vec<String> = vec![top.name.to_lowercase()];
    vocabulary.extend(top.tags.iter().map(|t| t.to_lowercase()));
    vocabulary.extend(top.capabilities.iter().map(|c| c.to_lowercase()));
    if let Some(kind) = &top.kind {
        vocabulary.push(kind.to_lowercase());
    }

    let words: Vec<String> = intent
        .to_lowercase()
        .split_whitespace()
        .filter(|word| !word.starts_with("packet:"))
        .map(|word| word.trim_matches(|ch: char| !ch.is_alphanumeric()).to_string())
        .filter(|word| word.len() > 2)
        .collect();
    if words.is_empty() || words.iter().all(|word| vocabulary.iter().any(|v| v.contains(word))) {
        IntentKind::Lookup
    } else {
        IntentKind::Query
    }
}

fn select_entrypoint(candidate: &Candidate, constraints: &PlanConstraints) -> Option<String> {
    if let Some(requested) = &constraints.entrypoint {
        if candidate.entrypoints.contains(requested) {
            return Some(requested.clone());
        }
    }
    candidate.entrypoints.first().cloned()
}

fn why_candidate(candidate: &Candidate, intent: &str) -> String {
    let caps = if candidate.capabilities.is_empty() {
        "no capabilities".to_string()
    } else {
        candidate
            .capabilities
            .iter()
            .take(3)
            .cloned()
            .collect::<Vec<_>>()
            .join(", ")
    };
    let intent_head: String = intent.chars().take(64).collect();
    format!(
        "selected {}@{} for intent '{intent_head}' with capabilities [{caps}]",
        candidate.name, candidate.version
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(name: &str) -> Candidate {
        Candidate {
            pinned_uri: format!("oci://reg.local/pkts/{name}@sha256:aaaa"),
            name: name.to_string(),
            version: "1.0.0".to_string(),
            kind: Some("context".to_string()),
            entrypoints: vec!["query".to_string()],
            capabilities: vec!["search".to_string()],
            tags: vec!["docs".to_string()],
        }
    }

    #[test]
    fn name_hint_extraction() {
        assert_eq!(
            extract_name_hint("look into packet:demo-pack, please"),
            Some("demo-pack".to_string())
        );
        assert_eq!(extract_name_hint("no marker here"), None);
    }

    #[test]
    fn metadata_score_prefers_entrypoint_match() {
        let constraints = PlanConstraints {
            entrypoint: Some("query".to_string()),
            ..Default::default()
        };
        let scored = metadata_score(&candidate("demo"), "context search things", &constraints);
        // entrypoint (5) + kind "context" (2) + capability "search" (1)
        assert_eq!(scored, 8);
    }

    #[test]
    fn intent_classification_splits_lookup_from_query() {
        let top = candidate("demo");
        assert_eq!(classify_intent("demo docs search", &top), IntentKind::Lookup);
        assert_eq!(
            classify_intent("how does the scheduler handle retries", &top),
            IntentKind::Query
        );
    }

    #[test]
    fn constraint_filter_drops_mismatches() {
        let constraints = PlanConstraints {
            kind: Some("other-kind".to_string()),
            ..Default::default()
        };
        assert!(filter_candidates(vec![candidate("demo")], &constraints).is_empty());

        let matching = PlanConstraints {
            kind: Some("context".to_string()),
            capabilities: vec!["search".to_string()],
            ..Default::default()
        };
        assert_eq!(filter_candidates(vec![candidate("demo")], &matching).len(), 1);
    }
}
