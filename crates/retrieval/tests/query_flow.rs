use cpm_builder::{build, BuildConfig, FixedClock};
use cpm_embeddings::EmbeddingClient;
use cpm_oci::testing::{sample_metadata, InMemoryRegistry};
use cpm_oci::{OciPolicy, OciRef, Registry, SourceResolver};
use cpm_packet::CpmPaths;
use cpm_retrieval::{evidence_digest, plan_from_intent, PlanConstraints, QueryEngine};
use std::path::Path;
use tempfile::TempDir;

fn lax_policy() -> OciPolicy {
    OciPolicy {
        strict_verify: false,
        ..Default::default()
    }
}

async fn build_demo_packet(root: &Path, name: &str) -> std::path::PathBuf {
    let source = root.join(format!("{name}-src"));
    std::fs::create_dir_all(&source).unwrap();
    std::fs::write(
        source.join("alpha.txt"),
        "alpha document about schedulers\n\nsecond paragraph on retries\n",
    )
    .unwrap();
    std::fs::write(
        source.join("beta.txt"),
        "beta document about embeddings\n\nanother paragraph on vectors\n",
    )
    .unwrap();
    std::fs::write(source.join("gamma.md"), "# Heading\n\nbody on caching\n").unwrap();

    let dest = root.join(format!("{name}-packet"));
    let embedder = EmbeddingClient::stub(8, "stub-model");
    build(
        &source,
        &dest,
        &BuildConfig {
            name: Some(name.to_string()),
            version: "1.0.0".to_string(),
            ..Default::default()
        },
        &embedder,
        &FixedClock("2024-06-01T00:00:00Z".to_string()),
    )
    .await
    .unwrap();
    dest
}

fn publish_dir(
    registry: &InMemoryRegistry,
    reference: &OciRef,
    packet_dir: &Path,
    files: &[&str],
) -> String {
    let blobs: Vec<(String, Vec<u8>)> = files
        .iter()
        .map(|rel| ((*rel).to_string(), std::fs::read(packet_dir.join(rel)).unwrap()))
        .collect();
    let borrowed: Vec<(&str, &[u8])> = blobs
        .iter()
        .map(|(name, bytes)| (name.as_str(), bytes.as_slice()))
        .collect();
    registry.publish_packet(reference, &sample_metadata(&reference.repository, "1.0.0"), &borrowed)
}

fn engine_for(root: &Path, registry: &InMemoryRegistry) -> QueryEngine {
    let resolver = SourceResolver::new(
        CpmPaths::new(root.join("cpm-root")),
        Registry::InMemory(registry.clone()),
        lax_policy(),
    );
    QueryEngine::new(resolver, EmbeddingClient::stub(8, "stub-model"))
}

#[tokio::test]
async fn miss_then_hit_queries_are_identical_and_offline() {
    let tmp = TempDir::new().unwrap();
    let packet_dir = build_demo_packet(tmp.path(), "demo").await;

    let registry = InMemoryRegistry::new();
    let reference = OciRef::parse("oci://reg.local/pkts/demo:1.0.0").unwrap();
    publish_dir(
        &registry,
        &reference,
        &packet_dir,
        &[
            "manifest.json",
            "docs.jsonl",
            "vectors.f16.bin",
            "faiss/index.faiss",
            "cpm.yml",
        ],
    );

    let engine = engine_for(tmp.path(), &registry);

    let first = engine.query(&reference, "retries scheduler", 5).await.unwrap();
    assert!(!first.cache_hit);
    assert!(!first.results.is_empty());
    assert!(first.pinned_uri.contains("@sha256:"));
    assert_eq!(registry.payload_pulls(), 1);

    let second = engine.query(&reference, "retries scheduler", 5).await.unwrap();
    assert!(second.cache_hit);
    assert_eq!(registry.payload_pulls(), 1, "cache hit performs no OCI pull");
    assert_eq!(second.results, first.results);
    assert_eq!(second.digest, first.digest);

    // Identical byte-level response.
    assert_eq!(
        serde_json::to_string(&first).unwrap().replace("\"cache_hit\":false", ""),
        serde_json::to_string(&second).unwrap().replace("\"cache_hit\":true", ""),
    );
}

#[tokio::test]
async fn results_are_sorted_by_score_then_chunk_id() {
    let tmp = TempDir::new().unwrap();
    let packet_dir = build_demo_packet(tmp.path(), "demo").await;

    let registry = InMemoryRegistry::new();
    let reference = OciRef::parse("oci://reg.local/pkts/demo:1.0.0").unwrap();
    publish_dir(
        &registry,
        &reference,
        &packet_dir,
        &[
            "manifest.json",
            "docs.jsonl",
            "vectors.f16.bin",
            "faiss/index.faiss",
        ],
    );

    let engine = engine_for(tmp.path(), &registry);
    let result = engine.query(&reference, "embeddings vectors", 10).await.unwrap();
    assert!(result.results.len() >= 2);
    for pair in result.results.windows(2) {
        assert!(
            pair[0].score >= pair[1].score,
            "scores must be non-increasing"
        );
    }
}

#[tokio::test]
async fn missing_shipped_index_triggers_rebuild() {
    let tmp = TempDir::new().unwrap();
    let packet_dir = build_demo_packet(tmp.path(), "demo").await;

    let registry = InMemoryRegistry::new();
    let reference = OciRef::parse("oci://reg.local/pkts/demo:1.0.0").unwrap();
    // Publish without vectors or index: the engine must rebuild from docs.
    publish_dir(&registry, &reference, &packet_dir, &["manifest.json", "docs.jsonl"]);

    let engine = engine_for(tmp.path(), &registry);
    let result = engine.query(&reference, "caching heading", 3).await.unwrap();
    assert!(!result.cache_hit);
    assert!(!result.results.is_empty());

    let index_dir = tmp
        .path()
        .join("cpm-root")
        .join("index")
        .join(cpm_packet::safe_key(&result.digest));
    let fingerprints: Vec<_> = std::fs::read_dir(&index_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .collect();
    assert_eq!(fingerprints.len(), 1);
    assert!(fingerprints[0].path().join("index.faiss").exists());
}

#[tokio::test]
async fn k_is_clamped_at_the_boundary() {
    let tmp = TempDir::new().unwrap();
    let packet_dir = build_demo_packet(tmp.path(), "demo").await;

    let registry = InMemoryRegistry::new();
    let reference = OciRef::parse("oci://reg.local/pkts/demo:1.0.0").unwrap();
    publish_dir(
        &registry,
        &reference,
        &packet_dir,
        &[
            "manifest.json",
            "docs.jsonl",
            "vectors.f16.bin",
            "faiss/index.faiss",
        ],
    );

    let engine = engine_for(tmp.path(), &registry);
    let zero = engine.query(&reference, "alpha", 0).await.unwrap();
    assert_eq!(zero.results.len(), 1, "k=0 clamps to 1");
    let huge = engine.query(&reference, "alpha", 10_000).await.unwrap();
    assert!(huge.results.len() <= 20);
}

#[tokio::test]
async fn planner_is_deterministic_across_invocations() {
    let tmp = TempDir::new().unwrap();
    let registry = InMemoryRegistry::new();

    // Three candidates with identical metadata shape: metadata scores tie,
    // probes run, and the final order falls back to pinned URI.
    for name in ["demo-a", "demo-b", "demo-c"] {
        let packet_dir = build_demo_packet(tmp.path(), name).await;
        let reference =
            OciRef::parse(&format!("oci://reg.local/pkts/{name}:latest")).unwrap();
        publish_dir(
            &registry,
            &reference,
            &packet_dir,
            &[
                "manifest.json",
                "docs.jsonl",
                "vectors.f16.bin",
                "faiss/index.faiss",
            ],
        );
    }

    let engine = engine_for(tmp.path(), &registry);
    let hints: Vec<String> = ["pkts/demo-a", "pkts/demo-b", "pkts/demo-c"]
        .iter()
        .map(ToString::to_string)
        .collect();
    let constraints = PlanConstraints::default();

    let first = plan_from_intent(
        &engine,
        Some("reg.local"),
        "find scheduler retries context",
        &hints,
        &constraints,
    )
    .await
    .unwrap();
    let second = plan_from_intent(
        &engine,
        Some("reg.local"),
        "find scheduler retries context",
        &hints,
        &constraints,
    )
    .await
    .unwrap();

    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap(),
        "identical inputs must produce byte-identical plans"
    );
    assert_eq!(first.selected.len(), 2);
    assert_eq!(first.fallbacks.len(), 1);
    assert!(first.selected[0].pinned_uri < first.selected[1].pinned_uri);
}

#[tokio::test]
async fn evidence_digest_dedupes_and_respects_budget() {
    let tmp = TempDir::new().unwrap();
    let packet_dir = build_demo_packet(tmp.path(), "demo").await;

    let registry = InMemoryRegistry::new();
    let reference = OciRef::parse("oci://reg.local/pkts/demo:1.0.0").unwrap();
    publish_dir(
        &registry,
        &reference,
        &packet_dir,
        &[
            "manifest.json",
            "docs.jsonl",
            "vectors.f16.bin",
            "faiss/index.faiss",
        ],
    );

    let engine = engine_for(tmp.path(), &registry);
    let digest = evidence_digest(&engine, &reference, "vectors embeddings", 6, 100)
        .await
        .unwrap();

    let total: usize = digest
        .evidence
        .iter()
        .map(|hit| hit.snippet.chars().count())
        .sum();
    assert!(total <= 100);
    assert!(!digest.summary.is_empty());
    assert!(digest.summary.lines().all(|line| line.starts_with("- ")));

    let mut seen = std::collections::HashSet::new();
    for hit in &digest.evidence {
        assert!(seen.insert((hit.path.clone(), hit.snippet.clone())));
    }
}
