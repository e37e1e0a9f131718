//! MCP tools for CPM: lookup, query, plan, evidence.

use cpm_embeddings::{EmbedConfig, EmbeddingClient};
use cpm_oci::{HttpRegistry, OciClientConfig, OciPolicy, OciRef, Registry, SourceResolver};
use cpm_packet::CpmPaths;
use cpm_retrieval::{
    evidence_digest, plan_from_intent, PlanConstraints, QueryEngine, DEFAULT_EVIDENCE_MAX_CHARS,
    MAX_QUERY_K,
};
use rmcp::handler::server::tool::{Parameters, ToolRouter};
use rmcp::model::{CallToolResult, Content, Implementation, ServerCapabilities, ServerInfo};
use rmcp::schemars;
use rmcp::{tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler};
use serde::{Deserialize, Serialize};
use std::future::Future;

#[derive(Clone, Copy, Debug)]
pub(crate) struct ToolDescriptor {
    pub(crate) name: &'static str,
    pub(crate) summary: &'static str,
}

pub(crate) const TOOL_CATALOG: &[ToolDescriptor] = &[
    ToolDescriptor {
        name: "lookup",
        summary: "Metadata-only packet lookup (manifest + one small blob).",
    },
    ToolDescriptor {
        name: "query",
        summary: "Semantic query against a packet, cache-first.",
    },
    ToolDescriptor {
        name: "plan",
        summary: "Deterministic packet selection from an intent.",
    },
    ToolDescriptor {
        name: "evidence",
        summary: "Query + dedupe + bounded evidence digest.",
    },
];

pub(crate) fn tool_inventory_json(version: &str) -> serde_json::Value {
    let tools: Vec<serde_json::Value> = TOOL_CATALOG
        .iter()
        .map(|tool| serde_json::json!({ "name": tool.name, "summary": tool.summary }))
        .collect();

    serde_json::json!({
        "binary": "cpm-mcp",
        "version": version,
        "count": tools.len(),
        "tools": tools,
    })
}

/// CPM MCP Service
#[derive(Clone)]
pub struct CpmService {
    registry_base: Option<String>,
    tool_router: ToolRouter<Self>,
}

impl CpmService {
    #[must_use]
    pub fn from_env() -> Self {
        let registry_base = std::env::var("REGISTRY")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        Self {
            registry_base,
            tool_router: Self::tool_router(),
        }
    }
}

#[tool_handler]
impl ServerHandler for CpmService {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "CPM serves versioned context packets from OCI registries. Use 'lookup' for metadata-only discovery, 'query' for semantic retrieval over a pinned packet, 'plan' to pick a packet for an intent, and 'evidence' for a compact, deduplicated digest.".into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            ..Default::default()
        }
    }
}

impl CpmService {
    fn build_engine(&self) -> anyhow::Result<QueryEngine> {
        let paths = CpmPaths::from_env();
        let policy = policy_from_env();
        let resolver = SourceResolver::new(
            paths,
            Registry::Http(HttpRegistry::new(OciClientConfig::default(), policy.clone())?),
            policy,
        );
        let embedder = embedder_from_env()?;
        Ok(QueryEngine::new(resolver, embedder))
    }

    fn normalize_ref(&self, raw: &str, registry_override: Option<&str>) -> Result<OciRef, McpError> {
        let base = registry_override.or(self.registry_base.as_deref());
        OciRef::normalize(raw, base).map_err(to_mcp_error)
    }
}

fn policy_from_env() -> OciPolicy {
    let flag = |name: &str| {
        std::env::var(name)
            .ok()
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
    };
    let allowlist = std::env::var("CPM_REGISTRY_ALLOWLIST")
        .ok()
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default();
    OciPolicy {
        allowlist_hosts: allowlist,
        allow_http: flag("CPM_ALLOW_HTTP").unwrap_or(false),
        strict_verify: flag("CPM_STRICT_VERIFY").unwrap_or(true),
    }
}

fn embedder_from_env() -> anyhow::Result<EmbeddingClient> {
    let mode = std::env::var("EMBEDDING_MODE")
        .or_else(|_| std::env::var("RAG_EMBED_MODE"))
        .unwrap_or_default();
    if mode.trim().eq_ignore_ascii_case("stub") {
        let dim = std::env::var("CPM_STUB_DIM")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8);
        let model = std::env::var("EMBEDDING_MODEL").unwrap_or_else(|_| "stub-model".to_string());
        return Ok(EmbeddingClient::stub(dim, model));
    }
    Ok(EmbeddingClient::http(EmbedConfig::from_env()?)?)
}

fn to_mcp_error(err: impl std::fmt::Display) -> McpError {
    McpError::internal_error(err.to_string(), None)
}

fn json_result<T: Serialize>(payload: &T) -> Result<CallToolResult, McpError> {
    let text = serde_json::to_string(payload).map_err(to_mcp_error)?;
    Ok(CallToolResult::success(vec![Content::text(text)]))
}

// ============================================================================
// Tool Input/Output Schemas
// ============================================================================

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct LookupRequest {
    /// Full oci:// ref; alternatively use name + version/alias.
    #[schemars(description = "Full oci:// reference (overrides name/version/alias)")]
    pub r#ref: Option<String>,

    /// Packet name (resolved against the default registry)
    #[schemars(description = "Packet name, e.g. 'team/demo'")]
    pub name: Option<String>,

    /// Exact version tag
    #[schemars(description = "Version tag, e.g. '1.0.0'")]
    pub version: Option<String>,

    /// Alias tag (default: latest)
    #[schemars(description = "Alias tag such as 'latest' or 'stable'")]
    pub alias: Option<String>,

    /// Registry base override
    #[schemars(description = "Registry base override, e.g. 'reg.example.com/pkts'")]
    pub registry: Option<String>,
}

#[derive(Debug, Serialize, schemars::JsonSchema)]
pub struct LookupResponse {
    pub pinned_uri: String,
    pub digest: String,
    pub cache_hit: bool,
    pub name: String,
    pub version: String,
    pub kind: Option<String>,
    pub tags: Vec<String>,
    pub entrypoints: Vec<String>,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct QueryRequest {
    /// Packet ref (oci:// URI or short form against the default registry)
    #[schemars(description = "Packet reference, digest-pinned or alias")]
    pub r#ref: String,

    /// Natural-language query
    #[schemars(description = "Query text")]
    pub q: String,

    /// Result count (clamped to 1-20)
    #[schemars(description = "Number of results (1-20)")]
    pub k: Option<usize>,

    /// Registry base override
    #[schemars(description = "Registry base override")]
    pub registry: Option<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct PlanRequest {
    /// The intent to plan for
    #[schemars(description = "Intent text; may embed 'packet:<name>' as a hint")]
    pub intent: String,

    /// Candidate packet names
    #[schemars(description = "Candidate packet names to consider (max 3)")]
    pub name_hints: Option<Vec<String>>,

    /// Required entrypoint
    #[schemars(description = "Required entrypoint, e.g. 'query'")]
    pub entrypoint: Option<String>,

    /// Required packet kind
    #[schemars(description = "Required packet kind")]
    pub kind: Option<String>,

    /// Required capabilities
    #[schemars(description = "Capabilities the packet must declare")]
    pub capabilities: Option<Vec<String>>,

    /// Registry base override
    #[schemars(description = "Registry base override")]
    pub registry: Option<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct EvidenceRequest {
    /// Packet ref
    #[schemars(description = "Packet reference, digest-pinned or alias")]
    pub r#ref: String,

    /// The question to gather evidence for
    #[schemars(description = "Question text")]
    pub question: String,

    /// Result count before dedupe (clamped to 1-20)
    #[schemars(description = "Number of raw results (1-20)")]
    pub k: Option<usize>,

    /// Character budget for concatenated snippets
    #[schemars(description = "Evidence character budget (default 1200)")]
    pub max_chars: Option<usize>,

    /// Registry base override
    #[schemars(description = "Registry base override")]
    pub registry: Option<String>,
}

// ============================================================================
// Tool Implementations
// ============================================================================

#[tool_router]
impl CpmService {
    /// Metadata-only lookup: resolves the ref and fetches the OCI manifest
    /// plus one small metadata blob. Never downloads the payload.
    #[tool(description = "Look up packet metadata (low-token: manifest + one small blob, no payload download)")]
    async fn lookup(
        &self,
        Parameters(request): Parameters<LookupRequest>,
    ) -> Result<CallToolResult, McpError> {
        let raw = match (&request.r#ref, &request.name) {
            (Some(reference), _) => reference.clone(),
            (None, Some(name)) => {
                let tag = request
                    .version
                    .clone()
                    .or_else(|| request.alias.clone())
                    .unwrap_or_else(|| "latest".to_string());
                format!("{name}:{tag}")
            }
            (None, None) => {
                return Err(McpError::invalid_params(
                    "either 'ref' or 'name' is required",
                    None,
                ))
            }
        };
        let reference = self.normalize_ref(&raw, request.registry.as_deref())?;

        let engine = self.build_engine().map_err(to_mcp_error)?;
        let lookup = engine
            .resolver()
            .lookup_metadata(&reference)
            .await
            .map_err(to_mcp_error)?;

        json_result(&LookupResponse {
            pinned_uri: lookup.pinned_uri,
            digest: lookup.digest,
            cache_hit: lookup.cache_hit,
            name: lookup.metadata.packet.name,
            version: lookup.metadata.packet.version,
            kind: lookup.metadata.packet.kind,
            tags: lookup.metadata.packet.tags,
            entrypoints: lookup.metadata.packet.entrypoints,
            capabilities: lookup.metadata.packet.capabilities,
        })
    }

    /// Cache-first semantic query over a packet.
    #[tool(description = "Semantic query against a packet (cache-hit fast path, lazy remote materialization)")]
    async fn query(
        &self,
        Parameters(request): Parameters<QueryRequest>,
    ) -> Result<CallToolResult, McpError> {
        let reference = self.normalize_ref(&request.r#ref, request.registry.as_deref())?;
        let engine = self.build_engine().map_err(to_mcp_error)?;
        let result = engine
            .query(&reference, &request.q, request.k.unwrap_or(5).clamp(1, MAX_QUERY_K))
            .await
            .map_err(to_mcp_error)?;
        json_result(&result)
    }

    /// Deterministic packet planning from an intent.
    #[tool(description = "Plan which packet serves an intent (metadata scoring, probe queries only on ties)")]
    async fn plan(
        &self,
        Parameters(request): Parameters<PlanRequest>,
    ) -> Result<CallToolResult, McpError> {
        let engine = self.build_engine().map_err(to_mcp_error)?;
        let constraints = PlanConstraints {
            entrypoint: request.entrypoint,
            kind: request.kind,
            capabilities: request.capabilities.unwrap_or_default(),
            ..Default::default()
        };
        let registry = request
            .registry
            .as_deref()
            .or(self.registry_base.as_deref());
        let plan = plan_from_intent(
            &engine,
            registry,
            &request.intent,
            &request.name_hints.unwrap_or_default(),
            &constraints,
        )
        .await
        .map_err(to_mcp_error)?;
        json_result(&plan)
    }

    /// Evidence digest: query, dedupe by (path, snippet), truncate.
    #[tool(description = "Gather deduplicated, budget-bounded evidence snippets for a question")]
    async fn evidence(
        &self,
        Parameters(request): Parameters<EvidenceRequest>,
    ) -> Result<CallToolResult, McpError> {
        let reference = self.normalize_ref(&request.r#ref, request.registry.as_deref())?;
        let engine = self.build_engine().map_err(to_mcp_error)?;
        let digest = evidence_digest(
            &engine,
            &reference,
            &request.question,
            request.k.unwrap_or(6),
            request.max_chars.unwrap_or(DEFAULT_EVIDENCE_MAX_CHARS),
        )
        .await
        .map_err(to_mcp_error)?;
        json_result(&digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ref_normalization_uses_registry_base() {
        let service = CpmService {
            registry_base: Some("reg.local/pkts".to_string()),
            tool_router: CpmService::tool_router(),
        };
        let reference = service.normalize_ref("demo:latest", None).unwrap();
        assert_eq!(reference.to_string(), "oci://reg.local/pkts/demo:latest");

        let overridden = service
            .normalize_ref("demo:latest", Some("other.example/pk"))
            .unwrap();
        assert_eq!(overridden.host, "other.example");
    }

    #[test]
    fn full_refs_ignore_the_registry_base() {
        let service = CpmService {
            registry_base: Some("reg.local/pkts".to_string()),
            tool_router: CpmService::tool_router(),
        };
        let reference = service
            .normalize_ref("oci://explicit.example/a/b:stable", None)
            .unwrap();
        assert_eq!(reference.host, "explicit.example");
    }

    #[test]
    fn policy_defaults_to_strict_https() {
        let policy = policy_from_env();
        assert!(policy.strict_verify || std::env::var("CPM_STRICT_VERIFY").is_ok());
    }

    #[test]
    fn tool_catalog_matches_router_inventory() {
        use std::collections::HashSet;

        let routed: HashSet<String> = CpmService::tool_router()
            .list_all()
            .into_iter()
            .map(|tool| tool.name.as_ref().to_string())
            .collect();
        let cataloged: HashSet<String> = TOOL_CATALOG
            .iter()
            .map(|tool| tool.name.to_string())
            .collect();
        assert_eq!(cataloged, routed, "print-tools catalog drifted from the tool router");
    }

    #[test]
    fn tool_inventory_json_reports_version_and_count() {
        let payload = tool_inventory_json("9.9.9");
        assert_eq!(payload["version"], "9.9.9");
        assert_eq!(payload["binary"], "cpm-mcp");
        assert_eq!(payload["count"], TOOL_CATALOG.len());
        assert_eq!(
            payload["tools"].as_array().map(Vec::len),
            Some(TOOL_CATALOG.len())
        );
    }
}
