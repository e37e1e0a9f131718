use anyhow::{Context as AnyhowContext, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use cpm_chunker::ChunkConfig;
use cpm_embeddings::{EmbedConfig, EmbeddingClient, NormalizationMode};
use cpm_lockfile::{ModelEntry, PlanInvocation, ResolvedPlan, StepSpec};
use cpm_oci::{HttpRegistry, OciClientConfig, OciPolicy, Registry, SourceResolver};
use cpm_packet::{CpmPaths, LOCKFILE_DEFAULT_NAME};
use cpm_retrieval::QueryEngine;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

mod commands;

fn print_stdout(text: &str) -> Result<()> {
    let mut stdout = io::stdout().lock();
    if let Err(err) = stdout
        .write_all(text.as_bytes())
        .and_then(|_| stdout.write_all(b"\n"))
        .and_then(|_| stdout.flush())
    {
        if err.kind() == io::ErrorKind::BrokenPipe {
            return Ok(());
        }
        return Err(err.into());
    }
    Ok(())
}

#[derive(Parser)]
#[command(name = "cpm")]
#[command(about = "Content-addressed context packets over OCI registries", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Workspace/cache root (env: CPM_ROOT, default .cpm)
    #[arg(long, global = true)]
    cpm_root: Option<PathBuf>,

    /// Default OCI registry base for short refs (env: REGISTRY)
    #[arg(long, global = true)]
    registry: Option<String>,

    /// Embedding backend
    #[arg(long, global = true, value_enum, default_value_t = EmbedMode::Http)]
    embed_mode: EmbedMode,

    /// Embedding endpoint (env: EMBEDDING_URL)
    #[arg(long, global = true)]
    embed_url: Option<String>,

    /// Embedding model id (env: EMBEDDING_MODEL)
    #[arg(long, global = true)]
    embed_model: Option<String>,

    /// Stub embedder output dimension
    #[arg(long, global = true, default_value_t = 8)]
    embed_dim: usize,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum EmbedMode {
    /// OpenAI-compatible HTTP embedding server
    Http,
    /// Deterministic offline stub (tests, dry runs)
    Stub,
}

#[derive(Subcommand)]
enum Commands {
    /// Build, resume, or verify a packet
    Build(BuildArgs),

    /// Metadata-only remote lookup (no payload download)
    Lookup(LookupArgs),

    /// Semantic query against a packet ref
    Query(QueryArgs),
}

#[derive(Args)]
struct BuildArgs {
    #[command(subcommand)]
    command: BuildCommands,
}

#[derive(Subcommand)]
enum BuildCommands {
    /// Full build: scan, chunk, embed, index, persist, lockfile
    Run(BuildRunArgs),

    /// Resume embedding from an existing docs.jsonl
    Embed(BuildEmbedArgs),

    /// Verify the lockfile against the plan and on-disk artifacts
    Verify(BuildVerifyArgs),
}

#[derive(Args)]
struct BuildRunArgs {
    /// Source tree to index
    #[arg(long)]
    source: PathBuf,

    /// Packet output directory
    #[arg(long)]
    dest: PathBuf,

    /// Packet name (default: destination directory name)
    #[arg(long)]
    name: Option<String>,

    /// Packet version
    #[arg(long, default_value = "0.0.0")]
    packet_version: String,

    /// Build profile recorded in the packet identity
    #[arg(long, default_value = "default")]
    profile: String,

    /// Target tokens per chunk
    #[arg(long, default_value_t = 800)]
    chunk_tokens: usize,

    /// Overlap tokens between adjacent chunks
    #[arg(long, default_value_t = 120)]
    overlap_tokens: usize,

    /// Expected embedding dimension (mismatch is fatal)
    #[arg(long)]
    dim: Option<u32>,

    /// Produce <dest>.tar.gz after a successful build
    #[arg(long)]
    archive: bool,

    /// Rewrite the lockfile even when the plan changed
    #[arg(long)]
    update_lock: bool,

    /// Refuse to build when any non-deterministic marker is present
    #[arg(long)]
    frozen_lockfile: bool,

    /// Lockfile name inside the destination
    #[arg(long, default_value = LOCKFILE_DEFAULT_NAME)]
    lockfile_name: String,
}

#[derive(Args)]
struct BuildEmbedArgs {
    /// Packet directory holding docs.jsonl
    #[arg(long)]
    dest: PathBuf,

    /// Packet name (default: destination directory name)
    #[arg(long)]
    name: Option<String>,

    /// Packet version
    #[arg(long, default_value = "0.0.0")]
    packet_version: String,

    /// Expected embedding dimension
    #[arg(long)]
    dim: Option<u32>,
}

#[derive(Args)]
struct BuildVerifyArgs {
    /// Source tree the packet was built from
    #[arg(long)]
    source: PathBuf,

    /// Packet directory
    #[arg(long)]
    dest: PathBuf,

    /// Packet name (default: destination directory name)
    #[arg(long)]
    name: Option<String>,

    /// Packet version
    #[arg(long, default_value = "0.0.0")]
    packet_version: String,

    /// Build profile
    #[arg(long, default_value = "default")]
    profile: String,

    /// Target tokens per chunk (must match the build invocation)
    #[arg(long, default_value_t = 800)]
    chunk_tokens: usize,

    /// Overlap tokens (must match the build invocation)
    #[arg(long, default_value_t = 120)]
    overlap_tokens: usize,

    /// Expected embedding dimension
    #[arg(long)]
    dim: Option<u32>,

    /// Also fail on any non-deterministic marker
    #[arg(long)]
    frozen: bool,

    /// Lockfile name inside the destination
    #[arg(long, default_value = LOCKFILE_DEFAULT_NAME)]
    lockfile_name: String,
}

#[derive(Args)]
struct LookupArgs {
    /// Full oci:// ref (overrides name/version/alias)
    #[arg(long = "ref")]
    reference: Option<String>,

    /// Packet name
    #[arg(long)]
    name: Option<String>,

    /// Version tag
    #[arg(long)]
    packet_version: Option<String>,

    /// Alias tag
    #[arg(long, default_value = "latest")]
    alias: String,
}

#[derive(Args)]
struct QueryArgs {
    /// Packet ref (oci:// URI or short form)
    #[arg(long = "ref")]
    reference: String,

    /// Query text
    #[arg(short, long)]
    query: String,

    /// Result count (clamped to 1-20)
    #[arg(short, long, default_value_t = 5)]
    k: usize,
}

pub fn main() -> i32 {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "info" } else { "warn" };
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_level),
    )
    .target(env_logger::Target::Stderr)
    .try_init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("error: failed to start runtime: {err}");
            return 1;
        }
    };

    match runtime.block_on(dispatch(&cli)) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("error: {err:#}");
            1
        }
    }
}

async fn dispatch(cli: &Cli) -> Result<()> {
    match &cli.command {
        Commands::Build(args) => match &args.command {
            BuildCommands::Run(run) => commands::build_run(cli, run).await,
            BuildCommands::Embed(embed) => commands::build_embed(cli, embed).await,
            BuildCommands::Verify(verify) => commands::build_verify(cli, verify).await,
        },
        Commands::Lookup(args) => commands::lookup(cli, args).await,
        Commands::Query(args) => commands::query(cli, args).await,
    }
}

fn paths_for(cli: &Cli) -> CpmPaths {
    match &cli.cpm_root {
        Some(root) => CpmPaths::new(root),
        None => CpmPaths::from_env(),
    }
}

fn registry_base(cli: &Cli) -> Option<String> {
    cli.registry
        .clone()
        .or_else(|| std::env::var("REGISTRY").ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn embedder_for(cli: &Cli) -> Result<EmbeddingClient> {
    match cli.embed_mode {
        EmbedMode::Stub => {
            let model = cli
                .embed_model
                .clone()
                .or_else(|| std::env::var("EMBEDDING_MODEL").ok())
                .unwrap_or_else(|| "stub-model".to_string());
            Ok(EmbeddingClient::stub(cli.embed_dim, model))
        }
        EmbedMode::Http => {
            let mut config = match &cli.embed_url {
                Some(url) => {
                    let model = cli
                        .embed_model
                        .clone()
                        .or_else(|| std::env::var("EMBEDDING_MODEL").ok())
                        .unwrap_or_default();
                    EmbedConfig::new(url.clone(), model)
                }
                None => EmbedConfig::from_env()
                    .context("no --embed-url and EMBEDDING_URL is not set")?,
            };
            if let Some(model) = &cli.embed_model {
                config.model = model.clone();
            }
            config.normalization = NormalizationMode::Auto;
            Ok(EmbeddingClient::http(config)?)
        }
    }
}

fn engine_for(cli: &Cli) -> Result<QueryEngine> {
    let policy = OciPolicy::default();
    let resolver = SourceResolver::new(
        paths_for(cli),
        Registry::Http(HttpRegistry::new(OciClientConfig::default(), policy.clone())?),
        policy,
    );
    Ok(QueryEngine::new(resolver, embedder_for(cli)?))
}

fn chunk_config(chunk_tokens: usize, overlap_tokens: usize) -> ChunkConfig {
    ChunkConfig {
        chunk_tokens,
        overlap_tokens,
        hard_cap_tokens: (chunk_tokens + chunk_tokens / 4).max(chunk_tokens + 32),
        ..Default::default()
    }
}

fn packet_name(explicit: Option<&String>, dest: &Path) -> Result<String> {
    explicit
        .cloned()
        .or_else(|| {
            dest.file_name()
                .and_then(|n| n.to_str())
                .map(ToString::to_string)
        })
        .context("packet name could not be determined from --name or --dest")
}

/// The resolved plan for a build/verify invocation. Pipeline params mirror
/// exactly what the builder consumes, so the config hash moves when (and
/// only when) the build inputs move.
fn compute_plan(
    source: &Path,
    name: &str,
    version: &str,
    profile: &str,
    chunk: &ChunkConfig,
    embedder: &EmbeddingClient,
    expected_dim: Option<u32>,
) -> Result<ResolvedPlan> {
    let cpm_version = env!("CARGO_PKG_VERSION");
    let invocation = PlanInvocation {
        name: name.to_string(),
        version: version.to_string(),
        build_profile: profile.to_string(),
        source_path: cpm_builder::scan::posix_path(source),
        steps: vec![
            StepSpec {
                step: "build".to_string(),
                plugin: "cpm:builtin-builder".to_string(),
                plugin_version: cpm_version.to_string(),
                params: serde_json::to_value(chunk)?,
                non_deterministic: false,
            },
            StepSpec {
                step: "embed".to_string(),
                plugin: "cpm:http-embedder".to_string(),
                plugin_version: cpm_version.to_string(),
                params: serde_json::json!({
                    "model": embedder.model(),
                    "max_seq_length": embedder.max_seq_length(),
                    "dim": expected_dim,
                }),
                non_deterministic: false,
            },
            StepSpec {
                step: "index".to_string(),
                plugin: "cpm:flat-ip-index".to_string(),
                plugin_version: cpm_version.to_string(),
                params: serde_json::json!({"index_type": "flat-ip", "space": "cosine"}),
                non_deterministic: false,
            },
        ],
        model: ModelEntry {
            provider: "openai-compatible".to_string(),
            model: embedder.model().to_string(),
            revision: None,
            dtype: "f16".to_string(),
            device_policy: "server".to_string(),
            normalize: true,
            max_seq_length: embedder.max_seq_length(),
            non_deterministic: false,
        },
    };
    Ok(cpm_lockfile::plan(&invocation, source)?)
}
