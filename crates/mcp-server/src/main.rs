//! CPM MCP Server
//!
//! Exposes remote context packets to AI agents via the MCP protocol.
//!
//! ## Tools
//!
//! - `lookup` - Metadata-only packet lookup (manifest + one small blob)
//! - `query` - Semantic query against a packet, cache-first
//! - `plan` - Deterministic packet selection from an intent
//! - `evidence` - Query + dedupe + bounded evidence digest
//!
//! ## Usage
//!
//! ```json
//! {
//!   "mcpServers": {
//!     "cpm": {
//!       "command": "cpm-mcp"
//!     }
//!   }
//! }
//! ```

use anyhow::Result;
use rmcp::ServiceExt;

mod tools;

use tools::CpmService;

fn print_help() {
    println!("CPM MCP server");
    println!();
    println!("Usage: cpm-mcp [--print-tools|--version|--help]");
    println!();
    println!("Flags:");
    println!("  --print-tools  Print tool inventory as JSON and exit");
    println!("  --version      Print version and exit");
    println!("  --help         Print this help and exit");
    println!();
    println!("Env:");
    println!("  CPM_ROOT         workspace/cache root (default .cpm)");
    println!("  REGISTRY         default OCI registry base");
    println!("  EMBEDDING_URL    embedding endpoint");
    println!("  EMBEDDING_MODEL  embedding model id");
    println!("  CPM_MCP_LOG=1    enable stderr logging (stdout is protocol)");
}

fn logging_enabled() -> bool {
    // Any non-MCP bytes on stdout break clients, and some clients merge
    // stderr into stdout. Logging stays opt-in.
    std::env::var("CPM_MCP_LOG")
        .ok()
        .map(|v| {
            let v = v.trim();
            !(v.is_empty() || v == "0" || v.eq_ignore_ascii_case("false"))
        })
        .unwrap_or(false)
}

fn handle_cli_args() -> Option<i32> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        return None;
    }
    match args[0].as_str() {
        "--stdio" | "stdio" => None,
        "--print-tools" => {
            let payload = tools::tool_inventory_json(env!("CARGO_PKG_VERSION"));
            println!("{payload}");
            Some(0)
        }
        "--version" | "-V" => {
            println!("cpm-mcp {}", env!("CARGO_PKG_VERSION"));
            Some(0)
        }
        "--help" | "-h" => {
            print_help();
            Some(0)
        }
        _ => {
            // Be permissive: agent tooling may pass transport selectors.
            if logging_enabled() {
                log::warn!("Ignoring unknown arguments: {}", args.join(" "));
            }
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Some(code) = handle_cli_args() {
        std::process::exit(code);
    }

    if logging_enabled() {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
            .target(env_logger::Target::Stderr)
            .init();
        log::info!("Starting CPM MCP server");
    }

    let service = CpmService::from_env();
    let server = service
        .serve((tokio::io::stdin(), tokio::io::stdout()))
        .await?;
    server.waiting().await?;

    if logging_enabled() {
        log::info!("CPM MCP server stopped");
    }
    Ok(())
}
