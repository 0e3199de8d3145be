//! exec-sandbox daemon
//!
//! MCP server that compiles and runs untrusted code in per-execution
//! sandboxes. Configuration comes from `--config` or `EXEC_SANDBOX_CONFIG`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use exec_sandbox_daemon::backend::{DockerBackend, HostBackend, IsolationBackend};
use exec_sandbox_daemon::config::{BackendType, Config};
use exec_sandbox_daemon::dispatcher::Dispatcher;
use exec_sandbox_daemon::language::LanguageRegistry;
use exec_sandbox_daemon::mcp;

#[derive(Parser, Debug)]
#[command(name = "exec-sandbox-daemon")]
#[command(about = "MCP server for sandboxed multi-language code execution")]
struct Args {
    /// Run in stdio mode (for MCP clients)
    #[arg(long)]
    stdio: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// JSON configuration file (overrides EXEC_SANDBOX_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging (stderr so stdout is free for MCP protocol)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    if !args.stdio {
        anyhow::bail!("Only --stdio mode is currently supported");
    }

    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;

    let backend: Arc<dyn IsolationBackend> = match config.backend {
        BackendType::Docker => Arc::new(DockerBackend::new(config.pull_missing_images)),
        BackendType::Host => {
            warn!("Host backend selected: programs run without container isolation");
            Arc::new(HostBackend::new())
        }
    };
    info!(
        backend = backend.name(),
        max_concurrent = config.max_concurrent,
        scratch_root = %config.scratch_root().display(),
        "Loaded configuration"
    );

    let dispatcher = Arc::new(Dispatcher::start(
        &config,
        backend,
        LanguageRegistry::builtin(),
    ));

    let served = mcp::serve_stdio(Arc::clone(&dispatcher)).await;
    dispatcher.shutdown().await;
    served
}
