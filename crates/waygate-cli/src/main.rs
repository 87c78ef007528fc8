//! waygate — MCP gateway with sandboxed code execution.
//!
//! `waygate init` writes a default configuration; `waygate serve` boots
//! the gateway. Exit codes: 0 success, 1 missing configuration, 2 any
//! other startup failure.

#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use waygate_config::{ConfigError, DEFAULT_CONFIG_FILE, GatewayConfig};
use waygate_gateway::GatewayContext;

#[derive(Parser)]
#[command(name = "waygate")]
#[command(version, about = "MCP gateway with sandboxed code execution")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Path to write (default: ./waygate.json)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Boot the gateway
    Serve {
        /// Path to the configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on
        #[arg(long, default_value_t = 7888)]
        port: u16,

        /// Bind address (auto-switches to 0.0.0.0 inside a container)
        #[arg(long)]
        bind: Option<String>,

        /// Open the UI in a browser after startup
        #[arg(long)]
        open: bool,

        /// Do not serve the root UI page
        #[arg(long)]
        no_ui: bool,

        /// Wall-clock limit override, milliseconds
        #[arg(long, env = "TIMEOUT_MS")]
        timeout: Option<u64>,

        /// Memory limit override, megabytes
        #[arg(long, env = "MAX_MEMORY_MB")]
        max_memory: Option<u64>,

        /// Stdout limit override, bytes
        #[arg(long, env = "MAX_STDOUT_BYTES")]
        max_stdout: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = tracing_subscriber::EnvFilter::try_from_env("WAYGATE_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("waygate=info,tower_http=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if e.downcast_ref::<ConfigError>()
                .is_some_and(|c| matches!(c, ConfigError::NotFound(_)))
            {
                error!("{e} (run `waygate init` first)");
                ExitCode::from(1)
            } else {
                error!("{e:#}");
                ExitCode::from(2)
            }
        },
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Init { config, force } => init(config, force),
        Commands::Serve {
            config,
            port,
            bind,
            open,
            no_ui,
            timeout,
            max_memory,
            max_stdout,
        } => {
            serve(
                config, port, bind, open, no_ui, timeout, max_memory, max_stdout,
            )
            .await
        },
    }
}

fn init(path: Option<PathBuf>, force: bool) -> Result<()> {
    let path = path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    GatewayConfig::default()
        .save(&path)
        .with_context(|| format!("writing {}", path.display()))?;
    info!("wrote default configuration to {}", path.display());
    Ok(())
}

#[allow(clippy::too_many_arguments, clippy::fn_params_excessive_bools)]
async fn serve(
    config_path: Option<PathBuf>,
    port: u16,
    bind: Option<String>,
    open: bool,
    no_ui: bool,
    timeout: Option<u64>,
    max_memory: Option<u64>,
    max_stdout: Option<u64>,
) -> Result<()> {
    let config_path = config_path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    let mut config = GatewayConfig::load(&config_path)?;

    // Flag and environment overrides only ever replace the default limits;
    // client policies still intersect against these.
    if let Some(ms) = timeout {
        config.policy.limits.timeout_ms = ms;
    }
    if let Some(mb) = max_memory {
        config.policy.limits.mem_mb = mb;
    }
    if let Some(bytes) = max_stdout {
        config.policy.limits.stdout_bytes = bytes;
    }

    let bind = bind.unwrap_or_else(|| {
        if in_container() {
            "0.0.0.0".to_string()
        } else {
            "127.0.0.1".to_string()
        }
    });

    let ctx = GatewayContext::initialize(config, no_ui)
        .map_err(|e| anyhow::anyhow!("gateway startup: {e}"))?;

    let listener = tokio::net::TcpListener::bind(format!("{bind}:{port}"))
        .await
        .with_context(|| format!("binding {bind}:{port}"))?;
    let addr = listener.local_addr()?;
    info!("waygate listening on http://{addr}");

    if open {
        open_browser(&format!("http://127.0.0.1:{port}/"));
    }

    let app = waygate_gateway::router(Arc::clone(&ctx));
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .context("serving")?;

    ctx.shutdown().await;
    Ok(())
}

fn in_container() -> bool {
    Path::new("/.dockerenv").exists() || Path::new("/run/.containerenv").exists()
}

fn open_browser(url: &str) {
    let opener = if cfg!(target_os = "macos") {
        "open"
    } else {
        "xdg-open"
    };
    if let Err(e) = std::process::Command::new(opener).arg(url).spawn() {
        warn!("could not open browser: {e}");
    }
}
