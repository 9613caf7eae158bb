mod cache;
mod config;
mod coordination;
mod error;
mod health;
mod http;
mod repo;
#[cfg(test)]
mod test_support;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::cache::RequestedFile;
use crate::config::Config;
use crate::coordination::DownloadRegistry;
use crate::repo::RepositorySet;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "pkgcache", about = "Caching proxy for pacman package repositories")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/pkgcache/config.yaml")]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the caching proxy (default).
    Serve,
    /// Download the given `/repo/{name}/...` paths into the cache and exit.
    Prefetch {
        #[arg(required = true)]
        paths: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all request handlers and background tasks.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub repos: Arc<RepositorySet>,
    /// Single-flight table of in-flight upstream downloads.
    pub downloads: DownloadRegistry,
}

impl AppState {
    async fn new(config: Arc<Config>) -> Result<Self> {
        let repos = RepositorySet::from_config(&config)?;
        repos.check_endpoints().await?;

        let timeout = (config.download_timeout > 0)
            .then(|| Duration::from_secs(config.download_timeout));
        Ok(Self {
            config,
            repos: Arc::new(repos),
            downloads: DownloadRegistry::new(timeout),
        })
    }
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: AppState) -> Result<()> {
    let app = http::create_router(Arc::new(state.clone()));

    let listen_addr: std::net::SocketAddr = state
        .config
        .listen
        .parse()
        .context("invalid listen address")?;

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Prefetch
// ---------------------------------------------------------------------------

/// Force every path into the cache, joining downloads already in flight.
async fn run_prefetch(state: &AppState, paths: &[String]) -> Result<()> {
    let pkgs_dir = state.config.pkgs_dir();
    let mut failed = 0usize;

    for path in paths {
        let result = async {
            let file = RequestedFile::parse(&pkgs_dir, path)?;
            let repo = state.repos.get(&file.repo_name)?;
            state
                .downloads
                .populate(repo, &file)
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))
        }
        .await;

        match result {
            Ok(outcome) => tracing::info!(%path, ?outcome, "prefetched"),
            Err(e) => {
                failed += 1;
                tracing::error!(%path, error = %e, "prefetch failed");
            }
        }
    }

    anyhow::ensure!(failed == 0, "{failed} of {} prefetches failed", paths.len());
    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = config::load_config(&cli.config)?;
    let config = Arc::new(config);

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(config_path = %cli.config, "starting pkgcache");

    // ---- Ensure cache directory exists ----
    let pkgs_dir = config.pkgs_dir();
    tokio::fs::create_dir_all(&pkgs_dir)
        .await
        .with_context(|| format!("failed to create cache dir: {}", pkgs_dir.display()))?;

    // ---- App state ----
    let state = AppState::new(Arc::clone(&config)).await?;
    tracing::info!(repos = state.repos.len(), "repositories loaded");

    if let Some(Command::Prefetch { paths }) = &cli.command {
        return run_prefetch(&state, paths).await;
    }

    // ---- Spawn services ----
    let purge_handle = tokio::spawn(cache::purge::run_purge_loop(Arc::clone(&config)));

    let result = run_http_server(state).await;
    purge_handle.abort();
    if let Err(ref e) = result {
        tracing::error!(error = %e, "HTTP server failed");
    }
    result?;

    tracing::info!("pkgcache shut down cleanly");
    Ok(())
}
