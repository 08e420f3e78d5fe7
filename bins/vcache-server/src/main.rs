use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use serde::{Deserialize, Serialize};

use vcache_engine::{CacheConfig, ICacheEngine};
use vcache_fs::FsCacheEngine;
use vcache_logging::LogConfig;
use vcache_mem::MemCacheEngine;

/// vcache asset cache server
#[derive(Parser, Debug)]
#[command(name = "vcache-server", version, about)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "vcache-server.toml")]
    config: String,

    /// Dump default configuration and exit
    #[arg(long)]
    dump_default_config: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Backend {
    Memory,
    Filesystem,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ServerConfig {
    #[serde(default = "default_backend")]
    backend: Backend,

    #[serde(default)]
    cache: CacheConfig,

    #[serde(default)]
    log: LogConfig,
}

fn default_backend() -> Backend {
    Backend::Filesystem
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            cache: CacheConfig::default(),
            log: LogConfig::default(),
        }
    }
}

fn load_config(path: &Path) -> anyhow::Result<ServerConfig> {
    if !path.exists() {
        return Ok(ServerConfig::default());
    }
    let content = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

/// Wait for a shutdown signal (CTRL+C or SIGTERM).
async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");
    tokio::select! {
        _ = ctrl_c => { tracing::info!("Received CTRL+C"); }
        _ = sigterm.recv() => { tracing::info!("Received SIGTERM"); }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.dump_default_config {
        println!("{}", toml::to_string_pretty(&ServerConfig::default())?);
        return Ok(());
    }

    let config = load_config(Path::new(&args.config))?;
    let _log_guard = vcache_logging::init_logging(&config.log);

    tracing::info!(config = %args.config, backend = ?config.backend, "Starting vcache server");

    let engine: Arc<dyn ICacheEngine> = match config.backend {
        Backend::Memory => Arc::new(MemCacheEngine::new()),
        Backend::Filesystem => Arc::new(FsCacheEngine::new()),
    };
    engine.init(&config.cache).await?;

    tracing::info!(
        cache_path = %config.cache.cache_path.display(),
        high_reliability = config.cache.high_reliability,
        "Cache engine ready"
    );

    wait_for_shutdown_signal().await;

    tracing::info!("Shutting down");
    engine.shutdown().await?;

    Ok(())
}
