//! Claimscope worker daemon.
//!
//! Leases queued runs from the shared store and executes them through the
//! configured harness registry until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};

use claimscope_core::{
    init_tracing, EngineConfig, Executor, ExecutorConfig, FsCasStore, HarnessRegistry,
    RunStore, WorkerPool, METRICS,
};
use claimscope_state::{CasStore, StoreTarget, SurrealRunStore};

#[derive(Parser)]
#[command(name = "claimscoped")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Claimscope worker daemon", long_about = None)]
struct Args {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,

    /// Store location (mem://, surrealkv://<dir>, ws(s)://...)
    #[arg(long, env = "CLAIMSCOPE_STORE")]
    store: Option<String>,

    /// Harness registry file (JSON)
    #[arg(long, env = "CLAIMSCOPE_REGISTRY")]
    registry: PathBuf,

    /// Engine configuration file (JSON)
    #[arg(long, env = "CLAIMSCOPE_CONFIG")]
    config: Option<PathBuf>,

    /// Artifact store directory
    #[arg(long, env = "CLAIMSCOPE_CAS_DIR", default_value = ".claimscope/cas")]
    cas_dir: PathBuf,

    /// Override the configured worker count
    #[arg(long)]
    workers: Option<usize>,
}

fn load_config(path: Option<&Path>, workers: Option<usize>) -> Result<EngineConfig> {
    let mut config = match path {
        Some(p) => EngineConfig::from_file(p)
            .with_context(|| format!("Failed to load config {}", p.display()))?,
        None => EngineConfig::from_env().context("Invalid CLAIMSCOPE_* environment")?,
    };
    if let Some(n) = workers {
        config.workers = n;
        config.validate()?;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    init_tracing(args.json, level);

    let config = load_config(args.config.as_deref(), args.workers)?;
    let target = match &args.store {
        Some(s) => StoreTarget::parse(s),
        None => StoreTarget::from_env(),
    };
    let store: Arc<dyn RunStore> = Arc::new(
        SurrealRunStore::connect(&target)
            .await
            .with_context(|| format!("Failed to open store at {target}"))?,
    );
    let registry = HarnessRegistry::from_file(&args.registry)
        .with_context(|| format!("Failed to load harness registry {}", args.registry.display()))?;
    info!(harnesses = registry.len(), "harness registry loaded");
    let cas: Arc<dyn CasStore> = Arc::new(FsCasStore::new(&args.cas_dir)?);

    let executor = Arc::new(Executor::new(
        Arc::new(registry),
        cas,
        ExecutorConfig::from(&config),
    ));
    let pool = WorkerPool::start(store, executor, config);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("shutdown requested");
    pool.shutdown().await;
    METRICS.flush();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_override_is_validated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{"workers": 4, "poll_interval_ms": 250}"#).unwrap();

        let config = load_config(Some(&path), None).unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.poll_interval_ms, 250);

        assert_eq!(load_config(Some(&path), Some(8)).unwrap().workers, 8);
        assert!(load_config(Some(&path), Some(0)).is_err());
    }
}
