//! Claimscope CLI
//!
//! The `claimscope` command loads claims, submits reproduction runs and
//! reads their results back.
//!
//! ## Commands
//!
//! - `claim add|list|delete`: manage the claim table
//! - `submit`: queue a run (optionally wait for it)
//! - `run`: submit and execute in-process with a local harness registry
//! - `status`, `runs`, `trace`: read run snapshots and provenance
//! - `verify`: re-hash a run's artifacts in the local CAS

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};

use claimscope_core::telemetry::{init_tracing_with_writer, Writer};
use claimscope_core::{
    verify_artifact, ClaimId, ClaimRecord, EngineConfig, Executor, ExecutorConfig, FsCasStore,
    HarnessRegistry, ModelConfig, Provider, RunId, RunScheduler, RunSnapshot, RunStore, Worker,
};
use claimscope_state::{CasStore, StoreTarget, SurrealRunStore};

#[derive(Parser)]
#[command(name = "claimscope")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Reproduce published AI-benchmark claims", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Store location: mem://, surrealkv://<dir> or a ws(s):// URL.
    /// Falls back to SURREALDB_* variables, then .claimscope/db.
    #[arg(long, global = true, env = "CLAIMSCOPE_STORE")]
    store: Option<String>,

    /// Engine configuration file (JSON)
    #[arg(long, global = true, env = "CLAIMSCOPE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage claims
    Claim {
        #[command(subcommand)]
        action: ClaimAction,
    },

    /// Queue a reproduction run for a claim
    Submit {
        claim_id: String,

        #[command(flatten)]
        model: ModelArgs,

        /// Poll until the run reaches a terminal status
        #[arg(long)]
        wait: bool,

        /// Polling period while waiting (milliseconds)
        #[arg(long, default_value = "1000")]
        poll_ms: u64,
    },

    /// Submit a run and execute it in this process
    Run {
        claim_id: String,

        #[command(flatten)]
        model: ModelArgs,

        /// Harness registry file (JSON)
        #[arg(long, env = "CLAIMSCOPE_REGISTRY")]
        registry: PathBuf,

        /// Artifact store directory
        #[arg(long, env = "CLAIMSCOPE_CAS_DIR", default_value = ".claimscope/cas")]
        cas_dir: PathBuf,
    },

    /// Show a run snapshot
    Status { run_id: String },

    /// List a claim's runs, newest first
    Runs { claim_id: String },

    /// Print the provenance trace of a terminal run
    Trace { run_id: String },

    /// Re-hash a run's artifacts against the local CAS
    Verify {
        run_id: String,

        #[arg(long, env = "CLAIMSCOPE_CAS_DIR", default_value = ".claimscope/cas")]
        cas_dir: PathBuf,
    },
}

#[derive(Subcommand)]
enum ClaimAction {
    /// Load claims from a JSON file (one object or an array)
    Add { file: PathBuf },
    /// List claims
    List,
    /// Delete a claim with its runs, artifacts and traces
    Delete { claim_id: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum ProviderArg {
    Openai,
    Anthropic,
    Openrouter,
    Vllm,
}

impl From<ProviderArg> for Provider {
    fn from(p: ProviderArg) -> Self {
        match p {
            ProviderArg::Openai => Provider::OpenAi,
            ProviderArg::Anthropic => Provider::Anthropic,
            ProviderArg::Openrouter => Provider::OpenRouter,
            ProviderArg::Vllm => Provider::Vllm,
        }
    }
}

#[derive(clap::Args)]
struct ModelArgs {
    /// Model name under test
    #[arg(long)]
    model: String,

    #[arg(long, value_enum, default_value = "openai")]
    provider: ProviderArg,

    /// Name of the secret holding the API key (never the key itself)
    #[arg(long)]
    api_key_ref: Option<String>,

    /// Cost ceiling (USD)
    #[arg(long, default_value = "0.5")]
    budget: f64,

    /// USD per million prompt tokens
    #[arg(long)]
    price_input: Option<f64>,

    /// USD per million output tokens
    #[arg(long)]
    price_output: Option<f64>,
}

impl ModelArgs {
    fn model_config(&self) -> ModelConfig {
        ModelConfig {
            provider: self.provider.into(),
            name: self.model.clone(),
            api_key_ref: self.api_key_ref.clone(),
            price_input_per_mtok: self.price_input,
            price_output_per_mtok: self.price_output,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::WARN };
    init_tracing_with_writer(cli.json, level, Writer::Stderr);

    let config = load_config(cli.config.as_deref())?;
    let target = match &cli.store {
        Some(s) => StoreTarget::parse(s),
        None => StoreTarget::from_env(),
    };
    let store: Arc<dyn RunStore> = Arc::new(
        SurrealRunStore::connect(&target)
            .await
            .with_context(|| format!("Failed to open store at {target}"))?,
    );
    let scheduler = RunScheduler::new(store, config);

    match cli.command {
        Commands::Claim { action } => match action {
            ClaimAction::Add { file } => cmd_claim_add(&scheduler, &file).await,
            ClaimAction::List => cmd_claim_list(&scheduler).await,
            ClaimAction::Delete { claim_id } => cmd_claim_delete(&scheduler, &claim_id).await,
        },
        Commands::Submit {
            claim_id,
            model,
            wait,
            poll_ms,
        } => {
            let run_id = cmd_submit(&scheduler, &claim_id, &model).await?;
            if wait {
                let snapshot =
                    wait_for_terminal(&scheduler, &run_id, Duration::from_millis(poll_ms)).await?;
                print_json(&snapshot)?;
            }
            Ok(())
        }
        Commands::Run {
            claim_id,
            model,
            registry,
            cas_dir,
        } => cmd_run(&scheduler, &claim_id, &model, &registry, &cas_dir).await,
        Commands::Status { run_id } => cmd_status(&scheduler, &run_id).await,
        Commands::Runs { claim_id } => cmd_runs(&scheduler, &claim_id).await,
        Commands::Trace { run_id } => cmd_trace(&scheduler, &run_id).await,
        Commands::Verify { run_id, cas_dir } => cmd_verify(&scheduler, &run_id, &cas_dir).await,
    }
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let config = match path {
        Some(p) => EngineConfig::from_file(p)
            .with_context(|| format!("Failed to load config {}", p.display()))?,
        None => EngineConfig::from_env().context("Invalid CLAIMSCOPE_* environment")?,
    };
    Ok(config)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Parse a claims file holding either one claim or an array of claims.
fn read_claims(path: &Path) -> Result<Vec<ClaimRecord>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let value: serde_json::Value =
        serde_json::from_str(&raw).with_context(|| format!("Invalid JSON in {}", path.display()))?;
    let claims = match value {
        serde_json::Value::Array(_) => serde_json::from_value(value)?,
        other => vec![serde_json::from_value(other)?],
    };
    Ok(claims)
}

async fn cmd_claim_add(scheduler: &RunScheduler, file: &Path) -> Result<()> {
    let claims = read_claims(file)?;
    if claims.is_empty() {
        bail!("{} contains no claims", file.display());
    }
    for claim in claims {
        let claim_id = scheduler.add_claim(claim).await?;
        println!("Added claim {}", claim_id);
    }
    Ok(())
}

async fn cmd_claim_list(scheduler: &RunScheduler) -> Result<()> {
    let claims = scheduler.store().list_claims().await?;
    if claims.is_empty() {
        println!("No claims found. Run 'claimscope claim add <file>' first.");
        return Ok(());
    }
    for claim in claims {
        let reference = claim
            .reference_score
            .map(|r| format!("{r:.3}"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}  {}  {}/{}  {} = {}",
            claim.claim_id, claim.model, claim.domain, claim.task, claim.metric, reference
        );
    }
    Ok(())
}

async fn cmd_claim_delete(scheduler: &RunScheduler, claim_id: &str) -> Result<()> {
    scheduler
        .store()
        .delete_claim(&ClaimId::from(claim_id))
        .await
        .with_context(|| format!("Failed to delete claim '{claim_id}'"))?;
    println!("Deleted claim '{}'", claim_id);
    Ok(())
}

async fn cmd_submit(scheduler: &RunScheduler, claim_id: &str, model: &ModelArgs) -> Result<RunId> {
    let run_id = scheduler
        .submit_run(&ClaimId::from(claim_id), model.model_config(), model.budget)
        .await?;
    println!("{}", run_id);
    Ok(run_id)
}

async fn wait_for_terminal(scheduler: &RunScheduler, run_id: &RunId, poll: Duration) -> Result<RunSnapshot> {
    loop {
        let snapshot = scheduler.get_run(run_id).await?;
        if snapshot.status.is_terminal() {
            return Ok(snapshot);
        }
        if let Some(p) = &snapshot.ops.progress {
            info!(
                units_completed = p.units_completed,
                units_total = ?p.units_total,
                "run in progress"
            );
        }
        tokio::time::sleep(poll).await;
    }
}

async fn cmd_run(
    scheduler: &RunScheduler,
    claim_id: &str,
    model: &ModelArgs,
    registry: &Path,
    cas_dir: &Path,
) -> Result<()> {
    let registry = HarnessRegistry::from_file(registry)
        .with_context(|| format!("Failed to load harness registry {}", registry.display()))?;
    let cas: Arc<dyn CasStore> = Arc::new(FsCasStore::new(cas_dir)?);
    let executor = Arc::new(Executor::new(
        Arc::new(registry),
        cas,
        ExecutorConfig::from(scheduler.config()),
    ));

    let run_id = cmd_submit(scheduler, claim_id, model).await?;
    let worker = Worker::new(
        format!("cli-{}", std::process::id()),
        scheduler.store().clone(),
        executor,
        scheduler.config().clone(),
    );
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.cancel();
            }
        });
    }

    loop {
        let snapshot = scheduler.get_run(&run_id).await?;
        if snapshot.status.is_terminal() {
            return print_json(&snapshot);
        }
        if shutdown.is_cancelled() {
            bail!("interrupted; run {} was released back to the queue", run_id);
        }
        if worker.try_once(&shutdown).await?.is_none() {
            tokio::time::sleep(scheduler.config().poll_interval()).await;
        }
    }
}

async fn cmd_status(scheduler: &RunScheduler, run_id: &str) -> Result<()> {
    let snapshot = scheduler.get_run(&RunId::from(run_id)).await?;
    print_json(&snapshot)
}

async fn cmd_runs(scheduler: &RunScheduler, claim_id: &str) -> Result<()> {
    let claim_runs = scheduler.get_claim_runs(&ClaimId::from(claim_id)).await?;
    if claim_runs.runs.is_empty() {
        println!("No runs for claim '{}'", claim_id);
        return Ok(());
    }
    for run in claim_runs.runs {
        let score = run
            .score_value
            .map(|s| format!("{s:.3}"))
            .unwrap_or_else(|| "-".to_string());
        let label = run.status_label.map(|l| l.as_str()).unwrap_or("-");
        println!(
            "{}  {}  {:<9}  {:>6}  {:<14}  ${:.4}  {}",
            run.run_id,
            run.created_at.format("%Y-%m-%d %H:%M:%S"),
            run.status.as_str(),
            score,
            label,
            run.cost_usd,
            run.model
        );
    }
    Ok(())
}

async fn cmd_trace(scheduler: &RunScheduler, run_id: &str) -> Result<()> {
    let trace = scheduler
        .store()
        .get_trace(&RunId::from(run_id))
        .await
        .with_context(|| format!("No trace for run '{run_id}'"))?;
    print_json(&trace)
}

async fn cmd_verify(scheduler: &RunScheduler, run_id: &str, cas_dir: &Path) -> Result<()> {
    let cas = FsCasStore::new(cas_dir)?;
    let artifacts = scheduler.store().list_artifacts(&RunId::from(run_id)).await?;
    if artifacts.is_empty() {
        println!("Run '{}' has no artifacts", run_id);
        return Ok(());
    }
    let mut bad = 0;
    for artifact in &artifacts {
        let ok = verify_artifact(&cas, artifact).await.unwrap_or(false);
        if !ok {
            bad += 1;
        }
        println!(
            "{}  {}  {}",
            if ok { "ok  " } else { "FAIL" },
            artifact.sha256.short(),
            artifact.name
        );
    }
    if bad > 0 {
        bail!("{bad} of {} artifacts failed verification", artifacts.len());
    }
    Ok(())
}
