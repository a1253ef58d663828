use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio::time::{Instant, sleep};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use distill_core::app::OrchestratorStatus;
use distill_core::domain::{Claim, ConversationalUnit, Entity, TaskType, UnitId};
use distill_core::impls::{InMemoryKnowledgeStore, InMemoryTaskStore, RuleBasedModelClient};
use distill_core::pipeline::stage_handlers;
use distill_core::ports::{Clock, KnowledgeStore};
use distill_core::{DistillConfig, Orchestrator, OrchestratorBuilder};

#[derive(Parser)]
#[command(name = "distill", version, about = "Distill conversational text into claims and entities")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run units through the pipeline and print what was learned
    Run(RunArgs),
    /// Print the effective configuration
    Config {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Args)]
struct RunArgs {
    /// TOML config file; defaults apply to anything it leaves out
    #[arg(long)]
    config: Option<PathBuf>,

    /// A unit of text; repeat for several
    #[arg(long = "text")]
    texts: Vec<String>,

    /// File with one unit per non-empty line
    #[arg(long)]
    file: Option<PathBuf>,

    #[arg(long, default_value = "default")]
    session: String,

    /// Give up waiting after this many seconds
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,
}

#[derive(Serialize)]
struct Output {
    status: OrchestratorStatus,
    processed_units: usize,
    total_units: usize,
    claims: Vec<Claim>,
    entities: Vec<Entity>,
}

fn load_config(path: Option<&PathBuf>) -> Result<DistillConfig> {
    let config = match path {
        Some(path) => DistillConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => DistillConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn collect_units(args: &RunArgs) -> Result<Vec<String>> {
    let mut texts = args.texts.clone();
    if let Some(path) = &args.file {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        texts.extend(
            raw.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string),
        );
    }
    if texts.is_empty() {
        bail!("nothing to process: pass --text or --file");
    }
    Ok(texts)
}

async fn processed_count(knowledge: &dyn KnowledgeStore, units: &[UnitId]) -> Result<usize> {
    let mut done = 0;
    for id in units {
        if knowledge.get_unit(*id).await?.is_some_and(|u| u.processed) {
            done += 1;
        }
    }
    Ok(done)
}

/// Poll until every unit is processed, the orchestrator goes idle, or the
/// deadline passes.
async fn wait_for_units(
    orch: &Orchestrator,
    knowledge: &dyn KnowledgeStore,
    units: &[UnitId],
    timeout: Duration,
) -> Result<usize> {
    let deadline = Instant::now() + timeout;
    loop {
        let done = processed_count(knowledge, units).await?;
        if done == units.len() {
            return Ok(done);
        }
        let status = orch.get_status().await?;
        if status.is_idle() && status.failed_tasks > 0 {
            warn!(failed = status.failed_tasks, "pipeline idle with failed tasks");
            return Ok(done);
        }
        if Instant::now() >= deadline {
            warn!(done, total = units.len(), "timed out waiting for units");
            return Ok(done);
        }
        sleep(Duration::from_millis(50)).await;
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let config = load_config(args.config.as_ref())?;
    let texts = collect_units(&args)?;

    let tasks = Arc::new(InMemoryTaskStore::new());
    let knowledge = Arc::new(InMemoryKnowledgeStore::new());
    let model = Arc::new(RuleBasedModelClient::new()?);

    let orch = OrchestratorBuilder::new()
        .config(config.orchestrator.clone())
        .task_store(tasks)
        .knowledge_store(knowledge.clone())
        .handlers(stage_handlers(model, &config.pipeline)?)?
        .expect_tasks(&TaskType::ALL)
        .build()?;
    orch.initialize().await?;
    orch.start();

    let mut units = Vec::with_capacity(texts.len());
    for text in texts {
        let unit = ConversationalUnit::new(text, args.session.clone(), orch.clock().now());
        units.push(orch.submit_unit(unit).await?);
    }
    info!(units = units.len(), session = %args.session, "units submitted");

    let processed =
        wait_for_units(&orch, knowledge.as_ref(), &units, Duration::from_secs(args.timeout_secs))
            .await?;
    orch.shutdown().await;

    let output = Output {
        status: orch.get_status().await?,
        processed_units: processed,
        total_units: units.len(),
        claims: knowledge.active_claims().await?,
        entities: knowledge.all_entities().await?,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Config { config } => {
            let config = load_config(config.as_ref())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
