//! Evoloop - feedback-driven script evolution CLI
//!
//! ## Commands
//!
//! - `run`: start a case, let the critic loop evolve it, collect user feedback
//! - `cases`: list archived cases
//! - `report`: print the evolution report of an archived case

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use evoloop_core::obs::CaseSpan;
use evoloop_core::{
    parse_symbols, CaseManager, ChatClient, EngineConfig, GenerationConfig, OrchestratorState,
};
use evoloop_state::{render_evolution_report, CaseArchive, FsCaseArchive, IterationRecord};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, Level};

const DEFAULT_ARCHIVE_DIR: &str = "evolution_cases";

#[derive(Parser)]
#[command(name = "evoloop")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Generate, critique and evolve data-visualisation scripts", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines and machine-readable output
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a case, run the critic loop, then apply user feedback
    Run(RunArgs),

    /// List archived cases, newest first
    Cases {
        /// Archive root directory
        #[arg(long, env = "EVOLOOP_ARCHIVE_DIR", default_value = DEFAULT_ARCHIVE_DIR)]
        archive_dir: PathBuf,
    },

    /// Print the evolution report of an archived case
    Report {
        /// Case id as printed by `run` or `cases`
        case_id: String,

        /// Archive root directory
        #[arg(long, env = "EVOLOOP_ARCHIVE_DIR", default_value = DEFAULT_ARCHIVE_DIR)]
        archive_dir: PathBuf,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Ticker symbols, comma or space separated
    #[arg(long, env = "EVOLOOP_SYMBOLS", default_value = "NVDA,TSLA")]
    symbols: String,

    /// Case name; the case id is derived from it
    #[arg(long, default_value = "ytd_gains")]
    name: String,

    /// TOML file with engine settings (flags take precedence)
    #[arg(long, env = "EVOLOOP_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "EVOLOOP_MAX_CRITIC_TURNS")]
    max_critic_turns: Option<u32>,

    #[arg(long, env = "EVOLOOP_MAX_REGEN_ATTEMPTS")]
    max_regen_attempts: Option<u32>,

    #[arg(long, env = "EVOLOOP_QUALITY_THRESHOLD")]
    quality_threshold: Option<f64>,

    /// Use the generative backend (EVOLOOP_LLM_* variables) instead of templates
    #[arg(long, env = "EVOLOOP_GENERATIVE")]
    generative: bool,

    /// Archive root directory
    #[arg(long, env = "EVOLOOP_ARCHIVE_DIR", default_value = DEFAULT_ARCHIVE_DIR)]
    archive_dir: PathBuf,

    /// Parent directory for per-case scratch directories
    #[arg(long, env = "EVOLOOP_SCRATCH_DIR")]
    scratch_dir: Option<PathBuf>,

    /// User feedback; read from stdin when omitted (empty accepts the result)
    #[arg(long)]
    feedback: Option<String>,
}

#[derive(Debug, Serialize)]
struct RunSummary {
    case_id: String,
    state: OrchestratorState,
    iterations: usize,
    critic_turns_used: u32,
    approved: bool,
    report_path: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    evoloop_core::init_tracing(cli.json, level);

    match cli.command {
        Commands::Run(args) => cmd_run(&args, cli.json).await,
        Commands::Cases { archive_dir } => cmd_cases(&archive_dir, cli.json).await,
        Commands::Report {
            case_id,
            archive_dir,
        } => cmd_report(&archive_dir, &case_id).await,
    }
}

/// Config file (or defaults), then flag overrides, then validation.
fn engine_config(args: &RunArgs) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("Failed to load config file: {:?}", path))?,
        None => EngineConfig::default(),
    };
    if let Some(turns) = args.max_critic_turns {
        config.max_critic_turns = turns;
    }
    if let Some(attempts) = args.max_regen_attempts {
        config.max_regen_attempts = attempts;
    }
    if let Some(threshold) = args.quality_threshold {
        config.quality_threshold = threshold;
    }
    if args.generative {
        config.mock_mode = false;
    }
    if let Some(dir) = &args.scratch_dir {
        config.executor.scratch_root = dir.clone();
    }
    config
        .validate()
        .context("Invalid engine configuration")?;
    Ok(config)
}

async fn cmd_run(args: &RunArgs, json: bool) -> Result<()> {
    let symbols = parse_symbols(&args.symbols);
    if symbols.is_empty() {
        anyhow::bail!("No symbols given");
    }
    let config = engine_config(args)?;
    let archive = Arc::new(
        FsCaseArchive::new(&args.archive_dir)
            .with_context(|| format!("Failed to open archive: {:?}", args.archive_dir))?,
    );

    let mut manager = CaseManager::new(config.clone(), archive.clone());
    if !config.mock_mode {
        let generation = GenerationConfig::from_env();
        let client = ChatClient::from_config(&generation)
            .context("Generative mode is not configured")?;
        manager = manager.with_generator(Arc::new(client), generation);
    }

    info!(symbols = ?symbols, mock_mode = config.mock_mode, "starting case");
    let case_id = manager
        .start_case(&args.name, &symbols)
        .await
        .context("Failed to run the critic loop")?;

    if !json {
        println!("Case {}", case_id);
        if let Some(orchestrator) = manager.orchestrator(&case_id) {
            for record in orchestrator.records() {
                println!("  {}", describe(record));
            }
        }
    }

    let feedback = match &args.feedback {
        Some(text) => text.clone(),
        None => read_feedback().await?,
    };
    let state = manager
        .submit_user_feedback(&case_id, &feedback)
        .await
        .context("Failed to apply user feedback")?;

    let summary = match manager.orchestrator(&case_id) {
        Some(orchestrator) => RunSummary {
            case_id: case_id.clone(),
            state,
            iterations: orchestrator.records().len(),
            critic_turns_used: orchestrator.critic_turns_used(),
            approved: orchestrator.approved(),
            report_path: archive.report_path(&case_id),
        },
        None => anyhow::bail!("Case {} disappeared before finalization", case_id),
    };
    manager.reset_case(&case_id)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("Iterations: {}", summary.iterations);
        println!("State:      {}", summary.state);
        println!("Approved:   {}", summary.approved);
        println!("Report:     {}", summary.report_path.display());
    }
    Ok(())
}

/// One line per iteration for the terminal.
fn describe(record: &IterationRecord) -> String {
    let run = if record.outcome.succeeded {
        "ok".to_string()
    } else if record.outcome.timed_out {
        "timed out".to_string()
    } else {
        format!("failed after {} attempt(s)", record.outcome.attempts_used)
    };
    let verdict = match &record.verdict {
        Some(v) if v.approved => format!("approved ({:.2})", v.quality_score),
        Some(v) => format!("pending ({:.2})", v.quality_score),
        None => "user".to_string(),
    };
    format!(
        "{} visual v{} data v{} run: {} verdict: {}",
        record.artifact_id(),
        record.visual_version,
        record.data_version,
        run,
        verdict
    )
}

async fn read_feedback() -> Result<String> {
    eprint!("Feedback (empty to accept): ");
    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .context("Failed to read feedback from stdin")?;
    Ok(line.trim().to_string())
}

async fn cmd_cases(archive_dir: &Path, json: bool) -> Result<()> {
    let archive = FsCaseArchive::new(archive_dir)
        .with_context(|| format!("Failed to open archive: {:?}", archive_dir))?;
    let cases = archive.list_cases().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&cases)?);
        return Ok(());
    }
    if cases.is_empty() {
        println!("No cases found in {}", archive_dir.display());
        return Ok(());
    }
    for case in cases {
        println!(
            "{}  [{}]  {} iteration(s)  {}  {}",
            case.case_id,
            case.symbols.join(","),
            case.iterations,
            if case.finalized { "finalized" } else { "open" },
            case.created_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    Ok(())
}

/// Re-synthesise the report from archived metadata.
async fn load_report(archive_dir: &Path, case_id: &str) -> Result<String> {
    let archive = FsCaseArchive::new(archive_dir)
        .with_context(|| format!("Failed to open archive: {:?}", archive_dir))?;
    let meta = archive
        .load_case(case_id)
        .await
        .with_context(|| format!("Case not found: {}", case_id))?;
    let _span = CaseSpan::enter(case_id);
    info!(iterations = meta.iterations.len(), "rendering report");
    Ok(render_evolution_report(&meta))
}

async fn cmd_report(archive_dir: &Path, case_id: &str) -> Result<()> {
    let report = load_report(archive_dir, case_id).await?;
    println!("{}", report);
    Ok(())
}
