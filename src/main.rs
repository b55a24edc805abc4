use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use conductor::bus::ApprovalSignal;
use conductor::config::Config;
use conductor::coordinator::{Coordinator, RunContext};
use conductor::exec::AgentRegistry;
use conductor::plan::Plan;
use conductor::report::{build, render, ReportFormat, ReportKind};
use conductor::schema::SchemaRegistry;
use conductor::store::ArtifactStore;
use conductor::tracker::RunSnapshot;
use conductor::workflow::default_workflow;

/// Exit code for "thing not found" per the CLI contract.
const EXIT_NOT_FOUND: i32 = 64;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(version, about = "Orchestration core for a multi-agent build pipeline")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start, inspect, or cancel runs
    Run {
        #[command(subcommand)]
        command: RunCommands,
    },
    /// Read stored artifacts
    Artifact {
        #[command(subcommand)]
        command: ArtifactCommands,
    },
    /// Answer approval gates
    Approval {
        #[command(subcommand)]
        command: ApprovalCommands,
    },
}

#[derive(Subcommand)]
pub enum RunCommands {
    /// Execute a plan through the workflow
    Start {
        #[arg(long)]
        plan: String,
        #[arg(long)]
        profile: Option<String>,
        /// Config overrides, e.g. --override core.parallelism=8
        #[arg(long = "override", value_parser = parse_key_value)]
        overrides: Vec<(String, String)>,
    },
    /// Show the status of a run
    Status { run_id: String },
    /// Request cancellation of a running run
    Cancel { run_id: String },
    /// List known runs, most recent first
    List,
}

#[derive(Subcommand)]
pub enum ArtifactCommands {
    /// Print an artifact's bytes
    Get {
        artifact_id: String,
        #[arg(long)]
        version: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum ApprovalCommands {
    /// Decide a pending approval request
    Decide {
        request_id: String,
        #[arg(long, value_parser = ["approved", "rejected"])]
        outcome: String,
        #[arg(long)]
        notes: Option<String>,
    },
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) => Ok((key.to_string(), value.to_string())),
        None => Err(format!("expected key=value, got '{raw}'")),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(if cli.verbose { "info" } else { "warn" })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let code = match dispatch(&cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            1
        }
    };
    std::process::exit(code);
}

async fn dispatch(cli: &Cli) -> Result<i32> {
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("failed to get current directory")?,
    };

    match &cli.command {
        Commands::Run { command } => match command {
            RunCommands::Start {
                plan,
                profile,
                overrides,
            } => cmd_run_start(&project_dir, plan, profile.as_deref(), overrides).await,
            RunCommands::Status { run_id } => cmd_run_status(&project_dir, run_id),
            RunCommands::Cancel { run_id } => cmd_run_cancel(&project_dir, run_id),
            RunCommands::List => cmd_run_list(&project_dir),
        },
        Commands::Artifact { command } => match command {
            ArtifactCommands::Get {
                artifact_id,
                version,
            } => cmd_artifact_get(&project_dir, artifact_id, version.as_deref()),
        },
        Commands::Approval { command } => match command {
            ApprovalCommands::Decide {
                request_id,
                outcome,
                notes,
            } => cmd_approval_decide(&project_dir, request_id, outcome, notes.clone()),
        },
    }
}

async fn cmd_run_start(
    project_dir: &PathBuf,
    plan_id: &str,
    profile: Option<&str>,
    overrides: &[(String, String)],
) -> Result<i32> {
    let config = Config::load(project_dir, profile, overrides)?;
    config.ensure_directories()?;

    let plan_path = Plan::path_for(&config.plans_dir, plan_id);
    let plan = Plan::load(&plan_path)?;
    let request = plan.request.clone();

    let registry = Arc::new(AgentRegistry::new());
    let schemas = Arc::new(SchemaRegistry::new());
    let workflow = Arc::new(default_workflow());
    let ctx = RunContext::new(config, &plan, workflow, registry, schemas)?;

    println!("run {} started for plan '{}'", ctx.run_id, plan_id);
    let coordinator = Coordinator::new(ctx);
    let outcome = coordinator.run(request).await?;

    let snapshot = load_snapshot(&outcome.run_dir.join("run.json"))?;
    println!(
        "{}",
        render(
            &build(ReportKind::Completion, &snapshot),
            ReportFormat::Plain
        )
    );
    for path in &outcome.report_paths {
        println!("report: {}", path.display());
    }
    Ok(outcome.status.exit_code())
}

fn load_snapshot(path: &PathBuf) -> Result<RunSnapshot> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
}

fn cmd_run_status(project_dir: &PathBuf, run_id: &str) -> Result<i32> {
    let config = Config::load(project_dir, None, &[])?;
    let run_file = config.run_dir(run_id).join("run.json");
    if !run_file.is_file() {
        eprintln!("run {run_id} not found");
        return Ok(EXIT_NOT_FOUND);
    }
    let snapshot = load_snapshot(&run_file)?;
    println!(
        "{}",
        render(&build(ReportKind::Status, &snapshot), ReportFormat::Plain)
    );
    Ok(0)
}

fn cmd_run_cancel(project_dir: &PathBuf, run_id: &str) -> Result<i32> {
    let config = Config::load(project_dir, None, &[])?;
    let run_dir = config.run_dir(run_id);
    if !run_dir.is_dir() {
        eprintln!("run {run_id} not found");
        return Ok(EXIT_NOT_FOUND);
    }
    std::fs::write(run_dir.join("cancel"), b"")
        .context("failed to write cancel marker")?;
    println!("cancellation requested for run {run_id}");
    Ok(0)
}

fn cmd_run_list(project_dir: &PathBuf) -> Result<i32> {
    let config = Config::load(project_dir, None, &[])?;
    if !config.runs_dir.is_dir() {
        return Ok(0);
    }
    let mut entries: Vec<(std::time::SystemTime, String, String)> = Vec::new();
    for entry in std::fs::read_dir(&config.runs_dir)?.flatten() {
        let run_file = entry.path().join("run.json");
        if !run_file.is_file() {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
        let status = load_snapshot(&run_file)
            .map(|s| format!("{:?}", s.status).to_lowercase())
            .unwrap_or_else(|_| "unreadable".to_string());
        let name = entry.file_name().to_string_lossy().into_owned();
        entries.push((modified, name, status));
    }
    entries.sort_by(|a, b| b.0.cmp(&a.0));
    for (_, name, status) in entries {
        println!("{name}  {status}");
    }
    Ok(0)
}

fn cmd_artifact_get(
    project_dir: &PathBuf,
    artifact_id: &str,
    version: Option<&str>,
) -> Result<i32> {
    let config = Config::load(project_dir, None, &[])?;
    let store = ArtifactStore::open(&config.store_dir)?;
    match store.get(artifact_id, version) {
        Ok(bytes) => {
            println!("{}", String::from_utf8_lossy(&bytes));
            Ok(0)
        }
        Err(err) => {
            eprintln!("{err}");
            Ok(EXIT_NOT_FOUND)
        }
    }
}

fn cmd_approval_decide(
    project_dir: &PathBuf,
    request_id: &str,
    outcome: &str,
    notes: Option<String>,
) -> Result<i32> {
    let config = Config::load(project_dir, None, &[])?;
    config.ensure_directories()?;
    let Ok(request_id) = uuid::Uuid::parse_str(request_id) else {
        eprintln!("'{request_id}' is not a valid request id");
        return Ok(EXIT_NOT_FOUND);
    };
    let signal = if outcome == "approved" {
        ApprovalSignal::Approved { notes }
    } else {
        ApprovalSignal::Rejected { notes }
    };
    let path = config.approvals_dir.join(format!("{request_id}.json"));
    let content = serde_json::to_string_pretty(&signal)?;
    std::fs::write(&path, content).context("failed to write approval decision")?;
    println!("decision recorded for request {request_id}");
    Ok(0)
}
