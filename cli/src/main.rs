use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::{Deserialize, Serialize};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use taskgate::config::{EngineConfig, CONFIG_FILE_NAME};
use taskgate::model::Estimate;
use taskgate::orchestrator::{AssignmentOutcome, AssignmentReport, ReverifyReport, StatusReport};
use taskgate::state::ProgressReport;
use taskgate::{Assignment, BatchReport, OutcomeCode, Orchestrator, Task, TaskState, Transition};

#[derive(Parser)]
#[command(
    name = "taskgate",
    version,
    about = "Dispatch agent work without conflicts and accept only verified results"
)]
struct Cli {
    /// Path to the config file (default: ./taskgate.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the default configuration to a file
    InitConfig {
        /// Destination file
        #[arg(short, long, default_value = CONFIG_FILE_NAME)]
        output: PathBuf,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Add a task to the backlog
    AddTask {
        id: String,
        title: String,
        /// Lower is more urgent
        #[arg(short, long, default_value_t = 100)]
        priority: u32,
        /// XS, S, M, L or XL
        #[arg(short, long, default_value = "M")]
        estimate: String,
        /// Tracker record mirrored on every transition
        #[arg(long)]
        external_id: Option<String>,
    },
    /// Dispatch a batch of assignments read from a JSON file
    Submit {
        /// JSON array of assignments, or an object with an `assignments` array
        batch: PathBuf,
    },
    /// Show the backlog, or one task with its history
    Status { task: Option<String> },
    /// List the next tasks to work on
    Next {
        #[arg(short, long, default_value_t = 5)]
        limit: usize,
    },
    /// Re-run verification for a task's latest invocation
    Reverify { task: String },
    /// Force a task into a state, flagged as a manual override
    Override {
        task: String,
        state: String,
        #[arg(long)]
        operator: String,
        #[arg(long)]
        reason: String,
    },
    /// Move a task to BLOCKED
    Block {
        task: String,
        #[arg(long)]
        reason: String,
    },
    /// Return a blocked task to the state it was blocked from
    Unblock { task: String },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BatchFile {
    List(Vec<Assignment>),
    Wrapped { assignments: Vec<Assignment> },
}

impl BatchFile {
    fn into_assignments(self) -> Vec<Assignment> {
        match self {
            BatchFile::List(assignments) | BatchFile::Wrapped { assignments } => assignments,
        }
    }
}

#[derive(Serialize)]
struct ErrorReport<'a> {
    outcome: OutcomeCode,
    error: &'a str,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging();

    let json = cli.json;
    match run(cli).await {
        Ok(outcome) => ExitCode::from(outcome.exit_code() as u8),
        Err(err) => {
            let message = format!("{:#}", err);
            if json {
                let report = ErrorReport {
                    outcome: OutcomeCode::Error,
                    error: &message,
                };
                println!("{}", serde_json::to_string_pretty(&report).unwrap_or_default());
            } else {
                eprintln!("{} {}", "error:".red().bold(), message);
            }
            ExitCode::from(OutcomeCode::Error.exit_code() as u8)
        }
    }
}

/// Logs go to stderr so `--json` output on stdout stays parseable.
fn init_logging() {
    let filter = EnvFilter::try_from_env("TASKGATE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<OutcomeCode> {
    let Cli {
        config: config_path,
        json,
        command,
    } = cli;
    let engine = || -> Result<Orchestrator> {
        let config = load_config(config_path.as_deref())?;
        Orchestrator::from_config(&config).context("failed to start engine")
    };

    match command {
        Commands::InitConfig { output, force } => init_config(&output, force, json),
        Commands::AddTask {
            id,
            title,
            priority,
            estimate,
            external_id,
        } => {
            let orchestrator = engine()?;
            let estimate: Estimate = estimate.parse().map_err(anyhow::Error::msg)?;
            let mut task = Task::new(id, title).with_priority(priority).with_estimate(estimate);
            if let Some(external_id) = external_id {
                task = task.with_external_id(external_id);
            }
            let task = orchestrator.add_task(task).await?;
            emit(json, &task, || {
                println!("{} {} {}", "added".green().bold(), task.id.bold(), task.title);
            })?;
            Ok(OutcomeCode::Success)
        }
        Commands::Submit { batch } => {
            let orchestrator = engine()?;
            let content = fs::read_to_string(&batch)
                .with_context(|| format!("failed to read batch file {}", batch.display()))?;
            let assignments = serde_json::from_str::<BatchFile>(&content)
                .with_context(|| format!("invalid batch file {}", batch.display()))?
                .into_assignments();
            debug!(assignments = assignments.len(), "Submitting batch");
            let report = orchestrator.submit(assignments).await?;
            emit(json, &report, || print_batch(&report))?;
            Ok(report.outcome)
        }
        Commands::Status { task } => {
            let orchestrator = engine()?;
            let status = orchestrator.status(task.as_deref()).await?;
            emit(json, &status, || print_status(&status, task.is_some()))?;
            Ok(OutcomeCode::Success)
        }
        Commands::Next { limit } => {
            let orchestrator = engine()?;
            let tasks = orchestrator.state().next_ready(limit).await;
            emit(json, &tasks, || {
                if tasks.is_empty() {
                    println!("nothing ready");
                }
                for task in &tasks {
                    print_task_line(task);
                }
            })?;
            Ok(OutcomeCode::Success)
        }
        Commands::Reverify { task } => {
            let orchestrator = engine()?;
            let report = orchestrator.reverify(&task).await?;
            emit(json, &report, || print_reverify(&report))?;
            Ok(report.outcome)
        }
        Commands::Override {
            task,
            state,
            operator,
            reason,
        } => {
            let orchestrator = engine()?;
            let to: TaskState = state.parse().map_err(anyhow::Error::msg)?;
            let transition = orchestrator
                .state()
                .manual_override(&task, to, &operator, &reason)
                .await?;
            emit(json, &transition, || print_transition(&task, &transition))?;
            Ok(OutcomeCode::Success)
        }
        Commands::Block { task, reason } => {
            let orchestrator = engine()?;
            let transition = orchestrator.state().block(&task, &reason).await?;
            emit(json, &transition, || print_transition(&task, &transition))?;
            Ok(OutcomeCode::Success)
        }
        Commands::Unblock { task } => {
            let orchestrator = engine()?;
            let transition = orchestrator.state().unblock(&task).await?;
            emit(json, &transition, || print_transition(&task, &transition))?;
            Ok(OutcomeCode::Success)
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let default_path = Path::new(CONFIG_FILE_NAME);
    let path = match path {
        Some(path) => Some(path),
        None if default_path.is_file() => Some(default_path),
        None => None,
    };
    debug!(config = ?path, "Loading configuration");
    Ok(EngineConfig::load(path)?)
}

fn init_config(output: &Path, force: bool, json: bool) -> Result<OutcomeCode> {
    if output.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", output.display());
    }
    let toml = EngineConfig::default().to_toml()?;
    fs::write(output, toml).with_context(|| format!("failed to write {}", output.display()))?;
    if json {
        println!("{}", serde_json::json!({ "outcome": OutcomeCode::Success, "path": output }));
    } else {
        println!("{} {}", "wrote".green().bold(), output.display());
    }
    Ok(OutcomeCode::Success)
}

/// Print `value` as JSON, or run the text renderer.
fn emit<T: Serialize>(json: bool, value: &T, text: impl FnOnce()) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        text();
    }
    Ok(())
}

fn outcome_label(outcome: OutcomeCode) -> colored::ColoredString {
    match outcome {
        OutcomeCode::Success => outcome.as_label().green().bold(),
        OutcomeCode::VerificationFailed | OutcomeCode::Error => outcome.as_label().red().bold(),
        OutcomeCode::Conflict | OutcomeCode::BreakerOpen => outcome.as_label().yellow().bold(),
    }
}

fn print_batch(report: &BatchReport) {
    println!("{} {}", "batch:".bold(), outcome_label(report.outcome));
    for conflict in &report.conflicts {
        println!(
            "  {} {} and {} both write {}",
            "conflict".yellow(),
            conflict.first_task,
            conflict.second_task,
            conflict.resource
        );
    }
    if !report.open_breakers.is_empty() {
        println!(
            "  {} {} (try again later)",
            "breaker open:".yellow(),
            report.open_breakers.join(", ")
        );
    }
    for (index, tasks) in report.sub_batches.iter().enumerate() {
        println!("  sub-batch {}: {}", index + 1, tasks.join(", "));
    }
    for line in &report.assignments {
        print_assignment(line);
    }
    for suggestion in &report.suggestions {
        println!("  {} {}", "suggest:".cyan(), suggestion.message);
    }
}

fn print_assignment(line: &AssignmentReport) {
    let marker = match line.outcome {
        AssignmentOutcome::Applied | AssignmentOutcome::AlreadyApplied => "✓".green(),
        AssignmentOutcome::Suggested => "?".cyan(),
        AssignmentOutcome::Skipped | AssignmentOutcome::Deferred => "-".dimmed(),
        AssignmentOutcome::Unverified | AssignmentOutcome::Blocked => "✗".red(),
    };
    let state = line.state.map(|s| s.to_string()).unwrap_or_default();
    println!(
        "  {} {} [{}] {:?} {}",
        marker,
        line.task_id.bold(),
        line.worker_kind,
        line.outcome,
        state.dimmed()
    );
    if !line.failing_checks.is_empty() {
        println!("      failing: {}", line.failing_checks.join(", ").red());
    }
    if let Some(message) = &line.message {
        println!("      {}", message);
    }
}

fn print_status(status: &StatusReport, detailed: bool) {
    print_progress(&status.progress);
    for task in &status.tasks {
        print_task_line(task);
        if detailed {
            for transition in &task.history {
                println!(
                    "      {} {} -> {} by {:?}{}",
                    transition.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    transition.from_state,
                    transition.to_state,
                    transition.actor,
                    transition
                        .note
                        .as_deref()
                        .map(|n| format!(" ({})", n))
                        .unwrap_or_default()
                );
            }
        }
    }
    for breaker in &status.breakers {
        println!(
            "  breaker {} {} (failures: {})",
            breaker.resource_id,
            breaker.status.as_label(),
            breaker.failure_count
        );
    }
}

fn print_progress(progress: &ProgressReport) {
    println!(
        "{} {} of {} done, {} blocked, {} pending",
        "progress:".bold(),
        progress.done(),
        progress.total,
        progress.blocked.len(),
        progress.pending.len()
    );
}

fn print_task_line(task: &Task) {
    let state = match task.state {
        TaskState::Done => task.state.to_string().green(),
        TaskState::Blocked | TaskState::OnHold => task.state.to_string().yellow(),
        _ => task.state.to_string().normal(),
    };
    println!(
        "  {} {} [{}] p{} {:?}",
        task.id.bold(),
        task.title,
        state,
        task.priority,
        task.estimate
    );
}

fn print_reverify(report: &ReverifyReport) {
    println!("{} {}", "reverify:".bold(), outcome_label(report.outcome));
    println!("  {}", report.verification.summary());
    for (name, check) in &report.verification.checks {
        let marker = if check.pass { "✓".green() } else { "✗".red() };
        println!("  {} {} {}", marker, name, check.evidence.dimmed());
    }
    print_assignment(&report.assignment);
}

fn print_transition(task_id: &str, transition: &Transition) {
    println!(
        "{} {} -> {}",
        task_id.bold(),
        transition.from_state,
        transition.to_state.to_string().bold()
    );
}
