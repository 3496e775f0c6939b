use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use tempo_core::config::TempoConfig;
use tempo_registry::BoxConfiguration;
use tempo_scheduler::Completion;
use tempo_store::UnitOfWork;
use tempo_timetable::CompletionOutcome;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

mod app;

// ── CLI ─────────────────────────────────────────────────────────────

/// Timetable orchestrator: schedules units of work per process and timeperiod.
#[derive(Parser, Debug)]
#[command(name = "tempo", version, about)]
struct Cli {
    /// Path to tempo.toml (default: ~/.tempo/tempo.toml).
    #[arg(long, env = "TEMPO_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every timer. Dispatched units of work are written to stdout as JSON
    /// lines; completion reports (`{"uow_id":1,"outcome":"success"}`) are
    /// read from stdin.
    Run,
    /// Switch an entry on (`process` or `process::entry`).
    Activate { name: String },
    /// Switch an entry off. Work already dispatched is left alone.
    Deactivate { name: String },
    /// Set a new trigger frequency: `every 3600` or `at [D-]HH:MM, ...`.
    ChangeInterval { name: String, frequency: String },
    Skip { name: String, timeperiod: String },
    /// Run a bucket again, cascading to parents and dependant trees.
    Reprocess { name: String, timeperiod: String },
    TriggerNow { name: String },
    /// Drain the reprocessing queue of one process.
    Flush { name: String },
    Tree { tree_name: String },
    Nodes { process_name: String, timeperiod: String },
    /// Report a worker outcome: success, failure or no_data.
    Complete { uow_id: i64, outcome: String },
    /// Record a supervisor box configuration. Takes inline JSON or `@path`.
    BoxReport { report: String },
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tempo=info".into()),
        )
        .init();

    let cli = Cli::parse();
    // configuration errors are fatal
    let config = TempoConfig::load(cli.config.as_deref())?;
    let app::App {
        scheduler,
        mut dispatched,
    } = app::build(&config)?;

    match cli.command {
        Command::Run => return run(scheduler, dispatched, config.scheduler.dispatch_buffer).await,
        Command::Activate { name } => {
            checked(scheduler.activate(&name))?;
            print_json(&json!({ "entry": name, "is_on": true }))?;
        }
        Command::Deactivate { name } => {
            checked(scheduler.deactivate(&name))?;
            print_json(&json!({ "entry": name, "is_on": false }))?;
        }
        Command::ChangeInterval { name, frequency } => {
            let frequency = checked(scheduler.change_interval(&name, &frequency))?;
            print_json(&json!({ "entry": name, "trigger_frequency": frequency.to_string() }))?;
        }
        Command::Skip { name, timeperiod } => {
            print_json(&checked(scheduler.skip(&name, &timeperiod))?)?;
        }
        Command::Reprocess { name, timeperiod } => {
            print_json(&checked(scheduler.reprocess(&name, &timeperiod))?)?;
        }
        Command::TriggerNow { name } => {
            let outcome = checked(scheduler.trigger_now(&name))?;
            print_json(&json!({ "trigger": outcome, "dispatched": drain(&mut dispatched) }))?;
        }
        Command::Flush { name } => {
            checked(scheduler.flush_reprocessing_queue(&name))?;
            print_json(&json!({ "dispatched": drain(&mut dispatched) }))?;
        }
        Command::Tree { tree_name } => {
            print_json(&*checked(scheduler.get_tree(&tree_name))?)?;
        }
        Command::Nodes {
            process_name,
            timeperiod,
        } => {
            print_json(&*checked(scheduler.get_tree_nodes(&process_name, &timeperiod))?)?;
        }
        Command::Complete { uow_id, outcome } => {
            let outcome: CompletionOutcome = outcome.parse()?;
            print_json(&checked(scheduler.report_completion(uow_id, outcome))?)?;
        }
        Command::BoxReport { report } => {
            let raw = match report.strip_prefix('@') {
                Some(path) => std::fs::read_to_string(path)?,
                None => report,
            };
            let config: BoxConfiguration = serde_json::from_str(&raw)?;
            checked(scheduler.report_box(&config))?;
            print_json(&config)?;
        }
        Command::Status => {
            print_json(&checked(scheduler.status())?)?;
        }
    }
    Ok(())
}

/// Daemon mode: timers, GC and the completion listener until Ctrl-C.
async fn run(
    scheduler: Arc<tempo_scheduler::Scheduler>,
    mut dispatched: mpsc::Receiver<UnitOfWork>,
    buffer: usize,
) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let gc = scheduler.start(shutdown_rx.clone());

    let (completion_tx, completion_rx) = mpsc::channel::<Completion>(buffer.max(1));
    let listener = tokio::spawn(Arc::clone(&scheduler).run_completions(completion_rx, shutdown_rx));

    // dispatched work → stdout
    tokio::spawn(async move {
        let mut out = tokio::io::stdout();
        while let Some(uow) = dispatched.recv().await {
            let line = match serde_json::to_string(&uow) {
                Ok(line) => line,
                Err(e) => {
                    warn!(uow_id = uow.id, "unit of work not serialisable: {e}");
                    continue;
                }
            };
            if out.write_all(format!("{line}\n").as_bytes()).await.is_err() || out.flush().await.is_err() {
                warn!("stdout closed, dispatch output stopped");
                break;
            }
        }
    });

    // stdin → completion reports
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Completion>(&line) {
                Ok(report) => {
                    if completion_tx.send(report).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("ignoring malformed completion line: {e}"),
            }
        }
    });

    info!("tempo scheduler running");
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");

    let _ = shutdown_tx.send(true);
    scheduler.join().await;
    gc.await?;
    listener.await?;
    Ok(())
}

/// Attach the short error code to a scheduler error.
fn checked<T>(result: tempo_scheduler::Result<T>) -> anyhow::Result<T> {
    result.map_err(|e| anyhow::anyhow!("[{}] {e}", e.code()))
}

fn drain(rx: &mut mpsc::Receiver<UnitOfWork>) -> Vec<UnitOfWork> {
    let mut out = Vec::new();
    while let Ok(uow) = rx.try_recv() {
        out.push(uow);
    }
    out
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
