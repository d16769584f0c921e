use std::path::{Path, PathBuf};

use clap::Parser;

use orchestrate::config::{self, OrchestrateConfig};
use orchestrate::error::OrchestrateError;
use orchestrate::events::{self, EventKind, LogEvent};
use orchestrate::graph::TaskGraph;
use orchestrate::scheduler::Scheduler;
use orchestrate::supervisor::{self, ShellWorkerBackend};
use orchestrate::types::{parse_phase, Phase};
use orchestrate::{lock, log, preflight, summary};
use orchestrate::{log_error, log_info, log_warn};

#[derive(Parser, Debug)]
#[command(
    name = "orchestrate",
    about = "Run a DAG of agent worker tasks in isolated git worktrees",
    version
)]
struct Cli {
    /// Path to the run configuration file
    #[arg(short, long, default_value = "orchestrate.toml")]
    config: PathBuf,

    /// Phase to run (discovery, main, legacy, post)
    #[arg(short, long, default_value = "main", value_parser = parse_phase)]
    phase: Phase,

    /// Print the scheduling order without creating branches or processes
    #[arg(long)]
    dry_run: bool,

    /// Include tasks marked manual in the schedule
    #[arg(long)]
    include_manual: bool,

    /// Override the project root from the config file
    #[arg(long)]
    root: Option<PathBuf>,

    /// Log level (error, warn, info, debug)
    #[arg(long, default_value = "info", value_parser = log::parse_log_level)]
    log_level: log::LogLevel,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    log::set_log_level(cli.log_level);

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            log_error!("{}", e);
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<i32, OrchestrateError> {
    supervisor::install_signal_handlers().map_err(OrchestrateError::Config)?;

    let cfg = config::load_config(&cli.config)?;
    let config_dir = cli
        .config
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let project_root = cli
        .root
        .clone()
        .unwrap_or_else(|| resolve(&cfg.project.root, &config_dir));
    let logs_base = resolve(&cfg.project.logs_dir, &project_root);
    let locks_dir = logs_base.join("locks");

    let run_id = generate_run_id();
    let run_logs_dir = logs_base.join(&run_id);

    let graph = TaskGraph::build(
        &cfg,
        &run_id,
        cli.phase,
        cli.include_manual,
        &project_root,
        &run_logs_dir,
    )?;

    if graph.is_empty() {
        log_warn!("No tasks selected for phase '{}'", cli.phase);
        return Ok(0);
    }

    if cli.dry_run {
        println!("Run {} ({} phase): {} task(s)", run_id, cli.phase, graph.len());
        for (i, id) in graph.topo_order().iter().enumerate() {
            let task = graph.get(id);
            let deps = task
                .map(|t| t.depends_on.join(", "))
                .unwrap_or_default();
            if deps.is_empty() {
                println!("  {}. {}", i + 1, id);
            } else {
                println!("  {}. {} (after: {})", i + 1, id, deps);
            }
        }
        return Ok(0);
    }

    if let Err(errors) = preflight::run_checks(&cfg, graph.tasks(), &project_root, &run_logs_dir) {
        log_error!("Preflight failed with {} error(s):", errors.len());
        for error in &errors {
            log_error!("  {}", error);
        }
        return Ok(1);
    }

    // Privileged runs take the phase lock; everything else only checks that
    // no privileged run is in flight.
    let lock_guard = if cli.phase.is_privileged() {
        Some(lock::acquire(&locks_dir, cli.phase, &run_id)?)
    } else {
        lock::check_privileged_free(&locks_dir)?;
        None
    };

    let events_path = run_logs_dir.join("events.jsonl");
    let (events_handle, events_task) =
        events::spawn_event_log(&events_path).map_err(OrchestrateError::Config)?;

    append(&events_handle, LogEvent::new(&run_id, None, EventKind::RunStart)
        .with_payload(serde_json::json!({
            "phase": cli.phase.to_string(),
            "tasks": graph.len(),
        })))
    .await;
    if lock_guard.is_some() {
        append(
            &events_handle,
            LogEvent::new(&run_id, None, EventKind::PhaseLockAcquired)
                .with_payload(serde_json::json!({ "phase": cli.phase.to_string() })),
        )
        .await;
    }

    log_info!(
        "Run {} starting: {} task(s), phase {}",
        run_id,
        graph.len(),
        cli.phase
    );

    let backend = ShellWorkerBackend;
    let scheduler = Scheduler::new(
        graph,
        &cfg,
        &backend,
        events_handle.clone(),
        &run_id,
        &project_root,
        &run_logs_dir,
    );
    let outcome = scheduler.run().await;

    if lock_guard.is_some() {
        append(
            &events_handle,
            LogEvent::new(&run_id, None, EventKind::PhaseLockReleased)
                .with_payload(serde_json::json!({ "phase": cli.phase.to_string() })),
        )
        .await;
    }
    append(
        &events_handle,
        LogEvent::new(&run_id, None, EventKind::RunEnd).with_payload(serde_json::json!({
            "succeeded": outcome.succeeded,
            "failed": outcome.failed,
            "blocked": outcome.blocked,
        })),
    )
    .await;

    // Close the writer so every record is flushed before the summary reads
    // the stream back.
    drop(events_handle);
    if let Err(e) = events_task.await {
        log_warn!("Event log writer ended abnormally: {}", e);
    }

    let summary_path = run_logs_dir.join("run-summary.md");
    match events::read_events(&events_path) {
        Ok(run_events) => {
            let report = summary::build_report(&run_events);
            if let Err(e) = summary::write_summary(&summary_path, &report) {
                log_warn!("{}", e);
            } else {
                log_info!("Summary written to {}", summary_path.display());
            }
        }
        Err(e) => log_warn!("Cannot produce summary: {}", e),
    }

    // The lock outlives the summary so a concurrent run cannot start against
    // a half-written post-mortem.
    if let Some(mut guard) = lock_guard {
        guard.release();
    }

    // Safety net for anything that survived the scheduler's own cleanup.
    supervisor::kill_all_children();

    log_info!(
        "Run {} finished: {} succeeded, {} failed, {} blocked",
        run_id,
        outcome.succeeded,
        outcome.failed,
        outcome.blocked
    );

    Ok(outcome.exit_code())
}

async fn append(handle: &events::EventLogHandle, event: LogEvent) {
    if let Err(e) = handle.append(event).await {
        log_warn!("Event append failed: {}", e);
    }
}

fn resolve(value: &str, base: &Path) -> PathBuf {
    let path = PathBuf::from(value);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

/// Timestamped run id with a short uniqueness suffix, e.g.
/// `20260830-142501-9f3a01c2`.
fn generate_run_id() -> String {
    let now = chrono::Utc::now();
    let nanos = now.timestamp_subsec_nanos();
    let suffix = nanos ^ std::process::id().rotate_left(16);
    format!("{}-{:08x}", now.format("%Y%m%d-%H%M%S"), suffix)
}
