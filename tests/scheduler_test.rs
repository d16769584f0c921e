mod common;

use std::path::Path;
use std::time::Duration;

use orchestrate::config::{EscalationConfig, Indicator, OrchestrateConfig, WatchdogConfig};
use orchestrate::events::{self, EventKind, LogEvent};
use orchestrate::graph::TaskGraph;
use orchestrate::scheduler::{HaltReason, RunOutcome, Scheduler};
use orchestrate::supervisor::MockWorkerBackend;
use orchestrate::types::{Phase, Strategy};

/// Drive a full run with a scripted backend and return the outcome plus the
/// recorded event stream.
async fn run_scripted(
    repo: &Path,
    cfg: &OrchestrateConfig,
    scripts: Vec<Result<(u32, i32), String>>,
) -> (RunOutcome, Vec<LogEvent>) {
    let logs_dir = repo.join("logs/r1");
    let graph = TaskGraph::build(cfg, "r1", Phase::Main, false, repo, &logs_dir).unwrap();

    let events_path = logs_dir.join("events.jsonl");
    let (handle, writer) = events::spawn_event_log(&events_path).unwrap();

    let backend = MockWorkerBackend::new(scripts);
    let scheduler = Scheduler::new(graph, cfg, &backend, handle.clone(), "r1", repo, &logs_dir);

    let outcome = tokio::time::timeout(Duration::from_secs(120), scheduler.run())
        .await
        .expect("run did not quiesce in time");

    drop(handle);
    writer.await.unwrap();
    let recorded = events::read_events(&events_path).unwrap();
    (outcome, recorded)
}

fn position(recorded: &[LogEvent], kind: EventKind, task: &str) -> usize {
    recorded
        .iter()
        .position(|e| e.event == kind && e.task_id.as_deref() == Some(task))
        .unwrap_or_else(|| panic!("no {:?} event for {}", kind, task))
}

#[tokio::test]
async fn diamond_graph_runs_to_full_success() {
    let repo = common::setup_repo();
    let cfg = common::config_with_tasks(vec![
        common::task_config("a", &[]),
        common::task_config("b", &["a"]),
        common::task_config("c", &["a"]),
        common::task_config("d", &["b", "c"]),
    ]);

    let scripts = vec![Ok((0, 0)), Ok((0, 0)), Ok((0, 0)), Ok((0, 0))];
    let (outcome, recorded) = run_scripted(repo.path(), &cfg, scripts).await;

    assert_eq!(outcome.halt, HaltReason::Quiescent);
    assert_eq!(outcome.succeeded, 4);
    assert_eq!(outcome.exit_code(), 0);

    // Dependents become ready only after their dependencies end.
    assert!(position(&recorded, EventKind::TaskEnd, "a") < position(&recorded, EventKind::TaskReady, "b"));
    assert!(position(&recorded, EventKind::TaskEnd, "b") < position(&recorded, EventKind::TaskReady, "d"));
    assert!(position(&recorded, EventKind::TaskEnd, "c") < position(&recorded, EventKind::TaskReady, "d"));

    // b and c entered the schedule together, straight after a.
    assert!(position(&recorded, EventKind::TaskStart, "b") < position(&recorded, EventKind::TaskEnd, "d"));
    assert!(position(&recorded, EventKind::TaskStart, "c") < position(&recorded, EventKind::TaskEnd, "d"));

    // Every task's workspace was allocated and released.
    for task in ["a", "b", "c", "d"] {
        position(&recorded, EventKind::WorkspaceAllocated, task);
        position(&recorded, EventKind::WorkspaceReleased, task);
        assert!(
            !repo.path().join("worktrees").join(task).exists(),
            "worktree for {} not removed",
            task
        );
    }
}

#[tokio::test]
async fn failure_blocks_the_dependent_chain() {
    let repo = common::setup_repo();
    let cfg = common::config_with_tasks(vec![
        common::task_config("a", &[]),
        common::task_config("b", &["a"]),
        common::task_config("c", &["b"]),
    ]);

    let scripts = vec![Ok((0, 1))];
    let (outcome, recorded) = run_scripted(repo.path(), &cfg, scripts).await;

    assert_eq!(outcome.failed, 1);
    assert_eq!(outcome.blocked, 2);
    assert_eq!(outcome.exit_code(), 3);

    position(&recorded, EventKind::TaskBlocked, "b");
    position(&recorded, EventKind::TaskBlocked, "c");
    // Blocked tasks never started.
    assert!(!recorded
        .iter()
        .any(|e| e.event == EventKind::TaskStart && e.task_id.as_deref() == Some("b")));
}

#[tokio::test]
async fn launch_failure_fails_only_the_task() {
    let repo = common::setup_repo();
    let cfg = common::config_with_tasks(vec![
        common::task_config("a", &[]),
        common::task_config("b", &[]),
    ]);

    let scripts = vec![Err("missing binary".to_string()), Ok((0, 0))];
    let (outcome, recorded) = run_scripted(repo.path(), &cfg, scripts).await;

    assert_eq!(outcome.failed, 1);
    assert_eq!(outcome.succeeded, 1);

    let end_a = &recorded[position(&recorded, EventKind::TaskEnd, "a")];
    let reason = end_a.payload["reason"].as_str().unwrap();
    assert!(reason.contains("launch failed"), "unexpected reason: {}", reason);
    // The failed launch still released its workspace.
    position(&recorded, EventKind::WorkspaceReleased, "a");
}

#[tokio::test]
async fn occupied_workspace_fails_the_task_and_no_worker_starts() {
    let repo = common::setup_repo();
    let cfg = common::config_with_tasks(vec![
        common::task_config("a", &[]),
        common::task_config("b", &["a"]),
    ]);

    // A plain directory squats on a's workspace path inside the checkout.
    let occupied = repo.path().join("worktrees/a");
    std::fs::create_dir_all(&occupied).unwrap();
    std::fs::write(occupied.join("junk.txt"), "junk").unwrap();

    let scripts = vec![Ok((0, 0))];
    let (outcome, recorded) = run_scripted(repo.path(), &cfg, scripts).await;

    // The conflict fails a itself; only the dependent is blocked.
    assert_eq!(outcome.failed, 1);
    assert_eq!(outcome.blocked, 1);
    assert_eq!(outcome.succeeded, 0);

    // No worker ever launched against the unisolated directory.
    assert!(!recorded.iter().any(|e| e.event == EventKind::TaskStart));

    let end_a = &recorded[position(&recorded, EventKind::TaskEnd, "a")];
    assert_eq!(end_a.payload["status"], "failed");
    let reason = end_a.payload["reason"].as_str().unwrap();
    assert!(reason.contains("not a git worktree"), "unexpected reason: {}", reason);

    position(&recorded, EventKind::TaskBlocked, "b");
    // The squatting directory is left exactly as found.
    assert!(occupied.join("junk.txt").exists());
}

#[tokio::test]
async fn join_task_waits_for_the_slower_dependency() {
    let repo = common::setup_repo();
    let cfg = common::config_with_tasks(vec![
        common::task_config("a", &[]),
        common::task_config("b", &[]),
        common::task_config("c", &["a", "b"]),
    ]);

    // a exits immediately; b takes several polls.
    let scripts = vec![Ok((0, 0)), Ok((3, 0)), Ok((0, 0))];
    let (outcome, recorded) = run_scripted(repo.path(), &cfg, scripts).await;

    assert_eq!(outcome.succeeded, 3);
    let ready_c = position(&recorded, EventKind::TaskReady, "c");
    assert!(position(&recorded, EventKind::TaskEnd, "a") < ready_c);
    assert!(position(&recorded, EventKind::TaskEnd, "b") < ready_c);
}

fn fast_watchdog() -> WatchdogConfig {
    WatchdogConfig {
        check_interval_secs: 1,
        stuck_threshold_secs: 2,
        min_log_growth_bytes: 64,
        // The mock worker writes nothing, so only log growth is sampled and
        // the task reliably stalls.
        indicators: vec![Indicator::LogGrowth],
    }
}

#[tokio::test]
async fn stuck_task_walks_the_escalation_ladder_to_failure() {
    let repo = common::setup_repo();
    let mut task = common::task_config("a", &[]);
    task.watchdog = Some(fast_watchdog());
    task.escalation = Some(EscalationConfig {
        strategies: vec![Strategy::Notify, Strategy::KillAndRetry],
        max_retries: 1,
        interrupt_grace_secs: 1,
        alternate_runner: None,
        reduced_prompt: None,
    });
    let cfg = common::config_with_tasks(vec![task]);

    // Neither launch ever exits on its own.
    let scripts = vec![Ok((u32::MAX, 1)), Ok((u32::MAX, 1))];
    let (outcome, recorded) = run_scripted(repo.path(), &cfg, scripts).await;

    assert_eq!(outcome.failed, 1);
    assert_eq!(outcome.exit_code(), 1);

    let stuck_count = recorded
        .iter()
        .filter(|e| e.event == EventKind::StuckTaskDetected)
        .count();
    assert!(stuck_count >= 2, "one detection per episode, got {}", stuck_count);

    let strategies: Vec<&str> = recorded
        .iter()
        .filter(|e| e.event == EventKind::EscalationAttempt)
        .filter_map(|e| e.payload["strategy"].as_str())
        .collect();
    assert_eq!(strategies, vec!["notify", "kill_and_retry"]);

    // Two launches: the original and the retry.
    let starts = recorded
        .iter()
        .filter(|e| e.event == EventKind::TaskStart)
        .count();
    assert_eq!(starts, 2);

    let exhausted = recorded.iter().any(|e| {
        e.event == EventKind::EscalationOutcome && e.payload["outcome"] == "exhausted"
    });
    assert!(exhausted, "missing exhausted outcome event");

    let last_end = recorded
        .iter()
        .filter(|e| e.event == EventKind::TaskEnd && e.task_id.as_deref() == Some("a"))
        .next_back()
        .unwrap();
    assert_eq!(
        last_end.payload["reason"].as_str(),
        Some("escalation strategies exhausted")
    );
}

#[tokio::test]
async fn unanswered_interrupt_exhausts_and_fails() {
    let repo = common::setup_repo();
    let mut task = common::task_config("a", &[]);
    task.watchdog = Some(fast_watchdog());
    task.escalation = Some(EscalationConfig {
        strategies: vec![Strategy::Interrupt],
        max_retries: 1,
        interrupt_grace_secs: 1,
        alternate_runner: None,
        reduced_prompt: None,
    });
    let cfg = common::config_with_tasks(vec![task]);

    // The mock ignores graceful signals, so the grace window expires.
    let scripts = vec![Ok((u32::MAX, 1))];
    let (outcome, recorded) = run_scripted(repo.path(), &cfg, scripts).await;

    assert_eq!(outcome.failed, 1);
    let strategies: Vec<&str> = recorded
        .iter()
        .filter(|e| e.event == EventKind::EscalationAttempt)
        .filter_map(|e| e.payload["strategy"].as_str())
        .collect();
    assert_eq!(strategies, vec!["interrupt"]);
    assert!(recorded.iter().any(|e| {
        e.event == EventKind::EscalationOutcome && e.payload["outcome"] == "exhausted"
    }));
}
