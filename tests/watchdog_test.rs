mod common;

use std::time::Duration;

use orchestrate::config::{Indicator, WatchdogConfig};
use orchestrate::events::{self, EventKind};
use orchestrate::types::Verdict;
use orchestrate::watchdog::{self, TaskWatchdog};
use tokio_util::sync::CancellationToken;

fn watchdog_config(indicators: Vec<Indicator>, stuck_threshold_secs: u64) -> WatchdogConfig {
    WatchdogConfig {
        check_interval_secs: 1,
        stuck_threshold_secs,
        min_log_growth_bytes: 64,
        indicators,
    }
}

#[test]
fn silent_task_is_flagged_stuck_exactly_once() {
    let repo = common::setup_repo();
    let logs = tempfile::tempdir().unwrap();

    let mut wd = TaskWatchdog::new(
        "a",
        repo.path(),
        "main",
        &logs.path().join("a.log"),
        repo.path(),
        watchdog_config(vec![Indicator::Filesystem, Indicator::LogGrowth], 0),
    );

    let first = wd.sample();
    assert_eq!(first.verdict, Verdict::Stuck);
    assert!(first.newly_stuck);

    let second = wd.sample();
    assert_eq!(second.verdict, Verdict::Stuck);
    assert!(!second.newly_stuck, "stuck must be detected once per episode");
}

#[test]
fn filesystem_activity_recovers_a_stuck_task() {
    let repo = common::setup_repo();
    let logs = tempfile::tempdir().unwrap();

    let mut wd = TaskWatchdog::new(
        "a",
        repo.path(),
        "main",
        &logs.path().join("a.log"),
        repo.path(),
        watchdog_config(vec![Indicator::Filesystem], 0),
    );

    assert!(wd.sample().newly_stuck);

    std::fs::write(repo.path().join("progress.txt"), "working").unwrap();
    let sample = wd.sample();
    assert_eq!(sample.verdict, Verdict::Active);
    assert!(sample.recovered);
    assert_eq!(sample.indicators_fired, vec!["filesystem"]);
}

#[test]
fn commit_activity_counts_as_progress() {
    let repo = common::setup_repo();
    let logs = tempfile::tempdir().unwrap();

    let mut wd = TaskWatchdog::new(
        "a",
        repo.path(),
        "main",
        &logs.path().join("a.log"),
        repo.path(),
        watchdog_config(vec![Indicator::Commits], 1000),
    );

    // First sample only establishes the baseline count.
    let first = wd.sample();
    assert_eq!(first.verdict, Verdict::Uncertain);

    common::commit_all(repo.path(), "more work");
    let second = wd.sample();
    assert_eq!(second.verdict, Verdict::Active);
    assert_eq!(second.indicators_fired, vec!["commits"]);
}

#[test]
fn varied_log_growth_counts_as_progress() {
    let repo = common::setup_repo();
    let logs = tempfile::tempdir().unwrap();
    let log_path = logs.path().join("a.log");

    let mut wd = TaskWatchdog::new(
        "a",
        repo.path(),
        "main",
        &log_path,
        repo.path(),
        watchdog_config(vec![Indicator::LogGrowth], 1000),
    );

    let lines: String = (0..10).map(|i| format!("compiling module {}\n", i)).collect();
    std::fs::write(&log_path, lines).unwrap();

    let sample = wd.sample();
    assert_eq!(sample.verdict, Verdict::Active);
    assert_eq!(sample.indicators_fired, vec!["log_growth"]);
}

#[test]
fn degenerate_log_growth_is_not_progress() {
    let repo = common::setup_repo();
    let logs = tempfile::tempdir().unwrap();
    let log_path = logs.path().join("a.log");

    let mut wd = TaskWatchdog::new(
        "a",
        repo.path(),
        "main",
        &log_path,
        repo.path(),
        watchdog_config(vec![Indicator::LogGrowth], 1000),
    );

    // Plenty of bytes, but the same two lines looping.
    let lines = "retrying request\nwaiting for lock\n".repeat(15);
    std::fs::write(&log_path, lines).unwrap();

    let sample = wd.sample();
    assert_eq!(sample.verdict, Verdict::Uncertain);
    assert!(sample.indicators_fired.is_empty());
}

#[tokio::test]
async fn monitor_reports_stuck_and_logs_one_event() {
    let repo = common::setup_repo();
    let logs = tempfile::tempdir().unwrap();
    let events_path = logs.path().join("events.jsonl");

    let (handle, writer) = events::spawn_event_log(&events_path).unwrap();
    let (reports_tx, mut reports_rx) = tokio::sync::mpsc::channel(8);
    let cancel = CancellationToken::new();

    let wd = TaskWatchdog::new(
        "a",
        repo.path(),
        "main",
        &logs.path().join("a.log"),
        repo.path(),
        watchdog_config(vec![Indicator::LogGrowth], 0),
    );

    let monitor = watchdog::spawn_monitor(
        wd,
        Duration::from_millis(20),
        "r1".to_string(),
        handle.clone(),
        reports_tx,
        cancel.clone(),
    );

    let report = tokio::time::timeout(Duration::from_secs(5), reports_rx.recv())
        .await
        .expect("no report within timeout")
        .expect("report channel closed");
    assert_eq!(report.task_id, "a");
    assert_eq!(report.verdict, Verdict::Stuck);

    // Let several more ticks pass; the episode must not re-fire.
    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel.cancel();
    monitor.await.unwrap();

    drop(handle);
    writer.await.unwrap();

    let run_events = events::read_events(&events_path).unwrap();
    let stuck_count = run_events
        .iter()
        .filter(|e| e.event == EventKind::StuckTaskDetected)
        .count();
    assert_eq!(stuck_count, 1);
    assert!(reports_rx.try_recv().is_err(), "no duplicate reports");
}
