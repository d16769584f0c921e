use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{Indicator, WatchdogConfig};
use crate::events::{EventKind, EventLogHandle, LogEvent};
use crate::git;
use crate::types::Verdict;
use crate::{log_debug, log_warn};

/// Bytes of log tail examined for degenerate repetition.
const TAIL_WINDOW_BYTES: u64 = 4096;
/// Minimum non-blank tail lines before the repetition check applies.
const TAIL_MIN_LINES: usize = 12;
/// A tail collapsing to at most this many distinct lines is degenerate.
const TAIL_MAX_DISTINCT: usize = 3;

/// Verdict sent from a task's monitor to the coordinating loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchdogReport {
    pub task_id: String,
    pub verdict: Verdict,
}

/// Per-task liveness state. Mutated only by that task's monitor.
pub struct TaskWatchdog {
    task_id: String,
    workspace: PathBuf,
    branch: String,
    log_path: PathBuf,
    project_root: PathBuf,
    config: WatchdogConfig,
    stuck_threshold: Duration,
    last_commit_count: Option<u64>,
    last_log_len: u64,
    window_start: SystemTime,
    last_progress_at: Instant,
    stuck_since: Option<Instant>,
}

/// Outcome of one sampling pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub verdict: Verdict,
    /// True exactly once per stuck episode.
    pub newly_stuck: bool,
    /// True when the task produced activity again after being stuck.
    pub recovered: bool,
    pub indicators_fired: Vec<&'static str>,
}

impl TaskWatchdog {
    pub fn new(
        task_id: &str,
        workspace: &Path,
        branch: &str,
        log_path: &Path,
        project_root: &Path,
        config: WatchdogConfig,
    ) -> Self {
        Self {
            task_id: task_id.to_string(),
            workspace: workspace.to_path_buf(),
            branch: branch.to_string(),
            log_path: log_path.to_path_buf(),
            project_root: project_root.to_path_buf(),
            stuck_threshold: config.stuck_threshold(),
            config,
            last_commit_count: None,
            last_log_len: 0,
            window_start: SystemTime::now(),
            last_progress_at: Instant::now(),
            stuck_since: None,
        }
    }

    /// Sample every enabled indicator and classify the task.
    ///
    /// Any single indicator firing counts as progress: indicators have very
    /// different latencies (a worker may think for minutes before writing),
    /// so requiring unanimity would produce false stuck verdicts.
    pub fn sample(&mut self) -> Sample {
        let mut fired: Vec<&'static str> = Vec::new();

        for indicator in self.config.indicators.clone() {
            match indicator {
                Indicator::Filesystem => {
                    if self.filesystem_activity() {
                        fired.push("filesystem");
                    }
                }
                Indicator::Commits => {
                    if self.commit_activity() {
                        fired.push("commits");
                    }
                }
                Indicator::LogGrowth => {
                    if self.log_growth() {
                        fired.push("log_growth");
                    }
                }
            }
        }

        self.window_start = SystemTime::now();

        let was_stuck = self.stuck_since.is_some();
        let (verdict, newly_stuck) = if !fired.is_empty() {
            self.last_progress_at = Instant::now();
            self.stuck_since = None;
            (Verdict::Active, false)
        } else {
            decide_without_progress(
                self.last_progress_at.elapsed(),
                self.stuck_threshold,
                was_stuck,
            )
        };

        if newly_stuck {
            self.stuck_since = Some(Instant::now());
        }

        Sample {
            verdict,
            newly_stuck,
            recovered: was_stuck && verdict == Verdict::Active,
            indicators_fired: fired,
        }
    }

    // --- Indicators ---

    /// Any file under the workspace (excluding .git) modified in the window.
    fn filesystem_activity(&self) -> bool {
        any_file_modified_since(&self.workspace, self.window_start)
    }

    /// The task's branch gained commits since the last sample.
    fn commit_activity(&mut self) -> bool {
        let count = match git::rev_count(&self.project_root, &self.branch) {
            Ok(count) => count,
            Err(e) => {
                log_debug!("[watchdog:{}] rev_count failed: {}", self.task_id, e);
                return false;
            }
        };
        let grew = matches!(self.last_commit_count, Some(prev) if count > prev);
        self.last_commit_count = Some(count);
        grew
    }

    /// The log grew past the byte threshold AND the tail is not a degenerate
    /// repetition. Growth that is pure repetition never counts as progress.
    fn log_growth(&mut self) -> bool {
        let len = match std::fs::metadata(&self.log_path) {
            Ok(meta) => meta.len(),
            Err(_) => return false,
        };
        let grew = len >= self.last_log_len + self.config.min_log_growth_bytes;
        self.last_log_len = len;
        if !grew {
            return false;
        }
        match read_tail(&self.log_path, TAIL_WINDOW_BYTES) {
            Ok(tail) => !tail_is_degenerate(&tail),
            Err(_) => true,
        }
    }
}

/// Classification when no indicator fired this pass.
fn decide_without_progress(
    elapsed: Duration,
    threshold: Duration,
    already_stuck: bool,
) -> (Verdict, bool) {
    if elapsed < threshold {
        (Verdict::Uncertain, false)
    } else {
        (Verdict::Stuck, !already_stuck)
    }
}

/// Whether the tail of a worker log shows the same small set of operations
/// repeating with no new content.
pub fn tail_is_degenerate(tail: &str) -> bool {
    let lines: Vec<&str> = tail
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    if lines.len() < TAIL_MIN_LINES {
        return false;
    }
    let distinct: std::collections::HashSet<&str> = lines.iter().copied().collect();
    distinct.len() <= TAIL_MAX_DISTINCT
}

/// Read the last `max_bytes` of a file as lossy UTF-8.
pub fn read_tail(path: &Path, max_bytes: u64) -> Result<String, String> {
    let mut file = std::fs::File::open(path)
        .map_err(|e| format!("Failed to open {}: {}", path.display(), e))?;
    let len = file
        .metadata()
        .map_err(|e| format!("Failed to stat {}: {}", path.display(), e))?
        .len();
    let start = len.saturating_sub(max_bytes);
    file.seek(SeekFrom::Start(start))
        .map_err(|e| format!("Failed to seek {}: {}", path.display(), e))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn any_file_modified_since(dir: &Path, since: SystemTime) -> bool {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return false,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.file_name().is_some_and(|n| n == ".git") {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        if let Ok(mtime) = meta.modified() {
            if mtime > since {
                return true;
            }
        }
        if meta.is_dir() && any_file_modified_since(&path, since) {
            return true;
        }
    }
    false
}

// --- Monitor task ---

/// Spawn the monitoring task for one running worker.
///
/// Samples on a fixed interval; appends `StuckTaskDetected` once per episode
/// and reports stuck/recovered transitions to the coordinating loop. All
/// graph mutation stays with the loop (single-writer rule).
pub fn spawn_monitor(
    mut watchdog: TaskWatchdog,
    interval: Duration,
    run_id: String,
    events: EventLogHandle,
    reports: mpsc::Sender<WatchdogReport>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick fires immediately; skip it so the window has content.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let task_id = watchdog.task_id.clone();
            let sampled = tokio::task::spawn_blocking(move || {
                let sample = watchdog.sample();
                (watchdog, sample)
            })
            .await;

            let sample = match sampled {
                Ok((returned, sample)) => {
                    watchdog = returned;
                    sample
                }
                Err(e) => {
                    log_warn!("[watchdog:{}] sampling task panicked: {}", task_id, e);
                    break;
                }
            };

            if sample.newly_stuck {
                let event = LogEvent::new(&run_id, Some(&task_id), EventKind::StuckTaskDetected)
                    .with_payload(serde_json::json!({
                        "stuck_threshold_secs": watchdog.stuck_threshold.as_secs(),
                    }));
                if let Err(e) = events.append(event).await {
                    log_warn!("[watchdog:{}] event append failed: {}", task_id, e);
                }
            }

            if sample.newly_stuck || sample.recovered {
                let report = WatchdogReport {
                    task_id: task_id.clone(),
                    verdict: sample.verdict,
                };
                if reports.send(report).await.is_err() {
                    break; // coordinating loop is gone
                }
            }
        }
    })
}
