use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};

use crate::events::{EventKind, LogEvent};

/// One task's row in the run summary, reduced from the event stream.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskReport {
    pub task_id: String,
    /// Terminal status string from the last TaskEnd/TaskBlocked event, or
    /// "incomplete" when the stream ends without one.
    pub status: String,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub escalation_attempts: u32,
    pub stuck_detections: u32,
    pub reason: Option<String>,
}

impl TaskReport {
    fn new(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            status: "incomplete".to_string(),
            started_at: None,
            ended_at: None,
            escalation_attempts: 0,
            stuck_detections: 0,
            reason: None,
        }
    }

    pub fn duration_secs(&self) -> Option<i64> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some((end - start).num_seconds().max(0)),
            _ => None,
        }
    }
}

/// The whole run, reduced from its append-only event stream.
///
/// Derivable from the stream alone so a summary can be (re)produced after a
/// crash, from nothing but the log file.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub tasks: Vec<TaskReport>,
}

impl RunReport {
    pub fn count(&self, status: &str) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }
}

/// Reduce an event stream into per-task rows, ordered by first appearance.
pub fn build_report(events: &[LogEvent]) -> RunReport {
    let run_id = events
        .first()
        .map(|e| e.run_id.clone())
        .unwrap_or_else(|| "unknown".to_string());

    let mut report = RunReport {
        run_id,
        started_at: None,
        ended_at: None,
        tasks: Vec::new(),
    };
    let mut index: HashMap<String, usize> = HashMap::new();

    for event in events {
        match event.event {
            EventKind::RunStart => report.started_at = Some(event.timestamp),
            EventKind::RunEnd => report.ended_at = Some(event.timestamp),
            _ => {}
        }

        let Some(task_id) = event.task_id.as_deref() else { continue };
        let idx = *index.entry(task_id.to_string()).or_insert_with(|| {
            report.tasks.push(TaskReport::new(task_id));
            report.tasks.len() - 1
        });
        let row = &mut report.tasks[idx];

        match event.event {
            EventKind::TaskStart => {
                // Restarts emit several TaskStart events; the first one wins.
                if row.started_at.is_none() {
                    row.started_at = Some(event.timestamp);
                }
            }
            EventKind::TaskEnd => {
                row.ended_at = Some(event.timestamp);
                if let Some(status) = event.payload.get("status").and_then(|v| v.as_str()) {
                    row.status = status.to_string();
                }
                if let Some(reason) = event.payload.get("reason").and_then(|v| v.as_str()) {
                    row.reason = Some(reason.to_string());
                }
            }
            EventKind::TaskBlocked => {
                row.ended_at = Some(event.timestamp);
                row.status = "blocked".to_string();
                let reason = event
                    .payload
                    .get("reason")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .or_else(|| {
                        event
                            .payload
                            .get("failed_dependencies")
                            .and_then(|v| v.as_array())
                            .map(|deps| {
                                let names: Vec<&str> =
                                    deps.iter().filter_map(|d| d.as_str()).collect();
                                format!("failed dependencies: {}", names.join(", "))
                            })
                    });
                if reason.is_some() {
                    row.reason = reason;
                }
            }
            EventKind::StuckTaskDetected => row.stuck_detections += 1,
            EventKind::EscalationAttempt => row.escalation_attempts += 1,
            _ => {}
        }
    }

    report
}

/// Render the human-facing summary markdown.
pub fn render_markdown(report: &RunReport) -> String {
    let mut out = String::new();
    out.push_str(&format!("# Run summary: {}\n\n", report.run_id));

    if let Some(start) = report.started_at {
        out.push_str(&format!("- Started: {}\n", start.to_rfc3339()));
    }
    if let Some(end) = report.ended_at {
        out.push_str(&format!("- Ended: {}\n", end.to_rfc3339()));
    }
    out.push_str(&format!(
        "- Tasks: {} total, {} succeeded, {} failed, {} blocked\n\n",
        report.tasks.len(),
        report.count("succeeded"),
        report.count("failed"),
        report.count("blocked"),
    ));

    out.push_str("| Task | Status | Duration | Stuck | Escalations | Notes |\n");
    out.push_str("|------|--------|----------|-------|-------------|-------|\n");
    for row in &report.tasks {
        let duration = row
            .duration_secs()
            .map(format_duration)
            .unwrap_or_else(|| "-".to_string());
        out.push_str(&format!(
            "| {} | {} | {} | {} | {} | {} |\n",
            row.task_id,
            row.status,
            duration,
            row.stuck_detections,
            row.escalation_attempts,
            row.reason.as_deref().unwrap_or(""),
        ));
    }

    out
}

fn format_duration(secs: i64) -> String {
    if secs >= 3600 {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}

/// Write the summary file. Called on every exit path, including aborts, so
/// the operator always has a post-mortem document.
pub fn write_summary(path: &Path, report: &RunReport) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create {}: {}", parent.display(), e))?;
    }
    std::fs::write(path, render_markdown(report))
        .map_err(|e| format!("Failed to write {}: {}", path.display(), e))
}
