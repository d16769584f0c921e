use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::log_warn;

/// Every scheduling decision in a run, in append order.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunStart,
    RunEnd,
    TaskReady,
    TaskStart,
    TaskEnd,
    TaskBlocked,
    WorkspaceAllocated,
    WorkspaceReleased,
    StuckTaskDetected,
    EscalationAttempt,
    EscalationOutcome,
    PhaseLockAcquired,
    PhaseLockReleased,
}

/// One record in the append-only event stream.
///
/// Records are never mutated or deleted; total order is append order. A state
/// transition is durable only once its event has been written.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub event: EventKind,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
}

impl LogEvent {
    pub fn new(run_id: &str, task_id: Option<&str>, event: EventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            run_id: run_id.to_string(),
            task_id: task_id.map(|s| s.to_string()),
            event,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

// --- Writer actor ---
//
// All components append through one handle; the actor owns the file, so
// concurrent writers serialize through a single write path and records are
// never interleaved.

enum EventLogCommand {
    Append {
        event: Box<LogEvent>,
        reply: oneshot::Sender<Result<(), String>>,
    },
}

#[derive(Clone)]
pub struct EventLogHandle {
    sender: mpsc::Sender<EventLogCommand>,
}

impl EventLogHandle {
    /// Append one event. Resolves once the record is written and flushed.
    pub async fn append(&self, event: LogEvent) -> Result<(), String> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(EventLogCommand::Append {
                event: Box::new(event),
                reply,
            })
            .await
            .map_err(|_| "event log writer shut down".to_string())?;
        rx.await
            .map_err(|_| "event log writer dropped reply".to_string())?
    }
}

struct EventLogState {
    file: File,
    path: PathBuf,
}

impl EventLogState {
    fn write_event(&mut self, event: &LogEvent) -> Result<(), String> {
        let line = serde_json::to_string(event)
            .map_err(|e| format!("Failed to serialize event: {}", e))?;
        writeln!(self.file, "{}", line)
            .and_then(|_| self.file.flush())
            .map_err(|e| format!("Failed to append to {}: {}", self.path.display(), e))
    }
}

async fn run_event_log(mut rx: mpsc::Receiver<EventLogCommand>, mut state: EventLogState) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            EventLogCommand::Append { event, reply } => {
                let result = state.write_event(&event);
                if let Err(ref e) = result {
                    log_warn!("Event log write failed: {}", e);
                }
                let _ = reply.send(result);
            }
        }
    }
}

const CHANNEL_CAPACITY: usize = 64;

/// Open (append mode) the run event stream and spawn the writer actor.
pub fn spawn_event_log(
    path: &Path,
) -> Result<(EventLogHandle, tokio::task::JoinHandle<()>), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create {}: {}", parent.display(), e))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| format!("Failed to open {}: {}", path.display(), e))?;

    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let state = EventLogState {
        file,
        path: path.to_path_buf(),
    };
    let task_handle = tokio::spawn(run_event_log(rx, state));

    Ok((EventLogHandle { sender: tx }, task_handle))
}

// --- Reader ---

/// Read an event stream back for summary generation and auditing.
///
/// Malformed lines are skipped rather than failing the whole read; the
/// summary must still be producible from a stream a crashed worker garbled.
pub fn read_events(path: &Path) -> Result<Vec<LogEvent>, String> {
    let file = File::open(path).map_err(|e| format!("Failed to open {}: {}", path.display(), e))?;
    let reader = BufReader::new(file);

    let mut events = Vec::new();
    for line in reader.lines() {
        let line = line.map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<LogEvent>(trimmed) {
            Ok(event) => events.push(event),
            Err(_) => continue,
        }
    }
    Ok(events)
}
