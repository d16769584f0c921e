use thiserror::Error;

/// Error taxonomy for an orchestration run.
///
/// Categories:
/// - Pre-flight (`Config`, `DependencyCycle`, `PhaseLockHeld`): abort the whole
///   run before any task starts, no partial state mutation
/// - Per-task (`WorkspaceConflict`, `ProcessLaunch`, `EscalationExhausted`):
///   fail only the affected task; its dependents become blocked
/// - Plumbing (`Git`, `Io`): wrapped at component boundaries, classified by the
///   operation that produced them
#[derive(Debug, Error)]
pub enum OrchestrateError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Dependency cycle detected: {0}")]
    DependencyCycle(String),

    #[error("Workspace conflict for task '{task_id}': {reason}")]
    WorkspaceConflict { task_id: String, reason: String },

    #[error("Failed to launch worker for task '{task_id}': {reason}")]
    ProcessLaunch { task_id: String, reason: String },

    #[error("Task '{task_id}' exhausted all escalation strategies after {attempts} attempts")]
    EscalationExhausted { task_id: String, attempts: u32 },

    #[error("Phase lock for '{phase}' is held{holder}", holder = held_by(.holder_run_id))]
    PhaseLockHeld {
        phase: String,
        holder_run_id: Option<String>,
    },

    #[error("Git error: {0}")]
    Git(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn held_by(holder: &Option<String>) -> String {
    match holder {
        Some(run_id) => format!(" by run {}", run_id),
        None => String::new(),
    }
}

impl OrchestrateError {
    /// Returns true for errors that must abort the run before any task starts.
    pub fn is_preflight(&self) -> bool {
        matches!(
            self,
            OrchestrateError::Config(_)
                | OrchestrateError::DependencyCycle(_)
                | OrchestrateError::PhaseLockHeld { .. }
        )
    }

    /// Returns true for errors contained to a single task and its dependents.
    pub fn is_task_scoped(&self) -> bool {
        matches!(
            self,
            OrchestrateError::WorkspaceConflict { .. }
                | OrchestrateError::ProcessLaunch { .. }
                | OrchestrateError::EscalationExhausted { .. }
        )
    }
}

/// Bridge for plumbing code that still returns `Result<T, String>` (git module).
impl From<String> for OrchestrateError {
    fn from(msg: String) -> Self {
        OrchestrateError::Git(msg)
    }
}
