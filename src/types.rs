use serde::{Deserialize, Serialize};

// --- Enums ---

/// Mutually-exclusive run class for a task.
///
/// `Main` is the privileged class: a main run holds the phase lock and no
/// other class may start while it is held.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Discovery,
    #[default]
    Main,
    Legacy,
    Post,
}

impl Phase {
    /// The privileged phase acquires the run lock; all other phases refuse to
    /// start while it is held.
    pub fn is_privileged(&self) -> bool {
        matches!(self, Phase::Main)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Discovery => "discovery",
            Phase::Main => "main",
            Phase::Legacy => "legacy",
            Phase::Post => "post",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn parse_phase(s: &str) -> Result<Phase, String> {
    match s.to_lowercase().as_str() {
        "discovery" => Ok(Phase::Discovery),
        "main" => Ok(Phase::Main),
        "legacy" => Ok(Phase::Legacy),
        "post" => Ok(Phase::Post),
        _ => Err(format!(
            "Invalid phase '{}': expected discovery, main, legacy, or post",
            s
        )),
    }
}

/// Lifecycle of a task within one run.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Blocked,
}

impl TaskStatus {
    /// Validates whether a transition from this status to `to` is allowed.
    ///
    /// Rules:
    /// - Pending -> Ready -> Running is the only forward path into execution
    /// - Running resolves to Succeeded or Failed
    /// - Ready can fail directly (workspace conflict, unbuildable command)
    /// - Pending or Ready can go straight to Blocked (failed dependency)
    /// - Succeeded, Failed, and Blocked are terminal
    pub fn is_valid_transition(&self, to: &TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Pending, Ready)
                | (Ready, Running)
                | (Ready, Failed)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Pending, Blocked)
                | (Ready, Blocked)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Blocked
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Blocked => "blocked",
        };
        f.write_str(s)
    }
}

/// Watchdog classification of a running task.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Active,
    Uncertain,
    Stuck,
}

/// Recovery strategies in increasing order of intrusiveness.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Notify,
    Interrupt,
    KillAndRetry,
    SwitchAgent,
    SimplifyScope,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Strategy::Notify => "notify",
            Strategy::Interrupt => "interrupt",
            Strategy::KillAndRetry => "kill_and_retry",
            Strategy::SwitchAgent => "switch_agent",
            Strategy::SimplifyScope => "simplify_scope",
        };
        f.write_str(s)
    }
}

/// Outcome of a single strategy invocation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StrategyOutcome {
    /// Strategy applied; task back under observation.
    Applied,
    /// Task produced activity again after the strategy.
    Recovered,
    /// Strategy's prerequisite config is missing; engine advanced past it.
    Skipped,
    /// Attempt bound for this strategy is spent.
    Exhausted,
}

/// One recovery attempt applied to a stuck task.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct EscalationRecord {
    pub task_id: String,
    pub strategy: Strategy,
    pub attempt: u32,
    pub outcome: StrategyOutcome,
    pub detail: Option<String>,
}

/// Termination escalation tier for the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalTier {
    /// Cooperative interrupt (SIGINT); the worker may resume.
    Graceful,
    /// Shutdown request (SIGTERM), force-killed after the grace window.
    Forceful,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_transitions_are_valid() {
        assert!(TaskStatus::Pending.is_valid_transition(&TaskStatus::Ready));
        assert!(TaskStatus::Ready.is_valid_transition(&TaskStatus::Running));
        assert!(TaskStatus::Running.is_valid_transition(&TaskStatus::Succeeded));
        assert!(TaskStatus::Running.is_valid_transition(&TaskStatus::Failed));
    }

    #[test]
    fn ready_task_can_fail_without_running() {
        assert!(TaskStatus::Ready.is_valid_transition(&TaskStatus::Failed));
        assert!(!TaskStatus::Pending.is_valid_transition(&TaskStatus::Failed));
    }

    #[test]
    fn blocking_only_before_running() {
        assert!(TaskStatus::Pending.is_valid_transition(&TaskStatus::Blocked));
        assert!(TaskStatus::Ready.is_valid_transition(&TaskStatus::Blocked));
        assert!(!TaskStatus::Running.is_valid_transition(&TaskStatus::Blocked));
    }

    #[test]
    fn terminal_statuses_do_not_transition() {
        for terminal in [TaskStatus::Succeeded, TaskStatus::Failed, TaskStatus::Blocked] {
            for to in [
                TaskStatus::Pending,
                TaskStatus::Ready,
                TaskStatus::Running,
                TaskStatus::Succeeded,
                TaskStatus::Failed,
                TaskStatus::Blocked,
            ] {
                assert!(!terminal.is_valid_transition(&to));
            }
            assert!(terminal.is_terminal());
        }
    }

    #[test]
    fn parse_phase_accepts_all_variants() {
        assert_eq!(parse_phase("main").unwrap(), Phase::Main);
        assert_eq!(parse_phase("DISCOVERY").unwrap(), Phase::Discovery);
        assert_eq!(parse_phase("legacy").unwrap(), Phase::Legacy);
        assert_eq!(parse_phase("post").unwrap(), Phase::Post);
        assert!(parse_phase("release").is_err());
    }

    #[test]
    fn only_main_is_privileged() {
        assert!(Phase::Main.is_privileged());
        assert!(!Phase::Discovery.is_privileged());
        assert!(!Phase::Legacy.is_privileged());
        assert!(!Phase::Post.is_privileged());
    }
}
