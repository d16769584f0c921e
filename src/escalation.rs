use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::EscalationConfig;
use crate::types::{EscalationRecord, Strategy, StrategyOutcome};

/// What the coordinating loop should do next for a stuck task.
#[derive(Debug, Clone, PartialEq)]
pub enum EscalationAction {
    /// Warn and keep observing; the next strategy applies on the next tick.
    Notify,
    /// Cooperative signal; recovery window follows.
    Interrupt { grace: Duration },
    /// Terminate, re-allocate the workspace, relaunch the original command.
    KillAndRetry { attempt: u32 },
    /// Terminate, write a handoff artifact, relaunch with the alternate runner.
    SwitchAgent { runner: String },
    /// Terminate, relaunch once with the reduced-scope prompt.
    SimplifyScope { prompt: PathBuf },
    /// Every configured strategy is spent: the task fails with
    /// EscalationExhausted.
    GiveUp { attempts: u32 },
}

/// Per-task escalation state machine.
///
/// Walks the configured strategy list in order. Each strategy has a bounded
/// attempt count (`kill_and_retry` gets `max_retries`, the rest one each), so
/// the total number of recovery actions per task is finite even across
/// repeated stuck/recover cycles: counters survive recovery on purpose.
pub struct EscalationEngine {
    task_id: String,
    config: EscalationConfig,
    attempts_used: Vec<u32>,
    records: Vec<EscalationRecord>,
}

impl EscalationEngine {
    pub fn new(task_id: &str, config: EscalationConfig) -> Self {
        let attempts_used = vec![0; config.strategies.len()];
        Self {
            task_id: task_id.to_string(),
            config,
            attempts_used,
            records: Vec::new(),
        }
    }

    pub fn records(&self) -> &[EscalationRecord] {
        &self.records
    }

    pub fn total_attempts(&self) -> u32 {
        self.attempts_used.iter().sum()
    }

    fn bound_for(&self, strategy: Strategy) -> u32 {
        match strategy {
            Strategy::KillAndRetry => self.config.max_retries,
            _ => 1,
        }
    }

    /// Pick and consume the next strategy attempt.
    ///
    /// Strategies whose prerequisite config is missing are recorded as
    /// `Skipped` and the walk advances; when nothing remains the action is
    /// `GiveUp`.
    pub fn next_action(&mut self) -> EscalationAction {
        for i in 0..self.config.strategies.len() {
            let strategy = self.config.strategies[i];
            let bound = self.bound_for(strategy);
            if self.attempts_used[i] >= bound {
                continue;
            }

            let attempt = self.attempts_used[i] + 1;
            let action = match strategy {
                Strategy::Notify => EscalationAction::Notify,
                Strategy::Interrupt => EscalationAction::Interrupt {
                    grace: Duration::from_secs(self.config.interrupt_grace_secs),
                },
                Strategy::KillAndRetry => EscalationAction::KillAndRetry { attempt },
                Strategy::SwitchAgent => match self.config.alternate_runner.clone() {
                    Some(runner) => EscalationAction::SwitchAgent { runner },
                    None => {
                        self.attempts_used[i] = bound;
                        self.push_record(
                            strategy,
                            bound,
                            StrategyOutcome::Skipped,
                            Some("no alternate_runner configured".to_string()),
                        );
                        continue;
                    }
                },
                Strategy::SimplifyScope => match self.config.reduced_prompt.clone() {
                    Some(prompt) => EscalationAction::SimplifyScope {
                        prompt: PathBuf::from(prompt),
                    },
                    None => {
                        self.attempts_used[i] = bound;
                        self.push_record(
                            strategy,
                            bound,
                            StrategyOutcome::Skipped,
                            Some("no reduced_prompt configured".to_string()),
                        );
                        continue;
                    }
                },
            };

            self.attempts_used[i] = attempt;
            self.push_record(strategy, attempt, StrategyOutcome::Applied, None);
            return action;
        }

        EscalationAction::GiveUp {
            attempts: self.total_attempts(),
        }
    }

    /// Mark the most recent attempt of `strategy` as recovered.
    pub fn note_recovered(&mut self, strategy: Strategy) {
        if let Some(record) = self
            .records
            .iter_mut()
            .rev()
            .find(|r| r.strategy == strategy)
        {
            record.outcome = StrategyOutcome::Recovered;
        }
    }

    /// Mark the most recent attempt of `strategy` as exhausted (no recovery).
    pub fn note_exhausted(&mut self, strategy: Strategy, detail: &str) {
        if let Some(record) = self
            .records
            .iter_mut()
            .rev()
            .find(|r| r.strategy == strategy)
        {
            record.outcome = StrategyOutcome::Exhausted;
            record.detail = Some(detail.to_string());
        }
    }

    fn push_record(
        &mut self,
        strategy: Strategy,
        attempt: u32,
        outcome: StrategyOutcome,
        detail: Option<String>,
    ) {
        self.records.push(EscalationRecord {
            task_id: self.task_id.clone(),
            strategy,
            attempt,
            outcome,
            detail,
        });
    }
}

// --- Handoff artifact ---

/// Render the handoff artifact handed to an alternate worker backend:
/// attempt history, the last visible blocker, and the workspace state.
pub fn build_handoff_markdown(
    task_id: &str,
    records: &[EscalationRecord],
    log_tail: &str,
    diff_stat: &str,
    recent_commits: &str,
) -> String {
    let mut out = String::new();
    out.push_str(&format!("# Handoff: {}\n\n", task_id));
    out.push_str(&format!(
        "Generated: {}\n\n",
        chrono::Utc::now().to_rfc3339()
    ));

    out.push_str("## Escalation history\n\n");
    if records.is_empty() {
        out.push_str("(none)\n");
    }
    for record in records {
        out.push_str(&format!(
            "- {} attempt {}: {:?}{}\n",
            record.strategy,
            record.attempt,
            record.outcome,
            record
                .detail
                .as_deref()
                .map(|d| format!(" ({})", d))
                .unwrap_or_default()
        ));
    }

    out.push_str("\n## Commits on the task branch\n\n```\n");
    out.push_str(if recent_commits.is_empty() { "(none)" } else { recent_commits });
    out.push_str("\n```\n\n## Uncommitted changes\n\n```\n");
    out.push_str(if diff_stat.is_empty() { "(clean)" } else { diff_stat });
    out.push_str("\n```\n\n## Last worker output\n\n```\n");
    out.push_str(if log_tail.is_empty() { "(no output)" } else { log_tail });
    out.push_str("\n```\n");
    out
}

/// Write the handoff artifact to its fixed location, `<handoff_dir>/<task>.md`.
pub fn write_handoff(handoff_dir: &Path, task_id: &str, contents: &str) -> Result<PathBuf, String> {
    std::fs::create_dir_all(handoff_dir)
        .map_err(|e| format!("Failed to create {}: {}", handoff_dir.display(), e))?;
    let path = handoff_dir.join(format!("{}.md", task_id));
    std::fs::write(&path, contents)
        .map_err(|e| format!("Failed to write {}: {}", path.display(), e))?;
    Ok(path)
}
