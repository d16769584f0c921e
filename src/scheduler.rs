use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{self, OrchestrateConfig};
use crate::error::OrchestrateError;
use crate::escalation::{self, EscalationAction, EscalationEngine};
use crate::events::{EventKind, EventLogHandle, LogEvent};
use crate::git;
use crate::graph::{Task, TaskGraph};
use crate::supervisor::{self, LaunchSpec, WorkerBackend, WorkerProcess};
use crate::types::{SignalTier, Strategy, TaskStatus, Verdict};
use crate::watchdog::{self, TaskWatchdog, WatchdogReport};
use crate::workspace::{ReleaseOutcome, WorkspaceAllocation, WorkspaceAllocator};
use crate::{log_error, log_info, log_warn};

/// Coordinating loop tick.
const TICK_MS: u64 = 500;

/// Capacity for watchdog verdict reports; monitors send at most two messages
/// per stuck episode.
const REPORT_CHANNEL_CAPACITY: usize = 64;

/// Why the run loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    /// Every task reached a terminal status.
    Quiescent,
    /// SIGINT/SIGTERM observed; workers were terminated and workspaces released.
    ShutdownRequested,
}

/// Terminal accounting for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub halt: HaltReason,
    pub succeeded: usize,
    pub failed: usize,
    pub blocked: usize,
}

impl RunOutcome {
    /// Process exit code: 0 on full success, otherwise the count of
    /// failed-or-blocked tasks clamped to the portable 1..=100 range.
    pub fn exit_code(&self) -> i32 {
        let unfinished = self.failed + self.blocked;
        if unfinished == 0 && self.halt == HaltReason::Quiescent {
            0
        } else {
            (unfinished.max(1)).min(100) as i32
        }
    }
}

/// Book-keeping for one launched worker.
struct RunningTask<P: WorkerProcess> {
    process: P,
    allocation: WorkspaceAllocation,
    engine: EscalationEngine,
    monitor_cancel: CancellationToken,
    /// Set while a stuck verdict is unanswered; one strategy applies per tick.
    escalating: bool,
    /// Recovery window after an interrupt. Expiry resumes escalation.
    interrupt_deadline: Option<tokio::time::Instant>,
}

impl<P: WorkerProcess> RunningTask<P> {
    fn stop_monitor(&self) {
        self.monitor_cancel.cancel();
    }
}

/// Single-threaded coordinating loop.
///
/// Owns the graph and all worker book-keeping; watchdog monitors and the
/// event-log writer run as separate tasks but report back through channels,
/// so every status transition happens here and nowhere else.
pub struct Scheduler<'a, B: WorkerBackend> {
    graph: TaskGraph,
    cfg: &'a OrchestrateConfig,
    backend: &'a B,
    allocator: WorkspaceAllocator,
    events: EventLogHandle,
    run_id: String,
    project_root: PathBuf,
    logs_dir: PathBuf,
    running: HashMap<String, RunningTask<B::Process>>,
    reports_tx: mpsc::Sender<WatchdogReport>,
    reports_rx: mpsc::Receiver<WatchdogReport>,
}

impl<'a, B: WorkerBackend> Scheduler<'a, B> {
    pub fn new(
        graph: TaskGraph,
        cfg: &'a OrchestrateConfig,
        backend: &'a B,
        events: EventLogHandle,
        run_id: &str,
        project_root: &Path,
        logs_dir: &Path,
    ) -> Self {
        let (reports_tx, reports_rx) = mpsc::channel(REPORT_CHANNEL_CAPACITY);
        Self {
            graph,
            cfg,
            backend,
            allocator: WorkspaceAllocator::new(project_root),
            events,
            run_id: run_id.to_string(),
            project_root: project_root.to_path_buf(),
            logs_dir: logs_dir.to_path_buf(),
            running: HashMap::new(),
            reports_tx,
            reports_rx,
        }
    }

    /// Drive the run to quiescence (or shutdown) and return the accounting.
    pub async fn run(mut self) -> RunOutcome {
        let status_interval = config::status_interval();
        let mut last_status = tokio::time::Instant::now();

        loop {
            if supervisor::is_shutdown_requested() {
                log_warn!("Shutdown requested; terminating {} worker(s)", self.running.len());
                self.abort_all().await;
                return self.outcome(HaltReason::ShutdownRequested);
            }

            self.drain_watchdog_reports().await;
            self.poll_workers().await;
            self.expire_interrupt_windows();
            self.step_escalations().await;
            self.promote_and_launch().await;

            if self.running.is_empty() && self.graph.is_quiescent() {
                return self.outcome(HaltReason::Quiescent);
            }

            if last_status.elapsed() >= status_interval {
                self.print_status();
                last_status = tokio::time::Instant::now();
            }

            tokio::time::sleep(Duration::from_millis(TICK_MS)).await;
        }
    }

    fn outcome(&self, halt: HaltReason) -> RunOutcome {
        let mut succeeded = 0;
        let mut failed = 0;
        let mut blocked = 0;
        for task in self.graph.tasks() {
            match task.status {
                TaskStatus::Succeeded => succeeded += 1,
                TaskStatus::Failed => failed += 1,
                TaskStatus::Blocked => blocked += 1,
                // Non-terminal at shutdown: never started, counts as blocked.
                _ if halt == HaltReason::ShutdownRequested => blocked += 1,
                _ => {}
            }
        }
        RunOutcome {
            halt,
            succeeded,
            failed,
            blocked,
        }
    }

    fn print_status(&self) {
        let mut pending = 0;
        let mut ready = 0;
        let mut done = 0;
        for task in self.graph.tasks() {
            match task.status {
                TaskStatus::Pending => pending += 1,
                TaskStatus::Ready => ready += 1,
                s if s.is_terminal() => done += 1,
                _ => {}
            }
        }
        log_info!(
            "[{}] {} running, {} ready, {} pending, {}/{} done",
            self.run_id,
            self.running.len(),
            ready,
            pending,
            done,
            self.graph.len()
        );
    }

    // --- Watchdog verdicts ---

    async fn drain_watchdog_reports(&mut self) {
        let run_id = self.run_id.clone();
        let mut recovery_events = Vec::new();

        while let Ok(report) = self.reports_rx.try_recv() {
            let Some(entry) = self.running.get_mut(&report.task_id) else {
                continue; // task already finalized
            };
            match report.verdict {
                Verdict::Stuck => {
                    log_warn!("Task {} appears stuck", report.task_id);
                    entry.escalating = true;
                }
                Verdict::Active => {
                    if entry.interrupt_deadline.take().is_some() {
                        entry.engine.note_recovered(Strategy::Interrupt);
                        log_info!("Task {} recovered after interrupt", report.task_id);
                        recovery_events.push(
                            LogEvent::new(
                                &run_id,
                                Some(&report.task_id),
                                EventKind::EscalationOutcome,
                            )
                            .with_payload(serde_json::json!({
                                "strategy": "interrupt",
                                "outcome": "recovered",
                            })),
                        );
                    }
                    entry.escalating = false;
                }
                Verdict::Uncertain => {}
            }
        }

        // Appended outside the loop so the mutable borrow of the running map
        // has ended; awaiting keeps these ordered with every later append.
        for event in recovery_events {
            self.append_event(event).await;
        }
    }

    fn expire_interrupt_windows(&mut self) {
        let now = tokio::time::Instant::now();
        for (id, entry) in self.running.iter_mut() {
            if let Some(deadline) = entry.interrupt_deadline {
                if now >= deadline {
                    entry.interrupt_deadline = None;
                    entry
                        .engine
                        .note_exhausted(Strategy::Interrupt, "no recovery within grace window");
                    entry.escalating = true;
                    log_warn!("Task {} did not recover after interrupt", id);
                }
            }
        }
    }

    // --- Worker exits ---

    /// A clean exit always wins over a mid-flight escalation: once the worker
    /// is gone there is nothing left to escalate against.
    async fn poll_workers(&mut self) {
        let exited: Vec<(String, i32)> = self
            .running
            .iter_mut()
            .filter_map(|(id, entry)| entry.process.poll().map(|code| (id.clone(), code)))
            .collect();

        for (id, code) in exited {
            if let Some(entry) = self.running.remove(&id) {
                self.finalize_exit(&id, entry, code, None).await;
            }
        }
    }

    async fn finalize_exit(
        &mut self,
        id: &str,
        entry: RunningTask<B::Process>,
        exit_code: i32,
        reason: Option<&str>,
    ) {
        entry.stop_monitor();

        let status = if exit_code == 0 {
            TaskStatus::Succeeded
        } else {
            TaskStatus::Failed
        };

        let mut payload = serde_json::json!({
            "exit_code": exit_code,
            "status": status.to_string(),
        });
        if let Some(reason) = reason {
            payload["reason"] = serde_json::Value::String(reason.to_string());
        }
        self.append_event(
            LogEvent::new(&self.run_id, Some(id), EventKind::TaskEnd).with_payload(payload),
        )
        .await;

        if let Err(e) = self.graph.transition(id, status) {
            log_error!("{}", e);
        }

        let outcome = if status == TaskStatus::Succeeded {
            ReleaseOutcome::Success
        } else {
            ReleaseOutcome::Failure
        };
        self.release_workspace(id, entry.allocation, outcome).await;

        if status == TaskStatus::Failed {
            log_warn!("Task {} failed (exit {})", id, exit_code);
            self.block_dependents(id).await;
        } else {
            log_info!("Task {} succeeded", id);
        }
    }

    async fn block_dependents(&mut self, failed_id: &str) {
        let blocked = self.graph.propagate_blocked(failed_id);
        for (id, failed_deps) in blocked {
            log_warn!("Task {} blocked (failed deps: {})", id, failed_deps.join(", "));
            self.append_event(
                LogEvent::new(&self.run_id, Some(&id), EventKind::TaskBlocked).with_payload(
                    serde_json::json!({ "failed_dependencies": failed_deps }),
                ),
            )
            .await;
        }
    }

    // --- Escalation ---

    async fn step_escalations(&mut self) {
        let pending: Vec<String> = self
            .running
            .iter()
            .filter(|(_, e)| e.escalating && e.interrupt_deadline.is_none())
            .map(|(id, _)| id.clone())
            .collect();

        for id in pending {
            let Some(entry) = self.running.remove(&id) else { continue };
            self.apply_next_strategy(&id, entry).await;
        }
    }

    async fn apply_next_strategy(&mut self, id: &str, mut entry: RunningTask<B::Process>) {
        let action = entry.engine.next_action();

        let attempt_info = match &action {
            EscalationAction::Notify => Some(("notify", 1)),
            EscalationAction::Interrupt { .. } => Some(("interrupt", 1)),
            EscalationAction::KillAndRetry { attempt } => Some(("kill_and_retry", *attempt)),
            EscalationAction::SwitchAgent { .. } => Some(("switch_agent", 1)),
            EscalationAction::SimplifyScope { .. } => Some(("simplify_scope", 1)),
            EscalationAction::GiveUp { .. } => None,
        };
        if let Some((strategy, attempt)) = attempt_info {
            self.append_event(
                LogEvent::new(&self.run_id, Some(id), EventKind::EscalationAttempt).with_payload(
                    serde_json::json!({ "strategy": strategy, "attempt": attempt }),
                ),
            )
            .await;
        }

        match action {
            EscalationAction::Notify => {
                log_warn!("Task {} is stuck; operator attention may be needed", id);
                // Still escalating: the next strategy applies on the next tick.
                self.running.insert(id.to_string(), entry);
            }
            EscalationAction::Interrupt { grace } => {
                log_warn!("Interrupting stuck task {} ({}s grace)", id, grace.as_secs());
                if let Err(e) = entry.process.signal(SignalTier::Graceful) {
                    log_warn!("Failed to interrupt {}: {}", id, e);
                }
                entry.interrupt_deadline = Some(tokio::time::Instant::now() + grace);
                entry.escalating = false;
                self.running.insert(id.to_string(), entry);
            }
            EscalationAction::KillAndRetry { attempt } => {
                log_warn!("Restarting stuck task {} (attempt {})", id, attempt);
                match self.original_command(id) {
                    Ok(command) => self.restart(id, entry, command).await,
                    Err(e) => {
                        log_error!("{}", e);
                        self.fail_stuck(id, entry, &e).await;
                    }
                }
            }
            EscalationAction::SwitchAgent { runner } => {
                log_warn!("Handing stuck task {} to runner '{}'", id, runner);
                match self.handoff_command(id, &entry, &runner) {
                    Ok(command) => self.restart(id, entry, command).await,
                    Err(e) => {
                        log_warn!("switch_agent for {} unavailable: {}", id, e);
                        entry.engine.note_exhausted(Strategy::SwitchAgent, &e);
                        // Walk on to the next strategy.
                        self.running.insert(id.to_string(), entry);
                    }
                }
            }
            EscalationAction::SimplifyScope { prompt } => {
                log_warn!("Relaunching stuck task {} with reduced scope", id);
                let prompt = resolve_path(&prompt, &self.project_root);
                match self.command_for_prompt(id, &prompt) {
                    Ok(command) => self.restart(id, entry, command).await,
                    Err(e) => {
                        log_warn!("simplify_scope for {} unavailable: {}", id, e);
                        entry.engine.note_exhausted(Strategy::SimplifyScope, &e);
                        self.running.insert(id.to_string(), entry);
                    }
                }
            }
            EscalationAction::GiveUp { attempts } => {
                let err = OrchestrateError::EscalationExhausted {
                    task_id: id.to_string(),
                    attempts,
                };
                log_error!("{}", err);
                self.append_event(
                    LogEvent::new(&self.run_id, Some(id), EventKind::EscalationOutcome)
                        .with_payload(serde_json::json!({
                            "outcome": "exhausted",
                            "attempts": attempts,
                        })),
                )
                .await;
                self.fail_stuck(id, entry, "escalation strategies exhausted").await;
            }
        }
    }

    /// Terminate the stuck worker and finalize the task as failed.
    async fn fail_stuck(&mut self, id: &str, mut entry: RunningTask<B::Process>, reason: &str) {
        let grace = Duration::from_secs(supervisor::SIGTERM_GRACE_PERIOD_SECONDS);
        let code = supervisor::terminate(&mut entry.process, grace).await;
        self.finalize_exit(id, entry, code, Some(reason)).await;
    }

    /// Kill the worker, re-allocate a fresh workspace, and relaunch.
    ///
    /// The replacement gets a fresh monitor, so the full stuck threshold
    /// applies again.
    async fn restart(&mut self, id: &str, mut entry: RunningTask<B::Process>, command: String) {
        entry.stop_monitor();
        let grace = Duration::from_secs(supervisor::SIGTERM_GRACE_PERIOD_SECONDS);
        supervisor::terminate(&mut entry.process, grace).await;
        self.release_workspace(id, entry.allocation, ReleaseOutcome::Aborted).await;

        let Some(task) = self.graph.get(id).cloned() else {
            log_error!("Task '{}' vanished from graph during restart", id);
            return;
        };

        match self.start_worker(&task, command, entry.engine).await {
            Ok(replacement) => {
                self.running.insert(id.to_string(), replacement);
            }
            Err(e) => {
                log_error!("Relaunch of {} failed: {}", id, e);
                // Nothing running anymore; finalize directly.
                self.append_event(
                    LogEvent::new(&self.run_id, Some(id), EventKind::TaskEnd).with_payload(
                        serde_json::json!({
                            "exit_code": -1,
                            "status": "failed",
                            "reason": format!("relaunch failed: {}", e),
                        }),
                    ),
                )
                .await;
                if let Err(e) = self.graph.transition(id, TaskStatus::Failed) {
                    log_error!("{}", e);
                }
                self.block_dependents(id).await;
            }
        }
    }

    // --- Command construction ---

    fn runner_template(&self, id: &str) -> Result<String, String> {
        let task = self
            .graph
            .get(id)
            .ok_or_else(|| format!("Task '{}' not in graph", id))?;
        let runner = self
            .cfg
            .runners
            .get(&task.runner)
            .ok_or_else(|| format!("Runner '{}' not found in config", task.runner))?;
        Ok(runner.command.clone())
    }

    fn original_command(&self, id: &str) -> Result<String, String> {
        let template = self.runner_template(id)?;
        let task = self.graph.get(id).ok_or_else(|| format!("Task '{}' not in graph", id))?;
        config::build_command(&template, &task.prompt)
    }

    fn command_for_prompt(&self, id: &str, prompt: &Path) -> Result<String, String> {
        let template = self.runner_template(id)?;
        config::build_command(&template, prompt)
    }

    /// Build the alternate runner's command, writing the handoff artifact
    /// the replacement reads for context.
    fn handoff_command(
        &self,
        id: &str,
        entry: &RunningTask<B::Process>,
        runner_name: &str,
    ) -> Result<String, String> {
        let task = self
            .graph
            .get(id)
            .ok_or_else(|| format!("Task '{}' not in graph", id))?;
        let runner = self
            .cfg
            .runners
            .get(runner_name)
            .ok_or_else(|| format!("alternate runner '{}' not found in config", runner_name))?;

        let log_tail = watchdog::read_tail(&task.log_path, 4096).unwrap_or_default();
        let diff = git::diff_stat(&task.workspace).unwrap_or_default();
        let commits = git::recent_log(&task.workspace, 10).unwrap_or_default();
        let contents =
            escalation::build_handoff_markdown(id, entry.engine.records(), &log_tail, &diff, &commits);
        let handoff_path =
            escalation::write_handoff(&self.logs_dir.join("handoff"), id, &contents)?;

        match &runner.handoff_command {
            Some(template) => config::build_handoff_command(template, &task.prompt, &handoff_path),
            None => config::build_command(&runner.command, &task.prompt),
        }
    }

    // --- Launching ---

    async fn promote_and_launch(&mut self) {
        let promoted = self.graph.promote_ready();
        for id in promoted {
            self.append_event(LogEvent::new(&self.run_id, Some(&id), EventKind::TaskReady))
                .await;
        }

        for id in self.graph.ready_set() {
            self.launch_task(&id).await;
        }
    }

    async fn launch_task(&mut self, id: &str) {
        let Some(task) = self.graph.get(id).cloned() else { return };

        let allocation = match self.allocator.allocate(&task).await {
            Ok(allocation) => allocation,
            Err(e) => {
                log_error!("Workspace allocation for {} failed: {}", id, e);
                self.fail_before_start(id, &format!("workspace allocation failed: {}", e))
                    .await;
                return;
            }
        };

        self.append_event(
            LogEvent::new(&self.run_id, Some(id), EventKind::WorkspaceAllocated).with_payload(
                serde_json::json!({
                    "path": allocation.path.display().to_string(),
                    "branch": allocation.branch,
                }),
            ),
        )
        .await;

        let command = match self.original_command(id) {
            Ok(command) => command,
            Err(e) => {
                log_error!("Cannot build command for {}: {}", id, e);
                self.release_workspace(id, allocation, ReleaseOutcome::Aborted).await;
                self.fail_before_start(id, &e).await;
                return;
            }
        };

        self.append_event(
            LogEvent::new(&self.run_id, Some(id), EventKind::TaskStart)
                .with_payload(serde_json::json!({ "command": command.as_str() })),
        )
        .await;
        if let Err(e) = self.graph.transition(id, TaskStatus::Running) {
            log_error!("{}", e);
        }

        let engine = EscalationEngine::new(id, task.escalation.clone());
        let mut allocation = Some(allocation);
        match self
            .start_worker_with_allocation(&task, command, engine, &mut allocation)
            .await
        {
            Ok(entry) => {
                log_info!("Task {} started in {}", id, task.workspace.display());
                self.running.insert(id.to_string(), entry);
            }
            Err(e) => {
                log_error!("Failed to launch {}: {}", id, e);
                self.append_event(
                    LogEvent::new(&self.run_id, Some(id), EventKind::TaskEnd).with_payload(
                        serde_json::json!({
                            "exit_code": -1,
                            "status": "failed",
                            "reason": format!("launch failed: {}", e),
                        }),
                    ),
                )
                .await;
                if let Err(e) = self.graph.transition(id, TaskStatus::Failed) {
                    log_error!("{}", e);
                }
                if let Some(allocation) = allocation.take() {
                    self.release_workspace(id, allocation, ReleaseOutcome::Failure).await;
                }
                self.block_dependents(id).await;
            }
        }
    }

    /// Fail a task that never got a worker (workspace conflict, unbuildable
    /// command). The failure stays with this task; only its dependents become
    /// blocked.
    async fn fail_before_start(&mut self, id: &str, reason: &str) {
        self.append_event(
            LogEvent::new(&self.run_id, Some(id), EventKind::TaskEnd).with_payload(
                serde_json::json!({
                    "status": "failed",
                    "reason": reason,
                }),
            ),
        )
        .await;
        if let Err(e) = self.graph.transition(id, TaskStatus::Failed) {
            log_error!("{}", e);
        }
        self.block_dependents(id).await;
    }

    /// Allocate a fresh workspace and start a worker, preserving the task's
    /// escalation history. Used by restart paths.
    async fn start_worker(
        &mut self,
        task: &Task,
        command: String,
        engine: EscalationEngine,
    ) -> Result<RunningTask<B::Process>, OrchestrateError> {
        let allocation = self.allocator.allocate(task).await?;
        self.append_event(
            LogEvent::new(&self.run_id, Some(&task.id), EventKind::WorkspaceAllocated)
                .with_payload(serde_json::json!({
                    "path": allocation.path.display().to_string(),
                    "branch": allocation.branch,
                })),
        )
        .await;
        self.append_event(
            LogEvent::new(&self.run_id, Some(&task.id), EventKind::TaskStart).with_payload(
                serde_json::json!({ "command": command.as_str(), "relaunch": true }),
            ),
        )
        .await;

        let mut allocation = Some(allocation);
        match self
            .start_worker_with_allocation(task, command, engine, &mut allocation)
            .await
        {
            Ok(entry) => Ok(entry),
            Err(e) => {
                if let Some(allocation) = allocation.take() {
                    self.release_workspace(&task.id, allocation, ReleaseOutcome::Failure).await;
                }
                Err(e)
            }
        }
    }

    async fn start_worker_with_allocation(
        &mut self,
        task: &Task,
        command: String,
        engine: EscalationEngine,
        allocation: &mut Option<WorkspaceAllocation>,
    ) -> Result<RunningTask<B::Process>, OrchestrateError> {
        let spec = LaunchSpec {
            task_id: task.id.clone(),
            command,
            workdir: task.workspace.clone(),
            log_path: task.log_path.clone(),
        };
        let process = self.backend.start(&spec)?;

        let cancel = CancellationToken::new();
        let monitor = TaskWatchdog::new(
            &task.id,
            &task.workspace,
            &task.branch,
            &task.log_path,
            &self.project_root,
            task.watchdog.clone(),
        );
        watchdog::spawn_monitor(
            monitor,
            config::watchdog_interval(&task.watchdog),
            self.run_id.clone(),
            self.events.clone(),
            self.reports_tx.clone(),
            cancel.clone(),
        );

        let allocation = allocation
            .take()
            .ok_or_else(|| OrchestrateError::ProcessLaunch {
                task_id: task.id.clone(),
                reason: "workspace allocation missing".to_string(),
            })?;

        Ok(RunningTask {
            process,
            allocation,
            engine,
            monitor_cancel: cancel,
            escalating: false,
            interrupt_deadline: None,
        })
    }

    // --- Workspace release ---

    async fn release_workspace(
        &mut self,
        id: &str,
        mut allocation: WorkspaceAllocation,
        outcome: ReleaseOutcome,
    ) {
        if let Err(e) = self.allocator.release(&mut allocation, outcome).await {
            log_warn!("Releasing workspace for {}: {}", id, e);
        }
        self.append_event(
            LogEvent::new(&self.run_id, Some(id), EventKind::WorkspaceReleased).with_payload(
                serde_json::json!({
                    "path": allocation.path.display().to_string(),
                    "outcome": outcome.as_str(),
                }),
            ),
        )
        .await;
    }

    // --- Shutdown ---

    /// Terminate every worker and release every workspace. Tasks still
    /// running are recorded as failed with an "aborted" reason.
    async fn abort_all(&mut self) {
        let ids: Vec<String> = self.running.keys().cloned().collect();
        let grace = Duration::from_secs(supervisor::SIGTERM_GRACE_PERIOD_SECONDS);

        for id in ids {
            let Some(mut entry) = self.running.remove(&id) else { continue };
            entry.stop_monitor();
            let code = supervisor::terminate(&mut entry.process, grace).await;
            self.append_event(
                LogEvent::new(&self.run_id, Some(&id), EventKind::TaskEnd).with_payload(
                    serde_json::json!({
                        "exit_code": code,
                        "status": "failed",
                        "reason": "run aborted",
                    }),
                ),
            )
            .await;
            if let Err(e) = self.graph.transition(&id, TaskStatus::Failed) {
                log_error!("{}", e);
            }
            self.release_workspace(&id, entry.allocation, ReleaseOutcome::Aborted).await;
        }
    }

    // --- Event plumbing ---

    /// Append and wait; a transition is durable only after its event landed.
    async fn append_event(&self, event: LogEvent) {
        if let Err(e) = self.events.append(event).await {
            log_warn!("Event append failed: {}", e);
        }
    }
}

fn resolve_path(value: &Path, base: &Path) -> PathBuf {
    if value.is_absolute() {
        value.to_path_buf()
    } else {
        base.join(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_zero_on_clean_quiescence() {
        let outcome = RunOutcome {
            halt: HaltReason::Quiescent,
            succeeded: 3,
            failed: 0,
            blocked: 0,
        };
        assert_eq!(outcome.exit_code(), 0);
    }

    #[test]
    fn exit_code_counts_failed_and_blocked() {
        let outcome = RunOutcome {
            halt: HaltReason::Quiescent,
            succeeded: 1,
            failed: 1,
            blocked: 2,
        };
        assert_eq!(outcome.exit_code(), 3);
    }

    #[test]
    fn exit_code_clamps_to_portable_range() {
        let outcome = RunOutcome {
            halt: HaltReason::Quiescent,
            succeeded: 0,
            failed: 150,
            blocked: 0,
        };
        assert_eq!(outcome.exit_code(), 100);
    }

    #[test]
    fn shutdown_is_nonzero_even_without_failures() {
        let outcome = RunOutcome {
            halt: HaltReason::ShutdownRequested,
            succeeded: 2,
            failed: 0,
            blocked: 0,
        };
        assert_eq!(outcome.exit_code(), 1);
    }
}
