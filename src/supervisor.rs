use std::collections::HashSet;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::unistd::Pid;

use crate::error::OrchestrateError;
use crate::log_debug;
use crate::types::SignalTier;

/// Maximum time to wait for graceful shutdown after SIGTERM before SIGKILL.
pub const SIGTERM_GRACE_PERIOD_SECONDS: u64 = 5;

/// Polling interval when waiting for a process group to exit.
const KILL_POLL_INTERVAL_MS: u64 = 100;

// --- Shutdown flag ---

/// Global shutdown flag shared with signal handlers.
fn shutdown_flag() -> &'static Arc<AtomicBool> {
    static FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();
    FLAG.get_or_init(|| Arc::new(AtomicBool::new(false)))
}

/// Check if a shutdown has been requested via signal.
pub fn is_shutdown_requested() -> bool {
    shutdown_flag().load(Ordering::Relaxed)
}

/// Install signal handlers for SIGTERM and SIGINT that set the shutdown flag.
///
/// Call once at program startup. Subsequent calls are safe (re-registers handlers).
pub fn install_signal_handlers() -> Result<(), String> {
    let flag = Arc::clone(shutdown_flag());
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&flag))
        .map_err(|e| format!("Failed to register SIGTERM handler: {}", e))?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, flag)
        .map_err(|e| format!("Failed to register SIGINT handler: {}", e))?;
    Ok(())
}

#[cfg(test)]
pub fn set_shutdown_flag_for_testing(value: bool) {
    shutdown_flag().store(value, Ordering::Relaxed);
}

// --- Process registry ---

/// Global registry of active child process group IDs.
///
/// Uses `std::sync::Mutex` (not tokio's) because operations are fast
/// (insert/remove/iterate) with no I/O under the lock.
fn process_registry() -> &'static Arc<std::sync::Mutex<HashSet<Pid>>> {
    static REGISTRY: OnceLock<Arc<std::sync::Mutex<HashSet<Pid>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Arc::new(std::sync::Mutex::new(HashSet::new())))
}

fn register_child(pgid: Pid) {
    if let Ok(mut registry) = process_registry().lock() {
        registry.insert(pgid);
    }
}

fn unregister_child(pgid: Pid) {
    if let Ok(mut registry) = process_registry().lock() {
        registry.remove(&pgid);
    }
}

/// Kill all registered child process groups.
///
/// Sends SIGTERM to all registered PGIDs, waits for the grace period,
/// then SIGKILLs any survivors. Clears the registry when done.
pub fn kill_all_children() {
    use nix::sys::signal::{killpg, Signal};

    let pgids: Vec<Pid> = {
        let Ok(registry) = process_registry().lock() else {
            return;
        };
        registry.iter().copied().collect()
    };

    if pgids.is_empty() {
        return;
    }

    for &pgid in &pgids {
        let _ = killpg(pgid, Signal::SIGTERM);
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(SIGTERM_GRACE_PERIOD_SECONDS);
    let poll_interval = Duration::from_millis(KILL_POLL_INTERVAL_MS);

    while std::time::Instant::now() < deadline {
        let all_gone = pgids
            .iter()
            .all(|&pgid| matches!(killpg(pgid, None), Err(nix::errno::Errno::ESRCH)));
        if all_gone {
            break;
        }
        std::thread::sleep(poll_interval);
    }

    for &pgid in &pgids {
        let _ = killpg(pgid, Signal::SIGKILL);
    }

    if let Ok(mut registry) = process_registry().lock() {
        registry.clear();
    }
}

// --- Capability trait ---

/// Everything needed to launch one worker process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub task_id: String,
    /// Fully expanded shell command (prompt path substituted).
    pub command: String,
    /// Workspace directory the worker runs in.
    pub workdir: PathBuf,
    /// Per-task log file; combined stdout/stderr appended here.
    pub log_path: PathBuf,
}

/// A launched worker under supervision.
///
/// `poll` is non-blocking and idempotent once the exit is observed. Exit
/// codes follow the shell convention: signal-killed maps to 128 + signo.
pub trait WorkerProcess: Send {
    fn pid(&self) -> Option<u32>;
    fn started_at(&self) -> DateTime<Utc>;
    fn poll(&mut self) -> Option<i32>;
    fn signal(&mut self, tier: SignalTier) -> Result<(), String>;
    /// Immediate SIGKILL without the grace window. `terminate` is the
    /// graceful path.
    fn force_kill(&mut self);
}

/// Polymorphic worker backend: the supervisor and scheduler depend only on
/// this capability, never on a concrete agent CLI.
pub trait WorkerBackend: Send + Sync {
    type Process: WorkerProcess;

    fn start(&self, spec: &LaunchSpec) -> Result<Self::Process, OrchestrateError>;
}

/// Graceful-then-forceful termination of a worker.
///
/// SIGTERM to the process group, poll within the grace window, SIGKILL
/// survivors, then reap. Guaranteed to return with the exit observed.
pub async fn terminate<P: WorkerProcess>(process: &mut P, grace: Duration) -> i32 {
    if let Some(code) = process.poll() {
        return code;
    }

    let _ = process.signal(SignalTier::Forceful);

    let poll_interval = Duration::from_millis(KILL_POLL_INTERVAL_MS);
    let deadline = tokio::time::Instant::now() + grace;
    loop {
        if let Some(code) = process.poll() {
            return code;
        }
        if tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(poll_interval).await;
    }

    process.force_kill();
    loop {
        if let Some(code) = process.poll() {
            return code;
        }
        tokio::time::sleep(poll_interval).await;
    }
}

// --- Shell backend ---

/// Spawns `sh -c <command>` in the workspace, in its own process group,
/// with combined output appended to the task log.
pub struct ShellWorkerBackend;

pub struct ShellWorkerProcess {
    child: tokio::process::Child,
    pgid: Pid,
    started_at: DateTime<Utc>,
    exit_code: Option<i32>,
}

impl WorkerBackend for ShellWorkerBackend {
    type Process = ShellWorkerProcess;

    fn start(&self, spec: &LaunchSpec) -> Result<ShellWorkerProcess, OrchestrateError> {
        let log_file = open_log(&spec.log_path).map_err(|e| OrchestrateError::ProcessLaunch {
            task_id: spec.task_id.clone(),
            reason: e,
        })?;
        let log_file_err = log_file
            .try_clone()
            .map_err(|e| OrchestrateError::ProcessLaunch {
                task_id: spec.task_id.clone(),
                reason: format!("Failed to clone log handle: {}", e),
            })?;

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(&spec.command);
        cmd.current_dir(&spec.workdir);
        // stdin MUST be null — with setpgid the child is in a background
        // process group, and any attempt to read from the terminal would
        // cause SIGTTIN (silent stop).
        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::from(log_file));
        cmd.stderr(std::process::Stdio::from(log_file_err));
        cmd.kill_on_drop(true);

        // SAFETY: pre_exec runs between fork() and exec() where only
        // async-signal-safe functions are permitted. setpgid is
        // async-signal-safe per POSIX.
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(std::io::Error::other)?;
                Ok(())
            });
        }

        log_debug!("[supervisor] Spawning worker for {}...", spec.task_id);
        let child = cmd.spawn().map_err(|e| OrchestrateError::ProcessLaunch {
            task_id: spec.task_id.clone(),
            reason: e.to_string(),
        })?;

        let child_pid = child.id().ok_or_else(|| OrchestrateError::ProcessLaunch {
            task_id: spec.task_id.clone(),
            reason: "Failed to get child PID".to_string(),
        })? as i32;
        let pgid = Pid::from_raw(child_pid);
        log_debug!("[supervisor] Worker for {} spawned (pid={})", spec.task_id, child_pid);

        register_child(pgid);

        Ok(ShellWorkerProcess {
            child,
            pgid,
            started_at: Utc::now(),
            exit_code: None,
        })
    }
}

impl WorkerProcess for ShellWorkerProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    fn poll(&mut self) -> Option<i32> {
        if let Some(code) = self.exit_code {
            return Some(code);
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                let code = status
                    .code()
                    .unwrap_or_else(|| 128 + status.signal().unwrap_or(0));
                self.exit_code = Some(code);
                unregister_child(self.pgid);
                Some(code)
            }
            Ok(None) => None,
            Err(_) => {
                // Reap failure: treat as gone with an unknown-exit marker.
                self.exit_code = Some(-1);
                unregister_child(self.pgid);
                Some(-1)
            }
        }
    }

    fn signal(&mut self, tier: SignalTier) -> Result<(), String> {
        use nix::sys::signal::{killpg, Signal};
        let signal = match tier {
            SignalTier::Graceful => Signal::SIGINT,
            SignalTier::Forceful => Signal::SIGTERM,
        };
        match killpg(self.pgid, signal) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(format!("killpg({}) failed: {}", self.pgid, e)),
        }
    }

    fn force_kill(&mut self) {
        use nix::sys::signal::{killpg, Signal};
        let _ = killpg(self.pgid, Signal::SIGKILL);
        unregister_child(self.pgid);
    }
}

fn open_log(path: &Path) -> Result<std::fs::File, String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create {}: {}", parent.display(), e))?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| format!("Failed to open log {}: {}", path.display(), e))
}

// --- Mock backend for scheduler tests ---

/// Scripted worker backend. Each `start` pops the next result: `Err` becomes
/// a launch failure, `Ok((polls, code))` yields a process that reports `code`
/// after `polls` calls to `poll`.
pub struct MockWorkerBackend {
    scripts: std::sync::Mutex<Vec<Result<(u32, i32), String>>>,
}

impl MockWorkerBackend {
    pub fn new(results: Vec<Result<(u32, i32), String>>) -> Self {
        let mut reversed = results;
        reversed.reverse();
        Self {
            scripts: std::sync::Mutex::new(reversed),
        }
    }
}

#[derive(Debug)]
pub struct MockWorkerProcess {
    polls_until_exit: u32,
    exit_code: i32,
    started_at: DateTime<Utc>,
    finished: Option<i32>,
    terminated: bool,
}

impl WorkerBackend for MockWorkerBackend {
    type Process = MockWorkerProcess;

    fn start(&self, spec: &LaunchSpec) -> Result<MockWorkerProcess, OrchestrateError> {
        let script = self
            .scripts
            .lock()
            .expect("mock script lock poisoned")
            .pop()
            .unwrap_or(Ok((0, 0)));
        match script {
            Ok((polls_until_exit, exit_code)) => Ok(MockWorkerProcess {
                polls_until_exit,
                exit_code,
                started_at: Utc::now(),
                finished: None,
                terminated: false,
            }),
            Err(reason) => Err(OrchestrateError::ProcessLaunch {
                task_id: spec.task_id.clone(),
                reason,
            }),
        }
    }
}

impl WorkerProcess for MockWorkerProcess {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    fn poll(&mut self) -> Option<i32> {
        if let Some(code) = self.finished {
            return Some(code);
        }
        if self.terminated {
            self.finished = Some(128 + 15);
            return self.finished;
        }
        if self.polls_until_exit == 0 {
            self.finished = Some(self.exit_code);
            return self.finished;
        }
        self.polls_until_exit -= 1;
        None
    }

    fn signal(&mut self, tier: SignalTier) -> Result<(), String> {
        if tier == SignalTier::Forceful {
            self.terminated = true;
        }
        Ok(())
    }

    fn force_kill(&mut self) {
        self.terminated = true;
    }
}
