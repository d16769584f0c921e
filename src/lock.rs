use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::OrchestrateError;
use crate::log_warn;
use crate::types::Phase;

/// Durable record of who holds a phase lock, written into the lock file.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PhaseLockInfo {
    pub phase: Phase,
    pub run_id: String,
    pub acquired_at: String,
    pub pid: u32,
}

/// Holds a phase lock; removes the lock file on drop.
///
/// The lock is cooperative: mutual exclusion is the atomic `create_new` of the
/// lock file, and *absence* of the file is the precondition other runs check.
#[must_use = "lock is released when PhaseLockGuard is dropped"]
pub struct PhaseLockGuard {
    path: PathBuf,
    released: bool,
}

impl std::fmt::Debug for PhaseLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhaseLockGuard")
            .field("path", &self.path)
            .field("released", &self.released)
            .finish()
    }
}

impl PhaseLockGuard {
    /// Remove the lock file. Idempotent; also runs on drop.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log_warn!(
                    "Warning: Failed to remove lock file {}: {}",
                    self.path.display(),
                    e
                );
            }
        }
    }
}

impl Drop for PhaseLockGuard {
    fn drop(&mut self) {
        self.release();
    }
}

fn lock_path(locks_dir: &Path, phase: Phase) -> PathBuf {
    locks_dir.join(format!("{}-run.lock", phase))
}

/// Read the holder payload of an existing lock file, if parseable.
pub fn read_holder(locks_dir: &Path, phase: Phase) -> Option<PhaseLockInfo> {
    let contents = fs::read_to_string(lock_path(locks_dir, phase)).ok()?;
    serde_json::from_str(&contents).ok()
}

/// Whether the lock file for `phase` exists.
pub fn is_held(locks_dir: &Path, phase: Phase) -> bool {
    lock_path(locks_dir, phase).exists()
}

/// Acquire the lock for a privileged phase.
///
/// Fails with `PhaseLockHeld` when the lock file already exists. The holder's
/// run id (when the payload parses, and noting a dead holder pid) is surfaced
/// so the operator can tell a live run from a stale file.
pub fn acquire(
    locks_dir: &Path,
    phase: Phase,
    run_id: &str,
) -> Result<PhaseLockGuard, OrchestrateError> {
    fs::create_dir_all(locks_dir)?;
    let path = lock_path(locks_dir, phase);

    let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            let holder = read_holder(locks_dir, phase);
            let holder_run_id = holder.map(|info| {
                if is_pid_alive(info.pid as i32) {
                    info.run_id
                } else {
                    format!("{} (pid {} no longer alive, stale lock?)", info.run_id, info.pid)
                }
            });
            return Err(OrchestrateError::PhaseLockHeld {
                phase: phase.to_string(),
                holder_run_id,
            });
        }
        Err(e) => return Err(e.into()),
    };

    let info = PhaseLockInfo {
        phase,
        run_id: run_id.to_string(),
        acquired_at: chrono::Utc::now().to_rfc3339(),
        pid: std::process::id(),
    };
    let payload = serde_json::to_string(&info)
        .map_err(|e| OrchestrateError::Config(format!("Failed to serialize lock payload: {}", e)))?;
    file.write_all(payload.as_bytes())?;

    Ok(PhaseLockGuard {
        path,
        released: false,
    })
}

/// Refuse to start a non-privileged run while any privileged lock is held.
pub fn check_privileged_free(locks_dir: &Path) -> Result<(), OrchestrateError> {
    for phase in [Phase::Main] {
        if is_held(locks_dir, phase) {
            let holder_run_id = read_holder(locks_dir, phase).map(|info| info.run_id);
            return Err(OrchestrateError::PhaseLockHeld {
                phase: phase.to_string(),
                holder_run_id,
            });
        }
    }
    Ok(())
}

fn is_pid_alive(pid: i32) -> bool {
    // signal 0 checks if process exists without sending a signal
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}
