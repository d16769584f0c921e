use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::error::OrchestrateError;
use crate::git;
use crate::graph::Task;
use crate::log_warn;

/// An exclusively-owned mutation surface: one branch plus one worktree.
#[derive(Debug, Clone)]
pub struct WorkspaceAllocation {
    pub task_id: String,
    pub path: PathBuf,
    pub branch: String,
    pub created_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
}

impl WorkspaceAllocation {
    pub fn is_released(&self) -> bool {
        self.released_at.is_some()
    }
}

/// Terminal disposition of the task the workspace belonged to.
///
/// The branch survives in every case: on failure for post-mortem inspection,
/// on success as the input to the separate, human-gated merge step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Success,
    Failure,
    Aborted,
}

impl ReleaseOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseOutcome::Success => "success",
            ReleaseOutcome::Failure => "failure",
            ReleaseOutcome::Aborted => "aborted",
        }
    }
}

/// Creates and destroys per-task worktrees, enforcing path exclusivity.
///
/// At most one live allocation per path at any time; the allocator never
/// merges anything.
pub struct WorkspaceAllocator {
    project_root: PathBuf,
    live: HashSet<PathBuf>,
}

impl WorkspaceAllocator {
    pub fn new(project_root: &Path) -> Self {
        Self {
            project_root: project_root.to_path_buf(),
            live: HashSet::new(),
        }
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn is_allocated(&self, path: &Path) -> bool {
        self.live.contains(path)
    }

    /// Create the task's branch and worktree.
    ///
    /// Fails with `WorkspaceConflict` when the path is live-allocated, is an
    /// existing non-worktree directory, or its parent cannot be created. A
    /// leftover worktree from a previous run (same branch) is reattached.
    pub async fn allocate(&mut self, task: &Task) -> Result<WorkspaceAllocation, OrchestrateError> {
        let path = task.workspace.clone();

        if self.live.contains(&path) {
            return Err(OrchestrateError::WorkspaceConflict {
                task_id: task.id.clone(),
                reason: format!("path {} is already allocated", path.display()),
            });
        }

        let root = self.project_root.clone();
        let branch = task.branch.clone();
        let task_id = task.id.clone();
        let prep_path = path.clone();

        let result = tokio::task::spawn_blocking(move || {
            if prep_path.exists() {
                if git::is_worktree(&prep_path) {
                    // Leftover from a prior run; reattach rather than fail.
                    return Ok(());
                }
                return Err(format!(
                    "path {} exists and is not a git worktree",
                    prep_path.display()
                ));
            }
            if let Some(parent) = prep_path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| format!("cannot create {}: {}", parent.display(), e))?;
            }
            git::worktree_add(&root, &prep_path, &branch)
        })
        .await
        .unwrap_or_else(|e| Err(format!("spawn_blocking panicked: {}", e)));

        result.map_err(|reason| OrchestrateError::WorkspaceConflict {
            task_id: task_id.clone(),
            reason,
        })?;

        self.live.insert(path.clone());

        Ok(WorkspaceAllocation {
            task_id: task.id.clone(),
            path,
            branch: task.branch.clone(),
            created_at: Utc::now(),
            released_at: None,
        })
    }

    /// Remove the worktree directory and retire the allocation.
    ///
    /// Idempotent: releasing an already-released allocation is a no-op. The
    /// branch is always left intact.
    pub async fn release(
        &mut self,
        allocation: &mut WorkspaceAllocation,
        outcome: ReleaseOutcome,
    ) -> Result<(), String> {
        if allocation.is_released() {
            return Ok(());
        }

        let root = self.project_root.clone();
        let path = allocation.path.clone();

        let result = tokio::task::spawn_blocking(move || {
            if path.exists() {
                git::worktree_remove(&root, &path)?;
            }
            git::worktree_prune(&root)
        })
        .await
        .unwrap_or_else(|e| Err(format!("spawn_blocking panicked: {}", e)));

        if let Err(ref e) = result {
            log_warn!(
                "Warning: releasing workspace {} ({}): {}",
                allocation.path.display(),
                outcome.as_str(),
                e
            );
        }

        // Retire the allocation even when removal failed: the run is done
        // with this surface either way, and a half-removed worktree must not
        // wedge the exclusivity set forever.
        self.live.remove(&allocation.path);
        allocation.released_at = Some(Utc::now());

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_outcome_strings() {
        assert_eq!(ReleaseOutcome::Success.as_str(), "success");
        assert_eq!(ReleaseOutcome::Failure.as_str(), "failure");
        assert_eq!(ReleaseOutcome::Aborted.as_str(), "aborted");
    }
}
