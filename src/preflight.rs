use std::path::{Path, PathBuf};

use crate::config::OrchestrateConfig;
use crate::git;
use crate::graph::Task;

/// One failed readiness check, with enough context to fix it without
/// reading source code.
#[derive(Debug, Clone, PartialEq)]
pub struct PreflightError {
    pub condition: String,
    pub location: String,
    pub suggested_fix: String,
}

impl std::fmt::Display for PreflightError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({})\n    fix: {}",
            self.condition, self.location, self.suggested_fix
        )
    }
}

/// Commands resolved by the shell itself rather than a PATH lookup.
const SHELL_BUILTINS: &[&str] = &["cat", "echo", "true", "false", "sh", "test", "cd", ":"];

/// Run every readiness check and aggregate all failures.
///
/// All checks run even after the first failure so the operator sees the full
/// list in one pass instead of fixing errors one by one.
pub fn run_checks(
    config: &OrchestrateConfig,
    tasks: &[Task],
    project_root: &Path,
    logs_dir: &Path,
) -> Result<(), Vec<PreflightError>> {
    let mut errors = Vec::new();

    check_git(project_root, &mut errors);
    check_logs_dir(logs_dir, &mut errors);
    check_runners(config, &mut errors);
    check_tasks(tasks, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_git(project_root: &Path, errors: &mut Vec<PreflightError>) {
    if binary_on_path("git").is_none() {
        errors.push(PreflightError {
            condition: "git not found on PATH".to_string(),
            location: "environment".to_string(),
            suggested_fix: "install git or add it to PATH".to_string(),
        });
        return; // repository checks would only produce noise
    }

    if let Err(e) = git::check_preconditions(project_root) {
        errors.push(PreflightError {
            condition: e,
            location: format!("project.root = {}", project_root.display()),
            suggested_fix: "point project.root at a git checkout on a branch".to_string(),
        });
    }
}

fn check_logs_dir(logs_dir: &Path, errors: &mut Vec<PreflightError>) {
    if let Err(e) = std::fs::create_dir_all(logs_dir) {
        errors.push(PreflightError {
            condition: format!("cannot create logs directory: {}", e),
            location: format!("project.logs_dir = {}", logs_dir.display()),
            suggested_fix: "choose a writable logs_dir".to_string(),
        });
        return;
    }

    // An existing directory may still be read-only; probe with a real write.
    let probe = logs_dir.join(".write-probe");
    match std::fs::write(&probe, b"probe") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
        }
        Err(e) => errors.push(PreflightError {
            condition: format!("logs directory is not writable: {}", e),
            location: format!("project.logs_dir = {}", logs_dir.display()),
            suggested_fix: "fix permissions on the logs directory".to_string(),
        }),
    }
}

fn check_runners(config: &OrchestrateConfig, errors: &mut Vec<PreflightError>) {
    for (name, runner) in &config.runners {
        let Some(binary) = first_word(&runner.command) else {
            continue; // empty command already rejected by config validation
        };
        let found = if binary.contains('/') {
            Path::new(binary).exists()
        } else {
            SHELL_BUILTINS.contains(&binary) || binary_on_path(binary).is_some()
        };
        if !found {
            errors.push(PreflightError {
                condition: format!("runner binary '{}' not found", binary),
                location: format!("runners.{}.command", name),
                suggested_fix: format!("install '{}' or correct the command", binary),
            });
        }
    }
}

fn check_tasks(tasks: &[Task], errors: &mut Vec<PreflightError>) {
    for task in tasks {
        if !task.prompt.exists() {
            errors.push(PreflightError {
                condition: format!("prompt file {} does not exist", task.prompt.display()),
                location: format!("tasks.{}.prompt", task.id),
                suggested_fix: "create the prompt file or fix the path".to_string(),
            });
        }

        // A leftover worktree from a prior run is reattachable; any other
        // existing path would shadow the isolation guarantee.
        if task.workspace.exists() && !git::is_worktree(&task.workspace) {
            errors.push(PreflightError {
                condition: format!(
                    "workspace path {} exists and is not a git worktree",
                    task.workspace.display()
                ),
                location: format!("tasks.{}.workspace", task.id),
                suggested_fix: "remove the directory or choose another workspace path".to_string(),
            });
        }
    }
}

fn first_word(command: &str) -> Option<&str> {
    command.split_whitespace().next()
}

/// Resolve a binary against PATH, like `which`.
fn binary_on_path(binary: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}
