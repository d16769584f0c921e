#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::process::Command;

use tempfile::TempDir;

use orchestrate::config::{
    EscalationConfig, OrchestrateConfig, ProjectConfig, RunnerConfig, TaskConfig, WatchdogConfig,
};
use orchestrate::types::Phase;

/// Creates a temporary directory initialized as a git repository with one
/// commit, a `prompts/` directory, and a ready-to-use prompt file.
///
/// Returns the `TempDir` handle. The directory is cleaned up when dropped.
pub fn setup_repo() -> TempDir {
    let dir = TempDir::new().expect("Failed to create temp dir");
    git(dir.path(), &["init", "-b", "main"]);
    git(dir.path(), &["config", "user.email", "test@test.com"]);
    git(dir.path(), &["config", "user.name", "Test"]);

    fs::write(dir.path().join("README.md"), "# Test\n").expect("Failed to write README");
    git(dir.path(), &["add", "README.md"]);
    git(dir.path(), &["commit", "-m", "Initial commit"]);

    fs::create_dir_all(dir.path().join("prompts")).expect("Failed to create prompts dir");
    fs::write(dir.path().join("prompts/task.md"), "Do the task.\n")
        .expect("Failed to write prompt");

    dir
}

/// Runs a git command in `dir`, panicking on failure.
pub fn git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("Failed to run git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Commits all current changes in `dir` with the given message.
pub fn commit_all(dir: &Path, message: &str) {
    git(dir, &["add", "-A"]);
    git(dir, &["commit", "--allow-empty", "-m", message]);
}

/// A task config with minimal defaults: main phase, `worktrees/{task}`
/// workspace, the shared prompt file, no overrides.
pub fn task_config(id: &str, deps: &[&str]) -> TaskConfig {
    TaskConfig {
        id: id.to_string(),
        phase: Phase::Main,
        branch: None,
        workspace: format!("worktrees/{}", id),
        runner: None,
        prompt: "prompts/task.md".to_string(),
        depends_on: deps.iter().map(|s| s.to_string()).collect(),
        manual: false,
        watchdog: None,
        escalation: None,
    }
}

/// A config with one `true`-command runner and the given tasks.
pub fn config_with_tasks(tasks: Vec<TaskConfig>) -> OrchestrateConfig {
    let mut runners = HashMap::new();
    runners.insert(
        "shell".to_string(),
        RunnerConfig {
            command: "cat {prompt} > /dev/null".to_string(),
            handoff_command: None,
        },
    );
    OrchestrateConfig {
        project: ProjectConfig::default(),
        runners,
        watchdog: WatchdogConfig::default(),
        escalation: EscalationConfig::default(),
        tasks,
    }
}
