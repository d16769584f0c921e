use std::path::Path;
use std::process::Command;

/// Verify that a git repository exists at the given directory.
pub fn is_git_repo(repo_dir: &Path) -> Result<(), String> {
    run_git(&["rev-parse", "--git-dir"], repo_dir)
        .map_err(|_| "Not a git repository (or git is not installed)".to_string())?;
    Ok(())
}

/// Verify git preconditions for safe orchestration.
///
/// Workers mutate isolated worktrees, never the root checkout, so a dirty
/// tree is tolerated. Detached HEAD is rejected because worktree branches
/// fork from the current reference.
pub fn check_preconditions(repo_dir: &Path) -> Result<(), String> {
    is_git_repo(repo_dir)?;

    let head_check = run_git(&["symbolic-ref", "--quiet", "HEAD"], repo_dir);
    if head_check.is_err() {
        return Err(
            "Detached HEAD state detected. Check out a branch before starting a run.".to_string(),
        );
    }

    Ok(())
}

/// Whether `path` is the top-level directory of a git working tree.
///
/// Comparing against `--show-toplevel` matters: a plain directory nested
/// inside a checkout is *inside* a work tree without being one, and treating
/// it as reattachable would hand a worker the shared repository itself.
pub fn is_worktree(path: &Path) -> bool {
    let Ok(output) = run_git(&["rev-parse", "--show-toplevel"], path) else {
        return false;
    };
    let toplevel = Path::new(output.trim()).canonicalize();
    match (toplevel, path.canonicalize()) {
        (Ok(top), Ok(here)) => top == here,
        _ => false,
    }
}

/// Create a worktree at `path` on a new branch forked from the current ref.
///
/// Falls back to attaching an existing branch of the same name, matching the
/// behavior of re-running a task whose branch survived a prior run.
pub fn worktree_add(repo_dir: &Path, path: &Path, branch: &str) -> Result<(), String> {
    let path_str = path
        .to_str()
        .ok_or_else(|| format!("Worktree path contains invalid UTF-8: {:?}", path))?;

    let created = run_git(&["worktree", "add", "-b", branch, path_str], repo_dir);
    if created.is_ok() {
        return Ok(());
    }

    run_git(&["worktree", "add", path_str, branch], repo_dir)
        .map(|_| ())
        .map_err(|e| format!("Failed to create worktree at {}: {}", path.display(), e))
}

/// Remove a worktree directory. The branch is left intact.
pub fn worktree_remove(repo_dir: &Path, path: &Path) -> Result<(), String> {
    let path_str = path
        .to_str()
        .ok_or_else(|| format!("Worktree path contains invalid UTF-8: {:?}", path))?;
    run_git(&["worktree", "remove", "--force", path_str], repo_dir)?;
    Ok(())
}

/// Drop stale worktree bookkeeping after out-of-band directory removal.
pub fn worktree_prune(repo_dir: &Path) -> Result<(), String> {
    run_git(&["worktree", "prune"], repo_dir)?;
    Ok(())
}

/// Number of commits reachable from `branch`.
///
/// The watchdog compares successive counts to detect commit activity.
pub fn rev_count(repo_dir: &Path, branch: &str) -> Result<u64, String> {
    let output = run_git(&["rev-list", "--count", branch], repo_dir)?;
    output
        .trim()
        .parse::<u64>()
        .map_err(|e| format!("Unexpected rev-list output '{}': {}", output.trim(), e))
}

/// Returns the full 40-character SHA of HEAD.
pub fn head_sha(repo_dir: &Path) -> Result<String, String> {
    let output = run_git(&["rev-parse", "HEAD"], repo_dir)?;
    Ok(output.trim().to_string())
}

/// Summary of uncommitted changes in a worktree (`git diff --stat HEAD`),
/// used in handoff artifacts.
pub fn diff_stat(worktree: &Path) -> Result<String, String> {
    let output = run_git(&["diff", "--stat", "HEAD"], worktree)?;
    Ok(output.trim().to_string())
}

/// Last few commit subjects on the worktree's branch, used in handoff artifacts.
pub fn recent_log(worktree: &Path, count: u32) -> Result<String, String> {
    let count_arg = format!("-{}", count);
    let output = run_git(&["log", "--oneline", &count_arg], worktree)?;
    Ok(output.trim().to_string())
}

/// Run a git command in `repo_dir` and return its stdout as a string.
fn run_git(args: &[&str], repo_dir: &Path) -> Result<String, String> {
    let mut cmd = Command::new("git");
    cmd.args(args);
    cmd.current_dir(repo_dir);

    let output = cmd
        .output()
        .map_err(|e| format!("Failed to run git {}: {}", args.first().unwrap_or(&""), e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!(
            "git {} failed: {}",
            args.first().unwrap_or(&""),
            stderr.trim()
        ));
    }

    String::from_utf8(output.stdout).map_err(|e| format!("git output is not valid UTF-8: {}", e))
}
