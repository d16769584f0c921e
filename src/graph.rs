use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::config::{self, EscalationConfig, OrchestrateConfig, WatchdogConfig};
use crate::error::OrchestrateError;
use crate::types::{Phase, TaskStatus};

/// A validated, schedulable task with templates expanded and paths resolved.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub phase: Phase,
    pub branch: String,
    pub workspace: PathBuf,
    pub runner: String,
    pub prompt: PathBuf,
    pub depends_on: Vec<String>,
    pub manual: bool,
    pub status: TaskStatus,
    pub watchdog: WatchdogConfig,
    pub escalation: EscalationConfig,
    pub log_path: PathBuf,
}

/// The validated task graph for one run.
///
/// Construction is pure apart from path joining: no branches are created, no
/// directories touched. The scheduler is the only mutator of task status.
#[derive(Debug)]
pub struct TaskGraph {
    tasks: Vec<Task>,
    index: HashMap<String, usize>,
}

impl TaskGraph {
    /// Validate the configured task list and select the tasks for this run.
    ///
    /// Validation order:
    /// 1. duplicate ids, dangling dependency references (ConfigError)
    /// 2. cycle detection over the full task list (DependencyCycleError)
    /// 3. phase + manual selection; a selected task depending on an excluded
    ///    task is a ConfigError (original behavior: fail loudly rather than
    ///    silently never scheduling it)
    pub fn build(
        cfg: &OrchestrateConfig,
        run_id: &str,
        phase: Phase,
        include_manual: bool,
        project_root: &Path,
        logs_dir: &Path,
    ) -> Result<TaskGraph, OrchestrateError> {
        let mut seen = HashSet::new();
        for task in &cfg.tasks {
            if !seen.insert(task.id.as_str()) {
                return Err(OrchestrateError::Config(format!(
                    "Duplicate task id: {}",
                    task.id
                )));
            }
        }

        for task in &cfg.tasks {
            for dep in &task.depends_on {
                if !seen.contains(dep.as_str()) {
                    return Err(OrchestrateError::Config(format!(
                        "Task '{}' depends on unknown task '{}'",
                        task.id, dep
                    )));
                }
            }
        }

        detect_cycles(&cfg.tasks)?;

        let selected: Vec<&config::TaskConfig> = cfg
            .tasks
            .iter()
            .filter(|t| t.phase == phase && (!t.manual || include_manual))
            .collect();

        let selected_ids: HashSet<&str> = selected.iter().map(|t| t.id.as_str()).collect();
        for task in &selected {
            let missing: Vec<&str> = task
                .depends_on
                .iter()
                .map(|d| d.as_str())
                .filter(|d| !selected_ids.contains(d))
                .collect();
            if !missing.is_empty() {
                return Err(OrchestrateError::Config(format!(
                    "Task '{}' depends on excluded tasks: {}",
                    task.id,
                    missing.join(", ")
                )));
            }
        }

        let mut tasks = Vec::with_capacity(selected.len());
        for tc in selected {
            let branch = config::expand_template(&tc.branch_template(), run_id, phase, &tc.id)
                .map_err(OrchestrateError::Config)?;
            let workspace = config::expand_template(&tc.workspace, run_id, phase, &tc.id)
                .map_err(OrchestrateError::Config)?;
            let (runner, _) = config::resolve_runner(cfg, tc).map_err(OrchestrateError::Config)?;

            tasks.push(Task {
                id: tc.id.clone(),
                phase,
                branch,
                workspace: resolve_path(&workspace, project_root),
                runner: runner.to_string(),
                prompt: resolve_path(&tc.prompt, project_root),
                depends_on: tc.depends_on.clone(),
                manual: tc.manual,
                status: TaskStatus::Pending,
                watchdog: tc.watchdog.clone().unwrap_or_else(|| cfg.watchdog.clone()),
                escalation: tc.escalation.clone().unwrap_or_else(|| cfg.escalation.clone()),
                log_path: logs_dir.join(format!("{}.log", tc.id)),
            });
        }

        let index = tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.clone(), i))
            .collect();

        Ok(TaskGraph { tasks, index })
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.index.get(id).map(|&i| &self.tasks[i])
    }

    /// Apply a status transition, enforcing the legality matrix.
    pub fn transition(&mut self, id: &str, to: TaskStatus) -> Result<(), String> {
        let idx = *self
            .index
            .get(id)
            .ok_or_else(|| format!("Task '{}' not in graph", id))?;
        let task = &mut self.tasks[idx];
        if !task.status.is_valid_transition(&to) {
            return Err(format!(
                "Task '{}': invalid transition {} -> {}",
                id, task.status, to
            ));
        }
        task.status = to;
        Ok(())
    }

    /// Tasks whose dependencies all succeeded, promoted Pending -> Ready.
    ///
    /// Returns the ids promoted this call, in config order.
    pub fn promote_ready(&mut self) -> Vec<String> {
        let succeeded: HashSet<String> = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Succeeded)
            .map(|t| t.id.clone())
            .collect();

        let mut promoted = Vec::new();
        for task in &mut self.tasks {
            if task.status == TaskStatus::Pending
                && task.depends_on.iter().all(|d| succeeded.contains(d))
            {
                task.status = TaskStatus::Ready;
                promoted.push(task.id.clone());
            }
        }
        promoted
    }

    /// Ids currently in Ready, in config order.
    pub fn ready_set(&self) -> Vec<String> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Ready)
            .map(|t| t.id.clone())
            .collect()
    }

    /// Block every non-terminal transitive dependent of `failed_id`.
    ///
    /// Returns (blocked_id, failed_deps) pairs for event recording.
    pub fn propagate_blocked(&mut self, failed_id: &str) -> Vec<(String, Vec<String>)> {
        let mut unavailable: HashSet<String> = HashSet::new();
        unavailable.insert(failed_id.to_string());

        let mut blocked = Vec::new();
        // Iterate until fixpoint so chains of dependents block transitively.
        loop {
            let mut changed = false;
            for i in 0..self.tasks.len() {
                let task = &self.tasks[i];
                if task.status.is_terminal() || task.status == TaskStatus::Running {
                    continue;
                }
                let failed_deps: Vec<String> = task
                    .depends_on
                    .iter()
                    .filter(|d| unavailable.contains(d.as_str()))
                    .cloned()
                    .collect();
                if !failed_deps.is_empty() {
                    let id = task.id.clone();
                    self.tasks[i].status = TaskStatus::Blocked;
                    unavailable.insert(id.clone());
                    blocked.push((id, failed_deps));
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        blocked
    }

    /// True once every task in the graph has reached a terminal status.
    pub fn is_quiescent(&self) -> bool {
        self.tasks.iter().all(|t| t.status.is_terminal())
    }

    /// A total scheduling order consistent with depends_on.
    ///
    /// Kahn's algorithm; ties resolved by config order so --dry-run output is
    /// deterministic.
    pub fn topo_order(&self) -> Vec<String> {
        let mut in_degree: HashMap<&str, usize> = self
            .tasks
            .iter()
            .map(|t| (t.id.as_str(), t.depends_on.len()))
            .collect();

        let mut order = Vec::with_capacity(self.tasks.len());
        loop {
            let next = self
                .tasks
                .iter()
                .find(|t| in_degree.get(t.id.as_str()) == Some(&0));
            let Some(task) = next else { break };

            order.push(task.id.clone());
            in_degree.remove(task.id.as_str());
            for t in &self.tasks {
                if t.depends_on.iter().any(|d| d == &task.id) {
                    if let Some(deg) = in_degree.get_mut(t.id.as_str()) {
                        *deg -= 1;
                    }
                }
            }
        }
        order
    }
}

fn resolve_path(value: &str, base: &Path) -> PathBuf {
    let path = PathBuf::from(value);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

/// Depth-first cycle detection with an explicit recursion stack.
///
/// Reports the cycle path in the error so the offending config line is
/// findable without re-deriving the traversal.
fn detect_cycles(tasks: &[config::TaskConfig]) -> Result<(), OrchestrateError> {
    let deps: HashMap<&str, &Vec<String>> = tasks
        .iter()
        .map(|t| (t.id.as_str(), &t.depends_on))
        .collect();

    let mut visited: HashSet<&str> = HashSet::new();
    let mut on_stack: Vec<&str> = Vec::new();

    fn visit<'a>(
        id: &'a str,
        deps: &HashMap<&'a str, &'a Vec<String>>,
        visited: &mut HashSet<&'a str>,
        on_stack: &mut Vec<&'a str>,
    ) -> Result<(), OrchestrateError> {
        if let Some(pos) = on_stack.iter().position(|&s| s == id) {
            let mut cycle: Vec<&str> = on_stack[pos..].to_vec();
            cycle.push(id);
            return Err(OrchestrateError::DependencyCycle(cycle.join(" -> ")));
        }
        if visited.contains(id) {
            return Ok(());
        }
        on_stack.push(id);
        if let Some(task_deps) = deps.get(id) {
            for dep in task_deps.iter() {
                visit(dep, deps, visited, on_stack)?;
            }
        }
        on_stack.pop();
        visited.insert(id);
        Ok(())
    }

    for task in tasks {
        visit(&task.id, &deps, &mut visited, &mut on_stack)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TaskConfig;

    fn task_config(id: &str, deps: &[&str]) -> TaskConfig {
        TaskConfig {
            id: id.to_string(),
            phase: Phase::Main,
            branch: None,
            workspace: "worktrees/{task}".to_string(),
            runner: None,
            prompt: "prompts/task.md".to_string(),
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            manual: false,
            watchdog: None,
            escalation: None,
        }
    }

    #[test]
    fn detect_cycles_accepts_dag() {
        let tasks = vec![
            task_config("a", &[]),
            task_config("b", &["a"]),
            task_config("c", &["a", "b"]),
        ];
        assert!(detect_cycles(&tasks).is_ok());
    }

    #[test]
    fn detect_cycles_reports_cycle_path() {
        let tasks = vec![
            task_config("a", &["c"]),
            task_config("b", &["a"]),
            task_config("c", &["b"]),
        ];
        let err = detect_cycles(&tasks).unwrap_err();
        match err {
            OrchestrateError::DependencyCycle(path) => {
                assert!(path.contains("->"), "cycle path missing: {}", path);
            }
            other => panic!("expected DependencyCycle, got {:?}", other),
        }
    }

    #[test]
    fn detect_cycles_catches_self_dependency() {
        let tasks = vec![task_config("a", &["a"])];
        assert!(matches!(
            detect_cycles(&tasks),
            Err(OrchestrateError::DependencyCycle(_))
        ));
    }
}
