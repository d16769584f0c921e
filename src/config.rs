use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::OrchestrateError;
use crate::types::{Phase, Strategy};

/// Env var: heartbeat status-line printing period, in seconds.
pub const STATUS_INTERVAL_ENV: &str = "ORCHESTRATE_STATUS_INTERVAL";
/// Env var: watchdog sampling interval override, in seconds.
pub const WATCHDOG_INTERVAL_ENV: &str = "ORCHESTRATE_WATCHDOG_INTERVAL";
/// Env var: replace every runner command with a no-op that reads the prompt.
pub const RUNNER_NOOP_ENV: &str = "ORCHESTRATE_RUNNER_NOOP";

#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct OrchestrateConfig {
    pub project: ProjectConfig,
    pub runners: HashMap<String, RunnerConfig>,
    pub watchdog: WatchdogConfig,
    pub escalation: EscalationConfig,
    pub tasks: Vec<TaskConfig>,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ProjectConfig {
    /// Repository root the worktrees branch from. Relative to the config file.
    pub root: String,
    /// Directory for task logs, the event stream, locks, and the summary.
    pub logs_dir: String,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            root: ".".to_string(),
            logs_dir: "logs".to_string(),
        }
    }
}

/// A worker backend invocation template.
///
/// `command` must contain a `{prompt}` placeholder. `handoff_command`, when
/// set, additionally accepts `{handoff}` and is used after a `switch_agent`
/// escalation.
#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct RunnerConfig {
    pub command: String,
    #[serde(default)]
    pub handoff_command: Option<String>,
}

/// Progress indicators the watchdog may sample.
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Indicator {
    Filesystem,
    Commits,
    LogGrowth,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct WatchdogConfig {
    pub check_interval_secs: u64,
    pub stuck_threshold_secs: u64,
    pub min_log_growth_bytes: u64,
    pub indicators: Vec<Indicator>,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 30,
            stuck_threshold_secs: 900,
            min_log_growth_bytes: 64,
            indicators: vec![Indicator::Filesystem, Indicator::Commits, Indicator::LogGrowth],
        }
    }
}

impl WatchdogConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn stuck_threshold(&self) -> Duration {
        Duration::from_secs(self.stuck_threshold_secs)
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct EscalationConfig {
    /// Ordered strategies to attempt per stuck episode.
    pub strategies: Vec<Strategy>,
    /// Bound on kill_and_retry relaunches.
    pub max_retries: u32,
    /// Window after an interrupt in which resumed activity counts as recovery.
    pub interrupt_grace_secs: u64,
    /// Runner name used by switch_agent. Strategy is skipped when absent.
    pub alternate_runner: Option<String>,
    /// Reduced-scope prompt path used by simplify_scope. Skipped when absent.
    pub reduced_prompt: Option<String>,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            strategies: vec![Strategy::Notify, Strategy::Interrupt, Strategy::KillAndRetry],
            max_retries: 3,
            interrupt_grace_secs: 60,
            alternate_runner: None,
            reduced_prompt: None,
        }
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct TaskConfig {
    pub id: String,
    #[serde(default)]
    pub phase: Phase,
    /// Branch name template; defaults to `task/{task}`.
    #[serde(default)]
    pub branch: Option<String>,
    /// Worktree path template, relative to the project root.
    pub workspace: String,
    /// Runner name. May be omitted when exactly one runner is configured.
    #[serde(default)]
    pub runner: Option<String>,
    /// Prompt file handed to the worker command.
    pub prompt: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Excluded from automatic scheduling unless --include-manual.
    #[serde(default)]
    pub manual: bool,
    /// Per-task watchdog override.
    #[serde(default)]
    pub watchdog: Option<WatchdogConfig>,
    /// Per-task escalation override.
    #[serde(default)]
    pub escalation: Option<EscalationConfig>,
}

impl TaskConfig {
    pub fn branch_template(&self) -> String {
        self.branch
            .clone()
            .unwrap_or_else(|| "task/{task}".to_string())
    }
}

// --- Template expansion ---

/// Expand `{run_id}`, `{phase}`, and `{task}` placeholders.
///
/// Errors on any placeholder left unexpanded so a typo in the config surfaces
/// at validation time rather than as a literal `{tsak}` directory on disk.
pub fn expand_template(
    value: &str,
    run_id: &str,
    phase: Phase,
    task_id: &str,
) -> Result<String, String> {
    let expanded = value
        .replace("{run_id}", run_id)
        .replace("{phase}", phase.as_str())
        .replace("{task}", task_id);

    if let Some(start) = expanded.find('{') {
        let rest = &expanded[start..];
        let end = rest.find('}').map(|i| start + i + 1).unwrap_or(expanded.len());
        return Err(format!(
            "Unknown template key {} in value: {}",
            &expanded[start..end],
            value
        ));
    }

    Ok(expanded)
}

/// Substitute the prompt path into a runner command template.
pub fn build_command(template: &str, prompt_path: &Path) -> Result<String, String> {
    if !template.contains("{prompt}") {
        return Err(format!(
            "Runner command missing {{prompt}} placeholder: {}",
            template
        ));
    }
    Ok(template.replace("{prompt}", &prompt_path.display().to_string()))
}

/// Substitute prompt and handoff paths into a handoff command template.
pub fn build_handoff_command(
    template: &str,
    prompt_path: &Path,
    handoff_path: &Path,
) -> Result<String, String> {
    let cmd = template
        .replace("{prompt}", &prompt_path.display().to_string())
        .replace("{handoff}", &handoff_path.display().to_string());
    if cmd.contains('{') && cmd.contains('}') {
        return Err(format!("Unexpanded placeholder in handoff command: {}", template));
    }
    Ok(cmd)
}

/// Resolve a task's runner name against the configured runners map.
pub fn resolve_runner<'a>(
    config: &'a OrchestrateConfig,
    task: &TaskConfig,
) -> Result<(&'a str, &'a RunnerConfig), String> {
    match &task.runner {
        Some(name) => config
            .runners
            .get_key_value(name.as_str())
            .map(|(k, v)| (k.as_str(), v))
            .ok_or_else(|| format!("Task '{}': runner '{}' not found in config", task.id, name)),
        None => {
            if config.runners.len() == 1 {
                let (k, v) = config.runners.iter().next().unwrap();
                Ok((k.as_str(), v))
            } else {
                Err(format!(
                    "Task '{}' omits 'runner' but {} runners are configured",
                    task.id,
                    config.runners.len()
                ))
            }
        }
    }
}

// --- Validation ---

pub fn validate(config: &OrchestrateConfig) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if config.runners.is_empty() {
        errors.push("At least one runner must be configured".to_string());
    }

    for (name, runner) in &config.runners {
        if runner.command.trim().is_empty() {
            errors.push(format!("Runner '{}' has an empty command", name));
        } else if !runner.command.contains("{prompt}") {
            errors.push(format!(
                "Runner '{}' command missing {{prompt}} placeholder",
                name
            ));
        }
    }

    validate_watchdog(&config.watchdog, "watchdog", &mut errors);
    validate_escalation(&config.escalation, "escalation", &mut errors);

    for task in &config.tasks {
        if task.id.trim().is_empty() {
            errors.push("Each task must have a non-empty 'id'".to_string());
            continue;
        }
        if task.workspace.trim().is_empty() {
            errors.push(format!("Task '{}': 'workspace' must not be empty", task.id));
        }
        if task.prompt.trim().is_empty() {
            errors.push(format!("Task '{}': 'prompt' must not be empty", task.id));
        }
        if let Err(e) = resolve_runner(config, task) {
            errors.push(e);
        }
        if task.depends_on.iter().any(|dep| dep == &task.id) {
            errors.push(format!("Task '{}' depends on itself", task.id));
        }
        if let Some(wd) = &task.watchdog {
            validate_watchdog(wd, &format!("tasks.{}.watchdog", task.id), &mut errors);
        }
        if let Some(esc) = &task.escalation {
            validate_escalation(esc, &format!("tasks.{}.escalation", task.id), &mut errors);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_watchdog(wd: &WatchdogConfig, location: &str, errors: &mut Vec<String>) {
    if wd.check_interval_secs == 0 {
        errors.push(format!("{}.check_interval_secs must be >= 1", location));
    }
    if wd.stuck_threshold_secs <= wd.check_interval_secs {
        errors.push(format!(
            "{}.stuck_threshold_secs must exceed check_interval_secs",
            location
        ));
    }
    if wd.indicators.is_empty() {
        errors.push(format!("{}.indicators must not be empty", location));
    }
}

fn validate_escalation(esc: &EscalationConfig, location: &str, errors: &mut Vec<String>) {
    if esc.strategies.is_empty() {
        errors.push(format!("{}.strategies must not be empty", location));
    }
    let mut seen = std::collections::HashSet::new();
    for strategy in &esc.strategies {
        if !seen.insert(strategy) {
            errors.push(format!("{}.strategies lists {} twice", location, strategy));
        }
    }
}

// --- Loading ---

pub fn load_config(config_path: &Path) -> Result<OrchestrateConfig, OrchestrateError> {
    let contents = std::fs::read_to_string(config_path).map_err(|e| {
        OrchestrateError::Config(format!("Failed to read {}: {}", config_path.display(), e))
    })?;

    let mut config: OrchestrateConfig = toml::from_str(&contents).map_err(|e| {
        OrchestrateError::Config(format!("Failed to parse {}: {}", config_path.display(), e))
    })?;

    if bool_from_env(std::env::var(RUNNER_NOOP_ENV).ok().as_deref()) {
        apply_runner_noop(&mut config);
    }

    validate(&config).map_err(|errors| {
        OrchestrateError::Config(format!(
            "Config validation failed:\n{}",
            errors
                .iter()
                .map(|e| format!("  - {}", e))
                .collect::<Vec<_>>()
                .join("\n")
        ))
    })?;

    Ok(config)
}

/// Replace every runner command with a no-op that consumes the prompt.
/// Used for rehearsing a run without invoking real agents.
pub fn apply_runner_noop(config: &mut OrchestrateConfig) {
    for runner in config.runners.values_mut() {
        runner.command = "cat \"{prompt}\" > /dev/null".to_string();
        runner.handoff_command = None;
    }
}

// --- Env overrides ---

pub fn bool_from_env(value: Option<&str>) -> bool {
    matches!(
        value.map(|v| v.trim().to_lowercase()).as_deref(),
        Some("1") | Some("true") | Some("yes") | Some("on")
    )
}

fn duration_from_env(var: &str) -> Option<Duration> {
    std::env::var(var)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|&secs| secs > 0)
        .map(Duration::from_secs)
}

/// Heartbeat printing period, env override applied.
pub fn status_interval() -> Duration {
    duration_from_env(STATUS_INTERVAL_ENV).unwrap_or(Duration::from_secs(10))
}

/// Watchdog sampling interval for a task, env override applied.
pub fn watchdog_interval(wd: &WatchdogConfig) -> Duration {
    duration_from_env(WATCHDOG_INTERVAL_ENV).unwrap_or_else(|| wd.check_interval())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_template_substitutes_all_keys() {
        let out = expand_template(
            "worktrees/{phase}/{task}-{run_id}",
            "r1",
            Phase::Main,
            "build-core",
        )
        .unwrap();
        assert_eq!(out, "worktrees/main/build-core-r1");
    }

    #[test]
    fn expand_template_rejects_unknown_key() {
        let err = expand_template("worktrees/{tsak}", "r1", Phase::Main, "t").unwrap_err();
        assert!(err.contains("{tsak}"), "unexpected message: {}", err);
    }

    #[test]
    fn build_command_requires_prompt_placeholder() {
        assert!(build_command("agent run", Path::new("p.md")).is_err());
        let cmd = build_command("agent run --prompt {prompt}", Path::new("p.md")).unwrap();
        assert_eq!(cmd, "agent run --prompt p.md");
    }

    #[test]
    fn bool_from_env_accepts_truthy_values() {
        assert!(bool_from_env(Some("1")));
        assert!(bool_from_env(Some("TRUE")));
        assert!(bool_from_env(Some(" yes ")));
        assert!(!bool_from_env(Some("0")));
        assert!(!bool_from_env(None));
    }
}
