//! Runner configuration.
//!
//! Loaded from, lowest to highest precedence: built-in defaults,
//! `HANDOVER_*` environment variables, a config file (TOML, or YAML for
//! `.yaml`/`.yml`), and explicit overrides from the command line. Every
//! source is folded into one JSON tree before a single typed deserialize, so
//! nested sections merge key by key instead of replacing each other.
//!
//! ```toml
//! wait_for_user_timeout_secs = 600
//!
//! [task]
//! description = "Book a table for two"
//!
//! [planner]
//! provider = "command"
//! program = "my-planner"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::model::Directive;

const CONFIG_FILENAME: &str = "config.toml";
const CONFIG_DIR: &str = ".handover";

/// Prefix for environment variables read by [`RunnerConfig::load`].
pub const ENV_PREFIX: &str = "HANDOVER_";
/// Separator between nested keys in environment variable names.
pub const ENV_NESTED_DELIMITER: &str = "__";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub description: String,
    #[serde(default)]
    pub goal: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// `scripted` or `command`.
    #[serde(default = "default_planner_provider")]
    pub provider: String,
    #[serde(default)]
    pub program: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_planner_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Directives replayed by the scripted planner.
    #[serde(default)]
    pub responses: Vec<Directive>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    #[serde(default = "default_environment_driver")]
    pub driver: String,
    #[serde(default)]
    pub start_location: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub screenshots: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// `console`, `jsonl`, or `webhook`.
    #[serde(default = "default_notification_channel")]
    pub channel: String,
    /// File path for `jsonl`, URL for `webhook`.
    #[serde(default)]
    pub target: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_display_program")]
    pub program: String,
    #[serde(default = "default_display_args")]
    pub args: Vec<String>,
    #[serde(default = "default_display_host")]
    pub host: String,
    #[serde(default = "default_display_port")]
    pub port: u16,
    #[serde(default = "default_display")]
    pub display: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    pub task: TaskConfig,
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub environment: EnvironmentConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub display: DisplayConfig,
    /// Absent means wait for the human indefinitely.
    #[serde(default)]
    pub wait_for_user_timeout_secs: Option<f64>,
    #[serde(default = "default_memory_max_entries")]
    pub memory_max_entries: usize,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_capture_artifacts")]
    pub capture_artifacts: bool,
}

fn default_planner_provider() -> String {
    "scripted".to_string()
}

fn default_planner_timeout_secs() -> u64 {
    60
}

fn default_environment_driver() -> String {
    "scripted".to_string()
}

fn default_notification_channel() -> String {
    "console".to_string()
}

fn default_display_program() -> String {
    "x11vnc".to_string()
}

fn default_display_args() -> Vec<String> {
    ["-display", "{display}", "-rfbport", "{port}", "-forever", "-shared", "-nopw"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_display_host() -> String {
    "127.0.0.1".to_string()
}

fn default_display_port() -> u16 {
    5900
}

fn default_display() -> String {
    ":99".to_string()
}

fn default_memory_max_entries() -> usize {
    50
}

fn default_history_limit() -> usize {
    50
}

fn default_capture_artifacts() -> bool {
    true
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            provider: default_planner_provider(),
            program: None,
            args: Vec::new(),
            timeout_secs: default_planner_timeout_secs(),
            system_prompt: None,
            responses: Vec::new(),
        }
    }
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            driver: default_environment_driver(),
            start_location: None,
            title: None,
            screenshots: false,
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            channel: default_notification_channel(),
            target: None,
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            program: default_display_program(),
            args: default_display_args(),
            host: default_display_host(),
            port: default_display_port(),
            display: default_display(),
        }
    }
}

impl RunnerConfig {
    /// Defaults for everything except the task itself.
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            task: TaskConfig {
                description: description.into(),
                goal: None,
            },
            planner: PlannerConfig::default(),
            environment: EnvironmentConfig::default(),
            notifications: NotificationConfig::default(),
            display: DisplayConfig::default(),
            wait_for_user_timeout_secs: None,
            memory_max_entries: default_memory_max_entries(),
            history_limit: default_history_limit(),
            capture_artifacts: default_capture_artifacts(),
        }
    }

    /// Resolve configuration from every source.
    ///
    /// Without an explicit `path`, searches upward from `start` for
    /// `.handover/config.toml`. Returns the file that was used, if any.
    pub fn load(
        path: Option<&Path>,
        start: &Path,
        overrides: Value,
    ) -> Result<(Self, Option<PathBuf>)> {
        let file = match path {
            Some(path) => Some(path.to_path_buf()),
            None => find_config_file(start),
        };

        let mut tree = env_overrides(std::env::vars());
        if let Some(file) = &file {
            deep_merge(&mut tree, read_config_file(file)?);
        }
        deep_merge(&mut tree, overrides);

        let config = Self::from_value(tree).with_context(|| match &file {
            Some(file) => format!("invalid configuration in {}", file.display()),
            None => "invalid configuration".to_string(),
        })?;
        Ok((config, file))
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let config: Self = serde_json::from_value(value).context("failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.task.description.trim().is_empty() {
            bail!("task.description must not be empty");
        }
        if let Some(secs) = self.wait_for_user_timeout_secs
            && !(secs.is_finite() && secs >= 0.0)
        {
            bail!("wait_for_user_timeout_secs must be a non-negative number, got {secs}");
        }
        Ok(())
    }

    /// How long an intervention may wait for the human. A timeout too large
    /// for a `Duration` waits indefinitely.
    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_for_user_timeout_secs
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }

    /// Apply `overrides` on top of this config.
    pub fn merged_with(&self, overrides: &Value) -> Result<Self> {
        let mut tree = serde_json::to_value(self).context("failed to serialize configuration")?;
        deep_merge(&mut tree, overrides.clone());
        Self::from_value(tree)
    }
}

/// Search upward from `start` for `.handover/config.toml`.
pub fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_DIR).join(CONFIG_FILENAME);
        if candidate.is_file() {
            return Some(candidate);
        }
        if !dir.pop() {
            return None;
        }
    }
}

/// Parse a config file into a JSON tree. YAML by extension, TOML otherwise.
pub fn read_config_file(path: &Path) -> Result<Value> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml" | "yml")
    );
    let value = if is_yaml {
        serde_yaml::from_str::<Value>(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?
    } else {
        toml::from_str::<Value>(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?
    };
    debug!(path = %path.display(), "loaded config file");
    // An empty YAML document parses as null.
    Ok(match value {
        Value::Null => Value::Object(Map::new()),
        other => other,
    })
}

/// Build an override tree from `HANDOVER_*` variables.
///
/// `HANDOVER_PLANNER__TIMEOUT_SECS=30` becomes `{"planner": {"timeout_secs": 30}}`.
pub fn env_overrides(vars: impl IntoIterator<Item = (String, String)>) -> Value {
    let mut tree = Value::Object(Map::new());
    for (name, raw) in vars {
        let Some(rest) = name.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        let path: Vec<String> = rest
            .split(ENV_NESTED_DELIMITER)
            .map(str::to_lowercase)
            .collect();
        if path.iter().any(String::is_empty) {
            continue;
        }
        set_path(&mut tree, &path, coerce_scalar(&raw));
    }
    tree
}

fn set_path(tree: &mut Value, path: &[String], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut node = tree;
    for key in parents {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        let Value::Object(map) = node else {
            return;
        };
        node = map
            .entry(key.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    if let Value::Object(map) = node {
        map.insert(last.clone(), value);
    }
}

/// Interpret an environment string as the most specific JSON scalar.
pub fn coerce_scalar(raw: &str) -> Value {
    let trimmed = raw.trim();
    match trimmed.to_ascii_lowercase().as_str() {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(n) = trimmed.parse::<i64>() {
        return Value::from(n);
    }
    if let Ok(f) = trimmed.parse::<f64>()
        && f.is_finite()
    {
        return Value::from(f);
    }
    if (trimmed.starts_with('[') || trimmed.starts_with('{'))
        && let Ok(v) = serde_json::from_str(trimmed)
    {
        return v;
    }
    Value::String(raw.to_string())
}

/// Recursively merge `updates` into `target`; objects merge, anything else
/// replaces.
pub fn deep_merge(target: &mut Value, updates: Value) {
    match (target, updates) {
        (Value::Object(target), Value::Object(updates)) => {
            for (key, value) in updates {
                match target.get_mut(&key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        deep_merge(existing, value);
                    }
                    _ => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (target, updates) => *target = updates,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use serial_test::serial;
    use std::fs;

    #[test]
    fn default_config_values() {
        let config = RunnerConfig::from_value(json!({"task": {"description": "demo"}})).unwrap();
        assert_eq!(config, RunnerConfig::new("demo"));
        assert_eq!(config.planner.provider, "scripted");
        assert_eq!(config.planner.timeout_secs, 60);
        assert_eq!(config.notifications.channel, "console");
        assert!(!config.display.enabled);
        assert_eq!(config.display.port, 5900);
        assert_eq!(config.memory_max_entries, 50);
        assert_eq!(config.history_limit, 50);
        assert!(config.capture_artifacts);
        assert_eq!(config.wait_timeout(), None);
    }

    #[test]
    fn missing_or_blank_description_is_rejected() {
        assert!(RunnerConfig::from_value(json!({})).is_err());
        let err = RunnerConfig::from_value(json!({"task": {"description": "  "}})).unwrap_err();
        assert!(err.to_string().contains("task.description"));
    }

    #[test]
    fn negative_timeout_is_rejected() {
        let err = RunnerConfig::from_value(json!({
            "task": {"description": "demo"},
            "wait_for_user_timeout_secs": -1.0
        }))
        .unwrap_err();
        assert!(err.to_string().contains("non-negative"));
    }

    #[test]
    fn unrepresentable_timeout_waits_indefinitely() {
        let config = RunnerConfig::from_value(json!({
            "task": {"description": "demo"},
            "wait_for_user_timeout_secs": 1e20
        }))
        .unwrap();
        assert_eq!(config.wait_timeout(), None);

        let mut config = RunnerConfig::new("demo");
        config.wait_for_user_timeout_secs = Some(2.5);
        assert_eq!(config.wait_timeout(), Some(Duration::from_millis(2500)));
    }

    #[test]
    fn parse_toml_file_with_scripted_responses() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("run.toml");
        fs::write(
            &path,
            r#"
wait_for_user_timeout_secs = 1.5

[task]
description = "Book a table"
goal = "two people"

[[planner.responses]]
status = "continue"
actions = [{ type = "navigate", url = "https://example.com" }]

[[planner.responses]]
status = "finished"
message = "done"
"#,
        )
        .unwrap();

        let (config, used) = RunnerConfig::load(Some(&path), tmp.path(), json!({})).unwrap();
        assert_eq!(used, Some(path));
        assert_eq!(config.task.goal.as_deref(), Some("two people"));
        assert_eq!(config.planner.responses.len(), 2);
        assert_eq!(config.planner.responses[0].actions[0].kind, "navigate");
        assert_eq!(config.wait_timeout(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn parse_yaml_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("run.yaml");
        fs::write(
            &path,
            "task:\n  description: From yaml\nnotifications:\n  channel: jsonl\n  target: events.jsonl\n",
        )
        .unwrap();

        let (config, _) = RunnerConfig::load(Some(&path), tmp.path(), json!({})).unwrap();
        assert_eq!(config.task.description, "From yaml");
        assert_eq!(config.notifications.channel, "jsonl");
        assert_eq!(config.notifications.target.as_deref(), Some("events.jsonl"));
    }

    #[test]
    fn find_config_file_walks_up() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        let config_dir = root.join(CONFIG_DIR);
        fs::create_dir_all(&config_dir).unwrap();
        fs::write(config_dir.join(CONFIG_FILENAME), "[task]\ndescription = \"found\"\n").unwrap();

        let nested = root.join("a").join("b");
        fs::create_dir_all(&nested).unwrap();

        let found = find_config_file(&nested).unwrap();
        assert_eq!(found, config_dir.join(CONFIG_FILENAME));

        let (config, used) = RunnerConfig::load(None, &nested, json!({})).unwrap();
        assert_eq!(config.task.description, "found");
        assert_eq!(used, Some(found));
    }

    #[test]
    fn env_overrides_nest_and_coerce() {
        let tree = env_overrides(vec![
            ("HANDOVER_PLANNER__TIMEOUT_SECS".to_string(), "30".to_string()),
            ("HANDOVER_DISPLAY__ENABLED".to_string(), "TRUE".to_string()),
            ("HANDOVER_WAIT_FOR_USER_TIMEOUT_SECS".to_string(), "2.5".to_string()),
            ("HANDOVER_TASK__DESCRIPTION".to_string(), "from env".to_string()),
            ("HANDOVER_PLANNER__ARGS".to_string(), r#"["-q"]"#.to_string()),
            ("HANDOVER___BROKEN".to_string(), "x".to_string()),
            ("PATH".to_string(), "/bin".to_string()),
        ]);
        assert_eq!(
            tree,
            json!({
                "planner": {"timeout_secs": 30, "args": ["-q"]},
                "display": {"enabled": true},
                "wait_for_user_timeout_secs": 2.5,
                "task": {"description": "from env"}
            })
        );
    }

    #[test]
    fn deep_merge_keeps_sibling_keys() {
        let mut base = json!({
            "planner": {"provider": "command", "timeout_secs": 5},
            "history_limit": 10
        });
        deep_merge(&mut base, json!({"planner": {"timeout_secs": 9}, "history_limit": 20}));
        assert_eq!(
            base,
            json!({"planner": {"provider": "command", "timeout_secs": 9}, "history_limit": 20})
        );
    }

    #[test]
    fn merged_with_applies_overrides() {
        let config = RunnerConfig::new("demo");
        let merged = config
            .merged_with(&json!({"memory_max_entries": 3, "display": {"port": 5901}}))
            .unwrap();
        assert_eq!(merged.memory_max_entries, 3);
        assert_eq!(merged.display.port, 5901);
        assert_eq!(merged.display.program, "x11vnc");
        assert_eq!(merged.task.description, "demo");
    }

    #[test]
    #[serial]
    fn precedence_env_then_file_then_overrides() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("run.toml");
        fs::write(
            &path,
            "memory_max_entries = 7\n[task]\ndescription = \"from file\"\n",
        )
        .unwrap();

        // SAFETY: serialized with every other test that touches the environment.
        unsafe {
            std::env::set_var("HANDOVER_MEMORY_MAX_ENTRIES", "3");
            std::env::set_var("HANDOVER_HISTORY_LIMIT", "12");
            std::env::set_var("HANDOVER_TASK__DESCRIPTION", "from env");
        }
        let loaded = RunnerConfig::load(
            Some(&path),
            tmp.path(),
            json!({"task": {"description": "from cli"}}),
        );
        unsafe {
            std::env::remove_var("HANDOVER_MEMORY_MAX_ENTRIES");
            std::env::remove_var("HANDOVER_HISTORY_LIMIT");
            std::env::remove_var("HANDOVER_TASK__DESCRIPTION");
        }

        let (config, _) = loaded.unwrap();
        assert_eq!(config.history_limit, 12);
        assert_eq!(config.memory_max_entries, 7);
        assert_eq!(config.task.description, "from cli");
    }
}
