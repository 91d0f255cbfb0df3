use crate::error::{BridgeError, Result};
use crate::paths;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// Precondition
// ---------------------------------------------------------------------------

/// A file that must exist before the bridge may start, with the command
/// that creates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Precondition {
    pub path: String,
    pub remedy: String,
}

// ---------------------------------------------------------------------------
// BridgeConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_program")]
    pub program: String,
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    /// Substring identifying the bridge in the process table.
    /// Defaults to the last argument (the entry point).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_pattern: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_preconditions")]
    pub preconditions: Vec<Precondition>,
}

fn default_program() -> String {
    ".venv/bin/python".to_string()
}

fn default_args() -> Vec<String> {
    vec!["bridge/telegram_bridge.py".to_string()]
}

fn default_preconditions() -> Vec<Precondition> {
    vec![
        Precondition {
            path: ".venv/bin/python".to_string(),
            remedy: "python3 -m venv .venv && .venv/bin/pip install -e .".to_string(),
        },
        Precondition {
            path: ".env".to_string(),
            remedy: "cp .env.example .env".to_string(),
        },
    ]
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_args(),
            match_pattern: None,
            env: BTreeMap::new(),
            preconditions: default_preconditions(),
        }
    }
}

impl BridgeConfig {
    /// Program to execute. Relative paths with a directory component are
    /// resolved against the project root; bare names go through `PATH`.
    pub fn program_path(&self, root: &Path) -> PathBuf {
        let program = Path::new(&self.program);
        if program.is_relative() && program.components().count() > 1 {
            root.join(program)
        } else {
            program.to_path_buf()
        }
    }

    pub fn pattern(&self) -> &str {
        match &self.match_pattern {
            Some(p) => p.as_str(),
            None => self
                .args
                .last()
                .map(|s| s.as_str())
                .unwrap_or(self.program.as_str()),
        }
    }
}

// ---------------------------------------------------------------------------
// TimingConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Wait after launch before re-checking that the bridge is alive.
    #[serde(default = "default_settle_secs")]
    pub settle_secs: u64,
    /// How long a graceful stop may take before SIGKILL.
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_settle_secs() -> u64 {
    3
}

fn default_stop_timeout_secs() -> u64 {
    15
}

fn default_poll_interval_ms() -> u64 {
    500
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            settle_secs: default_settle_secs(),
            stop_timeout_secs: default_stop_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl TimingConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }
}

// ---------------------------------------------------------------------------
// LockConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

fn default_stale_after_secs() -> u64 {
    300
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

impl LockConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

// ---------------------------------------------------------------------------
// HealthConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_tail_lines")]
    pub tail_lines: usize,
    #[serde(default = "default_keywords")]
    pub keywords: Vec<String>,
}

fn default_tail_lines() -> usize {
    20
}

fn default_keywords() -> Vec<String> {
    ["error", "exception", "traceback", "disconnect"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            tail_lines: default_tail_lines(),
            keywords: default_keywords(),
        }
    }
}

// ---------------------------------------------------------------------------
// DepsConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepsConfig {
    /// Files whose change between revisions triggers a dependency resync.
    #[serde(default = "default_manifests")]
    pub manifests: Vec<String>,
    #[serde(default = "default_install")]
    pub install: Vec<String>,
    /// Optional command run before start; non-zero exit aborts the start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check: Option<Vec<String>>,
}

fn default_manifests() -> Vec<String> {
    ["pyproject.toml", "requirements.txt", "uv.lock"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_install() -> Vec<String> {
    [".venv/bin/pip", "install", "-e", "."]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for DepsConfig {
    fn default() -> Self {
        Self {
            manifests: default_manifests(),
            install: default_install(),
            check: None,
        }
    }
}

// ---------------------------------------------------------------------------
// UpdateConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    #[serde(default = "default_remote")]
    pub remote: String,
    /// Branch to pull. When unset the current branch's upstream is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

fn default_remote() -> String {
    "origin".to_string()
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            remote: default_remote(),
            branch: None,
        }
    }
}

// ---------------------------------------------------------------------------
// ServiceConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_label_prefix")]
    pub label_prefix: String,
    #[serde(default = "default_update_times")]
    pub update_times: Vec<String>,
    #[serde(default = "default_watchdog_interval_secs")]
    pub watchdog_interval_secs: u64,
    /// Minimum interval between crash restarts of the bridge.
    #[serde(default = "default_throttle_secs")]
    pub throttle_secs: u64,
    /// Quiet period on the bridge logs before the watchdog honors a restart request.
    #[serde(default = "default_idle_secs")]
    pub idle_secs: u64,
    /// Override where descriptors are written (defaults to the service manager's user dir).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_dir: Option<String>,
}

fn default_label_prefix() -> String {
    "com.valor".to_string()
}

fn default_update_times() -> Vec<String> {
    vec!["04:00".to_string(), "16:00".to_string()]
}

fn default_watchdog_interval_secs() -> u64 {
    300
}

fn default_throttle_secs() -> u64 {
    10
}

fn default_idle_secs() -> u64 {
    120
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            label_prefix: default_label_prefix(),
            update_times: default_update_times(),
            watchdog_interval_secs: default_watchdog_interval_secs(),
            throttle_secs: default_throttle_secs(),
            idle_secs: default_idle_secs(),
            install_dir: None,
        }
    }
}

impl ServiceConfig {
    pub fn label(&self, job: &str) -> String {
        format!("{}.{job}", self.label_prefix)
    }

    pub fn parsed_update_times(&self) -> Result<Vec<TimeOfDay>> {
        self.update_times
            .iter()
            .map(|t| TimeOfDay::parse(t))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// TimeOfDay
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeOfDay {
    pub hour: u8,
    pub minute: u8,
}

static TIME_RE: OnceLock<Regex> = OnceLock::new();

fn time_re() -> &'static Regex {
    TIME_RE.get_or_init(|| Regex::new(r"^([01]?[0-9]|2[0-3]):([0-5][0-9])$").unwrap())
}

impl TimeOfDay {
    pub fn parse(s: &str) -> Result<Self> {
        let caps = time_re()
            .captures(s.trim())
            .ok_or_else(|| BridgeError::InvalidConfig(format!("invalid time of day '{s}': expected HH:MM")))?;
        // The regex bounds both groups, so these parses cannot fail.
        let hour = caps[1].parse().unwrap_or(0);
        let minute = caps[2].parse().unwrap_or(0);
        Ok(Self { hour, minute })
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub deps: DepsConfig,
    #[serde(default)]
    pub update: UpdateConfig,
    #[serde(default)]
    pub service: ServiceConfig,
}

impl Config {
    /// Load `bridgectl.yaml`; a missing file means all defaults.
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(&path)?;
        if data.trim().is_empty() {
            return Ok(Self::default());
        }
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let mut error = |message: String| {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message,
            })
        };

        if self.bridge.program.trim().is_empty() {
            error("bridge.program is empty".to_string());
        }
        if self.bridge.pattern().trim().is_empty() {
            error("bridge.match_pattern is empty; every process would match".to_string());
        }
        if self.timing.stop_timeout_secs == 0 {
            error("timing.stop_timeout_secs must be greater than 0".to_string());
        }
        for t in &self.service.update_times {
            if TimeOfDay::parse(t).is_err() {
                error(format!("service.update_times: invalid time '{t}' (expected HH:MM)"));
            }
        }
        if self.deps.install.is_empty() {
            error("deps.install is empty".to_string());
        }

        if self.timing.stop_timeout_secs > 0 && self.timing.stop_timeout_secs < 10 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "timing.stop_timeout_secs={} may be too short for the bridge to flush its session state",
                    self.timing.stop_timeout_secs
                ),
            });
        }
        if self.service.watchdog_interval_secs == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "service.watchdog_interval_secs must be greater than 0".to_string(),
            });
        } else if self.service.watchdog_interval_secs < 60 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "service.watchdog_interval_secs={} is unusually frequent",
                    self.service.watchdog_interval_secs
                ),
            });
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = Config::load(dir.path()).unwrap();
        assert_eq!(cfg.bridge.program, ".venv/bin/python");
        assert_eq!(cfg.bridge.pattern(), "bridge/telegram_bridge.py");
        assert_eq!(cfg.timing.stop_timeout_secs, 15);
        assert_eq!(cfg.service.label("bridge"), "com.valor.bridge");
        assert_eq!(
            cfg.bridge.program_path(Path::new("/srv/valor")),
            PathBuf::from("/srv/valor/.venv/bin/python")
        );
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("bridgectl.yaml"),
            "bridge:\n  program: /bin/sh\n  args: [run.sh]\ntiming:\n  settle_secs: 1\n",
        )
        .unwrap();
        let cfg = Config::load(dir.path()).unwrap();
        assert_eq!(cfg.bridge.program, "/bin/sh");
        assert_eq!(cfg.bridge.pattern(), "run.sh");
        assert_eq!(cfg.timing.settle_secs, 1);
        assert_eq!(cfg.timing.stop_timeout_secs, 15);
        assert_eq!(cfg.bridge.preconditions.len(), 2);
    }

    #[test]
    fn save_then_load_keeps_overrides() {
        let dir = TempDir::new().unwrap();
        let mut cfg = Config::default();
        cfg.bridge.match_pattern = Some("my_bridge.py".to_string());
        cfg.update.branch = Some("main".to_string());
        cfg.save(dir.path()).unwrap();

        let loaded = Config::load(dir.path()).unwrap();
        assert_eq!(loaded.bridge.pattern(), "my_bridge.py");
        assert_eq!(loaded.update.branch.as_deref(), Some("main"));
    }

    #[test]
    fn default_config_has_no_warnings() {
        assert!(Config::default().validate().is_empty());
    }

    #[test]
    fn validate_rejects_bad_update_time() {
        let mut cfg = Config::default();
        cfg.service.update_times = vec!["25:00".to_string()];
        let warnings = cfg.validate();
        assert!(warnings
            .iter()
            .any(|w| w.level == WarnLevel::Error && w.message.contains("'25:00'")));
    }

    #[test]
    fn validate_warns_on_short_stop_timeout() {
        let mut cfg = Config::default();
        cfg.timing.stop_timeout_secs = 3;
        let warnings = cfg.validate();
        assert!(warnings
            .iter()
            .any(|w| w.level == WarnLevel::Warning && w.message.contains("stop_timeout_secs=3")));
    }

    #[test]
    fn validate_rejects_zero_watchdog_interval() {
        let mut cfg = Config::default();
        cfg.service.watchdog_interval_secs = 0;
        let warnings = cfg.validate();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].level, WarnLevel::Error);
        assert!(warnings[0].message.contains("watchdog_interval_secs"));

        cfg.service.watchdog_interval_secs = 30;
        assert_eq!(cfg.validate()[0].level, WarnLevel::Warning);
    }

    #[test]
    fn time_of_day_parse_and_display() {
        let t = TimeOfDay::parse("4:05").unwrap();
        assert_eq!(t, TimeOfDay { hour: 4, minute: 5 });
        assert_eq!(t.to_string(), "04:05");
        assert!(TimeOfDay::parse("noon").is_err());
        assert!(TimeOfDay::parse("12:60").is_err());
    }
}
