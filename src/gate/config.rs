use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main gate configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct GateConfig {
    /// Gated apps
    pub apps: Vec<GatedAppConfig>,

    /// Quiz program settings
    #[serde(default)]
    pub challenge: ChallengeConfig,

    /// Foreground observer settings
    #[serde(default)]
    pub observer: ObserverConfig,

    /// Overlay program settings
    #[serde(default)]
    pub overlay: OverlayConfig,

    /// Session timer settings
    #[serde(default)]
    pub timer: TimerConfig,

    /// How often the daemon re-reads this file (seconds)
    #[serde(default = "default_reload_interval")]
    pub reload_interval_secs: u64,

    /// Optional JSON-lines file receiving side-channel notifications
    #[serde(default)]
    pub events_log: Option<PathBuf>,

    /// Override for the state file location
    #[serde(default)]
    pub state_file: Option<PathBuf>,
}

impl GateConfig {
    /// Configuration with default settings for the given apps
    pub fn new(apps: Vec<GatedAppConfig>) -> Self {
        Self {
            apps,
            challenge: ChallengeConfig::default(),
            observer: ObserverConfig::default(),
            overlay: OverlayConfig::default(),
            timer: TimerConfig::default(),
            reload_interval_secs: default_reload_interval(),
            events_log: None,
            state_file: None,
        }
    }

    pub fn app(&self, id: &str) -> Option<&GatedAppConfig> {
        self.apps.iter().find(|a| a.id == id)
    }

    pub fn app_mut(&mut self, id: &str) -> Option<&mut GatedAppConfig> {
        self.apps.iter_mut().find(|a| a.id == id)
    }
}

/// A gated app as configured by the user
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct GatedAppConfig {
    /// Package / bundle identifier reported by the foreground observer
    pub id: String,

    /// Display name
    pub name: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Successful unlocks allowed per calendar day
    pub daily_quota: u32,

    /// Length of the access window granted by a passed quiz
    #[serde(default = "default_unlock_minutes")]
    pub unlock_minutes: u32,
}

impl GatedAppConfig {
    pub fn unlock_duration_ms(&self) -> i64 {
        self.unlock_minutes as i64 * 60_000
    }
}

fn default_true() -> bool {
    true
}

fn default_unlock_minutes() -> u32 {
    15
}

fn default_reload_interval() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ChallengeConfig {
    /// Quiz program; the app id is appended as the last argument
    #[serde(default)]
    pub command: Option<String>,

    #[serde(default)]
    pub args: Vec<String>,

    /// The quiz's own time limit
    #[serde(default = "default_time_limit")]
    pub time_limit_secs: u64,

    /// Extra margin before a silent quiz counts as abandoned
    #[serde(default = "default_grace")]
    pub grace_secs: u64,
}

impl ChallengeConfig {
    /// Time after which a challenge without a result is abandoned
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.time_limit_secs.saturating_add(self.grace_secs))
    }
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            time_limit_secs: default_time_limit(),
            grace_secs: default_grace(),
        }
    }
}

fn default_time_limit() -> u64 {
    300
}

fn default_grace() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ObserverConfig {
    #[serde(default)]
    pub source: ObserverSource,

    /// Polling interval of the system source (must stay under 200ms)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            source: ObserverSource::default(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

fn default_poll_interval() -> u64 {
    150
}

/// Where foreground changes come from
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ObserverSource {
    /// Poll the desktop for the frontmost app
    #[default]
    System,
    /// Read one app id per line from stdin
    Stdin,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct OverlayConfig {
    /// Full-screen block program; logged only when absent
    #[serde(default)]
    pub command: Option<String>,

    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct TimerConfig {
    /// Countdown granularity
    #[serde(default = "default_tick")]
    pub tick_ms: u64,

    /// How often deadlines are recomputed from absolute timestamps
    #[serde(default = "default_tick")]
    pub sweep_interval_ms: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick(),
            sweep_interval_ms: default_tick(),
        }
    }
}

fn default_tick() -> u64 {
    1000
}

/// Maximum polling interval that still meets the 200ms forwarding target
pub const MAX_POLL_INTERVAL_MS: u64 = 200;

/// Upper bound for the quiz time limit and its grace period (one day each)
pub const MAX_CHALLENGE_SECS: u64 = 86_400;

/// Upper bound for timer tick and sweep intervals (one hour)
pub const MAX_TIMER_MS: u64 = 3_600_000;

/// Get the default config file path
pub fn get_config_path() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("", "", "quizlock")
        .context("Could not determine config directory")?;
    Ok(dirs.config_dir().join("config.yaml"))
}

/// Load configuration from YAML file
pub fn load_config(path: &Path) -> Result<GateConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config = parse_config(&content)
        .with_context(|| format!("Invalid config file: {}", path.display()))?;

    Ok(config)
}

/// Parse and validate configuration from a YAML string
pub fn parse_config(content: &str) -> Result<GateConfig> {
    let config: GateConfig =
        serde_yaml::from_str(content).context("Failed to parse YAML config")?;

    validate_config(&config)?;

    Ok(config)
}

/// Save configuration to YAML file
pub fn save_config(path: &Path, config: &GateConfig) -> Result<()> {
    validate_config(config)?;

    let content = serde_yaml::to_string(config).context("Failed to serialize config to YAML")?;

    crate::platform::common::atomic_write(path, content.as_bytes())
        .with_context(|| format!("Failed to write config file: {}", path.display()))?;

    Ok(())
}

/// Validate configuration
pub fn validate_config(config: &GateConfig) -> Result<()> {
    if config.apps.is_empty() {
        anyhow::bail!("Configuration must specify at least one gated app");
    }

    let mut ids = std::collections::HashSet::new();
    for app in &config.apps {
        if !ids.insert(&app.id) {
            anyhow::bail!("Duplicate app ID: {}", app.id);
        }

        validate_app(app).with_context(|| format!("Invalid app '{}'", app.id))?;
    }

    if config.observer.poll_interval_ms == 0
        || config.observer.poll_interval_ms > MAX_POLL_INTERVAL_MS
    {
        anyhow::bail!(
            "observer.poll_interval_ms must be between 1 and {}, got {}",
            MAX_POLL_INTERVAL_MS,
            config.observer.poll_interval_ms
        );
    }

    if config.timer.tick_ms == 0 || config.timer.sweep_interval_ms == 0 {
        anyhow::bail!("timer intervals must be greater than zero");
    }

    if config.challenge.time_limit_secs == 0
        || config.challenge.time_limit_secs > MAX_CHALLENGE_SECS
    {
        anyhow::bail!(
            "challenge.time_limit_secs must be between 1 and {}, got {}",
            MAX_CHALLENGE_SECS,
            config.challenge.time_limit_secs
        );
    }

    if config.challenge.grace_secs > MAX_CHALLENGE_SECS {
        anyhow::bail!(
            "challenge.grace_secs must be at most {}, got {}",
            MAX_CHALLENGE_SECS,
            config.challenge.grace_secs
        );
    }

    if config.timer.tick_ms > MAX_TIMER_MS || config.timer.sweep_interval_ms > MAX_TIMER_MS {
        anyhow::bail!("timer intervals must be at most {}ms", MAX_TIMER_MS);
    }

    if config.reload_interval_secs == 0 {
        anyhow::bail!("reload_interval_secs must be greater than zero");
    }

    Ok(())
}

fn validate_app(app: &GatedAppConfig) -> Result<()> {
    if app.id.trim().is_empty() {
        anyhow::bail!("App ID cannot be empty");
    }

    if app.id.chars().any(char::is_whitespace) {
        anyhow::bail!("App ID cannot contain whitespace");
    }

    if app.name.is_empty() {
        anyhow::bail!("App name cannot be empty");
    }

    if app.unlock_minutes == 0 {
        anyhow::bail!("unlock_minutes must be greater than zero");
    }

    Ok(())
}

/// Example configuration file content
pub const EXAMPLE_CONFIG: &str = include_str!("../../example-gate-config.yaml");
