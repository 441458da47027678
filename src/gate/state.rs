use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Current state version
const STATE_VERSION: &str = "1.0";

/// Persisted gate state: today's counters and live access windows
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct GateState {
    pub version: String,
    pub saved_at: DateTime<Utc>,
    pub apps: Vec<UsageRecord>,
    pub sessions: Vec<SessionRecord>,
}

impl GateState {
    pub fn new(saved_at: DateTime<Utc>) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            saved_at,
            apps: Vec::new(),
            sessions: Vec::new(),
        }
    }
}

/// Quota usage of one app
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct UsageRecord {
    pub app_id: String,
    pub uses_consumed_today: u32,
    pub last_quota_reset_date: NaiveDate,
}

/// An Unlocked session. Challenges are never persisted: after a restart an
/// interrupted challenge is simply Locked again.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct SessionRecord {
    pub app_id: String,
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub granted_duration_ms: i64,
}

impl SessionRecord {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.started_at + chrono::Duration::milliseconds(self.granted_duration_ms)
    }
}

/// Get the default state file path
pub fn get_state_path() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("", "", "quizlock")
        .context("Could not determine data directory")?;
    Ok(dirs.data_local_dir().join("state.json"))
}

/// State file location, honouring a configured override
pub fn resolve_state_path(override_path: Option<&Path>) -> Result<PathBuf> {
    match override_path {
        Some(path) => Ok(path.to_path_buf()),
        None => get_state_path(),
    }
}

/// JSON state file
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load state from file
    pub fn load(&self) -> Result<Option<GateState>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read state file: {}", self.path.display()))?;

        let state: GateState = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse state file: {}", self.path.display()))?;

        if state.version != STATE_VERSION {
            tracing::warn!(
                "State file version mismatch (expected {}, got {}). Starting fresh.",
                STATE_VERSION,
                state.version
            );
            return Ok(None);
        }

        Ok(Some(state))
    }

    /// Save state to file
    pub fn save(&self, state: &GateState) -> Result<()> {
        let content = serde_json::to_string_pretty(state).context("Failed to serialize state")?;

        crate::platform::common::atomic_write(&self.path, content.as_bytes())
            .with_context(|| format!("Failed to write state file: {}", self.path.display()))?;

        Ok(())
    }

    /// Delete the state file
    pub fn delete(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path).with_context(|| {
                format!("Failed to delete state file: {}", self.path.display())
            })?;
        }

        Ok(())
    }
}
