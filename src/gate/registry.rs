use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::gate::config::GatedAppConfig;

/// A gated app and its usage for the current day
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct GatedApp {
    pub id: String,
    pub display_name: String,
    pub enabled: bool,
    pub daily_quota_uses: u32,
    pub uses_consumed_today: u32,
    pub last_quota_reset_date: NaiveDate,
    pub unlock_duration_ms: i64,
}

impl GatedApp {
    pub fn from_config(config: &GatedAppConfig, today: NaiveDate) -> Self {
        Self {
            id: config.id.clone(),
            display_name: config.name.clone(),
            enabled: config.enabled,
            daily_quota_uses: config.daily_quota,
            uses_consumed_today: 0,
            last_quota_reset_date: today,
            unlock_duration_ms: config.unlock_duration_ms(),
        }
    }

    /// Reset the daily counter if `today` is a new day. Returns true on reset.
    pub fn roll_over(&mut self, today: NaiveDate) -> bool {
        if self.last_quota_reset_date != today {
            self.uses_consumed_today = 0;
            self.last_quota_reset_date = today;
            true
        } else {
            false
        }
    }

    pub fn has_quota(&self) -> bool {
        self.uses_consumed_today < self.daily_quota_uses
    }

    pub fn uses_remaining(&self) -> u32 {
        self.daily_quota_uses.saturating_sub(self.uses_consumed_today)
    }
}

/// What changed when the registry was synced with configuration
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RegistryDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub disabled: Vec<String>,
    pub enabled: Vec<String>,
}

/// Set of gated apps keyed by identifier
#[derive(Debug, Default, Clone)]
pub struct GatedAppRegistry {
    apps: BTreeMap<String, GatedApp>,
}

impl GatedAppRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(apps: &[GatedAppConfig], today: NaiveDate) -> Self {
        let mut registry = Self::new();
        registry.sync(apps, today);
        registry
    }

    pub fn get(&self, id: &str) -> Option<&GatedApp> {
        self.apps.get(id)
    }

    /// Look up an app, resetting its daily counter first if the day changed
    pub fn get_for_day(&mut self, id: &str, today: NaiveDate) -> Option<&mut GatedApp> {
        let app = self.apps.get_mut(id)?;
        if app.roll_over(today) {
            tracing::info!("Daily quota reset for {}", id);
        }
        Some(app)
    }

    pub fn is_gated(&self, id: &str) -> bool {
        self.apps.get(id).map(|a| a.enabled).unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = &GatedApp> {
        self.apps.values()
    }

    /// Consume one use of today's quota.
    ///
    /// Returns the new count, or `None` when the quota is already exhausted.
    pub fn consume_use(&mut self, id: &str, today: NaiveDate) -> Option<u32> {
        let app = self.get_for_day(id, today)?;
        if !app.has_quota() {
            return None;
        }
        app.uses_consumed_today += 1;
        Some(app.uses_consumed_today)
    }

    /// Restore a persisted counter. Counters from another day are dropped.
    pub fn restore_usage(&mut self, id: &str, uses: u32, date: NaiveDate, today: NaiveDate) {
        if let Some(app) = self.apps.get_mut(id) {
            if date == today {
                app.uses_consumed_today = uses;
                app.last_quota_reset_date = date;
            }
        }
    }

    pub fn set_enabled(&mut self, id: &str, enabled: bool) -> Option<bool> {
        let app = self.apps.get_mut(id)?;
        let previous = app.enabled;
        app.enabled = enabled;
        Some(previous)
    }

    pub fn set_quota(&mut self, id: &str, daily_quota_uses: u32) -> bool {
        match self.apps.get_mut(id) {
            Some(app) => {
                app.daily_quota_uses = daily_quota_uses;
                true
            }
            None => false,
        }
    }

    pub fn set_unlock_duration(&mut self, id: &str, unlock_duration_ms: i64) -> bool {
        match self.apps.get_mut(id) {
            Some(app) => {
                app.unlock_duration_ms = unlock_duration_ms;
                true
            }
            None => false,
        }
    }

    /// Bring the registry in line with configuration, keeping usage counters
    /// of apps that stay configured.
    pub fn sync(&mut self, apps: &[GatedAppConfig], today: NaiveDate) -> RegistryDiff {
        let mut diff = RegistryDiff::default();

        let configured: std::collections::HashSet<&str> =
            apps.iter().map(|a| a.id.as_str()).collect();
        let stale: Vec<String> = self
            .apps
            .keys()
            .filter(|id| !configured.contains(id.as_str()))
            .cloned()
            .collect();
        for id in stale {
            self.apps.remove(&id);
            diff.removed.push(id);
        }

        for config in apps {
            match self.apps.get_mut(&config.id) {
                Some(app) => {
                    if app.enabled && !config.enabled {
                        diff.disabled.push(config.id.clone());
                    } else if !app.enabled && config.enabled {
                        diff.enabled.push(config.id.clone());
                    }
                    app.display_name = config.name.clone();
                    app.enabled = config.enabled;
                    app.daily_quota_uses = config.daily_quota;
                    app.unlock_duration_ms = config.unlock_duration_ms();
                }
                None => {
                    self.apps
                        .insert(config.id.clone(), GatedApp::from_config(config, today));
                    diff.added.push(config.id.clone());
                }
            }
        }

        diff
    }
}
