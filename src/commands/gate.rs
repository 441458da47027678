use anyhow::{Context, Result};
use chrono::Utc;
use std::path::{Path, PathBuf};

use crate::commands::utils::format_duration;
use crate::gate::clock::day_of;
use crate::gate::config::{
    EXAMPLE_CONFIG, GateConfig, GatedAppConfig, get_config_path, load_config, save_config,
};
use crate::gate::controller::{AccessController, ControllerSettings, GateSnapshot};
use crate::gate::registry::GatedAppRegistry;
use crate::gate::session::AccessState;
use crate::gate::state::{StateStore, resolve_state_path};

/// Config path from the command line, or the per-user default
pub fn resolve_config_path(config: Option<PathBuf>) -> Result<PathBuf> {
    match config {
        Some(path) => Ok(path),
        None => get_config_path(),
    }
}

/// Write the example configuration file
pub fn init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "Configuration file already exists: {}\nUse --force to overwrite",
            path.display()
        );
    }

    crate::platform::common::atomic_write(path, EXAMPLE_CONFIG.as_bytes())
        .with_context(|| format!("Failed to write config file: {}", path.display()))?;

    println!("✓ Created configuration file: {}", path.display());
    println!("\nEdit it to choose the apps to gate and the quiz program to run.");
    println!("Then start the gate: quizlock run");

    Ok(())
}

/// Load, change and save the configuration.
///
/// A running daemon picks the change up on its next reload.
fn edit_config<F>(path: &Path, edit: F) -> Result<GateConfig>
where
    F: FnOnce(&mut GateConfig) -> Result<()>,
{
    let mut config = load_config(path)?;
    edit(&mut config)?;
    save_config(path, &config)?;
    Ok(config)
}

fn find_app<'a>(config: &'a mut GateConfig, id: &str) -> Result<&'a mut GatedAppConfig> {
    config
        .app_mut(id)
        .with_context(|| format!("App '{}' is not in the configuration", id))
}

pub fn add_app(
    path: &Path,
    id: String,
    name: Option<String>,
    quota: u32,
    minutes: u32,
) -> Result<()> {
    let app = GatedAppConfig {
        name: name.unwrap_or_else(|| id.clone()),
        id: id.clone(),
        enabled: true,
        daily_quota: quota,
        unlock_minutes: minutes,
    };

    if path.exists() {
        edit_config(path, |config| {
            if config.app(&id).is_some() {
                anyhow::bail!("App '{}' is already gated", id);
            }
            config.apps.push(app);
            Ok(())
        })?;
    } else {
        save_config(path, &GateConfig::new(vec![app]))?;
    }

    println!("✓ Gating {}", id);
    println!("  Daily quota:  {} unlocks", quota);
    println!("  Unlock:       {} minutes", minutes);

    Ok(())
}

pub fn remove_app(path: &Path, id: &str) -> Result<()> {
    edit_config(path, |config| {
        let before = config.apps.len();
        config.apps.retain(|a| a.id != id);
        if config.apps.len() == before {
            anyhow::bail!("App '{}' is not in the configuration", id);
        }
        Ok(())
    })?;

    println!("✓ No longer gating {}", id);
    Ok(())
}

pub fn set_enabled(path: &Path, id: &str, enabled: bool) -> Result<()> {
    edit_config(path, |config| {
        find_app(config, id)?.enabled = enabled;
        Ok(())
    })?;

    println!(
        "✓ Gating {} for {}",
        if enabled { "enabled" } else { "disabled" },
        id
    );
    Ok(())
}

pub fn set_quota(path: &Path, id: &str, quota: u32) -> Result<()> {
    edit_config(path, |config| {
        find_app(config, id)?.daily_quota = quota;
        Ok(())
    })?;

    println!("✓ {} now allows {} unlocks per day", id, quota);
    Ok(())
}

pub fn set_duration(path: &Path, id: &str, minutes: u32) -> Result<()> {
    edit_config(path, |config| {
        find_app(config, id)?.unlock_minutes = minutes;
        Ok(())
    })?;

    println!("✓ {} now unlocks for {} minutes", id, minutes);
    Ok(())
}

/// Usage and sessions as they stand now, from config and the state file
fn offline_snapshot(config: &GateConfig) -> Result<GateSnapshot> {
    let now = Utc::now();
    let registry = GatedAppRegistry::from_config(&config.apps, day_of(now));
    let mut controller = AccessController::new(registry, ControllerSettings::from_config(config));

    let store = StateStore::new(resolve_state_path(config.state_file.as_deref())?);
    if let Some(state) = store.load()? {
        controller.restore(&state, now);
    }

    Ok(controller.snapshot(now))
}

pub fn status(path: &Path, json: bool) -> Result<()> {
    let config = load_config(path)
        .context("Failed to load configuration. Run 'quizlock init' first.")?;
    let snapshot = offline_snapshot(&config)?;

    if json {
        let content =
            serde_json::to_string_pretty(&snapshot).context("Failed to serialize status")?;
        println!("{}", content);
        return Ok(());
    }

    println!("Quizlock Status");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    for entry in &snapshot.apps {
        let app = &entry.app;
        println!();
        println!(
            "{} ({}){}",
            app.display_name,
            app.id,
            if app.enabled { "" } else { "  [disabled]" }
        );
        println!(
            "  Uses today:  {} of {} ({} left)",
            app.uses_consumed_today,
            app.daily_quota_uses,
            app.uses_remaining()
        );
        println!(
            "  Unlock:      {}",
            format_duration(chrono::Duration::milliseconds(app.unlock_duration_ms))
        );

        match entry.session.state {
            AccessState::Unlocked => println!(
                "  State:       unlocked, {} left",
                format_duration(chrono::Duration::milliseconds(entry.session.remaining_ms))
            ),
            _ if !app.has_quota() => println!("  State:       locked (quota used up)"),
            _ => println!("  State:       locked"),
        }
    }

    Ok(())
}

pub fn reset_state(path: &Path) -> Result<()> {
    let state_path = match load_config(path) {
        Ok(config) => resolve_state_path(config.state_file.as_deref())?,
        Err(_) => resolve_state_path(None)?,
    };

    StateStore::new(&state_path).delete()?;
    println!("✓ Cleared gate state: {}", state_path.display());
    Ok(())
}
