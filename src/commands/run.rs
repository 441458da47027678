use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time;

use crate::gate::challenge::{ChallengeLauncher, CommandChallengeLauncher, NoChallenge};
use crate::gate::clock::{Clock, SystemClock, day_of};
use crate::gate::config::{GateConfig, ObserverSource, parse_config};
use crate::gate::controller::{AccessController, ControllerSettings};
use crate::gate::events::Notification;
use crate::gate::notify::DesktopPrompt;
use crate::gate::observer::{ForegroundObserver, LineSource, PollingSource, SystemProbe};
use crate::gate::overlay::{CommandOverlay, LogOverlay, OverlayPresenter, OverlaySurface};
use crate::gate::registry::GatedAppRegistry;
use crate::gate::service::{GateHandle, GateQueue, GateService};
use crate::gate::state::{StateStore, resolve_state_path};

/// Run the gate until Ctrl+C
pub fn run(config_path: &Path, stdin: bool) -> Result<()> {
    let content = std::fs::read_to_string(config_path).with_context(|| {
        format!(
            "Failed to read config file: {}. Run 'quizlock init' first.",
            config_path.display()
        )
    })?;
    let config = parse_config(&content)
        .with_context(|| format!("Invalid config file: {}", config_path.display()))?;

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    runtime.block_on(run_gate(
        config_path.to_path_buf(),
        config,
        compute_config_hash(&content),
        stdin,
    ))
}

async fn run_gate(config_path: PathBuf, config: GateConfig, hash: String, stdin: bool) -> Result<()> {
    tracing::info!("Starting quizlock");
    tracing::info!("Config: {}", config_path.display());
    tracing::info!(
        "Gating {} app(s)",
        config.apps.iter().filter(|a| a.enabled).count()
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let queue = GateQueue::new();

    let surface: Box<dyn OverlaySurface> = match &config.overlay.command {
        Some(program) => Box::new(CommandOverlay::new(
            program.clone(),
            config.overlay.args.clone(),
            queue.sender(),
        )),
        None => {
            tracing::warn!("No overlay program configured; blocks are only logged");
            Box::new(LogOverlay)
        }
    };

    let launcher: Arc<dyn ChallengeLauncher> =
        match CommandChallengeLauncher::from_config(&config.challenge) {
            Some(launcher) => Arc::new(launcher),
            None => {
                tracing::warn!("No quiz program configured; gated apps cannot be unlocked");
                Arc::new(NoChallenge)
            }
        };

    let registry = GatedAppRegistry::from_config(&config.apps, day_of(clock.now()));
    let controller = AccessController::new(registry, ControllerSettings::from_config(&config));
    let store = StateStore::new(resolve_state_path(config.state_file.as_deref())?);
    tracing::info!("State: {}", store.path().display());

    let service = GateService::new(
        controller,
        OverlayPresenter::new(surface),
        launcher,
        Arc::clone(&clock),
        queue,
    )
    .with_prompt(Arc::new(DesktopPrompt))
    .with_store(store)
    .with_sweep_interval(Duration::from_millis(config.timer.sweep_interval_ms));

    let handle = service.handle();
    let notifications = service.bus().subscribe();
    let mut service_task = tokio::spawn(service.run());

    let observer = ForegroundObserver::new(handle.sender());
    let observer_task = if stdin || config.observer.source == ObserverSource::Stdin {
        tracing::info!("Reading foreground app ids from stdin");
        let source = LineSource::new(BufReader::new(tokio::io::stdin()));
        tokio::spawn(observer.run(source, Arc::clone(&clock)))
    } else {
        let poll = Duration::from_millis(config.observer.poll_interval_ms);
        tokio::spawn(observer.run(PollingSource::new(SystemProbe, poll), Arc::clone(&clock)))
    };

    let log_task = tokio::spawn(log_notifications(notifications, config.events_log.clone()));

    let reload_task = tokio::spawn(watch_config(
        config_path,
        hash,
        Duration::from_secs(config.reload_interval_secs),
        handle.clone(),
    ));

    let stopped = wait_for_stop(&mut service_task, tokio::signal::ctrl_c()).await;

    observer_task.abort();
    reload_task.abort();

    if let Err(e) = stopped {
        log_task.abort();
        tracing::error!("{:#}", e);
        return Err(e);
    }

    tracing::info!("Shutting down");
    if let Err(e) = handle.shutdown() {
        tracing::warn!("{}", e);
    }
    service_task.await.context("Gate service task panicked")??;
    log_task.abort();

    Ok(())
}

/// Wait for the stop signal, or fail as soon as the gate service exits on its own
async fn wait_for_stop<S>(service_task: &mut JoinHandle<Result<()>>, signal: S) -> Result<()>
where
    S: Future<Output = std::io::Result<()>>,
{
    tokio::select! {
        received = signal => received.context("Failed to listen for Ctrl+C"),
        joined = service_task => match joined {
            Ok(Ok(())) => anyhow::bail!("Gate service stopped unexpectedly"),
            Ok(Err(e)) => Err(e.context("Gate service failed")),
            Err(e) => anyhow::bail!("Gate service task panicked: {}", e),
        },
    }
}

/// Re-read the config file and push app changes into the gate
async fn watch_config(path: PathBuf, mut hash: String, interval: Duration, handle: GateHandle) {
    let mut ticker = time::interval(interval);
    ticker.tick().await;

    loop {
        ticker.tick().await;

        match check_config(&path, &hash) {
            Ok(None) => tracing::debug!("Config unchanged"),
            Ok(Some((new_hash, config))) => {
                tracing::info!("Config changed (hash: {}), applying", &new_hash[..16]);
                hash = new_hash;
                if handle.apply_config(config.apps).is_err() {
                    break;
                }
                tracing::info!("App list applied; other settings take effect after a restart");
            }
            Err((new_hash, e)) => {
                tracing::error!("Ignoring invalid config: {:#}", e);
                if let Some(new_hash) = new_hash {
                    hash = new_hash;
                }
            }
        }
    }
}

type ConfigCheck = std::result::Result<Option<(String, GateConfig)>, (Option<String>, anyhow::Error)>;

/// `Ok(None)` if the file is unchanged; on a parse error the new hash is
/// returned so the same broken file is only reported once.
fn check_config(path: &Path, hash: &str) -> ConfigCheck {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))
        .map_err(|e| (None, e))?;

    let new_hash = compute_config_hash(&content);
    if new_hash == hash {
        return Ok(None);
    }

    match parse_config(&content) {
        Ok(config) => Ok(Some((new_hash, config))),
        Err(e) => Err((Some(new_hash), e)),
    }
}

fn compute_config_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("sha256:{:x}", hasher.finalize())
}

#[derive(Serialize)]
struct LoggedNotification<'a> {
    at: DateTime<Utc>,
    #[serde(flatten)]
    notification: &'a Notification,
}

/// Log notifications and optionally append them to a JSON-lines file
async fn log_notifications(mut rx: broadcast::Receiver<Notification>, events_log: Option<PathBuf>) {
    loop {
        let notification = match rx.recv().await {
            Ok(notification) => notification,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!("Dropped {} notifications", missed);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        tracing::info!(app = notification.app_id(), "{:?}", notification);

        if let Some(path) = &events_log {
            if let Err(e) = append_notification(path, &notification) {
                tracing::warn!("Failed to record notification: {:#}", e);
            }
        }
    }
}

fn append_notification(path: &Path, notification: &Notification) -> Result<()> {
    let line = serde_json::to_string(&LoggedNotification {
        at: Utc::now(),
        notification,
    })
    .context("Failed to serialize notification")?;

    crate::platform::common::append_line(path, &line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::config::EXAMPLE_CONFIG;
    use tempfile::tempdir;

    #[test]
    fn compute_config_hash_has_correct_format() {
        let hash = compute_config_hash(EXAMPLE_CONFIG);
        assert!(hash.starts_with("sha256:"));
        assert_eq!(hash.len(), 71);
        assert_eq!(hash, compute_config_hash(EXAMPLE_CONFIG));
    }

    #[test]
    fn check_config_reports_changes_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, EXAMPLE_CONFIG).unwrap();
        let hash = compute_config_hash(EXAMPLE_CONFIG);

        assert!(matches!(check_config(&path, &hash), Ok(None)));

        let changed = EXAMPLE_CONFIG.replace("daily_quota: 3", "daily_quota: 4");
        std::fs::write(&path, &changed).unwrap();
        let (new_hash, config) = check_config(&path, &hash).unwrap().unwrap();
        assert_eq!(config.apps[0].daily_quota, 4);
        assert!(matches!(check_config(&path, &new_hash), Ok(None)));
    }

    #[test]
    fn check_config_returns_hash_of_broken_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "apps: [").unwrap();

        match check_config(&path, "sha256:old") {
            Err((Some(hash), _)) => assert_eq!(hash, compute_config_hash("apps: [")),
            _ => panic!("broken config must be rejected"),
        }
    }

    #[tokio::test]
    async fn wait_for_stop_reports_dead_service() {
        let mut service_task = tokio::spawn(async {
            let overflowed = true;
            if overflowed {
                panic!("controller overflow");
            }
            Ok::<(), anyhow::Error>(())
        });

        let err = wait_for_stop(&mut service_task, std::future::pending::<std::io::Result<()>>())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("panicked"));
    }

    #[tokio::test]
    async fn wait_for_stop_reports_failed_service() {
        let mut service_task = tokio::spawn(async {
            Err::<(), _>(anyhow::anyhow!("queue already taken"))
        });

        let err = wait_for_stop(&mut service_task, std::future::pending::<std::io::Result<()>>())
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("queue already taken"));
    }

    #[tokio::test]
    async fn wait_for_stop_returns_on_signal() {
        let mut service_task = tokio::spawn(std::future::pending::<Result<()>>());

        wait_for_stop(&mut service_task, async { Ok::<(), std::io::Error>(()) })
            .await
            .unwrap();
        assert!(!service_task.is_finished());
        service_task.abort();
    }

    #[test]
    fn notifications_are_appended_as_json_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.jsonl");

        append_notification(
            &path,
            &Notification::QuizPassed {
                app_id: "a".to_string(),
            },
        )
        .unwrap();
        append_notification(
            &path,
            &Notification::SessionExpired {
                app_id: "a".to_string(),
            },
        )
        .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "quiz_passed");
        assert_eq!(lines[1]["event"], "session_expired");
        assert!(lines[0]["at"].is_string());
    }
}
