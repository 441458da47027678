use anyhow::{Context, Result};
use serde::Serialize;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::gate::events::GateEvent;

/// Which block screen to show
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlayVariant {
    /// Locked, "take quiz" offered
    Blocked,
    /// Quota used up, no quiz until tomorrow
    QuotaExhausted,
}

impl OverlayVariant {
    pub fn as_str(self) -> &'static str {
        match self {
            OverlayVariant::Blocked => "blocked",
            OverlayVariant::QuotaExhausted => "quota_exhausted",
        }
    }
}

/// Overlay the controller wants on screen
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OverlayRequest {
    pub app_id: String,
    pub variant: OverlayVariant,
}

/// Platform adapter that actually puts a block surface on screen
pub trait OverlaySurface: Send {
    fn show(&mut self, request: &OverlayRequest) -> Result<()>;
    fn hide(&mut self) -> Result<()>;
}

/// Keeps the overlay surface in line with the controller's state
///
/// Present/dismiss are idempotent; the adapter is only touched when the
/// desired overlay differs from what is on screen.
pub struct OverlayPresenter {
    surface: Box<dyn OverlaySurface>,
    current: Option<OverlayRequest>,
}

impl OverlayPresenter {
    pub fn new(surface: Box<dyn OverlaySurface>) -> Self {
        Self {
            surface,
            current: None,
        }
    }

    pub fn current(&self) -> Option<&OverlayRequest> {
        self.current.as_ref()
    }

    pub fn reconcile(&mut self, desired: Option<OverlayRequest>) {
        match desired {
            Some(request) => self.present(request),
            None => self.dismiss(),
        }
    }

    pub fn present(&mut self, request: OverlayRequest) {
        if self.current.as_ref() == Some(&request) {
            return;
        }

        if self.current.is_some() {
            self.dismiss();
        }

        match self.surface.show(&request) {
            Ok(()) => {
                info!(
                    "Overlay presented for {} ({})",
                    request.app_id,
                    request.variant.as_str()
                );
                self.current = Some(request);
            }
            // Left unset so the next reconcile tries again
            Err(e) => error!("Failed to present overlay for {}: {:#}", request.app_id, e),
        }
    }

    pub fn dismiss(&mut self) {
        let Some(current) = self.current.take() else {
            return;
        };

        if let Err(e) = self.surface.hide() {
            error!("Failed to remove overlay for {}: {:#}", current.app_id, e);
        } else {
            info!("Overlay removed for {}", current.app_id);
        }
    }
}

/// Overlay backed by an external full-screen program
///
/// The program is started with the app id and variant as its last two
/// arguments and killed on dismiss. If it exits with status 0 on its own the
/// user chose "take quiz".
pub struct CommandOverlay {
    program: String,
    args: Vec<String>,
    escape: mpsc::UnboundedSender<GateEvent>,
    running: Option<oneshot::Sender<()>>,
}

impl CommandOverlay {
    pub fn new(program: String, args: Vec<String>, escape: mpsc::UnboundedSender<GateEvent>) -> Self {
        Self {
            program,
            args,
            escape,
            running: None,
        }
    }
}

impl OverlaySurface for CommandOverlay {
    fn show(&mut self, request: &OverlayRequest) -> Result<()> {
        self.hide()?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(&request.app_id)
            .arg(request.variant.as_str())
            .env("QUIZLOCK_APP_ID", &request.app_id)
            .env("QUIZLOCK_OVERLAY", request.variant.as_str())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start overlay program: {}", self.program))?;

        let (kill_tx, kill_rx) = oneshot::channel();
        let escape = self.escape.clone();
        let app_id = request.app_id.clone();
        let variant = request.variant;

        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => match status {
                    Ok(status) if status.success() && variant == OverlayVariant::Blocked => {
                        debug!("Overlay for {} asked for a quiz", app_id);
                        let _ = escape.send(GateEvent::ChallengeRequested { app_id });
                    }
                    Ok(status) => warn!("Overlay program for {} exited: {}", app_id, status),
                    Err(e) => error!("Failed to wait on overlay program: {}", e),
                },
                _ = kill_rx => {
                    let _ = child.kill().await;
                }
            }
        });

        self.running = Some(kill_tx);
        Ok(())
    }

    fn hide(&mut self) -> Result<()> {
        if let Some(kill) = self.running.take() {
            let _ = kill.send(());
        }
        Ok(())
    }
}

/// Overlay that only logs, used when no overlay program is configured
#[derive(Debug, Default)]
pub struct LogOverlay;

impl OverlaySurface for LogOverlay {
    fn show(&mut self, request: &OverlayRequest) -> Result<()> {
        warn!(
            "Overlay: {} is locked ({})",
            request.app_id,
            request.variant.as_str()
        );
        Ok(())
    }

    fn hide(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
pub use recording::{RecordingSurface, SurfaceCall};


#[cfg(test)]
mod tests {
    use super::*;

    fn blocked(app: &str) -> OverlayRequest {
        OverlayRequest {
            app_id: app.to_string(),
            variant: OverlayVariant::Blocked,
        }
    }

    #[test]
    fn present_is_idempotent() {
        let surface = RecordingSurface::default();
        let mut presenter = OverlayPresenter::new(Box::new(surface.clone()));

        presenter.present(blocked("a"));
        presenter.present(blocked("a"));

        assert_eq!(surface.calls(), vec![SurfaceCall::Show(blocked("a"))]);
    }

    #[test]
    fn dismiss_when_absent_is_noop() {
        let surface = RecordingSurface::default();
        let mut presenter = OverlayPresenter::new(Box::new(surface.clone()));

        presenter.dismiss();
        presenter.reconcile(None);

        assert!(surface.calls().is_empty());
    }

    #[test]
    fn variant_change_re_presents() {
        let surface = RecordingSurface::default();
        let mut presenter = OverlayPresenter::new(Box::new(surface.clone()));

        presenter.reconcile(Some(blocked("a")));
        let exhausted = OverlayRequest {
            app_id: "a".to_string(),
            variant: OverlayVariant::QuotaExhausted,
        };
        presenter.reconcile(Some(exhausted.clone()));

        assert_eq!(
            surface.calls(),
            vec![
                SurfaceCall::Show(blocked("a")),
                SurfaceCall::Hide,
                SurfaceCall::Show(exhausted.clone()),
            ]
        );
        assert_eq!(presenter.current(), Some(&exhausted));
    }

    #[test]
    fn failed_show_is_retried() {
        let surface = RecordingSurface::default();
        *surface.fail_show.lock().unwrap() = true;
        let mut presenter = OverlayPresenter::new(Box::new(surface.clone()));

        presenter.reconcile(Some(blocked("a")));
        assert!(presenter.current().is_none());

        *surface.fail_show.lock().unwrap() = false;
        presenter.reconcile(Some(blocked("a")));
        assert_eq!(surface.shows(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_overlay_exit_zero_requests_challenge() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut overlay = CommandOverlay::new("true".to_string(), vec![], tx);

        overlay.show(&blocked("a")).unwrap();

        match rx.recv().await {
            Some(GateEvent::ChallengeRequested { app_id }) => assert_eq!(app_id, "a"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_overlay_hide_kills_program() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut overlay = CommandOverlay::new(
            "sh".to_string(),
            vec!["-c".to_string(), "sleep 30".to_string()],
            tx,
        );

        overlay.show(&blocked("a")).unwrap();
        overlay.hide().unwrap();

        let waited = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv()).await;
        assert!(waited.is_err(), "killed overlay must not request a quiz");
    }
}
