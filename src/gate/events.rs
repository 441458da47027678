use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot};
use uuid::Uuid;

use crate::gate::config::GatedAppConfig;
use crate::gate::controller::GateSnapshot;

/// A foreground change reported by the observer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForegroundEvent {
    pub app_id: String,
    pub timestamp_ms: i64,
}

/// Terminal result of a challenge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeOutcome {
    Passed,
    Failed,
    /// Dismissed, crashed or timed out without a result
    Abandoned,
}

/// Messages processed by the gate service, one at a time
#[derive(Debug)]
pub enum GateEvent {
    Foreground(ForegroundEvent),
    /// Nothing has focus (desktop, lock screen)
    ForegroundCleared { timestamp_ms: i64 },
    ObserverUnavailable { reason: String },
    /// "Take quiz" pressed on the overlay
    ChallengeRequested { app_id: String },
    ChallengeFinished {
        app_id: String,
        challenge_id: Uuid,
        outcome: ChallengeOutcome,
    },
    TimerTick {
        app_id: String,
        session_id: Uuid,
        /// Window length the timer counted against, extensions included
        granted_ms: i64,
        remaining_ms: i64,
    },
    TimerExpired { app_id: String, session_id: Uuid },
    ExtendSession { app_id: String, additional_ms: i64 },
    Relock { app_id: String },
    ApplyConfig(Vec<GatedAppConfig>),
    SetEnabled { app_id: String, enabled: bool },
    SetQuota { app_id: String, daily_quota: u32 },
    SetUnlockDuration { app_id: String, unlock_duration_ms: i64 },
    Snapshot(oneshot::Sender<GateSnapshot>),
    Shutdown,
}

/// Side-channel notification for analytics / gamification consumers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    Interception { app_id: String, timestamp_ms: i64 },
    QuizPassed { app_id: String },
    QuizFailed { app_id: String, abandoned: bool },
    SessionExpired { app_id: String },
}

impl Notification {
    pub fn app_id(&self) -> &str {
        match self {
            Notification::Interception { app_id, .. }
            | Notification::QuizPassed { app_id }
            | Notification::QuizFailed { app_id, .. }
            | Notification::SessionExpired { app_id } => app_id,
        }
    }
}

/// Fire-and-forget broadcast of notifications
///
/// Sending never fails from the caller's point of view: with no subscribers
/// or lagging subscribers the notification is simply lost.
#[derive(Debug, Clone)]
pub struct NotificationBus {
    tx: broadcast::Sender<Notification>,
}

impl NotificationBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn emit(&self, notification: Notification) {
        tracing::debug!(?notification, "notification");
        let _ = self.tx.send(notification);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new(64)
    }
}
