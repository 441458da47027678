use thiserror::Error;

/// Errors raised inside the gate core
///
/// None of these escape the service actor: each one is either ignored
/// (unknown app, stale event) or answered by re-locking the app.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("foreground observer unavailable: {0}")]
    ObserverUnavailable(String),

    #[error("challenge for {app_id} abandoned: {reason}")]
    ChallengeAbandoned { app_id: String, reason: String },

    #[error("timer drift for {app_id}: woke {drift_ms}ms late")]
    TimerDriftDetected { app_id: String, drift_ms: i64 },

    #[error("app is not gated: {0}")]
    UnknownApp(String),

    #[error("stale {kind} event for {app_id}")]
    StaleEvent { app_id: String, kind: &'static str },

    #[error("internal error for {app_id}: {reason}")]
    Internal { app_id: String, reason: String },

    #[error("gate service is not running")]
    ChannelClosed,
}

impl GateError {
    /// Whether the service should re-lock the app after this error
    pub fn fails_closed(&self) -> bool {
        !matches!(
            self,
            GateError::UnknownApp(_)
                | GateError::StaleEvent { .. }
                | GateError::ObserverUnavailable(_)
                | GateError::ChannelClosed
        )
    }

    /// App the error refers to, if any
    pub fn app_id(&self) -> Option<&str> {
        match self {
            GateError::ChallengeAbandoned { app_id, .. }
            | GateError::TimerDriftDetected { app_id, .. }
            | GateError::StaleEvent { app_id, .. }
            | GateError::Internal { app_id, .. } => Some(app_id),
            GateError::UnknownApp(app_id) => Some(app_id),
            GateError::ObserverUnavailable(_) | GateError::ChannelClosed => None,
        }
    }
}

pub type GateResult<T> = std::result::Result<T, GateError>;
