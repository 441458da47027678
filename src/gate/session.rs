use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Access state of a gated app
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AccessState {
    Locked,
    /// Locked with today's quota used up; no quiz is offered
    QuotaExceeded,
    Challenging,
    Unlocked,
}

impl AccessState {
    pub fn is_locked(self) -> bool {
        matches!(self, AccessState::Locked | AccessState::QuotaExceeded)
    }
}

/// Challenge in flight for an app
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChallengeTicket {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

/// Per-app access session
///
/// Exactly one `state` applies at a time. Correlation ids tie late results
/// from challenges and timers to the transition that spawned them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessSession {
    pub app_id: String,
    pub state: AccessState,
    pub granted_duration_ms: i64,
    pub remaining_ms: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub challenge: Option<ChallengeTicket>,
    pub session_id: Option<Uuid>,
}

impl AccessSession {
    /// Fresh session in the initial Locked state
    pub fn locked(app_id: &str) -> Self {
        Self {
            app_id: app_id.to_string(),
            state: AccessState::Locked,
            granted_duration_ms: 0,
            remaining_ms: 0,
            started_at: None,
            challenge: None,
            session_id: None,
        }
    }

    /// Return to Locked, dropping any challenge or timer correlation
    pub fn lock(&mut self, quota_exceeded: bool) {
        self.state = if quota_exceeded {
            AccessState::QuotaExceeded
        } else {
            AccessState::Locked
        };
        self.granted_duration_ms = 0;
        self.remaining_ms = 0;
        self.started_at = None;
        self.challenge = None;
        self.session_id = None;
    }

    pub fn begin_challenge(&mut self, ticket: ChallengeTicket) {
        self.state = AccessState::Challenging;
        self.challenge = Some(ticket);
    }

    pub fn unlock(&mut self, session_id: Uuid, granted_ms: i64, now: DateTime<Utc>) {
        self.state = AccessState::Unlocked;
        self.challenge = None;
        self.session_id = Some(session_id);
        self.granted_duration_ms = granted_ms;
        self.remaining_ms = granted_ms;
        self.started_at = Some(now);
    }

    pub fn challenge_id(&self) -> Option<Uuid> {
        self.challenge.as_ref().map(|c| c.id)
    }

    /// Absolute end of the access window, if Unlocked
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        match (self.state, self.started_at) {
            (AccessState::Unlocked, Some(start)) => {
                Some(start + chrono::Duration::milliseconds(self.granted_duration_ms))
            }
            _ => None,
        }
    }
}
