use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::gate::clock::day_of;
use crate::gate::config::{GateConfig, GatedAppConfig};
use crate::gate::error::{GateError, GateResult};
use crate::gate::events::{ChallengeOutcome, ForegroundEvent, Notification};
use crate::gate::overlay::{OverlayRequest, OverlayVariant};
use crate::gate::registry::{GatedApp, GatedAppRegistry};
use crate::gate::session::{AccessSession, AccessState, ChallengeTicket};
use crate::gate::state::{GateState, SessionRecord, UsageRecord};
use crate::gate::timer::SessionTimer;

/// Timing knobs of the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerSettings {
    /// Challenge time limit plus grace
    pub challenge_deadline_ms: i64,
    /// Session timer granularity
    pub tick_ms: i64,
}

impl ControllerSettings {
    pub fn from_config(config: &GateConfig) -> Self {
        Self {
            challenge_deadline_ms: i64::try_from(config.challenge.deadline().as_millis())
                .unwrap_or(i64::MAX),
            tick_ms: i64::try_from(config.timer.tick_ms).unwrap_or(i64::MAX),
        }
    }
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            challenge_deadline_ms: 330_000,
            tick_ms: 1000,
        }
    }
}

/// Side effect requested by a transition, executed by the gate service
#[derive(Debug, Clone)]
pub enum Effect {
    LaunchChallenge { app_id: String, challenge_id: Uuid },
    CancelChallenge { app_id: String, challenge_id: Uuid },
    StartTimer { app_id: String, timer: SessionTimer },
    ExtendTimer { app_id: String, session_id: Uuid, additional_ms: i64 },
    CancelTimer { app_id: String, session_id: Uuid },
    Notify(Notification),
    PromptPermission { reason: String },
    Persist,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ObserverStatus {
    Available,
    Unavailable,
}

/// Read-only view for status output
#[derive(Debug, Clone, Serialize)]
pub struct GateSnapshot {
    pub foreground: Option<String>,
    pub observer: ObserverStatus,
    pub overlay: Option<OverlayRequest>,
    pub apps: Vec<AppSnapshot>,
}

impl GateSnapshot {
    pub fn app(&self, app_id: &str) -> Option<&AppSnapshot> {
        self.apps.iter().find(|a| a.app.id == app_id)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AppSnapshot {
    pub app: GatedApp,
    pub session: AccessSession,
}

/// Per-app access state machine
///
/// ```text
/// Locked --(foreground, quota ok)--> Challenging
/// Challenging --(pass)--> Unlocked
/// Challenging --(fail/abandon)--> Locked
/// Unlocked --(timer expiry)--> Locked
/// Locked --(foreground, quota exceeded)--> QuotaExceeded
/// ```
///
/// Transitions are pure: every method takes `now` and returns the effects
/// the caller must carry out. The caller serializes all calls.
pub struct AccessController {
    registry: GatedAppRegistry,
    sessions: HashMap<String, AccessSession>,
    foreground: Option<String>,
    observer: ObserverStatus,
    settings: ControllerSettings,
}

impl AccessController {
    pub fn new(registry: GatedAppRegistry, settings: ControllerSettings) -> Self {
        let sessions = registry
            .iter()
            .map(|app| (app.id.clone(), AccessSession::locked(&app.id)))
            .collect();

        Self {
            registry,
            sessions,
            foreground: None,
            observer: ObserverStatus::Available,
            settings,
        }
    }

    pub fn registry(&self) -> &GatedAppRegistry {
        &self.registry
    }

    pub fn settings(&self) -> ControllerSettings {
        self.settings
    }

    pub fn session(&self, app_id: &str) -> Option<&AccessSession> {
        self.sessions.get(app_id)
    }

    pub fn state_of(&self, app_id: &str) -> Option<AccessState> {
        self.sessions.get(app_id).map(|s| s.state)
    }

    pub fn foreground(&self) -> Option<&str> {
        self.foreground.as_deref()
    }

    pub fn observer_status(&self) -> ObserverStatus {
        self.observer
    }

    /// A new app came to the foreground
    pub fn on_foreground(&mut self, event: &ForegroundEvent, now: DateTime<Utc>) -> Vec<Effect> {
        self.on_observer_restored();
        self.foreground = Some(event.app_id.clone());

        if !self.registry.is_gated(&event.app_id) {
            return Vec::new();
        }

        self.intercept(&event.app_id, event.timestamp_ms, now)
    }

    /// Nothing has focus; no app is in front to cover
    pub fn on_foreground_cleared(&mut self) -> Vec<Effect> {
        self.on_observer_restored();
        self.foreground = None;
        Vec::new()
    }

    /// "Take quiz" chosen on the overlay
    pub fn on_challenge_requested(
        &mut self,
        app_id: &str,
        now: DateTime<Utc>,
    ) -> GateResult<Vec<Effect>> {
        if !self.registry.is_gated(app_id) {
            return Err(GateError::UnknownApp(app_id.to_string()));
        }

        if self.foreground.as_deref() != Some(app_id) {
            return Err(GateError::StaleEvent {
                app_id: app_id.to_string(),
                kind: "challenge request",
            });
        }

        Ok(self.intercept(app_id, now.timestamp_millis(), now))
    }

    fn intercept(&mut self, app_id: &str, timestamp_ms: i64, now: DateTime<Utc>) -> Vec<Effect> {
        let Some(app) = self.registry.get_for_day(app_id, day_of(now)) else {
            return Vec::new();
        };
        let has_quota = app.has_quota();

        let session = self
            .sessions
            .entry(app_id.to_string())
            .or_insert_with(|| AccessSession::locked(app_id));

        if !session.state.is_locked() {
            debug!("{} is {:?}, nothing to intercept", app_id, session.state);
            return Vec::new();
        }

        let mut effects = vec![Effect::Notify(Notification::Interception {
            app_id: app_id.to_string(),
            timestamp_ms,
        })];

        if !has_quota {
            if session.state != AccessState::QuotaExceeded {
                info!("Daily quota exhausted for {}", app_id);
            }
            session.lock(true);
            return effects;
        }

        let deadline = chrono::Duration::try_milliseconds(self.settings.challenge_deadline_ms)
            .and_then(|limit| now.checked_add_signed(limit));
        let Some(deadline) = deadline else {
            let err = GateError::Internal {
                app_id: app_id.to_string(),
                reason: "challenge deadline out of range".to_string(),
            };
            error!("{}; staying locked", err);
            session.lock(false);
            return effects;
        };

        let ticket = ChallengeTicket {
            id: Uuid::new_v4(),
            started_at: now,
            deadline,
        };
        info!("Intercepted {}, starting challenge {}", app_id, ticket.id);
        effects.push(Effect::LaunchChallenge {
            app_id: app_id.to_string(),
            challenge_id: ticket.id,
        });
        session.begin_challenge(ticket);

        effects
    }

    /// A challenge reported its outcome
    pub fn on_challenge_result(
        &mut self,
        app_id: &str,
        challenge_id: Uuid,
        outcome: ChallengeOutcome,
        now: DateTime<Utc>,
    ) -> GateResult<Vec<Effect>> {
        let session = self
            .sessions
            .get_mut(app_id)
            .ok_or_else(|| GateError::UnknownApp(app_id.to_string()))?;

        if session.state != AccessState::Challenging || session.challenge_id() != Some(challenge_id)
        {
            return Err(GateError::StaleEvent {
                app_id: app_id.to_string(),
                kind: "challenge result",
            });
        }

        match outcome {
            ChallengeOutcome::Passed => {
                let granted_ms = self
                    .registry
                    .get(app_id)
                    .map(|a| a.unlock_duration_ms)
                    .ok_or_else(|| GateError::UnknownApp(app_id.to_string()))?;

                let Some(uses) = self.registry.consume_use(app_id, day_of(now)) else {
                    warn!("{} passed a quiz but its quota is used up; staying locked", app_id);
                    session.lock(true);
                    return Ok(vec![Effect::Persist]);
                };

                let session_id = Uuid::new_v4();
                session.unlock(session_id, granted_ms, now);
                info!(
                    "{} unlocked for {}s (use {} today)",
                    app_id,
                    granted_ms / 1000,
                    uses
                );

                Ok(vec![
                    Effect::StartTimer {
                        app_id: app_id.to_string(),
                        timer: SessionTimer::new(session_id, now, granted_ms, self.settings.tick_ms),
                    },
                    Effect::Notify(Notification::QuizPassed {
                        app_id: app_id.to_string(),
                    }),
                    Effect::Persist,
                ])
            }
            ChallengeOutcome::Failed | ChallengeOutcome::Abandoned => {
                let abandoned = outcome == ChallengeOutcome::Abandoned;
                info!(
                    "Challenge for {} {}",
                    app_id,
                    if abandoned { "abandoned" } else { "failed" }
                );
                session.lock(false);
                Ok(vec![Effect::Notify(Notification::QuizFailed {
                    app_id: app_id.to_string(),
                    abandoned,
                })])
            }
        }
    }

    /// Periodic remaining-time report from the session timer
    ///
    /// `granted_ms` is the window the timer counted against. A tick sent
    /// before the timer saw an extension carries the old window and is
    /// dropped.
    pub fn on_timer_tick(
        &mut self,
        app_id: &str,
        session_id: Uuid,
        granted_ms: i64,
        remaining_ms: i64,
    ) -> GateResult<Vec<Effect>> {
        let session = self.unlocked_session(app_id, session_id, "timer tick")?;
        if granted_ms != session.granted_duration_ms {
            debug!("Tick for {} predates an extension", app_id);
            return Ok(Vec::new());
        }
        session.remaining_ms = session.remaining_ms.min(remaining_ms.max(0));
        Ok(Vec::new())
    }

    /// The session timer reached zero
    pub fn on_timer_expired(&mut self, app_id: &str, session_id: Uuid) -> GateResult<Vec<Effect>> {
        let session = self.unlocked_session(app_id, session_id, "timer expiry")?;
        session.lock(false);
        info!("Session expired for {}", app_id);

        Ok(vec![
            Effect::Notify(Notification::SessionExpired {
                app_id: app_id.to_string(),
            }),
            Effect::Persist,
        ])
    }

    fn unlocked_session(
        &mut self,
        app_id: &str,
        session_id: Uuid,
        kind: &'static str,
    ) -> GateResult<&mut AccessSession> {
        let session = self
            .sessions
            .get_mut(app_id)
            .ok_or_else(|| GateError::UnknownApp(app_id.to_string()))?;

        if session.state != AccessState::Unlocked || session.session_id != Some(session_id) {
            return Err(GateError::StaleEvent {
                app_id: app_id.to_string(),
                kind,
            });
        }

        Ok(session)
    }

    /// Add time to a running session
    pub fn extend_session(&mut self, app_id: &str, additional_ms: i64) -> GateResult<Vec<Effect>> {
        let session = self
            .sessions
            .get_mut(app_id)
            .ok_or_else(|| GateError::UnknownApp(app_id.to_string()))?;

        let (AccessState::Unlocked, Some(session_id)) = (session.state, session.session_id) else {
            return Err(GateError::StaleEvent {
                app_id: app_id.to_string(),
                kind: "extend",
            });
        };

        if additional_ms <= 0 {
            return Ok(Vec::new());
        }

        let extended = session.granted_duration_ms.checked_add(additional_ms).filter(|granted| {
            session.started_at.is_some_and(|started| {
                chrono::Duration::try_milliseconds(*granted)
                    .and_then(|window| started.checked_add_signed(window))
                    .is_some()
            })
        });
        let Some(granted) = extended else {
            warn!("Ignoring out-of-range extension for {}", app_id);
            return Ok(Vec::new());
        };

        session.granted_duration_ms = granted;
        session.remaining_ms = session.remaining_ms.saturating_add(additional_ms);
        info!("Extended session for {} by {}s", app_id, additional_ms / 1000);

        Ok(vec![
            Effect::ExtendTimer {
                app_id: app_id.to_string(),
                session_id,
                additional_ms,
            },
            Effect::Persist,
        ])
    }

    /// Force an app back to Locked, cancelling whatever it was doing
    pub fn relock(&mut self, app_id: &str) -> GateResult<Vec<Effect>> {
        let session = self
            .sessions
            .get_mut(app_id)
            .ok_or_else(|| GateError::UnknownApp(app_id.to_string()))?;

        let mut effects = teardown(session);
        session.lock(false);
        effects.push(Effect::Persist);
        info!("{} re-locked", app_id);

        Ok(effects)
    }

    /// The foreground capability went away
    ///
    /// Unlocked sessions keep running and no overlay is shown while the
    /// foreground app is unknown.
    pub fn on_observer_unavailable(&mut self, reason: &str) -> Vec<Effect> {
        if self.observer == ObserverStatus::Unavailable {
            return Vec::new();
        }

        warn!("{}", GateError::ObserverUnavailable(reason.to_string()));
        self.observer = ObserverStatus::Unavailable;
        self.foreground = None;

        vec![Effect::PromptPermission {
            reason: reason.to_string(),
        }]
    }

    /// Foreground readings are flowing again
    pub fn on_observer_restored(&mut self) {
        if self.observer == ObserverStatus::Unavailable {
            info!("Foreground observer restored");
            self.observer = ObserverStatus::Available;
        }
    }

    pub fn set_enabled(
        &mut self,
        app_id: &str,
        enabled: bool,
        now: DateTime<Utc>,
    ) -> GateResult<Vec<Effect>> {
        let previous = self
            .registry
            .set_enabled(app_id, enabled)
            .ok_or_else(|| GateError::UnknownApp(app_id.to_string()))?;

        match (previous, enabled) {
            (true, false) => Ok(self.disable(app_id)),
            (false, true) => Ok(self.enable(app_id, now)),
            _ => Ok(Vec::new()),
        }
    }

    pub fn set_quota(
        &mut self,
        app_id: &str,
        daily_quota: u32,
        now: DateTime<Utc>,
    ) -> GateResult<Vec<Effect>> {
        if !self.registry.set_quota(app_id, daily_quota) {
            return Err(GateError::UnknownApp(app_id.to_string()));
        }
        self.refresh_quota_states(now);
        Ok(Vec::new())
    }

    pub fn set_unlock_duration(
        &mut self,
        app_id: &str,
        unlock_duration_ms: i64,
    ) -> GateResult<Vec<Effect>> {
        if unlock_duration_ms <= 0 {
            warn!("Ignoring non-positive unlock duration for {}", app_id);
            return Ok(Vec::new());
        }
        if !self.registry.set_unlock_duration(app_id, unlock_duration_ms) {
            return Err(GateError::UnknownApp(app_id.to_string()));
        }
        Ok(Vec::new())
    }

    /// Sync with a (re)loaded configuration
    pub fn apply_config(&mut self, apps: &[GatedAppConfig], now: DateTime<Utc>) -> Vec<Effect> {
        let diff = self.registry.sync(apps, day_of(now));
        let mut effects = Vec::new();

        for app_id in &diff.removed {
            if let Some(session) = self.sessions.remove(app_id) {
                effects.extend(teardown(&session));
            }
            info!("{} is no longer gated", app_id);
        }

        for app_id in &diff.disabled {
            effects.extend(self.disable(app_id));
        }

        for app_id in &diff.added {
            self.sessions
                .insert(app_id.clone(), AccessSession::locked(app_id));
            info!("Now gating {}", app_id);
            if self.registry.is_gated(app_id) && self.foreground.as_deref() == Some(app_id.as_str())
            {
                effects.extend(self.intercept(app_id, now.timestamp_millis(), now));
            }
        }

        for app_id in &diff.enabled {
            effects.extend(self.enable(app_id, now));
        }

        self.refresh_quota_states(now);

        if !diff.removed.is_empty() || !diff.disabled.is_empty() {
            effects.push(Effect::Persist);
        }
        effects
    }

    fn disable(&mut self, app_id: &str) -> Vec<Effect> {
        let Some(session) = self.sessions.get_mut(app_id) else {
            return Vec::new();
        };

        let mut effects = teardown(session);
        session.lock(false);
        effects.push(Effect::Persist);
        info!("Gating disabled for {}", app_id);
        effects
    }

    fn enable(&mut self, app_id: &str, now: DateTime<Utc>) -> Vec<Effect> {
        self.sessions
            .insert(app_id.to_string(), AccessSession::locked(app_id));
        info!("Gating enabled for {}", app_id);

        if self.foreground.as_deref() == Some(app_id) {
            self.intercept(app_id, now.timestamp_millis(), now)
        } else {
            Vec::new()
        }
    }

    /// Clear QuotaExceeded where quota is available again (new day, raised quota)
    fn refresh_quota_states(&mut self, now: DateTime<Utc>) {
        let today = day_of(now);
        for (app_id, session) in self.sessions.iter_mut() {
            if session.state != AccessState::QuotaExceeded {
                continue;
            }
            if let Some(app) = self.registry.get_for_day(app_id, today) {
                if app.has_quota() {
                    debug!("Quota available again for {}", app_id);
                    session.lock(false);
                }
            }
        }
    }

    /// Recompute deadlines from absolute timestamps
    ///
    /// Abandons challenges past their deadline and expires sessions whose
    /// timer should already have fired.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<Effect> {
        let mut effects = Vec::new();
        let grace = chrono::Duration::milliseconds(self.settings.tick_ms);

        for (app_id, session) in self.sessions.iter_mut() {
            match session.state {
                AccessState::Challenging => {
                    let Some(ticket) = session.challenge.clone() else {
                        continue;
                    };
                    if ticket.deadline > now {
                        continue;
                    }
                    let err = GateError::ChallengeAbandoned {
                        app_id: app_id.clone(),
                        reason: "no result before deadline".to_string(),
                    };
                    warn!("{}", err);
                    session.lock(false);
                    effects.push(Effect::CancelChallenge {
                        app_id: app_id.clone(),
                        challenge_id: ticket.id,
                    });
                    effects.push(Effect::Notify(Notification::QuizFailed {
                        app_id: app_id.clone(),
                        abandoned: true,
                    }));
                }
                AccessState::Unlocked => {
                    let (Some(expires_at), Some(session_id)) =
                        (session.expires_at(), session.session_id)
                    else {
                        let err = GateError::Internal {
                            app_id: app_id.clone(),
                            reason: "unlocked session without start time or id".to_string(),
                        };
                        error!("{}; re-locking", err);
                        effects.extend(teardown(session));
                        session.lock(false);
                        effects.push(Effect::Persist);
                        continue;
                    };
                    if expires_at + grace > now {
                        continue;
                    }
                    warn!("Timer for {} missed its deadline; expiring from wall clock", app_id);
                    session.lock(false);
                    effects.push(Effect::CancelTimer {
                        app_id: app_id.clone(),
                        session_id,
                    });
                    effects.push(Effect::Notify(Notification::SessionExpired {
                        app_id: app_id.clone(),
                    }));
                    effects.push(Effect::Persist);
                }
                AccessState::Locked | AccessState::QuotaExceeded => {}
            }
        }

        self.refresh_quota_states(now);
        effects
    }

    /// Fail closed: re-lock after an unexpected error
    pub fn fail_closed(&mut self, app_id: &str) -> Vec<Effect> {
        match self.relock(app_id) {
            Ok(effects) => effects,
            Err(e) => {
                debug!("Nothing to re-lock: {}", e);
                Vec::new()
            }
        }
    }

    /// Rebuild counters and live sessions from persisted state
    pub fn restore(&mut self, state: &GateState, now: DateTime<Utc>) -> Vec<Effect> {
        let today = day_of(now);
        let mut effects = Vec::new();

        for usage in &state.apps {
            self.registry.restore_usage(
                &usage.app_id,
                usage.uses_consumed_today,
                usage.last_quota_reset_date,
                today,
            );
        }

        for record in &state.sessions {
            if !self.registry.is_gated(&record.app_id) {
                continue;
            }
            if record.expires_at() <= now {
                info!("Session for {} expired while not running", record.app_id);
                continue;
            }
            let Some(session) = self.sessions.get_mut(&record.app_id) else {
                continue;
            };

            session.unlock(record.session_id, record.granted_duration_ms, record.started_at);
            session.remaining_ms = (record.expires_at() - now).num_milliseconds();
            info!(
                "Resumed session for {} ({}s left)",
                record.app_id,
                session.remaining_ms / 1000
            );

            effects.push(Effect::StartTimer {
                app_id: record.app_id.clone(),
                timer: SessionTimer::new(
                    record.session_id,
                    record.started_at,
                    record.granted_duration_ms,
                    self.settings.tick_ms,
                ),
            });
        }

        effects
    }

    /// State worth persisting
    pub fn to_state(&self, now: DateTime<Utc>) -> GateState {
        let mut state = GateState::new(now);

        for app in self.registry.iter() {
            state.apps.push(UsageRecord {
                app_id: app.id.clone(),
                uses_consumed_today: app.uses_consumed_today,
                last_quota_reset_date: app.last_quota_reset_date,
            });
        }

        let mut unlocked: Vec<&AccessSession> = self
            .sessions
            .values()
            .filter(|s| s.state == AccessState::Unlocked)
            .collect();
        unlocked.sort_by(|a, b| a.app_id.cmp(&b.app_id));

        for session in unlocked {
            if let (Some(session_id), Some(started_at)) = (session.session_id, session.started_at) {
                state.sessions.push(SessionRecord {
                    app_id: session.app_id.clone(),
                    session_id,
                    started_at,
                    granted_duration_ms: session.granted_duration_ms,
                });
            }
        }

        state
    }

    /// Overlay that should be on screen right now
    pub fn overlay_request(&self, now: DateTime<Utc>) -> Option<OverlayRequest> {
        if self.observer == ObserverStatus::Unavailable {
            return None;
        }

        let app_id = self.foreground.as_deref()?;
        let app = self.registry.get(app_id)?;
        if !app.enabled {
            return None;
        }

        let variant = match self.sessions.get(app_id)?.state {
            AccessState::QuotaExceeded => OverlayVariant::QuotaExhausted,
            AccessState::Locked => {
                let new_day = app.last_quota_reset_date != day_of(now);
                if new_day || app.has_quota() {
                    OverlayVariant::Blocked
                } else {
                    OverlayVariant::QuotaExhausted
                }
            }
            AccessState::Challenging | AccessState::Unlocked => return None,
        };

        Some(OverlayRequest {
            app_id: app_id.to_string(),
            variant,
        })
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> GateSnapshot {
        let apps = self
            .registry
            .iter()
            .map(|app| AppSnapshot {
                app: app.clone(),
                session: self
                    .sessions
                    .get(&app.id)
                    .cloned()
                    .unwrap_or_else(|| AccessSession::locked(&app.id)),
            })
            .collect();

        GateSnapshot {
            foreground: self.foreground.clone(),
            observer: self.observer,
            overlay: self.overlay_request(now),
            apps,
        }
    }
}

/// Effects that stop whatever a session has in flight
fn teardown(session: &AccessSession) -> Vec<Effect> {
    match session.state {
        AccessState::Challenging => session
            .challenge_id()
            .map(|challenge_id| Effect::CancelChallenge {
                app_id: session.app_id.clone(),
                challenge_id,
            })
            .into_iter()
            .collect(),
        AccessState::Unlocked => session
            .session_id
            .map(|session_id| Effect::CancelTimer {
                app_id: session.app_id.clone(),
                session_id,
            })
            .into_iter()
            .collect(),
        AccessState::Locked | AccessState::QuotaExceeded => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const TARGET: &str = "com.example.target";

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 16, 12, 0, 0).unwrap()
    }

    fn ms(n: i64) -> chrono::Duration {
        chrono::Duration::milliseconds(n)
    }

    fn app(id: &str, quota: u32) -> GatedAppConfig {
        GatedAppConfig {
            id: id.to_string(),
            name: id.to_string(),
            enabled: true,
            daily_quota: quota,
            unlock_minutes: 15,
        }
    }

    fn controller(apps: &[GatedAppConfig]) -> AccessController {
        let registry = GatedAppRegistry::from_config(apps, day_of(start()));
        AccessController::new(registry, ControllerSettings::default())
    }

    fn fg(app_id: &str, at: DateTime<Utc>) -> ForegroundEvent {
        ForegroundEvent {
            app_id: app_id.to_string(),
            timestamp_ms: at.timestamp_millis(),
        }
    }

    fn launched(effects: &[Effect]) -> Option<Uuid> {
        effects.iter().find_map(|e| match e {
            Effect::LaunchChallenge { challenge_id, .. } => Some(*challenge_id),
            _ => None,
        })
    }

    fn started_session(effects: &[Effect]) -> Option<Uuid> {
        effects.iter().find_map(|e| match e {
            Effect::StartTimer { timer, .. } => Some(timer.session_id()),
            _ => None,
        })
    }

    fn notified(effects: &[Effect], want: &Notification) -> bool {
        effects
            .iter()
            .any(|e| matches!(e, Effect::Notify(n) if n == want))
    }

    /// Foreground + pass; returns the session id
    fn unlock(c: &mut AccessController, at: DateTime<Utc>) -> Uuid {
        let effects = c.on_foreground(&fg(TARGET, at), at);
        let challenge_id = launched(&effects).expect("challenge launched");
        let effects = c
            .on_challenge_result(TARGET, challenge_id, ChallengeOutcome::Passed, at)
            .unwrap();
        started_session(&effects).expect("timer started")
    }

    #[test]
    fn ungated_app_is_ignored() {
        let mut c = controller(&[app(TARGET, 3)]);
        let effects = c.on_foreground(&fg("com.other", start()), start());
        assert!(effects.is_empty());
        assert!(c.overlay_request(start()).is_none());
    }

    #[test]
    fn disabled_app_is_ignored() {
        let mut config = app(TARGET, 3);
        config.enabled = false;
        let mut c = controller(&[config]);

        assert!(c.on_foreground(&fg(TARGET, start()), start()).is_empty());
        assert_eq!(c.state_of(TARGET), Some(AccessState::Locked));
    }

    #[test]
    fn foreground_on_locked_app_starts_challenge() {
        let mut c = controller(&[app(TARGET, 3)]);
        let effects = c.on_foreground(&fg(TARGET, start()), start());

        assert!(launched(&effects).is_some());
        assert!(notified(
            &effects,
            &Notification::Interception {
                app_id: TARGET.to_string(),
                timestamp_ms: start().timestamp_millis(),
            }
        ));
        assert_eq!(c.state_of(TARGET), Some(AccessState::Challenging));
        // The quiz covers the screen; no overlay underneath
        assert!(c.overlay_request(start()).is_none());
    }

    #[test]
    fn repeated_foreground_launches_one_challenge() {
        let mut c = controller(&[app(TARGET, 3)]);
        let first = c.on_foreground(&fg(TARGET, start()), start());
        let second = c.on_foreground(&fg(TARGET, start() + ms(10)), start() + ms(10));

        assert!(launched(&first).is_some());
        assert!(launched(&second).is_none());
    }

    #[test]
    fn pass_unlocks_with_full_window() {
        let mut c = controller(&[app(TARGET, 3)]);
        let session_id = unlock(&mut c, start());

        let session = c.session(TARGET).unwrap();
        assert_eq!(session.state, AccessState::Unlocked);
        assert_eq!(session.remaining_ms, session.granted_duration_ms);
        assert_eq!(session.granted_duration_ms, 900_000);
        assert_eq!(session.session_id, Some(session_id));
        assert_eq!(c.registry().get(TARGET).unwrap().uses_consumed_today, 1);
    }

    #[test]
    fn unlocked_foreground_is_noop() {
        let mut c = controller(&[app(TARGET, 3)]);
        unlock(&mut c, start());
        assert!(c.on_foreground(&fg(TARGET, start()), start()).is_empty());
    }

    #[test]
    fn fail_and_abandon_relock_and_reengage_overlay() {
        for outcome in [ChallengeOutcome::Failed, ChallengeOutcome::Abandoned] {
            let mut c = controller(&[app(TARGET, 3)]);
            let effects = c.on_foreground(&fg(TARGET, start()), start());
            let challenge_id = launched(&effects).unwrap();

            let effects = c
                .on_challenge_result(TARGET, challenge_id, outcome, start())
                .unwrap();

            assert_eq!(c.state_of(TARGET), Some(AccessState::Locked));
            assert!(notified(
                &effects,
                &Notification::QuizFailed {
                    app_id: TARGET.to_string(),
                    abandoned: outcome == ChallengeOutcome::Abandoned,
                }
            ));
            assert_eq!(
                c.overlay_request(start()).map(|o| o.variant),
                Some(OverlayVariant::Blocked)
            );
            assert_eq!(c.registry().get(TARGET).unwrap().uses_consumed_today, 0);
        }
    }

    #[test]
    fn stale_challenge_result_is_rejected() {
        let mut c = controller(&[app(TARGET, 3)]);
        c.on_foreground(&fg(TARGET, start()), start());

        let err = c
            .on_challenge_result(TARGET, Uuid::new_v4(), ChallengeOutcome::Passed, start())
            .unwrap_err();
        assert!(matches!(err, GateError::StaleEvent { .. }));
        assert_eq!(c.state_of(TARGET), Some(AccessState::Challenging));
    }

    #[test]
    fn expiry_relocks_and_presents_only_if_foreground() {
        let mut c = controller(&[app(TARGET, 3)]);
        let session_id = unlock(&mut c, start());

        let effects = c.on_timer_expired(TARGET, session_id).unwrap();
        assert!(notified(
            &effects,
            &Notification::SessionExpired {
                app_id: TARGET.to_string()
            }
        ));
        assert_eq!(c.state_of(TARGET), Some(AccessState::Locked));
        assert_eq!(c.session(TARGET).unwrap().remaining_ms, 0);
        assert!(c.overlay_request(start()).is_some());

        // Same again, but the user switched away before expiry
        let mut c = controller(&[app(TARGET, 3)]);
        let session_id = unlock(&mut c, start());
        c.on_foreground(&fg("com.other", start() + ms(5)), start() + ms(5));
        c.on_timer_expired(TARGET, session_id).unwrap();
        assert_eq!(c.state_of(TARGET), Some(AccessState::Locked));
        assert!(c.overlay_request(start()).is_none());
    }

    #[test]
    fn stale_timer_expiry_is_ignored() {
        let mut c = controller(&[app(TARGET, 3)]);
        unlock(&mut c, start());
        assert!(c.on_timer_expired(TARGET, Uuid::new_v4()).is_err());
        assert_eq!(c.state_of(TARGET), Some(AccessState::Unlocked));
    }

    #[test]
    fn ticks_never_increase_remaining() {
        let mut c = controller(&[app(TARGET, 3)]);
        let session_id = unlock(&mut c, start());

        c.on_timer_tick(TARGET, session_id, 900_000, 800_000).unwrap();
        c.on_timer_tick(TARGET, session_id, 900_000, 850_000).unwrap();
        assert_eq!(c.session(TARGET).unwrap().remaining_ms, 800_000);
    }

    #[test]
    fn losing_focus_removes_overlay() {
        let mut c = controller(&[app(TARGET, 3)]);
        let effects = c.on_foreground(&fg(TARGET, start()), start());
        let challenge_id = launched(&effects).unwrap();
        c.on_challenge_result(TARGET, challenge_id, ChallengeOutcome::Failed, start())
            .unwrap();
        assert!(c.overlay_request(start()).is_some());

        c.on_foreground_cleared();
        assert_eq!(c.foreground(), None);
        assert!(c.overlay_request(start()).is_none());
        assert_eq!(c.state_of(TARGET), Some(AccessState::Locked));
    }

    #[test]
    fn tick_from_before_extension_is_dropped() {
        let mut c = controller(&[app(TARGET, 3)]);
        let session_id = unlock(&mut c, start());

        c.on_timer_tick(TARGET, session_id, 900_000, 800_000).unwrap();
        c.extend_session(TARGET, 60_000).unwrap();
        assert_eq!(c.session(TARGET).unwrap().remaining_ms, 860_000);

        // Queued before the timer task applied the extension
        c.on_timer_tick(TARGET, session_id, 900_000, 799_000).unwrap();
        assert_eq!(c.session(TARGET).unwrap().remaining_ms, 860_000);

        c.on_timer_tick(TARGET, session_id, 960_000, 858_000).unwrap();
        assert_eq!(c.session(TARGET).unwrap().remaining_ms, 858_000);
    }

    #[test]
    fn out_of_range_extension_is_ignored() {
        let mut c = controller(&[app(TARGET, 3)]);
        unlock(&mut c, start());

        assert!(c.extend_session(TARGET, i64::MAX).unwrap().is_empty());
        assert_eq!(c.session(TARGET).unwrap().granted_duration_ms, 900_000);
    }

    #[test]
    fn unreachable_challenge_deadline_stays_locked() {
        let registry = GatedAppRegistry::from_config(&[app(TARGET, 3)], day_of(start()));
        let settings = ControllerSettings {
            challenge_deadline_ms: i64::MAX,
            tick_ms: 1000,
        };
        let mut c = AccessController::new(registry, settings);

        let effects = c.on_foreground(&fg(TARGET, start()), start());
        assert!(!effects.iter().any(|e| matches!(e, Effect::LaunchChallenge { .. })));
        assert_eq!(c.state_of(TARGET), Some(AccessState::Locked));
        assert!(c.overlay_request(start()).is_some());
    }

    #[test]
    fn huge_challenge_config_does_not_overflow_settings() {
        let mut config = GateConfig::new(vec![app(TARGET, 3)]);
        config.challenge.time_limit_secs = u64::MAX;
        config.challenge.grace_secs = u64::MAX;
        assert_eq!(
            ControllerSettings::from_config(&config).challenge_deadline_ms,
            i64::MAX
        );
    }

    #[test]
    fn sweep_relocks_inconsistent_unlocked_session() {
        let mut c = controller(&[app(TARGET, 3)]);
        let session_id = unlock(&mut c, start());
        if let Some(session) = c.sessions.get_mut(TARGET) {
            session.started_at = None;
        }

        let effects = c.sweep(start() + ms(1000));
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::CancelTimer { session_id: id, .. } if *id == session_id
        )));
        assert_eq!(c.state_of(TARGET), Some(AccessState::Locked));
    }

    #[test]
    fn extend_adds_time() {
        let mut c = controller(&[app(TARGET, 3)]);
        let session_id = unlock(&mut c, start());

        let effects = c.extend_session(TARGET, 60_000).unwrap();
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::ExtendTimer { session_id: id, additional_ms: 60_000, .. } if *id == session_id
        )));
        let session = c.session(TARGET).unwrap();
        assert_eq!(session.granted_duration_ms, 960_000);
        assert_eq!(session.remaining_ms, 960_000);

        c.relock(TARGET).unwrap();
        assert!(c.extend_session(TARGET, 60_000).is_err());
    }

    #[test]
    fn quota_scenario_three_unlocks_then_exceeded() {
        let mut c = controller(&[app(TARGET, 3)]);
        let mut now = start();

        for round in 1..=3 {
            let session_id = unlock(&mut c, now);
            assert_eq!(c.session(TARGET).unwrap().remaining_ms, 900_000);
            now += ms(900_000);
            c.on_timer_expired(TARGET, session_id).unwrap();
            assert_eq!(c.state_of(TARGET), Some(AccessState::Locked));
            assert_eq!(c.registry().get(TARGET).unwrap().uses_consumed_today, round);
        }

        let effects = c.on_foreground(&fg(TARGET, now), now);
        assert!(launched(&effects).is_none());
        assert_eq!(c.state_of(TARGET), Some(AccessState::QuotaExceeded));
        assert_eq!(
            c.overlay_request(now).map(|o| o.variant),
            Some(OverlayVariant::QuotaExhausted)
        );
    }

    #[test]
    fn quota_resets_next_day() {
        let mut c = controller(&[app(TARGET, 1)]);
        let session_id = unlock(&mut c, start());
        c.on_timer_expired(TARGET, session_id).unwrap();
        c.on_foreground(&fg(TARGET, start()), start());
        assert_eq!(c.state_of(TARGET), Some(AccessState::QuotaExceeded));

        let tomorrow = start() + chrono::Duration::hours(24);
        c.on_foreground(&fg("com.other", tomorrow), tomorrow);
        let effects = c.on_foreground(&fg(TARGET, tomorrow), tomorrow);

        assert!(launched(&effects).is_some());
        assert_eq!(c.registry().get(TARGET).unwrap().uses_consumed_today, 0);
    }

    #[test]
    fn pass_after_quota_lowered_stays_locked() {
        let mut c = controller(&[app(TARGET, 3)]);
        let effects = c.on_foreground(&fg(TARGET, start()), start());
        let challenge_id = launched(&effects).unwrap();

        c.set_quota(TARGET, 0, start()).unwrap();
        let effects = c
            .on_challenge_result(TARGET, challenge_id, ChallengeOutcome::Passed, start())
            .unwrap();

        assert!(started_session(&effects).is_none());
        assert_eq!(c.state_of(TARGET), Some(AccessState::QuotaExceeded));
        assert_eq!(c.registry().get(TARGET).unwrap().uses_consumed_today, 0);
    }

    #[test]
    fn raising_quota_clears_exceeded() {
        let mut c = controller(&[app(TARGET, 0)]);
        c.on_foreground(&fg(TARGET, start()), start());
        assert_eq!(c.state_of(TARGET), Some(AccessState::QuotaExceeded));

        c.set_quota(TARGET, 2, start()).unwrap();
        assert_eq!(c.state_of(TARGET), Some(AccessState::Locked));
    }

    #[test]
    fn sweep_abandons_overdue_challenge() {
        let mut c = controller(&[app(TARGET, 3)]);
        let effects = c.on_foreground(&fg(TARGET, start()), start());
        let challenge_id = launched(&effects).unwrap();

        assert!(c.sweep(start() + ms(300_000)).is_empty());

        let effects = c.sweep(start() + ms(360_000));
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::CancelChallenge { challenge_id: id, .. } if *id == challenge_id
        )));
        assert_eq!(c.state_of(TARGET), Some(AccessState::Locked));
    }

    #[test]
    fn sweep_expires_session_when_timer_missed() {
        let mut c = controller(&[app(TARGET, 3)]);
        let session_id = unlock(&mut c, start());

        assert!(c.sweep(start() + ms(900_500)).is_empty());
        let effects = c.sweep(start() + ms(901_000));

        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::CancelTimer { session_id: id, .. } if *id == session_id
        )));
        assert_eq!(c.state_of(TARGET), Some(AccessState::Locked));
    }

    #[test]
    fn observer_loss_fails_open() {
        let mut c = controller(&[app(TARGET, 3), app("com.locked", 3)]);
        unlock(&mut c, start());
        c.on_foreground(&fg("com.locked", start()), start());
        let challenge = c.session("com.locked").unwrap().challenge_id().unwrap();
        c.on_challenge_result("com.locked", challenge, ChallengeOutcome::Failed, start())
            .unwrap();
        assert!(c.overlay_request(start()).is_some());

        let effects = c.on_observer_unavailable("accessibility permission revoked");
        assert!(matches!(effects.as_slice(), [Effect::PromptPermission { .. }]));
        assert_eq!(c.state_of(TARGET), Some(AccessState::Unlocked));
        assert!(c.overlay_request(start()).is_none());

        // Reported once
        assert!(c.on_observer_unavailable("again").is_empty());

        c.on_foreground(&fg("com.locked", start()), start());
        assert_eq!(c.observer_status(), ObserverStatus::Available);
    }

    #[test]
    fn disabling_cancels_and_removes_overlay() {
        let mut c = controller(&[app(TARGET, 3)]);
        let effects = c.on_foreground(&fg(TARGET, start()), start());
        let challenge_id = launched(&effects).unwrap();

        let effects = c.set_enabled(TARGET, false, start()).unwrap();
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::CancelChallenge { challenge_id: id, .. } if *id == challenge_id
        )));
        assert_eq!(c.state_of(TARGET), Some(AccessState::Locked));
        assert!(c.overlay_request(start()).is_none());

        // A late result for the cancelled challenge is stale
        assert!(
            c.on_challenge_result(TARGET, challenge_id, ChallengeOutcome::Passed, start())
                .is_err()
        );
    }

    #[test]
    fn disabling_unlocked_cancels_timer() {
        let mut c = controller(&[app(TARGET, 3)]);
        let session_id = unlock(&mut c, start());

        let effects = c.set_enabled(TARGET, false, start()).unwrap();
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::CancelTimer { session_id: id, .. } if *id == session_id
        )));
    }

    #[test]
    fn enabling_foreground_app_intercepts_it() {
        let mut config = app(TARGET, 3);
        config.enabled = false;
        let mut c = controller(&[config]);
        c.on_foreground(&fg(TARGET, start()), start());

        let effects = c.set_enabled(TARGET, true, start()).unwrap();
        assert!(launched(&effects).is_some());
    }

    #[test]
    fn apply_config_removes_and_adds_apps() {
        let mut c = controller(&[app(TARGET, 3)]);
        let session_id = unlock(&mut c, start());

        let effects = c.apply_config(&[app("com.new", 2)], start());
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::CancelTimer { session_id: id, .. } if *id == session_id
        )));
        assert!(c.session(TARGET).is_none());
        assert_eq!(c.state_of("com.new"), Some(AccessState::Locked));
    }

    #[test]
    fn challenge_request_needs_foreground() {
        let mut c = controller(&[app(TARGET, 3)]);
        assert!(c.on_challenge_requested(TARGET, start()).is_err());

        c.on_foreground(&fg(TARGET, start()), start());
        let challenge = c.session(TARGET).unwrap().challenge_id().unwrap();
        c.on_challenge_result(TARGET, challenge, ChallengeOutcome::Failed, start())
            .unwrap();

        let effects = c.on_challenge_requested(TARGET, start()).unwrap();
        assert!(launched(&effects).is_some());
    }

    #[test]
    fn state_round_trips_through_restore() {
        let mut c = controller(&[app(TARGET, 3)]);
        let session_id = unlock(&mut c, start());
        let later = start() + ms(300_000);
        let state = c.to_state(later);

        let mut restored = controller(&[app(TARGET, 3)]);
        let effects = restored.restore(&state, later);

        assert_eq!(started_session(&effects), Some(session_id));
        let session = restored.session(TARGET).unwrap();
        assert_eq!(session.state, AccessState::Unlocked);
        assert_eq!(session.remaining_ms, 600_000);
        assert_eq!(restored.registry().get(TARGET).unwrap().uses_consumed_today, 1);
    }

    #[test]
    fn restore_drops_expired_sessions_and_challenges() {
        let mut c = controller(&[app(TARGET, 3), app("com.quiz", 3)]);
        unlock(&mut c, start());
        c.on_foreground(&fg("com.quiz", start()), start());
        let state = c.to_state(start());
        assert_eq!(state.sessions.len(), 1);

        let mut restored = controller(&[app(TARGET, 3), app("com.quiz", 3)]);
        let effects = restored.restore(&state, start() + ms(900_000));

        assert!(effects.is_empty());
        assert_eq!(restored.state_of(TARGET), Some(AccessState::Locked));
        assert_eq!(restored.state_of("com.quiz"), Some(AccessState::Locked));
    }

    #[test]
    fn invariants_hold_over_event_sequences() {
        let apps = [app(TARGET, 2), app("com.b", 1), app("com.c", 0)];
        let ids = [TARGET, "com.b", "com.c", "com.ungated"];
        let mut c = controller(&apps);
        let mut now = start();
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;

        for _ in 0..2000 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            let id = ids[(seed % ids.len() as u64) as usize];
            now += ms((seed % 120_000) as i64);

            match (seed >> 8) % 6 {
                0 | 1 => {
                    c.on_foreground(&fg(id, now), now);
                }
                2 => {
                    if let Some(challenge) = c.session(id).and_then(|s| s.challenge_id()) {
                        let outcome = match (seed >> 16) % 3 {
                            0 => ChallengeOutcome::Passed,
                            1 => ChallengeOutcome::Failed,
                            _ => ChallengeOutcome::Abandoned,
                        };
                        let _ = c.on_challenge_result(id, challenge, outcome, now);
                    }
                }
                3 => {
                    if let Some(session_id) = c.session(id).and_then(|s| s.session_id) {
                        let _ = c.on_timer_expired(id, session_id);
                    }
                }
                4 => {
                    c.sweep(now);
                }
                _ => {
                    let _ = c.relock(id);
                }
            }

            for app in c.registry().iter() {
                assert!(app.uses_consumed_today <= app.daily_quota_uses);
                let session = c.session(&app.id).unwrap();
                match session.state {
                    AccessState::Challenging => {
                        assert!(session.challenge.is_some());
                        assert!(session.session_id.is_none());
                    }
                    AccessState::Unlocked => {
                        assert!(session.challenge.is_none());
                        assert!(session.session_id.is_some());
                    }
                    AccessState::Locked | AccessState::QuotaExceeded => {
                        assert!(session.challenge.is_none());
                        assert!(session.session_id.is_none());
                        assert_eq!(session.remaining_ms, 0);
                    }
                }
            }
        }
    }
}
