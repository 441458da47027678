use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::gate::challenge::ChallengeLauncher;
use crate::gate::clock::Clock;
use crate::gate::config::GatedAppConfig;
use crate::gate::controller::{AccessController, Effect, GateSnapshot};
use crate::gate::error::{GateError, GateResult};
use crate::gate::events::{ChallengeOutcome, ForegroundEvent, GateEvent, NotificationBus};
use crate::gate::notify::{LogPrompt, PermissionPrompt};
use crate::gate::overlay::OverlayPresenter;
use crate::gate::state::StateStore;
use crate::gate::timer::{TimerHandle, spawn_timer};

/// The gate's event queue
///
/// Created before the service so adapters that feed events back (the
/// overlay's "take quiz" button) can hold a sender.
pub struct GateQueue {
    tx: mpsc::UnboundedSender<GateEvent>,
    rx: mpsc::UnboundedReceiver<GateEvent>,
}

impl GateQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<GateEvent> {
        self.tx.clone()
    }
}

impl Default for GateQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable handle for talking to a running gate service
#[derive(Debug, Clone)]
pub struct GateHandle {
    tx: mpsc::UnboundedSender<GateEvent>,
}

impl GateHandle {
    fn send(&self, event: GateEvent) -> GateResult<()> {
        self.tx.send(event).map_err(|_| GateError::ChannelClosed)
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<GateEvent> {
        self.tx.clone()
    }

    pub fn foreground(&self, app_id: &str, timestamp_ms: i64) -> GateResult<()> {
        self.send(GateEvent::Foreground(ForegroundEvent {
            app_id: app_id.to_string(),
            timestamp_ms,
        }))
    }

    pub fn request_challenge(&self, app_id: &str) -> GateResult<()> {
        self.send(GateEvent::ChallengeRequested {
            app_id: app_id.to_string(),
        })
    }

    pub fn extend_session(&self, app_id: &str, additional_ms: i64) -> GateResult<()> {
        self.send(GateEvent::ExtendSession {
            app_id: app_id.to_string(),
            additional_ms,
        })
    }

    pub fn relock(&self, app_id: &str) -> GateResult<()> {
        self.send(GateEvent::Relock {
            app_id: app_id.to_string(),
        })
    }

    pub fn apply_config(&self, apps: Vec<GatedAppConfig>) -> GateResult<()> {
        self.send(GateEvent::ApplyConfig(apps))
    }

    pub fn set_enabled(&self, app_id: &str, enabled: bool) -> GateResult<()> {
        self.send(GateEvent::SetEnabled {
            app_id: app_id.to_string(),
            enabled,
        })
    }

    pub fn set_quota(&self, app_id: &str, daily_quota: u32) -> GateResult<()> {
        self.send(GateEvent::SetQuota {
            app_id: app_id.to_string(),
            daily_quota,
        })
    }

    pub fn set_unlock_duration(&self, app_id: &str, unlock_duration_ms: i64) -> GateResult<()> {
        self.send(GateEvent::SetUnlockDuration {
            app_id: app_id.to_string(),
            unlock_duration_ms,
        })
    }

    pub async fn snapshot(&self) -> GateResult<GateSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(GateEvent::Snapshot(reply))?;
        rx.await.map_err(|_| GateError::ChannelClosed)
    }

    pub fn shutdown(&self) -> GateResult<()> {
        self.send(GateEvent::Shutdown)
    }
}

struct RunningChallenge {
    challenge_id: Uuid,
    abort: AbortHandle,
}

/// Single-writer actor owning all gate state
///
/// Every input (foreground changes, challenge results, timer ticks, control
/// commands) goes through one queue and is applied in order. After each
/// event the overlay is reconciled with the controller's view.
pub struct GateService {
    controller: AccessController,
    presenter: OverlayPresenter,
    launcher: Arc<dyn ChallengeLauncher>,
    prompt: Arc<dyn PermissionPrompt>,
    bus: NotificationBus,
    store: Option<StateStore>,
    clock: Arc<dyn Clock>,
    timers: HashMap<String, TimerHandle>,
    challenges: HashMap<String, RunningChallenge>,
    tx: mpsc::UnboundedSender<GateEvent>,
    rx: Option<mpsc::UnboundedReceiver<GateEvent>>,
    tick: Duration,
    sweep_interval: Duration,
}

impl GateService {
    pub fn new(
        controller: AccessController,
        presenter: OverlayPresenter,
        launcher: Arc<dyn ChallengeLauncher>,
        clock: Arc<dyn Clock>,
        queue: GateQueue,
    ) -> Self {
        let tick = Duration::from_millis(controller.settings().tick_ms.max(1) as u64);

        Self {
            controller,
            presenter,
            launcher,
            prompt: Arc::new(LogPrompt),
            bus: NotificationBus::default(),
            store: None,
            clock,
            timers: HashMap::new(),
            challenges: HashMap::new(),
            tx: queue.tx,
            rx: Some(queue.rx),
            tick,
            sweep_interval: tick,
        }
    }

    pub fn with_prompt(mut self, prompt: Arc<dyn PermissionPrompt>) -> Self {
        self.prompt = prompt;
        self
    }

    pub fn with_bus(mut self, bus: NotificationBus) -> Self {
        self.bus = bus;
        self
    }

    pub fn with_store(mut self, store: StateStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }

    pub fn handle(&self) -> GateHandle {
        GateHandle {
            tx: self.tx.clone(),
        }
    }

    pub fn bus(&self) -> &NotificationBus {
        &self.bus
    }

    /// Process events until a `Shutdown` arrives
    ///
    /// The service keeps a sender of its own for the timer and challenge
    /// tasks it spawns, so dropping every `GateHandle` does not end the
    /// loop. Send `Shutdown` (or abort the task) to stop it.
    pub async fn run(mut self) -> Result<()> {
        let Some(mut rx) = self.rx.take() else {
            anyhow::bail!("Gate service event queue already taken");
        };

        self.restore();

        let mut sweep = time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Gate service started");

        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(GateEvent::Shutdown) => break,
                    // Only reachable if the service's own sender is gone
                    None => break,
                    Some(event) => self.handle_event(event),
                },
                _ = sweep.tick() => {
                    let effects = self.controller.sweep(self.clock.now());
                    self.execute(effects);
                }
            }

            let desired = self.controller.overlay_request(self.clock.now());
            self.presenter.reconcile(desired);
        }

        self.stop();
        info!("Gate service stopped");
        Ok(())
    }

    fn restore(&mut self) {
        let Some(store) = &self.store else {
            return;
        };

        match store.load() {
            Ok(Some(state)) => {
                let effects = self.controller.restore(&state, self.clock.now());
                self.execute(effects);
            }
            Ok(None) => debug!("No saved gate state"),
            Err(e) => warn!("Ignoring unreadable gate state: {:#}", e),
        }
    }

    fn stop(&mut self) {
        for (_, challenge) in self.challenges.drain() {
            challenge.abort.abort();
        }
        for (_, timer) in self.timers.drain() {
            timer.cancel();
        }
        self.persist();
        self.presenter.dismiss();
    }

    fn handle_event(&mut self, event: GateEvent) {
        let now = self.clock.now();

        let (app_id, result) = match event {
            GateEvent::Foreground(event) => {
                let effects = self.controller.on_foreground(&event, now);
                (Some(event.app_id), Ok(effects))
            }
            GateEvent::ForegroundCleared { .. } => (None, Ok(self.controller.on_foreground_cleared())),
            GateEvent::ObserverUnavailable { reason } => {
                (None, Ok(self.controller.on_observer_unavailable(&reason)))
            }
            GateEvent::ChallengeRequested { app_id } => {
                let result = self.controller.on_challenge_requested(&app_id, now);
                (Some(app_id), result)
            }
            GateEvent::ChallengeFinished {
                app_id,
                challenge_id,
                outcome,
            } => {
                if self
                    .challenges
                    .get(&app_id)
                    .is_some_and(|c| c.challenge_id == challenge_id)
                {
                    self.challenges.remove(&app_id);
                }
                let result = self
                    .controller
                    .on_challenge_result(&app_id, challenge_id, outcome, now);
                (Some(app_id), result)
            }
            GateEvent::TimerTick {
                app_id,
                session_id,
                granted_ms,
                remaining_ms,
            } => {
                let result =
                    self.controller
                        .on_timer_tick(&app_id, session_id, granted_ms, remaining_ms);
                (Some(app_id), result)
            }
            GateEvent::TimerExpired { app_id, session_id } => {
                if self
                    .timers
                    .get(&app_id)
                    .is_some_and(|t| t.session_id() == session_id)
                {
                    self.timers.remove(&app_id);
                }
                let result = self.controller.on_timer_expired(&app_id, session_id);
                (Some(app_id), result)
            }
            GateEvent::ExtendSession {
                app_id,
                additional_ms,
            } => {
                let result = self.controller.extend_session(&app_id, additional_ms);
                (Some(app_id), result)
            }
            GateEvent::Relock { app_id } => {
                let result = self.controller.relock(&app_id);
                (Some(app_id), result)
            }
            GateEvent::ApplyConfig(apps) => (None, Ok(self.controller.apply_config(&apps, now))),
            GateEvent::SetEnabled { app_id, enabled } => {
                let result = self.controller.set_enabled(&app_id, enabled, now);
                (Some(app_id), result)
            }
            GateEvent::SetQuota {
                app_id,
                daily_quota,
            } => {
                let result = self.controller.set_quota(&app_id, daily_quota, now);
                (Some(app_id), result)
            }
            GateEvent::SetUnlockDuration {
                app_id,
                unlock_duration_ms,
            } => {
                let result = self
                    .controller
                    .set_unlock_duration(&app_id, unlock_duration_ms);
                (Some(app_id), result)
            }
            GateEvent::Snapshot(reply) => {
                let _ = reply.send(self.controller.snapshot(now));
                (None, Ok(Vec::new()))
            }
            GateEvent::Shutdown => return,
        };

        match result {
            Ok(effects) => self.execute(effects),
            Err(e) if e.fails_closed() => {
                error!("{}; re-locking", e);
                let target = e.app_id().map(str::to_string).or(app_id);
                if let Some(target) = target {
                    let effects = self.controller.fail_closed(&target);
                    self.execute(effects);
                }
            }
            Err(e) => debug!("Ignored: {}", e),
        }
    }

    fn execute(&mut self, effects: Vec<Effect>) {
        let mut persist = false;

        for effect in effects {
            match effect {
                Effect::LaunchChallenge {
                    app_id,
                    challenge_id,
                } => self.launch_challenge(app_id, challenge_id),
                Effect::CancelChallenge {
                    app_id,
                    challenge_id,
                } => {
                    if self
                        .challenges
                        .get(&app_id)
                        .is_some_and(|c| c.challenge_id == challenge_id)
                    {
                        if let Some(challenge) = self.challenges.remove(&app_id) {
                            debug!("Cancelling challenge {} for {}", challenge_id, app_id);
                            challenge.abort.abort();
                        }
                    }
                }
                Effect::StartTimer { app_id, timer } => {
                    if let Some(old) = self.timers.remove(&app_id) {
                        old.cancel();
                    }
                    let handle = spawn_timer(
                        app_id.clone(),
                        timer,
                        self.tick,
                        Arc::clone(&self.clock),
                        self.tx.clone(),
                    );
                    self.timers.insert(app_id, handle);
                }
                Effect::ExtendTimer {
                    app_id,
                    session_id,
                    additional_ms,
                } => {
                    if let Some(timer) = self.timers.get(&app_id) {
                        if timer.session_id() == session_id {
                            timer.extend(additional_ms);
                        }
                    }
                }
                Effect::CancelTimer { app_id, session_id } => {
                    if self
                        .timers
                        .get(&app_id)
                        .is_some_and(|t| t.session_id() == session_id)
                    {
                        if let Some(timer) = self.timers.remove(&app_id) {
                            timer.cancel();
                        }
                    }
                }
                Effect::Notify(notification) => self.bus.emit(notification),
                Effect::PromptPermission { reason } => {
                    if let Err(e) = self.prompt.request_permission(&reason) {
                        warn!("Failed to prompt for permission: {:#}", e);
                    }
                }
                Effect::Persist => persist = true,
            }
        }

        if persist {
            self.persist();
        }
    }

    fn launch_challenge(&mut self, app_id: String, challenge_id: Uuid) {
        if let Some(old) = self.challenges.remove(&app_id) {
            old.abort.abort();
        }

        let launcher = Arc::clone(&self.launcher);
        let id = app_id.clone();
        let quiz = tokio::spawn(async move { launcher.run(&id, challenge_id).await });
        let abort = quiz.abort_handle();

        let events = self.tx.clone();
        let reporting_app = app_id.clone();
        tokio::spawn(async move {
            let outcome = match quiz.await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => {
                    warn!("{}", e);
                    ChallengeOutcome::Abandoned
                }
                Err(e) if e.is_cancelled() => return,
                Err(e) => {
                    error!("Quiz task for {} failed: {}", reporting_app, e);
                    ChallengeOutcome::Abandoned
                }
            };

            let _ = events.send(GateEvent::ChallengeFinished {
                app_id: reporting_app,
                challenge_id,
                outcome,
            });
        });

        self.challenges.insert(
            app_id,
            RunningChallenge {
                challenge_id,
                abort,
            },
        );
    }

    fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };

        let state = self.controller.to_state(self.clock.now());
        if let Err(e) = store.save(&state) {
            error!("Failed to save gate state: {:#}", e);
        }
    }
}
