use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::gate::clock::Clock;
use crate::gate::error::GateError;
use crate::gate::events::GateEvent;

/// Countdown for one access window
///
/// Remaining time is always derived from `started_at + granted_ms` and the
/// current wall clock, never from the number of ticks seen, so a suspended
/// process cannot stretch a session.
#[derive(Debug, Clone)]
pub struct SessionTimer {
    session_id: Uuid,
    started_at: DateTime<Utc>,
    granted_ms: i64,
    tick_ms: i64,
    last_check: Option<DateTime<Utc>>,
    fired: bool,
}

/// Result of one timer check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerReading {
    pub remaining_ms: i64,
    /// True exactly once, on the first check at or after the deadline
    pub fire: bool,
    /// How late this check was, when later than one tick
    pub drift_ms: Option<i64>,
}

impl SessionTimer {
    pub fn new(session_id: Uuid, started_at: DateTime<Utc>, granted_ms: i64, tick_ms: i64) -> Self {
        Self {
            session_id,
            started_at,
            granted_ms,
            tick_ms,
            last_check: None,
            fired: false,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn granted_ms(&self) -> i64 {
        self.granted_ms
    }

    pub fn deadline(&self) -> DateTime<Utc> {
        self.started_at + chrono::Duration::milliseconds(self.granted_ms)
    }

    pub fn remaining_at(&self, now: DateTime<Utc>) -> i64 {
        (self.deadline() - now).num_milliseconds().max(0)
    }

    pub fn extend(&mut self, additional_ms: i64) {
        if !self.fired {
            self.granted_ms += additional_ms.max(0);
        }
    }

    pub fn check(&mut self, now: DateTime<Utc>) -> TimerReading {
        let drift_ms = self.last_check.and_then(|last| {
            let late = (now - last).num_milliseconds() - self.tick_ms;
            (late > self.tick_ms).then_some(late)
        });
        self.last_check = Some(now);

        let remaining_ms = self.remaining_at(now);
        let fire = remaining_ms == 0 && !self.fired;
        if fire {
            self.fired = true;
        }

        TimerReading {
            remaining_ms,
            fire,
            drift_ms,
        }
    }
}

enum TimerControl {
    Extend(i64),
}

/// Handle to a running timer task
#[derive(Debug)]
pub struct TimerHandle {
    session_id: Uuid,
    control: mpsc::UnboundedSender<TimerControl>,
    task: JoinHandle<()>,
}

impl TimerHandle {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn extend(&self, additional_ms: i64) {
        let _ = self.control.send(TimerControl::Extend(additional_ms));
    }

    pub fn cancel(self) {
        self.task.abort();
    }
}

/// Run a timer on its own task, reporting into the gate queue.
///
/// Sends a `TimerTick` every tick and exactly one `TimerExpired`.
pub fn spawn_timer(
    app_id: String,
    timer: SessionTimer,
    tick: Duration,
    clock: Arc<dyn Clock>,
    events: mpsc::UnboundedSender<GateEvent>,
) -> TimerHandle {
    let session_id = timer.session_id();
    let (control, mut control_rx) = mpsc::unbounded_channel();

    let task = tokio::spawn(async move {
        let mut timer = timer;
        let mut interval = time::interval(tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                control = control_rx.recv() => match control {
                    Some(TimerControl::Extend(ms)) => {
                        debug!("Extending session for {} by {}ms", app_id, ms);
                        timer.extend(ms);
                    }
                    None => break,
                },
            }

            let reading = timer.check(clock.now());

            if let Some(drift_ms) = reading.drift_ms {
                let err = GateError::TimerDriftDetected {
                    app_id: app_id.clone(),
                    drift_ms,
                };
                warn!("{}; recomputed from wall clock", err);
            }

            if reading.fire {
                let _ = events.send(GateEvent::TimerExpired {
                    app_id: app_id.clone(),
                    session_id,
                });
                break;
            }

            let tick = GateEvent::TimerTick {
                app_id: app_id.clone(),
                session_id,
                granted_ms: timer.granted_ms(),
                remaining_ms: reading.remaining_ms,
            };
            if events.send(tick).is_err() {
                break;
            }
        }
    });

    TimerHandle {
        session_id,
        control,
        task,
    }
}
