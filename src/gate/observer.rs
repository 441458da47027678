use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tokio::sync::mpsc;
use tokio::time::{self, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::gate::clock::Clock;
use crate::gate::error::{GateError, GateResult};
use crate::gate::events::{ForegroundEvent, GateEvent};

/// One reading from a foreground source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    Foreground(String),
    /// No app has focus
    NoForeground,
    Unavailable(String),
}

/// Where foreground readings come from
#[async_trait]
pub trait ForegroundSource: Send {
    /// Next reading; `None` once the source is exhausted
    async fn next(&mut self) -> Option<Observation>;
}

/// Synchronous frontmost-app query
pub trait ForegroundProbe: Send + Sync + 'static {
    fn frontmost_app(&self) -> GateResult<Option<String>>;
}

/// Probe backed by the platform module
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl ForegroundProbe for SystemProbe {
    fn frontmost_app(&self) -> GateResult<Option<String>> {
        crate::gate::platform::frontmost_app()
    }
}

/// Polls a probe at a fixed interval
pub struct PollingSource<P: ForegroundProbe> {
    probe: Arc<P>,
    interval: Interval,
}

impl<P: ForegroundProbe> PollingSource<P> {
    pub fn new(probe: P, poll_interval: Duration) -> Self {
        let mut interval = time::interval(poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            probe: Arc::new(probe),
            interval,
        }
    }
}

#[async_trait]
impl<P: ForegroundProbe> ForegroundSource for PollingSource<P> {
    async fn next(&mut self) -> Option<Observation> {
        loop {
            self.interval.tick().await;

            let probe = Arc::clone(&self.probe);
            let reading = match tokio::task::spawn_blocking(move || probe.frontmost_app()).await {
                Ok(reading) => reading,
                Err(e) => Err(GateError::ObserverUnavailable(format!("probe panicked: {}", e))),
            };

            match reading {
                Ok(Some(app_id)) => return Some(Observation::Foreground(app_id)),
                Ok(None) => return Some(Observation::NoForeground),
                Err(GateError::ObserverUnavailable(reason)) => {
                    return Some(Observation::Unavailable(reason));
                }
                Err(e) => return Some(Observation::Unavailable(e.to_string())),
            }
        }
    }
}

/// Reads one app id per line, e.g. from stdin
///
/// A line starting with `!` reports the observer as unavailable, with the
/// rest of the line as the reason. A lone `-` means nothing has focus.
/// Blank lines are skipped.
pub struct LineSource<R> {
    lines: Lines<R>,
}

impl<R: AsyncBufRead + Unpin + Send> LineSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
        }
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> ForegroundSource for LineSource<R> {
    async fn next(&mut self) -> Option<Observation> {
        loop {
            let line = match self.lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return None,
                Err(e) => {
                    warn!("Failed to read foreground line: {}", e);
                    return None;
                }
            };

            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if line == "-" {
                return Some(Observation::NoForeground);
            }

            return Some(match line.strip_prefix('!') {
                Some(reason) => Observation::Unavailable(reason.trim().to_string()),
                None => Observation::Foreground(line.to_string()),
            });
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverState {
    Running,
    Unavailable,
    /// Gate service is gone; nothing more is forwarded
    Disabled,
}

/// Turns raw readings into deduplicated foreground events
///
/// Forwarding never blocks: events go onto the gate's unbounded queue.
pub struct ForegroundObserver {
    events: mpsc::UnboundedSender<GateEvent>,
    last_app: Option<String>,
    last_timestamp_ms: i64,
    state: ObserverState,
}

impl ForegroundObserver {
    pub fn new(events: mpsc::UnboundedSender<GateEvent>) -> Self {
        Self {
            events,
            last_app: None,
            last_timestamp_ms: i64::MIN,
            state: ObserverState::Running,
        }
    }

    pub fn state(&self) -> ObserverState {
        self.state
    }

    /// Accept a reading taken at `timestamp_ms` unless it is out of order
    fn accept(&mut self, timestamp_ms: i64) -> bool {
        if self.state == ObserverState::Disabled {
            return false;
        }

        if timestamp_ms < self.last_timestamp_ms {
            return false;
        }
        self.last_timestamp_ms = timestamp_ms;

        if self.state == ObserverState::Unavailable {
            info!("Foreground readings resumed");
            self.state = ObserverState::Running;
        }
        true
    }

    /// Forward a foreground reading. Returns true if an event was sent.
    pub fn observe(&mut self, app_id: &str, timestamp_ms: i64) -> bool {
        if !self.accept(timestamp_ms) {
            debug!("Dropping foreground reading for {}", app_id);
            return false;
        }

        if self.last_app.as_deref() == Some(app_id) {
            return false;
        }
        self.last_app = Some(app_id.to_string());

        let event = GateEvent::Foreground(ForegroundEvent {
            app_id: app_id.to_string(),
            timestamp_ms,
        });
        self.send(event)
    }

    /// Nothing has focus any more. Returns true if an event was sent.
    pub fn observe_none(&mut self, timestamp_ms: i64) -> bool {
        if !self.accept(timestamp_ms) || self.last_app.is_none() {
            return false;
        }
        self.last_app = None;

        self.send(GateEvent::ForegroundCleared { timestamp_ms })
    }

    /// Report the capability as lost; sent once until readings resume
    pub fn report_unavailable(&mut self, reason: &str) -> bool {
        if self.state != ObserverState::Running {
            return false;
        }

        self.state = ObserverState::Unavailable;
        // The next reading is forwarded even if it repeats the last app
        self.last_app = None;

        self.send(GateEvent::ObserverUnavailable {
            reason: reason.to_string(),
        })
    }

    fn send(&mut self, event: GateEvent) -> bool {
        if self.events.send(event).is_err() {
            warn!("Gate service stopped; disabling foreground observer");
            self.state = ObserverState::Disabled;
            return false;
        }
        true
    }

    /// Drain a source until it ends or the gate service goes away
    pub async fn run<S: ForegroundSource>(mut self, mut source: S, clock: Arc<dyn Clock>) {
        info!("Foreground observer started");

        while let Some(observation) = source.next().await {
            match observation {
                Observation::Foreground(app_id) => {
                    self.observe(&app_id, clock.now().timestamp_millis());
                }
                Observation::NoForeground => {
                    self.observe_none(clock.now().timestamp_millis());
                }
                Observation::Unavailable(reason) => {
                    self.report_unavailable(&reason);
                }
            }

            if self.state == ObserverState::Disabled {
                break;
            }
        }

        info!("Foreground observer stopped");
    }
}
