/// Quiz-gated access to apps
///
/// This module provides functionality to:
/// - Observe which app is in the foreground
/// - Intercept gated apps behind a block overlay
/// - Unlock an app for a timed window after a passed quiz
/// - Enforce a daily quota of unlocks per app
/// - Persist usage and live sessions across restarts

pub mod challenge;
pub mod clock;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod notify;
pub mod observer;
pub mod overlay;
pub mod platform;
pub mod registry;
pub mod service;
pub mod session;
pub mod state;
pub mod timer;

pub use challenge::{ChallengeLauncher, CommandChallengeLauncher, NoChallenge};
pub use clock::{Clock, SystemClock};
pub use config::{GateConfig, GatedAppConfig, ObserverSource};
pub use controller::{AccessController, ControllerSettings, GateSnapshot};
pub use error::{GateError, GateResult};
pub use events::{Notification, NotificationBus};
pub use notify::DesktopPrompt;
pub use observer::{ForegroundObserver, LineSource, PollingSource, SystemProbe};
pub use overlay::{CommandOverlay, LogOverlay, OverlayPresenter, OverlaySurface};
pub use registry::GatedAppRegistry;
pub use service::{GateHandle, GateQueue, GateService};
pub use session::AccessState;
pub use state::StateStore;
