use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::gate::config::ChallengeConfig;
use crate::gate::error::{GateError, GateResult};
use crate::gate::events::ChallengeOutcome;

/// Runs one quiz for an app and reports how it ended
///
/// The quiz content is opaque to the gate. Dropping the returned future
/// cancels the challenge.
#[async_trait]
pub trait ChallengeLauncher: Send + Sync {
    async fn run(&self, app_id: &str, challenge_id: Uuid) -> GateResult<ChallengeOutcome>;
}

/// Launches an external quiz program
///
/// Exit code 0 means passed, 1 means failed, anything else (signal, crash,
/// user closed the window) is abandoned. The program is killed when the
/// deadline passes or the challenge is cancelled.
pub struct CommandChallengeLauncher {
    program: String,
    args: Vec<String>,
    deadline: Duration,
}

impl CommandChallengeLauncher {
    pub fn new(program: String, args: Vec<String>, deadline: Duration) -> Self {
        Self {
            program,
            args,
            deadline,
        }
    }

    pub fn from_config(config: &ChallengeConfig) -> Option<Self> {
        let program = config.command.clone()?;
        Some(Self::new(program, config.args.clone(), config.deadline()))
    }
}

#[async_trait]
impl ChallengeLauncher for CommandChallengeLauncher {
    async fn run(&self, app_id: &str, challenge_id: Uuid) -> GateResult<ChallengeOutcome> {
        debug!("Launching {} for {} ({})", self.program, app_id, challenge_id);

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(app_id)
            .env("QUIZLOCK_APP_ID", app_id)
            .env("QUIZLOCK_CHALLENGE_ID", challenge_id.to_string())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| GateError::ChallengeAbandoned {
                app_id: app_id.to_string(),
                reason: format!("failed to start {}: {}", self.program, e),
            })?;

        let status = match tokio::time::timeout(self.deadline, child.wait()).await {
            Ok(status) => status.map_err(|e| GateError::ChallengeAbandoned {
                app_id: app_id.to_string(),
                reason: format!("failed to wait on quiz: {}", e),
            })?,
            Err(_) => {
                let _ = child.kill().await;
                return Err(GateError::ChallengeAbandoned {
                    app_id: app_id.to_string(),
                    reason: format!("no result within {}s", self.deadline.as_secs()),
                });
            }
        };

        let outcome = match status.code() {
            Some(0) => ChallengeOutcome::Passed,
            Some(1) => ChallengeOutcome::Failed,
            _ => {
                warn!("Quiz for {} ended without a result: {}", app_id, status);
                ChallengeOutcome::Abandoned
            }
        };

        info!("Quiz for {} finished: {:?}", app_id, outcome);
        Ok(outcome)
    }
}

/// Launcher used when no quiz program is configured: every challenge is
/// abandoned, so gated apps stay locked.
#[derive(Debug, Default)]
pub struct NoChallenge;

#[async_trait]
impl ChallengeLauncher for NoChallenge {
    async fn run(&self, app_id: &str, _challenge_id: Uuid) -> GateResult<ChallengeOutcome> {
        Err(GateError::ChallengeAbandoned {
            app_id: app_id.to_string(),
            reason: "no quiz program configured".to_string(),
        })
    }
}
