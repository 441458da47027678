use anyhow::Result;
use tracing::warn;

/// Asks the user to restore the foreground-observation capability
pub trait PermissionPrompt: Send + Sync {
    fn request_permission(&self, reason: &str) -> Result<()>;
}

/// Desktop notification pointing the user at the missing permission
#[derive(Debug, Default, Clone, Copy)]
pub struct DesktopPrompt;

impl DesktopPrompt {
    const TITLE: &'static str = "Quizlock cannot see the active app";

    fn message(reason: &str) -> String {
        format!(
            "Gated apps are not being blocked ({}). Grant the permission to turn gating back on.",
            reason
        )
    }
}

impl PermissionPrompt for DesktopPrompt {
    fn request_permission(&self, reason: &str) -> Result<()> {
        let message = Self::message(reason);

        #[cfg(target_os = "linux")]
        {
            use std::process::Command;
            Command::new("notify-send")
                .arg(Self::TITLE)
                .arg(&message)
                .arg("--urgency=critical")
                .arg("--icon=dialog-warning")
                .output()?;
        }

        #[cfg(target_os = "macos")]
        {
            use std::process::Command;
            let script = format!(
                "display notification \"{}\" with title \"{}\"",
                message.replace('"', "'"),
                Self::TITLE
            );
            Command::new("osascript").arg("-e").arg(&script).output()?;
            // Opens the pane where the permission is granted
            Command::new("open")
                .arg("x-apple.systempreferences:com.apple.preference.security?Privacy_Automation")
                .output()?;
        }

        #[cfg(not(any(target_os = "linux", target_os = "macos")))]
        {
            warn!("{}: {}", Self::TITLE, message);
        }

        Ok(())
    }
}

/// Prompt that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPrompt;

impl PermissionPrompt for LogPrompt {
    fn request_permission(&self, reason: &str) -> Result<()> {
        warn!("Foreground observation unavailable: {}", reason);
        Ok(())
    }
}

#[cfg(test)]
pub use recording::RecordingPrompt;


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_includes_reason() {
        assert!(DesktopPrompt::message("xdotool missing").contains("xdotool missing"));
    }
}
