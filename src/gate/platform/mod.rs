/// Platform-specific frontmost-app detection

#[cfg(target_os = "windows")]
pub mod windows;

#[cfg(target_os = "macos")]
pub mod macos;

#[cfg(target_os = "linux")]
pub mod linux;

use crate::gate::error::GateResult;

/// Identifier of the frontmost app, or `None` when nothing has focus.
///
/// Errors with `ObserverUnavailable` when the platform capability is
/// missing (tool not installed, permission denied).
pub fn frontmost_app() -> GateResult<Option<String>> {
    #[cfg(target_os = "windows")]
    {
        windows::frontmost_app()
    }

    #[cfg(target_os = "macos")]
    {
        macos::frontmost_app()
    }

    #[cfg(target_os = "linux")]
    {
        linux::frontmost_app()
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        Err(crate::gate::error::GateError::ObserverUnavailable(
            "unsupported operating system".to_string(),
        ))
    }
}

/// Trim probe output down to an app id
pub(crate) fn parse_app_id(output: &[u8]) -> Option<String> {
    let id = String::from_utf8_lossy(output).trim().to_string();
    (!id.is_empty()).then_some(id)
}
