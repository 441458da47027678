use std::process::Command;

use super::parse_app_id;
use crate::gate::error::{GateError, GateResult};

/// Window class of the active X11 window, via xdotool
pub fn frontmost_app() -> GateResult<Option<String>> {
    let output = Command::new("xdotool")
        .args(["getactivewindow", "getwindowclassname"])
        .output()
        .map_err(|e| GateError::ObserverUnavailable(format!("xdotool: {}", e)))?;

    if !output.status.success() {
        // No active window (desktop focused, screen locked)
        return Ok(None);
    }

    Ok(parse_app_id(&output.stdout))
}
