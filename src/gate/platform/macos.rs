use std::process::Command;

use super::parse_app_id;
use crate::gate::error::{GateError, GateResult};

const FRONTMOST_SCRIPT: &str = "tell application \"System Events\" to get bundle identifier of first application process whose frontmost is true";

/// Bundle identifier of the frontmost process, via osascript
pub fn frontmost_app() -> GateResult<Option<String>> {
    let output = Command::new("osascript")
        .arg("-e")
        .arg(FRONTMOST_SCRIPT)
        .output()
        .map_err(|e| GateError::ObserverUnavailable(format!("osascript: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        // -1743: not authorized to send Apple events to System Events
        if stderr.contains("-1743") || stderr.contains("not allowed assistive access") {
            return Err(GateError::ObserverUnavailable(
                "automation permission for System Events was denied".to_string(),
            ));
        }
        return Ok(None);
    }

    Ok(parse_app_id(&output.stdout))
}
