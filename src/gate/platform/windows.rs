use crate::gate::error::{GateError, GateResult};

/// Not implemented on Windows; use the stdin observer source instead.
pub fn frontmost_app() -> GateResult<Option<String>> {
    Err(GateError::ObserverUnavailable(
        "frontmost app detection is not supported on Windows".to_string(),
    ))
}
