//! Unified error handling for the enablement engine.
//!
//! Every internal decode, settings or inquiry failure is mapped into the
//! [`EnableError`] taxonomy at the store/manager boundary; no raw backend
//! error ever crosses it.

use thiserror::Error;

/// Errors surfaced by the enablement policy engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnableError {
    /// A caller-supplied argument failed validation (e.g. empty bundle name).
    #[error("invalid argument: {0}")]
    Validation(String),

    /// The IME is not installed, or not tracked for this user.
    #[error("input method not found: {0}")]
    NotFound(String),

    /// The operation is forbidden by policy (e.g. disabling the default IME).
    #[error("operation not allowed: {0}")]
    Disallowed(String),

    /// The settings backend is not ready or the enablement feature is off.
    #[error("enablement backend unavailable")]
    BackendUnavailable,

    /// Stored enable data failed to decode.
    #[error("corrupt enable data: {0}")]
    CorruptData(String),

    /// Marshalling a table failed; the write was aborted.
    #[error("enable data serialization failed: {0}")]
    Serialization(String),
}

impl EnableError {
    /// Stable error code string for logging and metrics labeling.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_failure",
            Self::NotFound(_) => "not_found",
            Self::Disallowed(_) => "disallowed_operation",
            Self::BackendUnavailable => "backend_unavailable",
            Self::CorruptData(_) => "corrupt_data",
            Self::Serialization(_) => "serialization_failure",
        }
    }
}

/// Result type for enablement operations.
pub type EnableResult<T> = Result<T, EnableError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(EnableError::Validation("x".into()).error_code(), "validation_failure");
        assert_eq!(EnableError::NotFound("b".into()).error_code(), "not_found");
        assert_eq!(EnableError::BackendUnavailable.error_code(), "backend_unavailable");
        assert_eq!(EnableError::CorruptData("bad".into()).error_code(), "corrupt_data");
    }

    #[test]
    fn test_display_carries_context() {
        let err = EnableError::NotFound("com.example.ime".into());
        assert_eq!(err.to_string(), "input method not found: com.example.ime");

        let err = EnableError::Disallowed("the system default ime cannot be disabled".into());
        assert!(err.to_string().contains("not allowed"));
    }
}
