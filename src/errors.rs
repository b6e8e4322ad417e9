use serde::Serialize;
use thiserror::Error;

/// Detail codes surfaced to callers inside `error.details.code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RequestErrorCode {
    #[serde(rename = "MISSING_COMMAND")]
    MissingCommand,
    #[serde(rename = "RAW_COMMAND_MISMATCH")]
    RawCommandMismatch,
}

impl RequestErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestErrorCode::MissingCommand => "MISSING_COMMAND",
            RequestErrorCode::RawCommandMismatch => "RAW_COMMAND_MISMATCH",
        }
    }
}

/// Typed error hierarchy for execgate.
///
/// Use at module boundaries (normalization, approval binding, store writes,
/// executor dispatch). Internal/leaf functions can continue using
/// `anyhow::Result` — the `Internal` variant allows seamless conversion via
/// the `?` operator.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{message}")]
    InvalidRequest {
        code: RequestErrorCode,
        message: String,
    },

    #[error("Approval error: {0}")]
    Approval(String),

    #[error("Allowlist store error: {0}")]
    Store(String),

    #[error("Executor unavailable: {0}")]
    ExecutorUnavailable(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Convenience alias for results using GateError.
pub type GateResult<T> = std::result::Result<T, GateError>;

impl GateError {
    pub fn invalid(code: RequestErrorCode, message: impl Into<String>) -> Self {
        GateError::InvalidRequest {
            code,
            message: message.into(),
        }
    }

    /// Whether this error maps to an `INVALID_REQUEST` reply (request-shape
    /// and approval-binding errors) as opposed to `UNAVAILABLE`.
    pub fn is_request_shaped(&self) -> bool {
        matches!(
            self,
            GateError::InvalidRequest { .. } | GateError::Approval(_) | GateError::Config(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_request_display() {
        let err = GateError::invalid(RequestErrorCode::MissingCommand, "command is required");
        assert_eq!(err.to_string(), "command is required");
    }

    #[test]
    fn detail_codes_render_screaming_snake() {
        assert_eq!(
            RequestErrorCode::RawCommandMismatch.as_str(),
            "RAW_COMMAND_MISMATCH"
        );
        assert_eq!(RequestErrorCode::MissingCommand.as_str(), "MISSING_COMMAND");
    }

    #[test]
    fn approval_errors_are_request_shaped() {
        assert!(GateError::Approval("no record".into()).is_request_shaped());
        assert!(!GateError::ExecutorUnavailable("down".into()).is_request_shaped());
    }

    #[test]
    fn internal_converts_from_anyhow() {
        let err: GateError = anyhow::anyhow!("boom").into();
        assert!(matches!(err, GateError::Internal(_)));
    }
}
