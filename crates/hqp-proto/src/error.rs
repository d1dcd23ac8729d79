use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::ParseError;

/// Coarse classification of a [`ControlError`], stable enough to put on the
/// wire (switch results, HTTP error bodies).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidArgument,
    TransportUnavailable,
    ProtocolError,
    Rejected,
    ProfileNotFound,
    ActivationFailed,
    RestartFailed,
    SwitchInProgress,
    StoreUnavailable,
}

impl ErrorKind {
    /// True for conditions a caller may reasonably retry later.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorKind::TransportUnavailable
                | ErrorKind::SwitchInProgress
                | ErrorKind::StoreUnavailable
        )
    }
}

#[derive(Debug, Clone, Error)]
pub enum ControlError {
    /// Caller error: bad volume value, malformed profile id, unknown command.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Connection refused, reset or timed out on the control port.
    #[error("control port {addr} unavailable: {reason}")]
    TransportUnavailable { addr: String, reason: String },

    /// The daemon answered with something that is not a well-formed reply.
    #[error("protocol error: {reason} (raw: {:?})", String::from_utf8_lossy(.raw))]
    ProtocolError { reason: String, raw: Vec<u8> },

    /// The daemon understood the command and answered `result="Error"`.
    #[error("{command} rejected: {message}")]
    Rejected { command: String, message: String },

    #[error("profile not found: {0}")]
    ProfileNotFound(String),

    #[error("activation of profile '{id}' failed: {reason}")]
    ActivationFailed { id: String, reason: String },

    #[error("service restart failed: {0}")]
    RestartFailed(String),

    #[error("a profile switch is already in progress on {0}")]
    SwitchInProgress(String),

    #[error("profile store unavailable: {0}")]
    StoreUnavailable(String),
}

impl ControlError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ControlError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            ControlError::TransportUnavailable { .. } => ErrorKind::TransportUnavailable,
            ControlError::ProtocolError { .. } => ErrorKind::ProtocolError,
            ControlError::Rejected { .. } => ErrorKind::Rejected,
            ControlError::ProfileNotFound(_) => ErrorKind::ProfileNotFound,
            ControlError::ActivationFailed { .. } => ErrorKind::ActivationFailed,
            ControlError::RestartFailed(_) => ErrorKind::RestartFailed,
            ControlError::SwitchInProgress(_) => ErrorKind::SwitchInProgress,
            ControlError::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        ControlError::InvalidArgument(message.into())
    }

    pub fn transport(addr: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        ControlError::TransportUnavailable {
            addr: addr.into(),
            reason: reason.to_string(),
        }
    }

    pub fn protocol(reason: impl Into<String>, raw: impl Into<Vec<u8>>) -> Self {
        ControlError::ProtocolError {
            reason: reason.into(),
            raw: raw.into(),
        }
    }
}

impl From<ParseError> for ControlError {
    fn from(err: ParseError) -> Self {
        ControlError::ProtocolError {
            reason: err.reason,
            raw: err.raw,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            ControlError::transport("host:4321", "refused").kind(),
            ErrorKind::TransportUnavailable
        );
        assert_eq!(
            ControlError::SwitchInProgress("host".into()).kind(),
            ErrorKind::SwitchInProgress
        );
        assert!(ErrorKind::TransportUnavailable.is_transient());
        assert!(!ErrorKind::ProtocolError.is_transient());
    }

    #[test]
    fn test_protocol_error_keeps_raw_bytes() {
        let err: ControlError = ParseError::new("bad root", b"<Sta".to_vec()).into();
        match &err {
            ControlError::ProtocolError { raw, .. } => assert_eq!(raw, b"<Sta"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(err.to_string().contains("<Sta"));
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::ProfileNotFound).unwrap();
        assert_eq!(json, "\"profile_not_found\"");
    }
}
