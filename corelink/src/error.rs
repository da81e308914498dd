//! The ten-value error taxonomy visible to callers (§6.3, §7).

use thiserror::Error;

const ERR_TEXT: [&str; 10] = [
    "success",
    "protocol not found",
    "package request fail",
    "socket object lost",
    "socket is busy reading data",
    "write into remote fail",
    "read data from remote fail",
    "read data timeout",
    "parse response fail",
    "timer thread busy",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("success")]
    Ok = 0,
    #[error("protocol not found")]
    ProtocolNotFound = 1,
    #[error("package request fail")]
    AssembleRequestFail = 2,
    #[error("socket object lost")]
    SocketLost = 3,
    #[error("socket is busy reading data")]
    SocketBusy = 4,
    #[error("write into remote fail")]
    WriteFail = 5,
    #[error("read data from remote fail")]
    ReadFail = 6,
    #[error("read data timeout")]
    ReadTimeout = 7,
    #[error("parse response fail")]
    ParseResponseFail = 8,
    #[error("timer thread busy")]
    TimerBusy = 9,
}

impl SessionError {
    pub fn as_code(self) -> i32 {
        self as i32
    }

    pub fn err_text(self) -> &'static str {
        ERR_TEXT[self as usize]
    }

    /// §7: whether a `Session` may retry this outcome on its next
    /// attempt. Timeouts are never retried (risk of duplicating a
    /// server-side effect); flow-control and transport errors are.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            SessionError::SocketLost
                | SessionError::SocketBusy
                | SessionError::WriteFail
                | SessionError::ReadFail
                | SessionError::TimerBusy
        )
    }
}

impl From<corelink_core::error::CoreError> for SessionError {
    fn from(err: corelink_core::error::CoreError) -> Self {
        use corelink_core::error::CoreError;
        match err {
            CoreError::Io(_) | CoreError::ReactorUnavailable => SessionError::SocketLost,
            CoreError::InvalidEndpoint(_) | CoreError::InvalidPoolSize => {
                SessionError::ProtocolNotFound
            }
            CoreError::TimerBusy | CoreError::TimerShutDown => SessionError::TimerBusy,
        }
    }
}

impl From<corelink_proto::ProtoError> for SessionError {
    fn from(_err: corelink_proto::ProtoError) -> Self {
        SessionError::ParseResponseFail
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_text_matches_canonical_table() {
        assert_eq!(SessionError::Ok.err_text(), "success");
        assert_eq!(SessionError::TimerBusy.err_text(), "timer thread busy");
        assert_eq!(SessionError::ReadTimeout.as_code(), 7);
    }

    #[test]
    fn timeout_is_never_retryable() {
        assert!(!SessionError::ReadTimeout.is_retryable());
    }

    #[test]
    fn transport_and_flow_control_errors_are_retryable() {
        assert!(SessionError::SocketLost.is_retryable());
        assert!(SessionError::WriteFail.is_retryable());
        assert!(SessionError::SocketBusy.is_retryable());
        assert!(SessionError::TimerBusy.is_retryable());
    }

    #[test]
    fn parse_failures_are_not_retryable() {
        assert!(!SessionError::ParseResponseFail.is_retryable());
        assert!(!SessionError::ProtocolNotFound.is_retryable());
        assert!(!SessionError::AssembleRequestFail.is_retryable());
    }
}
