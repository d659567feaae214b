//! Typed error taxonomy for the command-routing core.
//!
//! The HTTP layer that would map these to status codes lives outside this
//! workspace, so `status_hint` stands in for that mapping: callers on the
//! (external) HTTP side read it instead of re-deriving the 4xx/404/503/504
//! policy themselves.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("fqn must contain exactly one '@' and a non-empty hostname and location")]
    InvalidFqnFormat,
    #[error("fqn location is not validly percent-encoded")]
    InvalidFqnEncoding,
    #[error("outbound command failed schema validation")]
    InvalidOutboundCommand,
    #[error("command result was missing the data its success flag implied")]
    MalformedResult,
    #[error("host not found")]
    HostNotFound,
    #[error("node {0} is offline")]
    NodeOffline(String),
    #[error("command {command_id} timed out after {deadline_ms}ms (attempt {attempt}/{max_retries})")]
    Timeout { command_id: String, attempt: u32, max_retries: u32, deadline_ms: u64 },
    #[error("{0}")]
    CommandFailed(String),
    #[error("node session closed")]
    NodeClosed,
    #[error("send to node failed: {0}")]
    SendFailed(String),
    #[error("store error: {0}")]
    StoreError(String),
    #[error("upgrade request did not carry a valid static or session token")]
    UpgradeUnauthorized,
    #[error("cnc-server is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusHint {
    BadRequest,
    Unauthorized,
    NotFound,
    ServiceUnavailable,
    GatewayTimeout,
    InternalServerError,
}

impl CoreError {
    /// Advisory HTTP status class for the (external) HTTP layer; this core
    /// never returns an HTTP response itself.
    pub fn status_hint(&self) -> StatusHint {
        match self {
            CoreError::InvalidFqnFormat
            | CoreError::InvalidFqnEncoding
            | CoreError::InvalidOutboundCommand
            | CoreError::MalformedResult => StatusHint::BadRequest,
            CoreError::UpgradeUnauthorized => StatusHint::Unauthorized,
            CoreError::HostNotFound => StatusHint::NotFound,
            CoreError::NodeOffline(_) => StatusHint::ServiceUnavailable,
            CoreError::Timeout { .. } => StatusHint::GatewayTimeout,
            CoreError::CommandFailed(_)
            | CoreError::NodeClosed
            | CoreError::SendFailed(_)
            | CoreError::StoreError(_)
            | CoreError::ShuttingDown => StatusHint::InternalServerError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_errors_hint_bad_request() {
        assert_eq!(CoreError::InvalidFqnFormat.status_hint(), StatusHint::BadRequest);
        assert_eq!(CoreError::InvalidOutboundCommand.status_hint(), StatusHint::BadRequest);
    }

    #[test]
    fn not_found_hints_404() {
        assert_eq!(CoreError::HostNotFound.status_hint(), StatusHint::NotFound);
    }

    #[test]
    fn timeout_hints_504() {
        let err = CoreError::Timeout { command_id: "cmd_1".to_string(), attempt: 1, max_retries: 3, deadline_ms: 25 };
        assert_eq!(err.status_hint(), StatusHint::GatewayTimeout);
        assert!(err.to_string().contains("timed out after 25ms"));
        assert!(err.to_string().contains("attempt 1/3"));
    }

    #[test]
    fn node_offline_hints_503() {
        assert_eq!(CoreError::NodeOffline("node-1".to_string()).status_hint(), StatusHint::ServiceUnavailable);
    }
}
