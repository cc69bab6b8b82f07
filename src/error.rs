//! Error types for the remote SSH MCP server

use thiserror::Error;

/// Main error type surfaced to the agent through the tool envelope
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration (bad tier, malformed pattern, unreadable key file)
    #[error("Configuration error: {0}")]
    Config(String),

    /// All authentication methods exhausted
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// TCP-level connect failure
    #[error("Network unreachable: {0}")]
    NetworkUnreachable(String),

    /// Server host key did not match the pinned fingerprint
    #[error("Host key mismatch: {0}")]
    HostKeyMismatch(String),

    /// Transport did not come up within the connect timeout
    #[error("Connection timeout after {0}s")]
    ConnectTimeout(u64),

    /// Unknown session id or prompt request id
    #[error("Not found: {0}")]
    NotFound(String),

    /// Registry is at its concurrent-session cap
    #[error("Maximum of {0} concurrent sessions reached")]
    MaxSessionsReached(usize),

    /// A command is already in flight on this session
    #[error("Session '{0}' is busy with another command")]
    BusySession(String),

    /// Policy rejected the command before any channel I/O
    #[error("Command denied: {reason}")]
    Denied { reason: String },

    /// A password prompt surfaced and was not resolved in time
    #[error("Password required: {0}")]
    PasswordRequired(String),

    /// Terminal channel or transport failure; the session must be re-connected
    #[error("Session broken: {0}")]
    SessionBroken(String),

    /// File transfer failure
    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    /// Invalid tool parameters
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    /// SSH protocol or channel error that is not one of the kinds above
    #[error("SSH error: {0}")]
    Ssh(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// File transfer failure modes
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("path '{0}' is outside the allowed transfer prefixes")]
    PathDenied(String),

    #[error("failed to read remote file: {0}")]
    ReadFailed(String),

    #[error("failed to write remote file: {0}")]
    WriteFailed(String),

    #[error("remote file is {size} bytes, limit is {limit}")]
    TooLarge { size: u64, limit: u64 },
}

/// Result type alias using Error
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Stable snake_case identifier for the wire envelope
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "config_error",
            Error::AuthFailed(_) => "auth_failed",
            Error::NetworkUnreachable(_) => "network_unreachable",
            Error::HostKeyMismatch(_) => "host_key_mismatch",
            Error::ConnectTimeout(_) => "connect_timeout",
            Error::NotFound(_) => "not_found",
            Error::MaxSessionsReached(_) => "max_sessions_reached",
            Error::BusySession(_) => "busy_session",
            Error::Denied { .. } => "denied",
            Error::PasswordRequired(_) => "password_required",
            Error::SessionBroken(_) => "session_broken",
            Error::Transfer(TransferError::PathDenied(_)) => "transfer_path_denied",
            Error::Transfer(TransferError::ReadFailed(_)) => "transfer_read_failed",
            Error::Transfer(TransferError::WriteFailed(_)) => "transfer_write_failed",
            Error::Transfer(TransferError::TooLarge { .. }) => "transfer_too_large",
            Error::InvalidParams(_) => "invalid_params",
            Error::Ssh(_) => "ssh_error",
            Error::Io(_) => "io_error",
        }
    }

    /// Create a config error from a string
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create an authentication error from a string
    pub fn auth(msg: impl Into<String>) -> Self {
        Error::AuthFailed(msg.into())
    }

    /// Create an invalid params error from a string
    pub fn invalid_params(msg: impl Into<String>) -> Self {
        Error::InvalidParams(msg.into())
    }

    /// Create a generic SSH error from a string
    pub fn ssh(msg: impl Into<String>) -> Self {
        Error::Ssh(msg.into())
    }

    /// Create a broken-session error from a string
    pub fn broken(msg: impl Into<String>) -> Self {
        Error::SessionBroken(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::ConnectTimeout(30);
        assert_eq!(err.to_string(), "Connection timeout after 30s");

        let err = Error::BusySession("abc123".to_string());
        assert_eq!(
            err.to_string(),
            "Session 'abc123' is busy with another command"
        );
    }

    #[test]
    fn test_error_kinds_are_stable() {
        assert_eq!(Error::MaxSessionsReached(5).kind(), "max_sessions_reached");
        assert_eq!(
            Error::Denied {
                reason: "nope".into()
            }
            .kind(),
            "denied"
        );
        assert_eq!(
            Error::Transfer(TransferError::PathDenied("/etc/shadow".into())).kind(),
            "transfer_path_denied"
        );
    }

    #[test]
    fn test_transfer_error_display() {
        let err = TransferError::TooLarge {
            size: 1024,
            limit: 512,
        };
        assert_eq!(err.to_string(), "remote file is 1024 bytes, limit is 512");
    }
}
