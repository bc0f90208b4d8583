//! Error types for the connection substrate.

use chfdw_core::{MappingId, OptionsError, ServerId};
use thiserror::Error;

/// Result type alias for connection operations.
pub type ConnResult<T> = Result<T, ConnError>;

/// Errors surfaced by the connection cache and the protocol drivers.
#[derive(Debug, Error)]
pub enum ConnError {
    /// Bad server or user-mapping options. Fatal, never retried.
    #[error(transparent)]
    Options(#[from] OptionsError),

    /// The cached connection was left in the middle of a transaction state
    /// change and has been discarded. The current statement must abort.
    #[error("connection to server \"{server}\" was lost")]
    ConnectionLost { server: String },

    #[error("cache lookup failed for user mapping {0}")]
    MappingNotFound(MappingId),

    #[error("cache lookup failed for foreign server {0}")]
    ServerNotFound(ServerId),

    #[error("could not connect to {target}: {message}")]
    Connect { target: String, message: String },

    /// Exception reported by the remote engine.
    #[error("remote error {code} ({name}): {message}")]
    Remote {
        code: i32,
        name: String,
        message: String,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("connection is closed")]
    Closed,
}

impl ConnError {
    pub fn connect(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connect {
            target: target.into(),
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// SQLSTATE reported to the host for this error.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            ConnError::Options(OptionsError::UnknownOption(_)) => "HV00D",
            ConnError::Options(OptionsError::InvalidValue { .. }) => "HV024",
            ConnError::Options(_) => "HV000",
            ConnError::ConnectionLost { .. } => "08000",
            ConnError::Connect { .. } => "08001",
            ConnError::Closed | ConnError::Io(_) | ConnError::Http(_) => "08006",
            ConnError::MappingNotFound(_) | ConnError::ServerNotFound(_) => "42704",
            ConnError::Remote { .. } => "HV000",
            ConnError::Protocol(_) => "XX000",
        }
    }

    /// Whether this error belongs to the connection-exception class (`08xxx`),
    /// meaning the surrounding statement must abort.
    pub fn is_connection_exception(&self) -> bool {
        self.sqlstate().starts_with("08")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_lost_message_and_class() {
        let err = ConnError::ConnectionLost {
            server: "clickhouse_svr".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "connection to server \"clickhouse_svr\" was lost"
        );
        assert_eq!(err.sqlstate(), "08000");
        assert!(err.is_connection_exception());
    }

    #[test]
    fn options_errors_are_not_connection_exceptions() {
        let err = ConnError::from(OptionsError::UnknownDriver("grpc".to_string()));
        assert_eq!(err.sqlstate(), "HV000");
        assert!(!err.is_connection_exception());
        assert!(err.to_string().contains("grpc"));

        let err = ConnError::from(OptionsError::UnknownOption("user".to_string()));
        assert_eq!(err.sqlstate(), "HV00D");
    }

    #[test]
    fn lookup_failures() {
        let err = ConnError::MappingNotFound(MappingId(12));
        assert_eq!(err.to_string(), "cache lookup failed for user mapping 12");
        assert_eq!(err.sqlstate(), "42704");
    }

    #[test]
    fn transport_failures_are_connection_exceptions() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(ConnError::from(io).is_connection_exception());
        assert!(ConnError::Closed.is_connection_exception());
        assert!(ConnError::connect("h:1", "refused").is_connection_exception());
        assert!(!ConnError::protocol("bad packet").is_connection_exception());
    }
}
