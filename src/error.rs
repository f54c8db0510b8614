use std::io;
use std::time::Duration;

use crate::config::ConfigError;

/// Unified transport error type
///
/// Cloneable so it can travel through the broadcast event channels.
#[derive(Debug, thiserror::Error, Clone)]
pub enum TransportError {
    /// Operation not valid in the current state (send while disconnected, ...)
    #[error("Invalid operation '{operation}': {reason}")]
    InvalidOperation {
        operation: &'static str,
        reason: String,
    },

    /// Configuration rejected, including out-of-range timeouts
    #[error("Configuration error in field '{field}': {reason}")]
    Configuration {
        field: String,
        reason: String,
    },

    /// Transport level failure
    #[error("Transport error ({kind:?}): {reason}")]
    Io {
        kind: io::ErrorKind,
        reason: String,
    },

    /// Operation exceeded the configured timeout
    #[error("Operation '{operation}' timeout after {duration:?}")]
    Timeout {
        operation: String,
        duration: Duration,
    },
}

impl TransportError {
    /// Precondition failure for `operation`.
    pub fn invalid_operation(operation: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidOperation {
            operation,
            reason: reason.into(),
        }
    }

    /// Shorthand for the "not connected" precondition failure.
    pub fn not_connected(operation: &'static str) -> Self {
        Self::invalid_operation(operation, "not connected")
    }

    /// Configuration failure for `field`.
    pub fn config_error(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// `operation` ran past `duration`.
    pub fn timeout_error(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// The I/O error kind behind this error, if it came from the transport.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            TransportError::Io { kind, .. } => Some(*kind),
            TransportError::Timeout { .. } => Some(io::ErrorKind::TimedOut),
            _ => None,
        }
    }

    /// Whether this error is normal teardown noise rather than an actionable fault.
    pub fn is_expected_teardown(&self) -> bool {
        self.io_kind().map(is_expected_teardown).unwrap_or(false)
    }

    /// Whether retrying the same operation can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Io { kind, .. } => matches!(
                kind,
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
            ),
            TransportError::Timeout { .. } => true,
            TransportError::InvalidOperation { .. } => false,
            TransportError::Configuration { .. } => false,
        }
    }

    /// Stable code for logs and metrics.
    pub fn error_code(&self) -> &'static str {
        match self {
            TransportError::InvalidOperation { .. } => "INVALID_OPERATION",
            TransportError::Configuration { .. } => "CONFIG_ERROR",
            TransportError::Io { .. } => "IO_ERROR",
            TransportError::Timeout { .. } => "TIMEOUT_ERROR",
        }
    }
}

/// Error kinds that represent normal peer or shutdown behavior.
///
/// These silently drive the disconnect path and are never surfaced through
/// an error notification. Shared by connections, sessions and the accept loop.
pub fn is_expected_teardown(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

impl From<io::Error> for TransportError {
    fn from(error: io::Error) -> Self {
        TransportError::Io {
            kind: error.kind(),
            reason: error.to_string(),
        }
    }
}

impl From<ConfigError> for TransportError {
    fn from(error: ConfigError) -> Self {
        let ConfigError::InvalidValue { field, reason, .. } = error;
        TransportError::Configuration { field, reason }
    }
}
