//! Connection and listener configuration
//!
//! Plain serde structs with `with_*` builders. Everything here is read once:
//! a connection copies its config at construction, a listener freezes its
//! config when `start` is called.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default I/O buffer size (8 KiB)
pub const DEFAULT_BUFFER_SIZE: usize = 8192;
/// Default TCP connect/send timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default listen backlog
pub const DEFAULT_BACKLOG: u32 = 1024;
/// Default capacity of the broadcast event channels
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;
/// Default number of pipe server instances
pub const DEFAULT_MAX_INSTANCES: usize = 254;

/// Rejected configuration value
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for '{field}': {value}\nReason: {reason}\nSuggestion: {suggestion}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
        suggestion: String,
    },
}

impl ConfigError {
    fn invalid(field: &str, value: impl std::fmt::Debug, reason: &str, suggestion: &str) -> Self {
        ConfigError::InvalidValue {
            field: field.to_string(),
            value: format!("{:?}", value),
            reason: reason.to_string(),
            suggestion: suggestion.to_string(),
        }
    }
}

/// Check that a timeout is a discrete positive value.
///
/// `Duration::ZERO` and `Duration::MAX` stand in for "no timeout" / "infinite"
/// sentinels and are rejected.
pub fn validate_timeout(timeout: Duration) -> Result<(), ConfigError> {
    if timeout.is_zero() {
        return Err(ConfigError::invalid("timeout", timeout, "must be > 0", "use a value like 10s"));
    }
    if timeout == Duration::MAX {
        return Err(ConfigError::invalid(
            "timeout",
            timeout,
            "infinite timeouts are not supported",
            "use a finite value like 10s",
        ));
    }
    Ok(())
}

/// Client connection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Receive buffer size in bytes
    pub buffer_size: usize,
    /// Connect/send timeout and liveness check interval (TCP only)
    pub timeout: Duration,
    /// TCP_NODELAY option
    pub nodelay: bool,
    /// Capacity of the event broadcast channel
    pub event_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            timeout: DEFAULT_TIMEOUT,
            nodelay: true,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl ConnectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size == 0 {
            return Err(ConfigError::invalid(
                "buffer_size",
                self.buffer_size,
                "must be > 0",
                "use the default of 8192",
            ));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::invalid(
                "event_capacity",
                self.event_capacity,
                "must be > 0",
                "use the default of 1024",
            ));
        }
        validate_timeout(self.timeout)
    }
}

/// Listener configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Listen backlog
    pub backlog: u32,
    /// Socket and per-session receive buffer size in bytes
    pub buffer_size: usize,
    /// Accept IPv4 clients on an IPv6 socket
    pub dual_mode: bool,
    /// TCP_NODELAY applied to every accepted session
    pub nodelay: bool,
    /// Maximum concurrent pipe server instances (named pipes only)
    pub max_instances: usize,
    /// Optional send timeout and liveness interval for sessions
    pub session_timeout: Option<Duration>,
    /// Capacity of the event broadcast channels
    pub event_capacity: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            backlog: DEFAULT_BACKLOG,
            buffer_size: DEFAULT_BUFFER_SIZE,
            dual_mode: false,
            nodelay: true,
            max_instances: DEFAULT_MAX_INSTANCES,
            session_timeout: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl ListenerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn with_dual_mode(mut self, dual_mode: bool) -> Self {
        self.dual_mode = dual_mode;
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn with_max_instances(mut self, max: usize) -> Self {
        self.max_instances = max;
        self
    }

    pub fn with_session_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.session_timeout = timeout;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backlog == 0 {
            return Err(ConfigError::invalid("backlog", self.backlog, "must be > 0", "use the default of 1024"));
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::invalid(
                "buffer_size",
                self.buffer_size,
                "must be > 0",
                "use the default of 8192",
            ));
        }
        if self.max_instances == 0 {
            return Err(ConfigError::invalid(
                "max_instances",
                self.max_instances,
                "must be > 0",
                "use the default of 254",
            ));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::invalid(
                "event_capacity",
                self.event_capacity,
                "must be > 0",
                "use the default of 1024",
            ));
        }
        if let Some(timeout) = self.session_timeout {
            validate_timeout(timeout)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.buffer_size, 8192);
        assert_eq!(config.timeout, Duration::from_secs(10));
        assert!(config.validate().is_ok());

        let listener = ListenerConfig::default();
        assert_eq!(listener.backlog, 1024);
        assert_eq!(listener.buffer_size, 8192);
        assert!(!listener.dual_mode);
        assert!(listener.validate().is_ok());
    }

    #[test]
    fn test_timeout_sentinels_rejected() {
        assert!(validate_timeout(Duration::ZERO).is_err());
        assert!(validate_timeout(Duration::MAX).is_err());
        assert!(validate_timeout(Duration::from_millis(1)).is_ok());

        let config = ConnectionConfig::default().with_timeout(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_listener_validation() {
        assert!(ListenerConfig::default().with_backlog(0).validate().is_err());
        assert!(ListenerConfig::default().with_buffer_size(0).validate().is_err());
        assert!(ListenerConfig::default().with_max_instances(0).validate().is_err());
        assert!(ListenerConfig::default()
            .with_session_timeout(Some(Duration::ZERO))
            .validate()
            .is_err());
    }

    #[test]
    fn test_load_from_toml() {
        let text = r#"
            backlog = 16
            dual_mode = true
            nodelay = false
        "#;
        let config: ListenerConfig = toml::from_str(text).unwrap();
        assert_eq!(config.backlog, 16);
        assert!(config.dual_mode);
        assert!(!config.nodelay);
        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_json_round_trip() {
        let config = ConnectionConfig::default().with_buffer_size(4096);
        let json = serde_json::to_string(&config).unwrap();
        let back: ConnectionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
