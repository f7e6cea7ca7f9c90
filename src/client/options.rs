//! Per-connection options.
//!
//! [`ConnectOptions`] carries everything a single `connect` needs: timers,
//! session handling, flow control and credentials. Options deserialize from
//! JSON with every field optional.
//!
//! # Example
//!
//! ```ignore
//! use mqtt_link::ConnectOptions;
//!
//! let options = ConnectOptions::new()
//!     .with_keep_alive_interval(30)
//!     .with_clean_session(false)
//!     .with_credentials("sensor", "secret");
//!
//! let from_file = ConnectOptions::from_json(r#"{"keep_alive_interval": 30}"#)?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::MAX_PACKET_SIZE;

// ============================================================================
// Constants
// ============================================================================

/// Default keep-alive interval in seconds.
pub const DEFAULT_KEEP_ALIVE_INTERVAL: u16 = 60;

/// Default TCP connect and CONNACK timeout in seconds.
pub const DEFAULT_CONNECTION_TIMEOUT: u64 = 30;

/// Default wait for a request's acknowledgement in seconds.
pub const DEFAULT_ACTION_TIMEOUT: u64 = 30;

/// Default limit of unacknowledged QoS 1/2 publishes.
pub const DEFAULT_MAX_INFLIGHT: usize = 10;

// ============================================================================
// ConnectOptions
// ============================================================================

/// Options for one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectOptions {
    /// Keep-alive interval in seconds. Zero disables keep-alive.
    pub keep_alive_interval: u16,

    /// TCP connect and CONNACK timeout in seconds.
    pub connection_timeout: u64,

    /// How long commands wait for their acknowledgement, in seconds.
    pub action_timeout: u64,

    /// Start a fresh session.
    pub clean_session: bool,

    /// Reconnect after an unexpected loss of an established connection.
    pub automatic_reconnect: bool,

    /// Maximum outstanding tokens before QoS 1/2 publishes are rejected.
    pub max_inflight: usize,

    /// Largest inbound packet accepted, in bytes.
    pub max_packet_size: usize,

    /// User name.
    pub username: Option<String>,

    /// Password. Requires a user name.
    pub password: Option<String>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl ConnectOptions {
    /// Creates options with default settings.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            action_timeout: DEFAULT_ACTION_TIMEOUT,
            clean_session: true,
            automatic_reconnect: false,
            max_inflight: DEFAULT_MAX_INFLIGHT,
            max_packet_size: MAX_PACKET_SIZE,
            username: None,
            password: None,
        }
    }

    /// Parses options from JSON. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// - [`Error::Json`] if the input is not valid JSON
    /// - [`Error::Config`] if the parsed options fail [`ConnectOptions::validate`]
    pub fn from_json(json: &str) -> Result<Self> {
        let options: Self = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl ConnectOptions {
    /// Sets the keep-alive interval in seconds.
    #[inline]
    #[must_use]
    pub fn with_keep_alive_interval(mut self, seconds: u16) -> Self {
        self.keep_alive_interval = seconds;
        self
    }

    /// Sets the connection timeout in seconds.
    #[inline]
    #[must_use]
    pub fn with_connection_timeout(mut self, seconds: u64) -> Self {
        self.connection_timeout = seconds;
        self
    }

    /// Sets the action timeout in seconds.
    #[inline]
    #[must_use]
    pub fn with_action_timeout(mut self, seconds: u64) -> Self {
        self.action_timeout = seconds;
        self
    }

    /// Sets the clean session flag.
    #[inline]
    #[must_use]
    pub fn with_clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    /// Enables or disables automatic reconnect.
    #[inline]
    #[must_use]
    pub fn with_automatic_reconnect(mut self, enabled: bool) -> Self {
        self.automatic_reconnect = enabled;
        self
    }

    /// Sets the in-flight limit.
    #[inline]
    #[must_use]
    pub fn with_max_inflight(mut self, max: usize) -> Self {
        self.max_inflight = max;
        self
    }

    /// Sets the largest inbound packet accepted.
    #[inline]
    #[must_use]
    pub fn with_max_packet_size(mut self, bytes: usize) -> Self {
        self.max_packet_size = bytes;
        self
    }

    /// Sets a user name without password.
    #[inline]
    #[must_use]
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Sets user name and password.
    #[inline]
    #[must_use]
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }
}

// ============================================================================
// Accessors
// ============================================================================

impl ConnectOptions {
    /// Keep-alive interval as a duration.
    #[inline]
    #[must_use]
    pub const fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_interval as u64)
    }

    /// Connection timeout as a duration.
    #[inline]
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout)
    }

    /// Action timeout as a duration.
    #[inline]
    #[must_use]
    pub const fn action_wait(&self) -> Duration {
        Duration::from_secs(self.action_timeout)
    }

    /// Validates the options.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.connection_timeout == 0 {
            return Err(Error::config("connection_timeout must be greater than zero"));
        }
        if self.action_timeout == 0 {
            return Err(Error::config("action_timeout must be greater than zero"));
        }
        if self.max_inflight == 0 {
            return Err(Error::config("max_inflight must be greater than zero"));
        }
        if self.max_packet_size < 2 {
            return Err(Error::config("max_packet_size must be at least 2 bytes"));
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(Error::config("password requires a username"));
        }
        if let Some(username) = &self.username
            && username.len() > usize::from(u16::MAX)
        {
            return Err(Error::config("username longer than 65535 bytes"));
        }
        if let Some(password) = &self.password
            && password.len() > usize::from(u16::MAX)
        {
            return Err(Error::config("password longer than 65535 bytes"));
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = ConnectOptions::new();
        assert_eq!(options.keep_alive_interval, 60);
        assert_eq!(options.connection_timeout, 30);
        assert_eq!(options.action_timeout, 30);
        assert!(options.clean_session);
        assert!(!options.automatic_reconnect);
        assert_eq!(options.max_inflight, 10);
        assert_eq!(options.max_packet_size, 268_435_460);
        assert!(options.validate().is_ok());
        assert_eq!(options, ConnectOptions::default());
    }

    #[test]
    fn test_builder_chain() {
        let options = ConnectOptions::new()
            .with_keep_alive_interval(5)
            .with_clean_session(false)
            .with_automatic_reconnect(true)
            .with_credentials("user", "pass");

        assert_eq!(options.keep_alive(), Duration::from_secs(5));
        assert!(!options.clean_session);
        assert!(options.automatic_reconnect);
        assert_eq!(options.username.as_deref(), Some("user"));
        assert_eq!(options.password.as_deref(), Some("pass"));
    }

    #[test]
    fn test_from_json_partial() {
        let options =
            ConnectOptions::from_json(r#"{"keep_alive_interval": 15, "username": "u"}"#).unwrap();
        assert_eq!(options.keep_alive_interval, 15);
        assert_eq!(options.username.as_deref(), Some("u"));
        assert_eq!(options.action_timeout, DEFAULT_ACTION_TIMEOUT);
    }

    #[test]
    fn test_from_json_rejects_invalid() {
        let err = ConnectOptions::from_json(r#"{"max_inflight": 0}"#).unwrap_err();
        assert!(matches!(err, Error::Config { .. }));

        let err = ConnectOptions::from_json("{not json").unwrap_err();
        assert!(matches!(err, Error::Json(_)));
    }

    #[test]
    fn test_password_requires_username() {
        let mut options = ConnectOptions::new();
        options.password = Some("secret".into());
        let err = options.validate().unwrap_err();
        assert!(err.to_string().contains("username"));
    }

    #[test]
    fn test_serde_roundtrip_keeps_fields() {
        let options = ConnectOptions::new().with_max_inflight(3);
        let json = serde_json::to_string(&options).unwrap();
        assert_eq!(ConnectOptions::from_json(&json).unwrap(), options);
    }
}
