//! Builder pattern for client configuration.
//!
//! Provides a fluent API for configuring and creating [`Client`] instances.
//!
//! # Example
//!
//! ```no_run
//! use mqtt_link::Client;
//!
//! # fn example() -> mqtt_link::Result<()> {
//! let client = Client::builder()
//!     .server_uri("tcp://broker.local:1883")
//!     .client_id("sensor-7")
//!     .build()?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use url::Url;

use crate::error::{Error, Result};
use crate::identifiers::ClientId;

use super::core::Client;

// ============================================================================
// Constants
// ============================================================================

/// Port used when the server URI has none.
pub const DEFAULT_PORT: u16 = 1883;

// ============================================================================
// ClientBuilder
// ============================================================================

/// Builder for configuring a [`Client`] instance.
///
/// Use [`Client::builder()`] to create a new builder.
#[derive(Debug, Default, Clone)]
pub struct ClientBuilder {
    /// Broker URI, `tcp://host[:port]` or `mqtt://host[:port]`.
    server_uri: Option<String>,
    /// Client identifier. Generated when unset.
    client_id: Option<String>,
}

// ============================================================================
// ClientBuilder Implementation
// ============================================================================

impl ClientBuilder {
    /// Creates a new client builder with no configuration.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the broker URI.
    ///
    /// # Arguments
    ///
    /// * `uri` - Broker URI (e.g., "tcp://localhost:1883")
    #[inline]
    #[must_use]
    pub fn server_uri(mut self, uri: impl Into<String>) -> Self {
        self.server_uri = Some(uri.into());
        self
    }

    /// Sets the client identifier.
    #[inline]
    #[must_use]
    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = Some(id.into());
        self
    }

    /// Builds the client with validation.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the server URI is missing or uses an
    ///   unsupported scheme
    /// - [`Error::Url`] if the server URI does not parse
    /// - [`Error::InvalidArgument`] if the client identifier is invalid
    pub fn build(self) -> Result<Client> {
        let (server_uri, address) = self.validate_server_uri()?;
        let client_id = match self.client_id {
            Some(id) => ClientId::new(id)?,
            None => ClientId::generate(),
        };

        Ok(Client::new(server_uri, address, client_id))
    }
}

// ============================================================================
// Validation
// ============================================================================

impl ClientBuilder {
    /// Parses the server URI into its display form and a `host:port`.
    fn validate_server_uri(&self) -> Result<(String, String)> {
        let raw = self.server_uri.as_deref().ok_or_else(|| {
            Error::config(
                "Server URI is required. Use .server_uri() to set it.\n\
                 Example: Client::builder().server_uri(\"tcp://localhost:1883\")",
            )
        })?;

        let url = Url::parse(raw)?;
        match url.scheme() {
            "tcp" | "mqtt" => {}
            "ssl" | "tls" | "mqtts" | "wss" | "ws" => {
                return Err(Error::config(format!(
                    "Scheme '{}' is not supported, use tcp:// or mqtt://",
                    url.scheme()
                )));
            }
            other => {
                return Err(Error::config(format!("Unknown URI scheme '{other}'")));
            }
        }

        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| Error::config(format!("Server URI has no host: {raw}")))?;
        let port = url.port().unwrap_or(DEFAULT_PORT);

        Ok((raw.to_owned(), format!("{host}:{port}")))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_creates_empty_builder() {
        let builder = ClientBuilder::new();
        assert!(builder.server_uri.is_none());
        assert!(builder.client_id.is_none());
    }

    #[test]
    fn test_build_fails_without_uri() {
        let err = ClientBuilder::new().build().unwrap_err();
        assert!(err.to_string().contains("Server URI"));
    }

    #[test]
    fn test_default_port() {
        let (_, address) = ClientBuilder::new()
            .server_uri("tcp://broker.local")
            .validate_server_uri()
            .unwrap();
        assert_eq!(address, "broker.local:1883");
    }

    #[test]
    fn test_explicit_port_and_mqtt_scheme() {
        let (uri, address) = ClientBuilder::new()
            .server_uri("mqtt://10.0.0.1:2883")
            .validate_server_uri()
            .unwrap();
        assert_eq!(uri, "mqtt://10.0.0.1:2883");
        assert_eq!(address, "10.0.0.1:2883");
    }

    #[test]
    fn test_ipv6_host() {
        let (_, address) = ClientBuilder::new()
            .server_uri("tcp://[::1]:1884")
            .validate_server_uri()
            .unwrap();
        assert_eq!(address, "[::1]:1884");
    }

    #[test]
    fn test_tls_rejected() {
        let err = ClientBuilder::new()
            .server_uri("ssl://broker.local:8883")
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn test_unparseable_uri() {
        let err = ClientBuilder::new().server_uri("not a uri").build().unwrap_err();
        assert!(matches!(err, Error::Url(_)));
    }

    #[test]
    fn test_generated_client_id() {
        let client = ClientBuilder::new()
            .server_uri("tcp://localhost")
            .build()
            .unwrap();
        assert_eq!(client.client_id().as_str().len(), 23);
    }

    #[test]
    fn test_invalid_client_id() {
        let err = ClientBuilder::new()
            .server_uri("tcp://localhost")
            .client_id("bad\0id")
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }
}
