//! MQTT client.
//!
//! This module provides the command surface and owns the connection
//! lifecycle.
//!
//! # Components
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Client`] | Connect, subscribe, publish, disconnect |
//! | [`ClientBuilder`] | Fluent configuration builder |
//! | [`ConnectOptions`] | Per-connection options |
//!
//! # Example
//!
//! ```no_run
//! use mqtt_link::{Client, ConnectOptions, QoS, Result};
//!
//! # async fn example() -> Result<()> {
//! let client = Client::builder()
//!     .server_uri("tcp://localhost:1883")
//!     .build()?;
//!
//! client
//!     .connect(ConnectOptions::new().with_automatic_reconnect(true))
//!     .await?;
//! client.publish("status", "online", QoS::AtLeastOnce, true).await?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Submodules
// ============================================================================

/// Fluent builder pattern for client configuration.
pub mod builder;

/// Client handle and connection lifecycle.
pub mod core;

/// Per-connection options.
pub mod options;

// ============================================================================
// Re-exports
// ============================================================================

pub use builder::{ClientBuilder, DEFAULT_PORT};
pub use core::Client;
pub use options::ConnectOptions;
