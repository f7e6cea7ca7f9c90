//! MQTT Link - readiness-driven MQTT 3.1.1 client transport.
//!
//! This library connects to an MQTT broker over plain TCP and correlates
//! every request with its acknowledgement, so callers simply await the
//! outcome of a connect, subscribe or publish.
//!
//! # Architecture
//!
//! The transport splits into four cooperating parts:
//!
//! - **Wire codec**: byte-exact encoder and incremental decoder
//! - **Token store**: one pending token per outstanding request
//! - **Connection state**: outbound queue and QoS bookkeeping
//! - **Event loop**: owns the socket; a polling task reads, a writer task
//!   drains the queue
//!
//! Key design principles:
//!
//! - A token is registered before its packet can be written
//! - A token resolves exactly once: acknowledged, sent, or failed
//! - Every fatal error funnels into one teardown that fails all pending tokens
//!
//! # Quick Start
//!
//! ```no_run
//! use mqtt_link::{Client, ConnectOptions, QoS, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = Client::builder()
//!         .server_uri("tcp://localhost:1883")
//!         .build()?;
//!
//!     client.on_message(|message| {
//!         println!("{} => {:?}", message.topic(), message.payload());
//!     });
//!
//!     client.connect(ConnectOptions::new()).await?;
//!     client.subscribe("sensors/#", QoS::AtLeastOnce).await?;
//!     client.publish("sensors/t1", "21.5", QoS::ExactlyOnce, false).await?;
//!     client.disconnect().await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`client`] | Client, builder and connect options |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Packet, token and client identifiers |
//! | [`protocol`] | Control packets and wire codec |
//! | [`transport`] | Event loop, connection state and tokens |

// ============================================================================
// Modules
// ============================================================================

/// Client, builder and connect options.
///
/// Use [`Client::builder()`] to create a configured client.
pub mod client;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers.
///
/// Newtype wrappers for packet identifiers, correlation keys and client IDs.
pub mod identifiers;

/// MQTT 3.1.1 control packets and wire codec.
pub mod protocol;

/// TCP transport layer.
///
/// Event loop, outbound queue and request/acknowledgement correlation.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Client types
pub use client::{Client, ClientBuilder, ConnectOptions};

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{ClientId, PacketId, TokenKey};

// Protocol types
pub use protocol::{ConnectReturnCode, Packet, Publish, QoS};

// Transport types
pub use transport::{PendingToken, StateStats, TokenStatus};
