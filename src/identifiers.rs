//! Type-safe identifiers.
//!
//! Newtype wrappers prevent mixing packet identifiers, correlation keys and
//! client identifiers at compile time.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::num::NonZeroU16;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Prefix for generated client identifiers.
const GENERATED_CLIENT_ID_PREFIX: &str = "link";

/// Longest client identifier every 3.1.1 broker must accept.
const PORTABLE_CLIENT_ID_LEN: usize = 23;

// ============================================================================
// PacketId
// ============================================================================

/// Non-zero 16-bit packet identifier.
///
/// Carried by PUBLISH (QoS > 0), PUBACK, PUBREC, PUBREL, PUBCOMP,
/// SUBSCRIBE, SUBACK, UNSUBSCRIBE and UNSUBACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PacketId(NonZeroU16);

impl PacketId {
    /// Smallest valid identifier.
    pub const MIN: Self = Self(NonZeroU16::MIN);

    /// Largest valid identifier.
    pub const MAX: Self = Self(NonZeroU16::MAX);

    /// Creates a packet identifier, rejecting zero.
    #[inline]
    #[must_use]
    pub const fn new(value: u16) -> Option<Self> {
        match NonZeroU16::new(value) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u16 {
        self.0.get()
    }

    /// Returns the next identifier, wrapping from 65535 to 1.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        match self.0.checked_add(1) {
            Some(v) => Self(v),
            None => Self::MIN,
        }
    }
}

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u16> for PacketId {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self> {
        Self::new(value).ok_or_else(|| Error::invalid_argument("packet identifier must be non-zero"))
    }
}

// ============================================================================
// TokenKey
// ============================================================================

/// Correlation key matching a request to its acknowledgement.
///
/// CONNECT, PINGREQ and DISCONNECT carry no packet identifier, so they use
/// fixed keys. At most one of each can be outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKey {
    /// CONNECT / CONNACK.
    Connect,
    /// PINGREQ / PINGRESP.
    Ping,
    /// DISCONNECT (completes on send).
    Disconnect,
    /// Any packet carrying a packet identifier.
    Packet(PacketId),
}

impl TokenKey {
    /// Returns the packet identifier, if this key has one.
    #[inline]
    #[must_use]
    pub const fn packet_id(self) -> Option<PacketId> {
        match self {
            Self::Packet(id) => Some(id),
            _ => None,
        }
    }
}

impl fmt::Display for TokenKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => f.write_str("Con"),
            Self::Ping => f.write_str("Ping"),
            Self::Disconnect => f.write_str("Disc"),
            Self::Packet(id) => write!(f, "#{id}"),
        }
    }
}

impl From<PacketId> for TokenKey {
    #[inline]
    fn from(id: PacketId) -> Self {
        Self::Packet(id)
    }
}

// ============================================================================
// ClientId
// ============================================================================

/// MQTT client identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// Creates a client identifier.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the identifier does not fit a
    /// length-prefixed string or contains a NUL character.
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if value.len() > usize::from(u16::MAX) {
            return Err(Error::invalid_argument("client identifier too long"));
        }
        if value.contains('\0') {
            return Err(Error::invalid_argument("client identifier contains NUL"));
        }
        Ok(Self(value))
    }

    /// Generates a random identifier short enough for any broker.
    #[must_use]
    pub fn generate() -> Self {
        let random = Uuid::new_v4().simple().to_string();
        let take = PORTABLE_CLIENT_ID_LEN - GENERATED_CLIENT_ID_PREFIX.len();
        Self(format!("{GENERATED_CLIENT_ID_PREFIX}{}", &random[..take]))
    }

    /// Returns the identifier as a string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_id_rejects_zero() {
        assert!(PacketId::new(0).is_none());
        assert_eq!(PacketId::new(42).map(PacketId::get), Some(42));
        assert!(PacketId::try_from(0).is_err());
    }

    #[test]
    fn test_packet_id_wraps() {
        assert_eq!(PacketId::MAX.next(), PacketId::MIN);
        assert_eq!(PacketId::MIN.next().get(), 2);
    }

    #[test]
    fn test_token_key_display() {
        assert_eq!(TokenKey::Connect.to_string(), "Con");
        assert_eq!(TokenKey::Ping.to_string(), "Ping");
        assert_eq!(TokenKey::Disconnect.to_string(), "Disc");
        assert_eq!(TokenKey::from(PacketId::MIN).to_string(), "#1");
    }

    #[test]
    fn test_token_key_packet_id() {
        assert_eq!(TokenKey::Packet(PacketId::MAX).packet_id(), Some(PacketId::MAX));
        assert_eq!(TokenKey::Connect.packet_id(), None);
    }

    #[test]
    fn test_generated_client_id_is_portable() {
        let a = ClientId::generate();
        let b = ClientId::generate();
        assert_eq!(a.as_str().len(), PORTABLE_CLIENT_ID_LEN);
        assert!(a.as_str().starts_with(GENERATED_CLIENT_ID_PREFIX));
        assert_ne!(a, b);
    }

    #[test]
    fn test_client_id_validation() {
        assert!(ClientId::new("sensor-1").is_ok());
        assert!(ClientId::new("bad\0id").is_err());
        assert!(ClientId::new("x".repeat(70_000)).is_err());
    }
}
