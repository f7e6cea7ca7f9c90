//! Control packet types.
//!
//! Typed MQTT 3.1.1 control packets as produced by the decoder and consumed
//! by the encoder. Packets are immutable once built; payloads are
//! reference-counted [`Bytes`] so queueing and retrying never copies them.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::identifiers::{ClientId, PacketId, TokenKey};

// ============================================================================
// PacketType
// ============================================================================

/// Control packet type (high nibble of the fixed header).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// Client request to connect.
    Connect = 1,
    /// Connect acknowledgement.
    ConnAck = 2,
    /// Application message.
    Publish = 3,
    /// QoS 1 publish acknowledgement.
    PubAck = 4,
    /// QoS 2 publish received.
    PubRec = 5,
    /// QoS 2 publish release.
    PubRel = 6,
    /// QoS 2 publish complete.
    PubComp = 7,
    /// Subscribe request.
    Subscribe = 8,
    /// Subscribe acknowledgement.
    SubAck = 9,
    /// Unsubscribe request.
    Unsubscribe = 10,
    /// Unsubscribe acknowledgement.
    UnsubAck = 11,
    /// Ping request.
    PingReq = 12,
    /// Ping response.
    PingResp = 13,
    /// Client disconnect.
    Disconnect = 14,
}

impl PacketType {
    /// Parses the packet type from a fixed-header first byte.
    ///
    /// Returns `None` for the reserved types 0 and 15.
    #[must_use]
    pub const fn from_header(byte: u8) -> Option<Self> {
        match byte >> 4 {
            1 => Some(Self::Connect),
            2 => Some(Self::ConnAck),
            3 => Some(Self::Publish),
            4 => Some(Self::PubAck),
            5 => Some(Self::PubRec),
            6 => Some(Self::PubRel),
            7 => Some(Self::PubComp),
            8 => Some(Self::Subscribe),
            9 => Some(Self::SubAck),
            10 => Some(Self::Unsubscribe),
            11 => Some(Self::UnsubAck),
            12 => Some(Self::PingReq),
            13 => Some(Self::PingResp),
            14 => Some(Self::Disconnect),
            _ => None,
        }
    }

    /// Fixed-header flag nibble required for every type except PUBLISH.
    #[must_use]
    pub const fn fixed_flags(self) -> u8 {
        match self {
            Self::PubRel | Self::Subscribe | Self::Unsubscribe => 0x02,
            _ => 0x00,
        }
    }

    /// Returns `true` for the acknowledgement family.
    #[must_use]
    pub const fn is_ack(self) -> bool {
        matches!(
            self,
            Self::ConnAck
                | Self::PubAck
                | Self::PubRec
                | Self::PubComp
                | Self::SubAck
                | Self::UnsubAck
                | Self::PingResp
        )
    }
}

// ============================================================================
// QoS
// ============================================================================

/// Delivery quality of service.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum QoS {
    /// Fire and forget.
    #[default]
    AtMostOnce = 0,
    /// Acknowledged delivery.
    AtLeastOnce = 1,
    /// Assured delivery (four-way handshake).
    ExactlyOnce = 2,
}

impl QoS {
    /// Parses a QoS level, rejecting 3 and above.
    #[must_use]
    pub const fn from_u8(level: u8) -> Option<Self> {
        match level {
            0 => Some(Self::AtMostOnce),
            1 => Some(Self::AtLeastOnce),
            2 => Some(Self::ExactlyOnce),
            _ => None,
        }
    }
}

impl TryFrom<u8> for QoS {
    type Error = Error;

    fn try_from(level: u8) -> Result<Self> {
        Self::from_u8(level).ok_or_else(|| Error::invalid_argument(format!("invalid QoS level {level}")))
    }
}

// ============================================================================
// ConnectReturnCode
// ============================================================================

/// CONNACK return code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectReturnCode {
    /// Connection accepted.
    Accepted,
    /// Protocol level not supported by the broker.
    UnacceptableProtocolVersion,
    /// Client identifier rejected.
    IdentifierRejected,
    /// Broker unavailable.
    ServerUnavailable,
    /// Malformed user name or password.
    BadUserNameOrPassword,
    /// Client not authorized.
    NotAuthorized,
}

impl ConnectReturnCode {
    /// Parses a return code byte.
    #[must_use]
    pub const fn from_u8(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Accepted),
            1 => Some(Self::UnacceptableProtocolVersion),
            2 => Some(Self::IdentifierRejected),
            3 => Some(Self::ServerUnavailable),
            4 => Some(Self::BadUserNameOrPassword),
            5 => Some(Self::NotAuthorized),
            _ => None,
        }
    }

    /// Returns the wire value.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Accepted => 0,
            Self::UnacceptableProtocolVersion => 1,
            Self::IdentifierRejected => 2,
            Self::ServerUnavailable => 3,
            Self::BadUserNameOrPassword => 4,
            Self::NotAuthorized => 5,
        }
    }

    /// Returns `true` if the connection was accepted.
    #[inline]
    #[must_use]
    pub const fn is_accepted(self) -> bool {
        matches!(self, Self::Accepted)
    }
}

impl fmt::Display for ConnectReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Accepted => "accepted",
            Self::UnacceptableProtocolVersion => "unacceptable protocol version",
            Self::IdentifierRejected => "identifier rejected",
            Self::ServerUnavailable => "server unavailable",
            Self::BadUserNameOrPassword => "bad user name or password",
            Self::NotAuthorized => "not authorized",
        };
        f.write_str(text)
    }
}

// ============================================================================
// SubscribeReturnCode
// ============================================================================

/// Per-filter SUBACK return code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscribeReturnCode {
    /// Subscription granted at this QoS.
    Success(QoS),
    /// Subscription refused (0x80).
    Failure,
}

// ============================================================================
// Packet Payloads
// ============================================================================

/// CONNECT packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    /// Client identifier.
    pub client_id: ClientId,
    /// Keep-alive interval in seconds (0 disables).
    pub keep_alive: u16,
    /// Discard any previous session state.
    pub clean_session: bool,
    /// Optional user name.
    pub username: Option<String>,
    /// Optional password (only valid with a user name).
    pub password: Option<Bytes>,
}

impl Connect {
    /// Creates a CONNECT with no credentials.
    #[must_use]
    pub fn new(client_id: ClientId, keep_alive: u16, clean_session: bool) -> Self {
        Self {
            client_id,
            keep_alive,
            clean_session,
            username: None,
            password: None,
        }
    }
}

/// CONNACK packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    /// Broker resumed a stored session.
    pub session_present: bool,
    /// Outcome of the connect.
    pub return_code: ConnectReturnCode,
}

/// PUBLISH packet.
///
/// Outbound QoS 0 publishes still carry a `packet_id` so the client can
/// track their completion; it is never written to the wire for QoS 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    /// Redelivery flag.
    pub dup: bool,
    /// Delivery quality of service.
    pub qos: QoS,
    /// Retain flag.
    pub retain: bool,
    /// Topic name (no wildcards).
    pub topic: String,
    /// Packet identifier.
    pub packet_id: Option<PacketId>,
    /// Application payload.
    pub payload: Bytes,
}

impl Publish {
    /// Creates a publish.
    #[must_use]
    pub fn new(
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
        packet_id: Option<PacketId>,
    ) -> Self {
        Self {
            dup: false,
            qos,
            retain,
            topic: topic.into(),
            packet_id,
            payload: payload.into(),
        }
    }

    /// Topic the message was published to.
    #[inline]
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Message payload.
    #[inline]
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// SUBSCRIBE packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    /// Packet identifier.
    pub packet_id: PacketId,
    /// Topic filters with requested QoS.
    pub filters: Vec<(String, QoS)>,
}

/// SUBACK packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    /// Packet identifier of the SUBSCRIBE.
    pub packet_id: PacketId,
    /// One return code per requested filter.
    pub return_codes: Vec<SubscribeReturnCode>,
}

/// UNSUBSCRIBE packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    /// Packet identifier.
    pub packet_id: PacketId,
    /// Topic filters to remove.
    pub topics: Vec<String>,
}

// ============================================================================
// Packet
// ============================================================================

/// A decoded or to-be-encoded control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// CONNECT.
    Connect(Connect),
    /// CONNACK.
    ConnAck(ConnAck),
    /// PUBLISH.
    Publish(Publish),
    /// PUBACK.
    PubAck(PacketId),
    /// PUBREC.
    PubRec(PacketId),
    /// PUBREL.
    PubRel(PacketId),
    /// PUBCOMP.
    PubComp(PacketId),
    /// SUBSCRIBE.
    Subscribe(Subscribe),
    /// SUBACK.
    SubAck(SubAck),
    /// UNSUBSCRIBE.
    Unsubscribe(Unsubscribe),
    /// UNSUBACK.
    UnsubAck(PacketId),
    /// PINGREQ.
    PingReq,
    /// PINGRESP.
    PingResp,
    /// DISCONNECT.
    Disconnect,
}

impl Packet {
    /// Returns the packet type.
    #[must_use]
    pub const fn packet_type(&self) -> PacketType {
        match self {
            Self::Connect(_) => PacketType::Connect,
            Self::ConnAck(_) => PacketType::ConnAck,
            Self::Publish(_) => PacketType::Publish,
            Self::PubAck(_) => PacketType::PubAck,
            Self::PubRec(_) => PacketType::PubRec,
            Self::PubRel(_) => PacketType::PubRel,
            Self::PubComp(_) => PacketType::PubComp,
            Self::Subscribe(_) => PacketType::Subscribe,
            Self::SubAck(_) => PacketType::SubAck,
            Self::Unsubscribe(_) => PacketType::Unsubscribe,
            Self::UnsubAck(_) => PacketType::UnsubAck,
            Self::PingReq => PacketType::PingReq,
            Self::PingResp => PacketType::PingResp,
            Self::Disconnect => PacketType::Disconnect,
        }
    }

    /// Returns `true` for the acknowledgement family.
    #[inline]
    #[must_use]
    pub const fn is_ack(&self) -> bool {
        self.packet_type().is_ack()
    }

    /// Correlation key of this packet, if it takes part in correlation.
    #[must_use]
    pub const fn token_key(&self) -> Option<TokenKey> {
        match self {
            Self::Connect(_) | Self::ConnAck(_) => Some(TokenKey::Connect),
            Self::PingReq | Self::PingResp => Some(TokenKey::Ping),
            Self::Disconnect => Some(TokenKey::Disconnect),
            Self::Publish(p) => match p.packet_id {
                Some(id) => Some(TokenKey::Packet(id)),
                None => None,
            },
            Self::PubAck(id)
            | Self::PubRec(id)
            | Self::PubRel(id)
            | Self::PubComp(id)
            | Self::UnsubAck(id) => Some(TokenKey::Packet(*id)),
            Self::Subscribe(s) => Some(TokenKey::Packet(s.packet_id)),
            Self::SubAck(s) => Some(TokenKey::Packet(s.packet_id)),
            Self::Unsubscribe(u) => Some(TokenKey::Packet(u.packet_id)),
        }
    }

    /// Returns `true` if queueing this packet registers a new token.
    ///
    /// PUBREL continues the token of its PUBLISH, and acknowledgements
    /// never own one.
    #[must_use]
    pub const fn registers_token(&self) -> bool {
        match self {
            Self::Connect(_)
            | Self::Subscribe(_)
            | Self::Unsubscribe(_)
            | Self::PingReq
            | Self::Disconnect => true,
            Self::Publish(p) => p.packet_id.is_some(),
            _ => false,
        }
    }

    /// Returns `true` for acknowledgements whose missing token means a
    /// redelivery rather than a protocol divergence.
    #[inline]
    #[must_use]
    pub const fn is_tolerated_orphan(&self) -> bool {
        matches!(self, Self::PubAck(_) | Self::PubRec(_) | Self::PubComp(_))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn id(value: u16) -> PacketId {
        PacketId::new(value).unwrap()
    }

    #[test]
    fn test_packet_type_from_header() {
        assert_eq!(PacketType::from_header(0x30), Some(PacketType::Publish));
        assert_eq!(PacketType::from_header(0x62), Some(PacketType::PubRel));
        assert_eq!(PacketType::from_header(0x00), None);
        assert_eq!(PacketType::from_header(0xF0), None);
    }

    #[test]
    fn test_ack_family() {
        assert!(Packet::PubAck(id(1)).is_ack());
        assert!(Packet::PingResp.is_ack());
        assert!(!Packet::PubRel(id(1)).is_ack());
        assert!(!Packet::Disconnect.is_ack());
    }

    #[test]
    fn test_token_keys() {
        assert_eq!(Packet::PingReq.token_key(), Some(TokenKey::Ping));
        assert_eq!(Packet::PubRel(id(7)).token_key(), Some(TokenKey::Packet(id(7))));
        let qos0 = Publish::new("t", "x", QoS::AtMostOnce, false, None);
        assert_eq!(Packet::Publish(qos0).token_key(), None);
    }

    #[test]
    fn test_registers_token() {
        let tracked = Publish::new("t", "x", QoS::AtMostOnce, false, Some(id(3)));
        assert!(Packet::Publish(tracked).registers_token());
        assert!(Packet::Disconnect.registers_token());
        assert!(!Packet::PubRel(id(3)).registers_token());
        assert!(!Packet::PubAck(id(3)).registers_token());
    }

    #[test]
    fn test_tolerated_orphans() {
        assert!(Packet::PubComp(id(1)).is_tolerated_orphan());
        assert!(!Packet::PingResp.is_tolerated_orphan());
        let suback = SubAck {
            packet_id: id(1),
            return_codes: vec![SubscribeReturnCode::Failure],
        };
        assert!(!Packet::SubAck(suback).is_tolerated_orphan());
    }

    #[test]
    fn test_qos_parse() {
        assert_eq!(QoS::try_from(2).unwrap(), QoS::ExactlyOnce);
        assert!(QoS::try_from(3).is_err());
    }

    #[test]
    fn test_connect_return_code_roundtrip() {
        for code in 0..=5 {
            let rc = ConnectReturnCode::from_u8(code).unwrap();
            assert_eq!(rc.as_u8(), code);
        }
        assert!(ConnectReturnCode::from_u8(6).is_none());
        assert!(ConnectReturnCode::Accepted.is_accepted());
    }
}
