//! Wire codec.
//!
//! Bit-exact MQTT 3.1.1 encoding and decoding. Every packet is a fixed
//! header (type nibble, flag nibble, variable-length remaining length)
//! followed by a variable header and payload.
//!
//! Decoding is incremental: [`decode`] reports [`Decoded::Incomplete`]
//! instead of failing when the buffer ends mid-packet, and [`PacketCodec`]
//! accumulates socket reads until a whole packet is available.

// ============================================================================
// Imports
// ============================================================================

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::identifiers::{ClientId, PacketId};

use super::packet::{
    ConnAck, Connect, ConnectReturnCode, Packet, PacketType, Publish, QoS, SubAck, Subscribe,
    SubscribeReturnCode, Unsubscribe,
};

// ============================================================================
// Constants
// ============================================================================

/// Largest remaining length the 4-byte encoding can carry.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Largest whole packet: one header byte, four length bytes, the body.
pub const MAX_PACKET_SIZE: usize = MAX_REMAINING_LENGTH + 5;

/// Protocol name in the CONNECT variable header.
const PROTOCOL_NAME: &str = "MQTT";

/// Protocol level for 3.1.1.
const PROTOCOL_LEVEL: u8 = 4;

const CONNECT_FLAG_USERNAME: u8 = 0x80;
const CONNECT_FLAG_PASSWORD: u8 = 0x40;
const CONNECT_FLAG_WILL_RETAIN: u8 = 0x20;
const CONNECT_FLAG_WILL_QOS: u8 = 0x18;
const CONNECT_FLAG_WILL: u8 = 0x04;
const CONNECT_FLAG_CLEAN_SESSION: u8 = 0x02;
const CONNECT_FLAG_RESERVED: u8 = 0x01;

const PUBLISH_FLAG_DUP: u8 = 0x08;
const PUBLISH_FLAG_RETAIN: u8 = 0x01;

const SUBACK_FAILURE: u8 = 0x80;

// ============================================================================
// Decoded
// ============================================================================

/// Result of a successful [`decode`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A whole packet and the number of bytes it occupied.
    Packet(Packet, usize),
    /// More bytes are needed.
    Incomplete,
}

// ============================================================================
// Encoding
// ============================================================================

/// Encodes a packet into a fresh buffer.
///
/// # Errors
///
/// Returns [`Error::Encode`] if the packet cannot be represented on the
/// wire (oversized strings, QoS > 0 publish without packet identifier,
/// empty subscribe).
pub fn encode(packet: &Packet) -> Result<Bytes> {
    let mut out = BytesMut::new();
    encode_to(packet, &mut out)?;
    Ok(out.freeze())
}

/// Encodes a packet, appending to `out`.
///
/// `out` is left untouched on error.
///
/// # Errors
///
/// See [`encode`].
pub fn encode_to(packet: &Packet, out: &mut BytesMut) -> Result<()> {
    let mut body = BytesMut::new();
    let flags = match packet {
        Packet::Connect(connect) => {
            encode_connect(connect, &mut body)?;
            0
        }
        Packet::ConnAck(ack) => {
            body.put_u8(u8::from(ack.session_present));
            body.put_u8(ack.return_code.as_u8());
            0
        }
        Packet::Publish(publish) => encode_publish(publish, &mut body)?,
        Packet::PubAck(id)
        | Packet::PubRec(id)
        | Packet::PubRel(id)
        | Packet::PubComp(id)
        | Packet::UnsubAck(id) => {
            body.put_u16(id.get());
            packet.packet_type().fixed_flags()
        }
        Packet::Subscribe(subscribe) => {
            if subscribe.filters.is_empty() {
                return Err(Error::encode("SUBSCRIBE needs at least one topic filter"));
            }
            body.put_u16(subscribe.packet_id.get());
            for (filter, qos) in &subscribe.filters {
                put_string(&mut body, filter)?;
                body.put_u8(*qos as u8);
            }
            PacketType::Subscribe.fixed_flags()
        }
        Packet::SubAck(suback) => {
            body.put_u16(suback.packet_id.get());
            for code in &suback.return_codes {
                body.put_u8(match code {
                    SubscribeReturnCode::Success(qos) => *qos as u8,
                    SubscribeReturnCode::Failure => SUBACK_FAILURE,
                });
            }
            0
        }
        Packet::Unsubscribe(unsubscribe) => {
            if unsubscribe.topics.is_empty() {
                return Err(Error::encode("UNSUBSCRIBE needs at least one topic filter"));
            }
            body.put_u16(unsubscribe.packet_id.get());
            for topic in &unsubscribe.topics {
                put_string(&mut body, topic)?;
            }
            PacketType::Unsubscribe.fixed_flags()
        }
        Packet::PingReq | Packet::PingResp | Packet::Disconnect => 0,
    };

    if body.len() > MAX_REMAINING_LENGTH {
        return Err(Error::encode(format!(
            "packet body of {} bytes exceeds {MAX_REMAINING_LENGTH}",
            body.len()
        )));
    }

    out.reserve(1 + remaining_length_len(body.len()) + body.len());
    out.put_u8(((packet.packet_type() as u8) << 4) | flags);
    put_remaining_length(out, body.len());
    out.put_slice(&body);
    Ok(())
}

fn encode_connect(connect: &Connect, body: &mut BytesMut) -> Result<()> {
    if connect.password.is_some() && connect.username.is_none() {
        return Err(Error::encode("password requires a user name"));
    }

    let mut flags = 0;
    if connect.clean_session {
        flags |= CONNECT_FLAG_CLEAN_SESSION;
    }
    if connect.username.is_some() {
        flags |= CONNECT_FLAG_USERNAME;
    }
    if connect.password.is_some() {
        flags |= CONNECT_FLAG_PASSWORD;
    }

    put_string(body, PROTOCOL_NAME)?;
    body.put_u8(PROTOCOL_LEVEL);
    body.put_u8(flags);
    body.put_u16(connect.keep_alive);
    put_string(body, connect.client_id.as_str())?;
    if let Some(username) = &connect.username {
        put_string(body, username)?;
    }
    if let Some(password) = &connect.password {
        put_binary(body, password)?;
    }
    Ok(())
}

fn encode_publish(publish: &Publish, body: &mut BytesMut) -> Result<u8> {
    if publish.topic.is_empty() {
        return Err(Error::encode("PUBLISH topic is empty"));
    }
    put_string(body, &publish.topic)?;
    if publish.qos != QoS::AtMostOnce {
        let id = publish
            .packet_id
            .ok_or_else(|| Error::encode("QoS > 0 PUBLISH without packet identifier"))?;
        body.put_u16(id.get());
    }
    body.put_slice(&publish.payload);

    let mut flags = (publish.qos as u8) << 1;
    if publish.dup {
        flags |= PUBLISH_FLAG_DUP;
    }
    if publish.retain {
        flags |= PUBLISH_FLAG_RETAIN;
    }
    Ok(flags)
}

fn put_string(out: &mut BytesMut, value: &str) -> Result<()> {
    put_binary(out, value.as_bytes())
}

fn put_binary(out: &mut BytesMut, value: &[u8]) -> Result<()> {
    let len = u16::try_from(value.len())
        .map_err(|_| Error::encode(format!("field of {} bytes exceeds 65535", value.len())))?;
    out.put_u16(len);
    out.put_slice(value);
    Ok(())
}

const fn remaining_length_len(value: usize) -> usize {
    if value < 128 {
        1
    } else if value < 16_384 {
        2
    } else if value < 2_097_152 {
        3
    } else {
        4
    }
}

fn put_remaining_length(out: &mut BytesMut, mut value: usize) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value > 0 {
            byte |= 0x80;
        }
        out.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}

// ============================================================================
// Decoding
// ============================================================================

/// Decodes one packet from the front of `bytes`.
///
/// # Errors
///
/// Returns [`Error::Decode`] if the bytes cannot be the start of a valid
/// packet. The connection cannot recover from this.
pub fn decode(bytes: &[u8], max_packet_size: usize) -> Result<Decoded> {
    let Some(&header) = bytes.first() else {
        return Ok(Decoded::Incomplete);
    };
    let packet_type = PacketType::from_header(header)
        .ok_or_else(|| Error::decode(format!("reserved packet type {}", header >> 4)))?;
    let flags = header & 0x0F;
    if packet_type != PacketType::Publish && flags != packet_type.fixed_flags() {
        return Err(Error::decode(format!(
            "invalid flags {flags:#06b} for {packet_type:?}"
        )));
    }

    let Some((remaining, len_bytes)) = read_remaining_length(&bytes[1..])? else {
        return Ok(Decoded::Incomplete);
    };
    let total = 1 + len_bytes + remaining;
    if total > max_packet_size {
        return Err(Error::decode(format!(
            "packet of {total} bytes exceeds maximum {max_packet_size}"
        )));
    }
    if bytes.len() < total {
        return Ok(Decoded::Incomplete);
    }

    let body = &bytes[1 + len_bytes..total];
    let packet = decode_body(packet_type, flags, body)?;
    Ok(Decoded::Packet(packet, total))
}

/// Reads the remaining-length field. `None` means more bytes are needed.
fn read_remaining_length(bytes: &[u8]) -> Result<Option<(usize, usize)>> {
    let mut value = 0usize;
    for (i, &byte) in bytes.iter().enumerate().take(4) {
        value |= usize::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if bytes.len() >= 4 {
        return Err(Error::decode("remaining length longer than 4 bytes"));
    }
    Ok(None)
}

fn decode_body(packet_type: PacketType, flags: u8, body: &[u8]) -> Result<Packet> {
    let mut reader = BodyReader::new(body);
    let packet = match packet_type {
        PacketType::Connect => Packet::Connect(decode_connect(&mut reader)?),
        PacketType::ConnAck => {
            let ack_flags = reader.u8()?;
            if ack_flags & !0x01 != 0 {
                return Err(Error::decode("reserved CONNACK flags set"));
            }
            let code = reader.u8()?;
            let return_code = ConnectReturnCode::from_u8(code)
                .ok_or_else(|| Error::decode(format!("unknown CONNACK return code {code}")))?;
            Packet::ConnAck(ConnAck {
                session_present: ack_flags & 0x01 != 0,
                return_code,
            })
        }
        PacketType::Publish => Packet::Publish(decode_publish(flags, &mut reader)?),
        PacketType::PubAck => Packet::PubAck(reader.packet_id()?),
        PacketType::PubRec => Packet::PubRec(reader.packet_id()?),
        PacketType::PubRel => Packet::PubRel(reader.packet_id()?),
        PacketType::PubComp => Packet::PubComp(reader.packet_id()?),
        PacketType::Subscribe => {
            let packet_id = reader.packet_id()?;
            let mut filters = Vec::new();
            while !reader.is_empty() {
                let filter = reader.string()?;
                let options = reader.u8()?;
                let qos = QoS::from_u8(options)
                    .ok_or_else(|| Error::decode(format!("invalid requested QoS byte {options:#04x}")))?;
                filters.push((filter, qos));
            }
            if filters.is_empty() {
                return Err(Error::decode("SUBSCRIBE without topic filters"));
            }
            Packet::Subscribe(Subscribe { packet_id, filters })
        }
        PacketType::SubAck => {
            let packet_id = reader.packet_id()?;
            let mut return_codes = Vec::new();
            while !reader.is_empty() {
                let code = reader.u8()?;
                return_codes.push(match code {
                    SUBACK_FAILURE => SubscribeReturnCode::Failure,
                    _ => SubscribeReturnCode::Success(
                        QoS::from_u8(code)
                            .ok_or_else(|| Error::decode(format!("invalid SUBACK code {code:#04x}")))?,
                    ),
                });
            }
            if return_codes.is_empty() {
                return Err(Error::decode("SUBACK without return codes"));
            }
            Packet::SubAck(SubAck {
                packet_id,
                return_codes,
            })
        }
        PacketType::Unsubscribe => {
            let packet_id = reader.packet_id()?;
            let mut topics = Vec::new();
            while !reader.is_empty() {
                topics.push(reader.string()?);
            }
            if topics.is_empty() {
                return Err(Error::decode("UNSUBSCRIBE without topic filters"));
            }
            Packet::Unsubscribe(Unsubscribe { packet_id, topics })
        }
        PacketType::UnsubAck => Packet::UnsubAck(reader.packet_id()?),
        PacketType::PingReq => Packet::PingReq,
        PacketType::PingResp => Packet::PingResp,
        PacketType::Disconnect => Packet::Disconnect,
    };
    reader.finish(packet_type)?;
    Ok(packet)
}

fn decode_connect(reader: &mut BodyReader<'_>) -> Result<Connect> {
    let name = reader.string()?;
    let level = reader.u8()?;
    if name != PROTOCOL_NAME || level != PROTOCOL_LEVEL {
        return Err(Error::decode(format!(
            "unsupported protocol {name} level {level}"
        )));
    }
    let flags = reader.u8()?;
    if flags & CONNECT_FLAG_RESERVED != 0 {
        return Err(Error::decode("reserved CONNECT flag set"));
    }
    let keep_alive = reader.u16()?;
    let client_id =
        ClientId::new(reader.string()?).map_err(|e| Error::decode(e.to_string()))?;

    if flags & CONNECT_FLAG_WILL != 0 {
        // Will topic and message are skipped.
        reader.string()?;
        reader.binary()?;
    } else if flags & (CONNECT_FLAG_WILL_QOS | CONNECT_FLAG_WILL_RETAIN) != 0 {
        return Err(Error::decode("will QoS or retain set without will flag"));
    }

    let username = if flags & CONNECT_FLAG_USERNAME != 0 {
        Some(reader.string()?)
    } else {
        None
    };
    let password = if flags & CONNECT_FLAG_PASSWORD != 0 {
        Some(Bytes::copy_from_slice(reader.binary()?))
    } else {
        None
    };

    Ok(Connect {
        client_id,
        keep_alive,
        clean_session: flags & CONNECT_FLAG_CLEAN_SESSION != 0,
        username,
        password,
    })
}

fn decode_publish(flags: u8, reader: &mut BodyReader<'_>) -> Result<Publish> {
    let qos = QoS::from_u8((flags >> 1) & 0x03)
        .ok_or_else(|| Error::decode("PUBLISH with QoS 3"))?;
    let topic = reader.string()?;
    if topic.is_empty() || topic.contains(['+', '#']) {
        return Err(Error::decode(format!("invalid PUBLISH topic {topic:?}")));
    }
    let packet_id = if qos == QoS::AtMostOnce {
        None
    } else {
        Some(reader.packet_id()?)
    };
    Ok(Publish {
        dup: flags & PUBLISH_FLAG_DUP != 0,
        qos,
        retain: flags & PUBLISH_FLAG_RETAIN != 0,
        topic,
        packet_id,
        payload: Bytes::copy_from_slice(reader.rest()),
    })
}

// ============================================================================
// BodyReader
// ============================================================================

/// Cursor over a complete packet body.
///
/// The whole body is present, so running short is a decode error here,
/// never an incomplete read.
struct BodyReader<'a> {
    bytes: &'a [u8],
}

impl<'a> BodyReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.bytes.len() < n {
            return Err(Error::decode(format!(
                "packet body truncated: need {n} bytes, have {}",
                self.bytes.len()
            )));
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.bytes.get_u8())
    }

    fn u16(&mut self) -> Result<u16> {
        self.need(2)?;
        Ok(self.bytes.get_u16())
    }

    fn packet_id(&mut self) -> Result<PacketId> {
        PacketId::new(self.u16()?).ok_or_else(|| Error::decode("packet identifier 0"))
    }

    fn binary(&mut self) -> Result<&'a [u8]> {
        let len = usize::from(self.u16()?);
        self.need(len)?;
        let (value, rest) = self.bytes.split_at(len);
        self.bytes = rest;
        Ok(value)
    }

    fn string(&mut self) -> Result<String> {
        let raw = self.binary()?;
        let value = std::str::from_utf8(raw).map_err(|_| Error::decode("string is not UTF-8"))?;
        Ok(value.to_owned())
    }

    fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.bytes)
    }

    fn finish(&self, packet_type: PacketType) -> Result<()> {
        if !self.bytes.is_empty() {
            return Err(Error::decode(format!(
                "{} trailing bytes in {packet_type:?}",
                self.bytes.len()
            )));
        }
        Ok(())
    }
}

// ============================================================================
// PacketCodec
// ============================================================================

/// Incremental decoder over a byte stream.
///
/// Feed it whatever the socket returned with [`PacketCodec::extend`] and
/// drain whole packets with [`PacketCodec::next_packet`].
#[derive(Debug)]
pub struct PacketCodec {
    buffer: BytesMut,
    max_packet_size: usize,
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(MAX_PACKET_SIZE)
    }
}

impl PacketCodec {
    /// Creates a codec rejecting packets larger than `max_packet_size`.
    #[must_use]
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(1024),
            max_packet_size,
        }
    }

    /// Appends bytes read from the socket.
    #[inline]
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet decoded.
    #[inline]
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Decodes the next buffered packet.
    ///
    /// Returns `Ok(None)` when the buffer holds only part of a packet.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] if the buffered bytes are malformed.
    pub fn next_packet(&mut self) -> Result<Option<Packet>> {
        match decode(&self.buffer, self.max_packet_size)? {
            Decoded::Packet(packet, consumed) => {
                self.buffer.advance(consumed);
                Ok(Some(packet))
            }
            Decoded::Incomplete => Ok(None),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
