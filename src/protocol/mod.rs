//! MQTT 3.1.1 protocol types and wire codec.
//!
//! # Packet Overview
//!
//! | Packet | Direction | Acknowledged by |
//! |--------|-----------|-----------------|
//! | `CONNECT` | Client → Broker | `CONNACK` |
//! | `PUBLISH` QoS 0 | Both | - |
//! | `PUBLISH` QoS 1 | Both | `PUBACK` |
//! | `PUBLISH` QoS 2 | Both | `PUBREC`, then `PUBREL` → `PUBCOMP` |
//! | `SUBSCRIBE` | Client → Broker | `SUBACK` |
//! | `UNSUBSCRIBE` | Client → Broker | `UNSUBACK` |
//! | `PINGREQ` | Client → Broker | `PINGRESP` |
//! | `DISCONNECT` | Client → Broker | - |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `codec` | Byte-exact encoder and incremental decoder |
//! | `packet` | Typed control packets |

// ============================================================================
// Submodules
// ============================================================================

/// Byte-exact encoder and incremental decoder.
pub mod codec;

/// Typed control packets.
pub mod packet;

// ============================================================================
// Re-exports
// ============================================================================

pub use codec::{
    Decoded, MAX_PACKET_SIZE, MAX_REMAINING_LENGTH, PacketCodec, decode, encode, encode_to,
};
pub use packet::{
    ConnAck, Connect, ConnectReturnCode, Packet, PacketType, Publish, QoS, SubAck, Subscribe,
    SubscribeReturnCode, Unsubscribe,
};
