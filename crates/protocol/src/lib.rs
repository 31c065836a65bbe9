//! # Rampart Protocol
//!
//! Wire-level definitions for the rampart lockstep core.
//!
//! All multi-byte integers are little-endian. The server speaks a single
//! framed TCP stream per client:
//!
//! ```text
//! handshake (server -> client, once):
//! ┌───────────────────┬──────┬──────────┐
//! │ HANDSHAKE_VERSION │ u32  │ 4 bytes  │
//! ├───────────────────┼──────┼──────────┤
//! │ assigned ClientId │ u32  │ 4 bytes  │
//! └───────────────────┴──────┴──────────┘
//!
//! every subsequent server -> client packet:
//! ┌───────────────────┬──────┬──────────┐
//! │ len               │ u32  │ 4 bytes  │
//! ├───────────────────┼──────┼──────────┤
//! │ from client       │ u32  │ 4 bytes  │
//! ├───────────────────┼──────┼──────────┤
//! │ payload           │ [u8] │ len bytes│
//! └───────────────────┴──────┴──────────┘
//! ```
//!
//! Client -> server frames carry the same `len | payload` shape without the
//! `from client` field; the server stamps it when relaying.
//!
//! The payload's first four bytes are the net-frame number (0 marks an
//! immediate, out-of-band packet). Byte five, when present, may be a typed
//! order header (`TAG_DISCONNECT`, `TAG_SYNC_HASH`, `TAG_ACK`) or the first
//! byte of an ordinary serialized order. Order serializers must therefore
//! never emit a reserved tag value as the leading byte of an order.

pub mod error;
pub mod packet;
pub mod state;
pub mod wire;

pub use error::WireError;
pub use packet::{
    Packet, PacketKind, ACK_PAYLOAD_LEN, DISCONNECT_PAYLOAD_LEN, IMMEDIATE_FRAME,
    SYNC_PAYLOAD_LEN, TAG_ACK, TAG_DISCONNECT, TAG_SYNC_HASH,
};
pub use state::ConnectionState;
pub use wire::HANDSHAKE_VERSION;

/// Client identifier assigned by the server during the handshake.
pub type ClientId = u32;

/// A simulation frame number synchronized across all peers. Frame 0 is
/// reserved for immediate orders.
pub type NetFrame = u32;
