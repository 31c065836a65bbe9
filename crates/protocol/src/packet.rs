//! Inbound packet representation and classification
//!
//! A `Packet` is one framed message as dispatched to the game thread: the
//! sending client's id plus the raw payload. The payload's leading four
//! bytes are the net-frame field; the optional fifth byte selects the typed
//! order headers below.

use bytes::{Buf, Bytes};

use crate::{ClientId, NetFrame};

/// Net-frame value reserved for immediate (out-of-band) orders.
pub const IMMEDIATE_FRAME: NetFrame = 0;

/// Typed order header: acknowledgement of in-flight order packets.
pub const TAG_ACK: u8 = 0x10;

/// Typed order header: sync hash for a net-frame.
pub const TAG_SYNC_HASH: u8 = 0x65;

/// Typed order header: the sending client quit.
pub const TAG_DISCONNECT: u8 = 0xBF;

/// Payload length of a disconnect packet: `frame | tag`.
pub const DISCONNECT_PAYLOAD_LEN: usize = 5;

/// Payload length of an ack packet: `frame | tag | count`.
pub const ACK_PAYLOAD_LEN: usize = 7;

/// Payload length of a canonical sync packet: `frame | tag | hash`.
pub const SYNC_PAYLOAD_LEN: usize = 9;

/// One inbound message: who sent it and its raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Sending client, stamped by the server when relaying.
    pub from_client: ClientId,

    /// Raw payload: `frame:u32` followed by order bytes.
    pub payload: Bytes,
}

/// What a payload contains, as seen by the order manager.
///
/// Acknowledgements are not represented here: they are intercepted by the
/// transport before dispatch and never reach classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// `frame | TAG_DISCONNECT` — the sender quit.
    Disconnect,

    /// `frame | TAG_SYNC_HASH | hash` — sync hash for a frame.
    SyncHash,

    /// Frame field is zero — out-of-band orders.
    Immediate,

    /// Ordinary orders for a net-frame.
    FrameOrders,

    /// Payload too short to carry a frame field.
    Malformed,
}

impl Packet {
    /// Creates a packet from its parts.
    pub fn new(from_client: ClientId, payload: Bytes) -> Self {
        Self {
            from_client,
            payload,
        }
    }

    /// The net-frame field, if the payload is long enough to carry one.
    pub fn frame(&self) -> Option<NetFrame> {
        if self.payload.len() < 4 {
            return None;
        }
        Some((&self.payload[..4]).get_u32_le())
    }

    /// The typed order header byte, if present.
    pub fn tag(&self) -> Option<u8> {
        self.payload.get(4).copied()
    }

    /// Classifies the payload for dispatch. Checked in the same order the
    /// order manager applies them: disconnect, sync, immediate, orders.
    pub fn kind(&self) -> PacketKind {
        let Some(frame) = self.frame() else {
            return PacketKind::Malformed;
        };
        match self.tag() {
            Some(TAG_DISCONNECT) if self.payload.len() == DISCONNECT_PAYLOAD_LEN => {
                PacketKind::Disconnect
            }
            Some(TAG_SYNC_HASH) => PacketKind::SyncHash,
            _ if frame == IMMEDIATE_FRAME => PacketKind::Immediate,
            _ => PacketKind::FrameOrders,
        }
    }

    /// True for the ack shape the receiver intercepts: a 7-byte tagged
    /// payload attributed to the local client itself.
    pub fn is_ack(&self, local_client: ClientId) -> bool {
        self.from_client == local_client
            && self.payload.len() == ACK_PAYLOAD_LEN
            && self.tag() == Some(TAG_ACK)
    }
}
