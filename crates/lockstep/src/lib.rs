//! # Rampart Lockstep
//!
//! The deterministic core: per-client frame queues, sync-hash comparison,
//! and the order manager that drives them. All peers execute the identical
//! order sequence at identical net-frames; the collaborator traits below
//! are the seams to the game simulation.
//!
//! The simulation is opaque to this crate. Orders are serialized byte
//! payloads; the [`OrderCodec`] splits concatenated batches back into
//! individual orders, the [`OrderProcessor`] applies them to the world, and
//! [`World::sync_hash`] fingerprints the result for divergence detection.
//! Collaborators are passed explicitly into each tick so that neither side
//! owns the other.

pub mod frame_data;
pub mod order_manager;
pub mod sync;

pub use frame_data::FrameData;
pub use order_manager::{OrderManager, ORDER_KEEPALIVE_FRAMES};
pub use sync::{NullSyncReport, SyncChecker, SyncReport};

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use rampart_protocol::{ClientId, NetFrame};

/// A serialized action submitted by one client's simulation. The core only
/// looks at the length and the immediate flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    /// Opaque serialized payload, produced and consumed by the game.
    pub data: Bytes,

    /// Out-of-band orders (chat, lobby, mod switch) bypass lockstep.
    pub is_immediate: bool,
}

impl Order {
    /// An order subject to lockstep sequencing.
    pub fn frame(data: Bytes) -> Self {
        Self {
            data,
            is_immediate: false,
        }
    }

    /// An out-of-band order carried on frame 0.
    pub fn immediate(data: Bytes) -> Self {
        Self {
            data,
            is_immediate: true,
        }
    }
}

/// The game simulation as seen by the lockstep core.
pub trait World {
    /// Deterministic fingerprint of the synced state. Equal inputs must
    /// produce equal hashes on every peer.
    fn sync_hash(&self) -> u32;

    /// Simulation time advanced by one net-frame.
    fn timestep(&self) -> Duration;
}

/// Applies orders to the world. Must be deterministic: identical inputs
/// yield identical world mutations on every peer.
pub trait OrderProcessor<W: World> {
    /// Applies one order from `from`. Returning [`Control::Shutdown`]
    /// disposes the order manager (mod switch, game end).
    fn process_order(&mut self, world: &mut W, from: ClientId, order: &Order) -> Control;
}

/// Continuation directive returned by the order processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Control {
    /// Keep processing.
    #[default]
    Continue,

    /// Tear down the session after this order.
    Shutdown,
}

/// Splits a concatenated order batch into individual orders.
///
/// Implementations define the self-delimiting order encoding. The leading
/// byte of an encoded order must never collide with a reserved packet tag.
pub trait OrderCodec: Send {
    /// Decodes the concatenation; must consume the payload exactly.
    fn decode_orders(&self, payload: &[u8]) -> Result<Vec<Bytes>, LockstepError>;
}

/// Marker byte opening every order encoded by [`LengthPrefixedCodec`].
/// Chosen outside the reserved tag space.
pub const ORDER_MARKER: u8 = 0x01;

/// Simple self-delimiting encoding: `0x01 | u16 len | data` per order.
#[derive(Debug, Clone, Copy, Default)]
pub struct LengthPrefixedCodec;

impl LengthPrefixedCodec {
    /// Encodes one order payload.
    pub fn encode_order(data: &[u8]) -> Bytes {
        let mut buf = Vec::with_capacity(3 + data.len());
        buf.push(ORDER_MARKER);
        buf.extend_from_slice(&(data.len() as u16).to_le_bytes());
        buf.extend_from_slice(data);
        buf.into()
    }
}

impl OrderCodec for LengthPrefixedCodec {
    fn decode_orders(&self, payload: &[u8]) -> Result<Vec<Bytes>, LockstepError> {
        let mut orders = Vec::new();
        let mut rest = payload;
        while !rest.is_empty() {
            if rest.len() < 3 {
                return Err(LockstepError::OrderDecode(format!(
                    "dangling {} bytes",
                    rest.len()
                )));
            }
            if rest[0] != ORDER_MARKER {
                return Err(LockstepError::OrderDecode(format!(
                    "bad order marker {:#04x}",
                    rest[0]
                )));
            }
            let len = u16::from_le_bytes([rest[1], rest[2]]) as usize;
            if rest.len() < 3 + len {
                return Err(LockstepError::OrderDecode(format!(
                    "order of {len} bytes truncated to {}",
                    rest.len() - 3
                )));
            }
            orders.push(Bytes::copy_from_slice(&rest[3..3 + len]));
            rest = &rest[3 + len..];
        }
        Ok(orders)
    }
}

/// Runs `f` on the unsynced-safe code path. With checking enabled the sync
/// hash is snapshotted around the closure; a changed hash means unsynced
/// code mutated synced state, which is fatal.
pub fn run_unsynced<W: World, R>(
    check: bool,
    world: &mut W,
    f: impl FnOnce(&mut W) -> R,
) -> Result<R, LockstepError> {
    if !check {
        return Ok(f(world));
    }
    let before = world.sync_hash();
    let result = f(world);
    let after = world.sync_hash();
    if before != after {
        return Err(LockstepError::UnsyncedMutation { before, after });
    }
    Ok(result)
}

/// Tunables for the lockstep loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockstepSettings {
    /// Empty order frames primed at game start so the server runs ahead of
    /// the simulation by this many frames.
    pub order_latency: u32,

    /// Local frames per net-frame attempt.
    pub net_tick_scale: u32,

    /// Net-frames between sync-hash transmissions.
    pub sync_frame_scale: u32,

    /// Accelerate local ticking while an inbound backlog exists.
    pub use_catchup: bool,

    /// Capture per-frame world snapshots for out-of-sync diagnosis.
    pub record_sync_reports: bool,

    /// Verify that immediate orders leave the sync hash untouched.
    pub check_unsynced_code: bool,
}

impl Default for LockstepSettings {
    fn default() -> Self {
        Self {
            order_latency: 1,
            net_tick_scale: 3,
            sync_frame_scale: 1,
            use_catchup: true,
            record_sync_reports: false,
            check_unsynced_code: false,
        }
    }
}

/// Failures of the deterministic core. Everything here is fatal to the
/// game: the simulation can no longer be trusted to match the peers.
#[derive(Debug, Error)]
pub enum LockstepError {
    /// Two clients disagreed on the world hash for a frame.
    #[error("out of sync in net-frame {frame}")]
    OutOfSync { frame: NetFrame },

    /// Orders arrived for a client that was never registered.
    #[error("unknown client {client}")]
    UnknownClient { client: ClientId },

    /// A client had no queued packet when the frame was drained.
    #[error("client {client} has no orders buffered for the current frame")]
    NotReady { client: ClientId },

    /// A payload too short to carry its declared shape.
    #[error("malformed packet from client {client} ({len} bytes)")]
    MalformedPacket { client: ClientId, len: usize },

    /// The order codec rejected a batch.
    #[error("order decode failed: {0}")]
    OrderDecode(String),

    /// Unsynced code mutated synced state.
    #[error("unsynced code changed the world hash {before:#010x} -> {after:#010x}")]
    UnsyncedMutation { before: u32, after: u32 },
}
