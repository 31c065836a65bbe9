//! Sync-hash comparison across clients
//!
//! The first sync packet observed for a frame is stored; every later one
//! for the same frame must match byte for byte. A mismatch means the
//! simulations have diverged and the game cannot continue.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use bytes::{Buf, Bytes};

use rampart_protocol::NetFrame;

use crate::{LockstepError, World};

/// Diagnostic collaborator fed while the game runs and dumped when an
/// out-of-sync is detected, for off-band comparison with the other
/// clients' reports.
pub trait SyncReport<W: World> {
    /// Captures a snapshot of the world at a net-frame.
    fn capture_frame(&mut self, frame: NetFrame, world: &W);

    /// Writes out everything captured around the diverged frame.
    fn dump(&mut self, frame: NetFrame);
}

/// Report that records nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSyncReport;

impl<W: World> SyncReport<W> for NullSyncReport {
    fn capture_frame(&mut self, _frame: NetFrame, _world: &W) {}

    fn dump(&mut self, _frame: NetFrame) {}
}

/// Append-once map of sync packets by frame.
#[derive(Debug, Default)]
pub struct SyncChecker {
    sync_for_frame: HashMap<NetFrame, Bytes>,
}

impl SyncChecker {
    /// Creates an empty checker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Compares a sync payload (`frame | tag | hash`) against whatever was
    /// stored first for that frame. Length differences count as
    /// mismatches.
    pub fn check(&mut self, payload: &Bytes) -> Result<(), LockstepError> {
        if payload.len() < 5 {
            return Err(LockstepError::MalformedPacket {
                client: 0,
                len: payload.len(),
            });
        }
        let frame = (&payload[..4]).get_u32_le();
        match self.sync_for_frame.entry(frame) {
            Entry::Vacant(slot) => {
                slot.insert(payload.clone());
                Ok(())
            }
            Entry::Occupied(stored) => {
                if stored.get() == payload {
                    Ok(())
                } else {
                    tracing::error!(frame, "sync hash mismatch");
                    Err(LockstepError::OutOfSync { frame })
                }
            }
        }
    }

    /// Frames with a stored sync packet.
    pub fn frames_checked(&self) -> usize {
        self.sync_for_frame.len()
    }
}
