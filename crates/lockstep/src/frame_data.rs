//! Per-client frame order queues and readiness
//!
//! A client is *playing* once registered and until it quits. The
//! simulation may only advance a net-frame when every playing client has
//! at least one buffered packet; the drain order — ascending client id,
//! then intra-packet serialization order — is the total order that keeps
//! all peers bit-identical.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use bytes::Bytes;

use rampart_protocol::ClientId;

use crate::{LockstepError, Order, OrderCodec};

/// FIFO order packets per client, plus the quit set.
#[derive(Debug, Default)]
pub struct FrameData {
    live_clients: BTreeSet<ClientId>,
    quit_clients: BTreeSet<ClientId>,
    queues: BTreeMap<ClientId, VecDeque<Bytes>>,
}

impl FrameData {
    /// Creates an empty frame store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a client. Must precede any `add_frame_orders` for it.
    pub fn add_client(&mut self, client: ClientId) {
        self.live_clients.insert(client);
        self.queues.entry(client).or_default();
    }

    /// Marks a client as quit. Idempotent; a quit client never counts
    /// towards readiness again.
    pub fn client_quit(&mut self, client: ClientId) {
        self.quit_clients.insert(client);
    }

    /// Clients participating in the current frame, ascending.
    pub fn clients_playing_in_frame(&self) -> Vec<ClientId> {
        self.live_clients
            .difference(&self.quit_clients)
            .copied()
            .collect()
    }

    /// Appends a frame packet to the sender's queue.
    pub fn add_frame_orders(
        &mut self,
        client: ClientId,
        payload: Bytes,
    ) -> Result<(), LockstepError> {
        let queue = self
            .queues
            .get_mut(&client)
            .ok_or(LockstepError::UnknownClient { client })?;
        queue.push_back(payload);
        Ok(())
    }

    /// True when every playing client has at least one buffered packet.
    pub fn is_ready_for_frame(&self) -> bool {
        self.clients_playing_in_frame()
            .iter()
            .all(|c| !self.queues[c].is_empty())
    }

    /// Playing clients whose queue is still empty.
    pub fn clients_not_ready_for_frame(&self) -> Vec<ClientId> {
        self.clients_playing_in_frame()
            .into_iter()
            .filter(|c| self.queues[c].is_empty())
            .collect()
    }

    /// True when every playing client other than `local` is ready. The
    /// local client can always self-produce orders for the current frame.
    pub fn non_local_clients_ready(&self, local: ClientId) -> bool {
        self.clients_playing_in_frame()
            .iter()
            .filter(|&&c| c != local)
            .all(|c| !self.queues[c].is_empty())
    }

    /// Pops one packet per playing client in ascending id order and
    /// decodes each into its orders, flattened in that deterministic
    /// order.
    pub fn orders_for_frame(
        &mut self,
        codec: &dyn OrderCodec,
    ) -> Result<Vec<(ClientId, Order)>, LockstepError> {
        let mut dispatched = Vec::new();
        for client in self.clients_playing_in_frame() {
            let payload = self
                .queues
                .get_mut(&client)
                .and_then(|q| q.pop_front())
                .ok_or(LockstepError::NotReady { client })?;
            if payload.len() < 4 {
                return Err(LockstepError::MalformedPacket {
                    client,
                    len: payload.len(),
                });
            }
            for data in codec.decode_orders(&payload[4..])? {
                dispatched.push((client, Order::frame(data)));
            }
        }
        Ok(dispatched)
    }

    /// Backlog depth of one client's queue.
    pub fn buffer_size_for_client(&self, client: ClientId) -> usize {
        self.queues.get(&client).map_or(0, VecDeque::len)
    }
}
