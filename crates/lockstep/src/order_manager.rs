//! The lockstep tick state machine
//!
//! Distinguishes *net-ticks* from *local ticks*: a net-tick occurs when
//! `local_frame % net_tick_scale == 0` and is the only point where a
//! net-frame's worth of orders may be sent and processed. Between
//! net-ticks only immediate work runs. The net-frame advances exactly
//! when every playing client has supplied one packet for it.

use bytes::Bytes;

use rampart_connection::{Connection, ReplaySink};
use rampart_protocol::{wire, ClientId, ConnectionState, NetFrame, Packet, PacketKind};

use crate::{
    run_unsynced, Control, FrameData, LockstepError, LockstepSettings, Order, OrderCodec,
    OrderProcessor, SyncChecker, SyncReport, World,
};

/// An empty order frame is forced out every this many net-frames, so the
/// server keeps seeing a live client even when no orders are issued.
pub const ORDER_KEEPALIVE_FRAMES: u32 = 5;

/// Drives a connection through the lockstep loop and hands incoming
/// orders to the simulation in an order that is bit-identical on every
/// peer.
pub struct OrderManager {
    connection: Box<dyn Connection>,
    codec: Box<dyn OrderCodec>,
    settings: LockstepSettings,
    frame_data: FrameData,
    sync_checker: SyncChecker,

    local_frame: u64,
    net_frame: NetFrame,
    next_order_frame: NetFrame,

    local_orders: Vec<Order>,
    local_immediate: Vec<Order>,
    received_immediate: Vec<(ClientId, Bytes)>,

    catchup: u32,
    is_catching_up: bool,

    game_started: bool,
    disposed: bool,
    generate_sync_report: bool,

    game_save_last_frame: Option<NetFrame>,
    game_save_last_sync_frame: Option<NetFrame>,
}

impl OrderManager {
    /// Binds the manager to a connection and order codec.
    pub fn new(
        connection: Box<dyn Connection>,
        codec: Box<dyn OrderCodec>,
        settings: LockstepSettings,
    ) -> Self {
        Self {
            connection,
            codec,
            settings,
            frame_data: FrameData::new(),
            sync_checker: SyncChecker::new(),
            local_frame: 0,
            net_frame: 0,
            next_order_frame: 0,
            local_orders: Vec::new(),
            local_immediate: Vec::new(),
            received_immediate: Vec::new(),
            catchup: 0,
            is_catching_up: false,
            game_started: false,
            disposed: false,
            generate_sync_report: false,
            game_save_last_frame: None,
            game_save_last_sync_frame: None,
        }
    }

    /// The net-frame currently being assembled.
    pub fn net_frame(&self) -> NetFrame {
        self.net_frame
    }

    /// Local frame counter; advances once per successful `try_tick`.
    pub fn local_frame(&self) -> u64 {
        self.local_frame
    }

    /// Frame number the next outgoing order batch will carry.
    pub fn next_order_frame(&self) -> NetFrame {
        self.next_order_frame
    }

    /// True while the inbound backlog calls for extra local ticks.
    pub fn is_catching_up(&self) -> bool {
        self.is_catching_up
    }

    /// Extra ticks the outer loop should run this render frame to drain
    /// the backlog.
    pub fn catchup_ticks(&self) -> u32 {
        self.catchup
    }

    /// The id the transport assigned to this client.
    pub fn local_client_id(&self) -> ClientId {
        self.connection.local_client_id()
    }

    /// Transport state, for the outer loop's disconnect handling.
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// The transport failure message, if the connection died.
    pub fn connection_error(&self) -> Option<String> {
        self.connection.error_message()
    }

    /// Frame buffering state, for diagnostics and UI.
    pub fn frame_data(&self) -> &FrameData {
        &self.frame_data
    }

    /// True once `dispose` ran or an order requested shutdown.
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Routes every future inbound packet into the sink.
    pub fn start_recording(&mut self, sink: Box<dyn ReplaySink>) {
        self.connection.start_recording(sink);
    }

    /// Marks the session as resuming from a game save: order sending is
    /// suppressed up to `last_frame` and zero hashes are sent up to
    /// `last_sync_frame`.
    pub fn set_game_save_bounds(&mut self, last_frame: NetFrame, last_sync_frame: NetFrame) {
        self.game_save_last_frame = Some(last_frame);
        self.game_save_last_sync_frame = Some(last_sync_frame);
    }

    /// Buffers an order for transmission on the next net-tick.
    pub fn issue(&mut self, order: Order) {
        if order.is_immediate {
            self.local_immediate.push(order);
        } else {
            self.local_orders.push(order);
        }
    }

    /// Registers the lobby clients and opens net-frame 1. Idempotent.
    ///
    /// Primes the server with `order_latency` empty order frames so the
    /// outgoing frame counter runs ahead of the simulation.
    pub fn start_game(&mut self, lobby_clients: &[ClientId]) {
        if self.game_started || self.disposed {
            return;
        }
        self.game_started = true;

        let local = self.connection.local_client_id();
        self.frame_data.add_client(local);
        for &client in lobby_clients {
            if client != local {
                self.frame_data.add_client(client);
            }
        }

        self.generate_sync_report =
            self.settings.record_sync_reports && !self.connection.is_replay();

        self.net_frame = 1;
        self.next_order_frame = 1;
        for _ in 0..self.settings.order_latency.max(1) {
            self.send_orders(true);
        }
        tracing::info!(
            local,
            clients = self.frame_data.clients_playing_in_frame().len(),
            "game started"
        );
    }

    /// Lobby-phase tick: exchanges and applies immediate orders only.
    pub fn tick_pregame<W, P, R>(
        &mut self,
        world: &mut W,
        processor: &mut P,
        report: &mut R,
    ) -> Result<(), LockstepError>
    where
        W: World,
        P: OrderProcessor<W>,
        R: SyncReport<W>,
    {
        if self.disposed {
            return Ok(());
        }
        self.send_immediate_orders();
        self.receive_all_and_check_sync::<W, R>(report)?;
        self.process_immediate_orders(world, processor)
    }

    /// One pass of the master state machine. Returns whether the local
    /// frame advanced.
    pub fn try_tick<W, P, R>(
        &mut self,
        world: &mut W,
        processor: &mut P,
        report: &mut R,
    ) -> Result<bool, LockstepError>
    where
        W: World,
        P: OrderProcessor<W>,
        R: SyncReport<W>,
    {
        if self.disposed || !self.game_started {
            return Ok(false);
        }

        let is_net_tick = self.local_frame % u64::from(self.settings.net_tick_scale.max(1)) == 0;

        // The local client is excluded from the readiness probe: it can
        // always self-produce orders for the current frame.
        let mut should_tick = true;
        if is_net_tick {
            should_tick = self
                .frame_data
                .non_local_clients_ready(self.connection.local_client_id());
            if should_tick {
                self.send_orders(false);
            }
        }

        self.send_immediate_orders();
        self.receive_all_and_check_sync::<W, R>(report)?;
        self.process_immediate_orders(world, processor)?;
        if self.disposed {
            return Ok(false);
        }

        self.compensate_for_latency();

        let mut will_tick = should_tick;
        if will_tick && is_net_tick {
            if self.frame_data.is_ready_for_frame() {
                self.process_orders(world, processor, report)?;
            } else {
                will_tick = false;
            }
        }

        if will_tick {
            self.local_frame += 1;
        }
        Ok(will_tick)
    }

    /// Closes the connection and stops the loop. Idempotent.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.connection.dispose();
    }

    fn send_immediate_orders(&mut self) {
        if self.local_immediate.is_empty() || self.disposed {
            return;
        }
        let batch: Vec<Bytes> = self.local_immediate.drain(..).map(|o| o.data).collect();
        self.connection.send_immediate(&batch);
    }

    /// Transmits the buffered orders as the next order frame. Without
    /// `forced`, an empty buffer only goes out on keepalive frames.
    fn send_orders(&mut self, forced: bool) {
        if self.net_frame < 1 {
            return;
        }
        if let Some(last) = self.game_save_last_frame {
            // The save already contains these frames' orders; consume the
            // frame number without transmitting.
            if last >= self.next_order_frame {
                self.local_orders.clear();
                self.next_order_frame += 1;
                return;
            }
        }
        let keepalive = self.net_frame % ORDER_KEEPALIVE_FRAMES == 0;
        if !forced && !keepalive && self.local_orders.is_empty() {
            return;
        }

        let batch: Vec<Bytes> = self.local_orders.drain(..).map(|o| o.data).collect();
        self.connection.send_frame(self.next_order_frame, &batch);
        self.next_order_frame += 1;
    }

    fn receive_all_and_check_sync<W, R>(&mut self, report: &mut R) -> Result<(), LockstepError>
    where
        W: World,
        R: SyncReport<W>,
    {
        let mut inbound = Vec::new();
        self.connection
            .receive(&mut |client, payload| inbound.push((client, payload)));

        for (client, payload) in inbound {
            let packet = Packet::new(client, payload);
            match packet.kind() {
                PacketKind::Disconnect => {
                    tracing::info!(client = packet.from_client, "client quit");
                    self.frame_data.client_quit(packet.from_client);
                }
                PacketKind::SyncHash => {
                    if let Err(e) = self.sync_checker.check(&packet.payload) {
                        if let LockstepError::OutOfSync { frame } = e {
                            report.dump(frame);
                        }
                        return Err(e);
                    }
                }
                PacketKind::Immediate => self
                    .received_immediate
                    .push((packet.from_client, packet.payload)),
                PacketKind::FrameOrders => self
                    .frame_data
                    .add_frame_orders(packet.from_client, packet.payload)?,
                PacketKind::Malformed => {
                    return Err(LockstepError::MalformedPacket {
                        client: packet.from_client,
                        len: packet.payload.len(),
                    })
                }
            }
        }
        Ok(())
    }

    /// Applies buffered immediates on the unsynced-safe path. An
    /// immediate may tear the session down, so the disposed flag is
    /// re-checked after every order.
    fn process_immediate_orders<W, P>(
        &mut self,
        world: &mut W,
        processor: &mut P,
    ) -> Result<(), LockstepError>
    where
        W: World,
        P: OrderProcessor<W>,
    {
        let pending = std::mem::take(&mut self.received_immediate);
        for (client, payload) in pending {
            let orders = self.codec.decode_orders(&payload[4..])?;
            for data in orders {
                if self.disposed {
                    return Ok(());
                }
                let order = Order::immediate(data);
                let control = run_unsynced(self.settings.check_unsynced_code, world, |w| {
                    processor.process_order(w, client, &order)
                })?;
                if control == Control::Shutdown {
                    self.dispose();
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Drains one packet per playing client, dispatches the orders, emits
    /// the sync hash on scale boundaries and advances the net-frame.
    fn process_orders<W, P, R>(
        &mut self,
        world: &mut W,
        processor: &mut P,
        report: &mut R,
    ) -> Result<(), LockstepError>
    where
        W: World,
        P: OrderProcessor<W>,
        R: SyncReport<W>,
    {
        let dispatched = self.frame_data.orders_for_frame(self.codec.as_ref())?;
        for (client, order) in dispatched {
            if self.disposed {
                return Ok(());
            }
            if processor.process_order(world, client, &order) == Control::Shutdown {
                self.dispose();
                return Ok(());
            }
        }

        if self.net_frame % self.settings.sync_frame_scale.max(1) == 0 {
            let hash = match self.game_save_last_sync_frame {
                Some(last) if self.net_frame <= last => 0,
                _ => world.sync_hash(),
            };
            self.connection
                .send_sync(self.net_frame, &wire::sync_hash_body(hash));
        }

        if self.generate_sync_report {
            report.capture_frame(self.net_frame, world);
        }

        self.net_frame += 1;
        Ok(())
    }

    /// Buffer-depth catch-up: the local client's own backlog approximates
    /// how far the server has run ahead of the simulation.
    fn compensate_for_latency(&mut self) {
        let backlog = self
            .frame_data
            .buffer_size_for_client(self.connection.local_client_id());
        self.catchup = backlog.saturating_sub(1) as u32;
        self.is_catching_up = self.settings.use_catchup && self.catchup > 0;
    }
}
