//! `ClientContext`: owns id allocation, the channel and operation tables,
//! the transport registry, search/beacon handling, and the task that
//! demultiplexes every inbound frame to the right handler (spec.md §4.5,
//! §5).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use codec::{ByteOrder, CommandId, PayloadReader, PayloadWriter};
use log::{debug, info, warn};
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::beacon::BeaconHandler;
use crate::channel::{Channel, ChannelRequester, Notification, PendingOperation};
use crate::ids::{Cid, IdAllocator, Ioid};
use crate::options::ContextOptions;
use crate::search::SearchManager;
use crate::transport::registry::TransportRegistry;
use crate::transport::tcp::TcpTransport;
use crate::transport::udp::{UdpMessage, UdpTransport};
use crate::transport::{InboundFrame, OutgoingFrame, Sender, TransportHandle};

const SEARCH_TIMER_PERIOD: Duration = Duration::from_millis(100);

pub struct ClientContext {
    options: ContextOptions,
    cid_alloc: IdAllocator,
    ioid_alloc: IdAllocator,
    channels: RwLock<AHashMap<Cid, Arc<Channel>>>,
    /// The context-wide IOID arena (spec.md §9's resolution for the
    /// cyclic channel/operation reference problem): every live operation,
    /// regardless of which channel it belongs to, looked up by IOID.
    operations: RwLock<AHashMap<Ioid, Arc<dyn PendingOperation>>>,
    transports: TransportRegistry,
    search: SearchManager,
    beacons: BeaconHandler,
    udp: RwLock<Option<Arc<UdpTransport>>>,
    callback_tx: mpsc::UnboundedSender<Notification>,
}

impl ClientContext {
    pub fn new(options: ContextOptions) -> Arc<Self> {
        let (callback_tx, callback_rx) = mpsc::unbounded_channel();

        let ctx = Arc::new(Self {
            options,
            cid_alloc: IdAllocator::default(),
            ioid_alloc: IdAllocator::default(),
            channels: RwLock::new(AHashMap::new()),
            operations: RwLock::new(AHashMap::new()),
            transports: TransportRegistry::new(),
            search: SearchManager::new(),
            beacons: BeaconHandler::new(),
            udp: RwLock::new(None),
            callback_tx,
        });

        tokio::spawn(Self::callback_dispatch_loop(callback_rx));
        ctx
    }

    /// Delivers queued state-change notifications to the application
    /// strictly outside any internal lock (spec.md §3, §5).
    async fn callback_dispatch_loop(mut rx: mpsc::UnboundedReceiver<Notification>) {
        while let Some(notification) = rx.recv().await {
            match notification {
                Notification::StateChange { requester, cid, state } => {
                    requester.channel_state_change(cid, state);
                }
            }
        }
    }

    /// Binds the discovery socket and starts the periodic search-resend
    /// and inbound-dispatch tasks (spec.md §4.2, §4.3).
    pub async fn start(self: &Arc<Self>) -> std::io::Result<()> {
        let (udp, mut udp_rx) = UdpTransport::bind(self.options.discovery_bind).await?;
        *self.udp.write() = Some(udp);

        let ctx = self.clone();
        tokio::spawn(async move {
            while let Some(msg) = udp_rx.recv().await {
                ctx.on_udp_message(msg).await;
            }
        });

        let ctx = self.clone();
        tokio::spawn(async move { ctx.search_timer_loop().await });

        Ok(())
    }

    async fn search_timer_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(SEARCH_TIMER_PERIOD);
        loop {
            interval.tick().await;
            let now = Instant::now();
            let due = self.search.due_for_resend(now);
            if due.is_empty() {
                continue;
            }

            let Some(udp) = self.udp.read().clone() else { continue };
            for (cid, name) in due {
                self.send_search_datagram(&udp, cid, &name).await;
            }
        }
    }

    async fn send_search_datagram(&self, udp: &UdpTransport, cid: Cid, name: &str) {
        let mut w = PayloadWriter::new(ByteOrder::Big);
        w.write_u32(0); // search sequence id: unused for single-CID resends
        w.write_u8(0); // reserved
        w.write_u16(1); // one CID in this datagram
        w.write_u32(cid.0);
        w.write_string(name);
        let payload = w.into_inner();

        for addr in self.options.search_targets() {
            if let Err(e) = udp.send_search(*addr, &payload).await {
                warn!("search send to {addr} failed: {e}");
            }
        }
    }

    async fn on_udp_message(self: &Arc<Self>, msg: UdpMessage) {
        match msg.command {
            CommandId::Beacon => {
                if self.beacons.on_beacon(msg.from) {
                    info!("new server beacon from {}; accelerating pending searches", msg.from);
                    self.search.reset_backoffs(Instant::now());
                }
            }
            CommandId::SearchResponse => self.on_search_response(msg),
            other => debug!("udp: ignoring {other:?} from {}", msg.from),
        }
    }

    /// spec.md §4.2's search-response payload: sequence id, found flag, a
    /// 12-byte server-guid-or-reserved block, a sentinel, the responding
    /// server's address/port (zero address means "use the datagram's
    /// source"), then a list of matched CIDs.
    fn on_search_response(self: &Arc<Self>, msg: UdpMessage) {
        let mut reader = PayloadReader::new(&msg.payload, ByteOrder::Big);
        let Ok(_sequence_id) = reader.read_u32() else { return };
        let Ok(found) = reader.read_u8() else { return };
        if found == 0 {
            return;
        }
        if reader.read_bytes(12).is_err() {
            return;
        }
        let Ok(ip_bits) = reader.read_u32() else { return };
        let Ok(port) = reader.read_u16() else { return };
        let Ok(cid_count) = reader.read_u16() else { return };

        let addr = if ip_bits == 0 {
            SocketAddr::new(msg.from.ip(), port)
        } else {
            SocketAddr::new(std::net::Ipv4Addr::from(ip_bits).into(), port)
        };

        for _ in 0..cid_count {
            let Ok(raw_cid) = reader.read_u32() else { return };
            let cid = Cid(raw_cid);
            if !self.search.is_pending(cid) {
                continue;
            }
            let Some(channel) = self.channels.read().get(&cid).cloned() else { continue };
            self.search.unregister(cid);
            self.connect_channel(channel, addr);
        }
    }

    fn connect_channel(self: &Arc<Self>, channel: Arc<Channel>, addr: SocketAddr) {
        let priority = channel.priority;
        if let Some(transport) = self.transports.get(addr, priority) {
            channel.on_search_found(transport);
            return;
        }

        let ctx = self.clone();
        let conn_timeout = self.options.conn_timeout;
        let flush_strategy = self.options.flush_strategy;
        tokio::spawn(async move {
            match TcpTransport::connect_with_strategy(addr, conn_timeout, flush_strategy).await {
                Ok((transport, inbound_rx)) => {
                    ctx.transports.insert(addr, priority, transport.clone());
                    channel.on_search_found(transport.clone() as Arc<dyn TransportHandle>);
                    ctx.run_transport_dispatch(transport, inbound_rx).await;
                }
                Err(e) => {
                    warn!("connect to {addr} failed: {e}; re-queuing search for {}", channel.name);
                    ctx.search.register(channel.cid, channel.name.clone(), Instant::now());
                }
            }
        });
    }

    /// Drains `inbound_rx` into `dispatch_inbound` until the transport's
    /// receive loop ends, then runs the DISCONNECTED transition. Exposed so
    /// a transport acquired outside the normal search path (tests driving a
    /// mock server, or a custom discovery mechanism) can still be wired
    /// into dispatch.
    pub async fn run_transport_dispatch(
        self: Arc<Self>,
        transport: Arc<TcpTransport>,
        mut inbound_rx: mpsc::UnboundedReceiver<InboundFrame>,
    ) {
        while let Some(frame) = inbound_rx.recv().await {
            self.dispatch_inbound(frame);
        }
        self.on_transport_closed(transport as Arc<dyn TransportHandle>);
    }

    fn operations_for_channel(&self, channel: &Channel) -> Vec<Arc<dyn PendingOperation>> {
        let operations = self.operations.read();
        channel.ioids().into_iter().filter_map(|ioid| operations.get(&ioid).cloned()).collect()
    }

    fn on_transport_closed(self: &Arc<Self>, transport: Arc<dyn TransportHandle>) {
        let channels: Vec<Arc<Channel>> = self
            .channels
            .read()
            .values()
            .filter(|ch| matches!(ch.current_transport(), Some(t) if Arc::ptr_eq(&t, &transport)))
            .cloned()
            .collect();

        for channel in channels {
            let ops = self.operations_for_channel(&channel);
            channel.on_transport_closed(&ops);
            self.search.register(channel.cid, channel.name.clone(), Instant::now());
        }
    }

    /// Command-byte dispatch table of spec.md §4.5: every data-response
    /// command is routed by IOID through the context-wide operation
    /// arena; everything else is a fixed handler.
    fn dispatch_inbound(self: &Arc<Self>, frame: InboundFrame) {
        let mut reader = PayloadReader::new(&frame.payload, frame.header.order);

        if frame.header.command.is_data_response() {
            self.dispatch_data_response(frame.header.command, &mut reader);
            return;
        }

        match frame.header.command {
            CommandId::ConnectionValidation => self.on_connection_validation(&frame.transport),
            CommandId::Echo => self.on_echo(&frame.transport),
            CommandId::CreateChannel => self.on_create_channel_response(&mut reader, frame.transport),
            CommandId::DestroyChannel => {}
            CommandId::Message => self.on_message(&mut reader),
            other => debug!("tcp: ignoring {other:?}"),
        }
    }

    fn dispatch_data_response(&self, command: CommandId, reader: &mut PayloadReader) {
        let Ok(raw_ioid) = reader.read_u32() else {
            warn!("{command:?} response truncated before IOID");
            return;
        };
        let Ok(qos_byte) = reader.read_u8() else {
            warn!("{command:?} response truncated before QoS byte");
            return;
        };
        let qos = codec::QosFlags::from_bits_truncate(qos_byte);

        let op = self.operations.read().get(&Ioid(raw_ioid)).cloned();
        match op {
            Some(op) => op.on_data(qos, reader),
            None => debug!("{command:?} response for unknown or already-destroyed ioid {raw_ioid}"),
        }
    }

    fn on_connection_validation(&self, transport: &Arc<dyn TransportHandle>) {
        transport.enqueue_handshake(Arc::new(ConnectionValidatedReply));
        transport.mark_verified();
    }

    fn on_echo(&self, transport: &Arc<dyn TransportHandle>) {
        transport.enqueue(Arc::new(EchoReply));
    }

    fn on_message(&self, reader: &mut PayloadReader) {
        let Ok(raw_ioid) = reader.read_u32() else { return };
        let Ok(severity) = reader.read_u8() else { return };
        let Ok(text) = reader.read_string() else { return };
        match severity {
            0 => debug!("message for ioid {raw_ioid}: {text}"),
            1 => warn!("message for ioid {raw_ioid}: {text}"),
            _ => warn!("message (error) for ioid {raw_ioid}: {text}"),
        }
    }

    /// CID, SID, status, and (on success) a trailing access-rights byte
    /// this engine does not interpret (spec.md §4.6).
    fn on_create_channel_response(self: &Arc<Self>, reader: &mut PayloadReader, transport: Arc<dyn TransportHandle>) {
        let Ok(raw_cid) = reader.read_u32() else { return };
        let Ok(sid) = reader.read_u32() else { return };
        let status = crate::error::Status::deserialize(reader).unwrap_or_else(|_| {
            crate::error::Status::from_kind(crate::error::ErrorKind::RequestNotInitialized)
        });

        let Some(channel) = self.channels.read().get(&Cid(raw_cid)).cloned() else {
            return;
        };

        let ops = self.operations_for_channel(&channel);
        channel.on_create_channel_response(sid, status.is_ok(), &ops, transport);
    }

    pub fn allocate_cid(&self) -> Cid {
        Cid(self.cid_alloc.allocate())
    }

    pub fn allocate_ioid(&self) -> Ioid {
        Ioid(self.ioid_alloc.allocate())
    }

    pub fn register_operation(&self, op: Arc<dyn PendingOperation>) {
        self.operations.write().insert(op.ioid(), op);
    }

    pub fn unregister_operation(&self, ioid: Ioid) {
        self.operations.write().remove(&ioid);
        self.ioid_alloc.free(ioid.0);
    }

    /// Creates a channel, registers it under a freshly allocated CID, and
    /// enters the search-pending state (spec.md §4.2, §4.6).
    pub fn create_channel(self: &Arc<Self>, name: String, priority: u8, requester: Arc<dyn ChannelRequester>) -> Arc<Channel> {
        let cid = self.allocate_cid();
        let channel = Channel::new(name.clone(), cid, priority, None, requester, self.callback_tx.clone());
        self.channels.write().insert(cid, channel.clone());
        self.search.register(cid, name, Instant::now());
        channel
    }

    /// Destroys a channel and every operation still bound to it, then
    /// frees its CID and their IOIDs (spec.md §4.6).
    pub fn destroy_channel(&self, channel: &Arc<Channel>) {
        let ops = self.operations_for_channel(channel);
        channel.destroy(&ops);
        self.search.unregister(channel.cid);

        let mut operations = self.operations.write();
        for op in &ops {
            operations.remove(&op.ioid());
            self.ioid_alloc.free(op.ioid().0);
        }
        drop(operations);

        self.channels.write().remove(&channel.cid);
        self.cid_alloc.free(channel.cid.0);
    }
}

/// The client's half of the connection-validation handshake: an empty
/// acknowledgement (spec.md §4.4; the introspection-library fields real
/// implementations attach here — client-side buffer size, authorization
/// — are out of scope per spec.md §1).
struct ConnectionValidatedReply;

impl Sender for ConnectionValidatedReply {
    fn build_frame(&self) -> Option<OutgoingFrame> {
        Some(OutgoingFrame {
            command: CommandId::ConnectionValidated,
            payload: bytes::BytesMut::new(),
        })
    }
}

/// Reply to a server-initiated ECHO, alongside the transport's own
/// periodic keep-alive send (spec.md §4.4 "expects an ECHO reply").
struct EchoReply;

impl Sender for EchoReply {
    fn build_frame(&self) -> Option<OutgoingFrame> {
        Some(OutgoingFrame { command: CommandId::Echo, payload: bytes::BytesMut::new() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ConnectionState;

    struct RecordingChannelRequester {
        states: parking_lot::Mutex<Vec<ConnectionState>>,
    }

    impl ChannelRequester for RecordingChannelRequester {
        fn channel_state_change(&self, _cid: Cid, state: ConnectionState) {
            self.states.lock().push(state);
        }
    }

    #[tokio::test]
    async fn create_channel_registers_a_pending_search() {
        let ctx = ClientContext::new(ContextOptions::default());
        let requester = Arc::new(RecordingChannelRequester { states: parking_lot::Mutex::new(Vec::new()) });
        let channel = ctx.create_channel("testCounter".into(), 0, requester);
        assert!(ctx.search.is_pending(channel.cid));
    }

    #[tokio::test]
    async fn destroy_channel_frees_its_cid() {
        let ctx = ClientContext::new(ContextOptions::default());
        let requester = Arc::new(RecordingChannelRequester { states: parking_lot::Mutex::new(Vec::new()) });
        let channel = ctx.create_channel("testCounter".into(), 0, requester);
        let cid = channel.cid;
        ctx.destroy_channel(&channel);
        assert!(!ctx.cid_alloc.is_live(cid.0));
        assert!(!ctx.search.is_pending(cid));
    }
}
