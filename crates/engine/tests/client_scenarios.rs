//! Drives a `ClientContext` against an in-process mock server standing in
//! for a real pvAccess host, covering the end-to-end flows of spec.md §8
//! that a unit test working on one module in isolation can't reach: the
//! connection-validation handshake gating operation sends, a full
//! create-channel/get round trip, rejecting a concurrent request on a live
//! wire, destroying an operation before its init response arrives, and a
//! transport failure tearing the channel down. UDP discovery itself is
//! bypassed — these tests hand a `TcpTransport` to `Channel::on_search_found`
//! directly, the same hook `ClientContext::connect_channel` uses once a
//! search response names an address.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use codec::header::ByteOrder;
use codec::{CommandId, Header, PayloadReader, PayloadWriter, QosFlags};
use engine::context::ClientContext;
use engine::error::ErrorKind;
use engine::operations::get::{Get, GetRequester};
use engine::operations::put::{Put, PutRequester};
use engine::options::{ContextOptions, FlushStrategy};
use engine::transport::tcp::TcpTransport;
use engine::transport::TransportHandle;
use engine::{BitSet, Channel, ChannelRequester, Cid, ConnectionState, PvValue, Status};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// The server half of one accepted connection: raw frame read/write against
/// the exact wire shapes `engine::transport`/`engine::context` produce and
/// consume.
struct MockServer {
    stream: TcpStream,
}

impl MockServer {
    async fn accept(listener: TcpListener) -> Self {
        let (stream, _) = listener.accept().await.unwrap();
        Self { stream }
    }

    async fn send(&mut self, command: CommandId, payload: BytesMut) {
        let header = Header::new(command, ByteOrder::Big, payload.len() as u32);
        let mut buf = BytesMut::with_capacity(codec::HEADER_LEN + payload.len());
        header.encode(&mut buf);
        buf.extend_from_slice(&payload);
        self.stream.write_all(&buf).await.unwrap();
    }

    async fn recv(&mut self) -> (CommandId, Vec<u8>) {
        let mut header_buf = [0u8; codec::HEADER_LEN];
        self.stream.read_exact(&mut header_buf).await.unwrap();
        let header = Header::decode(&header_buf).unwrap();
        let mut payload = vec![0u8; header.payload_len as usize];
        self.stream.read_exact(&mut payload).await.unwrap();
        (header.command, payload)
    }

    /// Plays the client's half of CONNECTION_VALIDATION and confirms it
    /// replies before anything else crosses the wire.
    async fn validate(&mut self) {
        self.send(CommandId::ConnectionValidation, BytesMut::new()).await;
        let (command, _) = self.recv().await;
        assert_eq!(command, CommandId::ConnectionValidated);
    }

    async fn accept_create_channel(&mut self, sid: u32) {
        let (command, payload) = self.recv().await;
        assert_eq!(command, CommandId::CreateChannel);
        let mut r = PayloadReader::new(&payload, ByteOrder::Big);
        let cid = r.read_u32().unwrap();

        let mut w = PayloadWriter::new(ByteOrder::Big);
        w.write_u32(cid);
        w.write_u32(sid);
        Status::ok().serialize(&mut w);
        self.send(CommandId::CreateChannel, w.into_inner()).await;
    }

    async fn read_get_request(&mut self) -> (u32, QosFlags) {
        let (command, payload) = self.recv().await;
        assert_eq!(command, CommandId::Get);
        let mut r = PayloadReader::new(&payload, ByteOrder::Big);
        let _sid = r.read_u32().unwrap();
        let ioid = r.read_u32().unwrap();
        let qos = QosFlags::from_bits_truncate(r.read_u8().unwrap());
        (ioid, qos)
    }

    async fn answer_get_init(&mut self) {
        let (ioid, qos) = self.read_get_request().await;
        assert!(qos.contains(QosFlags::INIT));
        let mut w = PayloadWriter::new(ByteOrder::Big);
        w.write_u32(ioid);
        w.write_u8(qos.bits());
        Status::ok().serialize(&mut w);
        self.send(CommandId::Get, w.into_inner()).await;
    }

    async fn answer_get(&mut self, value: i32) {
        let (ioid, qos) = self.read_get_request().await;
        let mut w = PayloadWriter::new(ByteOrder::Big);
        w.write_u32(ioid);
        w.write_u8(qos.bits());
        Status::ok().serialize(&mut w);
        BitSet::new().serialize(&mut w);
        PvValue::Int(value).serialize(&mut w);
        self.send(CommandId::Get, w.into_inner()).await;
    }

    async fn answer_put_init(&mut self) {
        let (command, payload) = self.recv().await;
        assert_eq!(command, CommandId::Put);
        let mut r = PayloadReader::new(&payload, ByteOrder::Big);
        let _sid = r.read_u32().unwrap();
        let ioid = r.read_u32().unwrap();
        let qos = QosFlags::from_bits_truncate(r.read_u8().unwrap());
        assert!(qos.contains(QosFlags::INIT));

        let mut w = PayloadWriter::new(ByteOrder::Big);
        w.write_u32(ioid);
        w.write_u8(qos.bits());
        Status::ok().serialize(&mut w);
        self.send(CommandId::Put, w.into_inner()).await;
    }

    /// Reads one PUT sub-request's changed-bitset and value, applying it to
    /// `current` only when the bitset marks something changed, then answers
    /// with a plain PUT_DONE (spec.md §4.8: the PUT response carries no
    /// payload beyond status).
    async fn answer_put(&mut self, current: &mut f64) {
        let (command, payload) = self.recv().await;
        assert_eq!(command, CommandId::Put);
        let mut r = PayloadReader::new(&payload, ByteOrder::Big);
        let _sid = r.read_u32().unwrap();
        let ioid = r.read_u32().unwrap();
        let qos = QosFlags::from_bits_truncate(r.read_u8().unwrap());
        let changed = BitSet::deserialize(&mut r).unwrap();
        let value = PvValue::deserialize(&mut r).unwrap();
        if !changed.is_empty() {
            if let Some(v) = value.as_double() {
                *current = v;
            }
        }

        let mut w = PayloadWriter::new(ByteOrder::Big);
        w.write_u32(ioid);
        w.write_u8(qos.bits());
        Status::ok().serialize(&mut w);
        self.send(CommandId::Put, w.into_inner()).await;
    }

    async fn answer_put_get(&mut self, current: f64) {
        let (command, payload) = self.recv().await;
        assert_eq!(command, CommandId::Put);
        let mut r = PayloadReader::new(&payload, ByteOrder::Big);
        let _sid = r.read_u32().unwrap();
        let ioid = r.read_u32().unwrap();
        let qos = QosFlags::from_bits_truncate(r.read_u8().unwrap());
        assert!(qos.contains(QosFlags::GET));

        let mut w = PayloadWriter::new(ByteOrder::Big);
        w.write_u32(ioid);
        w.write_u8(qos.bits());
        Status::ok().serialize(&mut w);
        PvValue::Double(current).serialize(&mut w);
        self.send(CommandId::Put, w.into_inner()).await;
    }
}

struct ChannelStateRecorder {
    tx: mpsc::UnboundedSender<ConnectionState>,
}

impl ChannelRequester for ChannelStateRecorder {
    fn channel_state_change(&self, _cid: Cid, state: ConnectionState) {
        let _ = self.tx.send(state);
    }
}

struct GetRecorder {
    connect_tx: mpsc::UnboundedSender<bool>,
    done_tx: mpsc::UnboundedSender<(bool, Option<i32>)>,
}

impl GetRequester for GetRecorder {
    fn channel_get_connect(&self, status: &Status) {
        let _ = self.connect_tx.send(status.is_ok());
    }

    fn get_done(&self, status: &Status, _changed: Option<&BitSet>, value: Option<&PvValue>) {
        let _ = self.done_tx.send((status.is_ok(), value.and_then(PvValue::as_int)));
    }
}

struct PutRecorder {
    connect_tx: mpsc::UnboundedSender<bool>,
    put_tx: mpsc::UnboundedSender<bool>,
    get_tx: mpsc::UnboundedSender<Option<f64>>,
}

impl PutRequester for PutRecorder {
    fn channel_put_connect(&self, status: &Status) {
        let _ = self.connect_tx.send(status.is_ok());
    }

    fn put_done(&self, status: &Status) {
        let _ = self.put_tx.send(status.is_ok());
    }

    fn get_done(&self, status: &Status, value: Option<&PvValue>) {
        let _ = self.get_tx.send(value.and_then(PvValue::as_double));
    }
}

/// Connects a fresh `TcpTransport` to `addr` and wires it into `channel` the
/// way `ClientContext::connect_channel` does once a search response names a
/// server, then spawns the context's inbound-dispatch loop for it.
async fn attach_transport(ctx: &Arc<ClientContext>, channel: &Arc<Channel>, addr: SocketAddr) {
    let (transport, inbound_rx) =
        TcpTransport::connect_with_strategy(addr, Duration::from_secs(30), FlushStrategy::Immediate)
            .await
            .unwrap();
    channel.on_search_found(transport.clone() as Arc<dyn TransportHandle>);
    tokio::spawn(ctx.clone().run_transport_dispatch(transport, inbound_rx));
}

#[tokio::test]
async fn simple_get_returns_incrementing_counter_values() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let mut server = MockServer::accept(listener).await;
        server.validate().await;
        server.accept_create_channel(7).await;
        server.answer_get_init().await;
        server.answer_get(1).await;
        server.answer_get(2).await;
    });

    let ctx = ClientContext::new(ContextOptions::default());
    let (state_tx, mut state_rx) = mpsc::unbounded_channel();
    let channel = ctx.create_channel("testCounter".to_string(), 0, Arc::new(ChannelStateRecorder { tx: state_tx }));
    attach_transport(&ctx, &channel, addr).await;

    assert_eq!(state_rx.recv().await.unwrap(), ConnectionState::Connected);

    let (connect_tx, mut connect_rx) = mpsc::unbounded_channel();
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let requester = Arc::new(GetRecorder { connect_tx, done_tx });
    let ioid = ctx.allocate_ioid();
    let get = Get::new(ioid, channel, requester, PvValue::struct_with([("value", PvValue::Int(0))]));
    ctx.register_operation(get.clone());
    get.start().unwrap();

    assert!(connect_rx.recv().await.unwrap());

    get.get(false).unwrap();
    assert_eq!(done_rx.recv().await.unwrap(), (true, Some(1)));

    get.get(false).unwrap();
    assert_eq!(done_rx.recv().await.unwrap(), (true, Some(2)));

    server.await.unwrap();
}

#[tokio::test]
async fn a_second_get_before_the_first_responds_is_rejected() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let mut server = MockServer::accept(listener).await;
        server.validate().await;
        server.accept_create_channel(1).await;
        server.answer_get_init().await;
        server.answer_get(9).await;
    });

    let ctx = ClientContext::new(ContextOptions::default());
    let (state_tx, mut state_rx) = mpsc::unbounded_channel();
    let channel = ctx.create_channel("testCounter".to_string(), 0, Arc::new(ChannelStateRecorder { tx: state_tx }));
    attach_transport(&ctx, &channel, addr).await;
    assert_eq!(state_rx.recv().await.unwrap(), ConnectionState::Connected);

    let (connect_tx, mut connect_rx) = mpsc::unbounded_channel();
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let requester = Arc::new(GetRecorder { connect_tx, done_tx });
    let ioid = ctx.allocate_ioid();
    let get = Get::new(ioid, channel, requester, PvValue::struct_with([("value", PvValue::Int(0))]));
    ctx.register_operation(get.clone());
    get.start().unwrap();
    assert!(connect_rx.recv().await.unwrap());

    // No `.await` between these two: the second must observe the first's
    // request still pending on the wire.
    assert_eq!(get.get(false), Ok(()));
    assert_eq!(get.get(false), Err(ErrorKind::OtherRequestPending));

    assert_eq!(done_rx.recv().await.unwrap(), (true, Some(9)));
    assert!(done_rx.try_recv().is_err());

    server.await.unwrap();
}

#[tokio::test]
async fn destroying_an_operation_before_its_init_response_drops_it_silently() {
    let ctx = ClientContext::new(ContextOptions::default());
    let (state_tx, _state_rx) = mpsc::unbounded_channel();
    let channel = ctx.create_channel("testCounter".to_string(), 0, Arc::new(ChannelStateRecorder { tx: state_tx }));

    let (connect_tx, mut connect_rx) = mpsc::unbounded_channel();
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let requester = Arc::new(GetRecorder { connect_tx, done_tx });
    let ioid = ctx.allocate_ioid();
    let get = Get::new(ioid, channel.clone(), requester, PvValue::struct_with([("value", PvValue::Int(0))]));
    ctx.register_operation(get.clone());

    get.start().unwrap();
    get.destroy(false);

    assert!(!channel.ioids().contains(&ioid));
    assert!(connect_rx.try_recv().is_err());
    assert!(done_rx.try_recv().is_err());
}

#[tokio::test]
async fn a_dropped_connection_disconnects_every_channel_bound_to_it() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let mut server = MockServer::accept(listener).await;
        server.validate().await;
        server.accept_create_channel(3).await;
        drop(server);
    });

    let ctx = ClientContext::new(ContextOptions::default());
    let (state_tx, mut state_rx) = mpsc::unbounded_channel();
    let channel = ctx.create_channel("testCounter".to_string(), 0, Arc::new(ChannelStateRecorder { tx: state_tx }));
    attach_transport(&ctx, &channel, addr).await;

    assert_eq!(state_rx.recv().await.unwrap(), ConnectionState::Connected);
    assert_eq!(state_rx.recv().await.unwrap(), ConnectionState::Disconnected);

    server.await.unwrap();
}

#[tokio::test]
async fn put_then_get_round_trip_respects_the_changed_bitset() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let mut server = MockServer::accept(listener).await;
        server.validate().await;
        server.accept_create_channel(4).await;

        let mut current = 0.0f64;
        server.answer_put_init().await;

        server.answer_put(&mut current).await;
        server.answer_put_get(current).await;

        server.answer_put(&mut current).await;
        server.answer_put_get(current).await;

        server.answer_put(&mut current).await;
        server.answer_put_get(current).await;
    });

    let ctx = ClientContext::new(ContextOptions::default());
    let (state_tx, mut state_rx) = mpsc::unbounded_channel();
    let channel = ctx.create_channel("testValue".to_string(), 0, Arc::new(ChannelStateRecorder { tx: state_tx }));
    attach_transport(&ctx, &channel, addr).await;
    assert_eq!(state_rx.recv().await.unwrap(), ConnectionState::Connected);

    let (connect_tx, mut connect_rx) = mpsc::unbounded_channel();
    let (put_tx, mut put_rx) = mpsc::unbounded_channel();
    let (get_tx, mut get_rx) = mpsc::unbounded_channel();
    let requester = Arc::new(PutRecorder { connect_tx, put_tx, get_tx });
    let ioid = ctx.allocate_ioid();
    let put = Put::new(ioid, channel, requester, PvValue::struct_with([("value", PvValue::Double(0.0))]));
    ctx.register_operation(put.clone());
    put.start().unwrap();
    assert!(connect_rx.recv().await.unwrap());

    let mut full_bitset = BitSet::new();
    full_bitset.set(0);

    put.put(full_bitset.clone(), PvValue::Double(123.0), false).unwrap();
    assert!(put_rx.recv().await.unwrap());
    put.get().unwrap();
    assert_eq!(get_rx.recv().await.unwrap(), Some(123.0));

    // Cleared changed-bitset: the server sees nothing selected and leaves
    // the stored value untouched.
    put.put(BitSet::new(), PvValue::Double(125.0), false).unwrap();
    assert!(put_rx.recv().await.unwrap());
    put.get().unwrap();
    assert_eq!(get_rx.recv().await.unwrap(), Some(123.0));

    put.put(full_bitset, PvValue::Double(124.0), false).unwrap();
    assert!(put_rx.recv().await.unwrap());
    put.get().unwrap();
    assert_eq!(get_rx.recv().await.unwrap(), Some(124.0));

    server.await.unwrap();
}
