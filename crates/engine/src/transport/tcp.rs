//! One TCP virtual circuit per (server-address, priority): connection
//! handshake, serial send queue, receive demux by IOID (spec.md §4.4).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use codec::{ByteOrder, CommandId};
use log::{debug, warn};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::options::FlushStrategy;

use super::{frame_bytes, InboundFrame, OutgoingFrame, Sender, TransportHandle};

const READ_CHUNK: usize = 4096;

/// How often a `Delayed` transport flushes its coalescing buffer
/// (spec.md §6 `flush-strategy`).
const COALESCE_INTERVAL: Duration = Duration::from_millis(2);

pub struct TcpTransport {
    peer: SocketAddr,
    queue_tx: mpsc::UnboundedSender<Arc<dyn Sender>>,
    flush_tx: mpsc::UnboundedSender<()>,
    order: Mutex<ByteOrder>,
    closed: AtomicBool,
    flush_strategy: FlushStrategy,
    /// Set once the CONNECTION_VALIDATION/ConnectionValidated handshake
    /// completes. Sends queued by `enqueue` before then are held in
    /// `pending_sends` instead of reaching the wire (spec.md line 83).
    verified: AtomicBool,
    pending_sends: Mutex<Vec<Arc<dyn Sender>>>,
}

impl TcpTransport {
    /// Dial `addr` and spawn its send/receive loops. Inbound frames are
    /// handed to the caller (the context's dispatch task) over `inbound_rx`;
    /// this keeps the transport itself free of any context lock ordering
    /// (spec.md §5).
    pub async fn connect(
        addr: SocketAddr,
        conn_timeout: Duration,
    ) -> std::io::Result<(Arc<Self>, mpsc::UnboundedReceiver<InboundFrame>)> {
        Self::connect_with_strategy(addr, conn_timeout, FlushStrategy::Delayed).await
    }

    pub async fn connect_with_strategy(
        addr: SocketAddr,
        conn_timeout: Duration,
        flush_strategy: FlushStrategy,
    ) -> std::io::Result<(Arc<Self>, mpsc::UnboundedReceiver<InboundFrame>)> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true).ok();
        let (read_half, write_half) = stream.into_split();

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (flush_tx, flush_rx) = mpsc::unbounded_channel();

        let transport = Arc::new(Self {
            peer: addr,
            queue_tx,
            flush_tx,
            order: Mutex::new(ByteOrder::Big),
            closed: AtomicBool::new(false),
            flush_strategy,
            verified: AtomicBool::new(false),
            pending_sends: Mutex::new(Vec::new()),
        });

        tokio::spawn(Self::recv_loop(transport.clone(), read_half, inbound_tx));
        tokio::spawn(Self::send_loop(transport.clone(), write_half, queue_rx, flush_rx, conn_timeout));

        Ok((transport, inbound_rx))
    }

    async fn recv_loop(self: Arc<Self>, mut read: OwnedReadHalf, out: mpsc::UnboundedSender<InboundFrame>) {
        let mut buf = BytesMut::with_capacity(READ_CHUNK);

        loop {
            while buf.len() >= codec::HEADER_LEN {
                let header = match codec::Header::decode(&buf[..codec::HEADER_LEN]) {
                    Ok(h) => h,
                    Err(e) => {
                        warn!("tcp {}: bad header, closing transport: {e}", self.peer);
                        self.close();
                        return;
                    }
                };

                let total = codec::HEADER_LEN + header.payload_len as usize;
                if buf.len() < total {
                    break;
                }

                let mut frame = buf.split_to(total);
                let payload = frame.split_off(codec::HEADER_LEN);
                *self.order.lock() = header.order;

                let inbound = InboundFrame {
                    header,
                    payload,
                    transport: self.clone() as Arc<dyn TransportHandle>,
                };
                if out.send(inbound).is_err() {
                    return;
                }
            }

            let mut chunk = [0u8; READ_CHUNK];
            match read.read(&mut chunk).await {
                Ok(0) => {
                    debug!("tcp {}: peer closed", self.peer);
                    self.close();
                    return;
                }
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(e) => {
                    warn!("tcp {}: read error: {e}", self.peer);
                    self.close();
                    return;
                }
            }
        }
    }

    /// Drives the serial send queue and the periodic ECHO keep-alive
    /// (cadence `conn-timeout / 2`, spec.md §6's `conn-timeout` entry).
    /// Frames are appended to a coalescing buffer and flushed according to
    /// `flush_strategy`: `Immediate` writes after every frame, `Delayed`
    /// writes on a short timer so back-to-back sends share one syscall,
    /// and `UserControlled` only writes when `TransportHandle::flush` is
    /// called (spec.md §6 `flush-strategy`).
    async fn send_loop(
        self: Arc<Self>,
        mut write: OwnedWriteHalf,
        mut queue_rx: mpsc::UnboundedReceiver<Arc<dyn Sender>>,
        mut flush_rx: mpsc::UnboundedReceiver<()>,
        conn_timeout: Duration,
    ) {
        let mut echo = tokio::time::interval(conn_timeout / 2);
        echo.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut coalesce = tokio::time::interval(COALESCE_INTERVAL);
        coalesce.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut pending = BytesMut::new();

        loop {
            tokio::select! {
                sender = queue_rx.recv() => {
                    match sender {
                        Some(sender) => {
                            if let Some(frame) = sender.build_frame() {
                                self.append(&mut pending, frame);
                            }
                            if self.flush_strategy == FlushStrategy::Immediate
                                && self.write_pending(&mut write, &mut pending).await.is_err()
                            {
                                self.close();
                                return;
                            }
                        }
                        None => return,
                    }
                }
                _ = coalesce.tick(), if self.flush_strategy == FlushStrategy::Delayed => {
                    if self.write_pending(&mut write, &mut pending).await.is_err() {
                        self.close();
                        return;
                    }
                }
                _ = flush_rx.recv() => {
                    if self.write_pending(&mut write, &mut pending).await.is_err() {
                        self.close();
                        return;
                    }
                }
                _ = echo.tick() => {
                    self.append(&mut pending, OutgoingFrame { command: CommandId::Echo, payload: BytesMut::new() });
                    if self.flush_strategy != FlushStrategy::UserControlled
                        && self.write_pending(&mut write, &mut pending).await.is_err()
                    {
                        self.close();
                        return;
                    }
                }
            }

            if self.is_closed() {
                return;
            }
        }
    }

    fn append(&self, pending: &mut BytesMut, frame: OutgoingFrame) {
        let order = *self.order.lock();
        pending.extend_from_slice(&frame_bytes(order, frame.command, &frame.payload));
    }

    async fn write_pending(&self, write: &mut OwnedWriteHalf, pending: &mut BytesMut) -> std::io::Result<()> {
        if pending.is_empty() {
            return Ok(());
        }
        let bytes = pending.split();
        write.write_all(&bytes).await
    }
}


impl TransportHandle for TcpTransport {
    fn enqueue(&self, sender: Arc<dyn Sender>) {
        if self.verified.load(Ordering::SeqCst) {
            let _ = self.queue_tx.send(sender);
        } else {
            self.pending_sends.lock().push(sender);
        }
    }

    fn enqueue_handshake(&self, sender: Arc<dyn Sender>) {
        let _ = self.queue_tx.send(sender);
    }

    fn mark_verified(&self) {
        if self.verified.swap(true, Ordering::SeqCst) {
            return;
        }
        for sender in self.pending_sends.lock().drain(..) {
            let _ = self.queue_tx.send(sender);
        }
    }

    fn is_verified(&self) -> bool {
        self.verified.load(Ordering::SeqCst)
    }

    fn byte_order(&self) -> ByteOrder {
        *self.order.lock()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn flush(&self) {
        let _ = self.flush_tx.send(());
    }
}
