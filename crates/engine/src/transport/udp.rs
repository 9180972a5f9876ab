//! Discovery socket: datagram send to broadcast/unicast lists, receive and
//! dispatch of search responses and beacons (spec.md §4.2).

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use codec::{ByteOrder, CommandId};
use log::warn;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use super::frame_bytes;

pub struct UdpMessage {
    pub command: CommandId,
    pub payload: BytesMut,
    pub from: SocketAddr,
}

pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Binds the broadcast-listening/search socket and spawns its receive
    /// loop (spec.md §4.2: "Two sockets are bound at context start").
    pub async fn bind(local_addr: SocketAddr) -> std::io::Result<(Arc<Self>, mpsc::UnboundedReceiver<UdpMessage>)> {
        let socket = UdpSocket::bind(local_addr).await?;
        socket.set_broadcast(true)?;

        let transport = Arc::new(Self { socket });
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::recv_loop(transport.clone(), tx));
        Ok((transport, rx))
    }

    async fn recv_loop(self: Arc<Self>, out: mpsc::UnboundedSender<UdpMessage>) {
        let mut buf = vec![0u8; 8192];
        loop {
            let (n, from) = match self.socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => {
                    warn!("udp recv error: {e}");
                    continue;
                }
            };

            if n < codec::HEADER_LEN {
                continue;
            }

            let header = match codec::Header::decode(&buf[..n]) {
                Ok(h) => h,
                Err(e) => {
                    warn!("udp: dropping malformed datagram from {from}: {e}");
                    continue;
                }
            };

            let payload = BytesMut::from(&buf[codec::HEADER_LEN..n]);
            if out
                .send(UdpMessage { command: header.command, payload, from })
                .is_err()
            {
                return;
            }
        }
    }

    /// Send a SEARCH datagram to `dest` (unicast or broadcast address) in
    /// the fixed big-endian order used for all discovery traffic
    /// (spec.md §4.1: byte order is negotiated per-TCP-transport only).
    pub async fn send_search(&self, dest: SocketAddr, payload: &[u8]) -> std::io::Result<()> {
        let bytes = frame_bytes(ByteOrder::Big, CommandId::Search, payload);
        self.socket.send_to(&bytes, dest).await?;
        Ok(())
    }
}
