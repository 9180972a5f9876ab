//! Virtual-circuit (TCP) and discovery (UDP) transports (spec.md §4.2, §4.4,
//! §4.5).

pub mod registry;
pub mod tcp;
pub mod udp;

use std::sync::Arc;

use bytes::BytesMut;
use codec::{ByteOrder, CommandId, Header};

/// One queued outbound message: a command plus an already-serialized
/// payload (spec.md §4.1).
pub struct OutgoingFrame {
    pub command: CommandId,
    pub payload: BytesMut,
}

/// Implemented by anything that can be asked, at send time, for its next
/// frame — channels, operations, and the context's own keep-alive sender
/// all implement this (spec.md's Glossary: "Sender").
pub trait Sender: Send + Sync {
    fn build_frame(&self) -> Option<OutgoingFrame>;
}

/// What a channel or operation holds to reach its bound transport
/// (spec.md §4.4, §4.6).
pub trait TransportHandle: Send + Sync {
    /// Queue a sender for its next turn on this transport's serial send
    /// queue. Until the transport is verified (spec.md line 83: "Until
    /// verified, no operation sends are issued"), implementations buffer
    /// rather than send.
    fn enqueue(&self, sender: Arc<dyn Sender>);

    /// Queue a handshake-phase sender that must reach the wire even
    /// before the transport is verified (the CONNECTION_VALIDATED reply
    /// itself). Defaults to `enqueue`.
    fn enqueue_handshake(&self, sender: Arc<dyn Sender>) {
        self.enqueue(sender);
    }

    /// Mark the connection-validation handshake complete, releasing any
    /// sends buffered by `enqueue` since connect.
    fn mark_verified(&self) {}

    /// True once `mark_verified` has run.
    fn is_verified(&self) -> bool {
        true
    }

    /// Byte order negotiated for this transport (spec.md §4.1, §4.4).
    fn byte_order(&self) -> ByteOrder;

    /// True once the underlying socket has failed or been closed.
    fn is_closed(&self) -> bool;

    /// Tear the transport down; every channel bound to it will observe a
    /// DISCONNECTED transition (spec.md §4.6).
    fn close(&self);

    /// Force a write of whatever is buffered, regardless of flush
    /// strategy (spec.md §6 `flush-strategy`). A no-op on transports that
    /// always write immediately.
    fn flush(&self) {}
}

/// A decoded frame delivered from a transport's receive loop to the
/// context's dispatch task (spec.md §4.5).
pub struct InboundFrame {
    pub header: Header,
    pub payload: BytesMut,
    pub transport: Arc<dyn TransportHandle>,
}

fn frame_bytes(order: ByteOrder, command: CommandId, payload: &[u8]) -> BytesMut {
    let header = Header::new(command, order, payload.len() as u32);
    let mut buf = BytesMut::with_capacity(codec::HEADER_LEN + payload.len());
    header.encode(&mut buf);
    buf.extend_from_slice(payload);
    buf
}
