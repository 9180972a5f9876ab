//! Per-channel lifecycle: name -> remote server/SID binding, pending
//! operations, reconnect logic (spec.md §4.6).

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use ahash::AHashSet;
use codec::{CommandId, PayloadWriter};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::ids::{Cid, Ioid};
use crate::transport::{OutgoingFrame, Sender, TransportHandle};

/// spec.md §4.6 state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    NeverConnected,
    Connected,
    Disconnected,
    Destroyed,
}

/// The application-facing callback for a channel's own lifecycle, as
/// opposed to `PendingOperation`'s per-operation callbacks (spec.md §4.6).
pub trait ChannelRequester: Send + Sync {
    fn channel_state_change(&self, cid: Cid, state: ConnectionState);
}

/// Queued onto the context-wide callback channel so delivery always
/// happens outside any internal lock, on the dispatch task (spec.md §3,
/// §5's "queue of pending state-change notifications").
pub enum Notification {
    StateChange {
        requester: Arc<dyn ChannelRequester>,
        cid: Cid,
        state: ConnectionState,
    },
}

/// An event propagated to every pending operation on a state transition
/// (spec.md §4.6, §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    Disconnected,
    Destroyed,
}

/// The object every operation registers with so the channel and context can
/// reach it for lifecycle events, resubscription and response dispatch,
/// without needing to know the operation's concrete type (spec.md §4.7,
/// §4.9). Each concrete operation keeps a `Weak<Self>` to itself (set at
/// construction via `Arc::new_cyclic`) so it can hand the transport an
/// `Arc<dyn Sender>` for itself from `&self`.
pub trait PendingOperation: Send + Sync {
    fn ioid(&self) -> Ioid;

    /// `report-status(s)` (spec.md §4.7): channel-destroyed or
    /// channel-disconnected propagated to this operation.
    fn report_status(&self, event: ChannelEvent);

    /// Re-arm a subscription operation on a freshly (re)connected
    /// transport; a no-op for non-subscription operations
    /// (spec.md §4.7 `resubscribe-subscription`).
    fn resubscribe(&self, transport: Arc<dyn TransportHandle>) {
        let _ = transport;
    }

    /// Dispatch one inbound response frame, already positioned past the
    /// IOID and QoS byte that routed it here (spec.md §4.5, §4.7).
    fn on_data(&self, qos: codec::QosFlags, reader: &mut codec::PayloadReader);
}

struct Inner {
    state: ConnectionState,
    sid: u32,
    transport: Option<Weak<dyn TransportHandle>>,
    /// True until the first successful CREATE_CHANNEL exchange; flips the
    /// shape of the channel's own send (spec.md §4.6 "Create-channel
    /// exchange").
    issue_create: bool,
}

pub struct Channel {
    pub name: String,
    pub cid: Cid,
    pub priority: u8,
    pub fixed_address: Option<SocketAddr>,
    inner: Mutex<Inner>,
    /// Per-channel IOID map (lock domain 3, spec.md §5): which IOIDs
    /// currently belong to this channel. The operation objects themselves
    /// live in the context-wide arena (`ClientContext::operations`); this
    /// is the Rust restatement of "weak reference... through stable IOID
    /// handles looked up in the context's tables" from spec.md §9.
    ioid_set: Mutex<AHashSet<Ioid>>,
    requester: Arc<dyn ChannelRequester>,
    callback_tx: mpsc::UnboundedSender<Notification>,
}

impl Channel {
    pub fn new(
        name: String,
        cid: Cid,
        priority: u8,
        fixed_address: Option<SocketAddr>,
        requester: Arc<dyn ChannelRequester>,
        callback_tx: mpsc::UnboundedSender<Notification>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            cid,
            priority,
            fixed_address,
            inner: Mutex::new(Inner {
                state: ConnectionState::NeverConnected,
                sid: 0,
                transport: None,
                issue_create: true,
            }),
            ioid_set: Mutex::new(AHashSet::new()),
            requester,
            callback_tx,
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn sid(&self) -> u32 {
        self.inner.lock().sid
    }

    pub fn register_ioid(&self, ioid: Ioid) {
        self.ioid_set.lock().insert(ioid);
    }

    pub fn unregister_ioid(&self, ioid: Ioid) {
        self.ioid_set.lock().remove(&ioid);
    }

    pub fn ioids(&self) -> Vec<Ioid> {
        self.ioid_set.lock().iter().copied().collect()
    }

    pub fn current_transport(&self) -> Option<Arc<dyn TransportHandle>> {
        self.inner.lock().transport.as_ref().and_then(Weak::upgrade)
    }

    fn push_state_change(self: &Arc<Self>, state: ConnectionState) {
        let _ = self.callback_tx.send(Notification::StateChange {
            requester: self.requester.clone(),
            cid: self.cid,
            state,
        });
    }

    /// A name-search response (or equivalent reconnect path) located a
    /// server for this channel; bind the transport and enqueue the
    /// create-channel exchange (spec.md §4.6).
    pub fn on_search_found(self: &Arc<Self>, transport: Arc<dyn TransportHandle>) {
        {
            let mut inner = self.inner.lock();
            inner.transport = Some(Arc::downgrade(&transport));
        }

        transport.enqueue(Arc::new(CreateChannelSender {
            channel: self.clone(),
        }));
    }

    /// CREATE_CHANNEL response arrived: either bind the SID and move to
    /// CONNECTED, or stay searching.
    pub fn on_create_channel_response(
        self: &Arc<Self>,
        sid: u32,
        ok: bool,
        operations: &[Arc<dyn PendingOperation>],
        transport: Arc<dyn TransportHandle>,
    ) {
        if !ok {
            let mut inner = self.inner.lock();
            inner.transport = None;
            return;
        }

        {
            let mut inner = self.inner.lock();
            inner.sid = sid;
            inner.issue_create = false;
            inner.state = ConnectionState::Connected;
        }

        self.push_state_change(ConnectionState::Connected);

        for op in operations {
            op.clone().resubscribe(transport.clone());
        }
    }

    /// The bound transport closed (spec.md §4.6, §7: "Transport-level
    /// failures trigger a DISCONNECTED transition on every channel bound to
    /// the transport").
    pub fn on_transport_closed(self: &Arc<Self>, operations: &[Arc<dyn PendingOperation>]) {
        {
            let mut inner = self.inner.lock();
            if inner.state == ConnectionState::Destroyed {
                return;
            }
            inner.state = ConnectionState::Disconnected;
            inner.transport = None;
        }

        self.push_state_change(ConnectionState::Disconnected);

        for op in operations {
            op.report_status(ChannelEvent::Disconnected);
        }
    }

    /// Idempotent; moves to DESTROYED and disconnects pending I/O
    /// (spec.md §4.6).
    pub fn destroy(self: &Arc<Self>, operations: &[Arc<dyn PendingOperation>]) {
        {
            let mut inner = self.inner.lock();
            if inner.state == ConnectionState::Destroyed {
                return;
            }
            inner.state = ConnectionState::Destroyed;
            inner.transport = None;
        }

        self.push_state_change(ConnectionState::Destroyed);

        for op in operations {
            op.report_status(ChannelEvent::Destroyed);
        }
    }

    pub fn next_issue_create(&self) -> bool {
        self.inner.lock().issue_create
    }
}

/// The channel's own first send on a freshly bound transport: CREATE_CHANNEL
/// carrying (CID, name) on first connect, or the DESTROY_CHANNEL-shaped
/// (SID, CID) reattach form on reconnect (spec.md §4.6).
struct CreateChannelSender {
    channel: Arc<Channel>,
}

impl Sender for CreateChannelSender {
    fn build_frame(&self) -> Option<OutgoingFrame> {
        let mut writer = PayloadWriter::new(codec::header::ByteOrder::Big);
        let issue_create = self.channel.next_issue_create();

        if issue_create {
            writer.write_u32(self.channel.cid.0);
            writer.write_string(&self.channel.name);
        } else {
            writer.write_u32(self.channel.sid());
            writer.write_u32(self.channel.cid.0);
        }

        Some(OutgoingFrame {
            command: CommandId::CreateChannel,
            payload: writer.into_inner(),
        })
    }
}

/// Builds a channel with a no-op requester and a discarded callback
/// channel, for tests that only care about wire/state-machine behavior.
#[cfg(test)]
pub(crate) fn test_channel(name: &str) -> Arc<Channel> {
    struct NoopRequester;
    impl ChannelRequester for NoopRequester {
        fn channel_state_change(&self, _cid: Cid, _state: ConnectionState) {}
    }

    let (tx, _rx) = mpsc::unbounded_channel();
    Channel::new(name.to_string(), Cid(1), 0, None, Arc::new(NoopRequester), tx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_never_connected() {
        let ch = test_channel("testCounter");
        assert_eq!(ch.state(), ConnectionState::NeverConnected);
    }

    #[test]
    fn destroy_is_idempotent_and_terminal() {
        let ch = test_channel("testCounter");
        ch.destroy(&[]);
        assert_eq!(ch.state(), ConnectionState::Destroyed);
        ch.destroy(&[]);
        assert_eq!(ch.state(), ConnectionState::Destroyed);
    }

    #[test]
    fn ioid_registration_round_trips() {
        let ch = test_channel("x");
        ch.register_ioid(Ioid(5));
        assert_eq!(ch.ioids(), vec![Ioid(5)]);
        ch.unregister_ioid(Ioid(5));
        assert!(ch.ioids().is_empty());
    }
}
