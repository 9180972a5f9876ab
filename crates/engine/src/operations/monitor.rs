//! Monitor operation: INIT establishes the IOID and returns the
//! structure; MONITOR_START/MONITOR_STOP QoS frames arm and disarm the
//! stream; once armed, update frames carry no status byte at all, just
//! the three length-prefixed bitset/value/bitset items a monitor
//! strategy consumes (spec.md §4.8, §4.9).

use std::sync::{Arc, Weak};

use codec::{CommandId, PayloadReader, PayloadWriter, QosFlags};
use parking_lot::Mutex;

use crate::channel::{Channel, ChannelEvent, PendingOperation};
use crate::error::{ErrorKind, Status};
use crate::ids::Ioid;
use crate::monitor::{strategy_for_queue_size, MonitorElement, MonitorStrategy};
use crate::pvdata::{BitSet, PvValue};
use crate::request::{PendingRequest, ResponseKind};
use crate::transport::{OutgoingFrame, Sender, TransportHandle};

use super::OperationBase;

/// Callback surface for a Monitor operation (spec.md §4.8, §4.9).
pub trait MonitorRequester: Send + Sync {
    fn channel_monitor_connect(&self, status: &Status, structure: Option<&PvValue>);
    /// New elements are available; the application calls `poll`/`release`.
    fn monitor_event(&self);
    fn unlisten(&self);
}

/// `pvRequest.record._options.queueSize`, defaulting to the Entire
/// strategy when absent (spec.md §4.9, §6).
fn queue_size_from_pv_request(pv_request: &PvValue) -> i32 {
    pv_request
        .field("record")
        .and_then(|r| r.field("_options"))
        .and_then(|o| o.field("queueSize"))
        .and_then(PvValue::as_int)
        .unwrap_or(0)
}

pub struct Monitor {
    base: OperationBase,
    requester: Arc<dyn MonitorRequester>,
    pv_request: PvValue,
    strategy: Mutex<Option<Box<dyn MonitorStrategy>>>,
    /// Set by `resubscribe` when a reconnect interrupted an active stream,
    /// so the INIT response handler knows to re-arm it.
    pending_restart: Mutex<bool>,
    self_weak: Weak<Monitor>,
}

impl Monitor {
    pub fn new(ioid: Ioid, channel: Arc<Channel>, requester: Arc<dyn MonitorRequester>, pv_request: PvValue) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            base: OperationBase::new(ioid, channel),
            requester,
            pv_request,
            strategy: Mutex::new(None),
            pending_restart: Mutex::new(false),
            self_weak: weak.clone(),
        })
    }

    pub fn ioid(&self) -> Ioid {
        self.base.core.ioid
    }

    fn arc_self(&self) -> Arc<Self> {
        self.self_weak.upgrade().expect("Monitor used after being dropped")
    }

    fn enqueue_self(&self) {
        if let Some(transport) = self.base.channel.current_transport() {
            transport.enqueue(self.arc_self());
        }
    }

    /// The initial exchange: registers the IOID and sends `pvRequest`.
    pub fn start(&self) -> Result<(), ErrorKind> {
        if self.pv_request.is_null() {
            return Err(ErrorKind::PvRequestNull);
        }
        self.base.channel.register_ioid(self.ioid());
        self.base.core.start_request(PendingRequest::Qos(QosFlags::INIT))?;
        self.enqueue_self();
        Ok(())
    }

    /// Arms the stream: the server starts pushing update frames.
    pub fn start_monitor(&self) -> Result<(), ErrorKind> {
        self.base.core.start_request(PendingRequest::Qos(QosFlags::MONITOR_START))?;
        self.base.core.set_subscribed(true);
        self.enqueue_self();
        Ok(())
    }

    /// Disarms the stream without destroying the operation.
    pub fn stop_monitor(&self) -> Result<(), ErrorKind> {
        self.base.core.start_request(PendingRequest::Qos(QosFlags::MONITOR_STOP))?;
        self.base.core.set_subscribed(false);
        self.enqueue_self();
        Ok(())
    }

    /// Pop the next buffered element, if any (spec.md §4.9).
    pub fn poll(&self) -> Option<MonitorElement> {
        self.strategy.lock().as_ref().and_then(|s| s.poll())
    }

    /// Return a previously polled element's buffers to the strategy.
    pub fn release(&self, element: MonitorElement) {
        if let Some(strategy) = self.strategy.lock().as_ref() {
            strategy.release(element);
        }
    }

    pub fn destroy(&self, create_failed: bool) {
        if self.base.core.begin_destroy(create_failed) {
            self.enqueue_self();
        }
        self.base.channel.unregister_ioid(self.ioid());
    }
}

impl Sender for Monitor {
    fn build_frame(&self) -> Option<OutgoingFrame> {
        let pending = self.base.core.take_pending();
        let order = self
            .base
            .channel
            .current_transport()
            .map(|t| t.byte_order())
            .unwrap_or(codec::header::ByteOrder::Big);
        let mut w = PayloadWriter::new(order);

        match pending {
            PendingRequest::Null => None,
            PendingRequest::PureDestroy => {
                w.write_u32(self.base.channel.sid());
                w.write_u32(self.ioid().0);
                Some(OutgoingFrame { command: CommandId::CancelRequest, payload: w.into_inner() })
            }
            PendingRequest::Qos(qos) => {
                w.write_u32(self.base.channel.sid());
                w.write_u32(self.ioid().0);
                w.write_u8(qos.bits());
                if qos.contains(QosFlags::INIT) {
                    self.pv_request.serialize(&mut w);
                }
                Some(OutgoingFrame { command: CommandId::Monitor, payload: w.into_inner() })
            }
        }
    }
}

impl PendingOperation for Monitor {
    fn ioid(&self) -> Ioid {
        self.base.core.ioid
    }

    fn report_status(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Destroyed => {
                self.base.core.begin_destroy(false);
            }
            ChannelEvent::Disconnected => {
                self.base.core.on_disconnected();
                self.requester.unlisten();
            }
        }
    }

    /// Re-establish a subscription interrupted by a reconnect: redo INIT,
    /// then re-arm streaming once it completes if it was active before
    /// the disconnect (spec.md §4.7 `resubscribe-subscription`).
    fn resubscribe(&self, _transport: Arc<dyn TransportHandle>) {
        *self.pending_restart.lock() = self.base.core.is_subscribed();
        if self.base.core.start_request(PendingRequest::Qos(QosFlags::INIT)).is_ok() {
            self.enqueue_self();
        }
    }

    fn on_data(&self, qos: QosFlags, reader: &mut PayloadReader) {
        if qos.contains(QosFlags::INIT) || qos.contains(QosFlags::DESTROY) {
            let status = Status::deserialize(reader)
                .unwrap_or_else(|_| Status::from_kind(ErrorKind::RequestNotInitialized));

            match self.base.core.classify_response(qos, status.is_ok()) {
                ResponseKind::Init => {
                    let structure = status.is_ok().then(|| PvValue::deserialize(reader).ok()).flatten();
                    if let Some(structure) = &structure {
                        let mut strategy = strategy_for_queue_size(queue_size_from_pv_request(&self.pv_request));
                        strategy.init(structure);
                        *self.strategy.lock() = Some(strategy);
                    }
                    self.requester.channel_monitor_connect(&status, structure.as_ref());

                    if std::mem::take(&mut *self.pending_restart.lock()) {
                        let _ = self.start_monitor();
                    }
                }
                ResponseKind::Destroy => {
                    *self.strategy.lock() = None;
                    self.requester.unlisten();
                }
                ResponseKind::Normal => unreachable!("INIT/DESTROY qos never classifies as Normal"),
            }
            return;
        }

        let (Ok(changed), Ok(value), Ok(overrun)) =
            (BitSet::deserialize(reader), PvValue::deserialize(reader), BitSet::deserialize(reader))
        else {
            return;
        };

        let notify = self.strategy.lock().as_mut().map(|s| s.response(changed, value, overrun)).unwrap_or(false);
        if notify {
            self.requester.monitor_event();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingRequester {
        connects: StdMutex<Vec<bool>>,
        events: StdMutex<u32>,
        unlistens: StdMutex<u32>,
    }

    impl MonitorRequester for RecordingRequester {
        fn channel_monitor_connect(&self, status: &Status, _structure: Option<&PvValue>) {
            self.connects.lock().unwrap().push(status.is_ok());
        }
        fn monitor_event(&self) {
            *self.events.lock().unwrap() += 1;
        }
        fn unlisten(&self) {
            *self.unlistens.lock().unwrap() += 1;
        }
    }

    fn pv_request_with_queue_size(n: i32) -> PvValue {
        PvValue::struct_with([(
            "record",
            PvValue::struct_with([("_options", PvValue::struct_with([("queueSize", PvValue::Int(n))]))]),
        )])
    }

    #[test]
    fn init_frame_carries_the_pv_request_and_queue_size_extracts() {
        let channel = crate::channel::test_channel("counter");
        let requester = Arc::new(RecordingRequester::default());
        let monitor = Monitor::new(Ioid(1), channel, requester, pv_request_with_queue_size(2));
        monitor.start().unwrap();

        let frame = monitor.build_frame().unwrap();
        assert_eq!(frame.command, CommandId::Monitor);
        assert_eq!(queue_size_from_pv_request(&monitor.pv_request), 2);
    }

    #[test]
    fn a_second_init_while_one_is_pending_is_rejected() {
        let channel = crate::channel::test_channel("counter");
        let requester = Arc::new(RecordingRequester::default());
        let monitor = Monitor::new(Ioid(1), channel, requester, pv_request_with_queue_size(0));
        monitor.start().unwrap();
        assert_eq!(monitor.start_monitor(), Err(ErrorKind::OtherRequestPending));
    }

    #[test]
    fn disconnect_clears_subscription_and_notifies_unlisten() {
        let channel = crate::channel::test_channel("counter");
        let requester = Arc::new(RecordingRequester::default());
        let monitor = Monitor::new(Ioid(1), channel, requester.clone(), pv_request_with_queue_size(0));
        monitor.start().unwrap();
        monitor.build_frame();
        monitor.base.core.classify_response(QosFlags::INIT, true);
        monitor.base.core.set_subscribed(true);

        monitor.report_status(ChannelEvent::Disconnected);

        assert!(!monitor.base.core.is_subscribed());
        assert_eq!(*requester.unlistens.lock().unwrap(), 1);
    }

    /// A transport that accepts every `enqueue` call without doing anything
    /// else, just so `resubscribe`'s `enqueue_self` has somewhere to go.
    struct NullTransport;

    impl TransportHandle for NullTransport {
        fn enqueue(&self, _sender: Arc<dyn Sender>) {}
        fn byte_order(&self) -> codec::header::ByteOrder {
            codec::header::ByteOrder::Big
        }
        fn is_closed(&self) -> bool {
            false
        }
        fn close(&self) {}
    }

    #[test]
    fn resubscribe_after_reconnect_replays_init_and_rearms_streaming() {
        let channel = crate::channel::test_channel("counter");
        let requester = Arc::new(RecordingRequester::default());
        let monitor = Monitor::new(Ioid(1), channel, requester.clone(), pv_request_with_queue_size(0));

        // Establish and arm a live subscription, as if a prior INIT and
        // MONITOR_START had already round-tripped.
        monitor.start().unwrap();
        monitor.build_frame();
        monitor.base.core.classify_response(QosFlags::INIT, true);
        monitor.start_monitor().unwrap();
        monitor.build_frame();
        assert!(monitor.base.core.is_subscribed());

        // The reconnect: `resubscribe` remembers the stream was active and
        // re-issues INIT instead of leaving the operation stuck disconnected.
        monitor.resubscribe(Arc::new(NullTransport));
        assert!(*monitor.pending_restart.lock());
        let frame = monitor.build_frame().unwrap();
        assert_eq!(frame.command, CommandId::Monitor);

        // INIT completing again re-arms streaming automatically because
        // `pending_restart` was set, without the application calling
        // `start_monitor` itself.
        let mut w = PayloadWriter::new(codec::header::ByteOrder::Big);
        Status::ok().serialize(&mut w);
        let bytes = w.into_inner();
        monitor.on_data(QosFlags::INIT, &mut PayloadReader::new(&bytes, codec::header::ByteOrder::Big));

        assert!(!*monitor.pending_restart.lock());
        let rearm_frame = monitor.build_frame().unwrap();
        assert_eq!(rearm_frame.command, CommandId::Monitor);
        assert!(monitor.base.core.is_subscribed());
    }
}
