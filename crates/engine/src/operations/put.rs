//! Put operation: init sends `pvRequest`; a GET sub-request sends an empty
//! body (QoS.GET); a PUT sub-request sends a change-bitset then the
//! structure masked by it. GET and PUT multiplex over the same IOID via
//! QoS bits (spec.md §4.8).

use std::sync::{Arc, Weak};

use codec::{CommandId, PayloadReader, PayloadWriter, QosFlags};
use parking_lot::Mutex;

use crate::channel::{Channel, ChannelEvent, PendingOperation};
use crate::error::{ErrorKind, Status};
use crate::ids::Ioid;
use crate::pvdata::{BitSet, PvValue};
use crate::request::{PendingRequest, ResponseKind};
use crate::transport::{OutgoingFrame, Sender, TransportHandle};

use super::OperationBase;

pub trait PutRequester: Send + Sync {
    fn channel_put_connect(&self, status: &Status);
    fn put_done(&self, status: &Status);
    fn get_done(&self, status: &Status, value: Option<&PvValue>);
}

struct PendingPut {
    changed: BitSet,
    value: PvValue,
}

pub struct Put {
    base: OperationBase,
    requester: Arc<dyn PutRequester>,
    pv_request: PvValue,
    pending_put: Mutex<Option<PendingPut>>,
    self_weak: Weak<Put>,
}

impl Put {
    pub fn new(ioid: Ioid, channel: Arc<Channel>, requester: Arc<dyn PutRequester>, pv_request: PvValue) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            base: OperationBase::new(ioid, channel),
            requester,
            pv_request,
            pending_put: Mutex::new(None),
            self_weak: weak.clone(),
        })
    }

    pub fn ioid(&self) -> Ioid {
        self.base.core.ioid
    }

    fn arc_self(&self) -> Arc<Self> {
        self.self_weak.upgrade().expect("Put used after being dropped")
    }

    fn enqueue_self(&self) {
        if let Some(transport) = self.base.channel.current_transport() {
            transport.enqueue(self.arc_self());
        }
    }

    pub fn start(&self) -> Result<(), ErrorKind> {
        if self.pv_request.is_null() {
            return Err(ErrorKind::PvRequestNull);
        }
        self.base.channel.register_ioid(self.ioid());
        self.base.core.start_request(PendingRequest::Qos(QosFlags::INIT))?;
        self.enqueue_self();
        Ok(())
    }

    /// Schedule a PUT sub-request: `changed` masks which fields of `value`
    /// are sent (spec.md §4.8).
    pub fn put(&self, changed: BitSet, value: PvValue, last_request: bool) -> Result<(), ErrorKind> {
        let qos = if last_request { QosFlags::DESTROY } else { QosFlags::DEFAULT };
        *self.pending_put.lock() = Some(PendingPut { changed, value });
        self.base.core.start_request(PendingRequest::Qos(qos))?;
        self.enqueue_self();
        Ok(())
    }

    /// Schedule a GET sub-request reading the current value back
    /// (spec.md §4.8).
    pub fn get(&self) -> Result<(), ErrorKind> {
        self.base.core.start_request(PendingRequest::Qos(QosFlags::GET))?;
        self.enqueue_self();
        Ok(())
    }

    pub fn destroy(&self, create_failed: bool) {
        if self.base.core.begin_destroy(create_failed) {
            self.enqueue_self();
        }
        self.base.channel.unregister_ioid(self.ioid());
    }
}

impl Sender for Put {
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
                } else if !qos.contains(QosFlags::GET) {
                    if let Some(put) = self.pending_put.lock().take() {
                        put.changed.serialize(&mut w);
                        put.value.serialize(&mut w);
                    }
                }
                // A GET sub-request's body is empty (spec.md §4.8).

                Some(OutgoingFrame { command: CommandId::Put, payload: w.into_inner() })
            }
        }
    }
}

impl PendingOperation for Put {
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
            }
        }
    }

    fn on_data(&self, qos: QosFlags, reader: &mut PayloadReader) {
        let status = Status::deserialize(reader)
            .unwrap_or_else(|_| Status::from_kind(ErrorKind::RequestNotInitialized));

        match self.base.core.classify_response(qos, status.is_ok()) {
            ResponseKind::Init => self.requester.channel_put_connect(&status),
            ResponseKind::Destroy => {}
            ResponseKind::Normal => {
                if qos.contains(QosFlags::GET) {
                    let value = status.is_ok().then(|| PvValue::deserialize(reader).ok()).flatten();
                    self.requester.get_done(&status, value.as_ref());
                } else {
                    self.requester.put_done(&status);
                }
            }
        }
    }
}
