//! Array operation: init sends `pvRequest`; GET reads a slice
//! (offset, count); PUT writes a slice (offset, array bytes); SET_LENGTH
//! resizes (length, capacity). QoS.GET / QoS.GET_PUT distinguish the three
//! (spec.md §4.8). Stride is not supported on the wire by this protocol
//! version; callers passing stride != 1 are rejected locally.

use std::sync::{Arc, Weak};

use codec::{CommandId, PayloadReader, PayloadWriter, QosFlags};
use parking_lot::Mutex;

use crate::channel::{Channel, ChannelEvent, PendingOperation};
use crate::error::{ErrorKind, Status};
use crate::ids::Ioid;
use crate::pvdata::PvValue;
use crate::request::{PendingRequest, ResponseKind};
use crate::transport::{OutgoingFrame, Sender, TransportHandle};

use super::OperationBase;

pub trait ArrayRequester: Send + Sync {
    fn channel_array_connect(&self, status: &Status);
    fn get_array_done(&self, status: &Status, value: Option<&PvValue>);
    fn put_array_done(&self, status: &Status);
    fn set_length_done(&self, status: &Status);
}

enum PendingBody {
    Get { offset: u32, count: u32 },
    Put { offset: u32, value: PvValue },
    SetLength { length: u32, capacity: u32 },
}

pub struct Array {
    base: OperationBase,
    requester: Arc<dyn ArrayRequester>,
    pv_request: PvValue,
    pending_body: Mutex<Option<PendingBody>>,
    self_weak: Weak<Array>,
}

impl Array {
    pub fn new(ioid: Ioid, channel: Arc<Channel>, requester: Arc<dyn ArrayRequester>, pv_request: PvValue) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            base: OperationBase::new(ioid, channel),
            requester,
            pv_request,
            pending_body: Mutex::new(None),
            self_weak: weak.clone(),
        })
    }

    pub fn ioid(&self) -> Ioid {
        self.base.core.ioid
    }

    fn arc_self(&self) -> Arc<Self> {
        self.self_weak.upgrade().expect("Array used after being dropped")
    }

    fn enqueue_self(&self) {
        if let Some(transport) = self.base.channel.current_transport() {
            transport.enqueue(self.arc_self());
        }
    }

    pub fn start(&self) -> Result<(), ErrorKind> {
        self.base.channel.register_ioid(self.ioid());
        self.base.core.start_request(PendingRequest::Qos(QosFlags::INIT))?;
        self.enqueue_self();
        Ok(())
    }

    /// `count == 0` means "to end" (spec.md §4.8).
    pub fn get(&self, offset: u32, count: u32, stride: u32) -> Result<(), ErrorKind> {
        if stride != 1 {
            return Err(ErrorKind::StrideNotSupported);
        }
        *self.pending_body.lock() = Some(PendingBody::Get { offset, count });
        self.base.core.start_request(PendingRequest::Qos(QosFlags::GET))?;
        self.enqueue_self();
        Ok(())
    }

    pub fn put(&self, offset: u32, value: PvValue, stride: u32) -> Result<(), ErrorKind> {
        if stride != 1 {
            return Err(ErrorKind::StrideNotSupported);
        }
        *self.pending_body.lock() = Some(PendingBody::Put { offset, value });
        self.base.core.start_request(PendingRequest::Qos(QosFlags::DEFAULT))?;
        self.enqueue_self();
        Ok(())
    }

    pub fn set_length(&self, length: u32, capacity: u32) -> Result<(), ErrorKind> {
        *self.pending_body.lock() = Some(PendingBody::SetLength { length, capacity });
        self.base.core.start_request(PendingRequest::Qos(QosFlags::GET_PUT))?;
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

impl Sender for Array {
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
                } else if let Some(body) = self.pending_body.lock().take() {
                    match body {
                        PendingBody::Get { offset, count } => {
                            w.write_u32(offset);
                            w.write_u32(count);
                        }
                        PendingBody::Put { offset, value } => {
                            w.write_u32(offset);
                            value.serialize(&mut w);
                        }
                        PendingBody::SetLength { length, capacity } => {
                            w.write_u32(length);
                            w.write_u32(capacity);
                        }
                    }
                }

                Some(OutgoingFrame { command: CommandId::Array, payload: w.into_inner() })
            }
        }
    }
}

impl PendingOperation for Array {
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
            ResponseKind::Init => self.requester.channel_array_connect(&status),
            ResponseKind::Destroy => {}
            ResponseKind::Normal => {
                if qos.contains(QosFlags::GET_PUT) {
                    self.requester.set_length_done(&status);
                } else if qos.contains(QosFlags::GET) {
                    let value = status.is_ok().then(|| PvValue::deserialize(reader).ok()).flatten();
                    self.requester.get_array_done(&status, value.as_ref());
                } else {
                    self.requester.put_array_done(&status);
                }
            }
        }
    }
}
