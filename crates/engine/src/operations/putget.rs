//! PutGet operation: three sub-requests multiplexed over one IOID —
//! `putGet` sends the put-side structure, `getGet` re-reads the get-side
//! structure (QoS.GET), `getPut` re-reads the put-side structure
//! (QoS.GET_PUT). The response carries a get structure (normal) or a put
//! structure (QoS.GET_PUT echoed back) (spec.md §4.8).

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

pub trait PutGetRequester: Send + Sync {
    fn channel_put_get_connect(&self, status: &Status);
    fn put_get_done(&self, status: &Status, get_value: Option<&PvValue>);
    fn get_get_done(&self, status: &Status, get_value: Option<&PvValue>);
    fn get_put_done(&self, status: &Status, put_value: Option<&PvValue>);
}

pub struct PutGet {
    base: OperationBase,
    requester: Arc<dyn PutGetRequester>,
    pv_request: PvValue,
    pending_put_value: Mutex<Option<PvValue>>,
    self_weak: Weak<PutGet>,
}

impl PutGet {
    pub fn new(ioid: Ioid, channel: Arc<Channel>, requester: Arc<dyn PutGetRequester>, pv_request: PvValue) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            base: OperationBase::new(ioid, channel),
            requester,
            pv_request,
            pending_put_value: Mutex::new(None),
            self_weak: weak.clone(),
        })
    }

    pub fn ioid(&self) -> Ioid {
        self.base.core.ioid
    }

    fn arc_self(&self) -> Arc<Self> {
        self.self_weak.upgrade().expect("PutGet used after being dropped")
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

    pub fn put_get(&self, put_value: PvValue, last_request: bool) -> Result<(), ErrorKind> {
        let qos = if last_request { QosFlags::DESTROY } else { QosFlags::DEFAULT };
        *self.pending_put_value.lock() = Some(put_value);
        self.base.core.start_request(PendingRequest::Qos(qos))?;
        self.enqueue_self();
        Ok(())
    }

    pub fn get_get(&self) -> Result<(), ErrorKind> {
        self.base.core.start_request(PendingRequest::Qos(QosFlags::GET))?;
        self.enqueue_self();
        Ok(())
    }

    pub fn get_put(&self) -> Result<(), ErrorKind> {
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

impl Sender for PutGet {
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
                } else if !qos.contains(QosFlags::GET) && !qos.contains(QosFlags::GET_PUT) {
                    if let Some(value) = self.pending_put_value.lock().take() {
                        value.serialize(&mut w);
                    }
                }
                // getGet/getPut bodies are empty (spec.md §4.8).

                Some(OutgoingFrame { command: CommandId::PutGet, payload: w.into_inner() })
            }
        }
    }
}

impl PendingOperation for PutGet {
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
            ResponseKind::Init => self.requester.channel_put_get_connect(&status),
            ResponseKind::Destroy => {}
            ResponseKind::Normal => {
                let value = status.is_ok().then(|| PvValue::deserialize(reader).ok()).flatten();
                if qos.contains(QosFlags::GET_PUT) {
                    self.requester.get_put_done(&status, value.as_ref());
                } else if qos.contains(QosFlags::GET) {
                    self.requester.get_get_done(&status, value.as_ref());
                } else {
                    self.requester.put_get_done(&status, value.as_ref());
                }
            }
        }
    }
}
