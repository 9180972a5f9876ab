//! Process operation: init sends `pvRequest`; subsequent requests carry no
//! payload, only the QoS byte. Fires server-side record processing
//! (spec.md §4.8).

use std::sync::{Arc, Weak};

use codec::{CommandId, PayloadReader, PayloadWriter, QosFlags};

use crate::channel::{Channel, ChannelEvent, PendingOperation};
use crate::error::{ErrorKind, Status};
use crate::ids::Ioid;
use crate::pvdata::PvValue;
use crate::request::{PendingRequest, ResponseKind};
use crate::transport::{OutgoingFrame, Sender, TransportHandle};

use super::OperationBase;

pub trait ProcessRequester: Send + Sync {
    fn channel_process_connect(&self, status: &Status);
    fn process_done(&self, status: &Status);
}

pub struct Process {
    base: OperationBase,
    requester: Arc<dyn ProcessRequester>,
    pv_request: PvValue,
    self_weak: Weak<Process>,
}

impl Process {
    pub fn new(ioid: Ioid, channel: Arc<Channel>, requester: Arc<dyn ProcessRequester>, pv_request: PvValue) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            base: OperationBase::new(ioid, channel),
            requester,
            pv_request,
            self_weak: weak.clone(),
        })
    }

    pub fn ioid(&self) -> Ioid {
        self.base.core.ioid
    }

    fn arc_self(&self) -> Arc<Self> {
        self.self_weak.upgrade().expect("Process used after being dropped")
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

    pub fn process(&self, last_request: bool) -> Result<(), ErrorKind> {
        let qos = if last_request { QosFlags::DESTROY } else { QosFlags::DEFAULT };
        self.base.core.start_request(PendingRequest::Qos(qos))?;
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

impl Sender for Process {
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
                Some(OutgoingFrame { command: CommandId::Process, payload: w.into_inner() })
            }
        }
    }
}

impl PendingOperation for Process {
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
            ResponseKind::Init => self.requester.channel_process_connect(&status),
            ResponseKind::Destroy => {}
            ResponseKind::Normal => self.requester.process_done(&status),
        }
    }
}
