//! GetField: single-shot field-introspection retrieval. Not derived from
//! the Request base; sends the sub-field name once and self-destructs on
//! completion (spec.md §4.8).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use codec::{CommandId, PayloadReader, PayloadWriter, QosFlags};
use parking_lot::Mutex;

use crate::channel::{Channel, ChannelEvent, PendingOperation};
use crate::context::ClientContext;
use crate::error::{ErrorKind, Status};
use crate::ids::Ioid;
use crate::pvdata::PvValue;
use crate::transport::{OutgoingFrame, Sender, TransportHandle};

pub trait GetFieldRequester: Send + Sync {
    fn get_done(&self, status: &Status, field: Option<&PvValue>);
}

pub struct GetField {
    ctx: Arc<ClientContext>,
    channel: Arc<Channel>,
    ioid: Ioid,
    requester: Arc<dyn GetFieldRequester>,
    sub_field_name: String,
    sent: AtomicBool,
    /// Keeps the operation alive between `start` and its single response
    /// even if the caller drops its handle; cleared once the response
    /// arrives (spec.md §4.8: "self-referenced pointer cleared on
    /// response").
    self_ref: Mutex<Option<Arc<GetField>>>,
    self_weak: Weak<GetField>,
}

impl GetField {
    pub fn new(
        ctx: Arc<ClientContext>,
        ioid: Ioid,
        channel: Arc<Channel>,
        requester: Arc<dyn GetFieldRequester>,
        sub_field_name: String,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            ctx,
            channel,
            ioid,
            requester,
            sub_field_name,
            sent: AtomicBool::new(false),
            self_ref: Mutex::new(None),
            self_weak: weak.clone(),
        })
    }

    pub fn ioid(&self) -> Ioid {
        self.ioid
    }

    fn arc_self(&self) -> Arc<Self> {
        self.self_weak.upgrade().expect("GetField used after being dropped")
    }

    pub fn start(&self) {
        self.channel.register_ioid(self.ioid);
        self.ctx.register_operation(self.arc_self());
        *self.self_ref.lock() = Some(self.arc_self());
        if let Some(transport) = self.channel.current_transport() {
            transport.enqueue(self.arc_self());
        }
    }

    fn finish(&self) {
        self.channel.unregister_ioid(self.ioid);
        self.ctx.unregister_operation(self.ioid);
        *self.self_ref.lock() = None;
    }
}

impl Sender for GetField {
    fn build_frame(&self) -> Option<OutgoingFrame> {
        if self.sent.swap(true, Ordering::SeqCst) {
            return None;
        }

        let order = self
            .channel
            .current_transport()
            .map(|t| t.byte_order())
            .unwrap_or(codec::header::ByteOrder::Big);
        let mut w = PayloadWriter::new(order);
        w.write_u32(self.channel.sid());
        w.write_u32(self.ioid.0);
        w.write_string(&self.sub_field_name);

        Some(OutgoingFrame { command: CommandId::GetField, payload: w.into_inner() })
    }
}

impl PendingOperation for GetField {
    fn ioid(&self) -> Ioid {
        self.ioid
    }

    fn report_status(&self, event: ChannelEvent) {
        if matches!(event, ChannelEvent::Destroyed | ChannelEvent::Disconnected) {
            self.requester.get_done(&Status::from_kind(ErrorKind::ChannelDestroyed), None);
            self.finish();
        }
    }

    fn on_data(&self, _qos: QosFlags, reader: &mut PayloadReader) {
        let status = Status::deserialize(reader)
            .unwrap_or_else(|_| Status::from_kind(ErrorKind::RequestNotInitialized));
        let field = status.is_ok().then(|| PvValue::deserialize(reader).ok()).flatten();
        self.requester.get_done(&status, field.as_ref());
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingRequester {
        results: StdMutex<Vec<bool>>,
    }

    impl GetFieldRequester for RecordingRequester {
        fn get_done(&self, status: &Status, _field: Option<&PvValue>) {
            self.results.lock().unwrap().push(status.is_ok());
        }
    }

    #[tokio::test]
    async fn sends_exactly_once() {
        let ctx = ClientContext::new(crate::options::ContextOptions::default());
        let channel = crate::channel::test_channel("x");
        let requester = Arc::new(RecordingRequester::default());
        let op = GetField::new(ctx, Ioid(1), channel, requester, "value".into());
        op.start();
        assert!(op.build_frame().is_some());
        assert!(op.build_frame().is_none());
    }
}
