//! Public facade over the client engine: configuration (spec.md §6) and
//! `Provider`, the typed entry point that wires a `Config` into a running
//! `ClientContext` and builds the individual operations against a channel.
//!
//! The engine crate only exposes the low-level primitives (`ClientContext`,
//! `Channel`, the bare operation structs) — this crate is where an
//! application actually asks for a channel and issues Get/Put/Monitor/...
//! requests against it, the way the teacher's `turn-server` crate composes
//! its `Service`/`Controller`/`Observer` pieces into a running server.

pub mod config;

pub use config::Config;
pub use engine::channel::{Channel, ChannelRequester, ConnectionState};
pub use engine::context::ClientContext;
pub use engine::error::{ErrorKind, Severity, Status};
pub use engine::ids::{Cid, Ioid};
pub use engine::monitor::MonitorElement;
pub use engine::operations;
pub use engine::options::{ContextOptions, FlushStrategy};
pub use engine::pvdata::{BitSet, PvValue};

use std::sync::Arc;

use engine::operations::get::{Get, GetRequester};
use engine::operations::get_field::{GetField, GetFieldRequester};
use engine::operations::monitor::{Monitor, MonitorRequester};
use engine::operations::process::{Process, ProcessRequester};
use engine::operations::put::{Put, PutRequester};
use engine::operations::putget::{PutGet, PutGetRequester};
use engine::operations::rpc::{Rpc, RpcRequester};

/// Wires a `Config` into a running `ClientContext`, the equivalent of the
/// teacher's `server_main` composing its service pieces (spec.md §6).
pub struct Provider {
    context: Arc<ClientContext>,
}

impl Provider {
    /// Builds a `ClientContext` from `config` and starts its discovery and
    /// dispatch tasks.
    pub async fn start(config: &Config) -> std::io::Result<Self> {
        let context = ClientContext::new(config.to_context_options());
        context.start().await?;
        Ok(Self { context })
    }

    /// The underlying context, for callers that need lower-level access
    /// (e.g. `register_operation` for a custom operation type).
    pub fn context(&self) -> &Arc<ClientContext> {
        &self.context
    }

    /// Creates a channel by name and begins its search (spec.md §4.2,
    /// §4.6). `priority` only affects which TCP transport this channel
    /// shares with others to the same server.
    pub fn create_channel(&self, name: impl Into<String>, priority: u8, requester: Arc<dyn ChannelRequester>) -> Arc<Channel> {
        self.context.create_channel(name.into(), priority, requester)
    }

    pub fn destroy_channel(&self, channel: &Arc<Channel>) {
        self.context.destroy_channel(channel)
    }

    /// Generic channel-find: locate channels by criteria other than an
    /// exact name (e.g. a wildcard or a server-side query). Optional
    /// feature the default provider does not implement (spec.md §7
    /// *not-implemented*).
    pub fn channel_find(&self, _query: &str) -> Result<(), ErrorKind> {
        Err(ErrorKind::NotImplemented)
    }

    /// Builds and starts a Get operation against `channel` (spec.md §4.8).
    pub fn get(&self, channel: Arc<Channel>, requester: Arc<dyn GetRequester>, pv_request: PvValue) -> Arc<Get> {
        let ioid = self.context.allocate_ioid();
        let op = Get::new(ioid, channel, requester, pv_request);
        self.context.register_operation(op.clone());
        let _ = op.start();
        op
    }

    pub fn put(&self, channel: Arc<Channel>, requester: Arc<dyn PutRequester>, pv_request: PvValue) -> Arc<Put> {
        let ioid = self.context.allocate_ioid();
        let op = Put::new(ioid, channel, requester, pv_request);
        self.context.register_operation(op.clone());
        let _ = op.start();
        op
    }

    pub fn put_get(&self, channel: Arc<Channel>, requester: Arc<dyn PutGetRequester>, pv_request: PvValue) -> Arc<PutGet> {
        let ioid = self.context.allocate_ioid();
        let op = PutGet::new(ioid, channel, requester, pv_request);
        self.context.register_operation(op.clone());
        let _ = op.start();
        op
    }

    pub fn rpc(&self, channel: Arc<Channel>, requester: Arc<dyn RpcRequester>, pv_request: PvValue) -> Arc<Rpc> {
        let ioid = self.context.allocate_ioid();
        let op = Rpc::new(ioid, channel, requester, pv_request);
        self.context.register_operation(op.clone());
        let _ = op.start();
        op
    }

    pub fn process(&self, channel: Arc<Channel>, requester: Arc<dyn ProcessRequester>, pv_request: PvValue) -> Arc<Process> {
        let ioid = self.context.allocate_ioid();
        let op = Process::new(ioid, channel, requester, pv_request);
        self.context.register_operation(op.clone());
        let _ = op.start();
        op
    }

    /// Builds and starts a Monitor subscription; `start_monitor` still
    /// needs to be called (on the returned handle) once `monitor_connect`
    /// reports success, letting the application choose when to start
    /// streaming (spec.md §4.8, §4.9).
    pub fn monitor(&self, channel: Arc<Channel>, requester: Arc<dyn MonitorRequester>, pv_request: PvValue) -> Arc<Monitor> {
        let ioid = self.context.allocate_ioid();
        let op = Monitor::new(ioid, channel, requester, pv_request);
        self.context.register_operation(op.clone());
        let _ = op.start();
        op
    }

    /// One-shot sub-field introspection fetch; the returned handle
    /// self-destructs once its single response arrives (spec.md §4.8).
    pub fn get_field(&self, channel: Arc<Channel>, requester: Arc<dyn GetFieldRequester>, sub_field_name: String) -> Arc<GetField> {
        let ioid = self.context.allocate_ioid();
        let op = GetField::new(self.context.clone(), ioid, channel, requester, sub_field_name);
        op.start();
        op
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_find_is_not_implemented() {
        let context = ClientContext::new(ContextOptions::default());
        let provider = Provider { context };
        assert_eq!(provider.channel_find("*"), Err(ErrorKind::NotImplemented));
    }
}
