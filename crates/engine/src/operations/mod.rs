//! Operation classes: per-command send encoding layered on top of the
//! shared request-lifecycle state machine (spec.md §4.8).

pub mod array;
pub mod get;
pub mod get_field;
pub mod monitor;
pub mod process;
pub mod put;
pub mod putget;
pub mod rpc;

use std::sync::Arc;

use crate::channel::Channel;
use crate::ids::Ioid;
use crate::request::RequestCore;

/// Shared fields every concrete operation embeds by composition: the
/// request-lifecycle state machine plus the channel it operates on
/// (spec.md §4.7, §4.8).
pub struct OperationBase {
    pub core: RequestCore,
    pub channel: Arc<Channel>,
}

impl OperationBase {
    pub fn new(ioid: Ioid, channel: Arc<Channel>) -> Self {
        Self { core: RequestCore::new(ioid), channel }
    }
}
