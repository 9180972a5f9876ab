//! Four policies reconciling server-streamed change deltas with bounded
//! client-side queues and overflow accounting (spec.md §4.9). This is the
//! single most intricate part of the engine.

pub mod entire;
pub mod notify;
pub mod queue;
pub mod single;

pub use entire::EntireStrategy;
pub use notify::NotifyStrategy;
pub use queue::QueueStrategy;
pub use single::SingleStrategy;

use crate::pvdata::{BitSet, PvValue};

/// One delivered monitor element: the deserialized structure plus the
/// change- and overrun-bitsets that accompanied it (spec.md §4.9).
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorElement {
    pub value: PvValue,
    pub changed: BitSet,
    pub overrun: BitSet,
}

/// Implemented by each of the four monitor policies. `response` consumes
/// one streamed update already split into its three length-prefixed wire
/// items (spec.md §4.9); its return value is whether the requester should
/// be notified this round. `poll`/`release` are the consumer side.
pub trait MonitorStrategy: Send + Sync {
    /// Prepare buffers for a new structure. Reusing buffers across a
    /// reconnect when the structure type hasn't changed is the caller's
    /// concern (it decides whether to call `init` again at all); once
    /// called, `init` always resets this strategy's internal state.
    fn init(&self, structure: &PvValue);

    fn response(&self, changed: BitSet, value: PvValue, overrun: BitSet) -> bool;

    fn poll(&self) -> Option<MonitorElement>;

    fn release(&self, element: MonitorElement);
}

/// Select a strategy by `pvRequest.record.queueSize` (spec.md §4.9).
pub fn strategy_for_queue_size(queue_size: i32) -> Box<dyn MonitorStrategy> {
    match queue_size {
        -1 => Box::new(NotifyStrategy::new()),
        0 => Box::new(EntireStrategy::new()),
        1 => Box::new(SingleStrategy::new()),
        n => Box::new(QueueStrategy::new(n.max(2) as usize)),
    }
}
