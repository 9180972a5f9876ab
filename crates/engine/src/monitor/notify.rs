//! `queueSize == -1`: no data copy, only wake-ups (spec.md §4.9).

use parking_lot::Mutex;

use super::{MonitorElement, MonitorStrategy};
use crate::pvdata::{BitSet, PvValue};

#[derive(Default)]
pub struct NotifyStrategy {
    pending: Mutex<bool>,
}

impl NotifyStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MonitorStrategy for NotifyStrategy {
    fn init(&self, _structure: &PvValue) {
        *self.pending.lock() = false;
    }

    fn response(&self, _changed: BitSet, _value: PvValue, _overrun: BitSet) -> bool {
        *self.pending.lock() = true;
        true
    }

    /// Never returns data; the caller retrieves the current value through a
    /// separate `Get` if it wants one. Clears the pending flag so repeated
    /// polls don't keep reporting stale wake-ups.
    fn poll(&self) -> Option<MonitorElement> {
        *self.pending.lock() = false;
        None
    }

    fn release(&self, _element: MonitorElement) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_never_yields_an_element() {
        let strategy = NotifyStrategy::new();
        assert!(strategy.response(BitSet::new(), PvValue::Int(1), BitSet::new()));
        assert!(strategy.poll().is_none());
    }
}
