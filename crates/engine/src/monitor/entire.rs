//! `queueSize == 0`: every update replaces the sole buffer; bitsets
//! retained as received (spec.md §4.9).

use parking_lot::Mutex;

use super::{MonitorElement, MonitorStrategy};
use crate::pvdata::{BitSet, PvValue};

#[derive(Default)]
pub struct EntireStrategy {
    current: Mutex<Option<MonitorElement>>,
}

impl EntireStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MonitorStrategy for EntireStrategy {
    fn init(&self, _structure: &PvValue) {
        *self.current.lock() = None;
    }

    fn response(&self, changed: BitSet, value: PvValue, overrun: BitSet) -> bool {
        *self.current.lock() = Some(MonitorElement { value, changed, overrun });
        true
    }

    fn poll(&self) -> Option<MonitorElement> {
        self.current.lock().take()
    }

    fn release(&self, _element: MonitorElement) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_later_update_replaces_an_unpolled_one() {
        let strategy = EntireStrategy::new();
        strategy.response(BitSet::new(), PvValue::Int(1), BitSet::new());
        strategy.response(BitSet::new(), PvValue::Int(2), BitSet::new());
        let element = strategy.poll().unwrap();
        assert_eq!(element.value, PvValue::Int(2));
        assert!(strategy.poll().is_none());
    }
}
