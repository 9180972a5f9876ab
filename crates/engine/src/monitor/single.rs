//! `queueSize == 1`: merges consecutive updates into the sole buffer;
//! computes local overrun (spec.md §4.9).

use parking_lot::Mutex;

use super::{MonitorElement, MonitorStrategy};
use crate::pvdata::{BitSet, PvValue};

struct Inner {
    element: Option<MonitorElement>,
    got_monitor: bool,
    /// Set when a `response` merged into an already-buffered update;
    /// cleared (after compressing) the next time `poll` is called
    /// (spec.md §4.9 line 159, `BitSetUtil::compress`/`m_needToCompress`).
    needs_compress: bool,
}

pub struct SingleStrategy {
    inner: Mutex<Inner>,
}

impl SingleStrategy {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner { element: None, got_monitor: false, needs_compress: false }),
        }
    }
}

impl Default for SingleStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitorStrategy for SingleStrategy {
    fn init(&self, _structure: &PvValue) {
        let mut inner = self.inner.lock();
        inner.element = None;
        inner.got_monitor = false;
        inner.needs_compress = false;
    }

    fn response(&self, changed: BitSet, value: PvValue, overrun: BitSet) -> bool {
        let mut inner = self.inner.lock();

        if !inner.got_monitor {
            inner.element = Some(MonitorElement { value, changed, overrun });
            inner.got_monitor = true;
            return true;
        }

        let existing = inner.element.get_or_insert_with(|| MonitorElement {
            value: value.clone(),
            changed: BitSet::new(),
            overrun: BitSet::new(),
        });

        // Which bits the caller never got to see, plus whatever the server
        // already flagged as overrun.
        let mut missed = BitSet::new();
        missed.or_and_assign(&existing.changed, &changed);
        existing.overrun.or_assign(&missed);
        existing.overrun.or_assign(&overrun);
        existing.changed.or_assign(&changed);
        existing.value = value;
        inner.needs_compress = true;

        true
    }

    fn poll(&self) -> Option<MonitorElement> {
        let mut inner = self.inner.lock();
        inner.got_monitor = false;
        let mut element = inner.element.take()?;
        if std::mem::take(&mut inner.needs_compress) {
            element.changed.compress(&element.value);
            element.overrun.compress(&element.value);
        }
        Some(element)
    }

    fn release(&self, _element: MonitorElement) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merges_two_unpolled_updates_and_tracks_overrun() {
        let strategy = SingleStrategy::new();

        let mut first_changed = BitSet::new();
        first_changed.set(1);
        first_changed.set(2);
        strategy.response(first_changed, PvValue::Int(1), BitSet::new());

        let mut second_changed = BitSet::new();
        second_changed.set(2);
        second_changed.set(3);
        strategy.response(second_changed, PvValue::Int(2), BitSet::new());

        let element = strategy.poll().unwrap();
        assert_eq!(element.value, PvValue::Int(2));
        assert!(element.changed.get(1) && element.changed.get(2) && element.changed.get(3));
        // Bit 2 changed in both updates without being polled in between —
        // the caller never saw the first value, so it's an overrun.
        assert!(element.overrun.get(2));
        assert!(!element.overrun.get(1));
        assert!(!element.overrun.get(3));
    }

    #[test]
    fn a_polled_update_does_not_pollute_the_next_ones_overrun() {
        let strategy = SingleStrategy::new();
        let mut changed = BitSet::new();
        changed.set(0);
        strategy.response(changed.clone(), PvValue::Int(1), BitSet::new());
        strategy.poll();

        strategy.response(changed, PvValue::Int(2), BitSet::new());
        let element = strategy.poll().unwrap();
        assert!(!element.overrun.get(0));
    }

    #[test]
    fn poll_folds_a_merges_fully_changed_parent_into_its_own_bit() {
        // offsets: 0 root, 1 "a" (struct), 2 "a.x", 3 "a.y", 4 "b"; "b" is
        // an untouched sibling so the fold stops at "a" rather than
        // cascading all the way up to the root's own bit.
        let structure = PvValue::struct_with([
            ("a", PvValue::struct_with([("x", PvValue::Int(0)), ("y", PvValue::Int(0))])),
            ("b", PvValue::Int(0)),
        ]);

        let strategy = SingleStrategy::new();
        let mut first = BitSet::new();
        first.set(2); // a.x
        strategy.response(first, structure.clone(), BitSet::new());

        let mut second = BitSet::new();
        second.set(3); // a.y
        strategy.response(second, structure, BitSet::new());

        // No poll happened between the two updates, so this merged and
        // needs the deferred fold.
        let element = strategy.poll().unwrap();
        assert!(element.changed.get(1), "a.x and a.y together fold into a's own bit");
        assert!(!element.changed.get(2));
        assert!(!element.changed.get(3));
    }
}
