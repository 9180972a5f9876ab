//! `queueSize >= 2`: ring of `queueSize` buffers; on exhaustion, subsequent
//! updates merge into the last "live" buffer and mark local overrun
//! (spec.md §4.9).

use std::collections::VecDeque;

use parking_lot::Mutex;

use super::{MonitorElement, MonitorStrategy};
use crate::pvdata::{BitSet, PvValue};

struct Inner {
    free: Vec<MonitorElement>,
    used: VecDeque<MonitorElement>,
    working: Option<MonitorElement>,
    overrun_in_progress: bool,
    capacity: usize,
}

pub struct QueueStrategy {
    inner: Mutex<Inner>,
}

impl QueueStrategy {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                free: Vec::with_capacity(capacity),
                used: VecDeque::with_capacity(capacity),
                working: None,
                overrun_in_progress: false,
                capacity,
            }),
        }
    }
}

impl MonitorStrategy for QueueStrategy {
    fn init(&self, structure: &PvValue) {
        let mut inner = self.inner.lock();
        inner.used.clear();
        inner.working = None;
        inner.overrun_in_progress = false;
        inner.free = (0..inner.capacity)
            .map(|_| MonitorElement {
                value: structure.clone(),
                changed: BitSet::new(),
                overrun: BitSet::new(),
            })
            .collect();
    }

    fn response(&self, changed: BitSet, value: PvValue, overrun: BitSet) -> bool {
        let mut inner = self.inner.lock();
        let mut notified = false;

        // Step 1: recover a free element to publish the held-back working
        // element, if overrun-in-progress and a slot has freed up. The
        // working element accumulated bits across several merged updates,
        // so fold it against the structure before publishing (spec.md
        // §4.9 Queue strategy step 1, `BitSetUtil::compress`).
        if inner.overrun_in_progress {
            if let Some(mut recovered) = inner.free.pop() {
                if let Some(mut working) = inner.working.take() {
                    working.changed.compress(&working.value);
                    working.overrun.compress(&working.value);
                    recovered.value = working.value;
                    recovered.changed = working.changed;
                    recovered.overrun = working.overrun;
                    inner.used.push_back(recovered);
                    notified = true;
                } else {
                    inner.free.push(recovered);
                }
                inner.overrun_in_progress = false;
            }
        }

        // Step 2: deserialize the new update, merging into the working
        // element if still (or again) overrunning.
        if inner.overrun_in_progress {
            let working = inner.working.get_or_insert_with(|| MonitorElement {
                value: value.clone(),
                changed: BitSet::new(),
                overrun: BitSet::new(),
            });
            let mut missed = BitSet::new();
            missed.or_and_assign(&working.changed, &changed);
            working.overrun.or_assign(&missed);
            working.overrun.or_assign(&overrun);
            working.changed.or_assign(&changed);
            working.value = value;
        } else {
            inner.working = Some(MonitorElement { value, changed, overrun });
        }

        // Step 3: no free element left to hold a freshly published entry ->
        // hold this update back and mark overrun instead of publishing it.
        if inner.free.is_empty() {
            inner.overrun_in_progress = true;
            return notified;
        }

        // Step 4: publish the working element, consuming the free slot it
        // now occupies so a later exhaustion is detected by Step 3.
        if let Some(working) = inner.working.take() {
            inner.free.pop();
            inner.used.push_back(working);
            notified = true;
        }

        notified
    }

    fn poll(&self) -> Option<MonitorElement> {
        self.inner.lock().used.pop_front()
    }

    fn release(&self, element: MonitorElement) {
        let mut inner = self.inner.lock();
        if inner.free.len() < inner.capacity {
            inner.free.push(element);
        }
    }
}
