//! CID/IOID allocation (spec.md §3).
//!
//! Grounded on `crates/service/src/session/ports.rs`'s `PortAllocator`:
//! a table of occupied ids guarded by a lock owned by the allocating
//! struct, scanning forward from a remembered cursor and skipping both
//! already-occupied entries and the invalid sentinel.

use ahash::AHashSet;
use parking_lot::Mutex;

pub const INVALID: u32 = 0xFFFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cid(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ioid(pub u32);

impl Cid {
    pub const INVALID: Cid = Cid(INVALID);
}

impl Ioid {
    pub const INVALID: Ioid = Ioid(INVALID);
}

struct AllocatorState {
    occupied: AHashSet<u32>,
    last: u32,
}

/// Scans forward from the last-assigned value, skipping occupied entries
/// and the invalid sentinel, and recycling freed ids. Shared by the CID and
/// IOID allocators (spec.md §3: "Both allocators scan forward from a
/// remembered 'last' value...").
pub struct IdAllocator {
    state: Mutex<AllocatorState>,
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self {
            state: Mutex::new(AllocatorState {
                occupied: AHashSet::new(),
                last: 0,
            }),
        }
    }
}

impl IdAllocator {
    /// Allocate and mark occupied the next free id. Never returns
    /// `INVALID` and never returns a value already live.
    pub fn allocate(&self) -> u32 {
        let mut state = self.state.lock();
        loop {
            let candidate = state.last.wrapping_add(1);
            state.last = candidate;

            if candidate == INVALID || candidate == 0 {
                continue;
            }

            if state.occupied.insert(candidate) {
                return candidate;
            }
        }
    }

    /// Release an id so it may be recycled by a future `allocate`.
    pub fn free(&self, id: u32) {
        self.state.lock().occupied.remove(&id);
    }

    pub fn is_live(&self, id: u32) -> bool {
        self.state.lock().occupied.contains(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn never_returns_invalid_or_zero() {
        let alloc = IdAllocator::default();
        for _ in 0..10 {
            let id = alloc.allocate();
            assert_ne!(id, INVALID);
            assert_ne!(id, 0);
        }
    }

    #[test]
    fn never_returns_a_live_value_twice() {
        let alloc = IdAllocator::default();
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            let id = alloc.allocate();
            assert!(seen.insert(id), "id {id} handed out twice while still live");
        }
    }

    #[test]
    fn free_marks_an_id_no_longer_live() {
        let alloc = IdAllocator::default();
        let a = alloc.allocate();
        assert!(alloc.is_live(a));
        alloc.free(a);
        assert!(!alloc.is_live(a));
    }
}
