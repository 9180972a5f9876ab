//! Periodic resend of name-search datagrams with exponential back-off;
//! per-channel retry tracking (spec.md §4.3).

use std::time::{Duration, Instant};

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::ids::Cid;

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

struct SearchEntry {
    name: String,
    next_due: Instant,
    backoff: Duration,
}

/// Tracks every channel in NEVER_CONNECTED or DISCONNECTED ("search
/// instances", spec.md §4.3).
#[derive(Default)]
pub struct SearchManager {
    entries: Mutex<AHashMap<Cid, SearchEntry>>,
}

impl SearchManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, cid: Cid, name: String, now: Instant) {
        self.entries.lock().insert(
            cid,
            SearchEntry {
                name,
                next_due: now,
                backoff: INITIAL_BACKOFF,
            },
        );
    }

    pub fn unregister(&self, cid: Cid) {
        self.entries.lock().remove(&cid);
    }

    pub fn is_pending(&self, cid: Cid) -> bool {
        self.entries.lock().contains_key(&cid)
    }

    /// Called by the context's periodic search task: every entry whose
    /// back-off has elapsed is returned for resend, and its back-off is
    /// doubled (capped at `MAX_BACKOFF`) for next time.
    pub fn due_for_resend(&self, now: Instant) -> Vec<(Cid, String)> {
        let mut entries = self.entries.lock();
        let mut due = Vec::new();

        for (cid, entry) in entries.iter_mut() {
            if entry.next_due <= now {
                due.push((*cid, entry.name.clone()));
                entry.backoff = (entry.backoff * 2).min(MAX_BACKOFF);
                entry.next_due = now + entry.backoff;
            }
        }

        due
    }

    /// A new-server beacon resets every waiting channel's back-off so they
    /// resend promptly (spec.md §4.3).
    pub fn reset_backoffs(&self, now: Instant) {
        let mut entries = self.entries.lock();
        for entry in entries.values_mut() {
            entry.backoff = INITIAL_BACKOFF;
            entry.next_due = now;
        }
    }
}
