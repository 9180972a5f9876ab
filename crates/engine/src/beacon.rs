//! Per-server liveness notification; triggers accelerated search on
//! new-server detection (spec.md §4.3's "Beacon handler" row).

use std::net::SocketAddr;

use ahash::AHashSet;
use parking_lot::Mutex;

#[derive(Default)]
pub struct BeaconHandler {
    known: Mutex<AHashSet<SocketAddr>>,
}

impl BeaconHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true the first time a beacon is seen from `from`, which the
    /// caller should treat as "new-server detection" and use to reset every
    /// pending search's back-off (spec.md §4.3).
    pub fn on_beacon(&self, from: SocketAddr) -> bool {
        self.known.lock().insert(from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_repeated_beacon_from_the_same_server_is_not_new() {
        let handler = BeaconHandler::new();
        let addr: SocketAddr = "127.0.0.1:5076".parse().unwrap();
        assert!(handler.on_beacon(addr));
        assert!(!handler.on_beacon(addr));
    }
}
