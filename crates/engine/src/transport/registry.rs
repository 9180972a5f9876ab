//! Multiplexes access to TCP transports; reference-counted sharing across
//! channels bound to the same (address, priority) (spec.md §4.2's
//! "Transport registry" row).

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use ahash::AHashMap;
use parking_lot::Mutex;

use super::TransportHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Key {
    addr: SocketAddr,
    priority: u8,
}

#[derive(Default)]
pub struct TransportRegistry {
    transports: Mutex<AHashMap<Key, Weak<dyn TransportHandle>>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A live transport already registered for this (address, priority), if
    /// one exists.
    pub fn get(&self, addr: SocketAddr, priority: u8) -> Option<Arc<dyn TransportHandle>> {
        let key = Key { addr, priority };
        let mut transports = self.transports.lock();
        match transports.get(&key).and_then(Weak::upgrade) {
            Some(t) if !t.is_closed() => Some(t),
            _ => {
                transports.remove(&key);
                None
            }
        }
    }

    pub fn insert(&self, addr: SocketAddr, priority: u8, transport: Arc<dyn TransportHandle>) {
        let key = Key { addr, priority };
        self.transports.lock().insert(key, Arc::downgrade(&transport));
    }

    pub fn remove(&self, addr: SocketAddr, priority: u8) {
        self.transports.lock().remove(&Key { addr, priority });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Sender;

    struct DeadTransport;
    impl TransportHandle for DeadTransport {
        fn enqueue(&self, _sender: Arc<dyn Sender>) {}
        fn byte_order(&self) -> codec::ByteOrder {
            codec::ByteOrder::Big
        }
        fn is_closed(&self) -> bool {
            true
        }
        fn close(&self) {}
    }

    #[test]
    fn a_closed_transport_is_not_returned() {
        let registry = TransportRegistry::new();
        let addr: SocketAddr = "127.0.0.1:5075".parse().unwrap();
        registry.insert(addr, 0, Arc::new(DeadTransport));
        assert!(registry.get(addr, 0).is_none());
    }
}
