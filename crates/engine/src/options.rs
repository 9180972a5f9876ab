//! Context-wide configuration knobs the engine itself consumes (spec.md
//! §6). The facade crate's `Config` maps onto this at `ClientContext`
//! construction time.

use std::net::SocketAddr;
use std::time::Duration;

/// How queued sends are flushed to a transport's socket (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStrategy {
    /// Write each frame to the socket as soon as it's built.
    Immediate,
    /// Coalesce frames queued within a short window into one write.
    Delayed,
    /// The application calls an explicit flush; the engine never does.
    UserControlled,
}

#[derive(Debug, Clone)]
pub struct ContextOptions {
    /// Addresses the search manager sends SEARCH datagrams to: unicast
    /// peers and/or a subnet broadcast address (spec.md §4.2).
    pub search_targets: Vec<SocketAddr>,
    /// Local address the discovery (UDP) socket binds to.
    pub discovery_bind: SocketAddr,
    /// Passed through to each TCP transport's handshake/keep-alive timing
    /// (spec.md §4.4, §6).
    pub conn_timeout: Duration,
    pub flush_strategy: FlushStrategy,
}

impl ContextOptions {
    pub fn search_targets(&self) -> &[SocketAddr] {
        &self.search_targets
    }
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            search_targets: Vec::new(),
            discovery_bind: "0.0.0.0:0".parse().unwrap(),
            conn_timeout: Duration::from_secs(30),
            flush_strategy: FlushStrategy::Delayed,
        }
    }
}
