//! The pvAccess client engine: channel lifecycle, the request/response
//! state machines for every operation kind, monitor delivery strategies,
//! and the transports and discovery machinery that drive them
//! (spec.md §4).
//!
//! This crate has no public "do the network dance" entry point beyond
//! [`context::ClientContext`] — typed, ergonomic request builders live in
//! the facade crate at the workspace root.

pub mod beacon;
pub mod channel;
pub mod context;
pub mod error;
pub mod ids;
pub mod monitor;
pub mod operations;
pub mod options;
pub mod pvdata;
pub mod request;
pub mod search;
pub mod transport;

pub use channel::{Channel, ChannelRequester, ConnectionState};
pub use context::ClientContext;
pub use error::{ErrorKind, Severity, Status};
pub use ids::{Cid, Ioid};
pub use options::{ContextOptions, FlushStrategy};
pub use pvdata::{BitSet, PvValue};
