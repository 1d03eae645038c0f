//! Production runner for stanchion consensus.
//!
//! Wires the sans-I/O consensus state machine to the real world:
//!
//! - [`NodeRunner`]: the tokio event loop selecting over peer messages,
//!   self-messages, timeouts, and shutdown; appends every event to the WAL
//!   before handling it
//! - [`TimeoutScheduler`]: one live timer, superseded by newer
//!   (height, round, step) requests
//! - [`NodeStorage`]: RocksDB block store, state store, and evidence store
//! - [`metrics`]: Prometheus gauges and histograms
//!
//! The peer-to-peer transport itself is an external collaborator: it feeds
//! pre-authenticated messages into [`NodeHandle::peer_tx`] and drains
//! [`NodeHandle::outbound_rx`].

pub mod metrics;
mod runner;
mod store;
mod timers;

pub use runner::{NodeHandle, NodeRunner, RunnerError, ShutdownHandle};
pub use store::{NodeStorage, StorageError};
pub use timers::TimeoutScheduler;
