//! Deterministic simulation of a stanchion validator network.
//!
//! Nodes run the real consensus state machine, file signer, WAL, and block
//! executor; the harness simulates time, the network (latency, jitter,
//! partitions, packet loss), and per-node storage. A single seeded event
//! queue drives everything, so a run is a pure function of its seed and the
//! harness calls made — the property the end-to-end tests build on.

mod event_queue;
mod network;
mod runner;

pub use event_queue::{EventKey, NodeIndex};
pub use network::{NetworkConfig, SimulatedNetwork};
pub use runner::{sim_consensus_config, SimulationRunner, SimulationStats};
