//! Core event/action model for stanchion consensus.
//!
//! This crate provides the types shared by the state machine and its runners:
//!
//! - [`Event`]: all possible inputs to the state machine
//! - [`Action`]: all possible outputs from the state machine
//! - [`ConsensusMessage`]: the wire messages peers exchange
//! - [`RoundStep`] / [`TimeoutInfo`]: step ordering and timeout descriptors
//! - [`StateMachine`]: the trait runners drive
//!
//! # Architecture
//!
//! ```text
//! Events → StateMachine::handle() → Actions
//! ```
//!
//! The state machine is:
//! - **Synchronous**: no async, no .await
//! - **Deterministic**: same state + event = same actions
//! - **Single-writer**: one event handler runs at a time; locally produced
//!   messages re-enter through the queue like peer messages
//!
//! All I/O is handled by the runner (production or simulation), which
//! delivers events, executes the returned actions, and appends each consumed
//! event to the write-ahead log before handing it to the state machine.

mod action;
mod event;
mod message;
mod step;
mod traits;

pub use action::{Action, RoundStepInfo};
pub use event::{Event, EventPriority, MessageSource};
pub use message::{ConsensusMessage, PeerId};
pub use step::{RoundStep, TimeoutInfo};
pub use traits::StateMachine;
