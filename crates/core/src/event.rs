//! Event types for the consensus state machine.

use crate::message::{ConsensusMessage, PeerId};
use crate::step::TimeoutInfo;
use serde::{Deserialize, Serialize};

/// Where a message came from.
///
/// Locally produced proposals, parts, and votes travel through the same
/// event queue as peer messages, so the event loop is the only mutator of
/// round state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageSource {
    /// Produced by this node (self-message).
    Local,
    /// Received from a peer over the transport.
    Peer(PeerId),
}

impl MessageSource {
    pub fn is_local(&self) -> bool {
        matches!(self, MessageSource::Local)
    }
}

/// Priority levels for event ordering at the same timestamp.
///
/// Lower values are processed first. Internal events are consequences of
/// prior processing and must run before new external inputs to preserve
/// causality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum EventPriority {
    /// Self-messages: consequences of prior event processing.
    Internal = 0,
    /// Fired timeouts.
    Timer = 1,
    /// Messages from peers.
    Network = 2,
}

/// All inputs the consensus state machine can receive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    /// A consensus message, from a peer or from ourselves.
    Message {
        msg: ConsensusMessage,
        from: MessageSource,
    },

    /// A timeout fired by the scheduler.
    Timeout(TimeoutInfo),
}

impl Event {
    pub fn priority(&self) -> EventPriority {
        match self {
            Event::Message {
                from: MessageSource::Local,
                ..
            } => EventPriority::Internal,
            Event::Timeout(_) => EventPriority::Timer,
            Event::Message {
                from: MessageSource::Peer(_),
                ..
            } => EventPriority::Network,
        }
    }

    /// Event type name for logs and telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::Message { msg, .. } => msg.type_name(),
            Event::Timeout(_) => "Timeout",
        }
    }
}
