//! Action types emitted by the consensus state machine.

use crate::message::ConsensusMessage;
use crate::step::{RoundStep, TimeoutInfo};
use serde::{Deserialize, Serialize};
use stanchion_types::DuplicateVoteEvidence;

/// A step transition notification: written to the WAL as a replay checkpoint
/// and handed to external observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundStepInfo {
    pub height: u64,
    pub round: u32,
    pub step: RoundStep,
}

/// Actions the state machine wants performed.
///
/// Actions are **commands**. The runner executes them; the state machine
/// performs no network or storage I/O of its own.
#[derive(Debug, Clone)]
pub enum Action {
    /// Broadcast a message to all peers.
    Broadcast { message: ConsensusMessage },

    /// Schedule a timeout. Supersedes any pending timeout with an older
    /// (height, round, step).
    ScheduleTimeout(TimeoutInfo),

    /// Feed one of our own messages back through the event queue.
    ///
    /// Internal events are processed before new external inputs, preserving
    /// causality.
    EnqueueInternal { message: ConsensusMessage },

    /// A step completed. The runner appends this to the WAL (preceded by a
    /// height marker when the step is NewHeight) and notifies observers.
    PublishStep(RoundStepInfo),

    /// Persist double-sign evidence for later slashing.
    PersistEvidence { evidence: DuplicateVoteEvidence },
}

impl Action {
    /// Action type name for logs and telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Action::Broadcast { .. } => "Broadcast",
            Action::ScheduleTimeout(_) => "ScheduleTimeout",
            Action::EnqueueInternal { .. } => "EnqueueInternal",
            Action::PublishStep(_) => "PublishStep",
            Action::PersistEvidence { .. } => "PersistEvidence",
        }
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, Action::EnqueueInternal { .. })
    }
}
