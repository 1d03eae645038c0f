//! Consensus timing configuration.

use std::time::Duration;

/// Timeouts and WAL knobs for the consensus state machine.
///
/// The per-round deltas grow each timeout linearly with the round number, so
/// that under degraded networks later rounds wait longer before giving up on
/// the proposer or on straggling votes.
#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    /// How long to wait for a proposal before prevoting nil, at round 0.
    pub timeout_propose: Duration,
    /// Added to `timeout_propose` per round.
    pub timeout_propose_delta: Duration,
    /// Straggler window after seeing 2/3-any prevotes, at round 0.
    pub timeout_prevote: Duration,
    pub timeout_prevote_delta: Duration,
    /// Straggler window after seeing 2/3-any precommits, at round 0.
    pub timeout_precommit: Duration,
    pub timeout_precommit_delta: Duration,
    /// Delay between committing a block and starting the next height's round
    /// 0, to gather straggler precommits and fresh transactions.
    pub timeout_commit: Duration,
    /// Start the next height immediately on a 2/3 precommit majority instead
    /// of waiting out `timeout_commit`.
    pub skip_timeout_commit: bool,
    /// Omit peer-sourced block parts from the WAL. Keeps the log small and
    /// is still sufficient for replay, since our own records drive the same
    /// transitions.
    pub wal_light: bool,
    /// Rotate the WAL head file once it exceeds this many bytes.
    pub wal_max_file_size: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        ConsensusConfig {
            timeout_propose: Duration::from_millis(3000),
            timeout_propose_delta: Duration::from_millis(500),
            timeout_prevote: Duration::from_millis(1000),
            timeout_prevote_delta: Duration::from_millis(500),
            timeout_precommit: Duration::from_millis(1000),
            timeout_precommit_delta: Duration::from_millis(500),
            timeout_commit: Duration::from_millis(2000),
            skip_timeout_commit: false,
            wal_light: false,
            wal_max_file_size: 64 * 1024 * 1024,
        }
    }
}

impl ConsensusConfig {
    pub fn propose_timeout(&self, round: u32) -> Duration {
        self.timeout_propose + self.timeout_propose_delta * round
    }

    pub fn prevote_timeout(&self, round: u32) -> Duration {
        self.timeout_prevote + self.timeout_prevote_delta * round
    }

    pub fn precommit_timeout(&self, round: u32) -> Duration {
        self.timeout_precommit + self.timeout_precommit_delta * round
    }
}
