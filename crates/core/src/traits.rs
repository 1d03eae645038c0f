//! State machine trait.

use crate::{Action, Event};
use std::time::Duration;

/// A deterministic, synchronous state machine: events in, actions out.
///
/// Implementations mutate internal state but perform no network or storage
/// I/O (the two allowed suspension points — signer persistence and
/// application calls — go through injected traits). The runner sets the clock
/// before each call, so replaying the same events at the same times
/// reproduces the same actions.
pub trait StateMachine {
    /// Process one event, returning the actions to perform.
    fn handle(&mut self, event: Event) -> Vec<Action>;

    /// Set the current wall-clock time (duration since the Unix epoch).
    /// Called by the runner before every `handle`.
    fn set_time(&mut self, now: Duration);
}
