//! Deterministic event ordering.

use stanchion_core::Event;
use std::time::Duration;

/// Index of a node in the simulation.
pub type NodeIndex = u32;

/// Ordering key for the global event queue.
///
/// Events are processed by (time, priority, node, sequence). The sequence
/// counter breaks any remaining ties deterministically, so a given seed
/// always replays the same schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct EventKey {
    pub time: Duration,
    pub priority: u8,
    pub node: NodeIndex,
    pub sequence: u64,
}

impl EventKey {
    pub fn new(time: Duration, event: &Event, node: NodeIndex, sequence: u64) -> Self {
        EventKey {
            time,
            priority: event.priority() as u8,
            node,
            sequence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stanchion_core::{RoundStep, TimeoutInfo};

    #[test]
    fn orders_by_time_then_priority() {
        let timeout = Event::Timeout(TimeoutInfo {
            duration: Duration::ZERO,
            height: 1,
            round: 0,
            step: RoundStep::NewHeight,
        });
        let early = EventKey::new(Duration::from_millis(5), &timeout, 3, 10);
        let late = EventKey::new(Duration::from_millis(9), &timeout, 0, 1);
        assert!(early < late);

        let same_time_earlier_seq = EventKey::new(Duration::from_millis(9), &timeout, 0, 0);
        assert!(same_time_earlier_seq < late);
    }
}
