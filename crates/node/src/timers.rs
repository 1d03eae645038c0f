//! Timeout scheduling for the consensus loop.
//!
//! One live timer exists at a time. A schedule request supersedes the
//! pending one only when it is for a strictly newer (height, round, step);
//! older requests are ignored, so a stale timeout is never fired. A request
//! with zero duration is relayed immediately.

use stanchion_core::TimeoutInfo;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Drives timeouts for the consensus loop: requests in via
/// [`TimeoutScheduler::schedule`], fired timeouts out on the tock channel.
pub struct TimeoutScheduler {
    tock_tx: mpsc::Sender<TimeoutInfo>,
    current: Option<TimeoutInfo>,
    timer: Option<JoinHandle<()>>,
}

impl TimeoutScheduler {
    pub fn new(tock_tx: mpsc::Sender<TimeoutInfo>) -> Self {
        TimeoutScheduler {
            tock_tx,
            current: None,
            timer: None,
        }
    }

    /// Schedule a timeout, superseding the pending one if this request is
    /// newer.
    pub fn schedule(&mut self, ti: TimeoutInfo) {
        if let Some(current) = &self.current {
            if !ti.supersedes(current) {
                trace!(new = %ti, current = %current, "Ignoring timeout for older height/round/step");
                return;
            }
        }

        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.current = Some(ti);

        let tock_tx = self.tock_tx.clone();
        if ti.duration.is_zero() {
            // Relay immediately; the spawn keeps the caller non-blocking.
            self.timer = Some(tokio::spawn(async move {
                let _ = tock_tx.send(ti).await;
            }));
        } else {
            debug!(timeout = %ti, "Scheduling timeout");
            self.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(ti.duration).await;
                trace!(timeout = %ti, "Timed out");
                let _ = tock_tx.send(ti).await;
            }));
        }
    }

    /// Cancel the pending timer, if any. Called during shutdown.
    pub fn stop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.current = None;
    }
}

impl Drop for TimeoutScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stanchion_core::RoundStep;
    use std::time::Duration;

    fn ti(height: u64, round: u32, step: RoundStep, millis: u64) -> TimeoutInfo {
        TimeoutInfo {
            duration: Duration::from_millis(millis),
            height,
            round,
            step,
        }
    }

    #[tokio::test]
    async fn fires_after_duration() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut scheduler = TimeoutScheduler::new(tx);
        scheduler.schedule(ti(1, 0, RoundStep::Propose, 10));

        let fired = tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .expect("timer should fire")
            .unwrap();
        assert_eq!(fired.height, 1);
        assert_eq!(fired.step, RoundStep::Propose);
    }

    #[tokio::test]
    async fn zero_duration_relays_immediately() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut scheduler = TimeoutScheduler::new(tx);
        scheduler.schedule(ti(1, 0, RoundStep::NewHeight, 0));

        let fired = tokio::time::timeout(Duration::from_millis(50), rx.recv())
            .await
            .expect("zero timeout should relay at once")
            .unwrap();
        assert_eq!(fired.step, RoundStep::NewHeight);
    }

    #[tokio::test]
    async fn newer_request_supersedes_older() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut scheduler = TimeoutScheduler::new(tx);
        // Long timer for propose, then a short one for the next step.
        scheduler.schedule(ti(1, 0, RoundStep::Propose, 5_000));
        scheduler.schedule(ti(1, 0, RoundStep::PrevoteWait, 10));

        let fired = tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .expect("superseding timer should fire")
            .unwrap();
        assert_eq!(fired.step, RoundStep::PrevoteWait);
    }

    #[tokio::test]
    async fn older_request_is_ignored() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut scheduler = TimeoutScheduler::new(tx);
        scheduler.schedule(ti(2, 1, RoundStep::Prevote, 20));
        // A request for an earlier round must not replace the pending timer.
        scheduler.schedule(ti(2, 0, RoundStep::PrecommitWait, 1));

        let fired = tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .expect("original timer should fire")
            .unwrap();
        assert_eq!(fired.round, 1);
        assert_eq!(fired.step, RoundStep::Prevote);
    }

    #[tokio::test]
    async fn stop_cancels_pending_timer() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut scheduler = TimeoutScheduler::new(tx);
        scheduler.schedule(ti(1, 0, RoundStep::Propose, 20));
        scheduler.stop();

        let result = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(result.is_err(), "cancelled timer must not fire");
    }
}
