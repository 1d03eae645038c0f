//! The production consensus event loop.
//!
//! A single task owns the [`ConsensusState`] and selects over four sources:
//! peer messages, self-messages, fired timeouts, and shutdown. Every
//! consumed event is appended to the WAL (and fsynced) before the state
//! machine sees it, so a crash at any point replays into the same state.

use crate::metrics;
use crate::store::NodeStorage;
use crate::timers::TimeoutScheduler;
use stanchion_consensus::{replay, ConsensusState, TimedWalMessage, Wal, WalMessage};
use stanchion_core::{
    Action, ConsensusMessage, Event, MessageSource, PeerId, RoundStep, RoundStepInfo,
    StateMachine, TimeoutInfo,
};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Errors from running the consensus loop.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("event channel closed")]
    ChannelClosed,
    #[error("wal replay failed: {0}")]
    Replay(#[from] stanchion_consensus::replay::ReplayError),
}

/// Handle for shutting down a running [`NodeRunner`].
///
/// Dropping the handle also signals shutdown.
#[derive(Debug)]
pub struct ShutdownHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl ShutdownHandle {
    /// Trigger shutdown (consumes the handle).
    pub fn shutdown(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for ShutdownHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

/// The channel ends the embedding node wires to its transport and observers.
pub struct NodeHandle {
    /// Feed pre-authenticated peer messages here.
    pub peer_tx: mpsc::Sender<(PeerId, ConsensusMessage)>,
    /// Messages the engine wants broadcast to all peers.
    pub outbound_rx: mpsc::Receiver<ConsensusMessage>,
    /// Step transitions, for status endpoints and tests.
    pub steps_rx: mpsc::Receiver<RoundStepInfo>,
    /// Shutdown trigger.
    pub shutdown: ShutdownHandle,
}

/// Owns the consensus state machine and drives it from the merged event
/// sources.
pub struct NodeRunner {
    cs: ConsensusState,
    wal: Wal,
    storage: Arc<NodeStorage>,
    scheduler: TimeoutScheduler,

    peer_rx: mpsc::Receiver<(PeerId, ConsensusMessage)>,
    internal_tx: mpsc::Sender<ConsensusMessage>,
    internal_rx: mpsc::Receiver<ConsensusMessage>,
    tock_rx: mpsc::Receiver<TimeoutInfo>,
    shutdown_rx: oneshot::Receiver<()>,

    outbound_tx: mpsc::Sender<ConsensusMessage>,
    steps_tx: mpsc::Sender<RoundStepInfo>,

    last_commit_at: Option<Instant>,
}

const CHANNEL_CAPACITY: usize = 1000;
const INTERNAL_SEND_TIMEOUT: Duration = Duration::from_millis(10);

impl NodeRunner {
    /// Build a runner around an already-recovered [`ConsensusState`].
    ///
    /// The caller is expected to have loaded the chain state and replayed
    /// any stored blocks into the application; the runner replays the WAL
    /// tail itself on [`NodeRunner::run`].
    pub fn new(cs: ConsensusState, wal: Wal, storage: Arc<NodeStorage>) -> (Self, NodeHandle) {
        let (peer_tx, peer_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (internal_tx, internal_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (tock_tx, tock_rx) = mpsc::channel(16);
        let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (steps_tx, steps_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let runner = NodeRunner {
            cs,
            wal,
            storage,
            scheduler: TimeoutScheduler::new(tock_tx),
            peer_rx,
            internal_tx,
            internal_rx,
            tock_rx,
            shutdown_rx,
            outbound_tx,
            steps_tx,
            last_commit_at: None,
        };
        let handle = NodeHandle {
            peer_tx,
            outbound_rx,
            steps_rx,
            shutdown: ShutdownHandle {
                tx: Some(shutdown_tx),
            },
        };
        (runner, handle)
    }

    fn now() -> Duration {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before the unix epoch")
    }

    /// Replay the WAL tail, then run the event loop until shutdown.
    pub async fn run(mut self) -> Result<(), RunnerError> {
        // Crash recovery: drive the machine through everything logged since
        // the last height marker. Signing is idempotent on identical bytes,
        // so our own votes are reproduced rather than re-issued.
        let replayed = replay::catchup(&mut self.cs, self.wal.path())?;
        if replayed > 0 {
            info!(
                replayed,
                height = self.cs.height(),
                "WAL replay complete; resuming consensus"
            );
        }

        self.cs.set_time(Self::now());
        let actions = self.cs.start();
        self.execute_actions(actions).await;

        loop {
            tokio::select! {
                biased;

                _ = &mut self.shutdown_rx => {
                    // Quit drains no queues: the WAL is already fsynced for
                    // everything the machine has seen.
                    info!("Shutting down consensus loop");
                    self.scheduler.stop();
                    return Ok(());
                }

                Some(message) = self.internal_rx.recv() => {
                    self.process(Event::Message { msg: message, from: MessageSource::Local }).await;
                }

                Some(ti) = self.tock_rx.recv() => {
                    self.process(Event::Timeout(ti)).await;
                }

                Some((peer, message)) = self.peer_rx.recv() => {
                    self.process(Event::Message { msg: message, from: MessageSource::Peer(peer) }).await;
                }

                else => {
                    return Err(RunnerError::ChannelClosed);
                }
            }
        }
    }

    /// Log, mutate, emit: the order the WAL guarantees depend on.
    async fn process(&mut self, event: Event) {
        let now = Self::now();
        self.cs.set_time(now);

        let wal_msg = match &event {
            Event::Message { msg, from } => WalMessage::Received {
                msg: msg.clone(),
                from: from.clone(),
            },
            Event::Timeout(ti) => WalMessage::Timeout(*ti),
        };
        let wal_start = Instant::now();
        self.wal.save(&TimedWalMessage {
            time_ms: now.as_millis() as u64,
            msg: wal_msg,
        });
        metrics::record_wal_write(wal_start.elapsed().as_secs_f64());
        metrics::metrics().events_processed.inc();

        let actions = self.cs.handle(event);
        self.execute_actions(actions).await;
    }

    async fn execute_actions(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Broadcast { message } => {
                    if self.outbound_tx.send(message).await.is_err() {
                        debug!("Outbound channel closed; dropping broadcast");
                    }
                }
                Action::ScheduleTimeout(ti) => {
                    self.scheduler.schedule(ti);
                }
                Action::EnqueueInternal { message } => {
                    self.send_internal(message).await;
                }
                Action::PublishStep(info) => {
                    self.publish_step(info).await;
                }
                Action::PersistEvidence { evidence } => {
                    warn!(%evidence, "Persisting double-sign evidence");
                    self.storage.put_evidence(&evidence);
                }
            }
        }
    }

    /// Self-messages must not deadlock the loop when the internal queue is
    /// full of... our own messages. Try briefly, then hand the send to a
    /// one-shot task.
    async fn send_internal(&mut self, message: ConsensusMessage) {
        match tokio::time::timeout(
            INTERNAL_SEND_TIMEOUT,
            self.internal_tx.send(message.clone()),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(_)) => debug!("Internal channel closed; dropping self-message"),
            Err(_) => {
                metrics::metrics().internal_sends_deferred.inc();
                debug!("Internal queue full; launching deferred sender");
                let tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    let _ = tx.send(message).await;
                });
            }
        }
    }

    async fn publish_step(&mut self, info: RoundStepInfo) {
        metrics::record_step(info.height, info.round);
        if info.step == RoundStep::NewHeight {
            let now = Instant::now();
            if let Some(previous) = self.last_commit_at.replace(now) {
                metrics::record_commit((now - previous).as_secs_f64());
            }
        }

        // The step record is the WAL's replay checkpoint; the height marker
        // is written by the WAL itself.
        self.wal.save(&TimedWalMessage {
            time_ms: Self::now().as_millis() as u64,
            msg: WalMessage::Step(info),
        });

        // Observers are best-effort.
        if self.steps_tx.try_send(info).is_err() {
            debug!("Step observer channel full; dropping notification");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stanchion_app::mock::KvApp;
    use stanchion_app::{BlockExecutor, BlockStore, ChainState, StateStore};
    use stanchion_consensus::{ConsensusConfig, FifoMempool};
    use stanchion_signer::{FilePrivValidator, PrivValidator};
    use stanchion_types::test_utils::test_validator_set;
    use stanchion_types::ConsensusParams;
    use tempfile::TempDir;

    fn build_single_node(dir: &std::path::Path) -> (NodeRunner, NodeHandle, Arc<NodeStorage>) {
        let (validators, keys) = test_validator_set(1, 10);
        let storage = Arc::new(NodeStorage::open(dir.join("db")).unwrap());
        let state_store = StateStore::new(storage.clone());

        let chain_state = match state_store.load() {
            Some(state) => state,
            None => {
                let state =
                    ChainState::from_genesis("test-chain", validators, ConsensusParams::default());
                state
            }
        };

        let mut executor = BlockExecutor::new(Box::new(KvApp::new()), state_store.clone());
        if chain_state.last_block_height == 0 {
            executor.init_chain(&chain_state);
        }
        let chain_state = executor
            .replay_stored_blocks(chain_state, storage.as_ref())
            .unwrap();

        let pv_path = dir.join("priv_validator.json");
        let pv: Arc<dyn PrivValidator> = if pv_path.exists() {
            Arc::new(FilePrivValidator::load(&pv_path).unwrap())
        } else {
            Arc::new(FilePrivValidator::generate(&pv_path, keys[0].clone()))
        };

        let mut config = ConsensusConfig::default();
        config.timeout_commit = Duration::from_millis(50);
        let cs = ConsensusState::new(
            config,
            chain_state,
            Some(pv),
            executor,
            storage.clone(),
            Arc::new(FifoMempool::new()),
        );
        let wal = Wal::open(dir.join("wal"), false, 64 * 1024 * 1024).unwrap();
        let (runner, handle) = NodeRunner::new(cs, wal, storage.clone());
        (runner, handle, storage)
    }

    #[tokio::test]
    async fn single_validator_node_commits_blocks() {
        let dir = TempDir::new().unwrap();
        let (runner, mut handle, storage) = build_single_node(dir.path());
        let task = tokio::spawn(runner.run());

        // Wait until height 3 is reached.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let step = tokio::time::timeout_at(deadline, handle.steps_rx.recv())
                .await
                .expect("node should make progress")
                .expect("steps channel open");
            if step.height >= 3 {
                break;
            }
        }

        assert!(storage.height() >= 2);
        assert!(storage.load_block(1).is_some());

        handle.shutdown.shutdown();
        let _ = task.await;
    }

    #[tokio::test]
    async fn node_restarts_from_wal_and_continues() {
        let dir = TempDir::new().unwrap();

        // First run: commit a couple of blocks, then stop.
        let reached = {
            let (runner, mut handle, storage) = build_single_node(dir.path());
            let task = tokio::spawn(runner.run());
            let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
            loop {
                let step = tokio::time::timeout_at(deadline, handle.steps_rx.recv())
                    .await
                    .expect("node should make progress")
                    .expect("steps channel open");
                if step.height >= 3 {
                    break;
                }
            }
            handle.shutdown.shutdown();
            let _ = task.await;
            storage.height()
        };
        assert!(reached >= 2);

        // Second run from the same directory: recovery must land at or past
        // the first run's height and keep committing.
        let (runner, mut handle, storage) = build_single_node(dir.path());
        let task = tokio::spawn(runner.run());
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let step = tokio::time::timeout_at(deadline, handle.steps_rx.recv())
                .await
                .expect("restarted node should make progress")
                .expect("steps channel open");
            if step.height > reached + 1 {
                break;
            }
        }
        assert!(storage.height() > reached);
        handle.shutdown.shutdown();
        let _ = task.await;
    }
}
