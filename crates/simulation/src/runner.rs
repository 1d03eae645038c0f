//! Deterministic simulation runner.
//!
//! Every node runs the real consensus machine, the real file signer, and a
//! real WAL; only time, the network, and storage are simulated. Events are
//! processed in a single global order, so a given seed always produces the
//! same run — including crashes and restarts.

use crate::event_queue::{EventKey, NodeIndex};
use crate::network::{NetworkConfig, SimulatedNetwork};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use stanchion_app::mock::KvApp;
use stanchion_app::{BlockExecutor, BlockStore, ChainState, MemBlockStore, MemKvStore, StateStore};
use stanchion_consensus::{
    replay, ConsensusConfig, ConsensusState, FifoMempool, TimedWalMessage, Wal, WalMessage,
};
use stanchion_core::{
    Action, ConsensusMessage, Event, MessageSource, PeerId, StateMachine, TimeoutInfo,
};
use stanchion_signer::{FilePrivValidator, PrivValidator};
use stanchion_types::{
    test_utils::test_validator_set, Block, Commit, ConsensusParams, DuplicateVoteEvidence, KeyPair,
    Tx, ValidatorSet,
};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tracing::{debug, info, trace};

const CHAIN_ID: &str = "sim-chain";

/// A consensus configuration with timeouts scaled for simulation runs.
pub fn sim_consensus_config() -> ConsensusConfig {
    ConsensusConfig {
        timeout_propose: Duration::from_millis(200),
        timeout_propose_delta: Duration::from_millis(100),
        timeout_prevote: Duration::from_millis(100),
        timeout_prevote_delta: Duration::from_millis(50),
        timeout_precommit: Duration::from_millis(100),
        timeout_precommit_delta: Duration::from_millis(50),
        timeout_commit: Duration::from_millis(200),
        ..ConsensusConfig::default()
    }
}

/// Statistics collected during simulation.
#[derive(Debug, Default, Clone)]
pub struct SimulationStats {
    pub events_processed: u64,
    pub actions_generated: u64,
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub timers_set: u64,
}

struct NodeSlot {
    kv: Arc<MemKvStore>,
    blocks: Arc<MemBlockStore>,
    mempool: Arc<FifoMempool>,
    cs: Option<ConsensusState>,
    wal: Option<Wal>,
    wal_dir: PathBuf,
    pv_path: PathBuf,
    online: bool,
    evidence: Vec<DuplicateVoteEvidence>,
}

/// Deterministic multi-validator simulation.
///
/// Given the same seed and the same sequence of harness calls, every run
/// processes the same events in the same order.
pub struct SimulationRunner {
    validators: ValidatorSet,
    keys: Vec<KeyPair>,
    consensus_config: ConsensusConfig,
    nodes: Vec<NodeSlot>,
    event_queue: BTreeMap<EventKey, Event>,
    sequence: u64,
    now: Duration,
    network: SimulatedNetwork,
    rng: ChaCha8Rng,
    /// One live timer per node, superseded by newer (height, round, step).
    timers: HashMap<NodeIndex, (TimeoutInfo, EventKey)>,
    stats: SimulationStats,
    /// Holds each node's WAL directory and priv_validator.json across
    /// crashes and restarts.
    dir: TempDir,
}

impl SimulationRunner {
    pub fn new(network_config: NetworkConfig, consensus_config: ConsensusConfig, seed: u64) -> Self {
        let n = network_config.num_validators as usize;
        let (validators, keys) = test_validator_set(n, 10);
        let network = SimulatedNetwork::new(network_config);
        let rng = ChaCha8Rng::seed_from_u64(seed);
        let dir = TempDir::new().expect("simulation temp dir");

        let nodes = (0..n)
            .map(|i| NodeSlot {
                kv: Arc::new(MemKvStore::new()),
                blocks: Arc::new(MemBlockStore::new()),
                mempool: Arc::new(FifoMempool::new()),
                cs: None,
                wal: None,
                wal_dir: dir.path().join(format!("node{}/wal", i)),
                pv_path: dir.path().join(format!("node{}/priv_validator.json", i)),
                online: false,
                evidence: Vec::new(),
            })
            .collect();

        info!(validators = n, seed, "Created simulation runner");
        SimulationRunner {
            validators,
            keys,
            consensus_config,
            nodes,
            event_queue: BTreeMap::new(),
            sequence: 0,
            now: Duration::from_secs(1),
            network,
            rng,
            timers: HashMap::new(),
            stats: SimulationStats::default(),
            dir,
        }
    }

    // ───────────────────────────── accessors ─────────────────────────────

    pub fn stats(&self) -> &SimulationStats {
        &self.stats
    }

    pub fn now(&self) -> Duration {
        self.now
    }

    pub fn network_mut(&mut self) -> &mut SimulatedNetwork {
        &mut self.network
    }

    pub fn keys(&self) -> &[KeyPair] {
        &self.keys
    }

    pub fn validators(&self) -> &ValidatorSet {
        &self.validators
    }

    /// The validator index that proposes at height 1, round 0.
    pub fn first_proposer(&self) -> NodeIndex {
        let address = self.validators.proposer().address;
        self.validators.index_of(&address).expect("proposer in set")
    }

    /// Consensus height the node is working on (0 when offline).
    pub fn height(&self, node: NodeIndex) -> u64 {
        self.nodes[node as usize]
            .cs
            .as_ref()
            .map(|cs| cs.height())
            .unwrap_or(0)
    }

    /// Highest committed height in the node's block store.
    pub fn committed_height(&self, node: NodeIndex) -> u64 {
        self.nodes[node as usize].blocks.height()
    }

    pub fn committed_block(&self, node: NodeIndex, height: u64) -> Option<Block> {
        self.nodes[node as usize].blocks.load_block(height)
    }

    pub fn seen_commit(&self, node: NodeIndex, height: u64) -> Option<Commit> {
        self.nodes[node as usize].blocks.load_seen_commit(height)
    }

    pub fn evidence(&self, node: NodeIndex) -> &[DuplicateVoteEvidence] {
        &self.nodes[node as usize].evidence
    }

    pub fn is_online(&self, node: NodeIndex) -> bool {
        self.nodes[node as usize].online
    }

    /// Submit a transaction to one node's mempool.
    pub fn submit_tx(&mut self, node: NodeIndex, tx: Tx) {
        self.nodes[node as usize].mempool.push(tx);
    }

    // ───────────────────────────── lifecycle ─────────────────────────────

    /// Boot every node and schedule their round-0 timers.
    pub fn start_all(&mut self) {
        for node in 0..self.nodes.len() as NodeIndex {
            self.start_node(node);
        }
    }

    /// Boot one node (fresh or after a crash). Recovers committed state from
    /// its stores, replays the WAL tail, and resumes consensus.
    pub fn start_node(&mut self, node: NodeIndex) {
        let slot = &mut self.nodes[node as usize];
        assert!(slot.cs.is_none(), "node {} already running", node);

        std::fs::create_dir_all(slot.wal_dir.parent().unwrap()).expect("node dir");

        let state_store = StateStore::new(slot.kv.clone());
        let genesis = ChainState::from_genesis(
            CHAIN_ID,
            self.validators.clone(),
            ConsensusParams::default(),
        );

        // The application lives in memory only, so every boot rebuilds it by
        // re-running the stored chain from genesis. Execution is
        // deterministic: the rebuilt state matches what was persisted.
        let mut executor = BlockExecutor::new(Box::new(KvApp::new()), state_store);
        executor.init_chain(&genesis);
        let chain_state = executor
            .replay_stored_blocks(genesis, slot.blocks.as_ref())
            .expect("stored blocks must replay");

        // The signer file survives crashes; reload it so the HRS guard
        // carries over. A node that never signed starts fresh.
        let pv: Arc<dyn PrivValidator> = if slot.pv_path.exists() {
            Arc::new(FilePrivValidator::load(&slot.pv_path).expect("priv validator loads"))
        } else {
            Arc::new(FilePrivValidator::generate(
                &slot.pv_path,
                self.keys[node as usize].clone(),
            ))
        };

        let mut cs = ConsensusState::new(
            self.consensus_config.clone(),
            chain_state,
            Some(pv),
            executor,
            slot.blocks.clone(),
            slot.mempool.clone(),
        );
        cs.set_time(self.now);

        let wal_existed = slot.wal_dir.join("wal").exists();
        let wal = Wal::open(
            &slot.wal_dir,
            self.consensus_config.wal_light,
            self.consensus_config.wal_max_file_size,
        )
        .expect("wal opens");
        if wal_existed {
            let replayed = replay::catchup(&mut cs, wal.path()).expect("wal replay must succeed");
            debug!(node, replayed, "Replayed WAL records");
        }

        slot.cs = Some(cs);
        slot.wal = Some(wal);
        slot.online = true;

        let actions = self.nodes[node as usize]
            .cs
            .as_mut()
            .unwrap()
            .start();
        for action in actions {
            self.process_action(node, action);
        }
        info!(node, "Node started");
    }

    /// Crash a node: its consensus state and application state are lost, its
    /// WAL, signer file, and stores survive.
    pub fn crash_node(&mut self, node: NodeIndex) {
        let slot = &mut self.nodes[node as usize];
        slot.cs = None;
        slot.wal = None;
        slot.online = false;
        if let Some((_, key)) = self.timers.remove(&node) {
            self.event_queue.remove(&key);
        }
        info!(node, "Node crashed");
    }

    // ───────────────────────────── main loop ─────────────────────────────

    /// Process events until the queue is drained past `end_time`.
    pub fn run_until(&mut self, end_time: Duration) {
        while let Some((&key, _)) = self.event_queue.first_key_value() {
            if key.time > end_time {
                break;
            }
            let (key, event) = self.event_queue.pop_first().unwrap();
            self.now = self.now.max(key.time);
            let node = key.node;

            if !self.nodes[node as usize].online {
                trace!(node, "Dropping event for offline node");
                continue;
            }
            if let Event::Timeout(ti) = &event {
                // Only the live timer may fire; a superseded one was removed
                // from the queue already, but be defensive about re-entry.
                if let Some((current, _)) = self.timers.get(&node) {
                    if current == ti {
                        self.timers.remove(&node);
                    }
                }
            }

            self.stats.events_processed += 1;

            // WAL before state mutation, exactly like the production loop.
            let record = TimedWalMessage {
                time_ms: self.now.as_millis() as u64,
                msg: match &event {
                    Event::Message { msg, from } => WalMessage::Received {
                        msg: msg.clone(),
                        from: from.clone(),
                    },
                    Event::Timeout(ti) => WalMessage::Timeout(*ti),
                },
            };
            let slot = &mut self.nodes[node as usize];
            slot.wal.as_mut().expect("online node has wal").save(&record);

            let cs = slot.cs.as_mut().expect("online node has state");
            cs.set_time(self.now);
            let actions = cs.handle(event);
            self.stats.actions_generated += actions.len() as u64;

            for action in actions {
                self.process_action(node, action);
            }
        }
        self.now = self.now.max(end_time);
    }

    /// Run until all (online) nodes have committed at least `height`, or the
    /// time budget is exhausted. Returns whether the goal was reached.
    pub fn run_until_committed(&mut self, height: u64, budget: Duration) -> bool {
        let deadline = self.now + budget;
        while self.now < deadline {
            let step_end = (self.now + Duration::from_millis(100)).min(deadline);
            self.run_until(step_end);
            let done = (0..self.nodes.len() as NodeIndex)
                .filter(|&i| self.is_online(i))
                .all(|i| self.committed_height(i) >= height);
            if done {
                return true;
            }
        }
        false
    }

    fn process_action(&mut self, from: NodeIndex, action: Action) {
        match action {
            Action::Broadcast { message } => {
                // Gossip hints don't need delivery in simulation; every vote
                // and part is broadcast directly.
                if !message.is_state_input() {
                    return;
                }
                for to in 0..self.nodes.len() as NodeIndex {
                    if to == from {
                        continue;
                    }
                    match self.network.should_deliver(from, to, &mut self.rng) {
                        Some(latency) => {
                            let event = Event::Message {
                                msg: message.clone(),
                                from: MessageSource::Peer(PeerId(format!("node{}", from))),
                            };
                            self.schedule_event(to, self.now + latency, event);
                            self.stats.messages_sent += 1;
                        }
                        None => {
                            self.stats.messages_dropped += 1;
                            trace!(from, to, "Message dropped");
                        }
                    }
                }
            }

            Action::EnqueueInternal { message } => {
                let event = Event::Message {
                    msg: message,
                    from: MessageSource::Local,
                };
                self.schedule_event(from, self.now, event);
            }

            Action::ScheduleTimeout(ti) => {
                if let Some((current, _)) = self.timers.get(&from) {
                    if !ti.supersedes(current) {
                        trace!(node = from, new = %ti, "Ignoring timeout for older state");
                        return;
                    }
                }
                if let Some((_, old_key)) = self.timers.remove(&from) {
                    self.event_queue.remove(&old_key);
                }
                let key = self.schedule_event(from, self.now + ti.duration, Event::Timeout(ti));
                self.timers.insert(from, (ti, key));
                self.stats.timers_set += 1;
            }

            Action::PublishStep(info) => {
                let slot = &mut self.nodes[from as usize];
                if let Some(wal) = slot.wal.as_mut() {
                    wal.save(&TimedWalMessage {
                        time_ms: self.now.as_millis() as u64,
                        msg: WalMessage::Step(info),
                    });
                }
            }

            Action::PersistEvidence { evidence } => {
                self.nodes[from as usize].evidence.push(evidence);
            }
        }
    }

    fn schedule_event(&mut self, node: NodeIndex, time: Duration, event: Event) -> EventKey {
        self.sequence += 1;
        let key = EventKey::new(time, &event, node, self.sequence);
        self.event_queue.insert(key, event);
        key
    }

    /// Deliver a hand-crafted message to one node, as a Byzantine peer
    /// would. Used by adversarial tests.
    pub fn inject_message(
        &mut self,
        to: NodeIndex,
        from_label: &str,
        message: ConsensusMessage,
        delay: Duration,
    ) {
        let event = Event::Message {
            msg: message,
            from: MessageSource::Peer(PeerId(from_label.to_string())),
        };
        self.schedule_event(to, self.now + delay, event);
    }

    /// Keep the temp dir alive for the runner's lifetime.
    pub fn data_dir(&self) -> &std::path::Path {
        self.dir.path()
    }
}
