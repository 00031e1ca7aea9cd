//! # Validator Node
//!
//! Wires the components into running tasks:
//!
//! ```text
//!  transport ─► P2pNetwork::run ──deliver──► driver ◄── commands (NodeHandle)
//!                    ▲                         │
//!                    │ broadcast / respond     ├─ ConsensusEngine (owned)
//!                    └─────────────────────────┤  timers, next-height delay
//!                                              ├─ StateStore::apply on commit
//!                                              ├─ heartbeat: sync mode, probing,
//!                                              │  behind detection
//!                                              └─ catch-up task (SyncEngine)
//!  mempool sweep ─► ProofMempool::expire_old
//! ```
//!
//! The driver is the only owner of the engine, so consensus needs no locks.
//! Shared components (store, mempool, stake) lock internally, and the driver
//! never holds two of them at once. Every loop selects on the shutdown
//! watch.
//!
//! A restarted node reopens its store and resumes at the height after the
//! last committed one.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::config::{HEARTBEAT_INTERVAL, MAX_EVIDENCE_PER_BLOCK, MAX_PROOFS_PER_BLOCK, MEMPOOL_SWEEP_INTERVAL};
use crate::consensus::{
    ConsensusConfig, ConsensusContext, ConsensusEngine, ConsensusError, ConsensusOutput, StakeManager, Step, VoteStep,
};
use crate::crypto::Keypair;
use crate::error::{Classify, FaultClass};
use crate::mempool::{MempoolConfig, MempoolError, ProofMempool};
use crate::network::{
    Inbound, Message, MonitorConfig, NetworkError, NetworkMonitor, P2pConfig, P2pNetwork, PeerId, Pinger,
    SyncMode, SyncModeConfig, SyncModeController, SyncSetting, Topic, Transport,
};
use crate::proof::Proof;
use crate::storage::{ApplyOutcome, Block, CommittedBlock, StateError, StateStore};
use crate::sync::{PeerSyncClient, SyncClient, SyncConfig, SyncEngine, SyncError, SyncRequest, SyncResponse, SyncResult};

const DELIVER_QUEUE_SIZE: usize = 4096;
const COMMAND_QUEUE_SIZE: usize = 64;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub consensus: ConsensusConfig,
    pub mempool: MempoolConfig,
    pub monitor: MonitorConfig,
    pub p2p: P2pConfig,
    pub sync: SyncConfig,
    pub sync_mode: SyncModeConfig,
    pub sync_setting: SyncSetting,
    pub heartbeat_interval: Duration,
    pub mempool_sweep_interval: Duration,
    pub max_proofs_per_block: usize,
    /// How long a peer may stay exactly one height ahead before we sync.
    pub behind_grace: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            consensus: ConsensusConfig::default(),
            mempool: MempoolConfig::default(),
            monitor: MonitorConfig::default(),
            p2p: P2pConfig::default(),
            sync: SyncConfig::default(),
            sync_mode: SyncModeConfig::default(),
            sync_setting: SyncSetting::Auto,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            mempool_sweep_interval: MEMPOOL_SWEEP_INTERVAL,
            max_proofs_per_block: MAX_PROOFS_PER_BLOCK,
            behind_grace: HEARTBEAT_INTERVAL * 3,
        }
    }
}

// ---------------------------------------------------------------------------
// Status & errors
// ---------------------------------------------------------------------------

/// Operator-facing snapshot of the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_id: String,
    /// Last committed height.
    pub height: u64,
    /// Consensus round at the height being decided.
    pub round: u32,
    pub step: Step,
    pub mode: SyncMode,
    pub setting: SyncSetting,
    pub peer_count: usize,
    /// Mean round trip over probed peers.
    pub avg_latency_ms: u64,
    /// Hex state root after `height`.
    pub current_root: String,
    pub halted: bool,
    pub syncing: bool,
    pub mempool_size: usize,
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Mempool(#[from] MempoolError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("node has stopped")]
    Stopped,
}

impl Classify for NodeError {
    fn fault_class(&self) -> FaultClass {
        match self {
            NodeError::Mempool(e) => e.fault_class(),
            NodeError::Network(e) => e.fault_class(),
            NodeError::State(e) => e.fault_class(),
            NodeError::Stopped => FaultClass::Network,
        }
    }
}

enum Command {
    SetSyncMode {
        setting: SyncSetting,
        reply: oneshot::Sender<SyncMode>,
    },
}

// ---------------------------------------------------------------------------
// Consensus context
// ---------------------------------------------------------------------------

/// Backs block building and validation with the store and the mempool.
struct NodeContext {
    keypair: Keypair,
    store: Arc<StateStore>,
    mempool: Arc<ProofMempool>,
    stake: Arc<StakeManager>,
    max_proofs: usize,
}

impl ConsensusContext for NodeContext {
    fn build_block(&self, height: u64, round: u32) -> Result<Block, StateError> {
        let expected = self.store.committed_height() + 1;
        if height != expected {
            return Err(StateError::HeightGap { expected, got: height });
        }
        // A rebuild in a later round may reuse proofs from our failed one.
        self.mempool.release_all();
        let candidates = self.mempool.select_for_proposal(self.max_proofs);
        let evidence = self.stake.pending_evidence(MAX_EVIDENCE_PER_BLOCK);
        let block = self
            .store
            .propose(&self.keypair, round, candidates, evidence, now_ms())?;
        self.mempool.reserve(&block.proof_ids());
        Ok(block)
    }

    fn validate_block(&self, block: &Block) -> Result<(), StateError> {
        self.store.validate_block(block)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// Entry point. See [`Node::start`].
pub struct Node;

impl Node {
    /// Starts every task of a node over `transport` and returns its handle.
    /// Must be called from inside a tokio runtime.
    ///
    /// `http_sources` are the catch-up sources used in HTTP mode.
    pub fn start(
        config: NodeConfig,
        keypair: Keypair,
        store: Arc<StateStore>,
        transport: Arc<dyn Transport>,
        inbound: mpsc::Receiver<Inbound>,
        http_sources: Vec<Arc<dyn SyncClient>>,
    ) -> Result<NodeHandle, NodeError> {
        let node_id = keypair.public_key_hex();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let stake = store.stake_manager();
        let mempool = Arc::new(ProofMempool::new(config.mempool.clone()));
        let monitor = Arc::new(NetworkMonitor::new(config.monitor.clone()));
        let p2p = P2pNetwork::new(keypair.clone(), transport, monitor.clone(), config.p2p.clone());
        p2p.set_local_height(store.committed_height());
        let sync = Arc::new(SyncEngine::new(store.clone(), config.sync.clone()));

        let next_height = store.committed_height() + 1;
        let validators = stake
            .set_for_height(next_height)
            .ok_or(StateError::UnknownValidatorSet(next_height))?;
        let context = Arc::new(NodeContext {
            keypair: keypair.clone(),
            store: store.clone(),
            mempool: mempool.clone(),
            stake: stake.clone(),
            max_proofs: config.max_proofs_per_block,
        });
        let engine = ConsensusEngine::new(config.consensus.clone(), keypair, context, validators);

        let (deliver_tx, deliver_rx) = mpsc::channel(DELIVER_QUEUE_SIZE);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_SIZE);
        let (sync_done_tx, sync_done_rx) = mpsc::channel(1);
        let initial = NodeStatus {
            node_id: node_id.clone(),
            height: store.committed_height(),
            round: 0,
            step: Step::NewHeight,
            mode: SyncModeController::new(config.sync_mode.clone(), config.sync_setting, Instant::now()).mode(),
            setting: config.sync_setting,
            peer_count: 0,
            avg_latency_ms: 0,
            current_root: hex::encode(store.root_hash()),
            halted: false,
            syncing: false,
            mempool_size: 0,
        };
        let (status_tx, status_rx) = watch::channel(initial);

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(
            p2p.clone().run(inbound, deliver_tx, shutdown_rx.clone()),
        ));
        tasks.push(tokio::spawn(sweep_mempool(
            mempool.clone(),
            config.mempool_sweep_interval,
            shutdown_rx.clone(),
        )));

        let driver = Driver {
            sync_mode: SyncModeController::new(config.sync_mode.clone(), config.sync_setting, Instant::now()),
            config,
            engine,
            store: store.clone(),
            mempool: mempool.clone(),
            stake,
            p2p: p2p.clone(),
            monitor,
            sync: sync.clone(),
            http_sources,
            status_tx,
            timers: FuturesUnordered::new(),
            next_height_at: None,
            sync_task: None,
            sync_done_tx,
            behind_since: None,
            probed_peers: Vec::new(),
        };
        tasks.push(tokio::spawn(driver.run(deliver_rx, command_rx, sync_done_rx, shutdown_rx)));

        info!(node = %node_id, height = next_height, "node started");
        Ok(NodeHandle {
            node_id,
            store,
            mempool,
            p2p,
            sync,
            commands: command_tx,
            status: status_rx,
            shutdown: shutdown_tx,
            tasks: Mutex::new(tasks),
        })
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Control surface of a running node. Share it behind an `Arc`. Dropping it
/// without [`shutdown`](Self::shutdown) leaves the tasks running.
pub struct NodeHandle {
    node_id: String,
    store: Arc<StateStore>,
    mempool: Arc<ProofMempool>,
    p2p: Arc<P2pNetwork>,
    sync: Arc<SyncEngine>,
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<NodeStatus>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NodeHandle {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn status(&self) -> NodeStatus {
        self.status.borrow().clone()
    }

    /// A receiver that sees every status change.
    pub fn subscribe(&self) -> watch::Receiver<NodeStatus> {
        self.status.clone()
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn mempool(&self) -> &Arc<ProofMempool> {
        &self.mempool
    }

    pub fn p2p(&self) -> &Arc<P2pNetwork> {
        &self.p2p
    }

    /// Admits a proof locally and gossips it.
    pub async fn submit_proof(&self, proof: Proof, priority: u64) -> Result<(), NodeError> {
        self.mempool.submit(proof.clone(), priority)?;
        let sent = self.p2p.broadcast(Topic::Proofs, Message::Proof(proof)).await?;
        trace!(sent, "proof gossiped");
        Ok(())
    }

    pub async fn set_sync_mode(&self, setting: SyncSetting) -> Result<SyncMode, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::SetSyncMode { setting, reply })
            .await
            .map_err(|_| NodeError::Stopped)?;
        rx.await.map_err(|_| NodeError::Stopped)
    }

    /// Answers a catch-up request from local state (the HTTP fallback path).
    pub fn serve_sync(&self, request: SyncRequest) -> SyncResponse {
        self.sync.process_sync_request(request)
    }

    /// Waits until the committed height reaches `height`. Returns false on
    /// timeout or if the node stops first.
    pub async fn wait_for_height(&self, height: u64, timeout: Duration) -> bool {
        let mut rx = self.status.clone();
        let wait = async {
            loop {
                if rx.borrow_and_update().height >= height {
                    return true;
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.unwrap_or(false)
    }

    /// Signals every task to stop and waits for them. Later calls return
    /// immediately.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        self.p2p.monitor().stop_probing();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        if tasks.is_empty() {
            return;
        }
        for task in tasks {
            let _ = task.await;
        }
        info!(node = %self.node_id, "node stopped");
    }
}

async fn sweep_mempool(mempool: Arc<ProofMempool>, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(every);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                let expired = mempool.expire_old();
                if expired > 0 {
                    debug!(expired, remaining = mempool.len(), "mempool sweep");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

type Timer = std::pin::Pin<Box<dyn std::future::Future<Output = (u64, u32, Step)> + Send + Sync + 'static>>;

struct Driver {
    config: NodeConfig,
    engine: ConsensusEngine,
    store: Arc<StateStore>,
    mempool: Arc<ProofMempool>,
    stake: Arc<StakeManager>,
    p2p: Arc<P2pNetwork>,
    monitor: Arc<NetworkMonitor>,
    sync: Arc<SyncEngine>,
    http_sources: Vec<Arc<dyn SyncClient>>,
    sync_mode: SyncModeController,
    status_tx: watch::Sender<NodeStatus>,

    timers: FuturesUnordered<Timer>,
    /// When the next height starts after a commit.
    next_height_at: Option<Instant>,
    sync_task: Option<JoinHandle<()>>,
    sync_done_tx: mpsc::Sender<Result<SyncResult, SyncError>>,
    /// When a peer was first seen exactly one height ahead.
    behind_since: Option<Instant>,
    probed_peers: Vec<PeerId>,
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl Driver {
    async fn run(
        mut self,
        mut inbound: mpsc::Receiver<Inbound>,
        mut commands: mpsc::Receiver<Command>,
        mut sync_done: mpsc::Receiver<Result<SyncResult, SyncError>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        self.start_next_height().await;
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                Some(msg) = inbound.recv() => self.on_inbound(msg).await,
                Some(command) = commands.recv() => self.on_command(command),
                Some((height, round, step)) = self.timers.next(), if !self.timers.is_empty() => {
                    let outputs = self.engine.on_timeout(height, round, step);
                    self.execute(outputs).await;
                }
                _ = wait_until(self.next_height_at), if self.next_height_at.is_some() => {
                    self.next_height_at = None;
                    self.start_next_height().await;
                }
                Some(result) = sync_done.recv() => self.on_sync_done(result).await,
                _ = heartbeat.tick() => self.on_heartbeat().await,
            }
            self.publish_status();
        }

        if let Some(task) = self.sync_task.take() {
            task.abort();
        }
        self.monitor.stop_probing();
        debug!("consensus driver stopped");
    }

    // -- Consensus ----------------------------------------------------------

    async fn start_next_height(&mut self) {
        let height = self.store.committed_height() + 1;
        let Some(validators) = self.stake.set_for_height(height) else {
            self.engine.halt(format!("no validator set for height {height}"));
            return;
        };
        let outputs = self.engine.start_height(height, validators);
        self.execute(outputs).await;
    }

    async fn execute(&mut self, outputs: Vec<ConsensusOutput>) {
        for output in outputs {
            match output {
                ConsensusOutput::BroadcastProposal(proposal) => {
                    self.broadcast(Topic::Consensus, Message::Proposal(Box::new(proposal)))
                        .await
                }
                ConsensusOutput::BroadcastVote(vote) => {
                    let message = match vote.step {
                        VoteStep::Prevote => Message::Prevote(vote),
                        VoteStep::Precommit => Message::Precommit(vote),
                    };
                    self.broadcast(Topic::Consensus, message).await
                }
                ConsensusOutput::ScheduleTimeout {
                    height,
                    round,
                    step,
                    after,
                } => self.timers.push(Box::pin(async move {
                    tokio::time::sleep(after).await;
                    (height, round, step)
                })),
                ConsensusOutput::Commit(committed) => self.on_commit(committed),
                ConsensusOutput::Evidence(evidence) => {
                    match self.stake.submit_evidence(evidence.clone()) {
                        Ok(true) => self.broadcast(Topic::Evidence, Message::Evidence(evidence)).await,
                        Ok(false) => {}
                        Err(e) => warn!(error = %e, "own evidence rejected"),
                    }
                }
            }
        }
    }

    async fn broadcast(&self, topic: Topic, message: Message) {
        if let Err(e) = self.p2p.broadcast(topic, message).await {
            warn!(?topic, error = %e, "broadcast failed");
        }
    }

    fn on_commit(&mut self, committed: CommittedBlock) {
        let height = committed.height();
        match self.store.apply(&committed) {
            Ok(ApplyOutcome::Applied {
                root,
                rewards,
                slashed,
                ..
            }) => info!(
                height,
                round = committed.commit_round,
                proofs = committed.block.proofs.len(),
                root = %hex::encode(root),
                rewarded = rewards.payouts.len(),
                slashed = slashed.len(),
                "block committed"
            ),
            Ok(ApplyOutcome::AlreadyApplied) => debug!(height, "decided block already applied"),
            Err(e) if e.is_fatal() => {
                error!(height, error = %e, "commit failed, halting");
                self.engine.halt(e.to_string());
                return;
            }
            Err(e) => {
                warn!(height, error = %e, "decided block not applied");
                self.start_catch_up("decided block could not be applied");
                return;
            }
        }
        self.mempool.evict(&committed.block.proof_ids());
        self.mempool.release_all();
        self.stake.prune_pending();
        self.p2p.set_local_height(self.store.committed_height());
        self.next_height_at = Some(Instant::now() + self.engine.config().block_interval);
    }

    // -- Inbound ------------------------------------------------------------

    async fn on_inbound(&mut self, inbound: Inbound) {
        let Inbound { from, envelope } = inbound;
        let result = match envelope.payload {
            Message::Proof(proof) => {
                match self.mempool.submit(proof, 0) {
                    Ok(()) => {}
                    Err(MempoolError::Duplicate(_)) | Err(MempoolError::AlreadyCommitted(_)) => {}
                    Err(e) => debug!(peer = %from, error = %e, "gossiped proof rejected"),
                }
                return;
            }
            Message::Proposal(proposal) => self.engine.handle_proposal(*proposal),
            Message::Prevote(vote) if vote.step == VoteStep::Prevote => self.engine.handle_vote(vote),
            Message::Precommit(vote) if vote.step == VoteStep::Precommit => self.engine.handle_vote(vote),
            Message::Prevote(_) | Message::Precommit(_) => {
                warn!(peer = %from, "vote step does not match its message kind");
                return;
            }
            Message::Evidence(evidence) => {
                match self.stake.submit_evidence(evidence) {
                    Ok(true) => info!(peer = %from, "evidence accepted from gossip"),
                    Ok(false) => {}
                    Err(e) => warn!(peer = %from, error = %e, "invalid evidence"),
                }
                return;
            }
            Message::SyncRequest { request_id, request } => {
                let response = self.sync.process_sync_request(request);
                if let Err(e) = self.p2p.respond(&from, request_id, response).await {
                    debug!(peer = %from, error = %e, "sync response not sent");
                }
                return;
            }
            Message::Ping { .. } | Message::Pong { .. } | Message::SyncResponse { .. } => return,
        };

        match result {
            Ok(outputs) => self.execute(outputs).await,
            Err(e) => self.on_consensus_error(&from, e),
        }
    }

    fn on_consensus_error(&mut self, from: &str, error: ConsensusError) {
        match error.fault_class() {
            FaultClass::Network => {
                debug!(peer = %from, %error, "peer is ahead");
                if let ConsensusError::FutureHeight { .. } = error {
                    self.start_catch_up("consensus traffic from a later height");
                }
            }
            FaultClass::ProtocolViolation => warn!(peer = %from, %error, "consensus message rejected"),
            FaultClass::ResourceExhausted => warn!(peer = %from, %error, "consensus back-pressure"),
            FaultClass::Consistency => trace!(%error, "halted, message ignored"),
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::SetSyncMode { setting, reply } => {
                let mode = self.sync_mode.set_setting(setting, Instant::now());
                let _ = reply.send(mode);
            }
        }
    }

    // -- Heartbeat & catch-up -----------------------------------------------

    async fn on_heartbeat(&mut self) {
        let peers = self.p2p.peers();
        if peers != self.probed_peers {
            self.monitor.stop_probing();
            if !peers.is_empty() {
                let pinger: Arc<dyn Pinger> = self.p2p.clone();
                self.monitor.start_probing(pinger, peers.clone());
            }
            self.probed_peers = peers.clone();
        }
        self.engine
            .set_avg_latency(self.monitor.get_average_network_latency());

        let now = Instant::now();
        if let Some(mode) = self.sync_mode.observe(peers.len(), now) {
            info!(%mode, peers = peers.len(), "sync mode changed");
        }

        let local = self.store.committed_height();
        match self.p2p.best_peer() {
            Some((_, best)) if best >= local + 2 => self.start_catch_up("peer is more than one height ahead"),
            Some((_, best)) if best > local => {
                let since = *self.behind_since.get_or_insert(now);
                if now.saturating_duration_since(since) >= self.config.behind_grace {
                    self.start_catch_up("peer stayed ahead");
                }
            }
            _ => self.behind_since = None,
        }

        if self.sync_mode.mode() == SyncMode::Http && !self.http_sources.is_empty() {
            self.start_catch_up("http polling");
        }
    }

    /// Spawns a catch-up task unless one is running. Sources: the best peer
    /// first, then the HTTP endpoints when in HTTP mode.
    fn start_catch_up(&mut self, reason: &str) {
        if self.engine.is_halted() || self.sync_task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let mut sources: Vec<Arc<dyn SyncClient>> = Vec::new();
        if let Some((peer, _)) = self.p2p.best_peer() {
            sources.push(Arc::new(PeerSyncClient::new(self.p2p.clone(), peer)));
        }
        if self.sync_mode.mode() == SyncMode::Http {
            sources.extend(self.http_sources.iter().cloned());
        }
        if sources.is_empty() {
            return;
        }
        debug!(reason, sources = sources.len(), "starting catch-up");
        self.behind_since = None;

        let sync = self.sync.clone();
        let done = self.sync_done_tx.clone();
        self.sync_task = Some(tokio::spawn(async move {
            let mut outcome = None;
            for source in sources {
                match sync.catch_up(source.as_ref()).await {
                    Ok(result) => {
                        outcome = Some(Ok(result));
                        break;
                    }
                    Err(e) if e.is_fatal() => {
                        outcome = Some(Err(e));
                        break;
                    }
                    Err(e) => {
                        warn!(source = %source.source(), error = %e, "catch-up source failed");
                        outcome = Some(Err(e));
                    }
                }
            }
            if let Some(outcome) = outcome {
                let _ = done.send(outcome).await;
            }
        }));
    }

    async fn on_sync_done(&mut self, result: Result<SyncResult, SyncError>) {
        self.sync_task = None;
        let result = match result {
            Ok(result) => result,
            Err(e) if e.is_fatal() => {
                error!(error = %e, "catch-up hit a consistency fault, halting");
                self.engine.halt(e.to_string());
                return;
            }
            Err(e) => {
                debug!(error = %e, "catch-up failed");
                return;
            }
        };
        if result.blocks_applied == 0 && result.snapshot_height.is_none() {
            return;
        }
        self.prune_applied_proofs();
        self.stake.prune_pending();
        self.p2p.set_local_height(result.final_height);

        let next = result.final_height + 1;
        let Some(validators) = self.stake.set_for_height(next) else {
            self.engine.halt(format!("no validator set for height {next}"));
            return;
        };
        self.next_height_at = None;
        let outputs = self.engine.reset_to(result.final_height, result.final_root, validators);
        self.execute(outputs).await;
    }

    /// Drops mempool proofs that synced blocks already committed.
    fn prune_applied_proofs(&self) {
        let pending = self.mempool.select_for_proposal(self.mempool.len());
        let applied: Vec<_> = pending
            .iter()
            .map(|p| p.id)
            .filter(|id| self.store.is_applied(id).unwrap_or(false))
            .collect();
        if !applied.is_empty() {
            debug!(count = applied.len(), "evicting proofs committed during catch-up");
            self.mempool.evict(&applied);
        }
    }

    fn publish_status(&self) {
        let engine = self.engine.status();
        let status = NodeStatus {
            node_id: self.p2p.local_id().to_string(),
            height: self.store.committed_height(),
            round: engine.round,
            step: engine.step,
            mode: self.sync_mode.mode(),
            setting: self.sync_mode.setting(),
            peer_count: self.p2p.peer_count(),
            avg_latency_ms: self.monitor.get_average_network_latency().as_millis() as u64,
            current_root: hex::encode(self.store.root_hash()),
            halted: engine.halted,
            syncing: self.sync_task.is_some(),
            mempool_size: self.mempool.len(),
        };
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::stake::StakeConfig;
    use crate::consensus::RewardConfig;
    use crate::network::MemoryNetwork;
    use crate::storage::{ChainDb, Genesis};

    fn genesis(keys: &[Keypair]) -> Genesis {
        Genesis {
            accounts: vec![],
            validators: keys.iter().map(|k| (k.public_key_hex(), 1_000)).collect(),
            stake: StakeConfig {
                min_stake: 100,
                ..StakeConfig::default()
            },
            rewards: RewardConfig { block_reward: 100 },
        }
    }

    fn fast_config() -> NodeConfig {
        let mut config = NodeConfig::default();
        config.consensus.block_interval = Duration::from_millis(10);
        config.consensus.timeouts.base_ms = 200;
        config.consensus.timeouts.min_ms = 100;
        config.consensus.timeouts.max_ms = 1_000;
        config.heartbeat_interval = Duration::from_millis(50);
        config
    }

    #[tokio::test]
    async fn single_validator_commits_alone() {
        let key = Keypair::from_seed(&[1; 32]);
        let store = Arc::new(StateStore::open(ChainDb::open_temporary().unwrap(), &genesis(&[key.clone()])).unwrap());
        let net = MemoryNetwork::new();
        let (transport, inbound) = net.register(key.public_key_hex());

        let node = Node::start(fast_config(), key, store, transport, inbound, vec![]).unwrap();
        assert!(node.wait_for_height(3, Duration::from_secs(10)).await);
        let status = node.status();
        assert!(!status.halted);
        assert_eq!(status.peer_count, 0);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn sync_mode_command_round_trips() {
        let key = Keypair::from_seed(&[2; 32]);
        let store = Arc::new(StateStore::open(ChainDb::open_temporary().unwrap(), &genesis(&[key.clone()])).unwrap());
        let net = MemoryNetwork::new();
        let (transport, inbound) = net.register(key.public_key_hex());

        let node = Node::start(fast_config(), key, store, transport, inbound, vec![]).unwrap();
        assert_eq!(node.set_sync_mode(SyncSetting::Http).await.unwrap(), SyncMode::Http);
        assert_eq!(node.set_sync_mode(SyncSetting::P2p).await.unwrap(), SyncMode::P2p);
        node.shutdown().await;
    }

    #[test]
    fn status_serializes_for_operators() {
        let status = NodeStatus {
            node_id: "ab".into(),
            height: 7,
            round: 1,
            step: Step::Prevote,
            mode: SyncMode::P2p,
            setting: SyncSetting::Auto,
            peer_count: 3,
            avg_latency_ms: 12,
            current_root: "00".into(),
            halted: false,
            syncing: false,
            mempool_size: 0,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["mode"], "p2p");
        assert_eq!(json["setting"], "auto");
        assert_eq!(json["height"], 7);
    }
}
