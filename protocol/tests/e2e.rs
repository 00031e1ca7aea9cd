//! End-to-end scenarios for a small validator network.
//!
//! Every test builds its own in-memory cluster: four validators with equal
//! stake on a `MemoryNetwork` hub, each with a temporary sled store. The hub
//! still encodes and decodes every frame, so these runs cover the wire
//! format, gossip, consensus, state application, and catch-up together.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use pop_protocol::consensus::stake::StakeConfig;
use pop_protocol::consensus::{RewardConfig, Vote, VoteStep};
use pop_protocol::crypto::Keypair;
use pop_protocol::network::{
    MemoryNetwork, Message, NetworkMonitor, P2pConfig, P2pNetwork, SyncMode, SyncSetting, Topic,
};
use pop_protocol::node::{Node, NodeConfig, NodeHandle};
use pop_protocol::proof::{BalanceDelta, Proof, ProofPayload, Verdict};
use pop_protocol::storage::{ChainDb, Genesis, StateStore};
use pop_protocol::sync::{LocalSyncClient, SyncClient, SyncConfig, SyncEngine};

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

const WAIT: Duration = Duration::from_secs(30);

fn keys(n: u8) -> Vec<Keypair> {
    (1..=n).map(|i| Keypair::from_seed(&[i; 32])).collect()
}

fn genesis(keys: &[Keypair], epoch_length: u64) -> Genesis {
    Genesis {
        accounts: vec![("alice".into(), 10_000), ("bob".into(), 0)],
        validators: keys.iter().map(|k| (k.public_key_hex(), 1_000)).collect(),
        stake: StakeConfig {
            epoch_length,
            min_stake: 100,
            ..StakeConfig::default()
        },
        rewards: RewardConfig { block_reward: 100 },
    }
}

/// Short timers so scenarios finish in seconds.
fn fast_config() -> NodeConfig {
    let mut config = NodeConfig::default();
    config.consensus.block_interval = Duration::from_millis(20);
    config.consensus.timeouts.base_ms = 300;
    config.consensus.timeouts.min_ms = 150;
    config.consensus.timeouts.max_ms = 2_000;
    config.heartbeat_interval = Duration::from_millis(50);
    config.behind_grace = Duration::from_millis(150);
    config.monitor.probe_interval = Duration::from_millis(100);
    config.monitor.probe_timeout = Duration::from_millis(100);
    config.sync_mode.no_peer_grace = Duration::from_millis(200);
    config.sync_mode.recovery_grace = Duration::from_millis(200);
    config.sync_mode.min_dwell = Duration::from_millis(100);
    config
}

fn open_store(genesis: &Genesis) -> Arc<StateStore> {
    Arc::new(StateStore::open(ChainDb::open_temporary().expect("temp db"), genesis).expect("store"))
}

fn start(
    net: &MemoryNetwork,
    key: &Keypair,
    store: Arc<StateStore>,
    http_sources: Vec<Arc<dyn SyncClient>>,
) -> NodeHandle {
    let (transport, inbound) = net.register(key.public_key_hex());
    Node::start(fast_config(), key.clone(), store, transport, inbound, http_sources).expect("node start")
}

async fn wait_all(nodes: &[&NodeHandle], height: u64) {
    for node in nodes {
        assert!(
            node.wait_for_height(height, WAIT).await,
            "node {} stuck at {}",
            &node.node_id()[..8],
            node.status().height
        );
    }
}

/// Every node holds the identical block at every height up to `height`.
fn assert_same_chain(nodes: &[&NodeHandle], height: u64) {
    for h in 1..=height {
        let reference = nodes[0]
            .store()
            .committed_block(h)
            .expect("read")
            .expect("block present")
            .hash();
        for node in &nodes[1..] {
            let block = node.store().committed_block(h).expect("read").expect("block present");
            assert_eq!(block.hash(), reference, "fork at height {h}");
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as u64
}

fn transfer(signer: &Keypair, amount: i64) -> Proof {
    Proof::new(
        signer,
        ProofPayload::Plaintext {
            entries: vec![
                BalanceDelta {
                    account: "alice".into(),
                    delta: -amount,
                },
                BalanceDelta {
                    account: "bob".into(),
                    delta: amount,
                },
            ],
        },
        Verdict::Proved,
        now_ms(),
        vec![],
    )
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn four_validators_commit_the_same_chain() {
    let keys = keys(4);
    let genesis = genesis(&keys, 100);
    let net = MemoryNetwork::new();
    let nodes: Vec<NodeHandle> = keys.iter().map(|k| start(&net, k, open_store(&genesis), vec![])).collect();
    let refs: Vec<&NodeHandle> = nodes.iter().collect();

    wait_all(&refs, 5).await;
    assert_same_chain(&refs, 5);

    // Every committed block carries a quorum certificate for its own hash.
    let set = nodes[0].store().stake_manager().set_for_height(3).expect("set");
    let block = nodes[0].store().committed_block(3).unwrap().unwrap();
    block.verify(&set).expect("commit certificate");

    for node in nodes {
        assert!(!node.status().halted);
        node.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn gossiped_proof_is_committed_everywhere_once() {
    let keys = keys(4);
    let genesis = genesis(&keys, 100);
    let net = MemoryNetwork::new();
    let nodes: Vec<NodeHandle> = keys.iter().map(|k| start(&net, k, open_store(&genesis), vec![])).collect();
    let refs: Vec<&NodeHandle> = nodes.iter().collect();
    wait_all(&refs, 1).await;

    let prover = Keypair::from_seed(&[42; 32]);
    let proof = transfer(&prover, 250);
    let id = proof.id;
    nodes[0].submit_proof(proof.clone(), 10).await.expect("submit");

    // Resubmitting the same proof is refused while it is pending.
    assert!(nodes[0].submit_proof(proof, 10).await.is_err());

    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if nodes.iter().all(|n| n.store().is_applied(&id).unwrap_or(false)) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "proof never committed");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let height = nodes.iter().map(|n| n.status().height).min().unwrap_or(0);
    assert_same_chain(&refs, height);
    for node in &nodes {
        assert_eq!(node.store().get_account("bob").map(|a| a.balance), Some(250));
        assert!(!node.mempool().contains(&id));
    }
    for node in nodes {
        node.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn equivocating_validator_is_slashed() {
    let keys = keys(4);
    let genesis = genesis(&keys, 2);
    let net = MemoryNetwork::new();
    // Three honest nodes. The fourth key double-votes through a bare P2P
    // endpoint and never runs consensus.
    let honest: Vec<NodeHandle> = keys[..3]
        .iter()
        .map(|k| start(&net, k, open_store(&genesis), vec![]))
        .collect();
    let refs: Vec<&NodeHandle> = honest.iter().collect();

    let byzantine = &keys[3];
    let (transport, inbound) = net.register(byzantine.public_key_hex());
    let monitor = Arc::new(NetworkMonitor::new(Default::default()));
    let p2p = P2pNetwork::new(byzantine.clone(), transport, monitor, P2pConfig::default());
    let (deliver_tx, mut deliver_rx) = tokio::sync::mpsc::channel(1024);
    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let runner = tokio::spawn(p2p.clone().run(inbound, deliver_tx, stop_rx));
    tokio::spawn(async move { while deliver_rx.recv().await.is_some() {} });

    wait_all(&refs, 1).await;
    let stake = honest[0].store().stake_manager();
    let deadline = tokio::time::Instant::now() + WAIT;
    while stake.record(&byzantine.public_key_hex()).map(|r| r.slash_count).unwrap_or(0) == 0 {
        assert!(tokio::time::Instant::now() < deadline, "equivocation never slashed");
        let height = honest[0].status().height + 1;
        for hash in [[0xAA; 32], [0xBB; 32]] {
            let vote = Vote::new(byzantine, height, 0, VoteStep::Precommit, Some(hash));
            let _ = p2p.broadcast(Topic::Consensus, Message::Precommit(vote)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // The slash is part of the chain: every honest node agrees on it.
    let target = honest.iter().map(|n| n.status().height).max().unwrap_or(0) + 2;
    wait_all(&refs, target).await;
    assert_same_chain(&refs, target);
    for node in &honest {
        let record = node
            .store()
            .stake_manager()
            .record(&byzantine.public_key_hex())
            .expect("record");
        assert!(record.slash_count >= 1);
        assert!(record.bonded < 1_000);
        assert!(record.jailed_until > 0);
    }

    // Once the epoch rotates the jailed validator has no voting power.
    let later = honest[0].store().committed_height() + 1;
    let set = stake.set_for_height(later).expect("set");
    assert!(set.get(&byzantine.public_key_hex()).is_none());

    let _ = stop_tx.send(true);
    let _ = runner.await;
    for node in honest {
        node.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn partitioned_minority_falls_back_to_http_and_converges() {
    let keys = keys(4);
    let genesis = genesis(&keys, 100);
    let net = MemoryNetwork::new();
    let stores: Vec<Arc<StateStore>> = (0..4).map(|_| open_store(&genesis)).collect();

    // The isolated node's HTTP fallback reads straight from a majority store.
    let fallback: Arc<dyn SyncClient> = Arc::new(LocalSyncClient::new(Arc::new(SyncEngine::new(
        stores[0].clone(),
        SyncConfig::default(),
    ))));
    let nodes: Vec<NodeHandle> = keys
        .iter()
        .zip(&stores)
        .enumerate()
        .map(|(i, (k, s))| {
            let sources = if i == 3 { vec![fallback.clone()] } else { vec![] };
            start(&net, k, s.clone(), sources)
        })
        .collect();
    let all: Vec<&NodeHandle> = nodes.iter().collect();
    let majority: Vec<&NodeHandle> = nodes[..3].iter().collect();
    let isolated = &nodes[3];
    wait_all(&all, 2).await;

    let ids: Vec<String> = keys.iter().map(|k| k.public_key_hex()).collect();
    let left: [&str; 3] = [&ids[0], &ids[1], &ids[2]];
    let right: [&str; 1] = [&ids[3]];
    net.partition(&[&left[..], &right[..]]);

    // Three of four validators hold more than two thirds and keep going.
    let split = majority.iter().map(|n| n.status().height).max().unwrap_or(0);
    wait_all(&majority, split + 5).await;

    // With no peers the isolated node switches to HTTP and catches up.
    let deadline = tokio::time::Instant::now() + WAIT;
    while isolated.status().mode != SyncMode::Http {
        assert!(tokio::time::Instant::now() < deadline, "never switched to http");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(isolated.wait_for_height(split + 5, WAIT).await);

    net.heal();
    let deadline = tokio::time::Instant::now() + WAIT;
    while isolated.status().mode != SyncMode::P2p {
        assert!(tokio::time::Instant::now() < deadline, "never returned to p2p");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let target = majority.iter().map(|n| n.status().height).max().unwrap_or(0) + 3;
    wait_all(&all, target).await;
    assert_same_chain(&all, target);
    assert_eq!(isolated.status().setting, SyncSetting::Auto);

    for node in nodes {
        node.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restarted_node_resumes_from_disk() {
    let keys = keys(1);
    let genesis = genesis(&keys, 100);
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("chain");

    let net = MemoryNetwork::new();
    let store = Arc::new(StateStore::open(ChainDb::open(&path).expect("db"), &genesis).expect("store"));
    let node = start(&net, &keys[0], store, vec![]);
    assert!(node.wait_for_height(3, WAIT).await);
    node.shutdown().await;

    // The store is released once the last task drops; retry the lock briefly.
    let mut reopened = None;
    for _ in 0..50 {
        if let Ok(db) = ChainDb::open(&path) {
            reopened = Some(db);
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let store = Arc::new(StateStore::open(reopened.expect("reopen db"), &genesis).expect("store"));
    let height = store.committed_height();
    let root = store.root_hash();
    assert!(height >= 3);

    // Re-applying a stored block changes nothing.
    let last = store.committed_block(height).unwrap().unwrap();
    store.apply(&last).expect("idempotent apply");
    assert_eq!(store.root_hash(), root);

    let net = MemoryNetwork::new();
    let node = start(&net, &keys[0], store, vec![]);
    assert!(node.wait_for_height(height + 2, WAIT).await);
    node.shutdown().await;
}
