//! # Protocol Configuration & Constants
//!
//! Every magic number in the protocol lives here. Component configuration
//! structs (`MempoolConfig`, `TimeoutConfig`, ...) take their defaults from
//! these constants, so this file is the one place to look when asking "why
//! did the node wait 30 seconds before giving up on P2P?".
//!
//! Values that affect consensus (epoch length, slash fraction, block reward)
//! must be identical on every validator. They travel in the genesis section
//! of the node config, and the constants below are only their defaults.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Protocol Version
// ---------------------------------------------------------------------------

/// Magic bytes prefixed to every frame on the wire, so peers can reject
/// foreign traffic without parsing further.
pub const PROTOCOL_MAGIC: u32 = 0x504F5021; // "POP!"

/// The crate-level protocol version, reported in node status.
pub const PROTOCOL_VERSION: &str = "0.1.0";

/// Wire protocol version for P2P envelopes. Separate from the crate version
/// because networking changes don't always mean consensus changes.
pub const WIRE_PROTOCOL_VERSION: u16 = 1;

/// Largest frame a peer may send us. Blocks carry full proofs, so this is
/// generous, but unbounded frames are an easy memory exhaustion vector.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Network Parameters
// ---------------------------------------------------------------------------

/// Default P2P listening port.
pub const DEFAULT_P2P_PORT: u16 = 9740;

/// Default operator API port.
pub const DEFAULT_RPC_PORT: u16 = 9741;

/// Default metrics (Prometheus) port.
pub const DEFAULT_METRICS_PORT: u16 = 9742;

/// Maximum number of connected peers.
pub const MAX_PEERS: usize = 50;

/// Gossip fanout: how many peers a relay forwards each message to.
pub const GOSSIP_FANOUT: usize = 6;

/// Hops a gossip message may travel before it is no longer forwarded.
pub const DEFAULT_GOSSIP_TTL: u8 = 6;

/// Upper bound on remembered gossip content hashes.
pub const SEEN_CACHE_SIZE: usize = 100_000;

/// Time allowed to establish a TCP connection (including the hello exchange).
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Time allowed for a single frame write before the peer is considered gone.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for request/response exchanges (sync, ping).
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// How often the TCP transport retries configured peers it is not connected to.
pub const REDIAL_INTERVAL: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Network Monitor
// ---------------------------------------------------------------------------

/// Samples retained per peer. Oldest samples fall off the back.
pub const LATENCY_WINDOW_SIZE: usize = 100;

/// How long computed per-peer statistics stay cached.
pub const PEER_STATS_CACHE_TTL: Duration = Duration::from_secs(1);

/// Interval between latency probes of the peer set.
pub const PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// A ping that takes longer than this counts as a failed sample.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Average latency above which the network is reported as degraded.
pub const HIGH_LATENCY_THRESHOLD: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Consensus Timing
// ---------------------------------------------------------------------------

/// Round timeout used when the monitor has no latency data.
pub const BASE_ROUND_TIMEOUT: Duration = Duration::from_secs(3);

/// Floor for the adaptive round timeout.
pub const MIN_ROUND_TIMEOUT: Duration = Duration::from_secs(1);

/// Ceiling for the adaptive round timeout, including round growth.
pub const MAX_ROUND_TIMEOUT: Duration = Duration::from_secs(30);

/// Multiplier applied to the average network latency.
pub const LATENCY_TIMEOUT_MULTIPLIER: u32 = 4;

/// Each extra round in the same height lengthens the timeout by this
/// percentage of the clamped base value.
pub const ROUND_TIMEOUT_INCREMENT_PCT: u32 = 50;

/// Pause between committing a height and proposing the next one.
pub const BLOCK_INTERVAL: Duration = Duration::from_secs(1);

/// Maximum proofs a proposer packs into one block.
pub const MAX_PROOFS_PER_BLOCK: usize = 500;

/// Maximum equivocation evidence entries in one block.
pub const MAX_EVIDENCE_PER_BLOCK: usize = 16;

/// Consensus messages for the next height are buffered up to this many.
pub const MAX_BUFFERED_MESSAGES: usize = 1_000;

// ---------------------------------------------------------------------------
// Sync Mode
// ---------------------------------------------------------------------------

/// In `auto` mode, zero peers for this long switches to HTTP fallback.
pub const NO_PEER_GRACE: Duration = Duration::from_secs(30);

/// In `auto` mode, at least one peer for this long switches back to P2P.
pub const PEER_RECOVERY_GRACE: Duration = Duration::from_secs(5);

/// Minimum time a mode must be held before an automatic switch.
pub const SYNC_MODE_MIN_DWELL: Duration = Duration::from_secs(60);

/// How often the node re-evaluates peers, sync mode, and catch-up need.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Mempool
// ---------------------------------------------------------------------------

/// Maximum proofs held in the mempool.
pub const MEMPOOL_MAX_PROOFS: usize = 10_000;

/// Maximum pending proofs from a single submitter.
pub const MEMPOOL_MAX_PER_SUBMITTER: usize = 1_000;

/// Proofs older than this are swept out of the mempool.
pub const PROOF_EXPIRY: Duration = Duration::from_secs(3_600);

/// How often the expiry sweep runs.
pub const MEMPOOL_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Staking & Rewards
// ---------------------------------------------------------------------------

/// Heights per epoch. The validator set is fixed for a whole epoch.
pub const EPOCH_LENGTH: u64 = 100;

/// Heights an unbonding entry waits before it is released.
pub const UNBONDING_PERIOD: u64 = 1_000;

/// Percentage of bonded and unbonding stake removed per equivocation.
pub const SLASH_FRACTION_PCT: u64 = 10;

/// Heights a slashed validator is excluded from validator sets.
pub const JAIL_PERIOD: u64 = 500;

/// No single validator's voting power exceeds this share of total stake.
pub const MAX_VOTING_POWER_PCT: u64 = 33;

/// Stake required to appear in a validator set.
pub const MIN_VALIDATOR_STAKE: u64 = 1_000;

/// Reward minted per committed block and split among precommitters.
pub const BLOCK_REWARD: u64 = 1_000;

// ---------------------------------------------------------------------------
// Sync
// ---------------------------------------------------------------------------

/// Blocks requested per batch during replay.
pub const SYNC_BATCH_SIZE: u64 = 100;

/// Height gap beyond which catch-up downloads a snapshot instead of
/// replaying blocks.
pub const SNAPSHOT_THRESHOLD: u64 = 1_000;

/// Snapshot chunk size in bytes.
pub const SNAPSHOT_CHUNK_SIZE: usize = 256 * 1024;

/// Attempts per sync request before catch-up gives up on a source.
pub const SYNC_MAX_RETRIES: u32 = 3;
