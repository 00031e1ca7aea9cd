//! # Catch-Up Synchronization
//!
//! A node that falls behind (restart, partition, slow disk) pulls committed
//! blocks from a peer and replays them through [`StateStore::apply`]. Every
//! block carries its precommit certificate, so the serving peer is trusted
//! for availability only: a forged block fails certificate verification
//! before it touches state.
//!
//! ## Protocol
//!
//! ```text
//! Behind node                          Source (peer or HTTP endpoint)
//! ───────────                          ──────────────────────────────
//!   │  Status                              │
//!   │────────────────────────────────────> │
//!   │  Status { height, root, base }       │
//!   │<──────────────────────────────────── │
//!   │                                      │
//!   │  gap > snapshot_threshold?           │
//!   │    SnapshotManifest ───────────────> │
//!   │    SnapshotChunk { i } ────────────> │  (repeat)
//!   │                                      │
//!   │  Blocks { start, end } ────────────> │  (repeat in batches)
//!   │  Blocks(Vec<CommittedBlock>)         │
//!   │<──────────────────────────────────── │
//! ```
//!
//! The same request/response pair travels over P2P (`Message::SyncRequest`)
//! and over the HTTP fallback (`POST /sync`, JSON). [`SyncClient`] hides
//! which one is in use.
//!
//! ## Design Decisions
//!
//! - **Batch downloads.** The gap is split into `batch_size` ranges.
//! - **Validate-then-apply.** Blocks go through the same `apply` path as
//!   consensus commits, so certificate checks, root checks, and the
//!   idempotency rule all hold for synced blocks too.
//! - **Snapshot when far behind.** Past `snapshot_threshold` heights, or when
//!   the source no longer holds the blocks we need, a verified snapshot is
//!   installed first and only the tail is replayed. The snapshot's tip must
//!   be signed by more than a third of the local validator set's power, so
//!   a source can't swap in a chain of its own making.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{SNAPSHOT_CHUNK_SIZE, SNAPSHOT_THRESHOLD, SYNC_BATCH_SIZE, SYNC_MAX_RETRIES};
use crate::error::{Classify, FaultClass};
use crate::network::{NetworkError, P2pNetwork, PeerId};
use crate::storage::snapshot::SnapshotError;
use crate::storage::{ApplyOutcome, CommittedBlock, Snapshot, SnapshotManifest, StateError, StateStore};

// ---------------------------------------------------------------------------
// Sync Request / Response
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncRequest {
    /// The source's committed height, root, and lowest stored block.
    Status,
    /// Committed blocks in `[start, end)`.
    Blocks { start: u64, end: u64 },
    /// Manifest of a snapshot at the source's current height.
    SnapshotManifest,
    /// One chunk of the snapshot described by the last manifest at `height`.
    SnapshotChunk { height: u64, index: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncResponse {
    Status {
        height: u64,
        root: [u8; 32],
        base_height: u64,
    },
    Blocks(Vec<CommittedBlock>),
    SnapshotManifest(SnapshotManifest),
    SnapshotChunk {
        height: u64,
        index: u32,
        data: Vec<u8>,
    },
    /// The source could not answer. Human-readable, for logs.
    Error(String),
}

// ---------------------------------------------------------------------------
// Config & results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Blocks requested per `Blocks` call.
    pub batch_size: u64,
    /// Gap beyond which a snapshot is installed before replay.
    pub snapshot_threshold: u64,
    pub snapshot_chunk_size: usize,
    /// Attempts per request before catch-up gives up on the source.
    pub max_retries: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: SYNC_BATCH_SIZE,
            snapshot_threshold: SNAPSHOT_THRESHOLD,
            snapshot_chunk_size: SNAPSHOT_CHUNK_SIZE,
            max_retries: SYNC_MAX_RETRIES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncResult {
    pub blocks_applied: u64,
    pub snapshot_height: Option<u64>,
    pub final_height: u64,
    pub final_root: [u8; 32],
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error("source reported an error: {0}")]
    Remote(String),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("chain gap: expected height {expected}, got {got}")]
    ChainGap { expected: u64, got: u64 },

    #[error("http fallback failed: {0}")]
    Http(String),
}

impl Classify for SyncError {
    fn fault_class(&self) -> FaultClass {
        match self {
            SyncError::Network(e) => e.fault_class(),
            SyncError::State(e) => e.fault_class(),
            SyncError::Snapshot(e) => e.fault_class(),
            SyncError::Http(_) => FaultClass::Network,
            SyncError::Remote(_) | SyncError::UnexpectedResponse(_) | SyncError::ChainGap { .. } => {
                FaultClass::ProtocolViolation
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Sync sources
// ---------------------------------------------------------------------------

/// Where catch-up pulls from.
#[async_trait]
pub trait SyncClient: Send + Sync {
    /// For logs.
    fn source(&self) -> String;

    async fn fetch(&self, request: SyncRequest) -> Result<SyncResponse, SyncError>;
}

/// Pulls from one peer over the P2P request/response channel.
pub struct PeerSyncClient {
    net: Arc<P2pNetwork>,
    peer: PeerId,
}

impl PeerSyncClient {
    pub fn new(net: Arc<P2pNetwork>, peer: PeerId) -> Self {
        Self { net, peer }
    }
}

#[async_trait]
impl SyncClient for PeerSyncClient {
    fn source(&self) -> String {
        format!("peer:{}", self.peer)
    }

    async fn fetch(&self, request: SyncRequest) -> Result<SyncResponse, SyncError> {
        Ok(self.net.request(&self.peer, request).await?)
    }
}

// ---------------------------------------------------------------------------
// SyncEngine
// ---------------------------------------------------------------------------

struct ServedSnapshot {
    manifest: SnapshotManifest,
    chunks: Arc<Vec<Vec<u8>>>,
}

/// Serves sync requests from the local store and drives catch-up against
/// a [`SyncClient`].
pub struct SyncEngine {
    store: Arc<StateStore>,
    config: SyncConfig,
    /// The snapshot most recently offered, so chunk requests that follow a
    /// manifest see the same bytes.
    served: Mutex<Option<ServedSnapshot>>,
}

impl SyncEngine {
    pub fn new(store: Arc<StateStore>, config: SyncConfig) -> Self {
        Self {
            store,
            config,
            served: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    // -- Serving ------------------------------------------------------------

    /// Answers a request from local state. Pure reads, apart from caching
    /// the snapshot being served.
    pub fn process_sync_request(&self, request: SyncRequest) -> SyncResponse {
        match request {
            SyncRequest::Status => SyncResponse::Status {
                height: self.store.committed_height(),
                root: self.store.root_hash(),
                base_height: self.store.base_height(),
            },

            SyncRequest::Blocks { start, end } => {
                if start >= end {
                    return SyncResponse::Blocks(Vec::new());
                }
                let end = end.min(start.saturating_add(self.config.batch_size));
                match self.store.history(start..=end - 1) {
                    Ok(blocks) => SyncResponse::Blocks(blocks),
                    Err(e) => SyncResponse::Error(format!("blocks [{start}, {end}): {e}")),
                }
            }

            SyncRequest::SnapshotManifest => match self.prepare_snapshot() {
                Ok(manifest) => SyncResponse::SnapshotManifest(manifest),
                Err(e) => SyncResponse::Error(format!("snapshot: {e}")),
            },

            SyncRequest::SnapshotChunk { height, index } => {
                let served = self.served.lock();
                match served.as_ref() {
                    Some(s) if s.manifest.height == height => match s.chunks.get(index as usize) {
                        Some(data) => SyncResponse::SnapshotChunk {
                            height,
                            index,
                            data: data.clone(),
                        },
                        None => SyncResponse::Error(format!("no chunk {index}")),
                    },
                    _ => SyncResponse::Error(format!("no snapshot at height {height}")),
                }
            }
        }
    }

    fn prepare_snapshot(&self) -> Result<SnapshotManifest, SyncError> {
        let height = self.store.committed_height();
        if let Some(s) = self.served.lock().as_ref() {
            if s.manifest.height == height {
                return Ok(s.manifest.clone());
            }
        }
        let snapshot = self.store.snapshot()?;
        let (manifest, chunks) = snapshot.to_chunks(self.config.snapshot_chunk_size)?;
        debug!(height, chunks = manifest.chunk_count, "snapshot prepared for serving");
        *self.served.lock() = Some(ServedSnapshot {
            manifest: manifest.clone(),
            chunks: Arc::new(chunks),
        });
        Ok(manifest)
    }

    // -- Catch-up -----------------------------------------------------------

    /// Splits `(local, remote]` into `[start, end)` batches.
    pub fn compute_sync_plan(&self, local_height: u64, remote_height: u64) -> Vec<(u64, u64)> {
        if local_height >= remote_height {
            return Vec::new();
        }
        let end = remote_height + 1;
        let batch = self.config.batch_size.max(1);
        let mut plan = Vec::new();
        let mut cursor = local_height + 1;
        while cursor < end {
            let batch_end = std::cmp::min(cursor + batch, end);
            plan.push((cursor, batch_end));
            cursor = batch_end;
        }
        plan
    }

    /// Brings the local store up to the source's committed height.
    pub async fn catch_up(&self, client: &dyn SyncClient) -> Result<SyncResult, SyncError> {
        let (remote_height, remote_base) = match self.fetch(client, SyncRequest::Status).await? {
            SyncResponse::Status {
                height, base_height, ..
            } => (height, base_height),
            other => return Err(unexpected("Status", &other)),
        };

        let local = self.store.committed_height();
        let mut result = SyncResult {
            blocks_applied: 0,
            snapshot_height: None,
            final_height: local,
            final_root: self.store.root_hash(),
        };
        if remote_height <= local {
            return Ok(result);
        }
        info!(source = %client.source(), local, remote = remote_height, "catching up");

        let gap = remote_height - local;
        if gap > self.config.snapshot_threshold || local < remote_base {
            let snapshot = self.fetch_snapshot(client).await?;
            let height = snapshot.height;
            if height > local {
                self.store.restore(&snapshot)?;
                result.snapshot_height = Some(height);
            }
        }

        let from = self.store.committed_height();
        for (start, end) in self.compute_sync_plan(from, remote_height) {
            let blocks = match self.fetch(client, SyncRequest::Blocks { start, end }).await? {
                SyncResponse::Blocks(blocks) => blocks,
                other => return Err(unexpected("Blocks", &other)),
            };
            if blocks.is_empty() {
                return Err(SyncError::ChainGap {
                    expected: start,
                    got: start,
                });
            }
            result.blocks_applied += self.apply_blocks(blocks)?;
        }

        result.final_height = self.store.committed_height();
        result.final_root = self.store.root_hash();
        info!(
            height = result.final_height,
            applied = result.blocks_applied,
            snapshot = ?result.snapshot_height,
            "catch-up complete"
        );
        Ok(result)
    }

    /// Applies consecutive committed blocks. Already-applied heights with the
    /// same hash are skipped. Returns how many were newly applied.
    pub fn apply_blocks(&self, blocks: Vec<CommittedBlock>) -> Result<u64, SyncError> {
        let mut applied = 0;
        let mut expected = self.store.committed_height() + 1;
        for block in blocks {
            let height = block.height();
            if height > expected {
                return Err(SyncError::ChainGap {
                    expected,
                    got: height,
                });
            }
            if let ApplyOutcome::Applied { .. } = self.store.apply(&block)? {
                applied += 1;
                expected = height + 1;
            }
        }
        Ok(applied)
    }

    async fn fetch_snapshot(&self, client: &dyn SyncClient) -> Result<Snapshot, SyncError> {
        let manifest = match self.fetch(client, SyncRequest::SnapshotManifest).await? {
            SyncResponse::SnapshotManifest(m) => m,
            other => return Err(unexpected("SnapshotManifest", &other)),
        };
        let mut chunks = Vec::with_capacity(manifest.chunk_count as usize);
        for index in 0..manifest.chunk_count {
            let request = SyncRequest::SnapshotChunk {
                height: manifest.height,
                index,
            };
            match self.fetch(client, request).await? {
                SyncResponse::SnapshotChunk {
                    height,
                    index: got,
                    data,
                } if height == manifest.height && got == index => chunks.push(data),
                other => return Err(unexpected("SnapshotChunk", &other)),
            }
        }
        let snapshot = Snapshot::from_chunks(&manifest, &chunks)?;
        info!(height = snapshot.height, chunks = chunks.len(), "snapshot downloaded");
        Ok(snapshot)
    }

    /// One request with retries on network faults. Remote errors are final.
    async fn fetch(&self, client: &dyn SyncClient, request: SyncRequest) -> Result<SyncResponse, SyncError> {
        let attempts = self.config.max_retries.max(1);
        let mut last = None;
        for attempt in 1..=attempts {
            match client.fetch(request.clone()).await {
                Ok(SyncResponse::Error(reason)) => return Err(SyncError::Remote(reason)),
                Ok(response) => return Ok(response),
                Err(e) if e.fault_class() == FaultClass::Network => {
                    warn!(source = %client.source(), attempt, error = %e, "sync request failed");
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last.unwrap_or_else(|| SyncError::Http("no attempts made".into())))
    }
}

fn unexpected(wanted: &str, got: &SyncResponse) -> SyncError {
    let kind = match got {
        SyncResponse::Status { .. } => "Status",
        SyncResponse::Blocks(_) => "Blocks",
        SyncResponse::SnapshotManifest(_) => "SnapshotManifest",
        SyncResponse::SnapshotChunk { .. } => "SnapshotChunk",
        SyncResponse::Error(_) => "Error",
    };
    SyncError::UnexpectedResponse(format!("wanted {wanted}, got {kind}"))
}

/// Serves from a local engine directly. Handy for tests and for a node
/// pulling from another store in the same process.
pub struct LocalSyncClient {
    engine: Arc<SyncEngine>,
}

impl LocalSyncClient {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl SyncClient for LocalSyncClient {
    fn source(&self) -> String {
        "local".into()
    }

    async fn fetch(&self, request: SyncRequest) -> Result<SyncResponse, SyncError> {
        Ok(self.engine.process_sync_request(request))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
