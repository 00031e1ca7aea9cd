//! # HTTP API
//!
//! The operator, prover, and fallback-sync surface of a validator. All
//! handlers share [`AppState`] through axum's `State` extractor.
//!
//! ## Endpoints
//!
//! | Method | Path               | Description                                |
//! |--------|--------------------|--------------------------------------------|
//! | GET    | `/health`          | Liveness; 503 once consensus has halted    |
//! | GET    | `/status`          | `NodeStatus` as JSON                       |
//! | POST   | `/sync-mode`       | Set `p2p`, `http`, or `auto`               |
//! | POST   | `/proofs`          | Submit a proved proof                      |
//! | POST   | `/sync`            | Catch-up requests from HTTP-mode peers     |
//! | GET    | `/blocks/:height`  | Committed block summary                    |
//! | GET    | `/accounts/:id`    | Account state                              |
//! | GET    | `/validators`      | Set voting at the next height              |

use axum::{
    extract::{Path, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use pop_protocol::consensus::ValidatorInfo;
use pop_protocol::mempool::MempoolError;
use pop_protocol::network::{SyncMode, SyncSetting};
use pop_protocol::proof::Proof;
use pop_protocol::sync::{SyncRequest, SyncResponse};
use pop_protocol::{NodeError, NodeHandle};

use crate::metrics::SharedMetrics;

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Cheap to clone: everything behind `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub version: String,
    pub node: Arc<NodeHandle>,
    pub metrics: SharedMetrics,
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub halted: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SyncModeRequest {
    pub setting: SyncSetting,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SyncModeResponse {
    pub setting: SyncSetting,
    pub mode: SyncMode,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitProofRequest {
    pub proof: Proof,
    #[serde(default)]
    pub priority: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitProofResponse {
    pub id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BlockResponse {
    pub height: u64,
    pub round: u32,
    pub commit_round: u32,
    pub hash: String,
    pub proposer: String,
    pub parent_root: String,
    pub state_root: String,
    pub proof_ids: Vec<String>,
    pub evidence: usize,
    pub signatures: usize,
    pub timestamp: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AccountResponse {
    pub id: String,
    pub balance: u64,
    pub proofs_applied: u64,
    pub commitment: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ErrorResponse { error: message.into() })).into_response()
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/sync-mode", post(sync_mode_handler))
        .route("/proofs", post(submit_proof_handler))
        .route("/sync", post(sync_handler))
        .route("/blocks/:height", get(block_handler))
        .route("/accounts/:id", get(account_handler))
        .route("/validators", get(validators_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let halted = state.node.status().halted;
    let code = if halted {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    let body = HealthResponse {
        status: if halted { "halted" } else { "ok" }.into(),
        version: state.version.clone(),
        halted,
    };
    (code, Json(body))
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.node.status())
}

async fn sync_mode_handler(
    State(state): State<AppState>,
    Json(req): Json<SyncModeRequest>,
) -> Response {
    match state.node.set_sync_mode(req.setting).await {
        Ok(mode) => {
            tracing::info!(setting = %req.setting, %mode, "sync mode set over http");
            Json(SyncModeResponse {
                setting: req.setting,
                mode,
            })
            .into_response()
        }
        Err(e) => error(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

async fn submit_proof_handler(
    State(state): State<AppState>,
    Json(req): Json<SubmitProofRequest>,
) -> Response {
    let id = req.proof.id.to_hex();
    match state.node.submit_proof(req.proof, req.priority).await {
        Ok(()) => {
            state.metrics.proofs_submitted_total.inc();
            (StatusCode::ACCEPTED, Json(SubmitProofResponse { id })).into_response()
        }
        Err(NodeError::Mempool(e)) => {
            let status = match e {
                MempoolError::Duplicate(_) | MempoolError::AlreadyCommitted(_) => StatusCode::CONFLICT,
                MempoolError::NotProved(_) | MempoolError::Invalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
                MempoolError::SubmitterLimit { .. } | MempoolError::Full { .. } => {
                    StatusCode::TOO_MANY_REQUESTS
                }
            };
            error(status, e.to_string())
        }
        // Admitted locally; gossip will retry through later relays.
        Err(NodeError::Network(e)) => {
            tracing::warn!(proof = %id, error = %e, "proof admitted but not gossiped");
            (StatusCode::ACCEPTED, Json(SubmitProofResponse { id })).into_response()
        }
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn sync_handler(State(state): State<AppState>, Json(req): Json<SyncRequest>) -> Response {
    let node = state.node.clone();
    // Snapshot serialization reads the whole store.
    match tokio::task::spawn_blocking(move || node.serve_sync(req)).await {
        Ok(response @ SyncResponse::Error(_)) => (StatusCode::BAD_REQUEST, Json(response)).into_response(),
        Ok(response) => Json(response).into_response(),
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn block_handler(Path(height): Path<u64>, State(state): State<AppState>) -> Response {
    match state.node.store().committed_block(height) {
        Ok(Some(committed)) => {
            let header = &committed.block.header;
            Json(BlockResponse {
                height: header.height,
                round: header.round,
                commit_round: committed.commit_round,
                hash: header.hash_hex(),
                proposer: header.proposer.clone(),
                parent_root: hex::encode(header.parent_root),
                state_root: hex::encode(header.state_root),
                proof_ids: committed.block.proofs.iter().map(|p| p.id.to_hex()).collect(),
                evidence: committed.block.evidence.len(),
                signatures: committed.commit.len(),
                timestamp: header.timestamp,
            })
            .into_response()
        }
        Ok(None) => error(StatusCode::NOT_FOUND, format!("no committed block at height {height}")),
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn account_handler(Path(id): Path<String>, State(state): State<AppState>) -> Response {
    match state.node.store().get_account(&id) {
        Some(account) => Json(AccountResponse {
            id,
            balance: account.balance,
            proofs_applied: account.proofs_applied,
            commitment: account.commitment.map(hex::encode),
        })
        .into_response(),
        None => error(StatusCode::NOT_FOUND, format!("unknown account {id}")),
    }
}

async fn validators_handler(State(state): State<AppState>) -> Response {
    let store = state.node.store();
    let next = store.committed_height() + 1;
    match store.stake_manager().set_for_height(next) {
        Some(set) => Json::<Vec<ValidatorInfo>>(set.validators().to_vec()).into_response(),
        None => error(StatusCode::NOT_FOUND, format!("no validator set for height {next}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};
    use tower::ServiceExt;

    use pop_protocol::crypto::Keypair;
    use pop_protocol::network::MemoryNetwork;
    use pop_protocol::proof::{BalanceDelta, ProofPayload, Verdict};
    use pop_protocol::storage::{ChainDb, Genesis, StateStore};
    use pop_protocol::{Node, NodeConfig, NodeStatus};

    use crate::metrics::NodeMetrics;

    /// A running single-validator node behind the router.
    fn test_state() -> AppState {
        let key = Keypair::from_seed(&[7; 32]);
        let genesis = Genesis {
            accounts: vec![("alice".into(), 1_000)],
            validators: vec![(key.public_key_hex(), 10_000)],
            ..Genesis::default()
        };
        let store = Arc::new(StateStore::open(ChainDb::open_temporary().unwrap(), &genesis).unwrap());
        let net = MemoryNetwork::new();
        let (transport, inbound) = net.register(key.public_key_hex());
        let mut config = NodeConfig::default();
        config.consensus.block_interval = Duration::from_millis(10);
        let node = Node::start(config, key, store, transport, inbound, vec![]).unwrap();

        AppState {
            version: "0.1.0-test".into(),
            node: Arc::new(node),
            metrics: Arc::new(NodeMetrics::new().unwrap()),
        }
    }

    async fn send(router: &Router, req: Request<Body>) -> (StatusCode, Vec<u8>) {
        let resp = router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes().to_vec();
        (status, body)
    }

    async fn get(router: &Router, path: &str) -> (StatusCode, Vec<u8>) {
        send(router, Request::builder().uri(path).body(Body::empty()).unwrap()).await
    }

    async fn post_json(router: &Router, path: &str, body: serde_json::Value) -> (StatusCode, Vec<u8>) {
        let req = Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap();
        send(router, req).await
    }

    fn proof() -> Proof {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as u64;
        Proof::new(
            &Keypair::from_seed(&[50; 32]),
            ProofPayload::Plaintext {
                entries: vec![
                    BalanceDelta {
                        account: "alice".into(),
                        delta: -10,
                    },
                    BalanceDelta {
                        account: "carol".into(),
                        delta: 10,
                    },
                ],
            },
            Verdict::Proved,
            now,
            vec![],
        )
    }

    #[tokio::test]
    async fn health_and_status_report_the_node() {
        let state = test_state();
        let node = state.node.clone();
        let router = create_router(state);
        assert!(node.wait_for_height(1, Duration::from_secs(10)).await);

        let (status, body) = get(&router, "/health").await;
        assert_eq!(status, StatusCode::OK);
        let health: HealthResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(health.status, "ok");

        let (status, body) = get(&router, "/status").await;
        assert_eq!(status, StatusCode::OK);
        let report: NodeStatus = serde_json::from_slice(&body).unwrap();
        assert!(report.height >= 1);
        assert_eq!(report.node_id, node.node_id());
        node.shutdown().await;
    }

    #[tokio::test]
    async fn sync_mode_can_be_forced() {
        let state = test_state();
        let node = state.node.clone();
        let router = create_router(state);

        let (status, body) = post_json(&router, "/sync-mode", serde_json::json!({ "setting": "http" })).await;
        assert_eq!(status, StatusCode::OK);
        let resp: SyncModeResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(resp.mode, SyncMode::Http);

        let (status, _) = post_json(&router, "/sync-mode", serde_json::json!({ "setting": "sideways" })).await;
        assert!(status.is_client_error());
        node.shutdown().await;
    }

    #[tokio::test]
    async fn proofs_are_accepted_once_and_committed() {
        let state = test_state();
        let node = state.node.clone();
        let router = create_router(state);
        let proof = proof();
        let body = serde_json::json!({ "proof": proof, "priority": 3 });

        let (status, resp) = post_json(&router, "/proofs", body.clone()).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let resp: SubmitProofResponse = serde_json::from_slice(&resp).unwrap();
        assert_eq!(resp.id, proof.id.to_hex());

        let (status, _) = post_json(&router, "/proofs", body).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !node.store().is_applied(&proof.id).unwrap() {
            assert!(tokio::time::Instant::now() < deadline, "proof not committed");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let (status, body) = get(&router, "/accounts/carol").await;
        assert_eq!(status, StatusCode::OK);
        let account: AccountResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(account.balance, 10);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn failed_proofs_are_unprocessable() {
        let state = test_state();
        let node = state.node.clone();
        let router = create_router(state);
        let failed = Proof::new(
            &Keypair::from_seed(&[51; 32]),
            ProofPayload::Commitment {
                account: "alice".into(),
                commitment: vec![1, 2, 3],
            },
            Verdict::Failed,
            1,
            vec![],
        );
        let (status, _) = post_json(&router, "/proofs", serde_json::json!({ "proof": failed })).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn sync_endpoint_serves_blocks_in_json() {
        let state = test_state();
        let node = state.node.clone();
        let router = create_router(state);
        assert!(node.wait_for_height(2, Duration::from_secs(10)).await);

        let request = serde_json::to_value(SyncRequest::Blocks { start: 1, end: 3 }).unwrap();
        let (status, body) = post_json(&router, "/sync", request).await;
        assert_eq!(status, StatusCode::OK);
        match serde_json::from_slice::<SyncResponse>(&body).unwrap() {
            SyncResponse::Blocks(blocks) => {
                assert_eq!(blocks.len(), 2);
                assert_eq!(blocks[0].height(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }

        let (status, body) = get(&router, "/blocks/1").await;
        assert_eq!(status, StatusCode::OK);
        let block: BlockResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(block.height, 1);
        assert_eq!(block.proposer, node.node_id());

        let (status, _) = get(&router, "/blocks/100000").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn validators_lists_the_genesis_set() {
        let state = test_state();
        let node = state.node.clone();
        let router = create_router(state);
        let (status, body) = get(&router, "/validators").await;
        assert_eq!(status, StatusCode::OK);
        let set: Vec<ValidatorInfo> = serde_json::from_slice(&body).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set[0].address, node.node_id());
        node.shutdown().await;
    }
}
