// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Proof-of-Proof Validator Node
//!
//! Entry point for the `pop-node` binary. Parses CLI arguments, loads the
//! node config and validator key, opens the chain database, starts the
//! node over TCP, and serves the HTTP API and Prometheus metrics.
//!
//! - `run`       — start the validator
//! - `init`      — create a data directory, key, and devnet config
//! - `status`    — query a running node
//! - `sync-mode` — switch a running node between p2p, http, and auto
//! - `version`   — print build version information

mod api;
mod cli;
mod config;
mod http_sync;
mod logging;
mod metrics;

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::watch;

use pop_protocol::crypto::Keypair;
use pop_protocol::network::{TcpConfig, TcpTransport};
use pop_protocol::storage::{ChainDb, StateStore};
use pop_protocol::sync::SyncClient;
use pop_protocol::Node;

use cli::{Commands, PopNodeCli};
use config::NodeFile;
use http_sync::HttpSyncClient;
use logging::LogFormat;
use metrics::NodeMetrics;

const KEY_FILE: &str = "validator.key";
const CONFIG_FILE: &str = "node.toml";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = PopNodeCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Init(args) => init_node(args),
        Commands::Status(args) => query_status(args).await,
        Commands::SyncMode(args) => set_sync_mode(args).await,
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Starts the validator, the API server, and the metrics endpoint, then
/// waits for a shutdown signal.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(logging::DEFAULT_FILTER, args.log_format);

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| args.data_dir.join(CONFIG_FILE));
    let file = NodeFile::load(&config_path)?;
    let keypair = load_keypair(&args.data_dir, args.validator_key.as_deref())?;
    let node_id = keypair.public_key_hex();

    tracing::info!(
        node = %node_id,
        config = %config_path.display(),
        data_dir = %args.data_dir.display(),
        p2p = %file.network.p2p_listen,
        api = %file.network.api_listen,
        "starting pop-node"
    );
    if !file.genesis.validators.iter().any(|(v, _)| *v == node_id) {
        tracing::warn!(node = %node_id, "key is not a genesis validator; following only");
    }

    // --- Persistent storage ---
    let db_path = args.data_dir.join("chain");
    std::fs::create_dir_all(&db_path)
        .with_context(|| format!("failed to create database directory {}", db_path.display()))?;
    let db = ChainDb::open(&db_path).with_context(|| format!("failed to open database at {}", db_path.display()))?;
    let store = Arc::new(StateStore::open(db, &file.genesis).context("failed to open state store")?);
    tracing::info!(
        height = store.committed_height(),
        root = %hex::encode(store.root_hash()),
        "state loaded"
    );

    // --- Transport ---
    let (transport_stop, transport_stop_rx) = watch::channel(false);
    let tcp_config = TcpConfig::new(file.network.p2p_listen, file.network.peers.clone());
    let (transport, inbound) = TcpTransport::start(node_id.clone(), tcp_config, transport_stop_rx)
        .await
        .context("failed to start p2p transport")?;

    // --- HTTP fallback sources ---
    let mut http_sources: Vec<Arc<dyn SyncClient>> = Vec::new();
    for url in &file.network.http_fallback {
        let client = HttpSyncClient::new(url).with_context(|| format!("bad http fallback {url}"))?;
        http_sources.push(Arc::new(client));
    }

    // --- Node ---
    let mut node_config = file.node_config();
    if let Some(setting) = args.sync_mode {
        node_config.sync_setting = setting.into();
    }
    let node = Arc::new(
        Node::start(node_config, keypair, store, transport, inbound, http_sources)
            .context("failed to start node")?,
    );

    // --- Metrics ---
    let node_metrics = Arc::new(NodeMetrics::new().context("failed to create metrics")?);
    let tracker = tokio::spawn(metrics::track_status(node_metrics.clone(), node.subscribe()));

    // --- API server ---
    let app_state = api::AppState {
        version: format!(
            "{} (protocol {})",
            env!("CARGO_PKG_VERSION"),
            pop_protocol::config::PROTOCOL_VERSION,
        ),
        node: node.clone(),
        metrics: node_metrics.clone(),
    };
    let api_router = api::create_router(app_state);
    let api_listener = tokio::net::TcpListener::bind(file.network.api_listen)
        .await
        .with_context(|| format!("failed to bind API listener on {}", file.network.api_listen))?;
    tracing::info!(addr = %file.network.api_listen, "API server listening");

    // --- Metrics server ---
    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(node_metrics);
    let metrics_listener = tokio::net::TcpListener::bind(file.network.metrics_listen)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", file.network.metrics_listen))?;
    tracing::info!(addr = %file.network.metrics_listen, "metrics server listening");

    // --- Serve ---
    tokio::select! {
        res = axum::serve(api_listener, api_router) => {
            if let Err(e) = res {
                tracing::error!(error = %e, "API server error");
            }
        }
        res = axum::serve(metrics_listener, metrics_router) => {
            if let Err(e) = res {
                tracing::error!(error = %e, "metrics server error");
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
    }

    node.shutdown().await;
    let _ = transport_stop.send(true);
    tracker.abort();
    tracing::info!("pop-node stopped");
    Ok(())
}

/// Reads the validator key from `--validator-key` or the data directory.
fn load_keypair(data_dir: &Path, explicit: Option<&str>) -> Result<Keypair> {
    let hex_key = match explicit {
        Some(key) => key.trim().to_string(),
        None => {
            let path = data_dir.join(KEY_FILE);
            std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read validator key {} (run `pop-node init`)", path.display()))?
                .trim()
                .to_string()
        }
    };
    Keypair::from_hex(&hex_key).map_err(|e| anyhow::anyhow!("invalid validator key: {e}"))
}

/// Creates the data directory, a validator key, and a single-validator
/// devnet config.
fn init_node(args: cli::InitArgs) -> Result<()> {
    logging::init_logging("pop_node=info", LogFormat::Pretty);

    let data_dir = &args.data_dir;
    let key_path = data_dir.join(KEY_FILE);
    let config_path = data_dir.join(CONFIG_FILE);
    if !args.force && (key_path.exists() || config_path.exists()) {
        bail!("{} is already initialized (use --force to overwrite)", data_dir.display());
    }
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

    let keypair = Keypair::generate();
    let public_key = keypair.public_key_hex();
    std::fs::write(&key_path, hex::encode(keypair.secret_key_bytes()))
        .with_context(|| format!("failed to write validator key to {}", key_path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))?;
    }

    NodeFile::single_validator(&public_key).save(&config_path)?;
    tracing::info!(public_key = %public_key, key = %key_path.display(), "validator initialized");

    println!("Node initialized.");
    println!("  Data directory : {}", data_dir.display());
    println!("  Config         : {}", config_path.display());
    println!("  Validator key  : {}", key_path.display());
    println!("  Public key     : {}", public_key);
    Ok(())
}

fn api_url(base: &str, path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path)
}

async fn query_status(args: cli::StatusArgs) -> Result<()> {
    let url = api_url(&args.api_url, "/status");
    let status: serde_json::Value = reqwest::get(&url)
        .await
        .with_context(|| format!("failed to reach {url}"))?
        .error_for_status()?
        .json()
        .await
        .context("invalid status response")?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn set_sync_mode(args: cli::SyncModeArgs) -> Result<()> {
    let url = api_url(&args.api_url, "/sync-mode");
    let setting: pop_protocol::network::SyncSetting = args.setting.into();
    let body: serde_json::Value = reqwest::Client::new()
        .post(&url)
        .json(&serde_json::json!({ "setting": setting }))
        .send()
        .await
        .with_context(|| format!("failed to reach {url}"))?
        .error_for_status()?
        .json()
        .await
        .context("invalid sync-mode response")?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

fn print_version() {
    println!("pop-node  {}", env!("CARGO_PKG_VERSION"));
    println!("protocol  {}", pop_protocol::config::PROTOCOL_VERSION);
    println!("wire      v{}", pop_protocol::config::WIRE_PROTOCOL_VERSION);
}

/// Waits for SIGINT or SIGTERM, whichever comes first. On non-Unix
/// platforms only Ctrl+C is supported.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
