//! # Prometheus Metrics
//!
//! Operational gauges for the validator, scraped at `/metrics` on the
//! metrics port. Everything lives in a dedicated [`prometheus::Registry`].
//!
//! The node library knows nothing about Prometheus. [`track_status`] follows
//! the node's status channel and mirrors each change into the gauges.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;
use tokio::sync::watch;

use pop_protocol::network::SyncMode;
use pop_protocol::NodeStatus;

#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    /// Last committed height.
    pub committed_height: IntGauge,
    /// Blocks committed since this process started (including synced ones).
    pub blocks_committed_total: IntCounter,
    /// Round currently being decided.
    pub consensus_round: IntGauge,
    pub mempool_size: IntGauge,
    pub connected_peers: IntGauge,
    pub avg_latency_ms: IntGauge,
    /// 0 = p2p, 1 = http.
    pub sync_mode: IntGauge,
    /// 1 once the node stopped voting after a consistency fault.
    pub halted: IntGauge,
    /// Proofs accepted through the HTTP API.
    pub proofs_submitted_total: IntCounter,
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge, prometheus::Error> {
    let metric = IntGauge::new(name, help)?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    let metric = IntCounter::new(name, help)?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

impl NodeMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("pop".into()), None)?;
        Ok(Self {
            committed_height: gauge(&registry, "committed_height", "Height of the last committed block")?,
            blocks_committed_total: counter(
                &registry,
                "blocks_committed_total",
                "Blocks committed or synced since start",
            )?,
            consensus_round: gauge(&registry, "consensus_round", "Round at the height being decided")?,
            mempool_size: gauge(&registry, "mempool_size", "Proofs waiting for inclusion")?,
            connected_peers: gauge(&registry, "connected_peers", "Connected P2P peers")?,
            avg_latency_ms: gauge(
                &registry,
                "avg_latency_ms",
                "Mean round trip to probed peers in milliseconds",
            )?,
            sync_mode: gauge(&registry, "sync_mode", "Effective sync mode (0 = p2p, 1 = http)")?,
            halted: gauge(&registry, "halted", "1 if consensus halted on a consistency fault")?,
            proofs_submitted_total: counter(
                &registry,
                "proofs_submitted_total",
                "Proofs accepted through the HTTP API",
            )?,
            registry,
        })
    }

    pub fn observe(&self, status: &NodeStatus) {
        let previous = self.committed_height.get().max(0) as u64;
        if status.height > previous {
            self.blocks_committed_total.inc_by(status.height - previous);
        }
        self.committed_height.set(status.height as i64);
        self.consensus_round.set(status.round as i64);
        self.mempool_size.set(status.mempool_size as i64);
        self.connected_peers.set(status.peer_count as i64);
        self.avg_latency_ms.set(status.avg_latency_ms as i64);
        self.sync_mode.set(match status.mode {
            SyncMode::P2p => 0,
            SyncMode::Http => 1,
        });
        self.halted.set(status.halted as i64);
    }

    /// Encodes all registered metrics in the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

pub type SharedMetrics = Arc<NodeMetrics>;

/// Mirrors every status change into `metrics` until the node stops.
pub async fn track_status(metrics: SharedMetrics, mut status: watch::Receiver<NodeStatus>) {
    loop {
        metrics.observe(&status.borrow_and_update());
        if status.changed().await.is_err() {
            break;
        }
    }
}

/// `GET /metrics`.
pub async fn metrics_handler(State(metrics): State<SharedMetrics>) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pop_protocol::consensus::Step;
    use pop_protocol::network::SyncSetting;

    fn status(height: u64, mode: SyncMode) -> NodeStatus {
        NodeStatus {
            node_id: "aa".into(),
            height,
            round: 2,
            step: Step::Precommit,
            mode,
            setting: SyncSetting::Auto,
            peer_count: 3,
            avg_latency_ms: 40,
            current_root: "00".into(),
            halted: false,
            syncing: false,
            mempool_size: 5,
        }
    }

    #[test]
    fn observe_tracks_height_and_mode() {
        let metrics = NodeMetrics::new().unwrap();
        metrics.observe(&status(4, SyncMode::P2p));
        metrics.observe(&status(7, SyncMode::Http));

        assert_eq!(metrics.committed_height.get(), 7);
        assert_eq!(metrics.blocks_committed_total.get(), 7);
        assert_eq!(metrics.sync_mode.get(), 1);
        assert_eq!(metrics.connected_peers.get(), 3);

        let text = metrics.encode().unwrap();
        assert!(text.contains("pop_committed_height 7"));
        assert!(text.contains("pop_avg_latency_ms 40"));
    }
}
