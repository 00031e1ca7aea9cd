//! # Network Monitor
//!
//! Tracks round-trip latency to each peer and feeds the aggregate into the
//! adaptive consensus timeout.
//!
//! Each peer has a bounded window of samples. A sample is either a
//! successful round trip or a failure (timeout, unreachable). Statistics are
//! computed over successful samples only and cached per peer for a short
//! TTL; recording a sample invalidates that peer's cache entry.
//!
//! An average latency of zero means "no data". Callers treat it that way:
//! the timeout policy falls back to its base value and `is_high_latency`
//! reports false.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use super::transport::{NetworkError, PeerId};
use crate::config::{
    HIGH_LATENCY_THRESHOLD, LATENCY_WINDOW_SIZE, PEER_STATS_CACHE_TTL, PROBE_INTERVAL,
    PROBE_TIMEOUT,
};

// ---------------------------------------------------------------------------
// TTL cache
// ---------------------------------------------------------------------------

/// A small get-or-compute cache whose entries expire after a fixed TTL.
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: Mutex<HashMap<K, (V, Instant)>>,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cached value for `key` if still fresh, otherwise computes,
    /// stores, and returns a new one.
    pub fn get_or_compute(&self, key: &K, compute: impl FnOnce() -> V) -> V {
        let now = Instant::now();
        if let Some((value, at)) = self.entries.lock().get(key) {
            if now.duration_since(*at) < self.ttl {
                return value.clone();
            }
        }
        let value = compute();
        self.entries.lock().insert(key.clone(), (value.clone(), now));
        value
    }

    pub fn invalidate(&self, key: &K) {
        self.entries.lock().remove(key);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Samples & statistics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct LatencySample {
    rtt: Duration,
    success: bool,
}

/// Aggregate over one peer's successful samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PeerLatency {
    pub avg: Duration,
    pub min: Duration,
    pub max: Duration,
    pub count: usize,
    pub last: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct NetworkHealth {
    pub peer_count: usize,
    pub avg_latency: Duration,
    /// Failed samples over all samples, across peers. Zero with no data.
    pub failure_rate: f64,
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub window_size: usize,
    pub stats_ttl: Duration,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub high_latency_threshold: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            window_size: LATENCY_WINDOW_SIZE,
            stats_ttl: PEER_STATS_CACHE_TTL,
            probe_interval: PROBE_INTERVAL,
            probe_timeout: PROBE_TIMEOUT,
            high_latency_threshold: HIGH_LATENCY_THRESHOLD,
        }
    }
}

/// Something that can measure a round trip to a peer.
#[async_trait]
pub trait Pinger: Send + Sync + 'static {
    async fn ping(&self, peer: &str) -> Result<Duration, NetworkError>;
}

struct ProbeTask {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

pub struct NetworkMonitor {
    config: MonitorConfig,
    windows: DashMap<PeerId, VecDeque<LatencySample>>,
    stats: TtlCache<PeerId, Option<PeerLatency>>,
    probe: Mutex<Option<ProbeTask>>,
}

impl NetworkMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        let stats = TtlCache::new(config.stats_ttl);
        Self {
            config,
            windows: DashMap::new(),
            stats,
            probe: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn record_latency(&self, peer: &str, rtt: Duration, success: bool) {
        {
            let mut window = self.windows.entry(peer.to_string()).or_default();
            if window.len() >= self.config.window_size.max(1) {
                window.pop_front();
            }
            window.push_back(LatencySample { rtt, success });
        }
        self.stats.invalidate(&peer.to_string());
    }

    pub fn get_peer_latency(&self, peer: &str) -> Option<PeerLatency> {
        let key = peer.to_string();
        self.stats.get_or_compute(&key, || {
            self.windows.get(peer).and_then(|w| Self::aggregate(w.value()))
        })
    }

    fn aggregate(window: &VecDeque<LatencySample>) -> Option<PeerLatency> {
        let ok: Vec<Duration> = window.iter().filter(|s| s.success).map(|s| s.rtt).collect();
        let last = *ok.last()?;
        let total: Duration = ok.iter().sum();
        Some(PeerLatency {
            avg: total / ok.len() as u32,
            min: ok.iter().copied().min().unwrap_or_default(),
            max: ok.iter().copied().max().unwrap_or_default(),
            count: ok.len(),
            last,
        })
    }

    /// Mean over every successful sample of every peer. Zero with no data.
    pub fn get_average_network_latency(&self) -> Duration {
        let mut total = Duration::ZERO;
        let mut count = 0u32;
        for window in self.windows.iter() {
            for sample in window.value().iter().filter(|s| s.success) {
                total += sample.rtt;
                count += 1;
            }
        }
        if count == 0 {
            Duration::ZERO
        } else {
            total / count
        }
    }

    pub fn is_high_latency(&self, threshold: Duration) -> bool {
        let avg = self.get_average_network_latency();
        !avg.is_zero() && avg > threshold
    }

    /// Fraction of failed samples in the peer's window.
    pub fn failure_rate(&self, peer: &str) -> Option<f64> {
        let window = self.windows.get(peer)?;
        if window.is_empty() {
            return None;
        }
        let failed = window.iter().filter(|s| !s.success).count();
        Some(failed as f64 / window.len() as f64)
    }

    pub fn network_health(&self) -> NetworkHealth {
        let (mut samples, mut failed) = (0usize, 0usize);
        for window in self.windows.iter() {
            samples += window.len();
            failed += window.iter().filter(|s| !s.success).count();
        }
        NetworkHealth {
            peer_count: self.windows.len(),
            avg_latency: self.get_average_network_latency(),
            failure_rate: if samples == 0 {
                0.0
            } else {
                failed as f64 / samples as f64
            },
        }
    }

    pub fn remove_peer(&self, peer: &str) {
        self.windows.remove(peer);
        self.stats.invalidate(&peer.to_string());
    }

    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.windows.iter().map(|w| w.key().clone()).collect();
        peers.sort();
        peers
    }

    // -- Probing ------------------------------------------------------------

    /// Starts pinging `peers` every probe interval. Returns false, and does
    /// nothing, if probing is already running.
    pub fn start_probing(self: &Arc<Self>, pinger: Arc<dyn Pinger>, peers: Vec<PeerId>) -> bool {
        let mut slot = self.probe.lock();
        if slot.as_ref().is_some_and(|p| !p.handle.is_finished()) {
            return false;
        }
        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(self.clone().probe_loop(pinger, peers, stop_rx));
        *slot = Some(ProbeTask { stop, handle });
        info!(interval_ms = self.config.probe_interval.as_millis() as u64, "latency probing started");
        true
    }

    /// Stops the probe task. Returns false if none was running.
    pub fn stop_probing(&self) -> bool {
        let Some(task) = self.probe.lock().take() else {
            return false;
        };
        let _ = task.stop.send(true);
        task.handle.abort();
        info!("latency probing stopped");
        true
    }

    pub fn is_probing(&self) -> bool {
        self.probe
            .lock()
            .as_ref()
            .is_some_and(|p| !p.handle.is_finished())
    }

    async fn probe_loop(
        self: Arc<Self>,
        pinger: Arc<dyn Pinger>,
        peers: Vec<PeerId>,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut tick = tokio::time::interval(self.config.probe_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => self.probe_round(&pinger, &peers).await,
                _ = stop.changed() => break,
            }
        }
    }

    async fn probe_round(&self, pinger: &Arc<dyn Pinger>, peers: &[PeerId]) {
        let timeout = self.config.probe_timeout;
        let mut pings: FuturesUnordered<_> = peers
            .iter()
            .map(|peer| {
                let pinger = pinger.clone();
                async move {
                    let result = tokio::time::timeout(timeout, pinger.ping(peer)).await;
                    (peer, result)
                }
            })
            .collect();

        while let Some((peer, result)) = pings.next().await {
            match result {
                Ok(Ok(rtt)) => self.record_latency(peer, rtt, true),
                Ok(Err(e)) => {
                    debug!(%peer, error = %e, "probe failed");
                    self.record_latency(peer, timeout, false);
                }
                Err(_) => {
                    debug!(%peer, "probe timed out");
                    self.record_latency(peer, timeout, false);
                }
            }
        }
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}

impl Drop for NetworkMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.probe.get_mut().take() {
            task.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn stats_over_three_samples() {
        let monitor = NetworkMonitor::default();
        monitor.record_latency("p", ms(100), true);
        monitor.record_latency("p", ms(200), true);
        monitor.record_latency("p", ms(300), true);

        let stats = monitor.get_peer_latency("p").unwrap();
        assert_eq!(stats.avg, ms(200));
        assert_eq!(stats.min, ms(100));
        assert_eq!(stats.max, ms(300));
        assert_eq!(stats.count, 3);
        assert_eq!(stats.last, ms(300));
    }

    #[test]
    fn failures_are_excluded_from_latency() {
        let monitor = NetworkMonitor::default();
        monitor.record_latency("p", ms(50), true);
        monitor.record_latency("p", ms(2000), false);
        assert_eq!(monitor.get_peer_latency("p").unwrap().count, 1);
        assert_eq!(monitor.failure_rate("p"), Some(0.5));
    }

    #[test]
    fn no_data_means_zero_and_not_high() {
        let monitor = NetworkMonitor::default();
        assert_eq!(monitor.get_average_network_latency(), Duration::ZERO);
        assert!(!monitor.is_high_latency(ms(1)));
        assert!(monitor.get_peer_latency("nobody").is_none());

        monitor.record_latency("p", ms(10), false);
        assert!(monitor.get_peer_latency("p").is_none());
        assert_eq!(monitor.get_average_network_latency(), Duration::ZERO);
    }

    #[test]
    fn window_drops_oldest() {
        let monitor = NetworkMonitor::new(MonitorConfig {
            window_size: 2,
            ..Default::default()
        });
        monitor.record_latency("p", ms(1000), true);
        monitor.record_latency("p", ms(10), true);
        monitor.record_latency("p", ms(20), true);
        let stats = monitor.get_peer_latency("p").unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.max, ms(20));
    }

    #[test]
    fn recording_invalidates_cached_stats() {
        let monitor = NetworkMonitor::new(MonitorConfig {
            stats_ttl: Duration::from_secs(60),
            ..Default::default()
        });
        monitor.record_latency("p", ms(100), true);
        assert_eq!(monitor.get_peer_latency("p").unwrap().count, 1);
        monitor.record_latency("p", ms(300), true);
        assert_eq!(monitor.get_peer_latency("p").unwrap().avg, ms(200));
    }

    #[test]
    fn average_spans_peers_and_high_latency_threshold() {
        let monitor = NetworkMonitor::default();
        monitor.record_latency("a", ms(100), true);
        monitor.record_latency("b", ms(300), true);
        assert_eq!(monitor.get_average_network_latency(), ms(200));
        assert!(monitor.is_high_latency(ms(150)));
        assert!(!monitor.is_high_latency(ms(250)));

        let health = monitor.network_health();
        assert_eq!(health.peer_count, 2);
        assert_eq!(health.failure_rate, 0.0);

        monitor.remove_peer("b");
        assert_eq!(monitor.get_average_network_latency(), ms(100));
    }

    #[test]
    fn ttl_cache_expires() {
        let cache: TtlCache<u8, u32> = TtlCache::new(Duration::ZERO);
        let mut calls = 0;
        cache.get_or_compute(&1, || {
            calls += 1;
            5
        });
        cache.get_or_compute(&1, || {
            calls += 1;
            6
        });
        assert_eq!(calls, 2);
    }

    struct CountingPinger {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Pinger for CountingPinger {
        async fn ping(&self, peer: &str) -> Result<Duration, NetworkError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if peer == "down" {
                Err(NetworkError::Unreachable(peer.into()))
            } else {
                Ok(ms(40))
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn probing_records_success_and_failure() {
        let monitor = Arc::new(NetworkMonitor::new(MonitorConfig {
            probe_interval: ms(100),
            ..Default::default()
        }));
        let pinger = Arc::new(CountingPinger {
            calls: AtomicUsize::new(0),
        });
        let peers = vec!["up".to_string(), "down".to_string()];

        assert!(monitor.start_probing(pinger.clone(), peers.clone()));
        assert!(!monitor.start_probing(pinger.clone(), peers));

        tokio::time::sleep(ms(250)).await;
        assert!(monitor.stop_probing());
        assert!(!monitor.stop_probing());
        assert!(!monitor.is_probing());

        let calls = pinger.calls.load(Ordering::SeqCst);
        assert!(calls >= 4, "expected at least two rounds, got {calls} pings");
        assert_eq!(monitor.get_peer_latency("up").unwrap().avg, ms(40));
        assert!(monitor.get_peer_latency("down").is_none());
        assert_eq!(monitor.failure_rate("down"), Some(1.0));

        tokio::time::sleep(ms(500)).await;
        assert_eq!(pinger.calls.load(Ordering::SeqCst), calls);
    }
}
