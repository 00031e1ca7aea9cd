//! # Sync Mode
//!
//! A node learns about new blocks either from peers over P2P or, when it
//! has none, by polling configured HTTP endpoints. The operator picks a
//! setting:
//!
//! ```text
//!   p2p   always P2P
//!   http  always HTTP fallback
//!   auto  P2P ──(0 peers for no_peer_grace)──► HTTP
//!         HTTP ──(≥1 peer for recovery_grace)──► P2P
//! ```
//!
//! In `auto`, a switch also needs the current mode to have been held for
//! `min_dwell`, so a flapping link cannot make the node thrash between
//! modes. A manual setting takes effect immediately.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::info;

use crate::config::{NO_PEER_GRACE, PEER_RECOVERY_GRACE, SYNC_MODE_MIN_DWELL};

/// What the operator asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncSetting {
    P2p,
    Http,
    Auto,
}

/// What the node is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    P2p,
    Http,
}

impl fmt::Display for SyncSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncSetting::P2p => "p2p",
            SyncSetting::Http => "http",
            SyncSetting::Auto => "auto",
        })
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncMode::P2p => "p2p",
            SyncMode::Http => "http",
        })
    }
}

impl FromStr for SyncSetting {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "p2p" => Ok(SyncSetting::P2p),
            "http" => Ok(SyncSetting::Http),
            "auto" => Ok(SyncSetting::Auto),
            other => Err(format!("unknown sync mode '{other}', expected p2p, http or auto")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncModeConfig {
    pub no_peer_grace: Duration,
    pub recovery_grace: Duration,
    pub min_dwell: Duration,
}

impl Default for SyncModeConfig {
    fn default() -> Self {
        Self {
            no_peer_grace: NO_PEER_GRACE,
            recovery_grace: PEER_RECOVERY_GRACE,
            min_dwell: SYNC_MODE_MIN_DWELL,
        }
    }
}

#[derive(Debug)]
pub struct SyncModeController {
    config: SyncModeConfig,
    setting: SyncSetting,
    mode: SyncMode,
    mode_since: Instant,
    /// When the condition that would trigger a switch first held.
    condition_since: Option<Instant>,
}

impl SyncModeController {
    pub fn new(config: SyncModeConfig, setting: SyncSetting, now: Instant) -> Self {
        let mode = match setting {
            SyncSetting::Http => SyncMode::Http,
            SyncSetting::P2p | SyncSetting::Auto => SyncMode::P2p,
        };
        Self {
            config,
            setting,
            mode,
            mode_since: now,
            condition_since: None,
        }
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    pub fn setting(&self) -> SyncSetting {
        self.setting
    }

    /// Applies an operator setting. Fixed settings switch immediately; `auto`
    /// keeps the current mode and starts evaluating from `now`.
    pub fn set_setting(&mut self, setting: SyncSetting, now: Instant) -> SyncMode {
        self.setting = setting;
        self.condition_since = None;
        let target = match setting {
            SyncSetting::P2p => Some(SyncMode::P2p),
            SyncSetting::Http => Some(SyncMode::Http),
            SyncSetting::Auto => None,
        };
        if let Some(target) = target {
            self.switch(target, now);
        }
        info!(%setting, mode = %self.mode, "sync setting changed");
        self.mode
    }

    /// Feeds the current peer count. Returns the new mode if it changed.
    pub fn observe(&mut self, peer_count: usize, now: Instant) -> Option<SyncMode> {
        if self.setting != SyncSetting::Auto {
            return None;
        }
        let (pressure, grace, target) = match self.mode {
            SyncMode::P2p => (peer_count == 0, self.config.no_peer_grace, SyncMode::Http),
            SyncMode::Http => (peer_count > 0, self.config.recovery_grace, SyncMode::P2p),
        };
        if !pressure {
            self.condition_since = None;
            return None;
        }
        let since = *self.condition_since.get_or_insert(now);
        let held = now.saturating_duration_since(since) >= grace;
        let dwelt = now.saturating_duration_since(self.mode_since) >= self.config.min_dwell;
        if held && dwelt {
            info!(from = %self.mode, to = %target, peer_count, "sync mode switched");
            self.switch(target, now);
            Some(target)
        } else {
            None
        }
    }

    fn switch(&mut self, mode: SyncMode, now: Instant) {
        if self.mode != mode {
            self.mode = mode;
            self.mode_since = now;
        }
        self.condition_since = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn controller(setting: SyncSetting) -> (SyncModeController, Instant) {
        let t0 = Instant::now();
        (SyncModeController::new(SyncModeConfig::default(), setting, t0), t0)
    }

    #[test]
    fn auto_starts_in_p2p() {
        let (c, _) = controller(SyncSetting::Auto);
        assert_eq!(c.mode(), SyncMode::P2p);
    }

    #[test]
    fn auto_falls_back_after_grace_and_dwell() {
        let (mut c, t0) = controller(SyncSetting::Auto);
        // Zero peers from t0 + 40s; grace would expire at 70s, dwell at 60s.
        assert_eq!(c.observe(0, t0 + secs(40)), None);
        assert_eq!(c.observe(0, t0 + secs(65)), None);
        assert_eq!(c.observe(0, t0 + secs(70)), Some(SyncMode::Http));
        assert_eq!(c.mode(), SyncMode::Http);
    }

    #[test]
    fn dwell_delays_switch_even_after_grace() {
        let (mut c, t0) = controller(SyncSetting::Auto);
        assert_eq!(c.observe(0, t0), None);
        assert_eq!(c.observe(0, t0 + secs(31)), None);
        assert_eq!(c.observe(0, t0 + secs(60)), Some(SyncMode::Http));
    }

    #[test]
    fn peer_reappearing_resets_grace() {
        let (mut c, t0) = controller(SyncSetting::Auto);
        c.observe(0, t0 + secs(60));
        c.observe(1, t0 + secs(80));
        assert_eq!(c.observe(0, t0 + secs(81)), None);
        assert_eq!(c.observe(0, t0 + secs(100)), None);
        assert_eq!(c.observe(0, t0 + secs(111)), Some(SyncMode::Http));
    }

    #[test]
    fn recovery_back_to_p2p() {
        let (mut c, t0) = controller(SyncSetting::Auto);
        c.observe(0, t0);
        assert_eq!(c.observe(0, t0 + secs(60)), Some(SyncMode::Http));
        // Peers return, but the HTTP mode must be held for the dwell first.
        assert_eq!(c.observe(1, t0 + secs(61)), None);
        assert_eq!(c.observe(1, t0 + secs(90)), None);
        assert_eq!(c.observe(1, t0 + secs(120)), Some(SyncMode::P2p));
    }

    #[test]
    fn manual_override_is_immediate() {
        let (mut c, t0) = controller(SyncSetting::Auto);
        assert_eq!(c.set_setting(SyncSetting::Http, t0 + secs(1)), SyncMode::Http);
        // Fixed settings ignore peer counts.
        assert_eq!(c.observe(5, t0 + secs(500)), None);
        assert_eq!(c.mode(), SyncMode::Http);
        assert_eq!(c.set_setting(SyncSetting::P2p, t0 + secs(2)), SyncMode::P2p);
    }

    #[test]
    fn setting_parses_case_insensitively() {
        assert_eq!("AUTO".parse::<SyncSetting>(), Ok(SyncSetting::Auto));
        assert_eq!("http".parse::<SyncSetting>(), Ok(SyncSetting::Http));
        assert!("carrier-pigeon".parse::<SyncSetting>().is_err());
    }
}
