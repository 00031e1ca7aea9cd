//! # CLI Interface
//!
//! Command-line arguments for `pop-node`, built with `clap` derive.
//! Subcommands: `run`, `init`, `status`, `sync-mode`, and `version`.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use pop_protocol::network::SyncSetting;

use crate::logging::LogFormat;

/// Proof-of-Proof validator node.
///
/// Gossips proved state transitions, orders them with stake-weighted BFT
/// consensus, and serves a small HTTP surface for operators, provers, and
/// peers that fell back to HTTP sync.
#[derive(Parser, Debug)]
#[command(
    name = "pop-node",
    about = "Proof-of-Proof validator node",
    version,
    propagate_version = true
)]
pub struct PopNodeCli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the validator node.
    Run(RunArgs),
    /// Create a data directory with a fresh validator key and a
    /// single-validator config.
    Init(InitArgs),
    /// Query the status of a running node over HTTP.
    Status(StatusArgs),
    /// Change a running node's sync mode setting.
    SyncMode(SyncModeArgs),
    /// Print version information and exit.
    Version,
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Node configuration file (TOML). Defaults to `node.toml` in the data
    /// directory.
    #[arg(long, short = 'c', env = "POP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Data directory holding the chain database and the validator key.
    #[arg(long, short = 'd', env = "POP_DATA_DIR", default_value = ".pop")]
    pub data_dir: PathBuf,

    /// Hex Ed25519 secret key. Overrides `validator.key` in the data
    /// directory.
    #[arg(long, env = "POP_VALIDATOR_KEY")]
    pub validator_key: Option<String>,

    /// Overrides the config file's sync mode.
    #[arg(long, value_enum)]
    pub sync_mode: Option<SyncModeArg>,

    /// Log output format.
    #[arg(long, value_enum, env = "POP_LOG_FORMAT", default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

#[derive(Parser, Debug)]
pub struct InitArgs {
    #[arg(long, short = 'd', env = "POP_DATA_DIR", default_value = ".pop")]
    pub data_dir: PathBuf,

    /// Overwrite an existing key and config.
    #[arg(long)]
    pub force: bool,
}

#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// API endpoint of the running node.
    #[arg(long, default_value = "http://127.0.0.1:9741")]
    pub api_url: String,
}

#[derive(Parser, Debug)]
pub struct SyncModeArgs {
    #[arg(long, default_value = "http://127.0.0.1:9741")]
    pub api_url: String,

    #[arg(value_enum)]
    pub setting: SyncModeArg,
}

/// `p2p`, `http`, or `auto`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SyncModeArg {
    P2p,
    Http,
    Auto,
}

impl From<SyncModeArg> for SyncSetting {
    fn from(arg: SyncModeArg) -> Self {
        match arg {
            SyncModeArg::P2p => SyncSetting::P2p,
            SyncModeArg::Http => SyncSetting::Http,
            SyncModeArg::Auto => SyncSetting::Auto,
        }
    }
}
