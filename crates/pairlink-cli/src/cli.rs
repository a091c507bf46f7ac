//! Command-line argument parsing with clap.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use pairlink_tunnel::orchestrator::{DEFAULT_KEY_DIR, DEFAULT_OWNER_TAG, DEFAULT_STATE_DIR};
use pairlink_tunnel::OrchestratorConfig;

/// pairlink - point-to-point tunnel provisioning.
#[derive(Parser, Debug, Clone)]
#[command(name = "pairlink")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Directory holding identity key files.
    #[arg(long, env = "PAIRLINK_KEY_DIR", default_value = DEFAULT_KEY_DIR)]
    pub key_dir: PathBuf,

    /// Directory holding ownership records.
    #[arg(long, env = "PAIRLINK_STATE_DIR", default_value = DEFAULT_STATE_DIR)]
    pub state_dir: PathBuf,

    /// Owner tag marking interfaces created by this host's orchestrator.
    #[arg(long, env = "PAIRLINK_OWNER", default_value = DEFAULT_OWNER_TAG)]
    pub owner: String,

    /// Time allowed for each step, in milliseconds.
    #[arg(long, env = "PAIRLINK_STEP_TIMEOUT_MS", default_value_t = 5000)]
    pub step_timeout_ms: u64,

    /// Path to the `ip` tool.
    #[arg(long, env = "PAIRLINK_IP", default_value = "ip")]
    pub ip_path: String,

    /// Path to the `wg` tool.
    #[arg(long, env = "PAIRLINK_WG", default_value = "wg")]
    pub wg_path: String,

    /// Output format.
    #[arg(short, long, value_enum, default_value_t = Format::Table)]
    pub format: Format,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Orchestrator settings from the global flags.
    #[must_use]
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig::new(&self.key_dir, &self.state_dir)
            .with_owner_tag(&self.owner)
            .with_step_timeout(Duration::from_millis(self.step_timeout_ms))
    }
}

/// Output format options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
pub enum Format {
    /// Human-readable table format.
    #[default]
    Table,
    /// JSON output for scripting.
    Json,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Bring the tunnel described by a spec file up.
    Up(SpecArgs),

    /// Tear the tunnel described by a spec file down.
    Down(SpecArgs),

    /// Bring a tunnel up, wait for SIGINT or SIGTERM, then tear it down.
    Run(SpecArgs),

    /// Show what is known about an interface.
    Status {
        /// Interface name.
        interface: String,
    },

    /// Print the configuration a spec would apply.
    Render {
        /// Peer spec file.
        #[command(flatten)]
        spec: SpecArgs,

        /// Include the private key instead of a placeholder.
        #[arg(long)]
        show_private_key: bool,
    },

    /// Print an identity's public key, creating the identity if needed.
    Pubkey {
        /// Identity name.
        identity: String,
    },

    /// Create an identity.
    ///
    /// An existing identity is kept unless `--force` is given. Replacing a
    /// key means every peer needs the new public key.
    Genkey {
        /// Identity name.
        identity: String,

        /// Replace an existing key.
        #[arg(long)]
        force: bool,
    },
}

/// A peer spec file argument.
#[derive(Args, Debug, Clone)]
pub struct SpecArgs {
    /// Path to the peer spec (TOML).
    #[arg(value_name = "SPEC")]
    pub spec: PathBuf,
}
