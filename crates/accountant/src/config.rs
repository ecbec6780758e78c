//! Daemon configuration: CLI flags with environment fallbacks and the
//! card seed file describing the accelerators this node exposes.

use std::path::PathBuf;

use clap::Parser;
use clap::ValueEnum;
use serde::Deserialize;
use serde::Serialize;

/// Default filesystem endpoint for the local socket API.
pub const DEFAULT_SOCKET_PATH: &str = "/var/lib/kubelet/device-plugins/card-accountant.sock";

/// How a card is shared between concurrent workloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SharingStrategy {
    /// Whole-card allocations only.
    None,
    /// Replicated time-sliced slots, no thread throttling.
    TimeSliced,
    /// Co-scheduled replicas with per-container thread percentages.
    CoScheduled,
}

impl SharingStrategy {
    /// Whether replica capacity above 1 is meaningful for this strategy.
    pub fn replicated(self) -> bool {
        !matches!(self, Self::None)
    }
}

/// How the container runtime refers to allocated cards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceIdStrategy {
    /// Pass base UUIDs, replica suffixes stripped.
    Uuid,
    /// Pass host device indices.
    Index,
}

/// Replica-slot placement policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AllocationPolicy {
    /// Capacity-aware best-fit: fill cards before opening new ones.
    Packed,
    /// Balance replicas across cards.
    Distributed,
    /// Delegate ordering to a topology provider.
    Aligned,
}

/// One accelerator exposed by this node, as read from the card seed file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardConfig {
    /// Host device index (0, 1, 2, ...).
    pub index: u32,
    /// Opaque base identifier, typically the hardware UUID.
    pub uuid: String,
    /// Per-card replica override; falls back to the daemon-wide setting.
    #[serde(default)]
    pub replicas: Option<u32>,
}

#[derive(Parser, Clone, Debug)]
pub struct DaemonArgs {
    #[arg(
        long,
        env = "CARDSHARE_SOCKET_PATH",
        default_value = DEFAULT_SOCKET_PATH,
        value_hint = clap::ValueHint::FilePath,
        help = "Filesystem path the local socket API listens on"
    )]
    pub socket_path: PathBuf,

    #[arg(
        long,
        env = "CARDSHARE_NODE_NAME",
        help = "Name of the node this accountant is responsible for"
    )]
    pub node_name: String,

    #[arg(
        long,
        env = "CARDSHARE_CARD_CONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "JSON file listing the cards on this node, e.g. /etc/cardshare/cards.json"
    )]
    pub card_config: PathBuf,

    #[arg(
        long,
        env = "CARDSHARE_SHARING_STRATEGY",
        value_enum,
        default_value = "co-scheduled",
        help = "How cards are shared between workloads"
    )]
    pub sharing_strategy: SharingStrategy,

    #[arg(
        long,
        env = "CARDSHARE_REPLICAS",
        default_value_t = 1,
        help = "Replica slots per card when sharing is enabled"
    )]
    pub replicas: u32,

    #[arg(
        long,
        env = "CARDSHARE_DEVICE_ID_STRATEGY",
        value_enum,
        default_value = "uuid",
        help = "Identifier form handed to the container runtime"
    )]
    pub device_id_strategy: DeviceIdStrategy,

    #[arg(
        long,
        env = "CARDSHARE_ALLOCATION_POLICY",
        value_enum,
        default_value = "packed",
        help = "Replica placement policy"
    )]
    pub allocation_policy: AllocationPolicy,

    #[arg(
        long,
        default_value = "/var/run/cardshare/pipe",
        value_hint = clap::ValueHint::DirPath,
        help = "Host pipe directory mounted into sharing-enabled containers"
    )]
    pub pipe_dir: PathBuf,

    #[arg(
        long,
        default_value = "/var/run/cardshare/shm",
        value_hint = clap::ValueHint::DirPath,
        help = "Host shared-memory directory mounted into sharing-enabled containers"
    )]
    pub shm_dir: PathBuf,

    #[arg(
        long,
        help = "Skip the live-pod replay on startup (testing only)",
        default_value_t = false,
        action = clap::ArgAction::Set
    )]
    pub skip_replay: bool,

    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to in-cluster config)"
    )]
    pub kubeconfig: Option<PathBuf>,
}

impl DaemonArgs {
    /// Replica capacity for one card, honouring the per-card override and
    /// the sharing strategy (strategy `none` forces whole cards).
    pub fn replicas_for(&self, card: &CardConfig) -> u32 {
        if !self.sharing_strategy.replicated() {
            return 1;
        }
        card.replicas.unwrap_or(self.replicas).max(1)
    }
}

/// Load the card seed file.
pub fn load_cards(path: &std::path::Path) -> anyhow::Result<Vec<CardConfig>> {
    let raw = std::fs::read_to_string(path)?;
    let cards: Vec<CardConfig> = serde_json::from_str(&raw)?;
    anyhow::ensure!(!cards.is_empty(), "card config {} lists no cards", path.display());
    Ok(cards)
}
