//! Typed scenario sections.
//!
//! These are the resolved forms of the YAML sections, after every file has
//! been merged and node overrides have been layered over the defaults.

use serde::{Deserialize, Serialize};
use spcsim_agents::DEFAULT_PORT;
use spcsim_common::Position;
use spcsim_mac::MacConfig;
use spcsim_phy::propagation::{ConstantSpeedDelay, LogDistanceLoss};
use spcsim_phy::PhyConfig;

/// Destination name that maps to the broadcast address.
pub const BROADCAST_NAME: &str = "broadcast";

// ============================================================================
// Simulation
// ============================================================================

/// Simulation-wide settings.
///
/// ```yaml
/// simulation:
///   seed: 7
///   duration_s: 2.0
///   bandwidth_hz: 20000000
///   measure_interval_ms: 100
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulationConfig {
    /// Seed for the single run RNG.
    pub seed: u64,
    /// Simulated time in seconds.
    pub duration_s: f64,
    /// Channel bandwidth applied to every MAC unless overridden.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bandwidth_hz: Option<u32>,
    /// Neighbor traffic measurement window applied to every MAC unless overridden.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub measure_interval_ms: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            seed: 0,
            duration_s: 10.0,
            bandwidth_hz: None,
            measure_interval_ms: None,
        }
    }
}

/// Per-layer defaults applied to every node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DefaultsConfig {
    /// PHY parameters.
    pub phy: PhyConfig,
    /// MAC parameters.
    pub mac: MacConfig,
}

// ============================================================================
// Propagation
// ============================================================================

/// Loss model selection.
///
/// ```yaml
/// propagation:
///   loss:
///     model: fixed
///     default_loss_db: 200.0
///     pairs:
///       - { from: ap, to: near, loss_db: 60.0, symmetric: true }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum LossModelConfig {
    /// Log-distance path loss.
    LogDistance(LogDistanceLoss),
    /// Per-pair loss matrix.
    Fixed(FixedLossConfig),
}

impl Default for LossModelConfig {
    fn default() -> Self {
        LossModelConfig::LogDistance(LogDistanceLoss::default())
    }
}

/// Per-pair loss matrix by node name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FixedLossConfig {
    /// Loss for pairs that are not listed, in dB.
    pub default_loss_db: f64,
    /// Listed pairs.
    #[serde(default)]
    pub pairs: Vec<LossPair>,
}

/// One entry of a loss matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LossPair {
    /// Transmitting node.
    pub from: String,
    /// Receiving node.
    pub to: String,
    /// Loss in dB.
    pub loss_db: f64,
    /// Apply the same loss in the reverse direction.
    #[serde(default)]
    pub symmetric: bool,
}

/// Delay model selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum DelayModelConfig {
    /// Constant propagation speed.
    ConstantSpeed(ConstantSpeedDelay),
}

impl Default for DelayModelConfig {
    fn default() -> Self {
        DelayModelConfig::ConstantSpeed(ConstantSpeedDelay::default())
    }
}

/// Propagation section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PropagationConfig {
    /// Loss model.
    pub loss: LossModelConfig,
    /// Delay model.
    pub delay: DelayModelConfig,
}

// ============================================================================
// Nodes
// ============================================================================

/// A node after merging, with its layers fully resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// Unique node name.
    pub name: String,
    /// Static position in meters.
    #[serde(default)]
    pub position: Position,
    /// PHY parameters.
    #[serde(default)]
    pub phy: PhyConfig,
    /// MAC parameters.
    #[serde(default)]
    pub mac: MacConfig,
    /// Traffic generators running on this node.
    #[serde(default)]
    pub traffic: Vec<TrafficConfig>,
    /// Packet sink receiving this node's deliveries.
    #[serde(default)]
    pub sink: SinkConfig,
}

/// Packet sink settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SinkConfig {
    /// Attach a sink to the node.
    pub enabled: bool,
    /// Only count packets for this port.
    pub port: Option<u16>,
}

impl Default for SinkConfig {
    fn default() -> Self {
        SinkConfig {
            enabled: true,
            port: None,
        }
    }
}

/// A traffic generator, selected by `type`.
///
/// ```yaml
/// traffic:
///   - type: spc_sender
///     destinations: [near, far]
///     packet_size: 3000
///     traffic_ratio: 0.5
///     mean_interval_s: 0.001
///   - type: on_off
///     destination: broadcast
///     data_rate_bps: 100000
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TrafficConfig {
    /// Two-destination exponential sender.
    SpcSender(SpcSenderTraffic),
    /// Constant bit rate sender.
    OnOff(OnOffTraffic),
}

/// Two-destination sender with destinations by node name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SpcSenderTraffic {
    /// Exactly two destination node names.
    pub destinations: Vec<String>,
    /// Nominal packet size in bytes.
    pub packet_size: u32,
    /// Share of the packet size sent to the first destination.
    pub traffic_ratio: f64,
    /// Mean inter-arrival time in seconds.
    pub mean_interval_s: f64,
    /// Destination application port.
    pub port: u16,
    /// Time of the first packet.
    pub start_s: f64,
    /// Time after which no packet is generated.
    pub stop_s: Option<f64>,
}

impl Default for SpcSenderTraffic {
    fn default() -> Self {
        SpcSenderTraffic {
            destinations: Vec::new(),
            packet_size: 1500,
            traffic_ratio: 0.5,
            mean_interval_s: 1.0,
            port: DEFAULT_PORT,
            start_s: 0.0,
            stop_s: None,
        }
    }
}

/// Constant bit rate sender with its destination by node name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OnOffTraffic {
    /// Destination node name, or `broadcast`.
    pub destination: String,
    /// Rate while on, in bits per second.
    pub data_rate_bps: u64,
    /// Packet size in bytes.
    pub packet_size: u32,
    /// Destination application port.
    pub port: u16,
    /// Length of an on period, zero for always on.
    pub on_s: f64,
    /// Length of an off period.
    pub off_s: f64,
    /// Time the first on period begins.
    pub start_s: f64,
    /// Time after which no packet is generated.
    pub stop_s: Option<f64>,
}

impl Default for OnOffTraffic {
    fn default() -> Self {
        OnOffTraffic {
            destination: BROADCAST_NAME.to_string(),
            data_rate_bps: 500_000,
            packet_size: 512,
            port: DEFAULT_PORT,
            on_s: 0.0,
            off_s: 0.0,
            start_s: 0.0,
            stop_s: None,
        }
    }
}

/// The sections printed by `spcsim defaults`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DefaultScenario {
    /// Simulation-wide settings.
    pub simulation: SimulationConfig,
    /// Layer defaults.
    pub defaults: DefaultsConfig,
    /// Propagation models.
    pub propagation: PropagationConfig,
}
