//! Metric names emitted by the simulator.
//!
//! Every metric recorded through the `metrics` facade is declared here so
//! the runner can list them and the exporters can group them by prefix.

use std::fmt;

/// Kind of metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// Monotonic counter.
    Counter,
    /// Value that goes up and down.
    Gauge,
    /// Distribution of samples.
    Histogram,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricKind::Counter => write!(f, "counter"),
            MetricKind::Gauge => write!(f, "gauge"),
            MetricKind::Histogram => write!(f, "histogram"),
        }
    }
}

/// Unit of the recorded values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricUnit {
    /// Plain count.
    Count,
    /// Bytes.
    Bytes,
    /// Microseconds.
    Micros,
    /// Dimensionless ratio in [0, 1].
    Ratio,
}

/// Static description of one metric.
#[derive(Debug, Clone, Copy)]
pub struct MetricDef {
    /// Dotted metric name.
    pub name: &'static str,
    /// Metric kind.
    pub kind: MetricKind,
    /// Value unit.
    pub unit: MetricUnit,
    /// Human readable description.
    pub description: &'static str,
    /// Labels recorded in addition to `node`.
    pub labels: &'static [&'static str],
}

impl MetricDef {
    /// Unit suffix for display, empty for plain counts.
    pub fn unit_str(&self) -> &'static str {
        match self.unit {
            MetricUnit::Count => "",
            MetricUnit::Bytes => "bytes",
            MetricUnit::Micros => "us",
            MetricUnit::Ratio => "ratio",
        }
    }
}

/// Labels attached to every metric recorded by one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricLabels {
    /// Node name from the scenario.
    pub node: String,
}

impl MetricLabels {
    /// Create labels for a node.
    pub fn new(node: impl Into<String>) -> Self {
        MetricLabels { node: node.into() }
    }

    /// Label pairs in the form accepted by the `metrics` macros.
    pub fn to_labels(&self) -> Vec<(&'static str, String)> {
        vec![("node", self.node.clone())]
    }
}

// ============================================================================
// MAC
// ============================================================================

pub const MAC_TX_FRAMES: MetricDef = MetricDef {
    name: "spcsim.mac.tx_frames",
    kind: MetricKind::Counter,
    unit: MetricUnit::Count,
    description: "Frames handed to the PHY",
    labels: &["frame_type"],
};

pub const MAC_SPC_TRANSMISSIONS: MetricDef = MetricDef {
    name: "spcsim.mac.spc_transmissions",
    kind: MetricKind::Counter,
    unit: MetricUnit::Count,
    description: "Superposed DATA_SPC transmissions",
    labels: &[],
};

pub const MAC_SPC_POWER_SPLIT: MetricDef = MetricDef {
    name: "spcsim.mac.spc_power_split",
    kind: MetricKind::Histogram,
    unit: MetricUnit::Ratio,
    description: "Power share given to the first stream of a DATA_SPC",
    labels: &[],
};

pub const MAC_SPC_FALLBACKS: MetricDef = MetricDef {
    name: "spcsim.mac.spc_fallbacks",
    kind: MetricKind::Counter,
    unit: MetricUnit::Count,
    description: "SPC exchanges aborted to unicast after an ACK timeout",
    labels: &[],
};

pub const MAC_CTS_TIMEOUTS: MetricDef = MetricDef {
    name: "spcsim.mac.cts_timeouts",
    kind: MetricKind::Counter,
    unit: MetricUnit::Count,
    description: "CTS timeouts after RTS or RTS_SPC",
    labels: &[],
};

pub const MAC_ACK_TIMEOUTS: MetricDef = MetricDef {
    name: "spcsim.mac.ack_timeouts",
    kind: MetricKind::Counter,
    unit: MetricUnit::Count,
    description: "ACK timeouts after DATA or DATA_SPC",
    labels: &[],
};

pub const MAC_DROPPED_FRAMES: MetricDef = MetricDef {
    name: "spcsim.mac.dropped_frames",
    kind: MetricKind::Counter,
    unit: MetricUnit::Count,
    description: "Frames abandoned after retry exhaustion",
    labels: &["reason"],
};

pub const MAC_BACKOFF_SLOTS: MetricDef = MetricDef {
    name: "spcsim.mac.backoff_slots",
    kind: MetricKind::Histogram,
    unit: MetricUnit::Count,
    description: "Backoff slots drawn per contention",
    labels: &[],
};

pub const MAC_DELIVERED_PACKETS: MetricDef = MetricDef {
    name: "spcsim.mac.delivered_packets",
    kind: MetricKind::Counter,
    unit: MetricUnit::Count,
    description: "Packets handed to the application",
    labels: &[],
};

pub const MAC_DELIVERED_BYTES: MetricDef = MetricDef {
    name: "spcsim.mac.delivered_bytes",
    kind: MetricKind::Counter,
    unit: MetricUnit::Bytes,
    description: "Payload bytes handed to the application",
    labels: &[],
};

// ============================================================================
// Queue
// ============================================================================

pub const QUEUE_OVERFLOW: MetricDef = MetricDef {
    name: "spcsim.queue.overflow_drops",
    kind: MetricKind::Counter,
    unit: MetricUnit::Count,
    description: "Packets dropped because the outgoing queue was full",
    labels: &[],
};

pub const QUEUE_LENGTH: MetricDef = MetricDef {
    name: "spcsim.queue.length",
    kind: MetricKind::Gauge,
    unit: MetricUnit::Count,
    description: "Outgoing queue length",
    labels: &[],
};

// ============================================================================
// PHY
// ============================================================================

pub const PHY_RX_OK: MetricDef = MetricDef {
    name: "spcsim.phy.rx_ok",
    kind: MetricKind::Counter,
    unit: MetricUnit::Count,
    description: "Frames that passed the capacity test",
    labels: &["frame_type"],
};

pub const PHY_RX_ERROR: MetricDef = MetricDef {
    name: "spcsim.phy.rx_error",
    kind: MetricKind::Counter,
    unit: MetricUnit::Count,
    description: "Receptions that failed the capacity test",
    labels: &[],
};

pub const PHY_TX_AIRTIME: MetricDef = MetricDef {
    name: "spcsim.phy.tx_airtime",
    kind: MetricKind::Counter,
    unit: MetricUnit::Micros,
    description: "Time spent transmitting",
    labels: &[],
};

// ============================================================================
// Application
// ============================================================================

pub const APP_PACKETS_SENT: MetricDef = MetricDef {
    name: "spcsim.app.packets_sent",
    kind: MetricKind::Counter,
    unit: MetricUnit::Count,
    description: "Packets generated by traffic agents",
    labels: &["destination"],
};

pub const APP_BYTES_RECEIVED: MetricDef = MetricDef {
    name: "spcsim.app.bytes_received",
    kind: MetricKind::Counter,
    unit: MetricUnit::Bytes,
    description: "Bytes counted by packet sinks",
    labels: &[],
};

/// All metric definitions.
pub const ALL: &[MetricDef] = &[
    MAC_TX_FRAMES,
    MAC_SPC_TRANSMISSIONS,
    MAC_SPC_POWER_SPLIT,
    MAC_SPC_FALLBACKS,
    MAC_CTS_TIMEOUTS,
    MAC_ACK_TIMEOUTS,
    MAC_DROPPED_FRAMES,
    MAC_BACKOFF_SLOTS,
    MAC_DELIVERED_PACKETS,
    MAC_DELIVERED_BYTES,
    QUEUE_OVERFLOW,
    QUEUE_LENGTH,
    PHY_RX_OK,
    PHY_RX_ERROR,
    PHY_TX_AIRTIME,
    APP_PACKETS_SENT,
    APP_BYTES_RECEIVED,
];
