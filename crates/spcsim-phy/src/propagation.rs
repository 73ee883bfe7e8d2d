//! Propagation models.
//!
//! Loss and delay are computed from the two endpoint positions. Models are
//! stateless and deterministic.

use serde::{Deserialize, Serialize};
use spcsim_common::{EntityId, Position, SimTime};
use std::collections::BTreeMap;

/// A channel endpoint: the node entity and where it is.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Endpoint {
    /// Node entity.
    pub id: EntityId,
    /// Antenna position.
    pub position: Position,
}

/// Computes received power.
pub trait PropagationLossModel: Send {
    /// Received power in dBm for a transmission at `tx_power_dbm`.
    fn rx_power_dbm(&self, tx_power_dbm: f64, from: &Endpoint, to: &Endpoint) -> f64;
}

/// Computes propagation delay.
pub trait PropagationDelayModel: Send {
    /// Delay between the two endpoints.
    fn delay(&self, from: &Endpoint, to: &Endpoint) -> SimTime;
}

// ============================================================================
// Loss Models
// ============================================================================

/// Log-distance path loss: `L = L0 + 10 n log10(d / d0)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogDistanceLoss {
    /// Path loss exponent.
    #[serde(default = "LogDistanceLoss::default_exponent")]
    pub exponent: f64,
    /// Reference distance in meters.
    #[serde(default = "LogDistanceLoss::default_reference_distance")]
    pub reference_distance_m: f64,
    /// Loss at the reference distance in dB.
    #[serde(default = "LogDistanceLoss::default_reference_loss")]
    pub reference_loss_db: f64,
}

impl LogDistanceLoss {
    fn default_exponent() -> f64 {
        3.0
    }

    fn default_reference_distance() -> f64 {
        1.0
    }

    fn default_reference_loss() -> f64 {
        46.6777
    }
}

impl Default for LogDistanceLoss {
    fn default() -> Self {
        LogDistanceLoss {
            exponent: Self::default_exponent(),
            reference_distance_m: Self::default_reference_distance(),
            reference_loss_db: Self::default_reference_loss(),
        }
    }
}

impl PropagationLossModel for LogDistanceLoss {
    fn rx_power_dbm(&self, tx_power_dbm: f64, from: &Endpoint, to: &Endpoint) -> f64 {
        let distance = from.position.distance_to(&to.position);
        if distance <= self.reference_distance_m {
            return tx_power_dbm;
        }
        let loss = self.reference_loss_db
            + 10.0 * self.exponent * (distance / self.reference_distance_m).log10();
        tx_power_dbm - loss
    }
}

/// Fixed per-pair loss in dB, with a default for unlisted pairs.
///
/// Pairs are directional.
#[derive(Debug, Clone, Default)]
pub struct FixedLoss {
    default_loss_db: f64,
    pairs: BTreeMap<(EntityId, EntityId), f64>,
}

impl FixedLoss {
    /// Create a matrix where every pair has `default_loss_db`.
    pub fn new(default_loss_db: f64) -> Self {
        FixedLoss {
            default_loss_db,
            pairs: BTreeMap::new(),
        }
    }

    /// Set the loss from `from` to `to`.
    pub fn set(&mut self, from: EntityId, to: EntityId, loss_db: f64) {
        self.pairs.insert((from, to), loss_db);
    }

    /// Set the same loss in both directions.
    pub fn set_symmetric(&mut self, a: EntityId, b: EntityId, loss_db: f64) {
        self.set(a, b, loss_db);
        self.set(b, a, loss_db);
    }

    /// Loss in dB for a directional pair.
    pub fn loss_db(&self, from: EntityId, to: EntityId) -> f64 {
        self.pairs
            .get(&(from, to))
            .copied()
            .unwrap_or(self.default_loss_db)
    }
}

impl PropagationLossModel for FixedLoss {
    fn rx_power_dbm(&self, tx_power_dbm: f64, from: &Endpoint, to: &Endpoint) -> f64 {
        tx_power_dbm - self.loss_db(from.id, to.id)
    }
}

// ============================================================================
// Delay Models
// ============================================================================

/// Delay at a constant propagation speed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConstantSpeedDelay {
    /// Propagation speed in m/s.
    #[serde(default = "ConstantSpeedDelay::default_speed")]
    pub speed_mps: f64,
}

impl ConstantSpeedDelay {
    fn default_speed() -> f64 {
        299_792_458.0
    }
}

impl Default for ConstantSpeedDelay {
    fn default() -> Self {
        ConstantSpeedDelay {
            speed_mps: Self::default_speed(),
        }
    }
}

impl PropagationDelayModel for ConstantSpeedDelay {
    fn delay(&self, from: &Endpoint, to: &Endpoint) -> SimTime {
        SimTime::from_secs(from.position.distance_to(&to.position) / self.speed_mps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(id: u64, x: f64) -> Endpoint {
        Endpoint {
            id: EntityId::new(id),
            position: Position::new(x, 0.0, 0.0),
        }
    }

    #[test]
    fn test_log_distance_loss() {
        let model = LogDistanceLoss::default();
        let rx = model.rx_power_dbm(20.0, &endpoint(1, 0.0), &endpoint(2, 10.0));
        assert!((rx - (20.0 - 46.6777 - 30.0)).abs() < 1e-9);
        // Inside the reference distance there is no loss.
        assert_eq!(model.rx_power_dbm(20.0, &endpoint(1, 0.0), &endpoint(2, 0.5)), 20.0);
    }

    #[test]
    fn test_fixed_loss_matrix() {
        let mut model = FixedLoss::new(200.0);
        model.set(EntityId::new(1), EntityId::new(2), 80.0);
        assert_eq!(model.rx_power_dbm(20.0, &endpoint(1, 0.0), &endpoint(2, 0.0)), -60.0);
        assert_eq!(model.rx_power_dbm(20.0, &endpoint(2, 0.0), &endpoint(1, 0.0)), -180.0);
    }

    #[test]
    fn test_constant_speed_delay() {
        let model = ConstantSpeedDelay::default();
        let delay = model.delay(&endpoint(1, 0.0), &endpoint(2, 299.792458));
        assert_eq!(delay, SimTime::from_micros(1));
    }
}
