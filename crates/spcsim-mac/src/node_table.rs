//! Per-neighbor statistics.

use spcsim_common::{MacAddress, SimTime};
use std::collections::BTreeMap;

/// What a node knows about one neighbor.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct NeighborRecord {
    /// Received power in W the neighbor reports for our transmissions.
    pub path_loss: Option<f64>,
    /// Offered traffic toward the neighbor in bytes/s, from the last window.
    pub traffic: u32,
    /// Bytes enqueued toward the neighbor in the current window.
    pub window_bytes: u32,
}

/// Neighbor statistics keyed by address.
#[derive(Debug, Clone, Default)]
pub struct NeighborTable {
    records: BTreeMap<MacAddress, NeighborRecord>,
}

impl NeighborTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the power a neighbor reported hearing us at.
    pub fn update_path_loss(&mut self, address: MacAddress, received_w: f64) {
        self.records.entry(address).or_default().path_loss = Some(received_w);
    }

    /// Count bytes enqueued toward a neighbor.
    pub fn add_size(&mut self, address: MacAddress, bytes: u32) {
        let record = self.records.entry(address).or_default();
        record.window_bytes = record.window_bytes.saturating_add(bytes);
    }

    /// Close a measurement window: traffic becomes bytes per second over
    /// `interval` and the window counters restart.
    pub fn update_traffic(&mut self, interval: SimTime) {
        let secs = interval.as_secs_f64();
        if secs <= 0.0 {
            return;
        }
        for record in self.records.values_mut() {
            record.traffic = (record.window_bytes as f64 / secs) as u32;
            record.window_bytes = 0;
        }
    }

    /// Path loss for a neighbor, if it ever answered a CTS.
    pub fn path_loss(&self, address: MacAddress) -> Option<f64> {
        self.records.get(&address).and_then(|r| r.path_loss)
    }

    /// Measured traffic toward a neighbor in bytes/s (0 if unknown).
    pub fn traffic(&self, address: MacAddress) -> u32 {
        self.records.get(&address).map(|r| r.traffic).unwrap_or(0)
    }

    /// Full record for a neighbor.
    pub fn get(&self, address: MacAddress) -> Option<&NeighborRecord> {
        self.records.get(&address)
    }

    /// Number of known neighbors.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when no neighbor is known.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_traffic_resets_window() {
        let mut table = NeighborTable::new();
        let a = MacAddress::from_index(1);
        table.add_size(a, 1500);
        table.add_size(a, 500);
        table.update_traffic(SimTime::from_millis(100));
        assert_eq!(table.traffic(a), 20_000);
        assert_eq!(table.get(a).map(|r| r.window_bytes), Some(0));

        table.update_traffic(SimTime::from_millis(100));
        assert_eq!(table.traffic(a), 0);
    }

    #[test]
    fn test_path_loss_unknown_until_reported() {
        let mut table = NeighborTable::new();
        let a = MacAddress::from_index(1);
        table.add_size(a, 10);
        assert_eq!(table.path_loss(a), None);
        table.update_path_loss(a, 1e-9);
        assert_eq!(table.path_loss(a), Some(1e-9));
    }
}
