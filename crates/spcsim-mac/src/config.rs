//! MAC configuration and derived timing.

use serde::{Deserialize, Serialize};
use spcsim_common::{FrameType, Preamble, SimTime, FCS_LENGTH};

/// Speed used to bound the propagation delay, in m/s.
const MAX_PROPAGATION_SPEED: f64 = 300_000_000.0;

/// MAC configuration.
///
/// All times are in microseconds so scenario files stay readable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MacConfig {
    /// Short interframe space.
    pub sifs_us: u64,
    /// Distributed interframe space.
    pub difs_us: u64,
    /// Backoff slot time.
    pub slot_us: u64,
    /// Minimum contention window.
    pub cw_min: u32,
    /// Maximum contention window.
    pub cw_max: u32,
    /// Payloads at or above this size use RTS/CTS. Smaller ones go out
    /// as DATA without acknowledgement.
    pub rts_threshold: u32,
    /// RTS retries before the frames are dropped.
    pub max_rts_retries: u32,
    /// DATA retries before the frame is dropped.
    pub max_data_retries: u32,
    /// Rate for control frames and unacknowledged DATA, in bytes/s.
    pub min_rate: u32,
    /// Channel bandwidth in Hz.
    pub bandwidth_hz: u32,
    /// Neighbor traffic measurement interval.
    pub measure_interval_ms: u64,
    /// Delay before the first measurement tick.
    pub first_measure_ms: u64,
    /// Largest number of packets aggregated into one SPC stream.
    pub aggregation_cap: u32,
    /// Outgoing queue capacity.
    pub queue_capacity: usize,
    /// Range used to bound the propagation delay, in meters.
    pub max_range_m: f64,
}

impl Default for MacConfig {
    fn default() -> Self {
        MacConfig {
            sifs_us: 16,
            difs_us: 34,
            slot_us: 9,
            cw_min: 15,
            cw_max: 1023,
            rts_threshold: 1000,
            max_rts_retries: 7,
            max_data_retries: 7,
            min_rate: Preamble::BASE_RATE,
            bandwidth_hz: Preamble::DEFAULT_BANDWIDTH_HZ,
            measure_interval_ms: 100,
            first_measure_ms: 10,
            aggregation_cap: 10,
            queue_capacity: 400,
            max_range_m: 1000.0,
        }
    }
}

/// Times derived from a [`MacConfig`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MacTiming {
    /// Short interframe space.
    pub sifs: SimTime,
    /// Distributed interframe space.
    pub difs: SimTime,
    /// Backoff slot.
    pub slot: SimTime,
    /// Upper bound on propagation delay.
    pub max_propagation: SimTime,
    /// RTS airtime plus propagation plus SIFS.
    pub rts_send_and_sifs: SimTime,
    /// CTS airtime plus propagation plus SIFS.
    pub cts_send_and_sifs: SimTime,
    /// ACK airtime plus propagation plus SIFS.
    pub ack_send_and_sifs: SimTime,
    /// Measurement interval.
    pub measure_interval: SimTime,
}

impl MacTiming {
    /// Derive timing from configuration.
    pub fn from_config(config: &MacConfig) -> Self {
        let sifs = SimTime::from_micros(config.sifs_us);
        let max_propagation = SimTime::from_secs(config.max_range_m / MAX_PROPAGATION_SPEED);
        let send_and_sifs = |frame_type: FrameType| {
            control_preamble(config, frame_type).tx_duration() + max_propagation + sifs
        };
        MacTiming {
            sifs,
            difs: SimTime::from_micros(config.difs_us),
            slot: SimTime::from_micros(config.slot_us),
            max_propagation,
            rts_send_and_sifs: send_and_sifs(FrameType::Rts),
            cts_send_and_sifs: send_and_sifs(FrameType::Cts),
            ack_send_and_sifs: send_and_sifs(FrameType::Ack),
            measure_interval: SimTime::from_millis(config.measure_interval_ms),
        }
    }
}

/// Descriptor for a bodiless control frame at the minimum rate.
pub fn control_preamble(config: &MacConfig, frame_type: FrameType) -> Preamble {
    Preamble::single(
        config.min_rate,
        config.bandwidth_hz,
        frame_type.header_size() + FCS_LENGTH,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timing() {
        let timing = MacTiming::from_config(&MacConfig::default());
        // CTS: 15 bytes at 750000 B/s = 20 us, plus 24 us preamble,
        // plus 3333 ns propagation, plus 16 us SIFS.
        assert_eq!(timing.cts_send_and_sifs, SimTime::from_nanos(63_333));
        // ACK: 14 bytes -> 18667 ns.
        assert_eq!(timing.ack_send_and_sifs, SimTime::from_nanos(18_667 + 24_000 + 3_333 + 16_000));
        assert_eq!(timing.max_propagation, SimTime::from_nanos(3_333));
    }
}
