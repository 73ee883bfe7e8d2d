//! Power and rate allocation under a Shannon capacity model.
//!
//! Path losses are expressed as the power in W a neighbor receives from us,
//! so `L / N` is the neighbor's SNR at full power.

use spcsim_common::{FrameType, SimTime, FCS_LENGTH};
use spcsim_phy::interference::noise_floor_w;

/// Rate and completion time of one stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeRate {
    /// Achievable rate in bytes/s.
    pub rate: f64,
    /// Time to send the stream in seconds.
    pub time: f64,
}

/// Best power split for two superposed streams.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerTimeRate {
    /// Power share of the first stream.
    pub power: f64,
    /// Rate of the slower stream in bytes/s, which paces the transmission.
    pub rate: f64,
    /// Completion time of the slower stream in seconds.
    pub time: f64,
}

/// Aggregation counts chosen before an SPC attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferPlan {
    /// Packets to carry in the first stream.
    pub num1: u32,
    /// Packets to carry in the second stream.
    pub num2: u32,
    /// Projected time for the buffers to fill.
    pub wait: SimTime,
}

/// Inputs for planning aggregation toward one destination.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamDemand {
    /// Path loss in W, if known.
    pub path_loss: Option<f64>,
    /// Size of the head-of-line packet in bytes.
    pub packet_size: u32,
    /// Measured offered traffic in bytes/s.
    pub traffic: u32,
}

/// Allocator bound to a bandwidth and receiver noise figure.
#[derive(Debug, Clone, Copy)]
pub struct Allocator {
    bandwidth_hz: u32,
    noise_floor_w: f64,
}

impl Allocator {
    /// Create an allocator for a linear noise figure.
    pub fn new(noise_figure: f64, bandwidth_hz: u32) -> Self {
        Allocator {
            bandwidth_hz,
            noise_floor_w: noise_floor_w(noise_figure, bandwidth_hz),
        }
    }

    /// Noise floor in W.
    pub fn noise_floor_w(&self) -> f64 {
        self.noise_floor_w
    }

    fn capacity(&self, snr: f64) -> f64 {
        self.bandwidth_hz as f64 * (1.0 + snr).log2() / 8.0
    }

    /// Single-link rate and time against the noise floor.
    pub fn unicast(&self, path_loss: f64, size: u32) -> TimeRate {
        let rate = self.capacity(path_loss / self.noise_floor_w);
        TimeRate {
            rate,
            time: size as f64 / rate,
        }
    }

    /// Search the power split that minimizes the slower stream's completion.
    ///
    /// With `p >= 0.5` the first stream is dominant and is decoded with the
    /// second as interference; below 0.5 the roles are mirrored.
    pub fn spc(&self, path_loss1: f64, path_loss2: f64, size1: u32, size2: u32) -> PowerTimeRate {
        let n = self.noise_floor_w;
        let mut best = PowerTimeRate {
            power: 0.0,
            rate: 0.0,
            time: f64::INFINITY,
        };

        for step in 10..100 {
            let p1 = step as f64 / 100.0;
            let p2 = 1.0 - p1;
            let (snr1, snr2) = if p1 >= 0.5 {
                (p1 * path_loss1 / (p2 * path_loss1 + n), p2 * path_loss2 / n)
            } else {
                (p1 * path_loss1 / n, p2 * path_loss2 / (p1 * path_loss2 + n))
            };
            let c1 = self.capacity(snr1);
            let c2 = self.capacity(snr2);
            let t1 = size1 as f64 / c1;
            let t2 = size2 as f64 / c2;
            let time = t1.max(t2);
            if time < best.time {
                best = PowerTimeRate {
                    power: p1,
                    rate: if t1 > t2 { c1 } else { c2 },
                    time,
                };
            }
        }
        best
    }

    /// Pick how many packets to aggregate per stream and how long the
    /// buffers need to fill at the measured traffic.
    ///
    /// Falls back to one packet each and no wait while any path loss or
    /// traffic measurement is missing.
    pub fn wait_for_buffer(&self, first: StreamDemand, second: StreamDemand, cap: u32) -> BufferPlan {
        let unknown = BufferPlan {
            num1: 1,
            num2: 1,
            wait: SimTime::ZERO,
        };
        let (Some(l1), Some(l2)) = (first.path_loss, second.path_loss) else {
            return unknown;
        };
        if l1 <= 0.0 || l2 <= 0.0 || first.traffic == 0 || second.traffic == 0 {
            return unknown;
        }

        let overhead = FrameType::DataSpc.header_size() + FCS_LENGTH;
        let stream_size = |packet: u32, count: u32| packet * count + overhead;

        let mut plan = BufferPlan { wait: SimTime::MAX, ..unknown };
        let mut best = f64::INFINITY;
        for i in 1..=cap.max(1) {
            for j in 1..=cap.max(1) {
                let spc = self.spc(
                    l1,
                    l2,
                    stream_size(first.packet_size, i),
                    stream_size(second.packet_size, j),
                );
                if spc.time <= best {
                    best = spc.time;
                    plan.num1 = i;
                    plan.num2 = j;
                }
            }
        }

        let fill1 = stream_size(first.packet_size, plan.num1) as f64 / first.traffic as f64;
        let fill2 = stream_size(second.packet_size, plan.num2) as f64 / second.traffic as f64;
        plan.wait = SimTime::from_secs(fill1.max(fill2));
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator() -> Allocator {
        Allocator::new(10f64.powf(0.7), 20_000_000)
    }

    #[test]
    fn test_unicast_at_unit_snr() {
        let alloc = allocator();
        let tr = alloc.unicast(alloc.noise_floor_w(), 1000);
        assert!((tr.rate - 2_500_000.0).abs() < 1e-6);
        assert!((tr.time - 0.0004).abs() < 1e-12);
    }

    #[test]
    fn test_symmetric_low_snr_splits_near_half() {
        let alloc = allocator();
        let n = alloc.noise_floor_w();
        let spc = alloc.spc(n, n, 1026, 1026);
        assert!((spc.power - 0.5).abs() < 0.1, "power {}", spc.power);
        assert!(spc.time.is_finite());
    }

    #[test]
    fn test_spc_beats_unicast_for_near_far_pair() {
        let alloc = allocator();
        let n = alloc.noise_floor_w();
        let (near, far) = (1e6 * n, 3.0 * n);
        let spc = alloc.spc(near, far, 10_026, 1_026);
        let serial = alloc.unicast(near, 10_020).time + alloc.unicast(far, 1_020).time;
        assert!(spc.time <= serial);
        // The far stream needs most of the power.
        assert!(spc.power < 0.5);
    }

    #[test]
    fn test_wait_for_buffer_unknown_defaults() {
        let alloc = allocator();
        let demand = StreamDemand {
            path_loss: None,
            packet_size: 500,
            traffic: 1000,
        };
        let plan = alloc.wait_for_buffer(demand, demand, 10);
        assert_eq!((plan.num1, plan.num2, plan.wait), (1, 1, SimTime::ZERO));
    }

    #[test]
    fn test_wait_for_buffer_projects_fill_time() {
        let alloc = allocator();
        let n = alloc.noise_floor_w();
        let first = StreamDemand {
            path_loss: Some(1e4 * n),
            packet_size: 500,
            traffic: 100_000,
        };
        let second = StreamDemand {
            path_loss: Some(10.0 * n),
            packet_size: 500,
            traffic: 50_000,
        };
        let plan = alloc.wait_for_buffer(first, second, 10);
        assert!((1..=10).contains(&plan.num1));
        assert!((1..=10).contains(&plan.num2));
        let fill1 = (500 * plan.num1 + 26) as f64 / 100_000.0;
        let fill2 = (500 * plan.num2 + 26) as f64 / 50_000.0;
        assert_eq!(plan.wait, SimTime::from_secs(fill1.max(fill2)));
    }
}
