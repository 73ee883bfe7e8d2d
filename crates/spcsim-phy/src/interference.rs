//! Interference accounting.
//!
//! Each receiver keeps a time-ordered ledger of power steps ([`NiChange`]).
//! Every arriving signal adds a `+P` step at its start and a `-P` step at its
//! end. While no reception is active, steps in the past are folded into a
//! scalar baseline (`first_power`) so the ledger stays short.
//!
//! Decodability is decided by walking the ledger across a frame and checking
//! each constant-interference chunk against the Shannon capacity of that
//! chunk. The verdict is deterministic: a frame either passes every chunk or
//! it fails.

use spcsim_common::{Preamble, SimTime};
use tracing::trace;

/// Boltzmann constant used for the thermal noise floor, in J/K.
pub const BOLTZMANN: f64 = 1.3803e-23;

/// Receiver noise floor in W for a bandwidth and linear noise figure.
pub fn noise_floor_w(noise_figure: f64, bandwidth_hz: u32) -> f64 {
    noise_figure * BOLTZMANN * 290.0 * bandwidth_hz as f64
}

/// A signed power step in the interference ledger.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NiChange {
    /// When the step takes effect.
    pub time: SimTime,
    /// Power delta in W.
    pub delta: f64,
}

impl NiChange {
    fn new(time: SimTime, delta: f64) -> Self {
        NiChange { time, delta }
    }
}

/// One signal as seen by a receiver.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalEvent {
    /// Symbols on air, in bytes.
    pub size: u32,
    /// Arrival time.
    pub start: SimTime,
    /// End of the signal.
    pub end: SimTime,
    /// Received power in W.
    pub rx_power_w: f64,
    /// PHY descriptor the sender used.
    pub preamble: Preamble,
}

impl SignalEvent {
    /// Time on air.
    pub fn duration(&self) -> SimTime {
        self.end - self.start
    }
}

/// Verdict for a single-stream frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SnrPer {
    /// SNR at the start of the frame.
    pub snr: f64,
    /// Packet error rate, 0.0 or 1.0.
    pub per: f64,
}

/// Verdict for both streams of a superposed frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SnrPer2 {
    /// SNR of the first stream at the start of the frame.
    pub snr1: f64,
    /// SNR of the second stream at the start of the frame.
    pub snr2: f64,
    /// Error rate of the first stream, 0.0 or 1.0.
    pub per1: f64,
    /// Error rate of the second stream, 0.0 or 1.0.
    pub per2: f64,
}

/// Bytes a superposed stream still has to get through.
#[derive(Debug, Clone, Copy)]
pub struct ByteBudget {
    total: f64,
    delivered: f64,
}

impl ByteBudget {
    /// Budget for a stream carrying `total` bytes.
    pub fn new(total: u32) -> Self {
        ByteBudget {
            total: total as f64,
            delivered: 0.0,
        }
    }

    /// Bytes already accounted for.
    pub fn delivered(&self) -> f64 {
        self.delivered
    }
}

/// Capacity test over one chunk of constant SNR.
///
/// The chunk passes iff `B * log2(1 + snr) * d >= required * 8`, where the
/// required bytes are `rate * d`. With a budget, the required bytes are
/// capped at what the stream still has to deliver, and a stream that has
/// already delivered everything passes. A zero-length chunk always passes.
pub fn chunk_capacity_ok(
    snr: f64,
    duration: SimTime,
    preamble: &Preamble,
    budget: Option<&mut ByteBudget>,
) -> bool {
    if duration == SimTime::ZERO {
        return true;
    }
    let secs = duration.as_secs_f64();
    let mut required = preamble.rate as f64 * secs;

    if let Some(budget) = budget {
        if budget.delivered >= budget.total {
            return true;
        }
        if budget.total >= budget.delivered + required {
            budget.delivered += required;
        } else {
            required = budget.total - budget.delivered;
            budget.delivered = budget.total;
        }
    }

    let capacity_bits = preamble.bandwidth_hz as f64 * (1.0 + snr).log2() * secs;
    trace!(snr, secs, required, capacity_bits, "capacity chunk");
    capacity_bits >= required * 8.0
}

/// How one stream of a signal is evaluated while walking the ledger.
struct StreamView {
    /// Signal power used for the PHY header chunks.
    header_power: f64,
    /// Signal power used for the payload chunks.
    payload_power: f64,
    /// Extra interference during the payload (the undecoded other stream).
    payload_noise: f64,
    /// Optional per-stream byte budget.
    budget: Option<ByteBudget>,
}

/// Per-receiver interference ledger.
#[derive(Debug, Clone)]
pub struct InterferenceHelper {
    noise_figure: f64,
    changes: Vec<NiChange>,
    first_power: f64,
    rxing: bool,
}

impl InterferenceHelper {
    /// Create an empty ledger with a linear noise figure.
    pub fn new(noise_figure: f64) -> Self {
        InterferenceHelper {
            noise_figure,
            changes: Vec::new(),
            first_power: 0.0,
            rxing: false,
        }
    }

    /// Linear receiver noise figure.
    pub fn noise_figure(&self) -> f64 {
        self.noise_figure
    }

    /// Ledger entries in time order.
    pub fn changes(&self) -> &[NiChange] {
        &self.changes
    }

    /// Baseline power folded from past entries.
    pub fn first_power(&self) -> f64 {
        self.first_power
    }

    /// True while a reception is in progress.
    pub fn is_rxing(&self) -> bool {
        self.rxing
    }

    /// Record a new signal starting at `now` and return its descriptor.
    pub fn add(
        &mut self,
        now: SimTime,
        size: u32,
        duration: SimTime,
        rx_power_w: f64,
        preamble: Preamble,
    ) -> SignalEvent {
        let event = SignalEvent {
            size,
            start: now,
            end: now + duration,
            rx_power_w,
            preamble,
        };
        self.append(now, &event);
        event
    }

    fn append(&mut self, now: SimTime, event: &SignalEvent) {
        if !self.rxing {
            let now_pos = self.position(now);
            self.first_power += self.changes[..now_pos].iter().map(|c| c.delta).sum::<f64>();
            self.changes.drain(..now_pos);
            self.changes.insert(0, NiChange::new(event.start, event.rx_power_w));
        } else {
            self.insert_change(NiChange::new(event.start, event.rx_power_w));
        }
        self.insert_change(NiChange::new(event.end, -event.rx_power_w));
    }

    /// Upper bound on time: first index whose entry is strictly after `moment`.
    fn position(&self, moment: SimTime) -> usize {
        self.changes.partition_point(|c| c.time <= moment)
    }

    fn insert_change(&mut self, change: NiChange) {
        let pos = self.position(change.time);
        self.changes.insert(pos, change);
    }

    /// How long total power stays at or above `threshold_w`, counted from `now`.
    pub fn energy_duration(&self, now: SimTime, threshold_w: f64) -> SimTime {
        let mut power = self.first_power;
        let mut end = now;
        for change in &self.changes {
            power += change.delta;
            end = change.time;
            if end < now {
                continue;
            }
            if power < threshold_w {
                break;
            }
        }
        if end > now {
            end - now
        } else {
            SimTime::ZERO
        }
    }

    /// SNR of `signal_w` against the noise floor plus `interference_w`.
    pub fn snr(&self, signal_w: f64, interference_w: f64, bandwidth_hz: u32) -> f64 {
        signal_w / (noise_floor_w(self.noise_figure, bandwidth_hz) + interference_w)
    }

    /// Interference seen by `event`, as a chunk list starting at the event
    /// start with the baseline power and ending with a zero step at its end.
    fn noise_interference(&self, event: &SignalEvent) -> (f64, Vec<NiChange>) {
        assert!(self.rxing, "interference requested without an active reception");
        debug_assert_eq!(self.changes.first().map(|c| c.time), Some(event.start));

        let mut ni = Vec::with_capacity(self.changes.len() + 1);
        ni.push(NiChange::new(event.start, self.first_power));
        for change in self.changes.iter().skip(1) {
            if change.time == event.end && change.delta == -event.rx_power_w {
                break;
            }
            ni.push(*change);
        }
        ni.push(NiChange::new(event.end, 0.0));
        (self.first_power, ni)
    }

    /// Walk the chunk list and test every chunk. Returns true if decodable.
    fn evaluate(&self, event: &SignalEvent, ni: &[NiChange], mut view: StreamView) -> bool {
        let header = Preamble {
            bandwidth_hz: event.preamble.bandwidth_hz,
            ..Preamble::base()
        };
        let payload = &event.preamble;
        let payload_start = ni[0].time + payload.duration;

        let mut previous = ni[0].time;
        let mut interference = ni[0].delta;

        for change in &ni[1..] {
            let current = change.time;
            let header_snr = self.snr(view.header_power, interference, header.bandwidth_hz);
            let payload_snr = self.snr(
                view.payload_power,
                interference + view.payload_noise,
                payload.bandwidth_hz,
            );

            if payload_start > previous && payload_start < current {
                if !chunk_capacity_ok(header_snr, payload_start - previous, &header, None) {
                    return false;
                }
                if !chunk_capacity_ok(payload_snr, current - payload_start, payload, view.budget.as_mut()) {
                    return false;
                }
            } else if payload_start >= current {
                if !chunk_capacity_ok(header_snr, current - previous, &header, None) {
                    return false;
                }
            } else if !chunk_capacity_ok(payload_snr, current - previous, payload, view.budget.as_mut()) {
                return false;
            }

            interference += change.delta;
            previous = current;
        }
        true
    }

    /// Verdict for a single-stream frame.
    pub fn calculate_snr_per(&self, event: &SignalEvent) -> SnrPer {
        let (interference, ni) = self.noise_interference(event);
        let snr = self.snr(event.rx_power_w, interference, event.preamble.bandwidth_hz);
        let ok = self.evaluate(
            event,
            &ni,
            StreamView {
                header_power: event.rx_power_w,
                payload_power: event.rx_power_w,
                payload_noise: 0.0,
                budget: None,
            },
        );
        SnrPer {
            snr,
            per: if ok { 0.0 } else { 1.0 },
        }
    }

    /// Verdict for both streams of a superposed frame.
    ///
    /// The dominant stream is decoded first with the other stream as
    /// interference. The weaker stream is then decoded after cancelling the
    /// dominant one, which only works if the dominant stream was decoded.
    pub fn calculate_snr_per2(&self, event: &SignalEvent) -> SnrPer2 {
        let (interference, ni) = self.noise_interference(event);
        let preamble = &event.preamble;
        let share1 = preamble.power_share;
        let share2 = 1.0 - share1;
        let p = event.rx_power_w;
        let bandwidth = preamble.bandwidth_hz;

        let view = |share: f64, noise: f64, len: u32| StreamView {
            header_power: p,
            payload_power: p * share,
            payload_noise: noise,
            budget: Some(ByteBudget::new(len)),
        };

        let (snr1, snr2, ok1, ok2) = if preamble.first_dominant {
            let noise = p * share2;
            let snr1 = self.snr(p * share1, interference + noise, bandwidth);
            let snr2 = self.snr(p * share2, interference, bandwidth);
            let ok1 = self.evaluate(event, &ni, view(share1, noise, preamble.first_len));
            let ok2 = ok1 && self.evaluate(event, &ni, view(share2, 0.0, preamble.second_len));
            (snr1, snr2, ok1, ok2)
        } else {
            let noise = p * share1;
            let snr1 = self.snr(p * share1, interference, bandwidth);
            let snr2 = self.snr(p * share2, interference + noise, bandwidth);
            let ok2 = self.evaluate(event, &ni, view(share2, noise, preamble.second_len));
            let ok1 = ok2 && self.evaluate(event, &ni, view(share1, 0.0, preamble.first_len));
            (snr1, snr2, ok1, ok2)
        };

        SnrPer2 {
            snr1,
            snr2,
            per1: if ok1 { 0.0 } else { 1.0 },
            per2: if ok2 { 0.0 } else { 1.0 },
        }
    }

    /// Mark the start of a reception.
    pub fn notify_rx_start(&mut self) {
        self.rxing = true;
    }

    /// Mark the end of a reception.
    pub fn notify_rx_end(&mut self) {
        self.rxing = false;
    }

    /// Forget all recorded signals.
    pub fn erase_events(&mut self) {
        self.changes.clear();
        self.rxing = false;
        self.first_power = 0.0;
    }
}
