//! # spcsim-phy
//!
//! Physical layer for the SPC MAC simulator.
//!
//! This crate provides:
//! - The per-node PHY ([`SpcPhy`]) and its typed notifications ([`PhyEvent`])
//! - PHY state tracking ([`state::PhyStateHelper`])
//! - Interference accounting and capacity-based decoding ([`interference`])
//! - Propagation loss and delay models ([`propagation`])
//! - The shared channel entity ([`channel::Channel`])
//! - Unit conversions and RSSI quantization
//!
//! The PHY is not an entity of its own. It lives inside a node, which routes
//! `ReceiveAir` events and the PHY's end-of-reception timer into it. Each
//! call returns the [`PhyEvent`]s the MAC has to react to.

pub mod channel;
pub mod interference;
pub mod propagation;
pub mod state;

use interference::{InterferenceHelper, SignalEvent};
use serde::{Deserialize, Serialize};
use spcsim_common::metric_defs::{self, MetricLabels};
use spcsim_common::{
    AirFrames, EntityId, EventId, EventPayload, MacFrame, Preamble, ReceiveAirEvent, SimContext,
    SimTime, StreamIndex, TimerSlot, TransmitAirEvent,
};
use state::{PhyState, PhyStateHelper};
use tracing::trace;

pub use channel::Channel;
pub use propagation::{ConstantSpeedDelay, Endpoint, FixedLoss, LogDistanceLoss};

/// Timer ID used by the PHY for end of reception.
pub const TIMER_END_RX: u64 = 1;

// ============================================================================
// Unit Conversions
// ============================================================================

/// Convert dB to a linear ratio.
pub fn db_to_ratio(db: f64) -> f64 {
    10f64.powf(db / 10.0)
}

/// Convert a linear ratio to dB.
pub fn ratio_to_db(ratio: f64) -> f64 {
    10.0 * ratio.log10()
}

/// Convert dBm to W.
pub fn dbm_to_w(dbm: f64) -> f64 {
    10f64.powf(dbm / 10.0) / 1000.0
}

/// Quantize a received power in W to the RSSI byte carried in CTS frames.
///
/// The sample is truncated toward zero and lowered by one dB, so the power
/// recovered by [`rssi_from_byte`] never exceeds what was measured.
pub fn rssi_to_byte(power_w: f64) -> u8 {
    let db = 10.0 * power_w.log10();
    (db.trunc() - 1.0 + 127.0).clamp(0.0, 255.0) as u8
}

/// Recover the received power in W from an RSSI byte.
pub fn rssi_from_byte(rssi: u8) -> f64 {
    10f64.powf((rssi as f64 - 127.0) / 10.0)
}

// ============================================================================
// Configuration
// ============================================================================

/// PHY configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PhyConfig {
    /// Energy detection threshold for starting a reception, in dBm.
    pub ed_threshold_dbm: f64,
    /// Clear channel assessment threshold, in dBm.
    pub cca_threshold_dbm: f64,
    /// Transmit power in dBm.
    pub tx_power_dbm: f64,
    /// Transmit antenna gain in dB.
    pub tx_gain_db: f64,
    /// Receive antenna gain in dB.
    pub rx_gain_db: f64,
    /// Receiver noise figure in dB.
    pub noise_figure_db: f64,
}

impl Default for PhyConfig {
    fn default() -> Self {
        PhyConfig {
            ed_threshold_dbm: -96.0,
            cca_threshold_dbm: -99.0,
            tx_power_dbm: 20.0,
            tx_gain_db: 0.0,
            rx_gain_db: 0.0,
            noise_figure_db: 7.0,
        }
    }
}

// ============================================================================
// PHY → MAC Notifications
// ============================================================================

/// Notifications from the PHY to the MAC.
#[derive(Debug, Clone, PartialEq)]
pub enum PhyEvent {
    /// Energy on the medium for at least this long.
    CcaBusyStart(SimTime),
    /// A transmission of this duration started.
    TxStart(SimTime),
    /// A reception of this duration started.
    RxStart(SimTime),
    /// A frame was decoded.
    RxEndOk {
        /// The decoded frame.
        frame: MacFrame,
        /// Received signal power in W.
        rssi_w: f64,
        /// Which stream of the transmission this frame was.
        stream: StreamIndex,
    },
    /// A frame could not be decoded.
    RxEndError {
        /// Which stream of the transmission failed.
        stream: StreamIndex,
    },
}

// ============================================================================
// PHY
// ============================================================================

struct PendingRx {
    frames: AirFrames,
    signal: SignalEvent,
}

/// Per-node superposition-coding PHY.
pub struct SpcPhy {
    owner: EntityId,
    channel: EntityId,
    config: PhyConfig,
    ed_threshold_w: f64,
    cca_threshold_w: f64,
    state: PhyStateHelper,
    interference: InterferenceHelper,
    end_rx: TimerSlot,
    pending_rx: Option<PendingRx>,
    metric_labels: MetricLabels,
}

impl SpcPhy {
    /// Create a PHY for the node entity `owner`, transmitting into `channel`.
    pub fn new(owner: EntityId, channel: EntityId, config: PhyConfig, metric_labels: MetricLabels) -> Self {
        SpcPhy {
            owner,
            channel,
            ed_threshold_w: dbm_to_w(config.ed_threshold_dbm),
            cca_threshold_w: dbm_to_w(config.cca_threshold_dbm),
            interference: InterferenceHelper::new(db_to_ratio(config.noise_figure_db)),
            config,
            state: PhyStateHelper::new(),
            end_rx: TimerSlot::new(),
            pending_rx: None,
            metric_labels,
        }
    }

    /// PHY configuration.
    pub fn config(&self) -> &PhyConfig {
        &self.config
    }

    /// Current PHY state.
    pub fn state(&self, now: SimTime) -> PhyState {
        self.state.state(now)
    }

    /// The interference ledger.
    pub fn interference(&self) -> &InterferenceHelper {
        &self.interference
    }

    /// Linear receiver noise figure.
    pub fn rx_noise_figure(&self) -> f64 {
        db_to_ratio(self.config.noise_figure_db)
    }

    /// Noise floor in W for a bandwidth.
    pub fn noise_floor_w(&self, bandwidth_hz: u32) -> f64 {
        interference::noise_floor_w(self.rx_noise_figure(), bandwidth_hz)
    }

    /// Put a frame or frame pair on the air. Aborts any ongoing reception.
    pub fn start_send(&mut self, ctx: &mut SimContext, frames: AirFrames, preamble: Preamble) -> Vec<PhyEvent> {
        let now = ctx.time();
        if self.state.state(now) == PhyState::Rx {
            self.end_rx.cancel(ctx);
            self.pending_rx = None;
            self.interference.notify_rx_end();
        }

        let duration = preamble.tx_duration();
        self.state.switch_to_tx(now, duration);

        let labels = self.metric_labels.to_labels();
        metrics::counter!(metric_defs::PHY_TX_AIRTIME.name, &labels).increment(duration.as_micros());
        trace!(
            node = self.owner.0,
            frame = %frames.primary().header.frame_type(),
            rate = preamble.rate,
            duration_us = duration.as_micros(),
            "phy tx start"
        );

        ctx.post_immediate(
            vec![self.channel],
            EventPayload::TransmitAir(TransmitAirEvent {
                sender: self.owner,
                frames,
                preamble,
                tx_power_dbm: self.config.tx_power_dbm + self.config.tx_gain_db,
                duration,
            }),
        );
        vec![PhyEvent::TxStart(duration)]
    }

    /// A signal from the channel reaches this PHY.
    pub fn start_receive(&mut self, ctx: &mut SimContext, rx: &ReceiveAirEvent) -> Vec<PhyEvent> {
        let now = ctx.time();
        let rx_power_w = dbm_to_w(rx.rx_power_dbm + self.config.rx_gain_db);
        let signal = self
            .interference
            .add(now, rx.preamble.symbols, rx.duration, rx_power_w, rx.preamble);

        match self.state.state(now) {
            PhyState::Rx | PhyState::Tx => {
                trace!(node = self.owner.0, rx_power_dbm = rx.rx_power_dbm, "phy busy, signal counted as interference");
            }
            PhyState::Idle | PhyState::CcaBusy => {
                if rx_power_w > self.ed_threshold_w {
                    self.interference.notify_rx_start();
                    self.state.switch_to_rx(now, rx.duration);
                    self.end_rx.schedule(ctx, rx.duration, self.owner, TIMER_END_RX);
                    self.pending_rx = Some(PendingRx {
                        frames: rx.frames.clone(),
                        signal,
                    });
                    trace!(node = self.owner.0, rx_power_dbm = rx.rx_power_dbm, "phy rx start");
                    return vec![PhyEvent::RxStart(rx.duration)];
                }
                trace!(node = self.owner.0, rx_power_dbm = rx.rx_power_dbm, "signal below energy detection");
            }
        }
        self.maybe_cca_busy(now)
    }

    fn maybe_cca_busy(&mut self, now: SimTime) -> Vec<PhyEvent> {
        let busy = self.interference.energy_duration(now, self.cca_threshold_w);
        if busy == SimTime::ZERO {
            return Vec::new();
        }
        self.state.switch_maybe_to_cca_busy(now, busy);
        vec![PhyEvent::CcaBusyStart(busy)]
    }

    /// Handle the end-of-reception timer. Stale firings yield nothing.
    pub fn handle_end_rx(&mut self, event_id: EventId) -> Vec<PhyEvent> {
        if !self.end_rx.fire(event_id) {
            return Vec::new();
        }
        let Some(PendingRx { frames, signal }) = self.pending_rx.take() else {
            return Vec::new();
        };

        let events = match frames {
            AirFrames::Single(frame) => {
                let verdict = self.interference.calculate_snr_per(&signal);
                trace!(node = self.owner.0, snr = verdict.snr, per = verdict.per, "phy rx end");
                vec![self.verdict(frame, verdict.per, signal.rx_power_w, StreamIndex::First)]
            }
            AirFrames::Superposed { first, second } => {
                let verdict = self.interference.calculate_snr_per2(&signal);
                trace!(
                    node = self.owner.0,
                    snr1 = verdict.snr1,
                    per1 = verdict.per1,
                    snr2 = verdict.snr2,
                    per2 = verdict.per2,
                    "phy rx end (superposed)"
                );
                vec![
                    self.verdict(first, verdict.per1, signal.rx_power_w, StreamIndex::First),
                    self.verdict(second, verdict.per2, signal.rx_power_w, StreamIndex::Second),
                ]
            }
        };

        self.interference.notify_rx_end();
        self.state.end_receive();
        events
    }

    fn verdict(&self, frame: MacFrame, per: f64, rssi_w: f64, stream: StreamIndex) -> PhyEvent {
        let labels = self.metric_labels.to_labels();
        if per < 1.0 {
            let mut typed = labels;
            typed.push(("frame_type", frame.header.frame_type().as_label().to_string()));
            metrics::counter!(metric_defs::PHY_RX_OK.name, &typed).increment(1);
            PhyEvent::RxEndOk { frame, rssi_w, stream }
        } else {
            metrics::counter!(metric_defs::PHY_RX_ERROR.name, &labels).increment(1);
            PhyEvent::RxEndError { stream }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spcsim_common::{MacAddress, MacHeader};

    fn ack_frame() -> MacFrame {
        MacFrame::control(MacHeader::Ack {
            receiver: MacAddress::from_index(1),
            stream: StreamIndex::First,
            duration_us: 0,
        })
    }

    fn air(frame: MacFrame, rx_power_dbm: f64) -> ReceiveAirEvent {
        let preamble = Preamble::single(Preamble::BASE_RATE, Preamble::DEFAULT_BANDWIDTH_HZ, frame.size());
        ReceiveAirEvent {
            sender: EntityId::new(7),
            duration: preamble.tx_duration(),
            frames: AirFrames::Single(frame),
            preamble,
            rx_power_dbm,
        }
    }

    fn phy() -> SpcPhy {
        SpcPhy::new(EntityId::new(1), EntityId::new(0), PhyConfig::default(), MetricLabels::new("n1"))
    }

    #[test]
    fn test_rssi_quantization() {
        // 2e-9 W is -86.99 dBW.
        assert_eq!(rssi_to_byte(2e-9), 40);
        assert!(rssi_from_byte(40) < 2e-9);
        assert_eq!(rssi_to_byte(dbm_to_w(-56.5)), 40);
        assert_eq!(rssi_to_byte(0.0), 0);
        assert_eq!(rssi_to_byte(1e30), 255);
    }

    #[test]
    fn test_receive_and_decode() {
        let mut phy = phy();
        let mut ctx = SimContext::new(42);
        let events = phy.start_receive(&mut ctx, &air(ack_frame(), -60.0));
        assert!(matches!(events.as_slice(), [PhyEvent::RxStart(_)]));
        assert_eq!(phy.state(ctx.time()), PhyState::Rx);

        let timer = ctx.take_pending_events().remove(0);
        ctx.set_time(timer.time);
        let events = phy.handle_end_rx(timer.id);
        match events.as_slice() {
            [PhyEvent::RxEndOk { frame, stream, .. }] => {
                assert_eq!(*frame, ack_frame());
                assert_eq!(*stream, StreamIndex::First);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(phy.state(ctx.time()), PhyState::Idle);
    }

    #[test]
    fn test_weak_signal_only_sets_cca_busy() {
        let mut phy = phy();
        let mut ctx = SimContext::new(42);
        let rx = air(ack_frame(), -97.0);
        let events = phy.start_receive(&mut ctx, &rx);
        assert_eq!(events, vec![PhyEvent::CcaBusyStart(rx.duration)]);
        assert_eq!(phy.state(ctx.time()), PhyState::CcaBusy);
        assert!(ctx.take_pending_events().is_empty());
    }

    #[test]
    fn test_transmit_cancels_reception() {
        let mut phy = phy();
        let mut ctx = SimContext::new(42);
        phy.start_receive(&mut ctx, &air(ack_frame(), -60.0));
        let end_rx = ctx.take_pending_events().remove(0);

        ctx.set_time(SimTime::from_micros(5));
        let events = phy.start_send(&mut ctx, AirFrames::Single(ack_frame()), Preamble::base());
        assert!(matches!(events.as_slice(), [PhyEvent::TxStart(_)]));
        assert_eq!(ctx.take_cancelled_events(), vec![end_rx.id]);
        assert!(phy.handle_end_rx(end_rx.id).is_empty());

        let posted = ctx.take_pending_events();
        assert_eq!(posted[0].targets, vec![EntityId::new(0)]);
        assert!(matches!(posted[0].payload, EventPayload::TransmitAir(_)));
    }
}
