//! PHY state tracking.

use spcsim_common::SimTime;

/// Observable PHY state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhyState {
    /// Medium idle.
    Idle,
    /// Energy above the CCA threshold but no frame being received.
    CcaBusy,
    /// Receiving a frame.
    Rx,
    /// Transmitting.
    Tx,
}

/// Derives the PHY state from recorded end times.
///
/// TX wins over RX, RX wins over CCA busy. Nothing is stored as an explicit
/// state so an expired period needs no cleanup event.
#[derive(Debug, Clone, Default)]
pub struct PhyStateHelper {
    start_tx: SimTime,
    end_tx: SimTime,
    start_rx: SimTime,
    end_rx: SimTime,
    start_cca_busy: SimTime,
    end_cca_busy: SimTime,
    rxing: bool,
}

impl PhyStateHelper {
    /// Create a helper in the idle state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state at `now`.
    pub fn state(&self, now: SimTime) -> PhyState {
        if self.end_tx > now {
            PhyState::Tx
        } else if self.rxing {
            PhyState::Rx
        } else if self.end_cca_busy > now {
            PhyState::CcaBusy
        } else {
            PhyState::Idle
        }
    }

    /// True when the PHY is idle.
    pub fn is_idle(&self, now: SimTime) -> bool {
        self.state(now) == PhyState::Idle
    }

    /// Extend the CCA busy period to at least `now + duration`.
    pub fn switch_maybe_to_cca_busy(&mut self, now: SimTime, duration: SimTime) {
        if self.state(now) != PhyState::CcaBusy {
            self.start_cca_busy = now;
        }
        self.end_cca_busy = self.end_cca_busy.max(now + duration);
    }

    /// Enter TX. An ongoing reception is truncated; the caller cancels it.
    pub fn switch_to_tx(&mut self, now: SimTime, duration: SimTime) {
        if self.state(now) == PhyState::Rx {
            self.rxing = false;
            self.end_rx = now;
        }
        self.start_tx = now;
        self.end_tx = now + duration;
    }

    /// Enter RX.
    pub fn switch_to_rx(&mut self, now: SimTime, duration: SimTime) {
        let state = self.state(now);
        assert!(
            matches!(state, PhyState::Idle | PhyState::CcaBusy),
            "reception started in state {:?}",
            state
        );
        self.rxing = true;
        self.start_rx = now;
        self.end_rx = now + duration;
    }

    /// Leave RX after the end-of-reception verdict.
    pub fn end_receive(&mut self) {
        self.rxing = false;
    }

    /// End of the last transmission.
    pub fn tx_end(&self) -> SimTime {
        self.end_tx
    }

    /// End of the last CCA busy period.
    pub fn cca_busy_end(&self) -> SimTime {
        self.end_cca_busy
    }

    /// Start of the current or last reception.
    pub fn rx_start(&self) -> SimTime {
        self.start_rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tx_overrides_rx() {
        let mut helper = PhyStateHelper::new();
        let t0 = SimTime::from_micros(10);
        helper.switch_to_rx(t0, SimTime::from_micros(100));
        assert_eq!(helper.state(t0), PhyState::Rx);

        let t1 = SimTime::from_micros(20);
        helper.switch_to_tx(t1, SimTime::from_micros(50));
        assert_eq!(helper.state(t1), PhyState::Tx);
        // Reception was cancelled, so the PHY is idle once TX ends.
        assert_eq!(helper.state(SimTime::from_micros(70)), PhyState::Idle);
    }

    #[test]
    fn test_cca_busy_only_extends() {
        let mut helper = PhyStateHelper::new();
        helper.switch_maybe_to_cca_busy(SimTime::ZERO, SimTime::from_micros(40));
        helper.switch_maybe_to_cca_busy(SimTime::from_micros(10), SimTime::from_micros(5));
        assert_eq!(helper.cca_busy_end(), SimTime::from_micros(40));
        assert_eq!(helper.state(SimTime::from_micros(39)), PhyState::CcaBusy);
        assert_eq!(helper.state(SimTime::from_micros(40)), PhyState::Idle);
    }
}
