//! The SPC MAC state machine.
//!
//! A node holds up to two outgoing frames at a time. When both are unicast
//! frames for different neighbors the MAC tries a superposed exchange
//! (RTS_SPC, two CTS_SPC, DATA_SPC, two ACKs); otherwise it runs plain
//! RTS/CTS/DATA/ACK, or sends DATA without acknowledgement for group
//! destinations and small payloads.

use crate::allocator::{Allocator, BufferPlan, StreamDemand};
use crate::config::{control_preamble, MacConfig, MacTiming};
use crate::node_table::NeighborTable;
use crate::queue::MacQueue;
use rand::Rng;
use spcsim_common::metric_defs::{self, MetricLabels};
use spcsim_common::{
    AirFrames, EntityId, EventId, EventPayload, FrameType, MacAddress, MacFrame, MacHeader,
    MacRxIndicationEvent, Packet, Preamble, ReceiveAirEvent, SimContext, SimTime, StreamIndex,
    TimerSlot, FCS_LENGTH, MAX_DURATION_US,
};
use spcsim_phy::{rssi_from_byte, rssi_to_byte, PhyConfig, PhyEvent, SpcPhy, TIMER_END_RX};
use tracing::{debug, trace, warn};

// ============================================================================
// Timer IDs
// ============================================================================

/// Medium became eligible for a new backoff.
pub const TIMER_BACKOFF_GRANT: u64 = 2;
/// Backoff countdown finished.
pub const TIMER_BACKOFF: u64 = 3;
/// No CTS arrived in time.
pub const TIMER_CTS_TIMEOUT: u64 = 4;
/// No ACK for the first slot.
pub const TIMER_ACK_TIMEOUT_1: u64 = 5;
/// No ACK for the second slot.
pub const TIMER_ACK_TIMEOUT_2: u64 = 6;
/// Deferred CTS or CTS_SPC.
pub const TIMER_SEND_CTS: u64 = 7;
/// Deferred DATA or DATA_SPC after the CTS exchange.
pub const TIMER_SEND_DATA: u64 = 8;
/// Deferred ACK.
pub const TIMER_SEND_ACK: u64 = 9;
/// Neighbor traffic measurement tick.
pub const TIMER_MEASURE: u64 = 10;

// ============================================================================
// State
// ============================================================================

/// Where the MAC is in its transmit cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacState {
    /// Nothing in flight.
    Idle,
    /// Waiting for the backoff grant (medium busy, NAV or reservations).
    AwaitingMedium,
    /// Counting down backoff slots.
    Backoff,
    /// RTS sent, waiting for CTS.
    AwaitingCts,
    /// RTS_SPC sent, waiting for both CTS_SPC.
    AwaitingCtsSpc,
    /// DATA sent, waiting for ACK.
    AwaitingAck,
    /// DATA_SPC sent, waiting for one ACK per stream.
    AwaitingAckSpc,
}

/// Which of the held frames the next attempt carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    /// The first slot, alone.
    First,
    /// The second slot, alone.
    Second,
    /// Both slots superposed.
    Spc,
}

impl SendState {
    fn slot(self) -> usize {
        match self {
            SendState::Second => 1,
            SendState::First | SendState::Spc => 0,
        }
    }
}

/// A frame held for transmission: the head packet plus anything aggregated
/// behind it.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingFrame {
    /// Link-layer destination.
    pub destination: MacAddress,
    /// Application port of the head packet.
    pub port: u16,
    /// Carried packets, head first.
    pub packets: Vec<Packet>,
}

impl PendingFrame {
    fn new(destination: MacAddress, packet: Packet) -> Self {
        PendingFrame {
            destination,
            port: packet.port,
            packets: vec![packet],
        }
    }

    /// Sum of the carried payload sizes.
    pub fn payload_size(&self) -> u32 {
        self.packets.iter().map(|p| p.size).sum()
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingCts {
    frame_type: FrameType,
    originator: MacAddress,
    rssi: u8,
}

#[derive(Debug, Clone, Copy)]
struct PendingAck {
    receiver: MacAddress,
    stream: StreamIndex,
}

#[derive(Debug, Default)]
struct MacTimers {
    backoff_grant: TimerSlot,
    backoff: TimerSlot,
    cts_timeout: TimerSlot,
    ack_timeout: [TimerSlot; 2],
    send_cts: TimerSlot,
    send_data: TimerSlot,
    send_ack: TimerSlot,
    measure: TimerSlot,
}

/// Medium history used to compute access grants.
#[derive(Debug, Clone, Copy, Default)]
struct MediumHistory {
    rx_start: SimTime,
    rx_duration: SimTime,
    rxing: bool,
    busy_start: SimTime,
    busy_duration: SimTime,
    tx_start: SimTime,
    tx_duration: SimTime,
    nav_start: SimTime,
    nav_duration: SimTime,
    ack_timeout_end: SimTime,
    cts_timeout_end: SimTime,
    wait_until: SimTime,
}

impl MediumHistory {
    fn nav_end(&self) -> SimTime {
        self.nav_start + self.nav_duration
    }

    fn send_grant(&self) -> SimTime {
        [
            self.rx_start + self.rx_duration,
            self.tx_start + self.tx_duration,
            self.busy_start + self.busy_duration,
            self.nav_end(),
            self.ack_timeout_end,
            self.cts_timeout_end,
            self.wait_until,
        ]
        .into_iter()
        .max()
        .unwrap_or(SimTime::ZERO)
    }
}

/// NAV field value for a duration, rounded up to whole microseconds.
fn duration_field(duration: SimTime) -> u16 {
    duration
        .as_nanos()
        .div_ceil(1000)
        .min(MAX_DURATION_US as u64) as u16
}

// ============================================================================
// MAC
// ============================================================================

/// Superposition-coding MAC with its PHY, queue and neighbor table.
pub struct SpcMac {
    owner: EntityId,
    address: MacAddress,
    upper: Option<EntityId>,
    config: MacConfig,
    timing: MacTiming,

    phy: SpcPhy,
    queue: MacQueue,
    neighbors: NeighborTable,
    allocator: Allocator,

    state: MacState,
    send_state: SendState,
    slots: [Option<PendingFrame>; 2],
    unicast_fallback: bool,
    aggregated: bool,
    plan: BufferPlan,

    cw: u32,
    rts_retries: u32,
    data_retries: u32,
    cts_received: u8,

    medium: MediumHistory,
    timers: MacTimers,
    pending_cts: Option<PendingCts>,
    pending_ack: Option<PendingAck>,

    metric_labels: MetricLabels,
}

impl SpcMac {
    /// Create a MAC for the node entity `owner`.
    pub fn new(
        owner: EntityId,
        address: MacAddress,
        channel: EntityId,
        phy_config: PhyConfig,
        config: MacConfig,
        metric_labels: MetricLabels,
    ) -> Self {
        let phy = SpcPhy::new(owner, channel, phy_config, metric_labels.clone());
        let allocator = Allocator::new(phy.rx_noise_figure(), config.bandwidth_hz);
        SpcMac {
            owner,
            address,
            upper: None,
            timing: MacTiming::from_config(&config),
            phy,
            queue: MacQueue::new(config.queue_capacity),
            neighbors: NeighborTable::new(),
            allocator,
            state: MacState::Idle,
            send_state: SendState::First,
            slots: [None, None],
            unicast_fallback: false,
            aggregated: false,
            plan: BufferPlan {
                num1: 1,
                num2: 1,
                wait: SimTime::ZERO,
            },
            cw: config.cw_min,
            rts_retries: 0,
            data_retries: 0,
            cts_received: 0,
            medium: MediumHistory::default(),
            timers: MacTimers::default(),
            pending_cts: None,
            pending_ack: None,
            config,
            metric_labels,
        }
    }

    /// Entity that receives delivered packets.
    pub fn set_upper(&mut self, upper: EntityId) {
        self.upper = Some(upper);
    }

    /// Our link-layer address.
    pub fn address(&self) -> MacAddress {
        self.address
    }

    /// Current transmit-cycle state.
    pub fn state(&self) -> MacState {
        self.state
    }

    /// Which held frames the last decision selected.
    pub fn send_state(&self) -> SendState {
        self.send_state
    }

    /// Current contention window.
    pub fn cw(&self) -> u32 {
        self.cw
    }

    /// RTS and DATA retry counters.
    pub fn retries(&self) -> (u32, u32) {
        (self.rts_retries, self.data_retries)
    }

    /// End of the current NAV reservation.
    pub fn nav_end(&self) -> SimTime {
        self.medium.nav_end()
    }

    /// Frame held in slot 0 or 1.
    pub fn slot(&self, index: usize) -> Option<&PendingFrame> {
        self.slots.get(index).and_then(|s| s.as_ref())
    }

    /// Expiry of the ACK timeout for slot 0 or 1.
    pub fn ack_deadline(&self, index: usize) -> Option<SimTime> {
        self.timers.ack_timeout.get(index).and_then(|t| t.expires_at())
    }

    /// The outgoing queue.
    pub fn queue(&self) -> &MacQueue {
        &self.queue
    }

    /// Neighbor statistics.
    pub fn neighbors(&self) -> &NeighborTable {
        &self.neighbors
    }

    /// Mutable neighbor statistics.
    pub fn neighbors_mut(&mut self) -> &mut NeighborTable {
        &mut self.neighbors
    }

    /// The PHY.
    pub fn phy(&self) -> &SpcPhy {
        &self.phy
    }

    /// MAC configuration.
    pub fn config(&self) -> &MacConfig {
        &self.config
    }

    /// Derived timing.
    pub fn timing(&self) -> &MacTiming {
        &self.timing
    }

    /// Start periodic neighbor traffic measurement.
    pub fn start(&mut self, ctx: &mut SimContext) {
        let first = SimTime::from_millis(self.config.first_measure_ms);
        self.timers.measure.schedule(ctx, first, self.owner, TIMER_MEASURE);
    }

    // ========================================================================
    // Upper and lower entry points
    // ========================================================================

    /// Queue a packet from the application and start contending if idle.
    pub fn enqueue(&mut self, ctx: &mut SimContext, packet: Packet, destination: MacAddress) {
        let labels = self.metric_labels.to_labels();
        if !self.queue.enqueue(packet, destination, ctx.time(), &mut self.neighbors) {
            metrics::counter!(metric_defs::QUEUE_OVERFLOW.name, &labels).increment(1);
            debug!(node = %self.address, uid = packet.uid, "queue full, packet dropped");
            return;
        }
        metrics::gauge!(metric_defs::QUEUE_LENGTH.name, &labels).set(self.queue.len() as f64);
        self.resume(ctx);
    }

    /// A signal from the channel reaches this node.
    pub fn handle_receive_air(&mut self, ctx: &mut SimContext, rx: &ReceiveAirEvent) {
        let events = self.phy.start_receive(ctx, rx);
        self.handle_phy_events(ctx, events);
    }

    /// Dispatch a timer addressed to this node. Unknown or stale timers are ignored.
    pub fn handle_timer(&mut self, ctx: &mut SimContext, timer_id: u64, event_id: EventId) {
        match timer_id {
            TIMER_END_RX => {
                let events = self.phy.handle_end_rx(event_id);
                self.handle_phy_events(ctx, events);
            }
            TIMER_BACKOFF_GRANT if self.timers.backoff_grant.fire(event_id) => {
                self.backoff_grant_start(ctx)
            }
            TIMER_BACKOFF if self.timers.backoff.fire(event_id) => self.backoff_timeout(ctx),
            TIMER_CTS_TIMEOUT if self.timers.cts_timeout.fire(event_id) => self.cts_timeout(ctx),
            TIMER_ACK_TIMEOUT_1 if self.timers.ack_timeout[0].fire(event_id) => {
                self.ack_timeout(ctx, 0)
            }
            TIMER_ACK_TIMEOUT_2 if self.timers.ack_timeout[1].fire(event_id) => {
                self.ack_timeout(ctx, 1)
            }
            TIMER_SEND_CTS if self.timers.send_cts.fire(event_id) => self.send_cts(ctx),
            TIMER_SEND_DATA if self.timers.send_data.fire(event_id) => self.send_data_after_cts(ctx),
            TIMER_SEND_ACK if self.timers.send_ack.fire(event_id) => self.send_ack(ctx),
            TIMER_MEASURE if self.timers.measure.fire(event_id) => self.measure_traffic(ctx),
            _ => trace!(node = %self.address, timer_id, "stale timer ignored"),
        }
    }

    /// React to PHY notifications.
    pub fn handle_phy_events(&mut self, ctx: &mut SimContext, events: Vec<PhyEvent>) {
        let now = ctx.time();
        for event in events {
            match event {
                PhyEvent::CcaBusyStart(duration) => {
                    self.medium.busy_start = now;
                    self.medium.busy_duration = duration;
                }
                PhyEvent::TxStart(duration) => {
                    if self.medium.rxing {
                        self.medium.rx_duration = now - self.medium.rx_start;
                        self.medium.rxing = false;
                    }
                    self.medium.tx_start = now;
                    self.medium.tx_duration = duration;
                }
                PhyEvent::RxStart(duration) => {
                    self.medium.rx_start = now;
                    self.medium.rx_duration = duration;
                    self.medium.rxing = true;
                }
                PhyEvent::RxEndOk { frame, rssi_w, stream } => {
                    self.medium.rxing = false;
                    self.receive_ok(ctx, frame, rssi_w, stream);
                }
                PhyEvent::RxEndError { stream } => {
                    self.medium.rxing = false;
                    trace!(node = %self.address, ?stream, "rx error");
                }
            }
        }
    }

    // ========================================================================
    // Reception
    // ========================================================================

    fn receive_ok(&mut self, ctx: &mut SimContext, frame: MacFrame, rssi_w: f64, stream: StreamIndex) {
        let now = ctx.time();
        let header = frame.header;
        trace!(node = %self.address, frame = %header.frame_type(), ?stream, "rx ok");

        if !header.is_addressed_to(self.address) {
            self.set_nav(now, SimTime::from_micros(header.duration_us() as u64));
        }

        let me = self.address;
        let sifs = self.timing.sifs;
        let cts_sas = self.timing.cts_send_and_sifs;
        let ack_sas = self.timing.ack_send_and_sifs;

        match header {
            MacHeader::Rts {
                receiver,
                transmitter,
                ..
            } if receiver == me => {
                self.extend_wait(now + sifs + cts_sas);
                self.schedule_cts(ctx, FrameType::Cts, transmitter, rssi_w, sifs);
            }
            MacHeader::Cts { receiver, rssi, .. } if receiver == me => {
                if self.send_state != SendState::Spc {
                    if let Some(destination) = self.slot(self.send_state.slot()).map(|f| f.destination) {
                        self.neighbors.update_path_loss(destination, rssi_from_byte(rssi));
                    }
                }
                if self.state != MacState::AwaitingCts || !self.timers.cts_timeout.is_pending() {
                    return;
                }
                self.timers.cts_timeout.cancel(ctx);
                self.medium.cts_timeout_end = now + sifs;
                self.timers.send_data.schedule(ctx, sifs, self.owner, TIMER_SEND_DATA);
            }
            MacHeader::Data {
                receiver,
                transmitter,
                duration_us,
            } => {
                if receiver == me && !receiver.is_group() {
                    // A zero duration marks DATA sent without a handshake.
                    if duration_us > 0 {
                        self.schedule_ack(ctx, transmitter, StreamIndex::First, sifs);
                    }
                    self.deliver(ctx, &frame, transmitter, receiver);
                } else if receiver.is_group() {
                    self.deliver(ctx, &frame, transmitter, receiver);
                }
            }
            MacHeader::RtsSpc {
                first,
                second,
                transmitter,
                ..
            } => {
                if first == me {
                    self.extend_wait(now + sifs + cts_sas.times(2));
                    self.schedule_cts(ctx, FrameType::CtsSpc, transmitter, rssi_w, sifs);
                } else if second == me {
                    self.extend_wait(now + sifs + cts_sas.times(2));
                    self.schedule_cts(ctx, FrameType::CtsSpc, transmitter, rssi_w, sifs + cts_sas);
                }
            }
            MacHeader::CtsSpc {
                receiver,
                transmitter,
                rssi,
                ..
            } if receiver == me => {
                if self.state != MacState::AwaitingCtsSpc || !self.timers.cts_timeout.is_pending() {
                    return;
                }
                let expected = self.slots.iter().flatten().any(|f| f.destination == transmitter);
                if !expected {
                    return;
                }
                self.neighbors.update_path_loss(transmitter, rssi_from_byte(rssi));
                self.cts_received += 1;
                debug!(node = %me, from = %transmitter, count = self.cts_received, "CTS_SPC received");
                if self.cts_received == 2 {
                    self.timers.cts_timeout.cancel(ctx);
                    self.medium.cts_timeout_end = now + sifs;
                    self.timers.send_data.schedule(ctx, sifs, self.owner, TIMER_SEND_DATA);
                }
            }
            MacHeader::DataSpc {
                first,
                second,
                transmitter,
                stream,
                ..
            } => {
                let (addressed, delay) = match stream {
                    StreamIndex::First => (first == me, sifs),
                    StreamIndex::Second => (second == me, ack_sas + sifs),
                };
                if addressed {
                    self.extend_wait(now + ack_sas.times(2) + sifs);
                    self.schedule_ack(ctx, transmitter, stream, delay);
                    self.deliver(ctx, &frame, transmitter, me);
                }
            }
            MacHeader::Ack { receiver, stream, .. } if receiver == me => {
                self.receive_ack(ctx, stream);
            }
            _ => {}
        }
    }

    fn receive_ack(&mut self, ctx: &mut SimContext, stream: StreamIndex) {
        let index = match (self.state, stream) {
            (MacState::AwaitingAck, _) => self.send_state.slot(),
            (MacState::AwaitingAckSpc, StreamIndex::First) => 0,
            (MacState::AwaitingAckSpc, StreamIndex::Second) => 1,
            _ => return,
        };
        if !self.timers.ack_timeout[index].is_pending() {
            return;
        }
        self.timers.ack_timeout[index].cancel(ctx);
        self.slots[index] = None;
        debug!(node = %self.address, slot = index, "ACK received");

        if self.state == MacState::AwaitingAckSpc && self.timers.ack_timeout[1 - index].is_pending() {
            return;
        }
        self.finish(ctx);
    }

    fn deliver(&mut self, ctx: &mut SimContext, frame: &MacFrame, source: MacAddress, destination: MacAddress) {
        let labels = self.metric_labels.to_labels();
        metrics::counter!(metric_defs::MAC_DELIVERED_PACKETS.name, &labels)
            .increment(frame.packets.len() as u64);
        metrics::counter!(metric_defs::MAC_DELIVERED_BYTES.name, &labels)
            .increment(frame.payload_size() as u64);
        let Some(upper) = self.upper else {
            return;
        };
        for packet in frame.packets.iter() {
            ctx.post_immediate(
                vec![upper],
                EventPayload::MacRxIndication(MacRxIndicationEvent {
                    source,
                    destination,
                    packet: *packet,
                }),
            );
        }
    }

    fn set_nav(&mut self, now: SimTime, duration: SimTime) {
        if self.medium.nav_end() < now + duration {
            self.medium.nav_start = now;
            self.medium.nav_duration = duration;
        }
    }

    fn extend_wait(&mut self, until: SimTime) {
        self.medium.wait_until = self.medium.wait_until.max(until);
    }

    fn schedule_cts(
        &mut self,
        ctx: &mut SimContext,
        frame_type: FrameType,
        originator: MacAddress,
        rssi_w: f64,
        delay: SimTime,
    ) {
        self.pending_cts = Some(PendingCts {
            frame_type,
            originator,
            rssi: rssi_to_byte(rssi_w),
        });
        self.timers.send_cts.schedule(ctx, delay, self.owner, TIMER_SEND_CTS);
    }

    fn schedule_ack(&mut self, ctx: &mut SimContext, receiver: MacAddress, stream: StreamIndex, delay: SimTime) {
        self.pending_ack = Some(PendingAck { receiver, stream });
        self.timers.send_ack.schedule(ctx, delay, self.owner, TIMER_SEND_ACK);
    }

    // ========================================================================
    // Contention
    // ========================================================================

    fn backoff_grant(&self) -> SimTime {
        self.medium.send_grant() + self.timing.difs
    }

    /// Reset contention after a finished or abandoned exchange.
    fn init_send(&mut self) {
        self.rts_retries = 0;
        self.data_retries = 0;
        self.cw = self.config.cw_min;
        self.unicast_fallback = false;
    }

    fn update_cw(&mut self) {
        self.cw = (2 * (self.cw + 1) - 1).min(self.config.cw_max);
    }

    fn finish(&mut self, ctx: &mut SimContext) {
        self.init_send();
        self.state = MacState::Idle;
        self.resume(ctx);
    }

    /// Pick up held frames or pull a new pair from the queue.
    fn resume(&mut self, ctx: &mut SimContext) {
        if self.state != MacState::Idle || self.timers.backoff_grant.is_pending() {
            return;
        }
        if self.slots.iter().any(Option::is_some) {
            self.backoff_grant_start(ctx);
            return;
        }
        let Some(first) = self.queue.dequeue() else {
            return;
        };
        self.slots[0] = Some(PendingFrame::new(first.destination, first.packet));
        self.slots[1] = self
            .queue
            .dequeue()
            .map(|second| PendingFrame::new(second.destination, second.packet));
        self.aggregated = false;

        let labels = self.metric_labels.to_labels();
        metrics::gauge!(metric_defs::QUEUE_LENGTH.name, &labels).set(self.queue.len() as f64);
        self.backoff_grant_start(ctx);
    }

    fn backoff_grant_start(&mut self, ctx: &mut SimContext) {
        let now = ctx.time();
        let grant = self.backoff_grant();
        if grant <= now {
            self.start_backoff(ctx);
        } else {
            self.state = MacState::AwaitingMedium;
            self.timers
                .backoff_grant
                .schedule(ctx, grant - now, self.owner, TIMER_BACKOFF_GRANT);
        }
    }

    fn start_backoff(&mut self, ctx: &mut SimContext) {
        let slots: u32 = ctx.rng().gen_range(0..=self.cw);
        let mut duration = self.timing.slot.times(slots as u64);
        self.set_send_state();

        if self.cw == self.config.cw_min && self.send_state == SendState::Spc && !self.aggregated {
            self.plan = self.plan_buffers();
            duration = duration.max(self.plan.wait);
        }

        let labels = self.metric_labels.to_labels();
        metrics::histogram!(metric_defs::MAC_BACKOFF_SLOTS.name, &labels).record(slots as f64);
        trace!(node = %self.address, slots, cw = self.cw, duration_us = duration.as_micros(), "backoff");

        self.state = MacState::Backoff;
        self.timers.backoff.schedule(ctx, duration, self.owner, TIMER_BACKOFF);
    }

    fn plan_buffers(&self) -> BufferPlan {
        let demand = |frame: Option<&PendingFrame>| {
            let (destination, packet_size) = frame
                .map(|f| (f.destination, f.packets.first().map(|p| p.size).unwrap_or(0)))
                .unwrap_or((MacAddress::BROADCAST, 0));
            StreamDemand {
                path_loss: self.neighbors.path_loss(destination),
                packet_size,
                traffic: self.neighbors.traffic(destination),
            }
        };
        self.allocator
            .wait_for_buffer(demand(self.slot(0)), demand(self.slot(1)), self.config.aggregation_cap)
    }

    /// Decide between superposed and single transmission for the held frames.
    fn set_send_state(&mut self) {
        self.send_state = match (&self.slots[0], &self.slots[1]) {
            (Some(a), Some(b)) if !self.unicast_fallback => {
                if a.destination.is_group() || b.destination.is_group() || a.destination == b.destination {
                    SendState::First
                } else {
                    SendState::Spc
                }
            }
            (Some(_), _) => SendState::First,
            (None, Some(_)) => SendState::Second,
            (None, None) => SendState::First,
        };
    }

    fn backoff_timeout(&mut self, ctx: &mut SimContext) {
        let now = ctx.time();
        if self.slots.iter().all(Option::is_none) {
            debug!(node = %self.address, "backoff ended with nothing to send");
            self.init_send();
            self.state = MacState::Idle;
            return;
        }
        if self.medium.send_grant() > now {
            self.state = MacState::AwaitingMedium;
            let delay = self.backoff_grant() - now;
            self.timers
                .backoff_grant
                .schedule(ctx, delay, self.owner, TIMER_BACKOFF_GRANT);
            return;
        }

        self.set_send_state();
        match self.send_state {
            SendState::Spc => {
                if !self.aggregated {
                    self.aggregate();
                }
                self.send_rts_spc(ctx);
            }
            SendState::First | SendState::Second => {
                let Some(frame) = self.slot(self.send_state.slot()) else {
                    return;
                };
                if frame.destination.is_group() || frame.payload_size() < self.config.rts_threshold {
                    self.send_data_no_ack(ctx);
                } else {
                    self.send_rts(ctx);
                }
            }
        }
    }

    fn aggregate(&mut self) {
        let counts = [self.plan.num1, self.plan.num2];
        for (slot, count) in self.slots.iter_mut().zip(counts) {
            if let Some(frame) = slot {
                let extra = self.queue.aggregate(frame.destination, frame.port, count);
                frame.packets.extend(extra.packets);
            }
        }
        self.aggregated = true;
        debug!(
            node = %self.address,
            num1 = self.plan.num1,
            num2 = self.plan.num2,
            "aggregated SPC streams"
        );
    }

    // ========================================================================
    // Transmission
    // ========================================================================

    fn transmit(&mut self, ctx: &mut SimContext, frames: AirFrames, preamble: Preamble) {
        let mut labels = self.metric_labels.to_labels();
        labels.push(("frame_type", frames.primary().header.frame_type().as_label().to_string()));
        metrics::counter!(metric_defs::MAC_TX_FRAMES.name, &labels).increment(1);

        let events = self.phy.start_send(ctx, frames, preamble);
        self.handle_phy_events(ctx, events);
    }

    fn transmit_control(&mut self, ctx: &mut SimContext, header: MacHeader) {
        let preamble = control_preamble(&self.config, header.frame_type());
        self.transmit(ctx, AirFrames::Single(MacFrame::control(header)), preamble);
    }

    fn send_rts(&mut self, ctx: &mut SimContext) {
        let Some(destination) = self.slot(self.send_state.slot()).map(|f| f.destination) else {
            return;
        };
        let now = ctx.time();
        let timeout = self.timing.rts_send_and_sifs + self.timing.cts_send_and_sifs;
        self.timers
            .cts_timeout
            .schedule(ctx, timeout, self.owner, TIMER_CTS_TIMEOUT);
        self.medium.cts_timeout_end = now + timeout;
        self.state = MacState::AwaitingCts;

        debug!(node = %self.address, to = %destination, retry = self.rts_retries, "send RTS");
        let header = MacHeader::Rts {
            receiver: destination,
            transmitter: self.address,
            duration_us: duration_field(self.timing.cts_send_and_sifs),
        };
        self.transmit_control(ctx, header);
    }

    fn send_rts_spc(&mut self, ctx: &mut SimContext) {
        let (Some(first), Some(second)) = (self.slot(0), self.slot(1)) else {
            return;
        };
        let (first, second) = (first.destination, second.destination);
        let now = ctx.time();
        self.cts_received = 0;
        let timeout = self.timing.rts_send_and_sifs + self.timing.cts_send_and_sifs.times(2);
        self.timers
            .cts_timeout
            .schedule(ctx, timeout, self.owner, TIMER_CTS_TIMEOUT);
        self.medium.cts_timeout_end = now + timeout;
        self.state = MacState::AwaitingCtsSpc;

        debug!(node = %self.address, %first, %second, retry = self.rts_retries, "send RTS_SPC");
        let header = MacHeader::RtsSpc {
            first,
            second,
            transmitter: self.address,
            duration_us: duration_field(self.timing.cts_send_and_sifs.times(2)),
        };
        self.transmit_control(ctx, header);
    }

    fn send_cts(&mut self, ctx: &mut SimContext) {
        let Some(PendingCts {
            frame_type,
            originator,
            rssi,
        }) = self.pending_cts.take()
        else {
            return;
        };
        let duration_us = duration_field(self.timing.sifs + self.timing.max_propagation);
        let header = match frame_type {
            FrameType::CtsSpc => MacHeader::CtsSpc {
                receiver: originator,
                transmitter: self.address,
                duration_us,
                rssi,
            },
            _ => MacHeader::Cts {
                receiver: originator,
                duration_us,
                rssi,
            },
        };
        trace!(node = %self.address, to = %originator, frame = %frame_type, rssi, "send CTS");
        self.transmit_control(ctx, header);
    }

    fn send_ack(&mut self, ctx: &mut SimContext) {
        let Some(PendingAck { receiver, stream }) = self.pending_ack.take() else {
            return;
        };
        let header = MacHeader::Ack {
            receiver,
            stream,
            duration_us: 0,
        };
        self.transmit_control(ctx, header);
    }

    fn send_data_after_cts(&mut self, ctx: &mut SimContext) {
        match self.state {
            MacState::AwaitingCts => self.send_unicast_data(ctx),
            MacState::AwaitingCtsSpc => self.send_spc_data(ctx),
            _ => {}
        }
    }

    fn send_unicast_data(&mut self, ctx: &mut SimContext) {
        let index = self.send_state.slot();
        let Some((destination, packets)) = self.slot(index).map(|f| (f.destination, f.packets.clone())) else {
            return;
        };
        let now = ctx.time();
        let frame = MacFrame::data(
            MacHeader::Data {
                receiver: destination,
                transmitter: self.address,
                duration_us: duration_field(self.timing.ack_send_and_sifs),
            },
            packets,
        );
        let size = frame.size();
        let rate = match self.neighbors.path_loss(destination) {
            Some(path_loss) => self.allocator.unicast(path_loss, size).rate as u32,
            None => self.config.min_rate,
        };
        let preamble = Preamble::single(rate.max(1), self.config.bandwidth_hz, size);

        let timeout = preamble.tx_duration() + self.timing.max_propagation + self.timing.ack_send_and_sifs;
        self.medium.ack_timeout_end = now + timeout;
        let timer_id = TIMER_ACK_TIMEOUT_1 + index as u64;
        self.timers.ack_timeout[index].schedule(ctx, timeout, self.owner, timer_id);
        self.state = MacState::AwaitingAck;

        debug!(
            node = %self.address,
            to = %destination,
            bytes = size,
            rate,
            retry = self.data_retries,
            "send DATA"
        );
        self.transmit(ctx, AirFrames::Single(frame), preamble);
    }

    fn send_spc_data(&mut self, ctx: &mut SimContext) {
        let (Some(first), Some(second)) = (self.slot(0), self.slot(1)) else {
            self.fall_back_to_unicast(ctx);
            return;
        };
        let (Some(loss1), Some(loss2)) = (
            self.neighbors.path_loss(first.destination),
            self.neighbors.path_loss(second.destination),
        ) else {
            self.fall_back_to_unicast(ctx);
            return;
        };

        let header = |stream| MacHeader::DataSpc {
            first: first.destination,
            second: second.destination,
            transmitter: self.address,
            stream,
            duration_us: duration_field(self.timing.ack_send_and_sifs.times(2)),
        };
        let frame1 = MacFrame::data(header(StreamIndex::First), first.packets.clone());
        let frame2 = MacFrame::data(header(StreamIndex::Second), second.packets.clone());

        let unicast_overhead = FrameType::Data.header_size() + FCS_LENGTH;
        let spc = self.allocator.spc(loss1, loss2, frame1.size(), frame2.size());
        let uni1 = self.allocator.unicast(loss1, first.payload_size() + unicast_overhead);
        let uni2 = self.allocator.unicast(loss2, second.payload_size() + unicast_overhead);
        if spc.time > uni1.time + uni2.time {
            debug!(
                node = %self.address,
                spc_us = spc.time * 1e6,
                unicast_us = (uni1.time + uni2.time) * 1e6,
                "superposition slower than unicast"
            );
            self.fall_back_to_unicast(ctx);
            return;
        }

        let now = ctx.time();
        let preamble = Preamble {
            rate: (spc.rate as u32).max(1),
            bandwidth_hz: self.config.bandwidth_hz,
            power_share: spc.power,
            first_dominant: spc.power >= 0.5,
            symbols: frame1.size().max(frame2.size()),
            first_len: first.payload_size(),
            second_len: second.payload_size(),
            ..Preamble::base()
        };
        let timeout =
            preamble.tx_duration() + self.timing.max_propagation + self.timing.ack_send_and_sifs.times(2);
        self.medium.ack_timeout_end = now + timeout;
        self.timers.ack_timeout[0].schedule(ctx, timeout, self.owner, TIMER_ACK_TIMEOUT_1);
        self.timers.ack_timeout[1].schedule(ctx, timeout, self.owner, TIMER_ACK_TIMEOUT_2);
        self.state = MacState::AwaitingAckSpc;

        let labels = self.metric_labels.to_labels();
        metrics::counter!(metric_defs::MAC_SPC_TRANSMISSIONS.name, &labels).increment(1);
        metrics::histogram!(metric_defs::MAC_SPC_POWER_SPLIT.name, &labels).record(spc.power);
        debug!(
            node = %self.address,
            first = %frame1.header.addr1(),
            second = ?frame1.header.addr2(),
            power = spc.power,
            rate = preamble.rate,
            "send DATA_SPC"
        );
        self.transmit(
            ctx,
            AirFrames::Superposed {
                first: frame1,
                second: frame2,
            },
            preamble,
        );
    }

    fn fall_back_to_unicast(&mut self, ctx: &mut SimContext) {
        let labels = self.metric_labels.to_labels();
        metrics::counter!(metric_defs::MAC_SPC_FALLBACKS.name, &labels).increment(1);
        self.send_state = if self.slots[0].is_some() {
            SendState::First
        } else {
            SendState::Second
        };
        self.state = MacState::AwaitingCts;
        self.send_unicast_data(ctx);
    }

    fn send_data_no_ack(&mut self, ctx: &mut SimContext) {
        let index = self.send_state.slot();
        let Some(pending) = self.slots[index].take() else {
            return;
        };
        let frame = MacFrame::data(
            MacHeader::Data {
                receiver: pending.destination,
                transmitter: self.address,
                duration_us: 0,
            },
            pending.packets,
        );
        let preamble = Preamble::single(self.config.min_rate, self.config.bandwidth_hz, frame.size());
        debug!(node = %self.address, to = %pending.destination, bytes = frame.size(), "send DATA without ACK");
        self.transmit(ctx, AirFrames::Single(frame), preamble);
        self.finish(ctx);
    }

    // ========================================================================
    // Timeouts
    // ========================================================================

    fn drop_slot(&mut self, index: usize, reason: &'static str) {
        let Some(frame) = self.slots[index].take() else {
            return;
        };
        let mut labels = self.metric_labels.to_labels();
        labels.push(("reason", reason.to_string()));
        metrics::counter!(metric_defs::MAC_DROPPED_FRAMES.name, &labels).increment(1);
        warn!(
            node = %self.address,
            to = %frame.destination,
            packets = frame.packets.len(),
            reason,
            "frame dropped"
        );
    }

    fn cts_timeout(&mut self, ctx: &mut SimContext) {
        let labels = self.metric_labels.to_labels();
        metrics::counter!(metric_defs::MAC_CTS_TIMEOUTS.name, &labels).increment(1);

        if self.rts_retries < self.config.max_rts_retries {
            self.rts_retries += 1;
            self.update_cw();
            debug!(node = %self.address, retry = self.rts_retries, cw = self.cw, "CTS timeout");
            self.backoff_grant_start(ctx);
        } else if self.send_state == SendState::Spc {
            self.drop_slot(0, "rts_retries");
            self.drop_slot(1, "rts_retries");
            self.finish(ctx);
        } else {
            self.drop_slot(self.send_state.slot(), "rts_retries");
            self.finish(ctx);
        }
    }

    fn ack_timeout(&mut self, ctx: &mut SimContext, index: usize) {
        let labels = self.metric_labels.to_labels();
        metrics::counter!(metric_defs::MAC_ACK_TIMEOUTS.name, &labels).increment(1);

        if self.state == MacState::AwaitingAckSpc {
            // Both streams share the deadline; the second expiry is folded in here.
            self.timers.ack_timeout[1 - index].cancel(ctx);
            self.init_send();
            self.unicast_fallback = true;
            debug!(node = %self.address, "ACK timeout during SPC, retrying as unicast");
            self.backoff_grant_start(ctx);
            return;
        }

        if self.data_retries < self.config.max_data_retries {
            self.data_retries += 1;
            self.update_cw();
            debug!(node = %self.address, retry = self.data_retries, cw = self.cw, "ACK timeout");
            self.backoff_grant_start(ctx);
        } else {
            self.drop_slot(index, "data_retries");
            self.finish(ctx);
        }
    }

    fn measure_traffic(&mut self, ctx: &mut SimContext) {
        self.neighbors.update_traffic(self.timing.measure_interval);
        self.timers
            .measure
            .schedule(ctx, self.timing.measure_interval, self.owner, TIMER_MEASURE);
    }
}
