//! # spcsim-agents
//!
//! Traffic agents for the SPC MAC simulator.
//!
//! This crate provides:
//!
//! - [`SpcSender`] - Splits an exponential packet stream between two
//!   destinations, sized by a traffic ratio. Two destinations are what let
//!   the MAC pair frames into a superposed transmission.
//!
//! - [`OnOffSender`] - Constant bit rate toward one destination, with
//!   optional on/off periods.
//!
//! - [`PacketSink`] - Counts what the MAC delivers.
//!
//! Agents are entities of their own. They post `MacTxRequest` events to the
//! node they sit on and receive `MacRxIndication` events from it.

pub mod onoff;

pub use onoff::{OnOffConfig, OnOffSender};

use rand::Rng;
use rand_distr::{Distribution, Exp};
use serde::{Deserialize, Serialize};
use spcsim_common::metric_defs::{self, MetricLabels};
use spcsim_common::{
    Entity, EntityId, Event, EventPayload, MacAddress, MacTxRequestEvent, Packet, SimContext,
    SimError, SimTime, TimerSlot,
};
use tracing::{debug, trace, warn};

/// Default application port.
pub const DEFAULT_PORT: u16 = 768;

// ============================================================================
// Configuration Types
// ============================================================================

/// Configuration for the two-destination sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SpcSenderConfig {
    /// Nominal packet size in bytes, split by `traffic_ratio`.
    pub packet_size: u32,
    /// Share of `packet_size` sent to the first destination.
    pub traffic_ratio: f64,
    /// Mean of the exponential inter-arrival time in seconds.
    pub mean_interval_s: f64,
    /// First destination.
    pub destination1: MacAddress,
    /// Second destination.
    pub destination2: MacAddress,
    /// Destination application port.
    pub port: u16,
    /// Time of the first packet.
    pub start_s: f64,
    /// Time after which no packet is generated. Runs until the end if None.
    pub stop_s: Option<f64>,
}

impl Default for SpcSenderConfig {
    fn default() -> Self {
        SpcSenderConfig {
            packet_size: 1500,
            traffic_ratio: 0.5,
            mean_interval_s: 1.0,
            destination1: MacAddress::BROADCAST,
            destination2: MacAddress::BROADCAST,
            port: DEFAULT_PORT,
            start_s: 0.0,
            stop_s: None,
        }
    }
}

impl SpcSenderConfig {
    /// Payload size for the first destination.
    pub fn first_size(&self) -> u32 {
        (self.packet_size as f64 * self.traffic_ratio) as u32
    }

    /// Payload size for the second destination.
    pub fn second_size(&self) -> u32 {
        (self.packet_size as f64 * (1.0 - self.traffic_ratio)) as u32
    }
}

// ============================================================================
// Timer IDs
// ============================================================================

const TIMER_SEND: u64 = 1;
const TIMER_STOP: u64 = 2;

/// Packet uid built from the generating entity and a sequence number.
pub(crate) fn packet_uid(entity: EntityId, seq: u64) -> u64 {
    (entity.0 << 32) | (seq & 0xffff_ffff)
}

// ============================================================================
// SpcSender Entity
// ============================================================================

/// Sender that alternates randomly between two destinations.
///
/// Each packet flips a fair coin: heads goes to `destination1` with
/// `packet_size * traffic_ratio` bytes, tails to `destination2` with the
/// remainder. Gaps between packets are exponential with the configured mean.
pub struct SpcSender {
    id: EntityId,
    node: EntityId,
    config: SpcSenderConfig,
    interval: Option<Exp<f64>>,
    send_timer: TimerSlot,
    stop_timer: TimerSlot,
    stopped: bool,
    packets_sent: [u64; 2],
    bytes_sent: [u64; 2],
    metric_labels: MetricLabels,
}

impl SpcSender {
    /// Create a sender attached to the node entity `node`.
    pub fn new(id: EntityId, node: EntityId, node_name: &str, config: SpcSenderConfig) -> Self {
        let interval = if config.mean_interval_s > 0.0 {
            Exp::new(1.0 / config.mean_interval_s).ok()
        } else {
            None
        };
        SpcSender {
            id,
            node,
            config,
            interval,
            send_timer: TimerSlot::new(),
            stop_timer: TimerSlot::new(),
            stopped: false,
            packets_sent: [0; 2],
            bytes_sent: [0; 2],
            metric_labels: MetricLabels::new(node_name),
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &SpcSenderConfig {
        &self.config
    }

    /// Packets generated per destination.
    pub fn packets_sent(&self) -> [u64; 2] {
        self.packets_sent
    }

    /// Bytes generated per destination.
    pub fn bytes_sent(&self) -> [u64; 2] {
        self.bytes_sent
    }

    /// Schedule the first packet and the stop time.
    pub fn start(&mut self, ctx: &mut SimContext) {
        ctx.set_source(self.id);
        if self.interval.is_none() {
            warn!(
                "SpcSender[{}]: non-positive mean interval {}, sender disabled",
                self.metric_labels.node, self.config.mean_interval_s
            );
            self.stopped = true;
            return;
        }
        let start = SimTime::from_secs(self.config.start_s.max(0.0));
        self.send_timer.schedule(ctx, start, self.id, TIMER_SEND);
        if let Some(stop_s) = self.config.stop_s {
            self.stop_timer
                .schedule(ctx, SimTime::from_secs(stop_s.max(0.0)), self.id, TIMER_STOP);
        }
    }

    fn send_packet(&mut self, ctx: &mut SimContext) {
        if self.stopped {
            return;
        }
        let first = ctx.rng().gen::<f64>() >= 0.5;
        let (index, destination, size) = if first {
            (0, self.config.destination1, self.config.first_size())
        } else {
            (1, self.config.destination2, self.config.second_size())
        };

        let seq = self.packets_sent[0] + self.packets_sent[1];
        let packet = Packet::new(packet_uid(self.id, seq), self.config.port, size);
        trace!(
            "SpcSender[{}]: packet {} of {} bytes to {}",
            self.metric_labels.node,
            packet.uid,
            size,
            destination
        );

        let mut labels = self.metric_labels.to_labels();
        labels.push(("destination", destination.to_string()));
        metrics::counter!(metric_defs::APP_PACKETS_SENT.name, &labels).increment(1);

        ctx.post_immediate(
            vec![self.node],
            EventPayload::MacTxRequest(MacTxRequestEvent {
                destination,
                packet,
            }),
        );
        self.packets_sent[index] += 1;
        self.bytes_sent[index] += size as u64;

        if let Some(interval) = self.interval {
            let gap = interval.sample(ctx.rng());
            self.send_timer
                .schedule(ctx, SimTime::from_secs(gap), self.id, TIMER_SEND);
        }
    }
}

impl Entity for SpcSender {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        if let EventPayload::Timer { timer_id } = &event.payload {
            match *timer_id {
                TIMER_SEND if self.send_timer.fire(event.id) => self.send_packet(ctx),
                TIMER_STOP if self.stop_timer.fire(event.id) => {
                    debug!("SpcSender[{}]: stop time reached", self.metric_labels.node);
                    self.stopped = true;
                    self.send_timer.cancel(ctx);
                }
                _ => {}
            }
        }
        Ok(())
    }
}

// ============================================================================
// PacketSink Entity
// ============================================================================

/// Counts packets the MAC delivers to its node.
pub struct PacketSink {
    id: EntityId,
    port: Option<u16>,
    packets_received: u64,
    bytes_received: u64,
    metric_labels: MetricLabels,
}

impl PacketSink {
    /// Create a sink. With `port` set, only packets for that port count.
    pub fn new(id: EntityId, node_name: &str, port: Option<u16>) -> Self {
        PacketSink {
            id,
            port,
            packets_received: 0,
            bytes_received: 0,
            metric_labels: MetricLabels::new(node_name),
        }
    }

    /// Packets counted so far.
    pub fn packets_received(&self) -> u64 {
        self.packets_received
    }

    /// Bytes counted so far.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }
}

impl Entity for PacketSink {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, _ctx: &mut SimContext) -> Result<(), SimError> {
        if let EventPayload::MacRxIndication(rx) = &event.payload {
            if self.port.is_some_and(|port| port != rx.packet.port) {
                return Ok(());
            }
            self.packets_received += 1;
            self.bytes_received += rx.packet.size as u64;
            metrics::counter!(
                metric_defs::APP_BYTES_RECEIVED.name,
                &self.metric_labels.to_labels()
            )
            .increment(rx.packet.size as u64);
            trace!(
                "PacketSink[{}]: {} bytes from {}",
                self.metric_labels.node,
                rx.packet.size,
                rx.source
            );
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use spcsim_common::MacRxIndicationEvent;

    const NODE: EntityId = EntityId(1);
    const AGENT: EntityId = EntityId(2);

    fn timer_event(id: spcsim_common::EventId, time: SimTime, timer_id: u64) -> Event {
        Event {
            id,
            time,
            source: AGENT,
            targets: vec![AGENT],
            payload: EventPayload::Timer { timer_id },
        }
    }

    /// Run the sender's own timers until `end`, returning the MAC requests.
    fn drive(sender: &mut SpcSender, ctx: &mut SimContext, end: SimTime) -> Vec<MacTxRequestEvent> {
        let mut requests = Vec::new();
        let mut timers: Vec<Event> = Vec::new();
        loop {
            let cancelled = ctx.take_cancelled_events();
            timers.retain(|e| !cancelled.contains(&e.id));
            for event in ctx.take_pending_events() {
                match event.payload {
                    EventPayload::MacTxRequest(req) => requests.push(req),
                    EventPayload::Timer { .. } => timers.push(event),
                    _ => {}
                }
            }
            timers.sort_by_key(|e| (e.time, e.id.0));
            if timers.is_empty() || timers[0].time > end {
                break;
            }
            let next = timers.remove(0);
            ctx.set_time(next.time);
            let EventPayload::Timer { timer_id } = next.payload else {
                continue;
            };
            sender
                .handle_event(&timer_event(next.id, next.time, timer_id), ctx)
                .unwrap();
        }
        requests
    }

    fn config() -> SpcSenderConfig {
        SpcSenderConfig {
            packet_size: 2000,
            traffic_ratio: 0.75,
            mean_interval_s: 0.001,
            destination1: MacAddress::from_index(2),
            destination2: MacAddress::from_index(3),
            ..SpcSenderConfig::default()
        }
    }

    #[test]
    fn test_sizes_follow_ratio() {
        let config = config();
        assert_eq!(config.first_size(), 1500);
        assert_eq!(config.second_size(), 500);
    }

    #[test]
    fn test_sender_splits_between_destinations() {
        let mut sender = SpcSender::new(AGENT, NODE, "alpha", config());
        let mut ctx = SimContext::new(42);
        sender.start(&mut ctx);
        let requests = drive(&mut sender, &mut ctx, SimTime::from_millis(1000));

        // About 1000 packets at a 1 ms mean.
        assert!(requests.len() > 800 && requests.len() < 1200, "{}", requests.len());
        let [first, second] = sender.packets_sent();
        assert_eq!((first + second) as usize, requests.len());
        assert!(first > 350 && second > 350, "{first} / {second}");
        for req in &requests {
            match req.packet.size {
                1500 => assert_eq!(req.destination, MacAddress::from_index(2)),
                500 => assert_eq!(req.destination, MacAddress::from_index(3)),
                size => panic!("unexpected size {size}"),
            }
            assert_eq!(req.packet.port, DEFAULT_PORT);
        }
    }

    #[test]
    fn test_sender_is_deterministic_per_seed() {
        let run = |seed| {
            let mut sender = SpcSender::new(AGENT, NODE, "alpha", config());
            let mut ctx = SimContext::new(seed);
            sender.start(&mut ctx);
            drive(&mut sender, &mut ctx, SimTime::from_millis(50))
                .into_iter()
                .map(|r| (r.destination, r.packet.uid))
                .collect::<Vec<_>>()
        };
        assert_eq!(run(42), run(42));
        assert_ne!(run(42), run(7));
    }

    #[test]
    fn test_sender_honors_stop_time() {
        let mut sender = SpcSender::new(
            AGENT,
            NODE,
            "alpha",
            SpcSenderConfig {
                stop_s: Some(0.01),
                ..config()
            },
        );
        let mut ctx = SimContext::new(42);
        sender.start(&mut ctx);
        let requests = drive(&mut sender, &mut ctx, SimTime::from_millis(1000));
        assert!(!requests.is_empty());
        assert!(requests.len() < 60, "{}", requests.len());
    }

    #[test]
    fn test_zero_interval_disables_sender() {
        let mut sender = SpcSender::new(
            AGENT,
            NODE,
            "alpha",
            SpcSenderConfig {
                mean_interval_s: 0.0,
                ..config()
            },
        );
        let mut ctx = SimContext::new(42);
        sender.start(&mut ctx);
        assert!(ctx.take_pending_events().is_empty());
    }

    #[test]
    fn test_sink_counts_matching_port() {
        let mut sink = PacketSink::new(AGENT, "beta", Some(DEFAULT_PORT));
        let mut ctx = SimContext::new(42);
        for (uid, port, size) in [(1, DEFAULT_PORT, 100), (2, 9, 200), (3, DEFAULT_PORT, 300)] {
            let event = Event {
                id: spcsim_common::EventId(uid),
                time: SimTime::ZERO,
                source: NODE,
                targets: vec![AGENT],
                payload: EventPayload::MacRxIndication(MacRxIndicationEvent {
                    source: MacAddress::from_index(1),
                    destination: MacAddress::from_index(2),
                    packet: Packet::new(uid, port, size),
                }),
            };
            sink.handle_event(&event, &mut ctx).unwrap();
        }
        assert_eq!(sink.packets_received(), 2);
        assert_eq!(sink.bytes_received(), 400);
    }
}
