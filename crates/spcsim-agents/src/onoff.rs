//! Constant bit rate sender with on/off periods.

use crate::{packet_uid, DEFAULT_PORT};
use serde::{Deserialize, Serialize};
use spcsim_common::metric_defs::{self, MetricLabels};
use spcsim_common::{
    Entity, EntityId, Event, EventPayload, MacAddress, MacTxRequestEvent, Packet, SimContext,
    SimError, SimTime, TimerSlot,
};
use tracing::{debug, warn};

/// Configuration for the on/off sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct OnOffConfig {
    /// Rate while on, in bits per second.
    pub data_rate_bps: u64,
    /// Packet size in bytes.
    pub packet_size: u32,
    /// Destination address.
    pub destination: MacAddress,
    /// Destination application port.
    pub port: u16,
    /// Length of an on period. Zero means always on.
    pub on_s: f64,
    /// Length of an off period.
    pub off_s: f64,
    /// Time the first on period begins.
    pub start_s: f64,
    /// Time after which no packet is generated.
    pub stop_s: Option<f64>,
}

impl Default for OnOffConfig {
    fn default() -> Self {
        OnOffConfig {
            data_rate_bps: 500_000,
            packet_size: 512,
            destination: MacAddress::BROADCAST,
            port: DEFAULT_PORT,
            on_s: 0.0,
            off_s: 0.0,
            start_s: 0.0,
            stop_s: None,
        }
    }
}

impl OnOffConfig {
    /// Gap between packets while on.
    pub fn packet_interval(&self) -> Option<SimTime> {
        if self.data_rate_bps == 0 || self.packet_size == 0 {
            return None;
        }
        Some(SimTime::from_secs(
            self.packet_size as f64 * 8.0 / self.data_rate_bps as f64,
        ))
    }

    fn cycles(&self) -> bool {
        self.on_s > 0.0 && self.off_s > 0.0
    }
}

const TIMER_SEND: u64 = 1;
const TIMER_TOGGLE: u64 = 2;
const TIMER_STOP: u64 = 3;

/// Sends fixed-size packets at a constant rate to one destination.
pub struct OnOffSender {
    id: EntityId,
    node: EntityId,
    config: OnOffConfig,
    interval: Option<SimTime>,
    on: bool,
    stopped: bool,
    send_timer: TimerSlot,
    toggle_timer: TimerSlot,
    stop_timer: TimerSlot,
    packets_sent: u64,
    metric_labels: MetricLabels,
}

impl OnOffSender {
    /// Create a sender attached to the node entity `node`.
    pub fn new(id: EntityId, node: EntityId, node_name: &str, config: OnOffConfig) -> Self {
        OnOffSender {
            id,
            node,
            interval: config.packet_interval(),
            config,
            on: false,
            stopped: false,
            send_timer: TimerSlot::new(),
            toggle_timer: TimerSlot::new(),
            stop_timer: TimerSlot::new(),
            packets_sent: 0,
            metric_labels: MetricLabels::new(node_name),
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &OnOffConfig {
        &self.config
    }

    /// Packets generated so far.
    pub fn packets_sent(&self) -> u64 {
        self.packets_sent
    }

    /// True during an on period.
    pub fn is_on(&self) -> bool {
        self.on
    }

    /// Schedule the first on period and the stop time.
    pub fn start(&mut self, ctx: &mut SimContext) {
        ctx.set_source(self.id);
        if self.interval.is_none() {
            warn!(
                "OnOffSender[{}]: zero rate or packet size, sender disabled",
                self.metric_labels.node
            );
            self.stopped = true;
            return;
        }
        let start = SimTime::from_secs(self.config.start_s.max(0.0));
        self.toggle_timer.schedule(ctx, start, self.id, TIMER_TOGGLE);
        if let Some(stop_s) = self.config.stop_s {
            self.stop_timer
                .schedule(ctx, SimTime::from_secs(stop_s.max(0.0)), self.id, TIMER_STOP);
        }
    }

    fn toggle(&mut self, ctx: &mut SimContext) {
        if self.stopped {
            return;
        }
        self.on = !self.on;
        if self.on {
            self.send_packet(ctx);
            if self.config.cycles() {
                let on = SimTime::from_secs(self.config.on_s);
                self.toggle_timer.schedule(ctx, on, self.id, TIMER_TOGGLE);
            }
        } else {
            self.send_timer.cancel(ctx);
            let off = SimTime::from_secs(self.config.off_s);
            self.toggle_timer.schedule(ctx, off, self.id, TIMER_TOGGLE);
        }
    }

    fn send_packet(&mut self, ctx: &mut SimContext) {
        let Some(interval) = self.interval else {
            return;
        };
        let packet = Packet::new(
            packet_uid(self.id, self.packets_sent),
            self.config.port,
            self.config.packet_size,
        );
        let mut labels = self.metric_labels.to_labels();
        labels.push(("destination", self.config.destination.to_string()));
        metrics::counter!(metric_defs::APP_PACKETS_SENT.name, &labels).increment(1);

        ctx.post_immediate(
            vec![self.node],
            EventPayload::MacTxRequest(MacTxRequestEvent {
                destination: self.config.destination,
                packet,
            }),
        );
        self.packets_sent += 1;
        self.send_timer.schedule(ctx, interval, self.id, TIMER_SEND);
    }
}

impl Entity for OnOffSender {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        if let EventPayload::Timer { timer_id } = &event.payload {
            match *timer_id {
                TIMER_SEND if self.send_timer.fire(event.id) => {
                    if self.on && !self.stopped {
                        self.send_packet(ctx);
                    }
                }
                TIMER_TOGGLE if self.toggle_timer.fire(event.id) => self.toggle(ctx),
                TIMER_STOP if self.stop_timer.fire(event.id) => {
                    debug!("OnOffSender[{}]: stop time reached", self.metric_labels.node);
                    self.stopped = true;
                    self.on = false;
                    self.send_timer.cancel(ctx);
                    self.toggle_timer.cancel(ctx);
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NODE: EntityId = EntityId(1);
    const AGENT: EntityId = EntityId(2);

    /// Drive the sender's timers until `end` and return the request times.
    fn drive(sender: &mut OnOffSender, ctx: &mut SimContext, end: SimTime) -> Vec<SimTime> {
        let mut sent = Vec::new();
        let mut timers: Vec<Event> = Vec::new();
        loop {
            let cancelled = ctx.take_cancelled_events();
            timers.retain(|e| !cancelled.contains(&e.id));
            for event in ctx.take_pending_events() {
                match event.payload {
                    EventPayload::MacTxRequest(_) => sent.push(event.time),
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
            sender.handle_event(&next, ctx).unwrap();
        }
        sent
    }

    #[test]
    fn test_packet_interval() {
        let config = OnOffConfig {
            data_rate_bps: 1_000_000,
            packet_size: 1250,
            ..OnOffConfig::default()
        };
        assert_eq!(config.packet_interval(), Some(SimTime::from_millis(10)));
        let idle = OnOffConfig {
            data_rate_bps: 0,
            ..OnOffConfig::default()
        };
        assert_eq!(idle.packet_interval(), None);
    }

    #[test]
    fn test_always_on_is_constant_rate() {
        let config = OnOffConfig {
            data_rate_bps: 1_000_000,
            packet_size: 1250,
            destination: MacAddress::from_index(2),
            ..OnOffConfig::default()
        };
        let mut sender = OnOffSender::new(AGENT, NODE, "alpha", config);
        let mut ctx = SimContext::new(42);
        sender.start(&mut ctx);
        let sent = drive(&mut sender, &mut ctx, SimTime::from_millis(95));
        assert_eq!(sent.len(), 10);
        assert_eq!(sent[1], SimTime::from_millis(10));
    }

    #[test]
    fn test_off_period_pauses_sending() {
        let config = OnOffConfig {
            data_rate_bps: 1_000_000,
            packet_size: 1250,
            on_s: 0.05,
            off_s: 0.05,
            ..OnOffConfig::default()
        };
        let mut sender = OnOffSender::new(AGENT, NODE, "alpha", config);
        let mut ctx = SimContext::new(42);
        sender.start(&mut ctx);
        let sent = drive(&mut sender, &mut ctx, SimTime::from_millis(195));
        assert!(sent
            .iter()
            .all(|t| !(SimTime::from_millis(51)..SimTime::from_millis(100)).contains(t)));
        assert!(sent.contains(&SimTime::from_millis(100)));
    }
}
