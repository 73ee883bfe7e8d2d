//! # spcsim-common
//!
//! Common types and traits for the SPC MAC simulator.
//!
//! This crate provides core simulation primitives including:
//! - Time representation ([`SimTime`])
//! - Node placement ([`Position`])
//! - Entity identification ([`EntityId`])
//! - Event system ([`Event`], [`EventPayload`]) with cancellable event tokens
//! - PHY transmission descriptor ([`Preamble`])
//! - Simulation context ([`SimContext`]) and owned timers ([`TimerSlot`])
//! - Entity traits ([`Entity`])
//! - Metric definitions ([`metric_defs`])

pub mod metric_defs;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

// Re-export frame types
pub use spc_frame::{
    AirFrames, FrameType, MacAddress, MacFrame, MacHeader, Packet, StreamIndex, FCS_LENGTH,
    MAX_DURATION_US,
};

// ============================================================================
// Error Types
// ============================================================================

/// Simulation errors.
#[derive(Debug, Error)]
pub enum SimError {
    /// Entity not found.
    #[error("Entity not found: {0:?}")]
    EntityNotFound(EntityId),

    /// Invalid event target.
    #[error("Invalid event target: {0:?}")]
    InvalidTarget(EntityId),

    /// Simulation time overflow.
    #[error("Simulation time overflow")]
    TimeOverflow,

    /// Event handler error.
    #[error("Event handler error in entity {entity:?}: {message}")]
    HandlerError {
        /// Entity that had the error.
        entity: EntityId,
        /// Error message.
        message: String,
    },
}

// ============================================================================
// Time Types
// ============================================================================

/// Simulation time in nanoseconds since simulation start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct SimTime(u64);

impl SimTime {
    /// Zero time.
    pub const ZERO: SimTime = SimTime(0);

    /// Latest representable time.
    pub const MAX: SimTime = SimTime(u64::MAX);

    /// Create from nanoseconds.
    pub fn from_nanos(ns: u64) -> Self {
        SimTime(ns)
    }

    /// Create from microseconds.
    pub fn from_micros(us: u64) -> Self {
        SimTime(us * 1_000)
    }

    /// Create from milliseconds.
    pub fn from_millis(ms: u64) -> Self {
        SimTime(ms * 1_000_000)
    }

    /// Create from seconds (float), rounded to the nearest nanosecond.
    pub fn from_secs(s: f64) -> Self {
        SimTime((s * 1_000_000_000.0).round().max(0.0) as u64)
    }

    /// Get as nanoseconds.
    pub fn as_nanos(&self) -> u64 {
        self.0
    }

    /// Get as microseconds (truncated).
    pub fn as_micros(&self) -> u64 {
        self.0 / 1_000
    }

    /// Get as milliseconds (truncated).
    pub fn as_millis(&self) -> u64 {
        self.0 / 1_000_000
    }

    /// Get as seconds (float).
    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / 1_000_000_000.0
    }

    /// Add duration to time.
    pub fn add(&self, duration: SimTime) -> Option<SimTime> {
        self.0.checked_add(duration.0).map(SimTime)
    }

    /// Subtract duration from time.
    pub fn sub(&self, duration: SimTime) -> Option<SimTime> {
        self.0.checked_sub(duration.0).map(SimTime)
    }

    /// Multiply a duration by an integer count.
    pub fn times(&self, count: u64) -> SimTime {
        SimTime(self.0 * count)
    }
}

impl std::ops::Add for SimTime {
    type Output = SimTime;

    fn add(self, rhs: Self) -> Self::Output {
        SimTime(self.0 + rhs.0)
    }
}

impl std::ops::Sub for SimTime {
    type Output = SimTime;

    fn sub(self, rhs: Self) -> Self::Output {
        SimTime(self.0.saturating_sub(rhs.0))
    }
}

impl std::fmt::Display for SimTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.9}s", self.as_secs_f64())
    }
}

// ============================================================================
// Placement
// ============================================================================

/// Cartesian position in meters.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    /// X coordinate in meters.
    pub x: f64,
    /// Y coordinate in meters.
    pub y: f64,
    /// Z coordinate in meters.
    #[serde(default)]
    pub z: f64,
}

impl Position {
    /// Create a new position.
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Position { x, y, z }
    }

    /// Euclidean distance to another position in meters.
    pub fn distance_to(&self, other: &Position) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

// ============================================================================
// Entity Types
// ============================================================================

/// Unique identifier for an entity in the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub u64);

impl EntityId {
    /// Create a new entity ID.
    pub fn new(id: u64) -> Self {
        EntityId(id)
    }
}

// ============================================================================
// PHY Descriptor
// ============================================================================

/// PHY parameters negotiated for one transmission.
///
/// Built by the MAC for each attempt and copied into every channel delivery.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Preamble {
    /// Payload rate in bytes per second.
    pub rate: u32,
    /// Channel bandwidth in Hz.
    pub bandwidth_hz: u32,
    /// Fixed preamble and PHY header duration.
    pub duration: SimTime,
    /// Share of transmit power given to the first stream (1.0 for unicast).
    pub power_share: f64,
    /// True when the first stream holds the dominant power share and must
    /// be decoded before the second stream can be cancelled out.
    pub first_dominant: bool,
    /// Symbol count in byte units; the longer stream for SPC.
    pub symbols: u32,
    /// Bytes carried by the first stream.
    pub first_len: u32,
    /// Bytes carried by the second stream.
    pub second_len: u32,
}

impl Preamble {
    /// Base rate used for the PHY header and control frames (6 Mb/s).
    pub const BASE_RATE: u32 = 6_000_000 / 8;

    /// Default channel bandwidth in Hz.
    pub const DEFAULT_BANDWIDTH_HZ: u32 = 20_000_000;

    /// Default preamble duration in microseconds.
    pub const DEFAULT_DURATION_US: u64 = 24;

    /// Reference descriptor used for evaluating the PHY header.
    pub fn base() -> Self {
        Preamble {
            rate: Self::BASE_RATE,
            bandwidth_hz: Self::DEFAULT_BANDWIDTH_HZ,
            duration: SimTime::from_micros(Self::DEFAULT_DURATION_US),
            power_share: 1.0,
            first_dominant: false,
            symbols: 0,
            first_len: 0,
            second_len: 0,
        }
    }

    /// Descriptor for a single frame of `size` bytes at `rate`.
    pub fn single(rate: u32, bandwidth_hz: u32, size: u32) -> Self {
        Preamble {
            rate,
            bandwidth_hz,
            symbols: size,
            first_len: size,
            second_len: size,
            ..Self::base()
        }
    }

    /// Time needed to send the payload symbols at the negotiated rate.
    pub fn payload_duration(&self) -> SimTime {
        SimTime::from_secs(self.symbols as f64 / self.rate.max(1) as f64)
    }

    /// Total time on air: payload plus preamble.
    pub fn tx_duration(&self) -> SimTime {
        self.payload_duration() + self.duration
    }
}

impl Default for Preamble {
    fn default() -> Self {
        Self::base()
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Unique identifier for an event. Also serves as its cancellation token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub u64);

/// A simulation event.
#[derive(Debug, Clone)]
pub struct Event {
    /// Unique event ID.
    pub id: EventId,
    /// Time when the event occurs.
    pub time: SimTime,
    /// Entity that created the event.
    pub source: EntityId,
    /// Target entities for the event.
    pub targets: Vec<EntityId>,
    /// Event payload.
    pub payload: EventPayload,
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse ordering for min-heap (earliest time first, then FIFO)
        other.time.cmp(&self.time).then_with(|| other.id.0.cmp(&self.id.0))
    }
}

/// Transmit air event - a PHY starts sending.
/// Directed to the Channel entity, which fans it out to receivers.
#[derive(Debug, Clone)]
pub struct TransmitAirEvent {
    /// Node entity that is transmitting.
    pub sender: EntityId,
    /// Frame or superposed frame pair on the air.
    pub frames: AirFrames,
    /// PHY descriptor for this transmission.
    pub preamble: Preamble,
    /// Radiated power in dBm.
    pub tx_power_dbm: f64,
    /// Time on air.
    pub duration: SimTime,
}

/// Receive air event - Channel delivers the start of a signal to one node.
#[derive(Debug, Clone)]
pub struct ReceiveAirEvent {
    /// Node entity that transmitted.
    pub sender: EntityId,
    /// Frame or superposed frame pair on the air.
    pub frames: AirFrames,
    /// PHY descriptor for this transmission.
    pub preamble: Preamble,
    /// Received power in dBm at this receiver.
    pub rx_power_dbm: f64,
    /// Time on air.
    pub duration: SimTime,
}

/// Application asks the MAC to send a packet.
/// Application → Node event.
#[derive(Debug, Clone)]
pub struct MacTxRequestEvent {
    /// Destination address (may be broadcast).
    pub destination: MacAddress,
    /// The packet to send.
    pub packet: Packet,
}

/// MAC hands a received packet to the application.
/// Node → Application event.
#[derive(Debug, Clone)]
pub struct MacRxIndicationEvent {
    /// Transmitter of the data frame.
    pub source: MacAddress,
    /// Destination the frame was addressed to.
    pub destination: MacAddress,
    /// The delivered packet.
    pub packet: Packet,
}

/// Event payload variants.
#[derive(Debug, Clone)]
pub enum EventPayload {
    // =========== Channel Events ===========
    /// A PHY started transmitting (directed to the Channel entity).
    TransmitAir(TransmitAirEvent),
    /// A signal reaches a receiver (from the Channel entity).
    ReceiveAir(ReceiveAirEvent),

    // =========== Application <-> MAC Events ===========
    /// Application requests transmission.
    MacTxRequest(MacTxRequestEvent),
    /// MAC delivered a packet upward.
    MacRxIndication(MacRxIndicationEvent),

    // =========== Scheduling ===========
    /// A delayed callback.
    Timer {
        /// User-defined timer ID.
        timer_id: u64,
    },

    // =========== Simulation Control ===========
    /// End the simulation.
    SimulationEnd,
}

impl EventPayload {
    /// Short label for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::TransmitAir(_) => "TransmitAir",
            EventPayload::ReceiveAir(_) => "ReceiveAir",
            EventPayload::MacTxRequest(_) => "MacTxRequest",
            EventPayload::MacRxIndication(_) => "MacRxIndication",
            EventPayload::Timer { .. } => "Timer",
            EventPayload::SimulationEnd => "SimulationEnd",
        }
    }
}

// ============================================================================
// Simulation Context
// ============================================================================

/// Context passed to entities during event handling.
///
/// Owns the virtual clock and the seeded RNG. Events posted here are
/// collected by the event loop after each dispatch; cancellations are
/// collected the same way.
pub struct SimContext {
    time: SimTime,
    rng: ChaCha8Rng,
    pending_events: Vec<Event>,
    cancelled_events: Vec<EventId>,
    next_event_id: u64,
    source_entity: EntityId,
}

impl SimContext {
    /// Create a new simulation context.
    pub fn new(seed: u64) -> Self {
        SimContext {
            time: SimTime::ZERO,
            rng: ChaCha8Rng::seed_from_u64(seed),
            pending_events: Vec::new(),
            cancelled_events: Vec::new(),
            next_event_id: 0,
            source_entity: EntityId(0),
        }
    }

    /// Get the current simulation time.
    pub fn time(&self) -> SimTime {
        self.time
    }

    /// Get mutable access to the random number generator.
    pub fn rng(&mut self) -> &mut ChaCha8Rng {
        &mut self.rng
    }

    /// Set the current time (used by event loop).
    pub fn set_time(&mut self, time: SimTime) {
        self.time = time;
    }

    /// Set the source entity (used by event loop).
    pub fn set_source(&mut self, entity: EntityId) {
        self.source_entity = entity;
    }

    /// Entity currently handling an event.
    pub fn source(&self) -> EntityId {
        self.source_entity
    }

    /// Post an event to occur after a delay. Returns its cancellation token.
    pub fn post_event(&mut self, delay: SimTime, targets: Vec<EntityId>, payload: EventPayload) -> EventId {
        let id = EventId(self.next_event_id);
        let event = Event {
            id,
            time: self.time + delay,
            source: self.source_entity,
            targets,
            payload,
        };
        self.next_event_id += 1;
        self.pending_events.push(event);
        id
    }

    /// Post an event to occur immediately (at current time).
    pub fn post_immediate(&mut self, targets: Vec<EntityId>, payload: EventPayload) -> EventId {
        self.post_event(SimTime::ZERO, targets, payload)
    }

    /// Cancel a previously posted event.
    ///
    /// Cancelling an event that already ran is harmless.
    pub fn cancel_event(&mut self, id: EventId) {
        self.cancelled_events.push(id);
    }

    /// Take all pending events (used by event loop).
    pub fn take_pending_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.pending_events)
    }

    /// Take all cancellation tokens (used by event loop).
    pub fn take_cancelled_events(&mut self) -> Vec<EventId> {
        std::mem::take(&mut self.cancelled_events)
    }

    /// Get the next event ID (used by event loop for external event creation).
    pub fn next_event_id(&mut self) -> u64 {
        let id = self.next_event_id;
        self.next_event_id += 1;
        id
    }
}

// ============================================================================
// Timers
// ============================================================================

/// A one-shot timer owned by an entity.
///
/// Holds the token of the scheduled event so it can be cancelled, and
/// recognizes only its own token when the event fires. A callback that was
/// already dispatched after a cancel or reschedule is therefore ignored.
#[derive(Debug, Default, Clone)]
pub struct TimerSlot {
    pending: Option<(EventId, SimTime)>,
}

impl TimerSlot {
    /// Create an idle timer.
    pub fn new() -> Self {
        TimerSlot { pending: None }
    }

    /// Schedule the timer, replacing any pending expiry.
    pub fn schedule(&mut self, ctx: &mut SimContext, delay: SimTime, owner: EntityId, timer_id: u64) {
        self.cancel(ctx);
        let id = ctx.post_event(delay, vec![owner], EventPayload::Timer { timer_id });
        self.pending = Some((id, ctx.time() + delay));
    }

    /// Cancel the timer if it is pending.
    pub fn cancel(&mut self, ctx: &mut SimContext) {
        if let Some((id, _)) = self.pending.take() {
            ctx.cancel_event(id);
        }
    }

    /// True while the timer is scheduled and has not fired.
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Scheduled expiry time, if pending.
    pub fn expires_at(&self) -> Option<SimTime> {
        self.pending.map(|(_, at)| at)
    }

    /// Consume a firing event. Returns false for stale tokens.
    pub fn fire(&mut self, id: EventId) -> bool {
        match self.pending {
            Some((pending, _)) if pending == id => {
                self.pending = None;
                true
            }
            _ => false,
        }
    }
}

// ============================================================================
// Entity Trait
// ============================================================================

/// Base trait for all simulation entities.
pub trait Entity: Send {
    /// Get the entity's unique ID.
    fn entity_id(&self) -> EntityId;

    /// Handle an event.
    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError>;
}

// ============================================================================
// Entity Registry
// ============================================================================

/// Registry for managing simulation entities.
pub struct EntityRegistry {
    entities: HashMap<EntityId, Box<dyn Entity>>,
}

impl EntityRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        EntityRegistry {
            entities: HashMap::new(),
        }
    }

    /// Register an entity.
    pub fn register(&mut self, entity: Box<dyn Entity>) {
        let id = entity.entity_id();
        self.entities.insert(id, entity);
    }

    /// Get an entity by ID.
    pub fn get(&self, id: EntityId) -> Option<&dyn Entity> {
        self.entities.get(&id).map(|e| e.as_ref())
    }

    /// Get a mutable reference to an entity by ID.
    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut Box<dyn Entity>> {
        self.entities.get_mut(&id)
    }

    /// Dispatch an event to its target entities.
    pub fn dispatch_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        for target in &event.targets {
            if let Some(entity) = self.entities.get_mut(target) {
                ctx.set_source(*target);
                entity.handle_event(event, ctx)?;
            } else {
                return Err(SimError::EntityNotFound(*target));
            }
        }
        Ok(())
    }

    /// Get all entity IDs.
    pub fn entity_ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.entities.keys().copied()
    }

    /// Get the number of registered entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl Default for EntityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BinaryHeap;

    #[test]
    fn test_sim_time_conversions() {
        let time = SimTime::from_secs(1.5);
        assert_eq!(time.as_millis(), 1500);
        assert_eq!(time.as_micros(), 1_500_000);
        assert_eq!(time.as_nanos(), 1_500_000_000);
        assert!((time.as_secs_f64() - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_sim_time_arithmetic() {
        let t1 = SimTime::from_micros(100);
        let t2 = SimTime::from_micros(16);
        assert_eq!((t1 + t2).as_micros(), 116);
        assert_eq!((t1 - t2).as_micros(), 84);
        assert_eq!(t2 - t1, SimTime::ZERO);
        assert_eq!(SimTime::from_micros(9).times(3), SimTime::from_micros(27));
    }

    #[test]
    fn test_position_distance() {
        let a = Position::new(0.0, 0.0, 0.0);
        let b = Position::new(30.0, 40.0, 0.0);
        assert!((a.distance_to(&b) - 50.0).abs() < 1e-12);
    }

    #[test]
    fn test_preamble_tx_duration() {
        // 75 bytes at the base rate take 100 us, plus the 24 us preamble.
        let preamble = Preamble::single(Preamble::BASE_RATE, Preamble::DEFAULT_BANDWIDTH_HZ, 75);
        assert_eq!(preamble.tx_duration(), SimTime::from_micros(124));
    }

    #[test]
    fn test_event_ordering_is_time_then_fifo() {
        let mut ctx = SimContext::new(42);
        let late = ctx.post_event(SimTime::from_micros(10), vec![], EventPayload::SimulationEnd);
        let first = ctx.post_event(SimTime::from_micros(5), vec![], EventPayload::SimulationEnd);
        let second = ctx.post_event(SimTime::from_micros(5), vec![], EventPayload::SimulationEnd);

        let mut heap: BinaryHeap<Event> = ctx.take_pending_events().into_iter().collect();
        assert_eq!(heap.pop().map(|e| e.id), Some(first));
        assert_eq!(heap.pop().map(|e| e.id), Some(second));
        assert_eq!(heap.pop().map(|e| e.id), Some(late));
    }

    #[test]
    fn test_timer_slot_ignores_stale_token() {
        let mut ctx = SimContext::new(42);
        let owner = EntityId::new(1);
        let mut slot = TimerSlot::new();

        slot.schedule(&mut ctx, SimTime::from_micros(10), owner, 7);
        let stale = ctx.take_pending_events()[0].id;
        slot.schedule(&mut ctx, SimTime::from_micros(20), owner, 7);
        let fresh = ctx.take_pending_events()[0].id;

        assert_eq!(ctx.take_cancelled_events(), vec![stale]);
        assert_eq!(slot.expires_at(), Some(SimTime::from_micros(20)));
        assert!(!slot.fire(stale));
        assert!(slot.is_pending());
        assert!(slot.fire(fresh));
        assert!(!slot.is_pending());
    }
}
