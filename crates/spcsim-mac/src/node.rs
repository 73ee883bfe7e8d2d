//! Node entity wrapping the MAC and its PHY.

use crate::config::MacConfig;
use crate::mac::SpcMac;
use spcsim_common::metric_defs::MetricLabels;
use spcsim_common::{
    Entity, EntityId, Event, EventPayload, MacAddress, Position, SimContext, SimError,
};
use spcsim_phy::PhyConfig;

/// A wireless node: one MAC, one PHY, attached to the shared channel.
///
/// Routes `ReceiveAir` from the channel, `MacTxRequest` from its
/// application and its own timers into the MAC. Deliveries go to the
/// application entity set with [`SpcNode::set_app`].
pub struct SpcNode {
    id: EntityId,
    name: String,
    position: Position,
    mac: SpcMac,
}

impl SpcNode {
    /// Create a node entity.
    pub fn new(
        id: EntityId,
        name: impl Into<String>,
        address: MacAddress,
        position: Position,
        channel: EntityId,
        phy_config: PhyConfig,
        mac_config: MacConfig,
    ) -> Self {
        let name = name.into();
        let mac = SpcMac::new(
            id,
            address,
            channel,
            phy_config,
            mac_config,
            MetricLabels::new(name.clone()),
        );
        SpcNode {
            id,
            name,
            position,
            mac,
        }
    }

    /// Entity that receives `MacRxIndication` events.
    pub fn set_app(&mut self, app: EntityId) {
        self.mac.set_upper(app);
    }

    /// Schedule the node's periodic work. Call once before the run starts.
    pub fn start(&mut self, ctx: &mut SimContext) {
        ctx.set_source(self.id);
        self.mac.start(ctx);
    }

    /// Node name from the scenario.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Static position.
    pub fn position(&self) -> Position {
        self.position
    }

    /// Link-layer address.
    pub fn address(&self) -> MacAddress {
        self.mac.address()
    }

    /// The MAC.
    pub fn mac(&self) -> &SpcMac {
        &self.mac
    }

    /// Mutable access to the MAC.
    pub fn mac_mut(&mut self) -> &mut SpcMac {
        &mut self.mac
    }
}

impl Entity for SpcNode {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        match &event.payload {
            EventPayload::ReceiveAir(rx) => self.mac.handle_receive_air(ctx, rx),
            EventPayload::MacTxRequest(request) => {
                self.mac.enqueue(ctx, request.packet, request.destination)
            }
            EventPayload::Timer { timer_id } => self.mac.handle_timer(ctx, *timer_id, event.id),
            _ => {
                // Ignore other events
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac::{MacState, TIMER_MEASURE};
    use spcsim_common::{MacTxRequestEvent, Packet, SimTime};

    fn node() -> SpcNode {
        SpcNode::new(
            EntityId::new(1),
            "alpha",
            MacAddress::from_index(1),
            Position::new(0.0, 0.0, 0.0),
            EntityId::new(0),
            PhyConfig::default(),
            MacConfig::default(),
        )
    }

    fn event(ctx: &mut SimContext, payload: EventPayload) -> Event {
        Event {
            id: spcsim_common::EventId(ctx.next_event_id()),
            time: ctx.time(),
            source: EntityId::new(9),
            targets: vec![EntityId::new(1)],
            payload,
        }
    }

    #[test]
    fn test_start_schedules_first_measurement() {
        let mut node = node();
        let mut ctx = SimContext::new(42);
        node.start(&mut ctx);
        let pending = ctx.take_pending_events();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].time, SimTime::from_millis(10));
        assert!(matches!(pending[0].payload, EventPayload::Timer { timer_id: TIMER_MEASURE }));
    }

    #[test]
    fn test_tx_request_starts_contention() {
        let mut node = node();
        let mut ctx = SimContext::new(42);
        let request = event(
            &mut ctx,
            EventPayload::MacTxRequest(MacTxRequestEvent {
                destination: MacAddress::from_index(2),
                packet: Packet::new(1, 9, 1500),
            }),
        );
        node.handle_event(&request, &mut ctx).unwrap();
        assert_eq!(node.mac().state(), MacState::AwaitingMedium);
        assert_eq!(node.mac().slot(0).map(|f| f.destination), Some(MacAddress::from_index(2)));
    }

    #[test]
    fn test_unknown_timer_is_ignored() {
        let mut node = node();
        let mut ctx = SimContext::new(42);
        let timer = event(&mut ctx, EventPayload::Timer { timer_id: 99 });
        assert!(node.handle_event(&timer, &mut ctx).is_ok());
        assert_eq!(node.mac().state(), MacState::Idle);
    }
}
