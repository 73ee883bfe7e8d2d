//! The shared wireless channel entity.

use crate::propagation::{Endpoint, PropagationDelayModel, PropagationLossModel};
use spcsim_common::{
    Entity, EntityId, Event, EventPayload, Position, ReceiveAirEvent, SimContext, SimError,
    TransmitAirEvent,
};
use std::collections::BTreeMap;
use tracing::trace;

/// Routes transmissions to every other endpoint.
///
/// Receives `TransmitAir` events from node PHYs and posts one `ReceiveAir`
/// per receiver after the propagation delay, carrying the attenuated power.
/// Delivery is unconditional; receivers decide whether they can decode.
pub struct Channel {
    id: EntityId,
    endpoints: BTreeMap<EntityId, Position>,
    loss: Box<dyn PropagationLossModel>,
    delay: Box<dyn PropagationDelayModel>,
}

impl Channel {
    /// Create a channel with the given propagation models.
    pub fn new(
        id: EntityId,
        loss: Box<dyn PropagationLossModel>,
        delay: Box<dyn PropagationDelayModel>,
    ) -> Self {
        Channel {
            id,
            endpoints: BTreeMap::new(),
            loss,
            delay,
        }
    }

    /// Attach a node at a fixed position.
    pub fn add_endpoint(&mut self, node: EntityId, position: Position) {
        self.endpoints.insert(node, position);
    }

    /// Number of attached endpoints.
    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    fn endpoint(&self, id: EntityId) -> Result<Endpoint, SimError> {
        self.endpoints
            .get(&id)
            .map(|position| Endpoint { id, position: *position })
            .ok_or(SimError::InvalidTarget(id))
    }

    /// Fan a transmission out to all endpoints except the sender.
    fn send(&self, tx: &TransmitAirEvent, ctx: &mut SimContext) -> Result<(), SimError> {
        let from = self.endpoint(tx.sender)?;
        for (&id, &position) in &self.endpoints {
            if id == tx.sender {
                continue;
            }
            let to = Endpoint { id, position };
            let delay = self.delay.delay(&from, &to);
            let rx_power_dbm = self.loss.rx_power_dbm(tx.tx_power_dbm, &from, &to);
            trace!(from = from.id.0, to = id.0, rx_power_dbm, delay_ns = delay.as_nanos(), "channel delivery");
            ctx.post_event(
                delay,
                vec![id],
                EventPayload::ReceiveAir(ReceiveAirEvent {
                    sender: tx.sender,
                    frames: tx.frames.clone(),
                    preamble: tx.preamble,
                    rx_power_dbm,
                    duration: tx.duration,
                }),
            );
        }
        Ok(())
    }
}

impl Entity for Channel {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        match &event.payload {
            EventPayload::TransmitAir(tx) => self.send(tx, ctx),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::propagation::{ConstantSpeedDelay, FixedLoss};
    use spcsim_common::{AirFrames, MacAddress, MacFrame, MacHeader, Preamble, SimTime};

    #[test]
    fn test_delivers_to_everyone_but_sender() {
        let mut loss = FixedLoss::new(100.0);
        loss.set(EntityId::new(1), EntityId::new(3), 70.0);
        let mut channel = Channel::new(
            EntityId::new(0),
            Box::new(loss),
            Box::new(ConstantSpeedDelay::default()),
        );
        channel.add_endpoint(EntityId::new(1), Position::new(0.0, 0.0, 0.0));
        channel.add_endpoint(EntityId::new(2), Position::new(299.792458, 0.0, 0.0));
        channel.add_endpoint(EntityId::new(3), Position::new(0.0, 599.584916, 0.0));

        let frame = MacFrame::control(MacHeader::Ack {
            receiver: MacAddress::from_index(2),
            stream: Default::default(),
            duration_us: 0,
        });
        let mut ctx = SimContext::new(42);
        let event = Event {
            id: spcsim_common::EventId(99),
            time: SimTime::ZERO,
            source: EntityId::new(1),
            targets: vec![EntityId::new(0)],
            payload: EventPayload::TransmitAir(TransmitAirEvent {
                sender: EntityId::new(1),
                frames: AirFrames::Single(frame),
                preamble: Preamble::base(),
                tx_power_dbm: 20.0,
                duration: SimTime::from_micros(44),
            }),
        };
        channel.handle_event(&event, &mut ctx).unwrap();

        let posted = ctx.take_pending_events();
        assert_eq!(posted.len(), 2);
        assert_eq!(posted[0].targets, vec![EntityId::new(2)]);
        assert_eq!(posted[0].time, SimTime::from_micros(1));
        assert_eq!(posted[1].targets, vec![EntityId::new(3)]);
        assert_eq!(posted[1].time, SimTime::from_micros(2));
        match &posted[1].payload {
            EventPayload::ReceiveAir(rx) => assert_eq!(rx.rx_power_dbm, -50.0),
            other => panic!("unexpected payload {:?}", other),
        }
    }
}
