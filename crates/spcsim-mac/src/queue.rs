//! Bounded outgoing FIFO.

use crate::node_table::NeighborTable;
use spcsim_common::{MacAddress, Packet, SimTime};
use std::collections::VecDeque;

/// One queued packet.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    /// The packet.
    pub packet: Packet,
    /// Link-layer destination.
    pub destination: MacAddress,
    /// When the packet entered the queue.
    pub enqueued_at: SimTime,
}

/// Packets pulled out of the queue to ride along with a head-of-line packet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Aggregate {
    /// Removed packets in queue order.
    pub packets: Vec<Packet>,
    /// Sum of their payload sizes.
    pub bytes: u32,
}

/// Drop-tail FIFO of outgoing packets.
#[derive(Debug, Clone)]
pub struct MacQueue {
    entries: VecDeque<QueueEntry>,
    capacity: usize,
}

impl MacQueue {
    /// Create an empty queue holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        MacQueue {
            entries: VecDeque::new(),
            capacity,
        }
    }

    /// Append a packet. Returns false, leaving the queue untouched, when full.
    ///
    /// Unicast destinations get the payload counted in the neighbor's
    /// measurement window.
    pub fn enqueue(
        &mut self,
        packet: Packet,
        destination: MacAddress,
        now: SimTime,
        table: &mut NeighborTable,
    ) -> bool {
        if self.entries.len() >= self.capacity {
            return false;
        }
        if !destination.is_group() {
            table.add_size(destination, packet.size);
        }
        self.entries.push_back(QueueEntry {
            packet,
            destination,
            enqueued_at: now,
        });
        true
    }

    /// Remove the head of the queue.
    pub fn dequeue(&mut self) -> Option<QueueEntry> {
        self.entries.pop_front()
    }

    /// Look at the head of the queue.
    pub fn peek(&self) -> Option<&QueueEntry> {
        self.entries.front()
    }

    /// Remove the entry carrying packet `uid`.
    pub fn remove(&mut self, uid: u64) -> Option<QueueEntry> {
        let pos = self.entries.iter().position(|e| e.packet.uid == uid)?;
        self.entries.remove(pos)
    }

    /// Drop everything.
    pub fn flush(&mut self) {
        self.entries.clear();
    }

    /// Pull up to `n - 1` packets for `destination` and `port`, scanning the
    /// whole queue in order.
    pub fn aggregate(&mut self, destination: MacAddress, port: u16, n: u32) -> Aggregate {
        let limit = n.saturating_sub(1) as usize;
        let mut taken = Aggregate::default();
        let mut kept = VecDeque::with_capacity(self.entries.len());

        for entry in self.entries.drain(..) {
            if taken.packets.len() < limit
                && entry.destination == destination
                && entry.packet.port == port
            {
                taken.bytes += entry.packet.size;
                taken.packets.push(entry.packet);
            } else {
                kept.push_back(entry);
            }
        }
        self.entries = kept;
        taken
    }

    /// Number of queued entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_with(items: &[(u64, u64, u16, u32)]) -> (MacQueue, NeighborTable) {
        let mut queue = MacQueue::new(400);
        let mut table = NeighborTable::new();
        for &(uid, dest, port, size) in items {
            queue.enqueue(
                Packet::new(uid, port, size),
                MacAddress::from_index(dest),
                SimTime::ZERO,
                &mut table,
            );
        }
        (queue, table)
    }

    #[test]
    fn test_full_queue_drops() {
        let mut queue = MacQueue::new(400);
        let mut table = NeighborTable::new();
        let dest = MacAddress::from_index(2);
        let accepted = (0..401)
            .filter(|&i| queue.enqueue(Packet::new(i, 9, 100), dest, SimTime::ZERO, &mut table))
            .count();
        assert_eq!(accepted, 400);
        assert_eq!(queue.len(), 400);
        assert_eq!(table.get(dest).map(|r| r.window_bytes), Some(40_000));
    }

    #[test]
    fn test_group_destination_not_counted() {
        let mut queue = MacQueue::new(4);
        let mut table = NeighborTable::new();
        queue.enqueue(Packet::new(1, 9, 100), MacAddress::BROADCAST, SimTime::ZERO, &mut table);
        assert!(table.is_empty());
    }

    #[test]
    fn test_aggregate_takes_at_most_n_minus_one() {
        let (mut queue, _) = queue_with(&[
            (1, 2, 9, 100),
            (2, 3, 9, 200),
            (3, 2, 9, 300),
            (4, 2, 7, 400),
            (5, 2, 9, 500),
            (6, 2, 9, 600),
        ]);
        let taken = queue.aggregate(MacAddress::from_index(2), 9, 3);
        assert_eq!(taken.packets.iter().map(|p| p.uid).collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(taken.bytes, 400);
        assert_eq!(queue.len(), 4);
        assert_eq!(queue.peek().map(|e| e.packet.uid), Some(2));
    }

    #[test]
    fn test_aggregate_with_one_takes_nothing() {
        let (mut queue, _) = queue_with(&[(1, 2, 9, 100)]);
        assert_eq!(queue.aggregate(MacAddress::from_index(2), 9, 1), Aggregate::default());
        assert_eq!(queue.aggregate(MacAddress::from_index(2), 9, 0), Aggregate::default());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_remove_and_flush() {
        let (mut queue, _) = queue_with(&[(1, 2, 9, 100), (2, 2, 9, 100)]);
        assert_eq!(queue.remove(2).map(|e| e.packet.uid), Some(2));
        assert!(queue.remove(2).is_none());
        queue.flush();
        assert!(queue.is_empty());
        assert!(queue.dequeue().is_none());
    }
}
