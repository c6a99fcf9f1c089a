//! Outbound FIFO of reliable and unreliable packets awaiting transmission
//! or acknowledgement.
//!
//! Unlike a windowed sender, only the head of the queue is ever a pending
//! retransmission: the Peer Engine retransmits at most once per service
//! cycle (see `peer::engine`), so there is no need for the timeout-bucket
//! or window-size bookkeeping a multi-packet-in-flight sender would need.

use std::collections::VecDeque;

use crate::wire::seq::relative_distance;

/// One queued outbound packet. `reliable`/`unreliable` are assigned at
/// enqueue time and never change; `retransmitted` flips in place once the
/// first transmit attempt has gone out.
#[derive(Debug, Clone)]
pub struct QueuedPacket {
    pub command: u8,
    pub reliable: u16,
    pub unreliable: u16,
    pub is_reliable: bool,
    pub retransmitted: bool,
    pub payload: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct SendQueue {
    queue: VecDeque<QueuedPacket>,
}

impl SendQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn push(&mut self, packet: QueuedPacket) {
        self.queue.push_back(packet);
    }

    pub fn front(&self) -> Option<&QueuedPacket> {
        self.queue.front()
    }

    pub fn front_mut(&mut self) -> Option<&mut QueuedPacket> {
        self.queue.front_mut()
    }

    pub fn pop_front(&mut self) -> Option<QueuedPacket> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Indexed access for the service-cycle transmit walk, which must
    /// advance past an entry it just sent for the first time without
    /// revisiting it later in the same pass — something `front()` alone
    /// can't express once the head stays queued after being sent.
    pub fn get(&self, index: usize) -> Option<&QueuedPacket> {
        self.queue.get(index)
    }

    pub fn mark_retransmitted(&mut self, index: usize) {
        if let Some(entry) = self.queue.get_mut(index) {
            entry.retransmitted = true;
        }
    }

    pub fn remove(&mut self, index: usize) -> Option<QueuedPacket> {
        self.queue.remove(index)
    }

    /// Applies an acknowledgement: drops every queued entry that is
    /// reliable, has already been sent at least once (`retransmitted`),
    /// and whose sequence is covered by `ack`. Stops at the first entry
    /// that fails any of those — in particular this never drops a
    /// reliable packet that hasn't been sent yet, and never looks past an
    /// unreliable entry sitting at the head.
    pub fn drop_acked(&mut self, ack: u16) {
        while let Some(front) = self.queue.front() {
            let covered = front.is_reliable
                && front.retransmitted
                && relative_distance(front.reliable, ack) >= 0;
            if !covered {
                break;
            }
            self.queue.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;

    fn reliable(seq: u16) -> QueuedPacket {
        QueuedPacket {
            command: 0x10,
            reliable: seq,
            unreliable: 0,
            is_reliable: true,
            retransmitted: false,
            payload: Vec::new(),
        }
    }

    fn unreliable(reliable_epoch: u16, seq: u16) -> QueuedPacket {
        QueuedPacket {
            command: 0x10,
            reliable: reliable_epoch,
            unreliable: seq,
            is_reliable: false,
            retransmitted: false,
            payload: Vec::new(),
        }
    }

    #[test]
    fn fifo_order_preserved() {
        let mut q = SendQueue::new();
        q.push(reliable(1));
        q.push(unreliable(1, 1));
        q.push(reliable(2));
        assert_eq!(q.pop_front().unwrap().reliable, 1);
        assert_eq!(q.pop_front().unwrap().unreliable, 1);
        assert_eq!(q.pop_front().unwrap().reliable, 2);
        assert!(q.pop_front().is_none());
    }

    #[test]
    fn ack_does_not_drop_untransmitted_head() {
        let mut q = SendQueue::new();
        q.push(reliable(1));
        q.drop_acked(1);
        assert_eq!(q.front().unwrap().reliable, 1);
    }

    #[test]
    fn ack_drops_sent_reliable_prefix_and_stops_at_unsent() {
        let mut q = SendQueue::new();
        let mut first = reliable(1);
        first.retransmitted = true;
        let mut second = reliable(2);
        second.retransmitted = true;
        let third = reliable(3); // never sent
        q.push(first);
        q.push(second);
        q.push(third);
        q.drop_acked(2);
        assert_eq!(q.front().unwrap().reliable, 3);
    }

    #[test]
    fn ack_stops_at_unreliable_entry() {
        let mut q = SendQueue::new();
        let mut first = reliable(1);
        first.retransmitted = true;
        q.push(first);
        q.push(unreliable(1, 1));
        q.drop_acked(1);
        assert_eq!(q.front().unwrap().unreliable, 1);
    }

    #[test]
    fn ack_handles_sequence_wraparound() {
        let mut q = SendQueue::new();
        let mut first = reliable(65534);
        first.retransmitted = true;
        let mut second = reliable(65535);
        second.retransmitted = true;
        let mut third = reliable(0);
        third.retransmitted = true;
        q.push(first);
        q.push(second);
        q.push(third);
        q.drop_acked(0);
        assert!(q.is_empty());
    }

    #[test]
    fn randomized_prefix_drop_never_leaves_a_sent_entry_covered_by_ack() {
        let mut rng = thread_rng();
        for _ in 0..200 {
            let mut q = SendQueue::new();
            let count: u16 = rng.gen_range(1..50);
            let mut sent_through = 0u16;
            for i in 1..=count {
                let mut p = reliable(i);
                p.retransmitted = rng.gen_bool(0.7) && sent_through + 1 == i;
                if p.retransmitted {
                    sent_through = i;
                }
                q.push(p);
            }
            let ack = rng.gen_range(0..=sent_through.max(1));
            q.drop_acked(ack);
            if let Some(front) = q.front() {
                assert!(!(front.is_reliable
                    && front.retransmitted
                    && relative_distance(front.reliable, ack) >= 0));
            }
        }
    }
}
