use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use super::message::ProcessId;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Status {
    Undeliverable,
    Deliverable,
}

/// A multicast message waiting in the delivery queue until its final
/// sequence is agreed and everything ahead of it has been delivered.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct QueuedMessage {
    pub sequence_number: u32,
    pub status: Status,
    pub sender: ProcessId,
    pub msg_id: u32,
    pub data: u32,
    pub proposer: ProcessId,
}

// Heap priority is (sequence_number, proposer), lowest first. The proposer
// tie-break keeps delivery order identical on every process when two
// proposals land on the same sequence number. The (sender, msg_id) tail
// only makes the order total within one process.
impl Ord for QueuedMessage {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.sequence_number, self.proposer, self.sender, self.msg_id).cmp(&(
            other.sequence_number,
            other.proposer,
            other.sender,
            other.msg_id,
        ))
    }
}

impl PartialOrd for QueuedMessage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of undelivered messages, ordered by (sequence_number, proposer).
#[derive(Debug, Default)]
pub struct DeliveryQueue {
    heap: BinaryHeap<Reverse<QueuedMessage>>,
}

impl DeliveryQueue {
    pub fn new() -> Self {
        DeliveryQueue::default()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn push(&mut self, qm: QueuedMessage) {
        self.heap.push(Reverse(qm));
    }

    pub fn contains(&self, sender: ProcessId, msg_id: u32) -> bool {
        self.heap
            .iter()
            .any(|Reverse(qm)| qm.sender == sender && qm.msg_id == msg_id)
    }

    /// Locates the unique entry for (sender, msg_id), rewrites its sequence,
    /// proposer and status, and rebuilds the heap. Returns false when no
    /// entry matches; the caller then has to consult the delivered log.
    pub fn update_sequence_and_status(
        &mut self,
        sender: ProcessId,
        msg_id: u32,
        new_seq: u32,
        new_proposer: ProcessId,
        status: Status,
    ) -> bool {
        let mut entries = std::mem::take(&mut self.heap).into_vec();
        let mut found = false;
        for Reverse(qm) in entries.iter_mut() {
            if qm.sender == sender && qm.msg_id == msg_id {
                qm.sequence_number = new_seq;
                qm.proposer = new_proposer;
                qm.status = status;
                found = true;
                break;
            }
        }
        // Changing a key invalidates the heap property, so rebuild wholesale.
        self.heap = BinaryHeap::from(entries);
        found
    }

    /// Pops deliverable messages off the front until the front is
    /// undeliverable or the queue is empty. Total order is enforced by only
    /// ever delivering front-first.
    pub fn drain_deliverable(&mut self) -> Vec<QueuedMessage> {
        let mut delivered = Vec::new();
        while let Some(Reverse(front)) = self.heap.peek() {
            if front.status != Status::Deliverable {
                break;
            }
            if let Some(Reverse(qm)) = self.heap.pop() {
                delivered.push(qm);
            }
        }
        delivered
    }

    /// Point-in-time copy in priority order, for snapshots and logging.
    pub fn to_sorted_vec(&self) -> Vec<QueuedMessage> {
        let mut entries: Vec<QueuedMessage> = self.heap.iter().map(|r| r.0).collect();
        entries.sort_unstable();
        entries
    }
}
