use std::collections::BTreeMap;
use std::fmt;

use crate::error::Result;
use crate::multicast::{Message, ProcessId, QueuedMessage};

/// A message observed in flight on a channel while recording. Structured
/// rather than stringly so channel state is queryable in tests.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ChannelEvent {
    Data {
        sender: ProcessId,
        msg_id: u32,
        data: u32,
    },
    Ack {
        sender: ProcessId,
        msg_id: u32,
        proposed_seq: u32,
        proposer: ProcessId,
    },
    Seq {
        sender: ProcessId,
        msg_id: u32,
        final_seq: u32,
        proposer: ProcessId,
    },
}

impl ChannelEvent {
    pub fn from_frame(frame: &[u8]) -> Result<ChannelEvent> {
        Ok(match Message::decode(frame)? {
            Message::Data(m) => ChannelEvent::Data {
                sender: m.sender,
                msg_id: m.msg_id,
                data: m.data,
            },
            Message::Ack(m) => ChannelEvent::Ack {
                sender: m.sender,
                msg_id: m.msg_id,
                proposed_seq: m.proposed_seq,
                proposer: m.proposer,
            },
            Message::Seq(m) => ChannelEvent::Seq {
                sender: m.sender,
                msg_id: m.msg_id,
                final_seq: m.final_seq,
                proposer: m.final_seq_proposer,
            },
        })
    }

    /// The process this event is attributed to when classifying channel
    /// state: the originator for data and sequence messages, the acking
    /// process for acks.
    pub fn origin(&self) -> ProcessId {
        match *self {
            ChannelEvent::Data { sender, .. } => sender,
            ChannelEvent::Ack { proposer, .. } => proposer,
            ChannelEvent::Seq { sender, .. } => sender,
        }
    }
}

impl fmt::Display for ChannelEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ChannelEvent::Data {
                sender,
                msg_id,
                data,
            } => write!(f, "DataMessage: sender {sender}, msg_id {msg_id}, data {data}"),
            ChannelEvent::Ack {
                sender,
                msg_id,
                proposed_seq,
                proposer,
            } => write!(
                f,
                "AckMessage: sender {sender}, msg_id {msg_id}, seq {proposed_seq}, proposer {proposer}"
            ),
            ChannelEvent::Seq {
                sender,
                msg_id,
                final_seq,
                proposer,
            } => write!(
                f,
                "SeqMessage: sender {sender}, msg_id {msg_id}, seq {final_seq}, proposer {proposer}"
            ),
        }
    }
}

/// Copy of the ordering engine's delivery queue and delivered log at a point
/// in logical time. Immutable once taken.
#[derive(Clone, Debug, Default)]
pub struct LocalStateSnapshot {
    pub delivery_queue: Vec<QueuedMessage>,
    pub delivered: Vec<QueuedMessage>,
}

/// One process's share of the consistent cut: its local state plus the
/// recorded per-peer channel states.
#[derive(Clone, Debug)]
pub struct GlobalSnapshot {
    pub process: ProcessId,
    pub local: LocalStateSnapshot,
    pub inbound: BTreeMap<ProcessId, Vec<ChannelEvent>>,
    pub outbound: BTreeMap<ProcessId, Vec<ChannelEvent>>,
}

impl fmt::Display for GlobalSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== snapshot of process {} ===", self.process)?;
        writeln!(f, "delivery queue ({} entries):", self.local.delivery_queue.len())?;
        for qm in &self.local.delivery_queue {
            writeln!(
                f,
                "  seq/proposer ({}, {}), msg_id/sender ({}, {})",
                qm.sequence_number, qm.proposer, qm.msg_id, qm.sender
            )?;
        }
        writeln!(f, "delivered ({} entries):", self.local.delivered.len())?;
        for (i, qm) in self.local.delivered.iter().enumerate() {
            writeln!(
                f,
                "  {i}: seq/proposer ({}, {}), msg_id/sender ({}, {})",
                qm.sequence_number, qm.proposer, qm.msg_id, qm.sender
            )?;
        }
        writeln!(f, "inbound channels:")?;
        for (peer, events) in &self.inbound {
            writeln!(f, "  from {peer}:")?;
            for event in events {
                writeln!(f, "    {event}")?;
            }
        }
        writeln!(f, "outbound channels:")?;
        for (peer, events) in &self.outbound {
            writeln!(f, "  to {peer}:")?;
            for event in events {
                writeln!(f, "    {event}")?;
            }
        }
        Ok(())
    }
}
