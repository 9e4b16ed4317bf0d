use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{MulticastError, Result};

pub type ProcessId = u32;

pub const DATAMSG_TAG: u32 = 1;
pub const ACKMSG_TAG: u32 = 2;
pub const SEQMSG_TAG: u32 = 3;

pub const DATA_WIRE_SIZE: usize = 16;
pub const ACK_WIRE_SIZE: usize = 20;
pub const SEQ_WIRE_SIZE: usize = 20;
/// Largest frame any peer will ever send on the multicast channel.
pub const MAX_WIRE_SIZE: usize = 20;

/// Payload multicast by an originator to every peer.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DataMessage {
    pub sender: ProcessId,
    pub msg_id: u32,
    pub data: u32,
}

/// One peer's proposed sequence number for a data message, sent back to the
/// originator. `sender` is the originator of the data message; `proposer` is
/// the acking process.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct AckMessage {
    pub sender: ProcessId,
    pub msg_id: u32,
    pub proposed_seq: u32,
    pub proposer: ProcessId,
}

/// The agreed final sequence for a data message, broadcast once by whichever
/// process collected the full set of acks.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SeqMessage {
    pub sender: ProcessId,
    pub msg_id: u32,
    pub final_seq: u32,
    pub final_seq_proposer: ProcessId,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Message {
    Data(DataMessage),
    Ack(AckMessage),
    Seq(SeqMessage),
}

impl DataMessage {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(DATA_WIRE_SIZE);
        buf.put_u32(DATAMSG_TAG);
        buf.put_u32(self.sender);
        buf.put_u32(self.msg_id);
        buf.put_u32(self.data);
        buf.freeze()
    }
}

impl AckMessage {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(ACK_WIRE_SIZE);
        buf.put_u32(ACKMSG_TAG);
        buf.put_u32(self.sender);
        buf.put_u32(self.msg_id);
        buf.put_u32(self.proposed_seq);
        buf.put_u32(self.proposer);
        buf.freeze()
    }
}

impl SeqMessage {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(SEQ_WIRE_SIZE);
        buf.put_u32(SEQMSG_TAG);
        buf.put_u32(self.sender);
        buf.put_u32(self.msg_id);
        buf.put_u32(self.final_seq);
        buf.put_u32(self.final_seq_proposer);
        buf.freeze()
    }
}

impl Message {
    pub fn encode(&self) -> Bytes {
        match self {
            Message::Data(m) => m.encode(),
            Message::Ack(m) => m.encode(),
            Message::Seq(m) => m.encode(),
        }
    }

    /// Decodes one frame, routing on the leading tag. Field decoding itself
    /// is total; the only failure cases are an unknown tag or a short frame.
    pub fn decode(frame: &[u8]) -> Result<Message> {
        let mut buf = need(frame, 4)?;
        let tag = buf.get_u32();
        match tag {
            DATAMSG_TAG => {
                let mut buf = &need(frame, DATA_WIRE_SIZE)?[4..];
                Ok(Message::Data(DataMessage {
                    sender: buf.get_u32(),
                    msg_id: buf.get_u32(),
                    data: buf.get_u32(),
                }))
            }
            ACKMSG_TAG => {
                let mut buf = &need(frame, ACK_WIRE_SIZE)?[4..];
                Ok(Message::Ack(AckMessage {
                    sender: buf.get_u32(),
                    msg_id: buf.get_u32(),
                    proposed_seq: buf.get_u32(),
                    proposer: buf.get_u32(),
                }))
            }
            SEQMSG_TAG => {
                let mut buf = &need(frame, SEQ_WIRE_SIZE)?[4..];
                Ok(Message::Seq(SeqMessage {
                    sender: buf.get_u32(),
                    msg_id: buf.get_u32(),
                    final_seq: buf.get_u32(),
                    final_seq_proposer: buf.get_u32(),
                }))
            }
            other => Err(MulticastError::UnknownTag(other)),
        }
    }
}

fn need(frame: &[u8], len: usize) -> Result<&[u8]> {
    if frame.len() < len {
        return Err(MulticastError::ShortFrame {
            got: frame.len(),
            need: len,
        });
    }
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_round_trip() {
        let data = Message::Data(DataMessage {
            sender: 3,
            msg_id: 17,
            data: 42,
        });
        let ack = Message::Ack(AckMessage {
            sender: 3,
            msg_id: 17,
            proposed_seq: 9,
            proposer: 2,
        });
        let seq = Message::Seq(SeqMessage {
            sender: 3,
            msg_id: 17,
            final_seq: 11,
            final_seq_proposer: 1,
        });
        for msg in [data, ack, seq] {
            assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
        }
    }

    #[test]
    fn test_wire_layout_is_fixed() {
        let frame = DataMessage {
            sender: 1,
            msg_id: 2,
            data: 3,
        }
        .encode();
        assert_eq!(frame.len(), DATA_WIRE_SIZE);
        // big-endian u32 fields, tag first
        assert_eq!(&frame[..], &[0, 0, 0, 1, 0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0, 3]);

        let frame = AckMessage {
            sender: 1,
            msg_id: 2,
            proposed_seq: 3,
            proposer: 4,
        }
        .encode();
        assert_eq!(frame.len(), ACK_WIRE_SIZE);
        assert_eq!(frame[3], ACKMSG_TAG as u8);
        assert_eq!(frame[19], 4);
    }

    #[test]
    fn test_decode_rejects_unknown_tag() {
        let mut frame = SeqMessage {
            sender: 0,
            msg_id: 0,
            final_seq: 0,
            final_seq_proposer: 0,
        }
        .encode()
        .to_vec();
        frame[3] = 9;
        assert!(matches!(
            Message::decode(&frame),
            Err(MulticastError::UnknownTag(9))
        ));
    }

    #[test]
    fn test_decode_rejects_short_frame() {
        let frame = AckMessage {
            sender: 1,
            msg_id: 2,
            proposed_seq: 3,
            proposer: 4,
        }
        .encode();
        assert!(matches!(
            Message::decode(&frame[..12]),
            Err(MulticastError::ShortFrame { got: 12, need: 20 })
        ));
    }
}
