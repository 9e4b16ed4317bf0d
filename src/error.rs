use std::io;

use thiserror::Error;

use crate::multicast::ProcessId;

pub type Result<T> = std::result::Result<T, MulticastError>;

#[derive(Debug, Error)]
pub enum MulticastError {
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("unknown message tag {0}")]
    UnknownTag(u32),

    #[error("frame too short: got {got} bytes, need {need}")]
    ShortFrame { got: usize, need: usize },

    #[error("sequence finalization for unknown message (sender {sender}, msg_id {msg_id})")]
    SequenceForUnknownMessage { sender: ProcessId, msg_id: u32 },

    #[error("no sequence broadcast recorded for message (sender {sender}, msg_id {msg_id})")]
    MissingSequenceRecord { sender: ProcessId, msg_id: u32 },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl MulticastError {
    /// True for errors after which the local protocol state can no longer be
    /// trusted. The receive loop aborts on these and continues on the rest.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MulticastError::UnknownTag(_)
                | MulticastError::ShortFrame { .. }
                | MulticastError::SequenceForUnknownMessage { .. }
                | MulticastError::MissingSequenceRecord { .. }
        )
    }
}
