//! Total-order reliable multicast among a fixed set of processes, with a
//! Chandy-Lamport global snapshot layered on top.
//!
//! Every process multicasts data messages to all peers and collects one
//! proposed sequence number (an ack) from each of them. The highest proposal
//! wins, is broadcast back as the final sequence, and every process delivers
//! messages in final-sequence order. Lost messages are recovered by per-peer
//! watchdog retransmission; duplicates are answered idempotently.
//!
//! The snapshot coordinator runs the marker-passing algorithm over a side
//! channel and taps the engine's send/receive paths to capture in-flight
//! channel state without disturbing the base protocol.

pub mod config;
pub mod error;
pub mod multicast;
pub mod snapshot;
pub mod transport;

pub use config::Config;
pub use error::{MulticastError, Result};
