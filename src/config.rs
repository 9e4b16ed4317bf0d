use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{MulticastError, Result};
use crate::multicast::ProcessId;

/// Runtime knobs for one process. `peers` is the full ordered membership,
/// including `self_id`; the ordering must be identical on every process.
#[derive(Debug, Clone)]
pub struct Config {
    pub self_id: ProcessId,
    pub peers: Vec<ProcessId>,
    /// Probability in [0, 1) that an outgoing frame is silently discarded.
    pub drop_rate: f64,
    /// Artificial delay applied before every send.
    pub delay: Duration,
    /// How long a watchdog sleeps between evidence checks.
    pub watchdog_timeout: Duration,
    /// Resend attempts before a peer is presumed dead.
    pub resend_cap: u32,
    /// Inbound frames processed before the receive loop returns.
    pub recv_cap: u64,
}

impl Config {
    pub fn new(self_id: ProcessId, peers: Vec<ProcessId>) -> Self {
        Config {
            self_id,
            peers,
            drop_rate: 0.0,
            delay: Duration::ZERO,
            watchdog_timeout: Duration::from_millis(3000),
            resend_cap: 10,
            recv_cap: u64::MAX,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.drop_rate) {
            return Err(MulticastError::Config(format!(
                "drop_rate {} outside [0, 1)",
                self.drop_rate
            )));
        }
        if self.peers.len() < 2 {
            return Err(MulticastError::Config(
                "membership needs at least two processes".into(),
            ));
        }
        if !self.peers.contains(&self.self_id) {
            return Err(MulticastError::Config(format!(
                "self id {} not in membership",
                self.self_id
            )));
        }
        let mut ids = self.peers.clone();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != self.peers.len() {
            return Err(MulticastError::Config("duplicate process ids".into()));
        }
        Ok(())
    }
}

/// Extracts the process id embedded in a hostname, e.g. "node3" -> 3.
pub fn host_id(name: &str) -> Option<ProcessId> {
    let digits: String = name
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Reads a hostfile (one hostname per line, blank lines ignored) and returns
/// the ordered (id, hostname) membership.
pub fn read_hostfile(path: &Path) -> Result<Vec<(ProcessId, String)>> {
    let text = fs::read_to_string(path)?;
    let mut hosts = Vec::new();
    for line in text.lines() {
        let name = line.trim();
        if name.is_empty() {
            continue;
        }
        let id = host_id(name).ok_or_else(|| {
            MulticastError::Config(format!("hostname {name:?} carries no process id"))
        })?;
        hosts.push((id, name.to_string()));
    }
    Ok(hosts)
}
