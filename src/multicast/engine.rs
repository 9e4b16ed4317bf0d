use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::message::{AckMessage, DataMessage, Message, ProcessId, SeqMessage};
use super::peers::Peers;
use super::queue::{DeliveryQueue, QueuedMessage, Status};
use crate::config::Config;
use crate::error::{MulticastError, Result};
use crate::snapshot::LocalStateSnapshot;
use crate::transport::Transport;

/// Result of one pass through the drop/delay send path. A simulated drop is
/// success from the sender's perspective; only the watchdogs notice.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SendOutcome {
    Sent,
    Dropped,
}

/// The ordering engine. All protocol state lives behind internal locks;
/// cross-component access goes through copy-returning accessors only.
///
/// Cheap to clone; clones share state.
pub struct MulticastEngine<T: Transport> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport> Clone for MulticastEngine<T> {
    fn clone(&self) -> Self {
        MulticastEngine {
            shared: Arc::clone(&self.shared),
        }
    }
}

struct Shared<T: Transport> {
    cfg: Config,
    peers: Peers,
    transport: T,
    next_msg_id: AtomicU32,
    next_seq: AtomicU32,
    queue: Mutex<DeliveryQueue>,
    delivered: Mutex<Vec<QueuedMessage>>,
    /// msg_id -> proposer -> proposed sequence, for messages we originated.
    ack_history: Mutex<HashMap<u32, HashMap<ProcessId, u32>>>,
    seq_history: Mutex<Vec<SeqMessage>>,
    /// Acks we have sent, kept so duplicate data messages get the identical
    /// ack back.
    already_acked: Mutex<Vec<AckMessage>>,
    recording: AtomicBool,
    captured_in: Mutex<Vec<Bytes>>,
    captured_out: Mutex<Vec<Bytes>>,
    shutdown: watch::Sender<bool>,
}

fn locked<U>(mutex: &Mutex<U>) -> MutexGuard<'_, U> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl<T: Transport> MulticastEngine<T> {
    pub fn new(cfg: Config, transport: T) -> Result<MulticastEngine<T>> {
        cfg.validate()?;
        let peers = Peers::new(cfg.peers.clone(), cfg.self_id);
        let (shutdown, _) = watch::channel(false);
        Ok(MulticastEngine {
            shared: Arc::new(Shared {
                cfg,
                peers,
                transport,
                next_msg_id: AtomicU32::new(1),
                next_seq: AtomicU32::new(1),
                queue: Mutex::new(DeliveryQueue::new()),
                delivered: Mutex::new(Vec::new()),
                ack_history: Mutex::new(HashMap::new()),
                seq_history: Mutex::new(Vec::new()),
                already_acked: Mutex::new(Vec::new()),
                recording: AtomicBool::new(false),
                captured_in: Mutex::new(Vec::new()),
                captured_out: Mutex::new(Vec::new()),
                shutdown,
            }),
        })
    }

    pub fn self_id(&self) -> ProcessId {
        self.shared.peers.self_id()
    }

    pub fn peers(&self) -> &Peers {
        &self.shared.peers
    }

    /// Signals every outstanding watchdog task to stop.
    pub fn shutdown(&self) {
        let _ = self.shared.shutdown.send(true);
    }

    /// Multicasts one payload to the whole membership and returns its msg_id.
    /// Self-delivery happens through the local queue entry once the final
    /// sequence is agreed.
    pub async fn multicast(&self, data: u32) -> Result<u32> {
        let shared = &self.shared;
        let msg_id = shared.next_msg_id.fetch_add(1, AtomicOrdering::Relaxed);
        let msg = DataMessage {
            sender: shared.peers.self_id(),
            msg_id,
            data,
        };
        locked(&shared.ack_history).insert(msg_id, HashMap::new());

        let seq = shared.next_seq.fetch_add(1, AtomicOrdering::Relaxed);
        locked(&shared.queue).push(QueuedMessage {
            sequence_number: seq,
            status: Status::Undeliverable,
            sender: msg.sender,
            msg_id,
            data,
            proposer: shared.peers.self_id(),
        });

        let frame = msg.encode();
        for peer in shared.peers.others() {
            match self.send_with_drop_and_delay(peer, frame.clone()).await {
                Ok(SendOutcome::Sent) => debug!(peer, msg_id, data, "multicast data message"),
                Ok(SendOutcome::Dropped) => debug!(peer, msg_id, "data message dropped"),
                // the watchdog is the recovery path for send failures
                Err(err) => warn!(peer, msg_id, %err, "failed to send data message"),
            }
            let _ = self.spawn_data_watchdog(msg, peer);
        }
        Ok(msg_id)
    }

    /// Receive loop for ordinary protocol traffic. Terminates after the
    /// configured inbound cap, or on the first fatal error. Transport receive
    /// errors are fatal; per-message handler errors only kill the loop when
    /// they mean the local state can no longer be trusted.
    pub async fn run(&self) -> Result<()> {
        let mut received: u64 = 0;
        while received < self.shared.cfg.recv_cap {
            let frame = self.shared.transport.recv().await?;
            if self.shared.recording.load(AtomicOrdering::Acquire) {
                locked(&self.shared.captured_in).push(frame.clone());
            }
            let outcome = match Message::decode(&frame) {
                Ok(Message::Data(m)) => self.on_data(m).await,
                Ok(Message::Ack(m)) => self.on_ack(m).await,
                Ok(Message::Seq(m)) => self.on_seq(m).await,
                Err(err) => Err(err),
            };
            if let Err(err) = outcome {
                if err.is_fatal() {
                    return Err(err);
                }
                warn!(%err, "message handling failed, continuing");
            }
            received += 1;
        }
        debug!(received, "inbound message cap reached, receive loop done");
        Ok(())
    }

    /// Incoming data message: duplicates get the previously recorded ack
    /// verbatim; fresh ones get the next local sequence number proposed back.
    async fn on_data(&self, msg: DataMessage) -> Result<()> {
        let shared = &self.shared;
        debug!(sender = msg.sender, msg_id = msg.msg_id, data = msg.data, "received data message");

        let prior = locked(&shared.already_acked)
            .iter()
            .find(|a| a.sender == msg.sender && a.msg_id == msg.msg_id)
            .copied();
        if let Some(ack) = prior {
            debug!(sender = msg.sender, msg_id = msg.msg_id, "duplicate data message, resending ack");
            self.reply_with_drop_and_delay(ack.encode()).await?;
            return Ok(());
        }

        let seq = shared.next_seq.fetch_add(1, AtomicOrdering::Relaxed);
        locked(&shared.queue).push(QueuedMessage {
            sequence_number: seq,
            status: Status::Undeliverable,
            sender: msg.sender,
            msg_id: msg.msg_id,
            data: msg.data,
            proposer: shared.peers.self_id(),
        });

        let ack = AckMessage {
            sender: msg.sender,
            msg_id: msg.msg_id,
            proposed_seq: seq,
            proposer: shared.peers.self_id(),
        };
        locked(&shared.already_acked).push(ack);
        if let Err(err) = self.reply_with_drop_and_delay(ack.encode()).await {
            // the watchdog is the recovery path for send failures
            warn!(sender = msg.sender, msg_id = msg.msg_id, %err, "failed to send ack");
        }
        // the ack or the final sequence may get lost; resend until the
        // sequence shows up
        let _ = self.spawn_ack_watchdog(ack, msg.sender);
        Ok(())
    }

    /// Incoming ack for a message we originated. On the first ack from each
    /// proposer the proposal is recorded; the full set finalizes the message.
    /// Duplicate acks after finalization get the recorded SeqMessage back.
    async fn on_ack(&self, msg: AckMessage) -> Result<()> {
        let shared = &self.shared;
        debug!(
            sender = msg.sender,
            msg_id = msg.msg_id,
            proposed_seq = msg.proposed_seq,
            proposer = msg.proposer,
            "received ack"
        );

        enum Decision {
            Wait,
            Finalize(SeqMessage),
            ResendSeq,
        }

        let decision = {
            let mut history = locked(&shared.ack_history);
            let slot = history.entry(msg.msg_id).or_default();
            if !slot.contains_key(&msg.proposer) {
                // keep our own proposals ahead of sequence numbers other
                // processes may already have assigned
                shared.next_seq.fetch_add(1, AtomicOrdering::Relaxed);
                slot.insert(msg.proposer, msg.proposed_seq);
                if slot.len() == shared.peers.ack_quorum() {
                    let (final_seq, final_seq_proposer) = winning_proposal(slot);
                    Decision::Finalize(SeqMessage {
                        sender: msg.sender,
                        msg_id: msg.msg_id,
                        final_seq,
                        final_seq_proposer,
                    })
                } else {
                    Decision::Wait
                }
            } else if slot.len() == shared.peers.ack_quorum() {
                Decision::ResendSeq
            } else {
                Decision::Wait
            }
        };

        match decision {
            Decision::Wait => Ok(()),
            Decision::Finalize(seq_msg) => {
                locked(&shared.seq_history).push(seq_msg);
                self.broadcast_seq(seq_msg).await;
                if !locked(&shared.queue).update_sequence_and_status(
                    seq_msg.sender,
                    seq_msg.msg_id,
                    seq_msg.final_seq,
                    seq_msg.final_seq_proposer,
                    Status::Deliverable,
                ) {
                    return Err(MulticastError::SequenceForUnknownMessage {
                        sender: seq_msg.sender,
                        msg_id: seq_msg.msg_id,
                    });
                }
                self.deliver_ready();
                Ok(())
            }
            Decision::ResendSeq => {
                // the proposer likely never saw the final sequence
                debug!(
                    proposer = msg.proposer,
                    msg_id = msg.msg_id,
                    "duplicate ack after finalization, resending final sequence"
                );
                let recorded = locked(&shared.seq_history)
                    .iter()
                    .find(|s| s.sender == msg.sender && s.msg_id == msg.msg_id)
                    .copied();
                match recorded {
                    Some(seq_msg) => {
                        self.send_with_drop_and_delay(msg.proposer, seq_msg.encode())
                            .await?;
                        Ok(())
                    }
                    None => Err(MulticastError::MissingSequenceRecord {
                        sender: msg.sender,
                        msg_id: msg.msg_id,
                    }),
                }
            }
        }
    }

    /// Incoming final sequence: reorder the queue entry and drain whatever
    /// became deliverable. A sequence for a message that is neither queued
    /// nor delivered means our state diverged, which is fatal.
    async fn on_seq(&self, msg: SeqMessage) -> Result<()> {
        let shared = &self.shared;
        debug!(
            sender = msg.sender,
            msg_id = msg.msg_id,
            final_seq = msg.final_seq,
            proposer = msg.final_seq_proposer,
            "received final sequence"
        );

        let found = locked(&shared.queue).update_sequence_and_status(
            msg.sender,
            msg.msg_id,
            msg.final_seq,
            msg.final_seq_proposer,
            Status::Deliverable,
        );
        if !found {
            let already_delivered = locked(&shared.delivered)
                .iter()
                .any(|qm| qm.sender == msg.sender && qm.msg_id == msg.msg_id);
            if already_delivered {
                debug!(sender = msg.sender, msg_id = msg.msg_id, "duplicate finalization, ignoring");
                return Ok(());
            }
            return Err(MulticastError::SequenceForUnknownMessage {
                sender: msg.sender,
                msg_id: msg.msg_id,
            });
        }
        locked(&shared.seq_history).push(msg);
        self.deliver_ready();
        Ok(())
    }

    async fn broadcast_seq(&self, seq_msg: SeqMessage) {
        let frame = seq_msg.encode();
        for peer in self.shared.peers.others() {
            match self.send_with_drop_and_delay(peer, frame.clone()).await {
                Ok(SendOutcome::Sent) => {}
                Ok(SendOutcome::Dropped) => {
                    debug!(peer, msg_id = seq_msg.msg_id, "final sequence dropped")
                }
                Err(err) => warn!(peer, msg_id = seq_msg.msg_id, %err, "failed to send final sequence"),
            }
        }
    }

    /// Pops every deliverable front entry into the delivered log. Both locks
    /// are held together so a snapshot never observes a message in neither
    /// container.
    fn deliver_ready(&self) {
        let mut queue = locked(&self.shared.queue);
        let mut log = locked(&self.shared.delivered);
        for qm in queue.drain_deliverable() {
            info!(
                process = self.shared.peers.self_id(),
                sender = qm.sender,
                msg_id = qm.msg_id,
                seq = qm.sequence_number,
                proposer = qm.proposer,
                data = qm.data,
                "delivered message"
            );
            log.push(qm);
        }
    }

    /// Resends a data message to one peer until its ack shows up in the ack
    /// history, the resend cap is hit, or the engine shuts down.
    fn spawn_data_watchdog(&self, msg: DataMessage, peer: ProcessId) -> JoinHandle<()> {
        let engine = self.clone();
        let mut shutdown = self.shared.shutdown.subscribe();
        tokio::spawn(async move {
            let shared = &engine.shared;
            for attempt in 1..=shared.cfg.resend_cap {
                tokio::select! {
                    _ = tokio::time::sleep(shared.cfg.watchdog_timeout) => {}
                    _ = shutdown.changed() => return,
                }
                let acked = locked(&shared.ack_history)
                    .get(&msg.msg_id)
                    .is_some_and(|slot| slot.contains_key(&peer));
                if acked {
                    debug!(peer, msg_id = msg.msg_id, "ack arrived, data watchdog done");
                    return;
                }
                debug!(attempt, peer, msg_id = msg.msg_id, "no ack yet, resending data message");
                match engine.send_with_drop_and_delay(peer, msg.encode()).await {
                    Ok(SendOutcome::Sent) => {}
                    Ok(SendOutcome::Dropped) => {
                        debug!(peer, msg_id = msg.msg_id, "resent data message dropped")
                    }
                    Err(err) => warn!(peer, msg_id = msg.msg_id, %err, "resend failed"),
                }
            }
            warn!(
                peer,
                msg_id = msg.msg_id,
                "resend cap exhausted, peer presumed dead or partitioned"
            );
        })
    }

    /// Resends an ack until a matching final sequence shows up in the
    /// sequence history. Covers both a lost ack and a lost SeqMessage.
    fn spawn_ack_watchdog(&self, ack: AckMessage, originator: ProcessId) -> JoinHandle<()> {
        let engine = self.clone();
        let mut shutdown = self.shared.shutdown.subscribe();
        tokio::spawn(async move {
            let shared = &engine.shared;
            for attempt in 1..=shared.cfg.resend_cap {
                tokio::select! {
                    _ = tokio::time::sleep(shared.cfg.watchdog_timeout) => {}
                    _ = shutdown.changed() => return,
                }
                let finalized = locked(&shared.seq_history)
                    .iter()
                    .any(|s| s.sender == ack.sender && s.msg_id == ack.msg_id);
                if finalized {
                    debug!(msg_id = ack.msg_id, "final sequence arrived, ack watchdog done");
                    return;
                }
                debug!(attempt, originator, msg_id = ack.msg_id, "no final sequence yet, resending ack");
                match engine
                    .send_with_drop_and_delay(originator, ack.encode())
                    .await
                {
                    Ok(SendOutcome::Sent) => {}
                    Ok(SendOutcome::Dropped) => {
                        debug!(originator, msg_id = ack.msg_id, "resent ack dropped")
                    }
                    Err(err) => warn!(originator, msg_id = ack.msg_id, %err, "resend failed"),
                }
            }
            warn!(
                originator,
                msg_id = ack.msg_id,
                "resend cap exhausted, peer presumed dead or partitioned"
            );
        })
    }

    async fn send_with_drop_and_delay(&self, peer: ProcessId, frame: Bytes) -> Result<SendOutcome> {
        self.artificial_delay().await;
        if self.roll_drop() {
            return Ok(SendOutcome::Dropped);
        }
        self.record_outbound(&frame);
        self.shared.transport.send_to(peer, frame).await?;
        Ok(SendOutcome::Sent)
    }

    async fn reply_with_drop_and_delay(&self, frame: Bytes) -> Result<SendOutcome> {
        self.artificial_delay().await;
        if self.roll_drop() {
            return Ok(SendOutcome::Dropped);
        }
        self.record_outbound(&frame);
        self.shared.transport.reply(frame).await?;
        Ok(SendOutcome::Sent)
    }

    fn roll_drop(&self) -> bool {
        self.shared.cfg.drop_rate > 0.0
            && rand::thread_rng().gen::<f64>() < self.shared.cfg.drop_rate
    }

    async fn artificial_delay(&self) {
        if !self.shared.cfg.delay.is_zero() {
            tokio::time::sleep(self.shared.cfg.delay).await;
        }
    }

    fn record_outbound(&self, frame: &Bytes) {
        if self.shared.recording.load(AtomicOrdering::Acquire) {
            locked(&self.shared.captured_out).push(frame.clone());
        }
    }

    // --- accessors for the snapshot coordinator ---

    /// Point-in-time copy of the delivery queue and delivered log.
    pub fn local_state_snapshot(&self) -> LocalStateSnapshot {
        let queue = locked(&self.shared.queue);
        let delivered = locked(&self.shared.delivered);
        LocalStateSnapshot {
            delivery_queue: queue.to_sorted_vec(),
            delivered: delivered.clone(),
        }
    }

    /// Toggles mirroring of raw frames into the capture buffers. Read on
    /// every send and receive, hence an atomic rather than a lock.
    pub fn set_recording(&self, on: bool) {
        self.shared.recording.store(on, AtomicOrdering::Release);
    }

    /// Hands over everything captured since recording began (or the last
    /// drain): inbound frames first, outbound second.
    pub fn drain_captures(&self) -> (Vec<Bytes>, Vec<Bytes>) {
        let inbound = std::mem::take(&mut *locked(&self.shared.captured_in));
        let outbound = std::mem::take(&mut *locked(&self.shared.captured_out));
        (inbound, outbound)
    }

    /// Copy of the delivered log, in delivery order.
    pub fn delivered_log(&self) -> Vec<QueuedMessage> {
        locked(&self.shared.delivered).clone()
    }

    /// Copy of the undelivered queue in priority order.
    pub fn pending_messages(&self) -> Vec<QueuedMessage> {
        locked(&self.shared.queue).to_sorted_vec()
    }
}

/// Picks the winning proposal: lexicographic max of (sequence, proposer).
/// The proposer tie-break keeps the winner identical no matter the order the
/// acks arrived in.
fn winning_proposal(slot: &HashMap<ProcessId, u32>) -> (u32, ProcessId) {
    let mut best_seq = 0;
    let mut best_proposer = 0;
    for (&proposer, &seq) in slot {
        if (seq, proposer) > (best_seq, best_proposer) {
            best_seq = seq;
            best_proposer = proposer;
        }
    }
    (best_seq, best_proposer)
}
