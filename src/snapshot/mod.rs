//! Chandy-Lamport global snapshot, superimposed on the multicast engine.
//!
//! Markers travel over a dedicated side channel; ordinary protocol traffic
//! keeps flowing and is only tapped for copies, so recording never delays
//! delivery. The coordinator walks Idle -> Recording -> Collecting ->
//! Finalized: local state is captured on initiation (or on the first marker),
//! every buffered frame is classified into per-peer channel logs on each
//! subsequent marker, and a frame from a channel whose marker already arrived
//! belongs to the post-cut state and is discarded.

mod state;

pub use state::{ChannelEvent, GlobalSnapshot, LocalStateSnapshot};

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::error::Result;
use crate::multicast::{MulticastEngine, ProcessId};
use crate::transport::{MarkerChannel, Transport};

enum Direction {
    Inbound,
    Outbound,
}

pub struct SnapshotCoordinator<T: Transport, M: MarkerChannel> {
    engine: MulticastEngine<T>,
    markers: M,
    initiator: bool,
    local: Option<LocalStateSnapshot>,
    /// Peers whose marker has arrived; messages from them are post-cut.
    received: Vec<ProcessId>,
    inbound: BTreeMap<ProcessId, Vec<ChannelEvent>>,
    outbound: BTreeMap<ProcessId, Vec<ChannelEvent>>,
}

impl<T: Transport, M: MarkerChannel> SnapshotCoordinator<T, M> {
    pub fn new(engine: MulticastEngine<T>, markers: M) -> Self {
        SnapshotCoordinator {
            engine,
            markers,
            initiator: false,
            local: None,
            received: Vec::new(),
            inbound: BTreeMap::new(),
            outbound: BTreeMap::new(),
        }
    }

    /// Starts a snapshot from this process: capture local state, begin
    /// channel recording, send a marker to every peer.
    pub async fn initiate(&mut self) -> Result<()> {
        info!(process = self.engine.self_id(), "initiating global snapshot");
        self.initiator = true;
        self.local = Some(self.engine.local_state_snapshot());
        self.engine.set_recording(true);
        self.broadcast_markers().await
    }

    /// Receives markers until one has arrived from every peer, then stops
    /// recording and assembles the snapshot. Marker reception is strictly
    /// sequential; protocol traffic flows concurrently through the engine.
    pub async fn run(mut self) -> Result<GlobalSnapshot> {
        let wanted = self.engine.peers().ack_quorum();
        while self.received.len() < wanted {
            let sender = self.markers.recv_marker().await?;
            self.on_marker(sender).await?;
        }
        self.engine.set_recording(false);
        // anything still buffered arrived after the final marker closed the
        // cut; discard it so a later snapshot starts clean
        let _ = self.engine.drain_captures();
        info!(process = self.engine.self_id(), "global snapshot complete");
        Ok(self.assemble())
    }

    async fn on_marker(&mut self, sender: ProcessId) -> Result<()> {
        debug!(process = self.engine.self_id(), sender, "received marker");
        if self.local.is_none() {
            // First marker ever seen, so this process was not the initiator:
            // capture state now and propagate the wavefront. The channel from
            // the marker's sender is empty by construction.
            self.received.push(sender);
            self.local = Some(self.engine.local_state_snapshot());
            self.engine.set_recording(true);
            self.broadcast_markers().await?;
            return Ok(());
        }

        let (inbound, outbound) = self.engine.drain_captures();
        for frame in inbound {
            self.classify(&frame, Direction::Inbound)?;
        }
        for frame in outbound {
            self.classify(&frame, Direction::Outbound)?;
        }
        if !self.received.contains(&sender) {
            self.received.push(sender);
        }
        Ok(())
    }

    /// Routes one captured frame into the channel log of its originating
    /// process, unless that process's marker has already arrived.
    fn classify(&mut self, frame: &[u8], direction: Direction) -> Result<()> {
        let event = ChannelEvent::from_frame(frame)?;
        let origin = event.origin();
        if self.received.contains(&origin) {
            debug!(origin, %event, "post-cut message, not recorded");
            return Ok(());
        }
        let log = match direction {
            Direction::Inbound => self.inbound.entry(origin).or_default(),
            Direction::Outbound => self.outbound.entry(origin).or_default(),
        };
        log.push(event);
        Ok(())
    }

    async fn broadcast_markers(&self) -> Result<()> {
        let marker = self.engine.self_id();
        for peer in self.engine.peers().others() {
            self.markers.send_marker(peer, marker).await?;
        }
        Ok(())
    }

    fn assemble(self) -> GlobalSnapshot {
        GlobalSnapshot {
            process: self.engine.self_id(),
            local: self.local.unwrap_or_default(),
            inbound: self.inbound,
            outbound: self.outbound,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::Config;
    use crate::multicast::{AckMessage, DataMessage, Message, SeqMessage};
    use crate::transport::{ChannelMarkers, ChannelTransport};

    fn engine_with(
        self_id: ProcessId,
        peers: Vec<ProcessId>,
        transport: ChannelTransport,
        recv_cap: u64,
    ) -> MulticastEngine<ChannelTransport> {
        let mut cfg = Config::new(self_id, peers);
        cfg.watchdog_timeout = Duration::from_millis(500);
        cfg.recv_cap = recv_cap;
        MulticastEngine::new(cfg, transport).unwrap()
    }

    #[tokio::test]
    async fn test_post_cut_messages_are_excluded() {
        let mut mesh = ChannelTransport::mesh(&[1, 2, 3]);
        let mut marker_mesh = ChannelMarkers::mesh(&[1, 2, 3]);
        let engine = engine_with(1, vec![1, 2, 3], mesh.remove(0), u64::MAX);
        let mut coord = SnapshotCoordinator::new(engine, marker_mesh.remove(0));

        // a marker from 2 already arrived; channel 2 is closed
        coord.received.push(2);

        let from_closed = Message::Ack(AckMessage {
            sender: 1,
            msg_id: 1,
            proposed_seq: 4,
            proposer: 2,
        });
        let from_open = Message::Data(DataMessage {
            sender: 3,
            msg_id: 7,
            data: 11,
        });
        coord
            .classify(&from_closed.encode(), Direction::Inbound)
            .unwrap();
        coord
            .classify(&from_open.encode(), Direction::Inbound)
            .unwrap();

        assert!(!coord.inbound.contains_key(&2));
        assert_eq!(
            coord.inbound[&3],
            vec![ChannelEvent::Data {
                sender: 3,
                msg_id: 7,
                data: 11
            }]
        );
    }

    // Three processes; 1 and 2 run real engines, the test plays process 3.
    // Process 1 initiates while a data message from 3 is in flight; that
    // message (and the ack 1 sends back) must land in 1's channel logs.
    #[tokio::test]
    async fn test_snapshot_captures_in_flight_traffic() {
        let members = [1, 2, 3];
        let mut mesh = ChannelTransport::mesh(&members);
        let mut marker_mesh = ChannelMarkers::mesh(&members);

        let engine1 = engine_with(1, members.to_vec(), mesh.remove(0), 1);
        let engine2 = engine_with(2, members.to_vec(), mesh.remove(0), u64::MAX);
        let transport3 = mesh.remove(0);
        let markers1 = marker_mesh.remove(0);
        let markers2 = marker_mesh.remove(0);
        let markers3 = marker_mesh.remove(0);

        let mut coord1 = SnapshotCoordinator::new(engine1.clone(), markers1);
        let coord2 = SnapshotCoordinator::new(engine2.clone(), markers2);

        // 1 initiates; markers to 2 and 3 are now queued
        coord1.initiate().await.unwrap();

        // a data message from 3 reaches 1 while 1 is recording
        let data = DataMessage {
            sender: 3,
            msg_id: 1,
            data: 99,
        };
        transport3.send_to(1, data.encode()).await.unwrap();
        engine1.run().await.unwrap();
        // 1 acked back to 3
        let ack_frame = transport3.recv().await.unwrap();
        assert!(matches!(
            Message::decode(&ack_frame).unwrap(),
            Message::Ack(_)
        ));

        // 2 sees 1's marker, records, and broadcasts its own
        let coord2_task = tokio::spawn(coord2.run());

        // the test, as process 3, consumes 1's marker and sends its own
        assert_eq!(markers3.recv_marker().await.unwrap(), 1);
        markers3.send_marker(1, 3).await.unwrap();
        markers3.send_marker(2, 3).await.unwrap();

        let snap1 = coord1.run().await.unwrap();
        let snap2 = coord2_task.await.unwrap().unwrap();

        // the in-flight data message is channel state on 1's inbound side
        assert_eq!(
            snap1.inbound[&3],
            vec![ChannelEvent::Data {
                sender: 3,
                msg_id: 1,
                data: 99
            }]
        );
        // the ack 1 sent while recording shows up in its outbound logs
        let outbound: Vec<_> = snap1.outbound.values().flatten().collect();
        assert_eq!(outbound.len(), 1);
        assert!(matches!(outbound[0], ChannelEvent::Ack { proposer: 1, .. }));
        // local state was captured at initiation, before the frame arrived;
        // the message is accounted for exactly once, as channel state
        assert!(snap1.local.delivery_queue.is_empty());
        assert!(snap1.local.delivered.is_empty());

        // the capture buffers were drained and discarded when the cut closed
        let (leftover_in, leftover_out) = engine1.drain_captures();
        assert!(leftover_in.is_empty() && leftover_out.is_empty());

        // nothing was in flight around process 2
        assert!(snap2.inbound.values().all(|v| v.is_empty()));
        assert!(snap2.outbound.values().all(|v| v.is_empty()));
        assert!(snap2.local.delivery_queue.is_empty());

        engine1.shutdown();
        engine2.shutdown();
    }

    // Five messages are in flight when the cut closes: two data messages, a
    // finalization, and the two acks they provoke. Every message must be
    // accounted for exactly once, either as local state or as channel state.
    #[tokio::test]
    async fn test_snapshot_accounts_for_multiple_in_flight_messages() {
        let members = [1, 2, 3];
        let mut mesh = ChannelTransport::mesh(&members);
        let mut marker_mesh = ChannelMarkers::mesh(&members);

        // recv cap 1, so the test steps the engine one frame at a time
        let engine1 = engine_with(1, members.to_vec(), mesh.remove(0), 1);
        let transport2 = mesh.remove(0);
        let transport3 = mesh.remove(0);
        let markers1 = marker_mesh.remove(0);
        let markers2 = marker_mesh.remove(0);
        let markers3 = marker_mesh.remove(0);
        let mut coord1 = SnapshotCoordinator::new(engine1.clone(), markers1);

        // before the cut: a data message from 3 becomes local queue state
        let pre_cut = DataMessage {
            sender: 3,
            msg_id: 1,
            data: 10,
        };
        transport3.send_to(1, pre_cut.encode()).await.unwrap();
        engine1.run().await.unwrap();

        coord1.initiate().await.unwrap();

        // while recording: data from 3 and 2, then the finalization for the
        // pre-cut message; each reply ack is captured on the outbound side
        let data3 = DataMessage {
            sender: 3,
            msg_id: 2,
            data: 20,
        };
        transport3.send_to(1, data3.encode()).await.unwrap();
        engine1.run().await.unwrap();
        let data2 = DataMessage {
            sender: 2,
            msg_id: 3,
            data: 30,
        };
        transport2.send_to(1, data2.encode()).await.unwrap();
        engine1.run().await.unwrap();
        let finalization = SeqMessage {
            sender: 3,
            msg_id: 1,
            final_seq: 1,
            final_seq_proposer: 1,
        };
        transport3.send_to(1, finalization.encode()).await.unwrap();
        engine1.run().await.unwrap();

        // the test, as processes 2 and 3, answers the markers
        assert_eq!(markers2.recv_marker().await.unwrap(), 1);
        assert_eq!(markers3.recv_marker().await.unwrap(), 1);
        markers2.send_marker(1, 2).await.unwrap();
        markers3.send_marker(1, 3).await.unwrap();
        let snap = coord1.run().await.unwrap();

        // local state is the pre-cut message, still undelivered at the cut
        assert_eq!(snap.local.delivery_queue.len(), 1);
        assert_eq!(
            (snap.local.delivery_queue[0].sender, snap.local.delivery_queue[0].msg_id),
            (3, 1)
        );
        assert!(snap.local.delivered.is_empty());

        // channel state: the two in-flight data messages and the finalization
        assert_eq!(
            snap.inbound[&3],
            vec![
                ChannelEvent::Data {
                    sender: 3,
                    msg_id: 2,
                    data: 20
                },
                ChannelEvent::Seq {
                    sender: 3,
                    msg_id: 1,
                    final_seq: 1,
                    proposer: 1
                },
            ]
        );
        assert_eq!(
            snap.inbound[&2],
            vec![ChannelEvent::Data {
                sender: 2,
                msg_id: 3,
                data: 30
            }]
        );

        // plus the two acks sent while recording, nothing more
        let outbound: Vec<_> = snap.outbound.values().flatten().collect();
        assert_eq!(outbound.len(), 2);
        let mut acked_ids: Vec<u32> = outbound
            .iter()
            .map(|event| match event {
                ChannelEvent::Ack {
                    msg_id, proposer: 1, ..
                } => *msg_id,
                other => panic!("unexpected outbound event {other}"),
            })
            .collect();
        acked_ids.sort_unstable();
        assert_eq!(acked_ids, vec![2, 3]);

        // the post-cut delivery happened on the live engine, not in the cut
        assert_eq!(engine1.delivered_log().len(), 1);
        let (leftover_in, leftover_out) = engine1.drain_captures();
        assert!(leftover_in.is_empty() && leftover_out.is_empty());
        engine1.shutdown();
    }

    // A process that merely receives a marker mirrors the initiator: capture
    // local state, start recording, broadcast its own markers.
    #[tokio::test]
    async fn test_first_marker_propagates_wavefront() {
        let members = [1, 2];
        let mut mesh = ChannelTransport::mesh(&members);
        let mut marker_mesh = ChannelMarkers::mesh(&members);

        let engine2 = engine_with(2, members.to_vec(), mesh.remove(1), u64::MAX);
        let markers1 = marker_mesh.remove(0);
        let markers2 = marker_mesh.remove(0);
        let coord2 = SnapshotCoordinator::new(engine2, markers2);

        markers1.send_marker(2, 1).await.unwrap();
        let snap2 = coord2.run().await.unwrap();

        // 2 propagated its own marker back to 1
        assert_eq!(markers1.recv_marker().await.unwrap(), 2);
        assert_eq!(snap2.process, 2);
        assert!(snap2.local.delivered.is_empty());
    }
}
