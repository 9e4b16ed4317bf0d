pub mod net;

use std::collections::HashMap;
use std::io;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::Mutex;

use crate::multicast::ProcessId;

/// Datagram-style transport for ordinary protocol traffic. Implementations
/// route by process id; address resolution is their concern, not the core's.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send_to(&self, peer: ProcessId, frame: Bytes) -> io::Result<()>;

    /// Sends to the process whose frame was most recently received.
    async fn reply(&self, frame: Bytes) -> io::Result<()>;

    /// Blocks until the next inbound frame arrives.
    async fn recv(&self) -> io::Result<Bytes>;
}

/// Connection-oriented side channel carrying only snapshot markers.
#[async_trait]
pub trait MarkerChannel: Send + Sync + 'static {
    async fn send_marker(&self, peer: ProcessId, marker: ProcessId) -> io::Result<()>;

    async fn recv_marker(&self) -> io::Result<ProcessId>;
}

/// In-memory transport backed by a tokio mpsc mesh. One instance per
/// process; every frame travels tagged with its sender so `reply` works.
pub struct ChannelTransport {
    self_id: ProcessId,
    outbound: HashMap<ProcessId, mpsc::Sender<(ProcessId, Bytes)>>,
    inbound: Mutex<mpsc::Receiver<(ProcessId, Bytes)>>,
    last_sender: StdMutex<Option<ProcessId>>,
}

impl ChannelTransport {
    /// Builds a fully connected mesh for the given membership, returning the
    /// transports in membership order.
    pub fn mesh(members: &[ProcessId]) -> Vec<ChannelTransport> {
        let mut senders = HashMap::new();
        let mut receivers = Vec::new();
        for &id in members {
            let (tx, rx) = mpsc::channel(256);
            senders.insert(id, tx);
            receivers.push((id, rx));
        }
        receivers
            .into_iter()
            .map(|(id, rx)| ChannelTransport {
                self_id: id,
                outbound: senders.clone(),
                inbound: Mutex::new(rx),
                last_sender: StdMutex::new(None),
            })
            .collect()
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send_to(&self, peer: ProcessId, frame: Bytes) -> io::Result<()> {
        let tx = self
            .outbound
            .get(&peer)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("unknown peer {peer}")))?;
        tx.send((self.self_id, frame))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, format!("peer {peer} gone")))
    }

    async fn reply(&self, frame: Bytes) -> io::Result<()> {
        let peer = self
            .last_sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "nothing received yet"))?;
        self.send_to(peer, frame).await
    }

    async fn recv(&self) -> io::Result<Bytes> {
        let mut rx = self.inbound.lock().await;
        let (sender, frame) = rx
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "all peers gone"))?;
        *self.last_sender.lock().unwrap_or_else(|e| e.into_inner()) = Some(sender);
        Ok(frame)
    }
}

/// In-memory marker channel, same mesh shape as [`ChannelTransport`].
pub struct ChannelMarkers {
    outbound: HashMap<ProcessId, mpsc::Sender<ProcessId>>,
    inbound: Mutex<mpsc::Receiver<ProcessId>>,
}

impl ChannelMarkers {
    pub fn mesh(members: &[ProcessId]) -> Vec<ChannelMarkers> {
        let mut senders = HashMap::new();
        let mut receivers = Vec::new();
        for &id in members {
            let (tx, rx) = mpsc::channel(64);
            senders.insert(id, tx);
            receivers.push(rx);
        }
        receivers
            .into_iter()
            .map(|rx| ChannelMarkers {
                outbound: senders.clone(),
                inbound: Mutex::new(rx),
            })
            .collect()
    }
}

#[async_trait]
impl MarkerChannel for ChannelMarkers {
    async fn send_marker(&self, peer: ProcessId, marker: ProcessId) -> io::Result<()> {
        let tx = self
            .outbound
            .get(&peer)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("unknown peer {peer}")))?;
        tx.send(marker)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, format!("peer {peer} gone")))
    }

    async fn recv_marker(&self) -> io::Result<ProcessId> {
        let mut rx = self.inbound.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "all peers gone"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mesh_routes_and_replies() {
        let mut mesh = ChannelTransport::mesh(&[1, 2]);
        let b = mesh.pop().unwrap();
        let a = mesh.pop().unwrap();

        a.send_to(2, Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(b.recv().await.unwrap(), Bytes::from_static(b"ping"));

        // reply goes back to the last received sender
        b.reply(Bytes::from_static(b"pong")).await.unwrap();
        assert_eq!(a.recv().await.unwrap(), Bytes::from_static(b"pong"));
    }

    #[tokio::test]
    async fn test_reply_before_recv_fails() {
        let mesh = ChannelTransport::mesh(&[1, 2]);
        let err = mesh[0].reply(Bytes::from_static(b"x")).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_marker_mesh() {
        let mesh = ChannelMarkers::mesh(&[1, 2, 3]);
        mesh[0].send_marker(3, 1).await.unwrap();
        mesh[1].send_marker(3, 2).await.unwrap();
        let mut got = vec![
            mesh[2].recv_marker().await.unwrap(),
            mesh[2].recv_marker().await.unwrap(),
        ];
        got.sort_unstable();
        assert_eq!(got, vec![1, 2]);
    }
}
