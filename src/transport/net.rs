use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use super::{MarkerChannel, Transport};
use crate::multicast::{ProcessId, MAX_WIRE_SIZE};

/// UDP datagram transport: one socket per process, peers addressed through
/// a resolved id-to-address map supplied by the bootstrap layer.
pub struct UdpTransport {
    socket: UdpSocket,
    addrs: HashMap<ProcessId, SocketAddr>,
    last_addr: StdMutex<Option<SocketAddr>>,
}

impl UdpTransport {
    pub async fn bind(
        bind: SocketAddr,
        addrs: HashMap<ProcessId, SocketAddr>,
    ) -> io::Result<UdpTransport> {
        let socket = UdpSocket::bind(bind).await?;
        Ok(UdpTransport {
            socket,
            addrs,
            last_addr: StdMutex::new(None),
        })
    }

    fn addr_of(&self, peer: ProcessId) -> io::Result<SocketAddr> {
        self.addrs.get(&peer).copied().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no address for peer {peer}"))
        })
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send_to(&self, peer: ProcessId, frame: Bytes) -> io::Result<()> {
        let addr = self.addr_of(peer)?;
        self.socket.send_to(&frame, addr).await?;
        Ok(())
    }

    async fn reply(&self, frame: Bytes) -> io::Result<()> {
        let addr = self
            .last_addr
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "nothing received yet"))?;
        self.socket.send_to(&frame, addr).await?;
        Ok(())
    }

    async fn recv(&self) -> io::Result<Bytes> {
        let mut buf = [0u8; MAX_WIRE_SIZE];
        let (n, addr) = self.socket.recv_from(&mut buf).await?;
        *self.last_addr.lock().unwrap_or_else(|e| e.into_inner()) = Some(addr);
        Ok(Bytes::copy_from_slice(&buf[..n]))
    }
}

/// TCP marker channel: one short-lived connection per marker, carrying a
/// single big-endian u32 process id.
pub struct TcpMarkerChannel {
    listener: TcpListener,
    addrs: HashMap<ProcessId, SocketAddr>,
}

impl TcpMarkerChannel {
    pub async fn bind(
        bind: SocketAddr,
        addrs: HashMap<ProcessId, SocketAddr>,
    ) -> io::Result<TcpMarkerChannel> {
        let listener = TcpListener::bind(bind).await?;
        Ok(TcpMarkerChannel { listener, addrs })
    }
}

#[async_trait]
impl MarkerChannel for TcpMarkerChannel {
    async fn send_marker(&self, peer: ProcessId, marker: ProcessId) -> io::Result<()> {
        let addr = self.addrs.get(&peer).copied().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no address for peer {peer}"))
        })?;
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_u32(marker).await?;
        stream.shutdown().await
    }

    async fn recv_marker(&self) -> io::Result<ProcessId> {
        let (mut stream, _) = self.listener.accept().await?;
        stream.read_u32().await
    }
}
