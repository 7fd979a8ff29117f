use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;

use crate::error::{Result, TunnelError};

/// Client-side receive half of a datagram link. The socket is connected,
/// so the kernel filters foreign sources. An optional idle timeout gives
/// the same dead-link detection the stream transports get from their
/// read-deadline decorator.
pub struct DatagramReader {
    socket: Arc<UdpSocket>,
    idle_timeout: Option<Duration>,
}

impl DatagramReader {
    pub fn new(socket: Arc<UdpSocket>, idle_timeout: Option<Duration>) -> Self {
        Self { socket, idle_timeout }
    }

    pub async fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.idle_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.socket.recv(buf))
                .await
                .map_err(|_| TunnelError::Io(std::io::ErrorKind::TimedOut.into()))?
                .map_err(TunnelError::Io),
            None => self.socket.recv(buf).await.map_err(TunnelError::Io),
        }
    }
}

/// Send half of a datagram link. Server sessions share one unconnected
/// socket and address each datagram; the client's socket is connected
/// and sends without one.
pub struct DatagramWriter {
    socket: Arc<UdpSocket>,
    peer: Option<SocketAddr>,
}

impl DatagramWriter {
    pub fn connected(socket: Arc<UdpSocket>) -> Self {
        Self { socket, peer: None }
    }

    pub fn to_peer(socket: Arc<UdpSocket>, peer: SocketAddr) -> Self {
        Self { socket, peer: Some(peer) }
    }

    pub async fn send(&mut self, payload: &[u8]) -> Result<()> {
        let sent = match self.peer {
            Some(peer) => self.socket.send_to(payload, peer).await?,
            None => self.socket.send(payload).await?,
        };
        if sent != payload.len() {
            return Err(TunnelError::Io(std::io::ErrorKind::WriteZero.into()));
        }
        Ok(())
    }
}

pub async fn bind(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    UdpSocket::bind(addr).await
}

/// Bind an ephemeral local socket and connect it to the server.
pub async fn connect(remote: SocketAddr) -> std::io::Result<UdpSocket> {
    let local: SocketAddr = if remote.is_ipv4() {
        "0.0.0.0:0".parse().map_err(|_| std::io::ErrorKind::InvalidInput)?
    } else {
        "[::]:0".parse().map_err(|_| std::io::ErrorKind::InvalidInput)?
    };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(remote).await?;
    Ok(socket)
}
