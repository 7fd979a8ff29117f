//! TUN device boundary.
//!
//! Device creation, routing, and firewall plumbing belong to the
//! embedding platform. The dataplane only needs a packet source/sink:
//! either a datagram bridge socket the platform helper shuttles raw IP
//! packets through, or an in-memory channel pair used by tests.

use std::net::SocketAddr;
use std::sync::{Mutex as StdMutex, PoisonError};

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};

/// Packet source/sink the workers pump. Selected once at startup.
pub enum TunDevice {
    UdpBridge(UdpBridgeTun),
    Channel(ChannelTun),
}

impl TunDevice {
    /// Read one IP packet into `buf`, returning its length.
    pub async fn read_packet(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            TunDevice::UdpBridge(bridge) => bridge.read_packet(buf).await,
            TunDevice::Channel(channel) => channel.read_packet(buf).await,
        }
    }

    /// Write one IP packet toward the host network stack.
    pub async fn write_packet(&self, packet: &[u8]) -> std::io::Result<()> {
        match self {
            TunDevice::UdpBridge(bridge) => bridge.write_packet(packet).await,
            TunDevice::Channel(channel) => channel.write_packet(packet).await,
        }
    }
}

/// Bridge to a platform helper that owns the real TUN device and relays
/// raw IP packets over a local datagram socket. The helper's address is
/// learned from its first packet when not configured statically.
pub struct UdpBridgeTun {
    socket: UdpSocket,
    peer: StdMutex<Option<SocketAddr>>,
}

impl UdpBridgeTun {
    pub async fn bind(listen: SocketAddr, peer: Option<SocketAddr>) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(listen).await?;
        Ok(Self { socket, peer: StdMutex::new(peer) })
    }

    fn peer(&self) -> std::sync::MutexGuard<'_, Option<SocketAddr>> {
        self.peer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn read_packet(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        let (n, from) = self.socket.recv_from(buf).await?;
        *self.peer() = Some(from);
        Ok(n)
    }

    async fn write_packet(&self, packet: &[u8]) -> std::io::Result<()> {
        let Some(peer) = *self.peer() else {
            // no helper yet; best-effort drop, matching TUN semantics
            return Ok(());
        };
        self.socket.send_to(packet, peer).await?;
        Ok(())
    }
}

/// In-memory device: packets injected on one side surface as TUN reads,
/// TUN writes surface on the other side.
pub struct ChannelTun {
    incoming: Mutex<mpsc::Receiver<Vec<u8>>>,
    outgoing: mpsc::Sender<Vec<u8>>,
}

/// Far end of a [`ChannelTun`].
pub struct ChannelTunHandle {
    pub inject: mpsc::Sender<Vec<u8>>,
    pub written: mpsc::Receiver<Vec<u8>>,
}

/// Build a paired in-memory TUN device.
pub fn channel_tun(capacity: usize) -> (TunDevice, ChannelTunHandle) {
    let (inject, incoming) = mpsc::channel(capacity);
    let (outgoing, written) = mpsc::channel(capacity);
    (
        TunDevice::Channel(ChannelTun { incoming: Mutex::new(incoming), outgoing }),
        ChannelTunHandle { inject, written },
    )
}

impl ChannelTun {
    async fn read_packet(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        let packet = self
            .incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or(std::io::ErrorKind::BrokenPipe)?;
        let n = packet.len().min(buf.len());
        buf[..n].copy_from_slice(&packet[..n]);
        Ok(n)
    }

    async fn write_packet(&self, packet: &[u8]) -> std::io::Result<()> {
        self.outgoing
            .send(packet.to_vec())
            .await
            .map_err(|_| std::io::ErrorKind::BrokenPipe.into())
    }
}
