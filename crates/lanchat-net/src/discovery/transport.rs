//! UDP multicast transport for peer discovery.
//!
//! Joins the discovery group and exchanges one JSON datagram per envelope.
//! Multicast loopback is enabled so multiple participants on one host see
//! each other; TTL 1 keeps traffic on the local segment.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use lanchat_core::wire::{DiscoveryMessage, WireError, MAX_DATAGRAM};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("{0} is not a multicast address")]
    NotMulticast(SocketAddr),

    #[error("only IPv4 multicast groups are supported, got {0}")]
    NotIpv4(SocketAddr),

    #[error("receive timed out")]
    Timeout,

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug)]
pub struct MulticastTransport {
    socket: UdpSocket,
    group: SocketAddr,
}

impl MulticastTransport {
    /// Join `group` for receive and prepare it as the send destination.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(group: SocketAddr) -> Result<Self, TransportError> {
        let group_ip = match group.ip() {
            IpAddr::V4(ip) => ip,
            IpAddr::V6(_) => return Err(TransportError::NotIpv4(group)),
        };
        if !group_ip.is_multicast() {
            return Err(TransportError::NotMulticast(group));
        }

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), group.port());
        socket.bind(&bind_addr.into())?;
        socket.join_multicast_v4(&group_ip, &Ipv4Addr::UNSPECIFIED)?;
        // Loopback on: co-located participants must see each other's beacons.
        socket.set_multicast_loop_v4(true)?;
        // TTL 1: do not route beyond the local segment.
        socket.set_multicast_ttl_v4(1)?;

        let socket = UdpSocket::from_std(socket.into())?;
        tracing::info!(%group, "multicast transport bound");
        Ok(Self { socket, group })
    }

    /// Send one envelope to the group as a single datagram.
    pub async fn send(&self, msg: &DiscoveryMessage) -> Result<(), TransportError> {
        let data = msg.encode()?;
        self.socket.send_to(&data, self.group).await?;
        tracing::trace!(kind = ?msg.kind, bytes = data.len(), "beacon sent");
        Ok(())
    }

    /// Receive the next envelope, or `Timeout` after `timeout`.
    ///
    /// Returns the sender's IP alongside the envelope; the registry pairs it
    /// with the advertised TCP port. A datagram that does not parse (which
    /// includes anything truncated at the 1024-byte read) is a `Wire` error.
    pub async fn recv(
        &self,
        timeout: Duration,
    ) -> Result<(DiscoveryMessage, IpAddr), TransportError> {
        let mut buf = [0u8; MAX_DATAGRAM];
        let (len, from) = tokio::time::timeout(timeout, self.socket.recv_from(&mut buf))
            .await
            .map_err(|_| TransportError::Timeout)??;
        let msg = DiscoveryMessage::decode(&buf[..len])?;
        tracing::trace!(kind = ?msg.kind, peer = %msg.peer_id, from = %from, "beacon received");
        Ok((msg, from.ip()))
    }

    pub fn group(&self) -> SocketAddr {
        self.group
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }
}
