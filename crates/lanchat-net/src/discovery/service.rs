//! Discovery service: periodic beacons, inbound demux, stale sweeps.
//!
//! Three cooperative tasks share one shutdown channel: the beacon task
//! announces presence every 5 s, the receive task drains the multicast
//! socket with a 1 s poll, and the sweep task removes silent peers every
//! 10 s. Beacon failures are logged and retried next tick, never fatal.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use lanchat_core::wire::{DiscoveryKind, DiscoveryMessage, MAX_MESSAGE_AGE};

use crate::identity::Identity;

use super::registry::PeerRegistry;
use super::transport::{MulticastTransport, TransportError};

const BEACON_INTERVAL: Duration = Duration::from_secs(5);
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);
const RECV_TIMEOUT: Duration = Duration::from_secs(1);
/// How long to let the final leave envelope egress before tearing down.
const LEAVE_GRACE: Duration = Duration::from_millis(100);

pub struct DiscoveryService {
    identity: Arc<Identity>,
    registry: Arc<PeerRegistry>,
    group: SocketAddr,
    transport: OnceLock<Arc<MulticastTransport>>,
    tcp_port: AtomicU16,
    sequence: Arc<AtomicU64>,
    shutdown: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DiscoveryService {
    pub fn new(identity: Arc<Identity>, registry: Arc<PeerRegistry>, group: SocketAddr) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            identity,
            registry,
            group,
            transport: OnceLock::new(),
            tcp_port: AtomicU16::new(0),
            sequence: Arc::new(AtomicU64::new(0)),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn registry(&self) -> Arc<PeerRegistry> {
        Arc::clone(&self.registry)
    }

    /// Bind the multicast group and launch the beacon / receive / sweep
    /// tasks. `tcp_port` is the chat listener's bound port, advertised in
    /// every beacon.
    pub async fn start(&self, tcp_port: u16) -> Result<(), TransportError> {
        let transport = Arc::new(MulticastTransport::bind(self.group)?);
        if self.transport.set(Arc::clone(&transport)).is_err() {
            tracing::warn!("discovery service already started");
            return Ok(());
        }
        self.tcp_port.store(tcp_port, Ordering::SeqCst);

        tracing::info!(
            peer_id = %self.identity.peer_id,
            group = %self.group,
            tcp_port,
            "discovery service starting"
        );

        // First announce goes out immediately, best effort.
        let hello = self.make_beacon(DiscoveryKind::Announce, tcp_port, &transport);
        if let Err(e) = transport.send(&hello).await {
            tracing::warn!(error = %e, "initial announce failed");
        }

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(beacon_loop(
            Arc::clone(&transport),
            Arc::clone(&self.identity),
            Arc::clone(&self.sequence),
            tcp_port,
            self.shutdown.subscribe(),
        )));
        tasks.push(tokio::spawn(receive_loop(
            Arc::clone(&transport),
            Arc::clone(&self.registry),
            self.identity.peer_id.clone(),
            self.shutdown.subscribe(),
        )));
        tasks.push(tokio::spawn(sweep_loop(
            Arc::clone(&self.registry),
            self.shutdown.subscribe(),
        )));
        Ok(())
    }

    /// Announce departure, give the datagram a moment to egress, then stop
    /// all tasks. Errors on the way out are suppressed.
    pub async fn stop(&self) {
        if let Some(transport) = self.transport.get() {
            let tcp_port = self.tcp_port.load(Ordering::SeqCst);
            let bye = self.make_beacon(DiscoveryKind::Leave, tcp_port, transport);
            if let Err(e) = transport.send(&bye).await {
                tracing::debug!(error = %e, "leave announce failed");
            }
            tokio::time::sleep(LEAVE_GRACE).await;
        }

        let _ = self.shutdown.send(());
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        tracing::info!("discovery service stopped");
    }

    fn make_beacon(
        &self,
        kind: DiscoveryKind,
        tcp_port: u16,
        transport: &MulticastTransport,
    ) -> DiscoveryMessage {
        let mut msg = DiscoveryMessage::new(
            kind,
            &self.identity.peer_id,
            &self.identity.username(),
            tcp_port,
        );
        msg.sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        msg.address = address_hint(transport, tcp_port);
        msg
    }
}

/// Informational `address` field: the receiver derives the real endpoint
/// from the datagram source, this is for humans reading logs.
fn address_hint(transport: &MulticastTransport, tcp_port: u16) -> String {
    let ip = transport
        .local_addr()
        .map(|a| a.ip().to_string())
        .unwrap_or_else(|| "0.0.0.0".to_string());
    format!("{ip}:{tcp_port}")
}

async fn beacon_loop(
    transport: Arc<MulticastTransport>,
    identity: Arc<Identity>,
    sequence: Arc<AtomicU64>,
    tcp_port: u16,
    mut shutdown: broadcast::Receiver<()>,
) {
    // The immediate announce already went out in start(); begin one full
    // interval from now.
    let start = tokio::time::Instant::now() + BEACON_INTERVAL;
    let mut interval = tokio::time::interval_at(start, BEACON_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::debug!("beacon loop stopping");
                return;
            }
            _ = interval.tick() => {
                let mut msg = DiscoveryMessage::announce(
                    &identity.peer_id,
                    &identity.username(),
                    tcp_port,
                );
                msg.sequence = sequence.fetch_add(1, Ordering::Relaxed) + 1;
                msg.address = address_hint(&transport, tcp_port);
                if let Err(e) = transport.send(&msg).await {
                    tracing::warn!(error = %e, "beacon send failed");
                }
            }
        }
    }
}

async fn receive_loop(
    transport: Arc<MulticastTransport>,
    registry: Arc<PeerRegistry>,
    local_peer_id: String,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::debug!("discovery receive loop stopping");
                return;
            }
            result = transport.recv(RECV_TIMEOUT) => {
                match result {
                    Ok((msg, sender_ip)) => dispatch(&registry, &local_peer_id, msg, sender_ip),
                    Err(TransportError::Timeout) => {}
                    Err(TransportError::Wire(e)) => {
                        tracing::debug!(error = %e, "dropping malformed datagram");
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "discovery receive failed");
                    }
                }
            }
        }
    }
}

async fn sweep_loop(registry: Arc<PeerRegistry>, mut shutdown: broadcast::Receiver<()>) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::debug!("sweep loop stopping");
                return;
            }
            _ = interval.tick() => registry.sweep(),
        }
    }
}

/// Route one inbound envelope. Own beacons (multicast loopback echoes) and
/// anything older than 30 s are dropped before they touch the registry.
fn dispatch(registry: &PeerRegistry, local_peer_id: &str, msg: DiscoveryMessage, sender_ip: IpAddr) {
    if msg.peer_id == local_peer_id {
        return;
    }
    if !msg.is_recent(MAX_MESSAGE_AGE) {
        tracing::debug!(peer = %msg.peer_id, "ignoring stale beacon");
        return;
    }
    match msg.kind {
        DiscoveryKind::Announce | DiscoveryKind::Ping | DiscoveryKind::Pong => {
            registry.upsert(&msg, sender_ip);
        }
        DiscoveryKind::Leave => registry.remove(&msg.peer_id),
    }
}
