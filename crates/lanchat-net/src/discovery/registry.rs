//! Registry of peers currently known via discovery.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use lanchat_core::peer::{Peer, PeerStatus};
use lanchat_core::wire::{DiscoveryMessage, OFFLINE_AFTER, STALE_AFTER};

/// Handler invoked when a peer joins or leaves. Runs inline on the
/// discovery task; must return promptly and must not block.
pub type PeerCallback = Arc<dyn Fn(&Peer) + Send + Sync>;

/// Thread-safe table of discovered peers.
///
/// Callbacks fire after the write guard is released and receive a copy of
/// the record, so a handler may call back into the registry.
pub struct PeerRegistry {
    peers: RwLock<HashMap<String, Peer>>,
    stale_after: Duration,
    offline_after: Duration,
    on_join: RwLock<Option<PeerCallback>>,
    on_leave: RwLock<Option<PeerCallback>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::with_thresholds(STALE_AFTER, OFFLINE_AFTER)
    }

    pub fn with_thresholds(stale_after: Duration, offline_after: Duration) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            stale_after,
            offline_after,
            on_join: RwLock::new(None),
            on_leave: RwLock::new(None),
        }
    }

    pub fn set_event_handlers(&self, on_join: PeerCallback, on_leave: PeerCallback) {
        *self.on_join.write() = Some(on_join);
        *self.on_leave.write() = Some(on_leave);
    }

    /// Insert a new peer or refresh an existing one.
    ///
    /// The chat endpoint is the datagram's source IP paired with the port
    /// advertised in the envelope. `on_join` fires only for first contact.
    pub fn upsert(&self, msg: &DiscoveryMessage, sender_ip: IpAddr) {
        let mut joined = None;
        {
            let mut peers = self.peers.write();
            match peers.get_mut(&msg.peer_id) {
                Some(existing) => {
                    existing.touch();
                    tracing::trace!(peer = %msg.peer_id, "peer refreshed");
                }
                None => {
                    let address = SocketAddr::new(sender_ip, msg.port);
                    let peer = Peer::new(msg.peer_id.clone(), msg.username.clone(), address);
                    tracing::debug!(peer = %peer.peer_id, user = %peer.username, %address, "peer joined");
                    joined = Some(peer.clone());
                    peers.insert(msg.peer_id.clone(), peer);
                }
            }
        }
        if let Some(peer) = joined {
            if let Some(on_join) = self.on_join.read().clone() {
                on_join(&peer);
            }
        }
    }

    /// Reclassify every peer and drop the ones that crossed the offline
    /// threshold. Removal and the offline transition are atomic; `on_leave`
    /// fires once per removed peer afterwards.
    pub fn sweep(&self) {
        let mut removed = Vec::new();
        {
            let mut peers = self.peers.write();
            peers.retain(|_, peer| {
                peer.reclassify(self.stale_after, self.offline_after);
                if peer.status == PeerStatus::Offline {
                    removed.push(peer.clone());
                    false
                } else {
                    true
                }
            });
        }
        if removed.is_empty() {
            return;
        }
        tracing::debug!(count = removed.len(), "swept offline peers");
        if let Some(on_leave) = self.on_leave.read().clone() {
            for peer in &removed {
                on_leave(peer);
            }
        }
    }

    /// Explicit removal, for graceful leave envelopes.
    pub fn remove(&self, peer_id: &str) {
        let removed = self.peers.write().remove(peer_id);
        if let Some(peer) = removed {
            tracing::debug!(peer = %peer.peer_id, user = %peer.username, "peer left");
            if let Some(on_leave) = self.on_leave.read().clone() {
                on_leave(&peer);
            }
        }
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.read().contains_key(peer_id)
    }

    pub fn snapshot(&self) -> Vec<Peer> {
        self.peers.read().values().cloned().collect()
    }

    pub fn snapshot_online(&self) -> Vec<Peer> {
        self.peers
            .read()
            .values()
            .filter(|p| p.is_alive())
            .cloned()
            .collect()
    }

    pub fn count_online(&self) -> usize {
        self.peers.read().values().filter(|p| p.is_alive()).count()
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
