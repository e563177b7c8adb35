//! The chat service, where UDP discovery meets the TCP mesh.
//!
//! Discovery join events trigger mesh connections; mesh messages land in
//! history and on the bounded inbound stream the front-end reads. Local
//! sends fan out to every connected peer and echo back through the same
//! history path, so duplicate suppression keeps the flow idempotent.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use lanchat_core::config::{validate_username, ChatConfig, ConfigError};
use lanchat_core::wire::{ChatMessage, INBOUND_CAPACITY};

use crate::discovery::{DiscoveryService, PeerRegistry};
use crate::identity::Identity;
use crate::mesh::{ConnectionManager, LinkState};

use super::history::MessageHistory;

/// How long to let the farewell broadcast drain before teardown.
const LEAVE_GRACE: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("cannot send an empty message")]
    EmptyMessage,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Combined discovery + connection view of one peer, for the front-end.
#[derive(Debug, Clone)]
pub struct PeerOverview {
    pub peer_id: String,
    pub username: String,
    pub address: SocketAddr,
    /// Known via a discovery beacon.
    pub discovered: bool,
    /// Has a live TCP channel right now.
    pub connected: bool,
    pub state: LinkState,
    pub last_seen: Instant,
    pub retry_count: u32,
}

/// Overall service counters.
#[derive(Debug, Clone)]
pub struct ServiceStatus {
    pub username: String,
    pub peer_id: String,
    pub port: u16,
    pub discovered_peers: usize,
    pub connected_peers: usize,
    pub messages_sent: u64,
}

pub struct ChatService {
    identity: Arc<Identity>,
    registry: Arc<PeerRegistry>,
    discovery: Arc<DiscoveryService>,
    mesh: Arc<ConnectionManager>,
    history: Arc<MessageHistory>,
    sequence: Arc<AtomicU64>,
    inbound_tx: Mutex<Option<mpsc::Sender<ChatMessage>>>,
    inbound_rx: Mutex<Option<mpsc::Receiver<ChatMessage>>>,
}

impl ChatService {
    pub fn new(config: ChatConfig) -> Result<Arc<Self>, ChatError> {
        let identity = Arc::new(Identity::new(&config.username));
        Self::with_identity(identity, config)
    }

    /// Build a service with a caller-supplied identity. The peer id takes
    /// part in the dial tie-break, which is why tests pin it.
    pub fn with_identity(identity: Arc<Identity>, config: ChatConfig) -> Result<Arc<Self>, ChatError> {
        config.validate()?;
        let group = config.multicast_group()?;

        let registry = Arc::new(PeerRegistry::new());
        let mesh = Arc::new(ConnectionManager::new(Arc::clone(&identity), config.tcp_port));
        let discovery = Arc::new(DiscoveryService::new(
            Arc::clone(&identity),
            Arc::clone(&registry),
            group,
        ));
        let history = Arc::new(MessageHistory::new(config.history_capacity));
        let sequence = Arc::new(AtomicU64::new(0));
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);

        // Discovery found someone: open a channel and say hello. The
        // greeting is best effort; the dial also identifies us on its own.
        {
            let mesh = Arc::clone(&mesh);
            let identity = Arc::clone(&identity);
            let sequence = Arc::clone(&sequence);
            let on_join = Arc::new(move |peer: &lanchat_core::peer::Peer| {
                tracing::info!(peer = %peer.peer_id, user = %peer.username, "discovered peer, connecting");
                mesh.connect(peer);
                let seq = sequence.fetch_add(1, Ordering::Relaxed) + 1;
                let hello = ChatMessage::join(&identity.peer_id, &identity.username(), seq);
                if let Err(e) = mesh.send_to(&peer.peer_id, hello) {
                    tracing::debug!(peer = %peer.peer_id, error = %e, "greeting not delivered");
                }
            });
            // Presence is discovery's verdict; reachability is the read
            // task's. No teardown here.
            let on_leave = Arc::new(|peer: &lanchat_core::peer::Peer| {
                tracing::info!(peer = %peer.peer_id, user = %peer.username, "peer left discovery");
            });
            registry.set_event_handlers(on_join, on_leave);
        }

        // Mesh delivered a message: store it, and publish to the front-end
        // unless history suppressed it (duplicate or heartbeat).
        {
            let history = Arc::clone(&history);
            let inbound = inbound_tx.clone();
            mesh.set_message_handler(Arc::new(move |msg: ChatMessage, from: &str| {
                tracing::debug!(peer = %from, kind = ?msg.kind, "message received");
                if history.add(msg.clone()) && inbound.try_send(msg).is_err() {
                    tracing::warn!(peer = %from, "inbound stream full, dropping message");
                }
            }));
        }

        Ok(Arc::new(Self {
            identity,
            registry,
            discovery,
            mesh,
            history,
            sequence,
            inbound_tx: Mutex::new(Some(inbound_tx)),
            inbound_rx: Mutex::new(Some(inbound_rx)),
        }))
    }

    /// Start the mesh listener first to learn the bound port, then
    /// discovery, which advertises it. Either bind failure is fatal.
    pub async fn start(&self) -> anyhow::Result<()> {
        tracing::info!(
            user = %self.identity.username(),
            peer_id = %self.identity.peer_id,
            "starting chat service"
        );
        self.mesh.start().await?;
        self.discovery.start(self.mesh.local_port()).await?;
        Ok(())
    }

    /// Broadcast a farewell, let it drain, then stop the mesh, discovery,
    /// and the inbound stream, in that order.
    pub async fn stop(&self) {
        tracing::info!("stopping chat service");
        let bye = ChatMessage::leave(
            &self.identity.peer_id,
            &self.identity.username(),
            self.next_sequence(),
        );
        self.mesh.broadcast(&bye);
        tokio::time::sleep(LEAVE_GRACE).await;

        self.mesh.stop().await;
        self.discovery.stop().await;
        self.inbound_tx.lock().take();
        tracing::info!("chat service stopped");
    }

    /// Send a text message to everyone, including our own front-end.
    pub fn send_message(&self, text: &str) -> Result<(), ChatError> {
        if text.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let msg = ChatMessage::chat(
            &self.identity.peer_id,
            &self.identity.username(),
            text,
            self.next_sequence(),
        );
        self.mesh.broadcast(&msg);
        self.store_and_publish(msg);
        Ok(())
    }

    /// Change the display name and tell the room about it.
    pub fn change_username(&self, new_name: &str) -> Result<(), ChatError> {
        validate_username(new_name)?;
        let old = self.identity.username();
        self.identity.set_username(new_name);

        let notice = ChatMessage::chat(
            &self.identity.peer_id,
            new_name,
            &format!("{old} is now known as {new_name}"),
            self.next_sequence(),
        );
        self.mesh.broadcast(&notice);
        self.store_and_publish(notice);
        tracing::info!(%old, new = %new_name, "username changed");
        Ok(())
    }

    /// Announce ourselves to every connected peer.
    pub fn notify_join(&self) {
        let msg = ChatMessage::join(
            &self.identity.peer_id,
            &self.identity.username(),
            self.next_sequence(),
        );
        self.mesh.broadcast(&msg);
    }

    /// Keep-alive probe. Heartbeats never enter history or the inbound
    /// stream on the receiving side.
    pub fn send_heartbeat(&self) {
        let msg = ChatMessage::heartbeat(
            &self.identity.peer_id,
            &self.identity.username(),
            self.next_sequence(),
        );
        self.mesh.broadcast(&msg);
    }

    /// Hand the inbound message stream to the front-end. Yields once.
    pub fn take_inbound(&self) -> Option<mpsc::Receiver<ChatMessage>> {
        self.inbound_rx.lock().take()
    }

    pub fn get_history(&self, limit: Option<usize>) -> Vec<ChatMessage> {
        match limit {
            Some(n) => self.history.recent(n),
            None => self.history.messages(),
        }
    }

    pub fn clear_history(&self) {
        self.history.clear();
    }

    /// One row per peer, merging what discovery and the mesh each know.
    pub fn snapshot_peers(&self) -> Vec<PeerOverview> {
        let links: HashMap<String, _> = self
            .mesh
            .snapshot()
            .into_iter()
            .map(|l| (l.peer_id.clone(), l))
            .collect();

        let mut overview = Vec::new();
        for peer in self.registry.snapshot_online() {
            let link = links.get(&peer.peer_id);
            overview.push(PeerOverview {
                peer_id: peer.peer_id.clone(),
                username: peer.username,
                address: peer.address,
                discovered: true,
                connected: link.map_or(false, |l| l.state == LinkState::Connected),
                state: link.map_or(LinkState::Disconnected, |l| l.state),
                last_seen: peer.last_seen,
                retry_count: link.map_or(0, |l| l.retry_count),
            });
        }

        // Links with no discovery record yet, e.g. an inbound connection
        // that raced ahead of the first beacon.
        for (peer_id, link) in links {
            if overview.iter().any(|p| p.peer_id == peer_id) {
                continue;
            }
            overview.push(PeerOverview {
                peer_id,
                username: link.username,
                address: link.address,
                discovered: false,
                connected: link.state == LinkState::Connected,
                state: link.state,
                last_seen: link.last_seen,
                retry_count: link.retry_count,
            });
        }
        overview
    }

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            username: self.identity.username(),
            peer_id: self.identity.peer_id.clone(),
            port: self.mesh.local_port(),
            discovered_peers: self.registry.count_online(),
            connected_peers: self.mesh.connected_ids().len(),
            messages_sent: self.sequence.load(Ordering::Relaxed),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.identity.peer_id
    }

    pub fn username(&self) -> String {
        self.identity.username()
    }

    pub fn local_port(&self) -> u16 {
        self.mesh.local_port()
    }

    pub fn registry(&self) -> Arc<PeerRegistry> {
        Arc::clone(&self.registry)
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn store_and_publish(&self, msg: ChatMessage) {
        if !self.history.add(msg.clone()) {
            return;
        }
        let tx = self.inbound_tx.lock().clone();
        if let Some(tx) = tx {
            if tx.try_send(msg).is_err() {
                tracing::warn!("inbound stream full, dropping local echo");
            }
        }
    }
}
