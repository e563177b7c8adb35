//! TCP mesh connection manager.
//!
//! Keeps at most one reliable channel per peer. Both sides of a pair
//! converge on a single connection through the dial tie-break: only the
//! side with the lexicographically smaller peer id dials, the other waits
//! to be accepted. The first line on every fresh socket is a `join`
//! envelope identifying the sender; all subsequent traffic is one JSON
//! object per line.
//!
//! A misbehaving peer only ever affects its own entry; the listener and
//! every other link keep running. The retry loop resurrects failed entries
//! on an exponential backoff.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use lanchat_core::peer::Peer;
use lanchat_core::wire::{ChatMessage, SEND_QUEUE_CAPACITY};

use crate::identity::Identity;

use super::link::{LinkSnapshot, LinkState, PeerLink};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// Reading tolerates this much idle time before the link is declared dead.
const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(120);
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);
const RETRY_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("peer {0} is not connected")]
    NotConnected(String),

    #[error("send queue for peer {0} is full")]
    QueueFull(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Invoked inline on the read task for every parsed envelope; must return
/// promptly and must not block.
pub type MessageHandler = Arc<dyn Fn(ChatMessage, &str) + Send + Sync>;

pub struct ConnectionManager {
    identity: Arc<Identity>,
    listen_port: u16,
    local_port: AtomicU16,
    running: AtomicBool,
    links: DashMap<String, PeerLink>,
    handler: RwLock<Option<MessageHandler>>,
    shutdown: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(identity: Arc<Identity>, listen_port: u16) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            identity,
            listen_port,
            local_port: AtomicU16::new(0),
            running: AtomicBool::new(false),
            links: DashMap::new(),
            handler: RwLock::new(None),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn set_message_handler(&self, handler: MessageHandler) {
        *self.handler.write() = Some(handler);
    }

    /// Bind the chat listener and launch the accept and retry loops.
    /// Failure to bind is the one fatal error in this module.
    pub async fn start(self: &Arc<Self>) -> Result<(), MeshError> {
        let listener = TcpListener::bind(("0.0.0.0", self.listen_port)).await?;
        let port = listener.local_addr()?.port();
        self.local_port.store(port, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(port, "chat listener started");

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(Self::accept_loop(Arc::clone(self), listener)));
        tasks.push(tokio::spawn(Self::retry_loop(Arc::clone(self))));
        Ok(())
    }

    /// The TCP port actually bound, once started.
    pub fn local_port(&self) -> u16 {
        self.local_port.load(Ordering::SeqCst)
    }

    /// React to a discovered peer: ensure an entry exists and, when the
    /// tie-break says it is our turn, dial. Returns immediately; the dial
    /// runs on its own task.
    pub fn connect(self: &Arc<Self>, peer: &Peer) {
        {
            let mut entry = self
                .links
                .entry(peer.peer_id.clone())
                .or_insert_with(|| {
                    PeerLink::new(peer.peer_id.clone(), peer.username.clone(), peer.address)
                });
            // The latest discovery record is authoritative for who the peer
            // is and where it listens, even while a session is live.
            entry.username = peer.username.clone();
            entry.address = peer.address;
            if entry.state == LinkState::Connected || entry.state == LinkState::Connecting {
                return;
            }
        }
        if !self.should_dial(&peer.peer_id) {
            tracing::debug!(peer = %peer.peer_id, "waiting for peer to dial (id ordering)");
            return;
        }
        self.spawn_dial(peer.peer_id.clone());
    }

    /// The dial tie-break: only the smaller peer id initiates.
    fn should_dial(&self, remote_id: &str) -> bool {
        self.identity.peer_id.as_str() < remote_id
    }

    /// Non-blocking enqueue onto a connected peer's outbound queue.
    pub fn send_to(&self, peer_id: &str, msg: ChatMessage) -> Result<(), MeshError> {
        let Some(link) = self.links.get(peer_id) else {
            return Err(MeshError::NotConnected(peer_id.to_string()));
        };
        if link.state != LinkState::Connected {
            return Err(MeshError::NotConnected(peer_id.to_string()));
        }
        let Some(tx) = link.outbound.as_ref() else {
            return Err(MeshError::NotConnected(peer_id.to_string()));
        };
        tx.try_send(msg).map_err(|e| match e {
            TrySendError::Full(_) => MeshError::QueueFull(peer_id.to_string()),
            TrySendError::Closed(_) => MeshError::NotConnected(peer_id.to_string()),
        })
    }

    /// Best-effort fan-out to every connected peer. A full queue skips that
    /// peer only.
    pub fn broadcast(&self, msg: &ChatMessage) {
        let mut delivered = 0usize;
        for link in self.links.iter() {
            if link.state != LinkState::Connected {
                continue;
            }
            let Some(tx) = link.outbound.as_ref() else {
                continue;
            };
            match tx.try_send(msg.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(peer = %link.key(), "send queue full, skipping peer");
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
        tracing::debug!(kind = ?msg.kind, delivered, "broadcast");
    }

    pub fn snapshot(&self) -> Vec<LinkSnapshot> {
        self.links.iter().map(|l| l.snapshot()).collect()
    }

    pub fn connected_ids(&self) -> Vec<String> {
        self.links
            .iter()
            .filter(|l| l.state == LinkState::Connected)
            .map(|l| l.key().clone())
            .collect()
    }

    /// Stop accepting, cancel every session, and wait for all tasks.
    pub async fn stop(&self) {
        tracing::info!("stopping connection manager");
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown.send(());
        // Dropping the handler releases the inbound stream sender it holds,
        // which lets the front-end observe end-of-stream.
        *self.handler.write() = None;

        for mut link in self.links.iter_mut() {
            link.outbound = None;
            if let Some(session) = link.session.take() {
                let _ = session.send(());
            }
            link.state = LinkState::Disconnected;
        }

        // Tasks may install followers while we drain; keep going until the
        // list stays empty.
        loop {
            let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
            if tasks.is_empty() {
                break;
            }
            for task in tasks {
                let _ = task.await;
            }
        }
        tracing::info!("connection manager stopped");
    }

    // ── Accept path ───────────────────────────────────────────────────────────

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::debug!("listener stopping");
                    return;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            tracing::debug!(%addr, "inbound connection");
                            let mgr = Arc::clone(&self);
                            let handle = tokio::spawn(mgr.handle_inbound(stream, addr));
                            self.tasks.lock().push(handle);
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                        }
                    }
                }
            }
        }
    }

    /// Read the identification line off a fresh inbound socket. Peers that
    /// fail to identify within the deadline are dropped.
    async fn handle_inbound(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let mut shutdown = self.shutdown.subscribe();
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();

        let read = tokio::select! {
            _ = shutdown.recv() => {
                tracing::debug!(%addr, "shutdown before identification");
                return;
            }
            read = tokio::time::timeout(HANDSHAKE_TIMEOUT, reader.read_line(&mut line)) => read,
        };
        match read {
            Ok(Ok(0)) => {
                tracing::debug!(%addr, "peer closed before identifying");
                return;
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                tracing::warn!(%addr, error = %e, "identification read failed");
                return;
            }
            Err(_) => {
                tracing::warn!(%addr, "identification timed out");
                return;
            }
        }

        let ident = match ChatMessage::from_line(line.trim_end()) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(%addr, error = %e, "unparseable identification, dropping connection");
                return;
            }
        };

        tracing::info!(peer = %ident.sender_id, user = %ident.username, %addr, "peer identified");
        self.install_session(&ident.sender_id, &ident.username, addr, reader, write_half);
    }

    // ── Dial path ─────────────────────────────────────────────────────────────

    fn spawn_dial(self: &Arc<Self>, peer_id: String) {
        let addr = {
            let Some(mut link) = self.links.get_mut(&peer_id) else {
                return;
            };
            if link.state == LinkState::Connected || link.state == LinkState::Connecting {
                return;
            }
            link.state = LinkState::Connecting;
            link.last_attempt = Some(Instant::now());
            link.address
        };
        let mgr = Arc::clone(self);
        let handle = tokio::spawn(mgr.dial(peer_id, addr));
        self.tasks.lock().push(handle);
    }

    async fn dial(self: Arc<Self>, peer_id: String, addr: SocketAddr) {
        tracing::info!(peer = %peer_id, %addr, "dialing");
        let stream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::warn!(peer = %peer_id, %addr, error = %e, "connect failed");
                self.dial_failed(&peer_id);
                return;
            }
            Err(_) => {
                tracing::warn!(peer = %peer_id, %addr, "connect timed out");
                self.dial_failed(&peer_id);
                return;
            }
        };

        // The identification line must be first on the wire. Sequence 0: it
        // is connection plumbing, not part of the sender's message stream.
        let ident = ChatMessage::join(&self.identity.peer_id, &self.identity.username(), 0);
        let line = match ident.to_line() {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(peer = %peer_id, error = %e, "failed to serialize identification");
                self.dial_failed(&peer_id);
                return;
            }
        };

        let (read_half, mut write_half) = stream.into_split();
        let sent = tokio::time::timeout(WRITE_TIMEOUT, async {
            write_half.write_all(line.as_bytes()).await?;
            write_half.write_all(b"\n").await
        })
        .await;
        match sent {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(peer = %peer_id, error = %e, "failed to send identification");
                self.dial_failed(&peer_id);
                return;
            }
            Err(_) => {
                tracing::warn!(peer = %peer_id, "identification send timed out");
                self.dial_failed(&peer_id);
                return;
            }
        }

        let username = self
            .links
            .get(&peer_id)
            .map(|l| l.username.clone())
            .unwrap_or_default();
        tracing::info!(peer = %peer_id, %addr, "connected");
        self.install_session(&peer_id, &username, addr, BufReader::new(read_half), write_half);
    }

    fn dial_failed(&self, peer_id: &str) {
        if let Some(mut link) = self.links.get_mut(peer_id) {
            link.state = LinkState::Failed;
            link.last_attempt = Some(Instant::now());
            link.retry_count = link.retry_count.saturating_add(1);
            link.outbound = None;
            if let Some(session) = link.session.take() {
                let _ = session.send(());
            }
        }
    }

    // ── Retry loop ────────────────────────────────────────────────────────────

    async fn retry_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut interval = tokio::time::interval(RETRY_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::debug!("retry loop stopping");
                    return;
                }
                _ = interval.tick() => {
                    let now = Instant::now();
                    let due: Vec<String> = self
                        .links
                        .iter()
                        .filter(|l| l.due_for_retry(now) && self.should_dial(l.key()))
                        .map(|l| l.key().clone())
                        .collect();
                    for peer_id in due {
                        tracing::debug!(peer = %peer_id, "retrying connection");
                        self.spawn_dial(peer_id);
                    }
                }
            }
        }
    }

    // ── Session plumbing ──────────────────────────────────────────────────────

    /// Wire up a freshly identified socket: replace the entry's queue,
    /// session, and state atomically, then hand the halves to the read and
    /// write tasks. Any previous session for this peer is cancelled.
    fn install_session(
        self: &Arc<Self>,
        peer_id: &str,
        username: &str,
        addr: SocketAddr,
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    ) {
        if !self.running.load(Ordering::SeqCst) {
            tracing::debug!(peer = %peer_id, "manager stopped, discarding socket");
            return;
        }

        let (tx, rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let (session_tx, _) = broadcast::channel(1);
        // Subscribe before the sender is published so a concurrent cancel
        // cannot be missed.
        let read_session = session_tx.subscribe();
        let write_session = session_tx.subscribe();

        {
            let mut entry = self.links.entry(peer_id.to_string()).or_insert_with(|| {
                PeerLink::new(peer_id.to_string(), username.to_string(), addr)
            });
            if let Some(old) = entry.session.take() {
                tracing::debug!(peer = %peer_id, "replacing existing session");
                let _ = old.send(());
            }
            if !username.is_empty() {
                entry.username = username.to_string();
            }
            entry.address = addr;
            entry.state = LinkState::Connected;
            entry.last_seen = Instant::now();
            entry.retry_count = 0;
            entry.outbound = Some(tx);
            entry.session = Some(session_tx);
        }

        let read_task = tokio::spawn(Arc::clone(self).read_loop(
            peer_id.to_string(),
            reader,
            read_session,
        ));
        let write_task = tokio::spawn(Arc::clone(self).write_loop(
            peer_id.to_string(),
            writer,
            rx,
            write_session,
        ));
        self.tasks.lock().extend([read_task, write_task]);
    }

    /// One envelope per line until the socket dies or goes idle past the
    /// deadline. Parse failures drop the line, never the connection.
    async fn read_loop(
        self: Arc<Self>,
        peer_id: String,
        mut reader: BufReader<OwnedReadHalf>,
        mut session: broadcast::Receiver<()>,
    ) {
        let mut shutdown = self.shutdown.subscribe();
        let mut line = String::new();
        loop {
            line.clear();
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = session.recv() => {
                    tracing::debug!(peer = %peer_id, "read loop cancelled");
                    return;
                }
                read = tokio::time::timeout(READ_IDLE_TIMEOUT, reader.read_line(&mut line)) => {
                    match read {
                        Ok(Ok(0)) => {
                            tracing::info!(peer = %peer_id, "peer closed the connection");
                            self.mark_failed(&peer_id);
                            return;
                        }
                        Ok(Ok(_)) => {
                            let msg = match ChatMessage::from_line(line.trim_end()) {
                                Ok(msg) => msg,
                                Err(e) => {
                                    tracing::warn!(peer = %peer_id, error = %e, "dropping unparseable line");
                                    continue;
                                }
                            };
                            if let Some(mut link) = self.links.get_mut(&peer_id) {
                                link.last_seen = Instant::now();
                            }
                            let handler = self.handler.read().clone();
                            if let Some(handler) = handler {
                                handler(msg, &peer_id);
                            }
                        }
                        Ok(Err(e)) => {
                            tracing::warn!(peer = %peer_id, error = %e, "read failed");
                            self.mark_failed(&peer_id);
                            return;
                        }
                        Err(_) => {
                            tracing::warn!(peer = %peer_id, "connection idle past deadline");
                            self.mark_failed(&peer_id);
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Drain the peer's outbound queue onto the socket.
    async fn write_loop(
        self: Arc<Self>,
        peer_id: String,
        mut writer: OwnedWriteHalf,
        mut queue: mpsc::Receiver<ChatMessage>,
        mut session: broadcast::Receiver<()>,
    ) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = session.recv() => {
                    tracing::debug!(peer = %peer_id, "write loop cancelled");
                    return;
                }
                next = queue.recv() => {
                    let Some(msg) = next else { return };
                    let line = match msg.to_line() {
                        Ok(line) => line,
                        Err(e) => {
                            tracing::warn!(peer = %peer_id, error = %e, "failed to serialize outbound envelope");
                            continue;
                        }
                    };
                    let sent = tokio::time::timeout(WRITE_TIMEOUT, async {
                        writer.write_all(line.as_bytes()).await?;
                        writer.write_all(b"\n").await
                    })
                    .await;
                    match sent {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            tracing::warn!(peer = %peer_id, error = %e, "write failed");
                            self.mark_failed(&peer_id);
                            return;
                        }
                        Err(_) => {
                            tracing::warn!(peer = %peer_id, "write timed out");
                            self.mark_failed(&peer_id);
                            return;
                        }
                    }
                }
            }
        }
    }

    /// An I/O failure is local to this peer: flip the entry to `Failed`,
    /// cancel the session's other task, and let the retry loop take over.
    /// The retry count is untouched here; it grows only on failed dials and
    /// resets on a successful handshake.
    fn mark_failed(&self, peer_id: &str) {
        if let Some(mut link) = self.links.get_mut(peer_id) {
            if link.state != LinkState::Connected && link.state != LinkState::Connecting {
                return;
            }
            link.state = LinkState::Failed;
            link.last_attempt = Some(Instant::now());
            link.outbound = None;
            if let Some(session) = link.session.take() {
                let _ = session.send(());
            }
        }
    }
}
