//! Per-peer connection bookkeeping.

use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc};

use lanchat_core::wire::ChatMessage;

/// Longest backoff between redial attempts, in seconds.
const MAX_BACKOFF_SECS: u64 = 64;

/// Connection lifecycle for a single peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One entry per peer id, surviving reconnects.
///
/// The socket halves live inside the read/write tasks; the entry carries the
/// outbound queue, the session cancel channel, and retry bookkeeping. On a
/// successful handshake the queue and session are replaced wholesale and
/// `retry_count` resets.
pub struct PeerLink {
    pub peer_id: String,
    pub username: String,
    pub address: SocketAddr,
    pub state: LinkState,
    pub last_seen: Instant,
    pub last_attempt: Option<Instant>,
    pub retry_count: u32,
    pub(crate) outbound: Option<mpsc::Sender<ChatMessage>>,
    pub(crate) session: Option<broadcast::Sender<()>>,
}

impl PeerLink {
    pub fn new(peer_id: String, username: String, address: SocketAddr) -> Self {
        Self {
            peer_id,
            username,
            address,
            state: LinkState::Disconnected,
            last_seen: Instant::now(),
            last_attempt: None,
            retry_count: 0,
            outbound: None,
            session: None,
        }
    }

    /// How long after a failed attempt before the next dial: min(2^n, 64) s.
    pub fn backoff(&self) -> Duration {
        let secs = 1u64 << self.retry_count.min(6);
        Duration::from_secs(secs.min(MAX_BACKOFF_SECS))
    }

    /// Whether the retry loop should redial this entry now.
    pub fn due_for_retry(&self, now: Instant) -> bool {
        if self.state != LinkState::Failed {
            return false;
        }
        match self.last_attempt {
            Some(at) => now.saturating_duration_since(at) >= self.backoff(),
            None => true,
        }
    }

    pub fn snapshot(&self) -> LinkSnapshot {
        LinkSnapshot {
            peer_id: self.peer_id.clone(),
            username: self.username.clone(),
            address: self.address,
            state: self.state,
            last_seen: self.last_seen,
            retry_count: self.retry_count,
        }
    }
}

/// Copy of a link's externally visible state.
#[derive(Debug, Clone)]
pub struct LinkSnapshot {
    pub peer_id: String,
    pub username: String,
    pub address: SocketAddr,
    pub state: LinkState,
    pub last_seen: Instant,
    pub retry_count: u32,
}
