//! lanchat wire format: the JSON envelopes peers exchange.
//!
//! Two envelope families share the network. `DiscoveryMessage` rides UDP
//! multicast, one compact JSON object per datagram, at most 1024 bytes.
//! `ChatMessage` rides TCP, one JSON object per newline-terminated line.
//! The serialized field names ARE the protocol; renaming one is a breaking
//! change for every peer on the segment.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Default multicast group and port for peer discovery.
pub const DEFAULT_MULTICAST_ADDR: &str = "224.0.0.1:9999";

/// Maximum discovery datagram size in bytes. One envelope per datagram;
/// there is no fragmentation layer.
pub const MAX_DATAGRAM: usize = 1024;

/// Discovery envelopes older than this on receipt are dropped.
pub const MAX_MESSAGE_AGE: Duration = Duration::from_secs(30);

/// A peer not heard from within this window is considered stale.
pub const STALE_AFTER: Duration = Duration::from_secs(10);

/// A peer not heard from within this window is removed from the registry.
pub const OFFLINE_AFTER: Duration = Duration::from_secs(30);

/// Capacity of each peer's outbound send queue.
pub const SEND_QUEUE_CAPACITY: usize = 100;

/// Capacity of the inbound message stream handed to the front-end.
pub const INBOUND_CAPACITY: usize = 100;

/// Default message history capacity.
pub const HISTORY_CAPACITY: usize = 1000;

/// The single implicit room every message is stamped with.
pub const DEFAULT_ROOM: &str = "general";

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that arise when encoding or decoding wire envelopes.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("envelope missing required field `{0}`")]
    MissingField(&'static str),

    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("datagram is {len} bytes, limit {MAX_DATAGRAM}")]
    DatagramTooLarge { len: usize },
}

// ── Discovery envelope ────────────────────────────────────────────────────────

/// Kind of a discovery envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryKind {
    /// "I'm here", the periodic presence beacon.
    Announce,
    /// "Are you still there?"
    Ping,
    /// "Yes, I'm still here."
    Pong,
    /// "I'm going offline."
    Leave,
}

/// A presence envelope broadcast on the discovery multicast group.
///
/// `port` is the authoritative TCP chat port of the sender; `address` is
/// informational only (receivers pair `port` with the datagram's source IP).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryMessage {
    #[serde(rename = "type")]
    pub kind: DiscoveryKind,
    pub peer_id: String,
    pub username: String,
    #[serde(default)]
    pub address: String,
    pub port: u16,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub sequence: u64,
}

impl DiscoveryMessage {
    pub fn new(kind: DiscoveryKind, peer_id: &str, username: &str, port: u16) -> Self {
        Self {
            kind,
            peer_id: peer_id.to_string(),
            username: username.to_string(),
            address: String::new(),
            port,
            timestamp: Utc::now(),
            sequence: 0,
        }
    }

    pub fn announce(peer_id: &str, username: &str, port: u16) -> Self {
        Self::new(DiscoveryKind::Announce, peer_id, username, port)
    }

    pub fn leave(peer_id: &str, username: &str, port: u16) -> Self {
        Self::new(DiscoveryKind::Leave, peer_id, username, port)
    }

    /// Serialize to a single compact datagram payload.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let data = serde_json::to_vec(self)?;
        if data.len() > MAX_DATAGRAM {
            return Err(WireError::DatagramTooLarge { len: data.len() });
        }
        Ok(data)
    }

    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Whether this envelope was created within `max_age` of now.
    /// Envelopes dated in the future are treated as recent.
    pub fn is_recent(&self, max_age: Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.timestamp);
        chrono::Duration::from_std(max_age)
            .map(|max| age <= max)
            .unwrap_or(true)
    }
}

// ── Chat envelope ─────────────────────────────────────────────────────────────

/// Kind of a chat envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    /// Regular text message.
    Chat,
    /// A participant joined. Also the first line on every fresh socket.
    Join,
    /// A participant left.
    Leave,
    /// Keep-alive. Never stored, never shown.
    Heartbeat,
}

/// A message exchanged over the TCP mesh, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Unique message id, the duplicate-suppression key.
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ChatKind,
    pub sender_id: String,
    pub username: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Per-sender monotone counter.
    pub sequence: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

impl ChatMessage {
    fn build(kind: ChatKind, sender_id: &str, username: &str, content: String, sequence: u64) -> Self {
        Self {
            id: generate_message_id(),
            kind,
            sender_id: sender_id.to_string(),
            username: username.to_string(),
            content,
            timestamp: Utc::now(),
            sequence,
            room_id: Some(DEFAULT_ROOM.to_string()),
            metadata: None,
        }
    }

    pub fn chat(sender_id: &str, username: &str, content: &str, sequence: u64) -> Self {
        Self::build(ChatKind::Chat, sender_id, username, content.to_string(), sequence)
    }

    pub fn join(sender_id: &str, username: &str, sequence: u64) -> Self {
        let content = format!("{username} joined the chat");
        Self::build(ChatKind::Join, sender_id, username, content, sequence)
    }

    pub fn leave(sender_id: &str, username: &str, sequence: u64) -> Self {
        let content = format!("{username} left the chat");
        Self::build(ChatKind::Leave, sender_id, username, content, sequence)
    }

    pub fn heartbeat(sender_id: &str, username: &str, sequence: u64) -> Self {
        Self::build(ChatKind::Heartbeat, sender_id, username, String::new(), sequence)
    }

    /// Serialize to one JSON line (without the trailing newline).
    pub fn to_line(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse one line received from a peer.
    ///
    /// `id` and `sender_id` must be non-empty and `type` must be a known
    /// kind; anything else is rejected and the caller drops the line.
    pub fn from_line(line: &str) -> Result<Self, WireError> {
        let msg: ChatMessage = serde_json::from_str(line)?;
        if msg.id.is_empty() {
            return Err(WireError::MissingField("id"));
        }
        if msg.sender_id.is_empty() {
            return Err(WireError::MissingField("sender_id"));
        }
        Ok(msg)
    }

    /// Heartbeats are connection plumbing, not conversation.
    pub fn is_user_visible(&self) -> bool {
        self.kind != ChatKind::Heartbeat
    }
}

impl std::fmt::Display for ChatMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ts = self.timestamp.format("%H:%M:%S");
        match self.kind {
            ChatKind::Chat => write!(f, "[{ts}] {}: {}", self.username, self.content),
            ChatKind::Join => write!(f, "[{ts}] *** {} joined", self.username),
            ChatKind::Leave => write!(f, "[{ts}] *** {} left", self.username),
            ChatKind::Heartbeat => write!(f, "[{ts}] <heartbeat from {}>", self.username),
        }
    }
}

/// Generate a 16-hex-char message id from the OS entropy source, falling
/// back to a timestamp id if the source is unavailable.
fn generate_message_id() -> String {
    let mut bytes = [0u8; 8];
    match rand::rngs::OsRng.try_fill_bytes(&mut bytes) {
        Ok(()) => hex::encode(bytes),
        Err(_) => format!("msg_{}", Utc::now().timestamp_nanos_opt().unwrap_or_default()),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
