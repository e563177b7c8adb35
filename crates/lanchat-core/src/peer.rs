//! Peer records and liveness classification.

use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Liveness of a peer as derived from its discovery traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Unknown,
    /// Heard from within the stale threshold.
    Online,
    /// Quiet, but not yet past the offline threshold.
    Stale,
    /// Past the offline threshold and about to be removed.
    Offline,
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerStatus::Online => "online",
            PeerStatus::Stale => "stale",
            PeerStatus::Offline => "offline",
            PeerStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A chat participant discovered on the local segment.
#[derive(Debug, Clone)]
pub struct Peer {
    /// Session-unique identifier, `<username>_<unix-seconds>`.
    pub peer_id: String,
    pub username: String,
    /// TCP chat endpoint: the datagram's source IP paired with the
    /// advertised port.
    pub address: SocketAddr,
    pub last_seen: Instant,
    pub status: PeerStatus,
}

impl Peer {
    pub fn new(peer_id: String, username: String, address: SocketAddr) -> Self {
        Self {
            peer_id,
            username,
            address,
            last_seen: Instant::now(),
            status: PeerStatus::Online,
        }
    }

    /// Online and stale peers both count as present.
    pub fn is_alive(&self) -> bool {
        matches!(self.status, PeerStatus::Online | PeerStatus::Stale)
    }

    /// Record fresh contact.
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
        self.status = PeerStatus::Online;
    }

    /// Recompute status from elapsed silence. Monotone in `now - last_seen`.
    pub fn reclassify(&mut self, stale_after: Duration, offline_after: Duration) {
        let elapsed = self.last_seen.elapsed();
        self.status = if elapsed > offline_after {
            PeerStatus::Offline
        } else if elapsed > stale_after {
            PeerStatus::Stale
        } else {
            PeerStatus::Online
        };
    }
}

/// Generate the local peer id. Unique enough within a session; a restart
/// within the same second with the same username will collide.
pub fn local_peer_id(username: &str) -> String {
    format!("{}_{}", username, chrono::Utc::now().timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn peer() -> Peer {
        Peer::new(
            "alice_1".to_string(),
            "alice".to_string(),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9001),
        )
    }

    #[test]
    fn new_peer_is_online() {
        let p = peer();
        assert_eq!(p.status, PeerStatus::Online);
        assert!(p.is_alive());
    }

    #[test]
    fn reclassify_follows_thresholds() {
        let stale = Duration::from_secs(10);
        let offline = Duration::from_secs(30);

        let mut p = peer();
        p.last_seen = Instant::now() - Duration::from_secs(5);
        p.reclassify(stale, offline);
        assert_eq!(p.status, PeerStatus::Online);

        p.last_seen = Instant::now() - Duration::from_secs(15);
        p.reclassify(stale, offline);
        assert_eq!(p.status, PeerStatus::Stale);
        assert!(p.is_alive());

        p.last_seen = Instant::now() - Duration::from_secs(45);
        p.reclassify(stale, offline);
        assert_eq!(p.status, PeerStatus::Offline);
        assert!(!p.is_alive());
    }

    #[test]
    fn touch_restores_online() {
        let mut p = peer();
        p.status = PeerStatus::Stale;
        p.touch();
        assert_eq!(p.status, PeerStatus::Online);
    }

    #[test]
    fn local_peer_id_embeds_username() {
        let id = local_peer_id("alice");
        assert!(id.starts_with("alice_"));
        let suffix = &id["alice_".len()..];
        assert!(suffix.parse::<i64>().is_ok());
    }

    #[test]
    fn status_display() {
        assert_eq!(PeerStatus::Online.to_string(), "online");
        assert_eq!(PeerStatus::Stale.to_string(), "stale");
        assert_eq!(PeerStatus::Offline.to_string(), "offline");
        assert_eq!(PeerStatus::Unknown.to_string(), "unknown");
    }
}
