//! Local participant identity.

use parking_lot::RwLock;

/// Who this process is on the network.
///
/// The peer id is fixed for the life of the session and doubles as the dial
/// tie-breaker; the display name can change at any time.
pub struct Identity {
    pub peer_id: String,
    username: RwLock<String>,
}

impl Identity {
    pub fn new(username: &str) -> Self {
        Self::with_peer_id(lanchat_core::peer::local_peer_id(username), username)
    }

    pub fn with_peer_id(peer_id: impl Into<String>, username: &str) -> Self {
        Self {
            peer_id: peer_id.into(),
            username: RwLock::new(username.to_string()),
        }
    }

    pub fn username(&self) -> String {
        self.username.read().clone()
    }

    pub fn set_username(&self, new_name: impl Into<String>) {
        *self.username.write() = new_name.into();
    }
}
