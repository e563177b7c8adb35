//! The chat layer: message history plus the service that wires discovery
//! into the mesh and publishes inbound messages to the front-end.

pub mod history;
pub mod service;

pub use history::{HistoryStats, MessageHistory};
pub use service::{ChatError, ChatService, PeerOverview, ServiceStatus};
