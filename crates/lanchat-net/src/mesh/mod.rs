//! The TCP chat mesh: one reliable channel per peer, dialed by the side
//! with the smaller peer id and resurrected with exponential backoff.

pub mod link;
pub mod manager;

pub use link::{LinkSnapshot, LinkState};
pub use manager::{ConnectionManager, MeshError, MessageHandler};
