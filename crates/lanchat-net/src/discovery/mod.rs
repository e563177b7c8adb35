//! Peer discovery over UDP multicast: transport, registry, and the service
//! that runs the beacon / receive / sweep tasks.

pub mod registry;
pub mod service;
pub mod transport;

pub use registry::{PeerCallback, PeerRegistry};
pub use service::DiscoveryService;
pub use transport::{MulticastTransport, TransportError};
