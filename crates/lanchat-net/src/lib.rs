//! The lanchat engine: multicast peer discovery, a fully-connected TCP chat
//! mesh, and the chat service that wires the two together.
//!
//! Participants on one IP broadcast domain find each other via UDP beacons,
//! open exactly one reliable channel per peer pair (the side with the
//! smaller peer id dials), and fan chat messages out to every connected
//! peer. There is no broker and no server; every node is symmetric.

pub mod chat;
pub mod discovery;
pub mod identity;
pub mod mesh;
