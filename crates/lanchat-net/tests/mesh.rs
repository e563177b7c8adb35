//! Mesh integration tests over loopback TCP.
//!
//! Two managers, real sockets, no multicast involved: peers are introduced
//! by hand the way the discovery layer would.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use lanchat_core::peer::Peer;
use lanchat_core::wire::ChatMessage;
use lanchat_net::identity::Identity;
use lanchat_net::mesh::{ConnectionManager, LinkState, MeshError};

type Inbound = mpsc::UnboundedReceiver<(ChatMessage, String)>;

async fn started_manager(peer_id: &str, username: &str) -> (Arc<ConnectionManager>, Inbound) {
    let identity = Arc::new(Identity::with_peer_id(peer_id, username));
    let mgr = Arc::new(ConnectionManager::new(identity, 0));
    let (tx, rx) = mpsc::unbounded_channel();
    mgr.set_message_handler(Arc::new(move |msg, from| {
        let _ = tx.send((msg, from.to_string()));
    }));
    mgr.start().await.expect("manager should bind on loopback");
    (mgr, rx)
}

fn peer_for(mgr: &ConnectionManager, peer_id: &str, username: &str) -> Peer {
    Peer::new(
        peer_id.to_string(),
        username.to_string(),
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), mgr.local_port()),
    )
}

async fn wait_for_state(mgr: &ConnectionManager, peer_id: &str, state: LinkState) {
    for _ in 0..200 {
        if mgr
            .snapshot()
            .iter()
            .any(|l| l.peer_id == peer_id && l.state == state)
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("peer {peer_id} never reached state {state}");
}

#[tokio::test]
async fn tie_break_builds_exactly_one_connection() {
    let (a, _a_rx) = started_manager("alice_1", "alice").await;
    let (b, _b_rx) = started_manager("bob_1", "bob").await;

    // Both sides learn about each other; only alice (smaller id) dials.
    a.connect(&peer_for(&b, "bob_1", "bob"));
    b.connect(&peer_for(&a, "alice_1", "alice"));

    wait_for_state(&a, "bob_1", LinkState::Connected).await;
    wait_for_state(&b, "alice_1", LinkState::Connected).await;

    assert_eq!(a.connected_ids(), vec!["bob_1".to_string()]);
    assert_eq!(b.connected_ids(), vec!["alice_1".to_string()]);

    // one entry per peer on each side
    assert_eq!(a.snapshot().len(), 1);
    assert_eq!(b.snapshot().len(), 1);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn messages_flow_both_ways() {
    let (a, mut a_rx) = started_manager("alice_2", "alice").await;
    let (b, mut b_rx) = started_manager("bob_2", "bob").await;

    a.connect(&peer_for(&b, "bob_2", "bob"));
    b.connect(&peer_for(&a, "alice_2", "alice"));
    wait_for_state(&a, "bob_2", LinkState::Connected).await;
    wait_for_state(&b, "alice_2", LinkState::Connected).await;

    let hello = ChatMessage::chat("alice_2", "alice", "hello", 1);
    a.broadcast(&hello);

    let (got, from) = tokio::time::timeout(Duration::from_secs(2), b_rx.recv())
        .await
        .expect("timed out waiting for broadcast")
        .expect("handler stream closed");
    assert_eq!(from, "alice_2");
    assert_eq!(got.id, hello.id);
    assert_eq!(got.content, "hello");
    assert_eq!(got.sequence, 1);

    let reply = ChatMessage::chat("bob_2", "bob", "hi back", 1);
    b.send_to("alice_2", reply.clone())
        .expect("send_to a connected peer should succeed");

    let (got, from) = tokio::time::timeout(Duration::from_secs(2), a_rx.recv())
        .await
        .expect("timed out waiting for reply")
        .expect("handler stream closed");
    assert_eq!(from, "bob_2");
    assert_eq!(got.id, reply.id);
    assert_eq!(got.content, "hi back");

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn send_to_unknown_peer_reports_not_connected() {
    let (a, _rx) = started_manager("carol_1", "carol").await;
    let err = a
        .send_to("nobody_1", ChatMessage::chat("carol_1", "carol", "x", 1))
        .unwrap_err();
    assert!(matches!(err, MeshError::NotConnected(_)));
    a.stop().await;
}

#[tokio::test]
async fn peer_shutdown_fails_the_link() {
    let (a, _a_rx) = started_manager("alice_3", "alice").await;
    let (b, _b_rx) = started_manager("bob_3", "bob").await;

    a.connect(&peer_for(&b, "bob_3", "bob"));
    wait_for_state(&a, "bob_3", LinkState::Connected).await;

    // B goes away; A's read task sees the close and fails the entry.
    b.stop().await;
    wait_for_state(&a, "bob_3", LinkState::Failed).await;

    // the entry survives for the retry loop; it is not removed
    assert_eq!(a.snapshot().len(), 1);
    assert!(a.connected_ids().is_empty());

    let err = a
        .send_to("bob_3", ChatMessage::chat("alice_3", "alice", "x", 2))
        .unwrap_err();
    assert!(matches!(err, MeshError::NotConnected(_)));

    a.stop().await;
}

#[tokio::test]
async fn unparseable_identification_is_rejected() {
    use tokio::io::AsyncWriteExt;

    let (a, _rx) = started_manager("dave_1", "dave").await;
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), a.local_port());

    let mut socket = tokio::net::TcpStream::connect(addr)
        .await
        .expect("connect to listener");
    socket
        .write_all(b"this is not json\n")
        .await
        .expect("write garbage");

    // give the listener a moment to reject it
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(a.snapshot().is_empty(), "no entry for an unidentified peer");

    a.stop().await;
}
