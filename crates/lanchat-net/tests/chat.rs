//! End-to-end chat tests: two full services over loopback TCP, with
//! discovery driven by injecting beacons into the registry so the tests do
//! not depend on the environment's multicast routing.
//!
//! If the multicast socket itself cannot be created the test skips, the
//! same way the netns-dependent suites skip without their environment.

use std::sync::Arc;
use std::time::Duration;

use lanchat_core::config::ChatConfig;
use lanchat_core::wire::{ChatKind, ChatMessage, DiscoveryMessage};
use lanchat_net::chat::ChatService;
use lanchat_net::identity::Identity;
use lanchat_net::mesh::LinkState;

fn config(username: &str, group: &str) -> ChatConfig {
    ChatConfig {
        username: username.to_string(),
        tcp_port: 0,
        multicast_addr: group.to_string(),
        ..ChatConfig::default()
    }
}

fn pinned_service(peer_id: &str, username: &str, group: &str) -> Arc<ChatService> {
    let identity = Arc::new(Identity::with_peer_id(peer_id, username));
    ChatService::with_identity(identity, config(username, group)).expect("service should build")
}

async fn start_or_skip(svc: &ChatService) -> bool {
    match svc.start().await {
        Ok(()) => true,
        Err(e) => {
            eprintln!("SKIP: cannot start service in this environment: {e:#}");
            false
        }
    }
}

/// Tell `svc` about a peer the way its discovery receive task would.
fn introduce(svc: &ChatService, peer: &ChatService) {
    let mut beacon = DiscoveryMessage::announce(peer.peer_id(), &peer.username(), peer.local_port());
    beacon.sequence = 1;
    svc.registry().upsert(&beacon, "127.0.0.1".parse().unwrap());
}

async fn wait_connected(svc: &ChatService, peer_id: &str) {
    for _ in 0..200 {
        if svc
            .snapshot_peers()
            .iter()
            .any(|p| p.peer_id == peer_id && p.connected)
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("{} never connected to {peer_id}", svc.peer_id());
}

async fn next_chat(inbound: &mut tokio::sync::mpsc::Receiver<ChatMessage>) -> ChatMessage {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(3), inbound.recv())
            .await
            .expect("timed out waiting for a chat message")
            .expect("inbound stream closed");
        if msg.kind == ChatKind::Chat {
            return msg;
        }
    }
}

#[tokio::test]
async fn two_services_mesh_and_exchange_messages() {
    let group = "239.255.42.21:17421";
    let a = pinned_service("alice_100", "alice", group);
    let b = pinned_service("bob_100", "bob", group);

    if !start_or_skip(&a).await || !start_or_skip(&b).await {
        return;
    }

    let mut a_inbound = a.take_inbound().expect("a inbound");
    let mut b_inbound = b.take_inbound().expect("b inbound");

    // Each side hears one beacon from the other. Only alice dials.
    introduce(&a, &b);
    introduce(&b, &a);

    wait_connected(&a, "bob_100").await;
    wait_connected(&b, "alice_100").await;

    // exactly one link each, and the link-table state agrees
    assert_eq!(a.status().connected_peers, 1);
    assert_eq!(b.status().connected_peers, 1);
    assert!(a
        .snapshot_peers()
        .iter()
        .any(|p| p.peer_id == "bob_100" && p.state == LinkState::Connected));

    // A speaks; B hears it and A sees its own echo.
    a.send_message("hello").expect("send should succeed");

    let received = next_chat(&mut b_inbound).await;
    assert_eq!(received.sender_id, "alice_100");
    assert_eq!(received.content, "hello");

    let echoed = next_chat(&mut a_inbound).await;
    assert_eq!(echoed.id, received.id);

    // both histories hold exactly one chat entry with that id
    let a_chats: Vec<_> = a
        .get_history(None)
        .into_iter()
        .filter(|m| m.kind == ChatKind::Chat)
        .collect();
    let b_chats: Vec<_> = b
        .get_history(None)
        .into_iter()
        .filter(|m| m.kind == ChatKind::Chat)
        .collect();
    assert_eq!(a_chats.len(), 1);
    assert_eq!(b_chats.len(), 1);
    assert_eq!(a_chats[0].id, b_chats[0].id);

    // B replies.
    b.send_message("hi alice").expect("send should succeed");
    let received = next_chat(&mut a_inbound).await;
    assert_eq!(received.sender_id, "bob_100");
    assert_eq!(received.content, "hi alice");

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn leave_beacon_removes_peer_from_registry() {
    let group = "239.255.42.22:17422";
    let a = pinned_service("alice_200", "alice", group);

    if !start_or_skip(&a).await {
        return;
    }

    let mut beacon = DiscoveryMessage::announce("bob_200", "bob", 9002);
    beacon.sequence = 1;
    a.registry().upsert(&beacon, "127.0.0.1".parse().unwrap());
    assert_eq!(a.status().discovered_peers, 1);

    a.registry().remove("bob_200");
    assert_eq!(a.status().discovered_peers, 0);
    assert!(a
        .snapshot_peers()
        .iter()
        .all(|p| p.peer_id != "bob_200" || !p.discovered));

    a.stop().await;
}
