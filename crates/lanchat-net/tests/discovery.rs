//! Multicast transport tests.
//!
//! Loopback multicast depends on the host's routing setup, so the
//! round-trip test skips gracefully when the environment cannot do it.

use std::time::Duration;

use lanchat_net::discovery::{MulticastTransport, TransportError};

use lanchat_core::wire::{DiscoveryKind, DiscoveryMessage};

#[tokio::test]
async fn bind_rejects_non_multicast_addresses() {
    let err = MulticastTransport::bind("127.0.0.1:9999".parse().unwrap()).unwrap_err();
    assert!(matches!(err, TransportError::NotMulticast(_)));
}

#[tokio::test]
async fn send_rejects_oversized_envelopes() {
    let transport = match MulticastTransport::bind("239.255.42.31:17431".parse().unwrap()) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("SKIP: multicast unavailable: {e}");
            return;
        }
    };

    let mut msg = DiscoveryMessage::announce("alice_1", "alice", 9001);
    msg.address = "x".repeat(2048);
    let err = transport.send(&msg).await.unwrap_err();
    assert!(matches!(
        err,
        TransportError::Wire(lanchat_core::wire::WireError::DatagramTooLarge { .. })
    ));
}

#[tokio::test]
async fn beacon_round_trips_over_loopback() {
    let transport = match MulticastTransport::bind("239.255.42.32:17432".parse().unwrap()) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("SKIP: multicast unavailable: {e}");
            return;
        }
    };

    let mut sent = DiscoveryMessage::announce("alice_1", "alice", 9001);
    sent.sequence = 7;
    if let Err(e) = transport.send(&sent).await {
        eprintln!("SKIP: multicast send failed: {e}");
        return;
    }

    // IP_MULTICAST_LOOP is on, so our own datagram should come back.
    match transport.recv(Duration::from_secs(2)).await {
        Ok((got, _sender)) => {
            assert_eq!(got.kind, DiscoveryKind::Announce);
            assert_eq!(got.peer_id, "alice_1");
            assert_eq!(got.port, 9001);
            assert_eq!(got.sequence, 7);
        }
        Err(TransportError::Timeout) => {
            eprintln!("SKIP: loopback multicast not routed in this environment");
        }
        Err(e) => panic!("unexpected receive error: {e}"),
    }
}
