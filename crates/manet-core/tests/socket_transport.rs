//! End-to-end tests of the TCP transport on localhost.

mod common;

use common::RecordingListener;
use manet_core::prelude::*;
use std::sync::Arc;

fn node(address: u32) -> (ManetConfig, Arc<RecordingListener>) {
    let config = ManetConfig::wifi()
        .node_address(NodeAddress::new(address))
        .heartbeat_interval_ms(600_000)
        .link_secret("field-test");
    (config, Arc::new(RecordingListener::default()))
}

#[test]
fn test_dial_ping_and_deliver() {
    let (config, server_events) = node(0x10);
    let server = SocketManet::new(ManetContext::shared(config), server_events.clone())
        .listen_on("127.0.0.1:0".parse().unwrap());
    server.init().expect("server init failed");
    server.connect().expect("server connect failed");
    let addr = server.local_addr().expect("listener not bound");

    let (config, client_events) = node(0x20);
    let client = SocketManet::new(ManetContext::shared(config), client_events.clone()).with_peer(addr);
    client.init().expect("client init failed");
    client.connect().expect("client connect failed");

    assert!(client_events.wait_for_status(TransportStatus::Connected));
    assert!(server_events.wait_for_status(TransportStatus::Connected));
    assert!(client_events.wait_for_device(NodeAddress::new(0x10)));
    assert!(server_events.wait_for_device(NodeAddress::new(0x20)));
    assert_eq!(client_events.authenticated_count(), 1);

    client.ping(NodeAddress::new(0x10)).expect("ping failed");
    let (peer, rtt) = client_events.wait_for_latency().expect("no latency");
    assert_eq!(peer, NodeAddress::new(0x10));
    assert!(rtt >= 0);

    server
        .burst(Packet::raw_bytes(server.address(), client.address(), 0, b"hello client".to_vec()))
        .expect("burst failed");
    let rx = client_events.wait_for_rx(1).expect("nothing received");
    assert_eq!(rx[0].payload(), Some(&b"hello client"[..]));

    client.disconnect().expect("client disconnect failed");
    server.disconnect().expect("server disconnect failed");
    assert_eq!(server.status(), TransportStatus::Disconnected);
}

#[test]
fn test_unreachable_peer_raises_issue_after_retries() {
    // Bind then drop to get a port nobody listens on
    let addr = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap();

    let (config, events) = node(0x30);
    let config = config.reconnect(10, 2);
    let client = SocketManet::new(ManetContext::shared(config), events.clone()).with_peer(addr);
    client.init().unwrap();
    client.connect().unwrap();

    let mut issues = Vec::new();
    for _ in 0..500 {
        issues = events.issues();
        if !issues.is_empty() {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].kind(), IssueKind::AppCode);
    assert!(!issues[0].is_blocker());
    assert_eq!(client.core().ctx().stats().snapshot().reconnects, 2);
    client.disconnect().unwrap();
}
