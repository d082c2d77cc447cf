//! Integration tests for the Node public API.
//!
//! These run real nodes over loopback TCP and exercise the public surface:
//! bind, bootstrap, put/get/delete, iterative lookups and shutdown.

use std::time::Duration;

use cinder::{hash_content, BootstrapPeer, Node, NodeConfig};
use tokio::time::sleep;

/// Settling time for fire-and-forget replication to land.
const REPLICATION_GRACE: Duration = Duration::from_millis(300);

async fn bind_node(bootstrap: Vec<BootstrapPeer>) -> Node {
    Node::bind(NodeConfig {
        bootstrap,
        ..NodeConfig::default()
    })
    .await
    .expect("bind failed")
}

fn peer_of(node: &Node) -> BootstrapPeer {
    let addr = node.address();
    BootstrapPeer {
        ip: addr.ip,
        port: addr.port,
        id: Some(addr.id),
    }
}

#[tokio::test]
async fn solo_put_get_round_trip() {
    let node = bind_node(Vec::new()).await;

    let key = node.put(b"hello".to_vec()).await.expect("put failed");
    assert_eq!(key, hash_content(b"hello").to_base58());

    let value = node.get(&key).await.expect("get failed");
    assert_eq!(value, Some(b"hello".to_vec()));

    node.shutdown().await;
}

#[tokio::test]
async fn absent_key_is_a_normal_miss() {
    let node = bind_node(Vec::new()).await;

    // 27 'z' characters decode to a full-width 20-byte key.
    let absent = "z".repeat(27);
    assert_eq!(node.get(&absent).await.expect("get failed"), None);

    node.shutdown().await;
}

#[tokio::test]
async fn malformed_key_is_rejected() {
    let node = bind_node(Vec::new()).await;

    assert!(node.get("not-base58-0OIl").await.is_err());
    assert!(node.get("abc").await.is_err());

    node.shutdown().await;
}

#[tokio::test]
async fn delete_forgets_locally() {
    let node = bind_node(Vec::new()).await;

    let key = node.put(b"short lived".to_vec()).await.unwrap();
    node.delete(&key).await.unwrap();
    assert_eq!(node.get(&key).await.unwrap(), None);

    node.shutdown().await;
}

#[tokio::test]
async fn two_node_federation_replicates_put() {
    let hub = bind_node(Vec::new()).await;
    let joiner = bind_node(vec![peer_of(&hub)]).await;

    joiner.bootstrap().await.expect("bootstrap failed");

    // The joiner can route to the hub...
    let found = joiner.find_node(hub.id()).await.expect("lookup failed");
    assert!(found.iter().any(|addr| addr.id == hub.id()));

    // ...and a publish from the joiner lands a replica on the hub.
    let key = joiner.put(b"x".to_vec()).await.expect("put failed");
    sleep(REPLICATION_GRACE).await;

    assert_eq!(hub.get(&key).await.unwrap(), Some(b"x".to_vec()));

    joiner.shutdown().await;
    hub.shutdown().await;
}

#[tokio::test]
async fn bootstrap_discovers_unknown_peer_id() {
    let hub = bind_node(Vec::new()).await;
    let hub_addr = hub.address();

    // Only (ip, port) configured; the id comes from the FindNode exchange.
    let joiner = bind_node(vec![BootstrapPeer {
        ip: hub_addr.ip,
        port: hub_addr.port,
        id: None,
    }])
    .await;

    joiner.bootstrap().await.expect("bootstrap failed");

    let found = joiner.find_node(hub.id()).await.expect("lookup failed");
    assert!(found.iter().any(|addr| addr.id == hub.id()));

    joiner.shutdown().await;
    hub.shutdown().await;
}

#[tokio::test]
async fn value_is_found_across_the_network() {
    let hub = bind_node(Vec::new()).await;
    let mut others = Vec::new();
    for _ in 0..3 {
        let node = bind_node(vec![peer_of(&hub)]).await;
        node.bootstrap().await.expect("bootstrap failed");
        others.push(node);
    }

    let publisher = &others[2];
    let key = publisher.put(b"network value".to_vec()).await.unwrap();
    sleep(REPLICATION_GRACE).await;

    // Drop the local replica so the fetch must walk the network.
    let reader = &others[0];
    reader.delete(&key).await.unwrap();
    let value = reader.get(&key).await.expect("get failed");
    assert_eq!(value, Some(b"network value".to_vec()));

    for node in &others {
        node.shutdown().await;
    }
    hub.shutdown().await;
}

#[tokio::test]
async fn shutdown_stops_the_listen_loop() {
    let node = bind_node(Vec::new()).await;
    assert!(node.is_running());

    node.shutdown().await;
    sleep(Duration::from_millis(100)).await;
    assert!(!node.is_running());
}
