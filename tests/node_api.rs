//! Integration tests for the Node public API.
//!
//! Single nodes and small rings over the in-process [`MemoryHub`],
//! exercising the handle surface: lifecycle, lookups, extension verbs,
//! snapshots, and hostile input.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::{sleep, timeout};
use torc::{
    BincodeSnapshotStore, DiscardSnapshots, Identifier, MemoryHub, Node, NodeConfig, NodeRef,
    SnapshotStore,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(30);

/// An identifier with a chosen first byte, zero elsewhere.
fn ring_id(first: u8) -> Identifier {
    let hex = format!("{:02x}{}", first, "00".repeat(63));
    Identifier::from_hex(&hex).expect("valid test identifier")
}

/// Attach a node to the hub and pump its inbox from a background task.
fn spawn_ring_node(hub: &Arc<MemoryHub>, first: u8) -> Node {
    let id = ring_id(first);
    let (transport, mut inbox) = hub.attach(id);
    let node = Node::spawn(
        NodeRef::new(id),
        Arc::new(transport),
        Arc::new(DiscardSnapshots),
        NodeConfig::manual(),
    );
    let pump = node.clone();
    tokio::spawn(async move {
        while let Some((from, line)) = inbox.recv().await {
            if pump.deliver(from, line).await.is_err() {
                break;
            }
        }
    });
    node
}

async fn settle() {
    sleep(Duration::from_millis(10)).await;
}

/// Boot `a` and join `b` through it.
async fn two_node_ring(hub: &Arc<MemoryHub>) -> (Node, Node) {
    let a = spawn_ring_node(hub, 0x10);
    let b = spawn_ring_node(hub, 0x80);
    a.join(None).await.expect("boot");
    timeout(TEST_TIMEOUT, a.joined()).await.expect("boot completes");
    b.join(Some(a.self_ref())).await.expect("join");
    timeout(TEST_TIMEOUT, b.joined()).await.expect("build completes");
    for node in [&a, &b] {
        node.stabilize().await.expect("stabilize");
        settle().await;
    }
    (a, b)
}

#[tokio::test(start_paused = true)]
async fn sole_node_owns_every_key() {
    let hub = MemoryHub::new();
    let node = spawn_ring_node(&hub, 0x42);

    assert!(!node.is_joined(), "not joined before join()");
    node.join(None).await.expect("boot");
    timeout(TEST_TIMEOUT, node.joined()).await.expect("boot completes");
    assert!(node.is_joined());

    for first in [0x00, 0x41, 0x42, 0x43, 0xff] {
        let holder = node.locate(ring_id(first)).await.expect("lookup");
        assert_eq!(holder.id(), node.id(), "sole member holds everything");
    }
}

#[tokio::test(start_paused = true)]
async fn ring_snapshot_reflects_membership() {
    let hub = MemoryHub::new();
    let (a, b) = two_node_ring(&hub).await;

    let snapshot = a.ring().await.expect("snapshot");
    assert_eq!(snapshot.owner, a.id());
    assert_eq!(snapshot.rows.len(), 512, "one row per ring bit");
    assert_eq!(
        snapshot.predecessor.map(|p| p.id()),
        Some(b.id()),
        "two-node ring wraps the predecessor"
    );
    assert_eq!(
        snapshot.rows[0].candidates.first().map(|n| n.id()),
        Some(b.id()),
        "successor row points at the peer"
    );
}

#[tokio::test(start_paused = true)]
async fn extension_verbs_round_trip_between_nodes() {
    let hub = MemoryHub::new();
    let (a, b) = two_node_ring(&hub).await;

    b.set_extension_handler(Box::new(|_code, reply, operand, _from| {
        if reply {
            None
        } else {
            Some(operand.to_uppercase())
        }
    }))
    .await
    .expect("handler installed");

    let answer = a
        .extension_request(b.self_ref(), *b"XX", "ping")
        .await
        .expect("extension reply");
    assert_eq!(answer, "PING");
}

#[tokio::test(start_paused = true)]
async fn extension_rejects_catalog_verbs() {
    let hub = MemoryHub::new();
    let (a, b) = two_node_ring(&hub).await;

    let err = a.extension_request(b.self_ref(), *b"FS", "ping").await;
    assert!(err.is_err(), "catalog codes are not extension codes");
}

#[tokio::test(start_paused = true)]
async fn hostile_lines_do_not_wedge_the_node() {
    let hub = MemoryHub::new();
    let (a, _b) = two_node_ring(&hub).await;
    let stranger = ring_id(0x99);

    for line in [
        String::new(),
        "FS".to_string(),
        "?? one two three four".to_string(),
        "FS missing-token".to_string(),
        "fs lower case verb".to_string(),
        "x".repeat(9000),
    ] {
        a.deliver(stranger, line).await.expect("delivery accepted");
    }
    settle().await;

    let holder = a.locate(ring_id(0x05)).await.expect("lookup still works");
    assert_eq!(holder.id(), a.id());
}

#[tokio::test(start_paused = true)]
async fn api_errors_after_quit() {
    let hub = MemoryHub::new();
    let node = spawn_ring_node(&hub, 0x42);
    node.join(None).await.expect("boot");
    timeout(TEST_TIMEOUT, node.joined()).await.expect("boot completes");

    node.quit().await;
    settle().await;

    assert!(node.locate(ring_id(0x01)).await.is_err());
    assert!(node.stabilize().await.is_err());
    assert!(node.deliver(ring_id(0x99), "QS  abc").await.is_err());
}

#[tokio::test]
async fn routing_snapshots_reach_disk() {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let path = std::env::temp_dir()
        .join(format!("torc-ring-{}-{}.snapshot", std::process::id(), nanos));

    let hub = MemoryHub::new();
    let id = ring_id(0x42);
    let (transport, _inbox) = hub.attach(id);
    let store = Arc::new(BincodeSnapshotStore::new(path.clone()));
    let node = Node::spawn(
        NodeRef::new(id),
        Arc::new(transport),
        store.clone(),
        NodeConfig::manual(),
    );

    node.join(None).await.expect("boot");
    timeout(TEST_TIMEOUT, node.joined()).await.expect("boot completes");

    // The save is fire-and-forget; poll until it lands.
    let mut loaded = None;
    for _ in 0..50 {
        if let Ok(Some(snapshot)) = store.load().await {
            loaded = Some(snapshot);
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    let snapshot = loaded.expect("snapshot written");
    assert_eq!(snapshot.owner, id);
    assert_eq!(snapshot.rows.len(), 512);

    node.quit().await;
    let _ = tokio::fs::remove_file(&path).await;
}
