//! Integration tests for ring formation and lookup routing.
//!
//! Multi-node rings run over the in-process [`MemoryHub`], with every
//! protocol line flowing through the same dispatch path UDP traffic would
//! take. Clocks are paused where possible so maintenance is deterministic.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use torc::{DiscardSnapshots, Identifier, MemoryHub, Node, NodeConfig, NodeRef};

/// Under a paused clock this only fires when the ring truly deadlocks.
const TEST_TIMEOUT: Duration = Duration::from_secs(30);

/// An identifier with a chosen first byte, zero elsewhere. Ring order then
/// matches first-byte order, which keeps the assertions readable.
fn ring_id(first: u8) -> Identifier {
    let hex = format!("{:02x}{}", first, "00".repeat(63));
    Identifier::from_hex(&hex).expect("valid test identifier")
}

/// Attach a node to the hub and pump its inbox from a background task.
fn spawn_ring_node(hub: &Arc<MemoryHub>, first: u8, config: NodeConfig) -> Node {
    let id = ring_id(first);
    let (transport, mut inbox) = hub.attach(id);
    let node = Node::spawn(
        NodeRef::new(id),
        Arc::new(transport),
        Arc::new(DiscardSnapshots),
        config,
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

/// Let queued messages and actor rounds drain.
async fn settle() {
    sleep(Duration::from_millis(10)).await;
}

async fn stabilize_all(nodes: &[&Node]) {
    for _ in 0..3 {
        for node in nodes {
            node.stabilize().await.expect("stabilize command");
            settle().await;
        }
    }
}

async fn successor_of(node: &Node) -> Identifier {
    let snapshot = node.ring().await.expect("ring snapshot");
    snapshot
        .rows
        .first()
        .and_then(|row| row.candidates.first())
        .map(|n| n.id())
        .expect("successor resolved")
}

async fn predecessor_of(node: &Node) -> Identifier {
    let snapshot = node.ring().await.expect("ring snapshot");
    snapshot.predecessor.map(|p| p.id()).expect("predecessor resolved")
}

/// Boot one node and join the rest through it, waiting out each build.
async fn form_ring(hub: &Arc<MemoryHub>, firsts: &[u8]) -> Vec<Node> {
    let mut nodes = Vec::new();
    for (i, &first) in firsts.iter().enumerate() {
        let node = spawn_ring_node(hub, first, NodeConfig::manual());
        let seed = nodes.first().map(|n: &Node| n.self_ref());
        if i == 0 {
            node.join(None).await.expect("boot");
        } else {
            node.join(seed).await.expect("join");
        }
        timeout(TEST_TIMEOUT, node.joined()).await.expect("build completes");
        nodes.push(node);
        let refs: Vec<&Node> = nodes.iter().collect();
        stabilize_all(&refs).await;
    }
    nodes
}

#[tokio::test(start_paused = true)]
async fn join_stitches_successor_and_predecessor() {
    let hub = MemoryHub::new();
    let a = spawn_ring_node(&hub, 0x10, NodeConfig::manual());
    let b = spawn_ring_node(&hub, 0x80, NodeConfig::manual());

    a.join(None).await.expect("boot");
    timeout(TEST_TIMEOUT, a.joined()).await.expect("boot completes");
    b.join(Some(a.self_ref())).await.expect("join");
    timeout(TEST_TIMEOUT, b.joined()).await.expect("build completes");
    stabilize_all(&[&a, &b]).await;

    assert_eq!(successor_of(&a).await, b.id(), "A's successor is B");
    assert_eq!(successor_of(&b).await, a.id(), "B's successor wraps to A");
    assert_eq!(predecessor_of(&a).await, b.id(), "A's predecessor is B");
    assert_eq!(predecessor_of(&b).await, a.id(), "B's predecessor is A");
}

#[tokio::test(start_paused = true)]
async fn three_nodes_converge_to_identifier_order() {
    let hub = MemoryHub::new();
    let nodes = form_ring(&hub, &[0x10, 0x80, 0xd0]).await;
    let (a, b, c) = (&nodes[0], &nodes[1], &nodes[2]);

    // One repair round per node on top of the stabilization done while
    // forming; the converged ring must not churn under it.
    for node in &nodes {
        node.fix_fingers(None).await.expect("fix fingers command");
        settle().await;
    }

    assert_eq!(successor_of(a).await, b.id());
    assert_eq!(successor_of(b).await, c.id());
    assert_eq!(successor_of(c).await, a.id());
    assert_eq!(predecessor_of(a).await, c.id());
    assert_eq!(predecessor_of(b).await, a.id());
    assert_eq!(predecessor_of(c).await, b.id());

    // Routing from A toward C steps through the member strictly between
    // them: the highest finger of A inside (A, C) is B.
    let snapshot = a.ring().await.expect("ring snapshot");
    let preceding = snapshot
        .rows
        .iter()
        .rev()
        .filter_map(|row| row.candidates.first())
        .find(|n| a.id() < n.id() && n.id() < c.id())
        .map(|n| n.id());
    assert_eq!(preceding, Some(b.id()), "closest preceding finger toward C");
}

#[tokio::test(start_paused = true)]
async fn every_node_agrees_on_key_ownership() {
    let hub = MemoryHub::new();
    let nodes = form_ring(&hub, &[0x10, 0x80, 0xd0]).await;

    // Responsibility is (predecessor, self]: keys at or below a node's
    // identifier but above its predecessor's belong to it, and the gap
    // above the highest node wraps to the lowest.
    let expectations = [
        (ring_id(0x05), ring_id(0x10)),
        (ring_id(0x40), ring_id(0x80)),
        (ring_id(0x80), ring_id(0x80)),
        (ring_id(0xff), ring_id(0x10)),
    ];

    for (key, owner) in expectations {
        for node in &nodes {
            let holder = node.locate(key).await.expect("lookup completes");
            assert_eq!(
                holder.id(),
                owner,
                "everyone routes {} to the same holder",
                key.short()
            );
        }
    }
}

#[tokio::test(start_paused = true)]
async fn ring_converges_under_automatic_maintenance() {
    let hub = MemoryHub::new();
    let timers = NodeConfig {
        stabilize_interval: Some(Duration::from_millis(50)),
        fix_fingers_interval: Some(Duration::from_millis(25)),
    };

    let a = spawn_ring_node(&hub, 0x10, timers);
    let b = spawn_ring_node(&hub, 0x80, timers);
    let c = spawn_ring_node(&hub, 0xd0, timers);

    a.join(None).await.expect("boot");
    timeout(TEST_TIMEOUT, a.joined()).await.expect("boot completes");
    b.join(Some(a.self_ref())).await.expect("join");
    timeout(TEST_TIMEOUT, b.joined()).await.expect("build completes");
    c.join(Some(a.self_ref())).await.expect("join");
    timeout(TEST_TIMEOUT, c.joined()).await.expect("build completes");

    // No manual rounds: the actor timers alone must converge the ring.
    sleep(Duration::from_secs(2)).await;

    assert_eq!(successor_of(&a).await, b.id());
    assert_eq!(successor_of(&b).await, c.id());
    assert_eq!(successor_of(&c).await, a.id());
}

#[tokio::test(start_paused = true)]
async fn failure_report_without_backups_keeps_the_node_answering() {
    let hub = MemoryHub::new();
    let nodes = form_ring(&hub, &[0x10, 0x80]).await;
    let (a, b) = (&nodes[0], &nodes[1]);

    hub.detach(&b.id());
    b.quit().await;
    a.report_successor_failure().await.expect("failure report");
    settle().await;

    // Sequential joins leave no backup on the successor row, so nothing is
    // promoted; the node must still answer for its own key range.
    assert_eq!(successor_of(a).await, b.id(), "successor row unchanged");
    let holder = a.locate(ring_id(0x05)).await.expect("own-range lookup");
    assert_eq!(holder.id(), a.id(), "own keys stay answerable");
}
