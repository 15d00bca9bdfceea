// Integration tests: broadcast flooding and the waterfall seen-set
//
// Real nodes on loopback. Covers the three-node line, replayed and expired
// broadcasts injected over a raw socket, and a partitioned mesh rejoining.

mod common;

use std::time::Duration;

use common::{drain_after, init_tracing, node, port_of, recv_within, wait_until, HOST};
use meshsync_core::codec::{flags, now_secs};
use meshsync_core::{InternalMessage, MeshConfig, MeshSocket, Value};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

#[tokio::test(flavor = "multi_thread")]
async fn test_three_node_broadcast() {
    init_tracing();

    let a = MeshSocket::bind(MeshConfig::local(5555)).await.expect("bind 5555");
    let b = MeshSocket::bind(MeshConfig::local(5556)).await.expect("bind 5556");
    let c = MeshSocket::bind(MeshConfig::local(5557)).await.expect("bind 5557");

    assert!(b.connect(HOST, 5555).await.unwrap());
    assert!(wait_until(Duration::from_secs(2), || b.peer_count() == 1).await);
    assert!(c.connect(HOST, 5556).await.unwrap());
    tokio::time::sleep(Duration::from_millis(500)).await;

    a.send(vec![Value::from(b"hello")]).unwrap();

    for receiver in [&b, &c] {
        let msg = recv_within(receiver, Duration::from_millis(500))
            .await
            .expect("broadcast not delivered");
        assert_eq!(msg.payload()[0], Value::from(b"hello"));
        assert_eq!(msg.sender(), a.id());
    }
    for receiver in [&a, &b, &c] {
        assert!(drain_after(receiver, Duration::from_millis(200)).await.is_empty());
    }
    println!("✓ Broadcast delivered exactly once on a three-node line");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_peer_exchange_completes_mesh() {
    init_tracing();

    let a = node().await;
    let b = node().await;
    let c = node().await;

    b.connect(HOST, port_of(&a)).await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || b.peer_count() == 1).await);
    c.connect(HOST, port_of(&b)).await.unwrap();

    let meshed = wait_until(Duration::from_secs(3), || {
        a.peer_count() == 2 && b.peer_count() == 2 && c.peer_count() == 2
    })
    .await;
    assert!(meshed, "c should learn a through b's peer list");
    assert!(a.connection(c.id()).is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_replayed_and_expired_broadcasts_dropped() {
    init_tracing();

    let a = node().await;
    let b = node().await;
    b.connect(HOST, port_of(&a)).await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || a.peer_count() == 1 && b.peer_count() == 1).await);

    a.send(vec![Value::from(b"once")]).unwrap();
    let original = recv_within(&b, Duration::from_secs(1))
        .await
        .expect("broadcast not delivered");

    // A bare socket that speaks just enough of the protocol to be routed
    let fake_id = "fake-node";
    let mut raw = TcpStream::connect((HOST, port_of(&b))).await.unwrap();
    let handshake = InternalMessage::new(
        flags::WHISPER,
        fake_id,
        vec![
            Value::from(flags::HANDSHAKE),
            Value::from(fake_id.as_bytes()),
            Value::from(b.protocol().id().as_bytes()),
            Value::List(vec![Value::from(HOST), Value::from(1u16)]),
            Value::List(Vec::new()),
        ],
        Vec::new(),
    )
    .unwrap();
    raw.write_all(&handshake.serialize().unwrap()).await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || b.peer_count() == 2).await);

    let replay = original.internal().clone().with_compression(Vec::new());
    raw.write_all(&replay.serialize().unwrap()).await.unwrap();

    let stale = InternalMessage::with_timestamp(
        flags::BROADCAST,
        fake_id,
        now_secs() - 120,
        vec![Value::from(flags::BROADCAST), Value::from(b"stale")],
        Vec::new(),
    )
    .unwrap();
    raw.write_all(&stale.serialize().unwrap()).await.unwrap();

    let fresh = InternalMessage::new(
        flags::BROADCAST,
        fake_id,
        vec![Value::from(flags::BROADCAST), Value::from(b"fresh")],
        Vec::new(),
    )
    .unwrap();
    raw.write_all(&fresh.serialize().unwrap()).await.unwrap();

    let at_b = drain_after(&b, Duration::from_millis(500)).await;
    assert_eq!(at_b.len(), 1, "only the fresh broadcast is queued: {:?}", at_b);
    assert_eq!(at_b[0].payload()[0], Value::from(b"fresh"));

    let at_a = drain_after(&a, Duration::from_millis(100)).await;
    assert_eq!(at_a.len(), 1, "stale broadcasts are not forwarded: {:?}", at_a);
    assert_eq!(at_a[0].sender(), fake_id);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_partition_recovery() {
    init_tracing();

    let a = node().await;
    let b = node().await;
    let c = node().await;
    let d = node().await;

    // Two halves: a-b and c-d
    b.connect(HOST, port_of(&a)).await.unwrap();
    d.connect(HOST, port_of(&c)).await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || b.peer_count() == 1 && d.peer_count() == 1).await);

    a.send(vec![Value::from(b"left")]).unwrap();
    d.send(vec![Value::from(b"right")]).unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    let left = b.recv_many(10);
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].payload()[0], Value::from(b"left"));
    let right = c.recv_many(10);
    assert_eq!(right.len(), 1);
    assert_eq!(right[0].payload()[0], Value::from(b"right"));

    // Heal
    b.connect(HOST, port_of(&c)).await.unwrap();
    let nodes = [&a, &b, &c, &d];
    let healed = wait_until(Duration::from_secs(5), || nodes.iter().all(|n| n.peer_count() == 3)).await;
    assert!(healed, "the halves should merge into a full mesh");

    a.send(vec![Value::from(b"after-a")]).unwrap();
    d.send(vec![Value::from(b"after-d")]).unwrap();

    for node in nodes {
        let got = drain_after(node, Duration::from_millis(500)).await;
        let mut payloads: Vec<Value> = got.iter().map(|m| m.payload()[0].clone()).collect();
        payloads.sort_by_key(|v| v.as_bytes().map(<[u8]>::to_vec));

        let mut expected = Vec::new();
        if node.id() != a.id() {
            expected.push(Value::from(b"after-a"));
        }
        if node.id() != d.id() {
            expected.push(Value::from(b"after-d"));
        }
        assert_eq!(payloads, expected, "node {} saw duplicates or misses", node.id());
        assert!(node.waterfall_len() <= 4);
    }
    println!("✓ Partitioned halves rejoined without loops");
}
