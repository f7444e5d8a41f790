//! Live WebSocket fan-out tests over ephemeral ports.

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use sgnd::config::Config;
use sgnd::pipeline::PublishRequest;
use sgnd::server::Daemon;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsClient = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

fn test_config(dir: &std::path::Path, peers: Vec<String>) -> Config {
    Config {
        bind: "127.0.0.1".to_string(),
        http_port: 0,
        db: dir.join("db"),
        trust: dir.join("trust.json"),
        blobs_dir: None,
        peers,
        replay_cap: 10_000,
        http_timeout_secs: 10,
        ws_idle_timeout_secs: 90,
        ws_write_timeout_secs: 5,
        heartbeat_secs: 1,
        max_inflight: 256,
        delivery_batch: 64,
        seen_cache_cap: 10_000,
        seen_cache_ttl_secs: 3600,
        log_format: "pretty".to_string(),
        verbose: false,
    }
}

/// Boot a daemon on an ephemeral port; the TempDir must outlive it.
async fn spawn_daemon(
    dir: &std::path::Path,
    peers: Vec<String>,
) -> (Arc<Daemon>, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let daemon = Arc::new(Daemon::new(test_config(dir, peers)).unwrap());
    let serving = daemon.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });
    (daemon, addr)
}

fn note_ku(n: u64) -> Value {
    json!({
        "schema_id": "ku.v1",
        "type": "ku.note",
        "content_type": "application/json",
        "payload": {"title": "T", "n": n},
        "parents": [],
        "sources": [],
        "tests": [],
        "provenance": {"agent_pubkey": null},
        "tags": ["x"],
    })
}

async fn publish(daemon: &Daemon, ku: Value) -> String {
    daemon
        .pipeline()
        .publish(PublishRequest {
            ku,
            verify: false,
            pub_pem: None,
        })
        .await
        .unwrap()
        .cid
}

async fn connect(addr: SocketAddr, query: &str) -> WsClient {
    let url = format!("ws://{addr}/events{query}");
    let (socket, _) = connect_async(url.as_str()).await.unwrap();
    socket
}

/// Read frames until one of the given type arrives (10 s budget).
async fn next_frame_of_type(socket: &mut WsClient, wanted: &str) -> Value {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let message = socket.next().await.expect("stream ended").unwrap();
            if let Message::Text(text) = message {
                let frame: Value = serde_json::from_str(&text).unwrap();
                if frame["type"] == wanted {
                    return frame;
                }
            }
        }
    })
    .await
    .expect("timed out waiting for frame")
}

async fn ack(socket: &mut WsClient, cid: &str) {
    socket
        .send(Message::Text(
            json!({"type": "ack", "cid": cid}).to_string(),
        ))
        .await
        .unwrap();
}

/// Poll until the condition holds (10 s budget).
async fn wait_for(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("condition never held");
}

#[tokio::test]
async fn subscriber_receives_ku_and_cursor_advances_on_ack() {
    let dir = tempfile::tempdir().unwrap();
    let (daemon, addr) = spawn_daemon(dir.path(), vec![]).await;

    let mut client = connect(addr, "?sub=test-sub").await;
    // Heartbeats flow before any KU exists
    let health = next_frame_of_type(&mut client, "health").await;
    assert!(health["ts"].is_number());

    let cid = publish(&daemon, note_ku(1)).await;

    let frame = next_frame_of_type(&mut client, "ku").await;
    assert_eq!(frame["cid"], cid.as_str());
    assert_eq!(frame["ku"]["payload"]["n"], 1);

    ack(&mut client, &cid).await;
    let storage = daemon.storage().clone();
    wait_for(move || storage.cursor("test-sub").ok().flatten() == Some(1)).await;
}

#[tokio::test]
async fn replay_from_since_redelivers() {
    let dir = tempfile::tempdir().unwrap();
    let (daemon, addr) = spawn_daemon(dir.path(), vec![]).await;

    let cid_a = publish(&daemon, note_ku(1)).await;
    let cid_b = publish(&daemon, note_ku(2)).await;

    // Tail subscriber sees nothing historical, only what comes next; the
    // first heartbeat confirms the subscription is live before publishing
    let mut tail = connect(addr, "").await;
    next_frame_of_type(&mut tail, "health").await;
    let cid_c = publish(&daemon, note_ku(3)).await;
    let frame = next_frame_of_type(&mut tail, "ku").await;
    assert_eq!(frame["cid"], cid_c.as_str());

    // Historical replay observes strictly increasing sequence
    let mut replay = connect(addr, "?since=0").await;
    let first = next_frame_of_type(&mut replay, "ku").await;
    let second = next_frame_of_type(&mut replay, "ku").await;
    let third = next_frame_of_type(&mut replay, "ku").await;
    assert_eq!(first["cid"], cid_a.as_str());
    assert_eq!(second["cid"], cid_b.as_str());
    assert_eq!(third["cid"], cid_c.as_str());
}

#[tokio::test]
async fn slow_client_does_not_stall_others() {
    let dir = tempfile::tempdir().unwrap();
    let (daemon, addr) = spawn_daemon(dir.path(), vec![]).await;

    let mut fast = connect(addr, "").await;
    let mut slow = connect(addr, "").await;
    next_frame_of_type(&mut fast, "health").await;
    next_frame_of_type(&mut slow, "health").await;

    let cid = publish(&daemon, note_ku(1)).await;

    // Fast client: frame plus a heartbeat, acked promptly
    let frame = next_frame_of_type(&mut fast, "ku").await;
    assert_eq!(frame["cid"], cid.as_str());
    ack(&mut fast, &cid).await;
    next_frame_of_type(&mut fast, "health").await;

    // Slow client got the frame too but withholds the ack; heartbeats
    // keep flowing to it regardless
    let frame = next_frame_of_type(&mut slow, "ku").await;
    assert_eq!(frame["cid"], cid.as_str());
    next_frame_of_type(&mut slow, "health").await;
    next_frame_of_type(&mut slow, "health").await;

    // Delivery accounting shows the outstanding ack
    let metrics = daemon.pipeline().metrics();
    let delivered = metrics
        .net_delivered
        .load(std::sync::atomic::Ordering::Relaxed);
    let acked = metrics.net_acked.load(std::sync::atomic::Ordering::Relaxed);
    assert!(delivered >= 2);
    assert!(delivered - acked >= 1);

    // The late ack still lands
    ack(&mut slow, &cid).await;
    let metrics = daemon.pipeline().metrics().clone();
    wait_for(move || metrics.net_acked.load(std::sync::atomic::Ordering::Relaxed) >= 2).await;
}

#[tokio::test]
async fn reconnect_with_since_cursor_redelivers_unacked() {
    let dir = tempfile::tempdir().unwrap();
    let (daemon, addr) = spawn_daemon(dir.path(), vec![]).await;

    let cid_a = publish(&daemon, note_ku(1)).await;
    let cid_b = publish(&daemon, note_ku(2)).await;

    let mut client = connect(addr, "?sub=durable&since=0").await;
    let first = next_frame_of_type(&mut client, "ku").await;
    assert_eq!(first["cid"], cid_a.as_str());
    ack(&mut client, &cid_a).await;
    next_frame_of_type(&mut client, "ku").await; // cid_b delivered, not acked

    let storage = daemon.storage().clone();
    wait_for(move || storage.cursor("durable").ok().flatten() == Some(1)).await;
    drop(client);

    // Reconnect from the persisted cursor: the unacked KU comes again
    let cursor = daemon.storage().cursor("durable").unwrap().unwrap();
    let mut client = connect(addr, &format!("?sub=durable&since={cursor}")).await;
    let frame = next_frame_of_type(&mut client, "ku").await;
    assert_eq!(frame["cid"], cid_b.as_str());
}

#[tokio::test]
async fn mutual_subscription_stores_and_enqueues_once() {
    let dir1 = tempfile::tempdir().unwrap();
    let dir2 = tempfile::tempdir().unwrap();

    // Bind both listeners first so each daemon can point at the other
    let listener1 = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let listener2 = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr1 = listener1.local_addr().unwrap();
    let addr2 = listener2.local_addr().unwrap();

    let d1 = Arc::new(
        Daemon::new(test_config(
            dir1.path(),
            vec![format!("ws://{addr2}/events?sub=d1")],
        ))
        .unwrap(),
    );
    let d2 = Arc::new(
        Daemon::new(test_config(
            dir2.path(),
            vec![format!("ws://{addr1}/events?sub=d2")],
        ))
        .unwrap(),
    );
    let serving1 = d1.clone();
    let serving2 = d2.clone();
    tokio::spawn(async move { serving1.serve(listener1).await.unwrap() });
    tokio::spawn(async move { serving2.serve(listener2).await.unwrap() });

    // Both peer links must be up before publishing; each daemon sees the
    // other as one connected WebSocket client
    let m1 = d1.pipeline().metrics().clone();
    let m2 = d2.pipeline().metrics().clone();
    wait_for(move || {
        m1.ws_clients.load(std::sync::atomic::Ordering::Relaxed) >= 1
            && m2.ws_clients.load(std::sync::atomic::Ordering::Relaxed) >= 1
    })
    .await;

    let cid = publish(&d1, note_ku(42)).await;

    // D2 replicates the KU exactly once
    let s2 = d2.storage().clone();
    let check_cid = cid.clone();
    wait_for(move || s2.exists(&check_cid).unwrap_or(false)).await;

    // Give the rebroadcast loop a moment to (not) happen
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(d1.storage().count(), 1);
    assert_eq!(d2.storage().count(), 1);
    assert_eq!(d1.storage().outbox_len(), 1);
    assert_eq!(d2.storage().outbox_len(), 1);
}
