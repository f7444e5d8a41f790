//! WebSocket fan-out hub
//!
//! One delivery task per connected subscriber, driven by three signals: new
//! outbox rows (watch channel), heartbeat ticks (broadcast channel), and the
//! client's own frames. Delivery is strictly ordered by outbox sequence;
//! ACKs may arrive out of order but the cursor only advances over the
//! contiguously acked prefix. A slow or stuck client affects nobody else:
//! its frames time out and only it gets dropped.

use crate::metrics::Metrics;
use crate::storage::Storage;
use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, warn};

/// Shared fan-out state: wakeup channels handed to every subscriber task
pub struct Hub {
    seq_tx: watch::Sender<u64>,
    heartbeat_tx: broadcast::Sender<i64>,
}

impl Hub {
    pub fn new(initial_seq: u64) -> Self {
        let (seq_tx, _) = watch::channel(initial_seq);
        let (heartbeat_tx, _) = broadcast::channel(8);
        Self {
            seq_tx,
            heartbeat_tx,
        }
    }

    /// Publish path: announce a freshly enqueued outbox row
    pub fn notify(&self, seq: u64) {
        self.seq_tx.send_modify(|latest| {
            if seq > *latest {
                *latest = seq;
            }
        });
    }

    pub fn subscribe_seq(&self) -> watch::Receiver<u64> {
        self.seq_tx.subscribe()
    }

    pub fn subscribe_heartbeat(&self) -> broadcast::Receiver<i64> {
        self.heartbeat_tx.subscribe()
    }

    /// Broadcast one heartbeat tick (unix millis). Called by the daemon's
    /// heartbeat task, never by delivery loops.
    pub fn tick_heartbeat(&self) {
        let _ = self.heartbeat_tx.send(Utc::now().timestamp_millis());
    }
}

/// Per-connection delivery parameters
#[derive(Clone, Debug)]
pub struct SubscriberOptions {
    /// Historical replay cursor; `None` starts at the current tail
    pub since: Option<u64>,
    /// Durable subscriber name; anonymous connections keep no cursor row
    pub name: Option<String>,
    pub batch: usize,
    pub max_inflight: usize,
    pub replay_cap: u64,
    pub write_timeout: Duration,
    pub idle_timeout: Duration,
}

/// Why a subscriber task ended (logged, never propagated to publishers)
#[derive(Debug, PartialEq, Eq)]
enum Disconnect {
    ClientClosed,
    IdleTimeout,
    WriteFailed,
}

struct Delivery {
    /// Highest sequence handed to the socket
    last_sent: u64,
    /// Highest contiguously acked sequence
    cursor: u64,
    /// Sent but unacked rows, ordered by sequence
    in_flight: BTreeMap<u64, String>,
    cid_to_seq: HashMap<String, u64>,
}

impl Delivery {
    fn new(start: u64) -> Self {
        Self {
            last_sent: start,
            cursor: start,
            in_flight: BTreeMap::new(),
            cid_to_seq: HashMap::new(),
        }
    }

    /// Retire an acked CID; returns the new contiguous cursor when it moved.
    fn ack(&mut self, cid: &str) -> Option<u64> {
        let seq = self.cid_to_seq.remove(cid)?;
        self.in_flight.remove(&seq);

        let contiguous = match self.in_flight.keys().next() {
            Some(oldest_unacked) => oldest_unacked - 1,
            None => self.last_sent,
        };
        if contiguous > self.cursor {
            self.cursor = contiguous;
            Some(contiguous)
        } else {
            None
        }
    }
}

/// Drive one subscriber connection to completion.
pub async fn run_subscriber(
    socket: WebSocket,
    storage: Arc<Storage>,
    metrics: Arc<Metrics>,
    hub: &Hub,
    options: SubscriberOptions,
) {
    Metrics::incr(&metrics.ws_clients);
    let mut seq_rx = hub.subscribe_seq();
    let mut heartbeat_rx = hub.subscribe_heartbeat();

    let start = match (&options.since, &options.name) {
        (Some(since), _) => *since,
        (None, Some(name)) => storage
            .cursor(name)
            .ok()
            .flatten()
            .unwrap_or_else(|| *seq_rx.borrow()),
        (None, None) => *seq_rx.borrow(),
    };

    let (mut sink, mut stream) = socket.split();
    let mut delivery = Delivery::new(start);
    let mut idle_deadline = Instant::now() + options.idle_timeout;

    let reason = subscriber_loop(
        &mut sink,
        &mut stream,
        &mut delivery,
        &mut seq_rx,
        &mut heartbeat_rx,
        &mut idle_deadline,
        &storage,
        &metrics,
        &options,
    )
    .await;

    debug!(?reason, name = ?options.name, "subscriber disconnected");
    Metrics::decr(&metrics.ws_clients);
}

#[allow(clippy::too_many_arguments)]
async fn subscriber_loop(
    sink: &mut SplitSink<WebSocket, Message>,
    stream: &mut SplitStream<WebSocket>,
    delivery: &mut Delivery,
    seq_rx: &mut watch::Receiver<u64>,
    heartbeat_rx: &mut broadcast::Receiver<i64>,
    idle_deadline: &mut Instant,
    storage: &Arc<Storage>,
    metrics: &Arc<Metrics>,
    options: &SubscriberOptions,
) -> Disconnect {
    // Historical catch-up before entering the steady-state loop
    if let Err(reason) = deliver_ready(sink, delivery, storage, metrics, options).await {
        return reason;
    }

    loop {
        tokio::select! {
            changed = seq_rx.changed() => {
                if changed.is_err() {
                    return Disconnect::ClientClosed;
                }
                seq_rx.borrow_and_update();
                if let Err(reason) =
                    deliver_ready(sink, delivery, storage, metrics, options).await
                {
                    return reason;
                }
            }
            tick = heartbeat_rx.recv() => {
                match tick {
                    Ok(ts) => {
                        let frame = json!({"type": "health", "ts": ts});
                        if send_frame(sink, &frame, options.write_timeout).await.is_err() {
                            return Disconnect::WriteFailed;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        return Disconnect::ClientClosed;
                    }
                }
            }
            frame = stream.next() => {
                let message = match frame {
                    Some(Ok(message)) => message,
                    Some(Err(_)) | None => return Disconnect::ClientClosed,
                };
                *idle_deadline = Instant::now() + options.idle_timeout;

                match message {
                    Message::Text(text) => {
                        handle_client_frame(&text, delivery, storage, metrics, options);
                        // ACKs free in-flight slots and may unblock a burst
                        // that stopped at the replay cap
                        if delivery.in_flight.len() < options.max_inflight {
                            if let Err(reason) =
                                deliver_ready(sink, delivery, storage, metrics, options).await
                            {
                                return reason;
                            }
                        }
                    }
                    Message::Close(_) => return Disconnect::ClientClosed,
                    // Ping/pong already reset the idle deadline above
                    _ => {}
                }
            }
            _ = sleep_until(*idle_deadline) => {
                return Disconnect::IdleTimeout;
            }
        }
    }
}

fn handle_client_frame(
    text: &str,
    delivery: &mut Delivery,
    storage: &Arc<Storage>,
    metrics: &Arc<Metrics>,
    options: &SubscriberOptions,
) {
    let frame: Value = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(_) => return,
    };
    match frame.get("type").and_then(Value::as_str) {
        Some("ack") => {
            let Some(cid) = frame.get("cid").and_then(Value::as_str) else {
                return;
            };
            Metrics::incr(&metrics.net_acked);
            if let Some(cursor) = delivery.ack(cid) {
                if let Some(name) = &options.name {
                    if let Err(e) = storage.advance_cursor(name, cursor) {
                        warn!(name = %name, error = %e, "cursor persist failed");
                    }
                }
            }
        }
        Some("ping") => {}
        _ => {}
    }
}

/// Send every outbox row the subscriber is ready for, respecting the
/// in-flight bound (backpressure) and the replay cap per burst.
async fn deliver_ready(
    sink: &mut SplitSink<WebSocket, Message>,
    delivery: &mut Delivery,
    storage: &Arc<Storage>,
    metrics: &Arc<Metrics>,
    options: &SubscriberOptions,
) -> Result<(), Disconnect> {
    let mut sent_this_burst: u64 = 0;

    loop {
        let capacity = options.max_inflight.saturating_sub(delivery.in_flight.len());
        if capacity == 0 || sent_this_burst >= options.replay_cap {
            return Ok(());
        }
        let batch = options.batch.min(capacity);

        let started = std::time::Instant::now();
        let rows = match storage.outbox_after(delivery.last_sent, batch) {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "outbox read failed");
                return Ok(());
            }
        };
        metrics.db_read.record_since(started);
        if rows.is_empty() {
            return Ok(());
        }

        for (seq, cid) in rows {
            let ku = match storage.get(&cid) {
                Ok(Some(ku)) => ku,
                Ok(None) => {
                    // Outbox row without its KU cannot happen post-transaction;
                    // skip rather than wedge the stream.
                    warn!(cid = %cid, seq, "outbox row references missing ku");
                    delivery.last_sent = seq;
                    continue;
                }
                Err(e) => {
                    warn!(cid = %cid, error = %e, "ku read failed");
                    return Ok(());
                }
            };

            let frame = json!({"type": "ku", "cid": cid, "ku": ku});
            send_frame(sink, &frame, options.write_timeout)
                .await
                .map_err(|_| Disconnect::WriteFailed)?;

            delivery.last_sent = seq;
            delivery.in_flight.insert(seq, cid.clone());
            delivery.cid_to_seq.insert(cid, seq);
            Metrics::incr(&metrics.net_delivered);
            sent_this_burst += 1;

            if delivery.in_flight.len() >= options.max_inflight {
                return Ok(());
            }
        }
    }
}

async fn send_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    frame: &Value,
    write_timeout: Duration,
) -> Result<(), ()> {
    let text = frame.to_string();
    match timeout(write_timeout, sink.send(Message::Text(text))).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) | Err(_) => Err(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_advances_only_the_contiguous_prefix() {
        let mut delivery = Delivery::new(0);
        for seq in 1..=4u64 {
            delivery.in_flight.insert(seq, format!("cid-{seq}"));
            delivery.cid_to_seq.insert(format!("cid-{seq}"), seq);
            delivery.last_sent = seq;
        }

        // Out-of-order ack: nothing contiguous yet
        assert_eq!(delivery.ack("cid-3"), None);
        assert_eq!(delivery.cursor, 0);

        assert_eq!(delivery.ack("cid-1"), Some(1));
        assert_eq!(delivery.cursor, 1);

        // cid-2 closes the gap through the already-acked cid-3
        assert_eq!(delivery.ack("cid-2"), Some(3));
        assert_eq!(delivery.cursor, 3);

        assert_eq!(delivery.ack("cid-4"), Some(4));
        assert_eq!(delivery.cursor, 4);
    }

    #[test]
    fn duplicate_acks_are_ignored() {
        let mut delivery = Delivery::new(0);
        delivery.in_flight.insert(1, "cid-1".to_string());
        delivery.cid_to_seq.insert("cid-1".to_string(), 1);
        delivery.last_sent = 1;

        assert_eq!(delivery.ack("cid-1"), Some(1));
        assert_eq!(delivery.ack("cid-1"), None);
        assert_eq!(delivery.ack("cid-unknown"), None);
        assert_eq!(delivery.cursor, 1);
    }

    #[test]
    fn hub_notify_is_monotonic() {
        let hub = Hub::new(5);
        let rx = hub.subscribe_seq();

        hub.notify(7);
        assert_eq!(*rx.borrow(), 7);

        // A late notification for an older row never regresses the watermark
        hub.notify(6);
        assert_eq!(*rx.borrow(), 7);
    }
}
