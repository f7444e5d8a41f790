//! Outbound peer subscriptions
//!
//! A daemon replicates from a peer by consuming the same `/events` stream
//! any client uses: each received KU is fed through the local publish
//! pipeline (idempotent insert breaks mutual-subscription cycles) and then
//! ACKed so the peer's cursor advances.

use crate::pipeline::{Pipeline, PublishRequest};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Maintain one peer subscription until shutdown. Reconnects with capped
/// exponential backoff; a clean session resets the backoff.
pub async fn run_peer(
    url: String,
    pipeline: Arc<Pipeline>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut backoff = BACKOFF_INITIAL;

    loop {
        match connect_async(url.as_str()).await {
            Ok((socket, _)) => {
                info!(url = %url, "peer subscription established");
                backoff = BACKOFF_INITIAL;
                consume_peer(socket, &url, &pipeline, &mut shutdown_rx).await;
            }
            Err(e) => {
                warn!(url = %url, error = %e, "peer connect failed");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown_rx.recv() => return,
        }
        backoff = (backoff * 2).min(BACKOFF_MAX);
    }
}

async fn consume_peer(
    socket: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    url: &str,
    pipeline: &Arc<Pipeline>,
    shutdown_rx: &mut broadcast::Receiver<()>,
) {
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            frame = stream.next() => {
                let message = match frame {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        warn!(url = %url, error = %e, "peer stream error");
                        return;
                    }
                    None => {
                        info!(url = %url, "peer closed the stream");
                        return;
                    }
                };
                let Message::Text(text) = message else {
                    continue;
                };
                if let Some(cid) = ingest_frame(&text, pipeline).await {
                    let ack = json!({"type": "ack", "cid": cid}).to_string();
                    if sink.send(Message::Text(ack)).await.is_err() {
                        warn!(url = %url, "peer ack send failed");
                        return;
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                let _ = sink.send(Message::Close(None)).await;
                return;
            }
        }
    }
}

/// Feed one peer frame into the local pipeline. Returns the CID to ACK for
/// `ku` frames; heartbeats and unknown frames are ignored.
async fn ingest_frame(text: &str, pipeline: &Arc<Pipeline>) -> Option<String> {
    let frame: Value = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(error = %e, "unparseable peer frame");
            return None;
        }
    };
    if frame.get("type").and_then(Value::as_str) != Some("ku") {
        return None;
    }
    let cid = frame.get("cid").and_then(Value::as_str)?.to_string();
    let ku = frame.get("ku")?.clone();

    match pipeline
        .publish(PublishRequest {
            ku,
            verify: false,
            pub_pem: None,
        })
        .await
    {
        Ok(outcome) => {
            if outcome.cid != cid {
                // Peer's claimed CID disagrees with our canonicalization:
                // the KU is stored under the recomputed CID, which is the
                // one the local outbox fans out.
                warn!(claimed = %cid, computed = %outcome.cid, "peer cid mismatch");
            }
            debug!(cid = %outcome.cid, stored = outcome.stored, "peer ku ingested");
            // ACK the peer's row regardless; duplicates must still advance
            // the remote cursor or the stream wedges.
            Some(cid)
        }
        Err(e) => {
            warn!(cid = %cid, error = %e, "peer ku rejected");
            None
        }
    }
}
