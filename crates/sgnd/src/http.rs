//! HTTP ingestion API and WebSocket upgrade surface
//!
//! Handlers return typed outcomes; this layer owns the mapping from
//! pipeline errors onto status codes and stable `error` strings. Every
//! route records its latency into the metrics windows.

use crate::config::Config;
use crate::hub::{run_subscriber, SubscriberOptions};
use crate::metrics::Metrics;
use crate::pipeline::{Pipeline, PublishError, PublishRequest};
use crate::storage::Storage;
use crate::trust::TrustStore;
use axum::error_handling::HandleErrorLayer;
use axum::extract::rejection::JsonRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tower::{BoxError, ServiceBuilder};
use tracing::warn;

/// Shared handler state, explicitly constructed by the daemon root
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub storage: Arc<Storage>,
    pub trust: Arc<TrustStore>,
    pub metrics: Arc<Metrics>,
    pub hub: Arc<crate::hub::Hub>,
    pub config: Arc<Config>,
}

/// Typed HTTP error: status code plus a stable JSON body
pub struct ApiError {
    status: StatusCode,
    body: Value,
}

impl ApiError {
    fn new(status: StatusCode, body: Value) -> Self {
        Self { status, body }
    }

    fn bad_json() -> Self {
        Self::new(StatusCode::BAD_REQUEST, json!({"error": "bad_json"}))
    }

    fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, json!({"error": "not_found"}))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<PublishError> for ApiError {
    fn from(err: PublishError) -> Self {
        match err {
            PublishError::InvalidKu(details) => ApiError::new(
                StatusCode::BAD_REQUEST,
                json!({"error": "invalid_ku", "details": details}),
            ),
            PublishError::BadSignature(reason) => ApiError::new(
                StatusCode::BAD_REQUEST,
                json!({"error": "bad_signature", "reason": reason}),
            ),
            PublishError::BadPublicKey(detail) => ApiError::new(
                StatusCode::BAD_REQUEST,
                json!({"error": "bad_signature", "reason": "invalid_pubkey", "detail": detail}),
            ),
            PublishError::Untrusted(reason) => ApiError::new(
                StatusCode::FORBIDDEN,
                json!({"error": "untrusted_key", "reason": reason}),
            ),
            PublishError::Storage(e) => {
                warn!(error = %e, "storage failure surfaced to client");
                ApiError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({"error": "storage"}),
                )
            }
            PublishError::Core(e) => ApiError::new(
                StatusCode::BAD_REQUEST,
                json!({"error": "invalid_ku", "details": [e.to_string()]}),
            ),
            PublishError::Internal(detail) => {
                warn!(detail = %detail, "internal publish failure");
                ApiError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({"error": "internal"}),
                )
            }
        }
    }
}

/// Build the full route table over the given state.
pub fn router(state: AppState) -> Router {
    let timeout = state.config.http_timeout();
    Router::new()
        .route("/publish", post(publish))
        .route("/verify", post(verify))
        .route("/ku/:cid", get(fetch_ku))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/live", get(live))
        .route("/metrics", get(metrics))
        .route("/admin/consistency", get(consistency))
        .route("/trust/reload", post(trust_reload))
        .route("/events", get(events))
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(handle_service_error))
                .timeout(timeout),
        )
        .with_state(state)
}

async fn handle_service_error(err: BoxError) -> (StatusCode, Json<Value>) {
    if err.is::<tower::timeout::error::Elapsed>() {
        (
            StatusCode::REQUEST_TIMEOUT,
            Json(json!({"error": "timeout"})),
        )
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "internal"})),
        )
    }
}

#[derive(Deserialize)]
struct PublishBody {
    ku: Value,
    #[serde(default)]
    verify: bool,
    #[serde(default)]
    pub_pem: Option<String>,
}

async fn publish(
    State(state): State<AppState>,
    body: Result<Json<PublishBody>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let started = Instant::now();
    Metrics::incr(&state.metrics.http_publish_count);

    let result = async {
        let Json(body) = body.map_err(|_| ApiError::bad_json())?;
        let outcome = state
            .pipeline
            .publish(PublishRequest {
                ku: body.ku,
                verify: body.verify,
                pub_pem: body.pub_pem,
            })
            .await?;
        Ok(Json(serde_json::to_value(outcome).map_err(|_| {
            ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"error": "internal"}),
            )
        })?))
    }
    .await;

    state.metrics.http_publish.record_since(started);
    result
}

#[derive(Deserialize)]
struct VerifyBody {
    ku: Value,
    pub_pem: String,
}

async fn verify(
    State(state): State<AppState>,
    body: Result<Json<VerifyBody>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let started = Instant::now();
    Metrics::incr(&state.metrics.http_verify_count);

    let result = (|| {
        let Json(body) = body.map_err(|_| ApiError::bad_json())?;
        let report = state.pipeline.verify(&body.ku, &body.pub_pem)?;
        serde_json::to_value(report)
            .map(Json)
            .map_err(|_| ApiError::bad_json())
    })();

    state.metrics.http_verify.record_since(started);
    result
}

async fn fetch_ku(
    State(state): State<AppState>,
    Path(cid): Path<String>,
) -> Result<Json<Value>, ApiError> {
    // Strict CID parse: foreign prefixes or hashes are a hard error
    sgn_core::cid::parse_cid(&cid)
        .map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, json!({"error": "bad_cid"})))?;

    let started = Instant::now();
    let ku = state.storage.get(&cid).map_err(|e| {
        warn!(error = %e, "ku fetch failed");
        ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({"error": "storage"}),
        )
    })?;
    state.metrics.db_read.record_since(started);

    ku.map(Json).ok_or_else(ApiError::not_found)
}

fn health_body(state: &AppState) -> Value {
    json!({
        "status": "healthy",
        "ku_count": state.storage.count(),
        "outbox_ready": true,
        "ws_clients": state
            .metrics
            .ws_clients
            .load(std::sync::atomic::Ordering::Relaxed),
        "db_read_ms": state.metrics.db_read.p50(),
        "db_write_ms": state.metrics.db_write.p50(),
        "queue_len": state.storage.outbox_len(),
    })
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(health_body(&state))
}

/// Readiness SLO for the storage probe
const READY_PROBE_SLO_MS: f64 = 500.0;

async fn ready(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let started = Instant::now();
    let probe = state.storage.exists("ready-probe");
    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
    state.metrics.db_read.record(elapsed_ms);

    if probe.is_err() || elapsed_ms > READY_PROBE_SLO_MS {
        return Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            json!({"error": "not_ready"}),
        ));
    }
    Ok(Json(health_body(&state)))
}

async fn live() -> StatusCode {
    StatusCode::NO_CONTENT
}

#[derive(Deserialize)]
struct MetricsQuery {
    format: Option<String>,
}

async fn metrics(State(state): State<AppState>, Query(query): Query<MetricsQuery>) -> Response {
    state.metrics.outbox_queue_len.store(
        state.storage.outbox_len() as u64,
        std::sync::atomic::Ordering::Relaxed,
    );

    if query.format.as_deref() == Some("prom") {
        (
            [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            state.metrics.render_prometheus(),
        )
            .into_response()
    } else {
        Json(state.metrics.render_json()).into_response()
    }
}

async fn consistency(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let report = state.storage.consistency().map_err(|e| {
        warn!(error = %e, "consistency scan failed");
        ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({"error": "storage"}),
        )
    })?;
    Ok(Json(json!({
        "total_db": report.total_db,
        "total_fs": report.total_fs,
        "mismatches": report.mismatches,
    })))
}

async fn trust_reload(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    state.trust.reload().map_err(|e| {
        warn!(error = %e, "trust reload failed");
        ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({"error": "trust_reload"}),
        )
    })?;
    Ok(Json(json!({"reloaded": true})))
}

#[derive(Deserialize)]
struct EventsQuery {
    since: Option<u64>,
    sub: Option<String>,
}

async fn events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let options = SubscriberOptions {
        since: query.since,
        name: query.sub,
        batch: state.config.delivery_batch,
        max_inflight: state.config.max_inflight,
        replay_cap: state.config.replay_cap,
        write_timeout: state.config.ws_write_timeout(),
        idle_timeout: state.config.ws_idle_timeout(),
    };
    ws.on_upgrade(move |socket| async move {
        run_subscriber(
            socket,
            state.storage.clone(),
            state.metrics.clone(),
            &state.hub,
            options,
        )
        .await;
    })
}
