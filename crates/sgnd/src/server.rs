//! Daemon wiring and lifecycle
//!
//! The daemon root constructs every singleton (storage, trust, seen cache,
//! metrics, hub, pipeline) and hands them to handler registrations;
//! handlers borrow, nothing is ambient. Background tasks: heartbeat
//! broadcaster, trust-file watcher, one subscriber task per configured peer.

use crate::config::Config;
use crate::http::{router, AppState};
use crate::hub::Hub;
use crate::metrics::Metrics;
use crate::peer::run_peer;
use crate::pipeline::Pipeline;
use crate::seen::SeenCache;
use crate::storage::{Storage, StorageError};
use crate::trust::{TrustError, TrustStore};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{info, warn};

const TRUST_WATCH_INTERVAL: Duration = Duration::from_secs(2);

/// Server errors; `exit_code` maps them onto the documented process codes
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("port in use: {0}")]
    PortInUse(SocketAddr),
    #[error("database open failed: {0}")]
    DbOpen(StorageError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl ServerError {
    /// Process exit code: 1 config, 2 port in use, 3 db open, 4 otherwise
    pub fn exit_code(&self) -> u8 {
        match self {
            ServerError::Config(_) => 1,
            ServerError::PortInUse(_) => 2,
            ServerError::DbOpen(_) => 3,
            ServerError::Io(_) | ServerError::Storage(_) => 4,
        }
    }
}

impl From<TrustError> for ServerError {
    fn from(err: TrustError) -> Self {
        ServerError::Config(format!("trust file: {err}"))
    }
}

/// Daemon root: owns every process-wide singleton
pub struct Daemon {
    config: Arc<Config>,
    storage: Arc<Storage>,
    trust: Arc<TrustStore>,
    metrics: Arc<Metrics>,
    hub: Arc<Hub>,
    pipeline: Arc<Pipeline>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Daemon {
    /// Wire up the daemon from configuration. Opening the database and
    /// parsing the trust file are the two fallible boot steps.
    pub fn new(config: Config) -> Result<Self, ServerError> {
        config
            .validate()
            .map_err(|e| ServerError::Config(e.to_string()))?;

        let storage = Arc::new(
            Storage::open(&config.db, config.blobs_dir.clone()).map_err(ServerError::DbOpen)?,
        );
        let trust = Arc::new(TrustStore::load(&config.trust)?);
        let seen = Arc::new(SeenCache::new(config.seen_cache_cap, config.seen_cache_ttl()));
        let metrics = Arc::new(Metrics::new());
        let hub = Arc::new(Hub::new(storage.max_seq()?));
        let pipeline = Arc::new(Pipeline::new(
            storage.clone(),
            trust.clone(),
            seen,
            metrics.clone(),
            hub.clone(),
        ));

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config: Arc::new(config),
            storage,
            trust,
            metrics,
            hub,
            pipeline,
            shutdown_tx,
        })
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            pipeline: self.pipeline.clone(),
            storage: self.storage.clone(),
            trust: self.trust.clone(),
            metrics: self.metrics.clone(),
            hub: self.hub.clone(),
            config: self.config.clone(),
        }
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let addr = self
            .config
            .listen_addr()
            .map_err(|e| ServerError::Config(e.to_string()))?;

        let listener = TcpListener::bind(addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                ServerError::PortInUse(addr)
            } else {
                ServerError::Io(e)
            }
        })?;

        self.serve(listener).await
    }

    /// Serve on an already-bound listener (tests bind port 0 themselves).
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let local = listener.local_addr()?;
        info!(addr = %local, ku_count = self.storage.count(), "sgnd listening");

        let heartbeat = self.spawn_heartbeat_task();
        let trust_watch = self.spawn_trust_watch_task();
        let metrics_tick = self.spawn_metrics_task();
        let peers: Vec<_> = self
            .config
            .peers
            .iter()
            .cloned()
            .map(|url| {
                let pipeline = self.pipeline.clone();
                let shutdown_rx = self.shutdown_tx.subscribe();
                tokio::spawn(run_peer(url, pipeline, shutdown_rx))
            })
            .collect();

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let app = router(self.app_state());
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("received shutdown signal");
                    }
                    _ = shutdown_rx.recv() => {}
                }
            })
            .await;

        heartbeat.abort();
        trust_watch.abort();
        metrics_tick.abort();
        for peer in peers {
            peer.abort();
        }
        self.storage.flush()?;

        result.map_err(ServerError::Io)
    }

    /// Request a clean shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// One timer task broadcasts heartbeats to every subscriber, independent
    /// of any subscriber's delivery progress.
    fn spawn_heartbeat_task(&self) -> tokio::task::JoinHandle<()> {
        let hub = self.hub.clone();
        let period = self.config.heartbeat_interval();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => hub.tick_heartbeat(),
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }

    /// Keep the queue-length gauge fresh between publishes.
    fn spawn_metrics_task(&self) -> tokio::task::JoinHandle<()> {
        let storage = self.storage.clone();
        let metrics = self.metrics.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(5));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        metrics.outbox_queue_len.store(
                            storage.outbox_len() as u64,
                            std::sync::atomic::Ordering::Relaxed,
                        );
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }

    fn spawn_trust_watch_task(&self) -> tokio::task::JoinHandle<()> {
        let trust = self.trust.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval(TRUST_WATCH_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = trust.maybe_reload() {
                            warn!(error = %e, "trust reload failed");
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }
}
