//! Configuration for sgnd

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// sgnd - SGN Knowledge Unit Gossip Daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "sgnd")]
#[command(about = "Knowledge unit gossip daemon with durable fan-out")]
pub struct Config {
    /// Address to bind the HTTP/WebSocket listener on
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: String,

    /// HTTP port
    #[arg(long, env = "SGN_HTTP_PORT", default_value = "8787")]
    pub http_port: u16,

    /// Path to the embedded database
    #[arg(long, env = "SGN_DB", default_value = "./data/sgn-db")]
    pub db: PathBuf,

    /// Path to the trust policy JSON file
    #[arg(long, env = "SGN_TRUST", default_value = "./trust.json")]
    pub trust: PathBuf,

    /// Optional per-CID blob mirror directory (enables fs consistency checks)
    #[arg(long, env = "SGN_BLOBS")]
    pub blobs_dir: Option<PathBuf>,

    /// Peer daemons to subscribe to (ws:// or wss:// /events URLs)
    #[arg(long = "peer", value_name = "URL")]
    pub peers: Vec<String>,

    /// Maximum outbox rows fetched per historical-replay burst
    #[arg(long, default_value = "10000")]
    pub replay_cap: u64,

    /// Overall HTTP request timeout in seconds
    #[arg(long, default_value = "10")]
    pub http_timeout_secs: u64,

    /// WebSocket idle read timeout in seconds (reset by any client frame)
    #[arg(long, default_value = "90")]
    pub ws_idle_timeout_secs: u64,

    /// Per-frame WebSocket write timeout in seconds
    #[arg(long, default_value = "5")]
    pub ws_write_timeout_secs: u64,

    /// Heartbeat interval in seconds
    #[arg(long, default_value = "5")]
    pub heartbeat_secs: u64,

    /// Unacked frames per subscriber before delivery pauses
    #[arg(long, default_value = "256")]
    pub max_inflight: usize,

    /// Outbox rows fetched per delivery batch
    #[arg(long, default_value = "64")]
    pub delivery_batch: usize,

    /// Seen-cache capacity
    #[arg(long, default_value = "10000")]
    pub seen_cache_cap: usize,

    /// Seen-cache entry lifetime in seconds
    #[arg(long, default_value = "3600")]
    pub seen_cache_ttl_secs: u64,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.log_format != "pretty" && self.log_format != "json" {
            anyhow::bail!("log format must be 'pretty' or 'json'");
        }
        if self.replay_cap == 0 {
            anyhow::bail!("replay cap must be positive");
        }
        if self.max_inflight == 0 || self.delivery_batch == 0 {
            anyhow::bail!("delivery window sizes must be positive");
        }
        if self.ws_write_timeout_secs == 0 || self.ws_idle_timeout_secs == 0 {
            anyhow::bail!("websocket timeouts must be positive");
        }
        for peer in &self.peers {
            if !peer.starts_with("ws://") && !peer.starts_with("wss://") {
                anyhow::bail!("peer URL must be ws:// or wss://: {peer}");
            }
        }
        Ok(())
    }

    /// Socket address for the HTTP listener
    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.bind, self.http_port)
            .parse()
            .map_err(|e| anyhow::anyhow!("bad bind address: {e}"))
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn ws_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.ws_idle_timeout_secs)
    }

    pub fn ws_write_timeout(&self) -> Duration {
        Duration::from_secs(self.ws_write_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn seen_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.seen_cache_ttl_secs)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn test_config(dir: &std::path::Path) -> Config {
        Config {
            bind: "127.0.0.1".to_string(),
            http_port: 0,
            db: dir.join("db"),
            trust: dir.join("trust.json"),
            blobs_dir: None,
            peers: vec![],
            replay_cap: 10_000,
            http_timeout_secs: 10,
            ws_idle_timeout_secs: 90,
            ws_write_timeout_secs: 5,
            heartbeat_secs: 5,
            max_inflight: 256,
            delivery_batch: 64,
            seen_cache_cap: 10_000,
            seen_cache_ttl_secs: 3600,
            log_format: "pretty".to_string(),
            verbose: false,
        }
    }

    #[test]
    fn default_like_config_validates() {
        let dir = tempfile::tempdir().unwrap();
        assert!(test_config(dir.path()).validate().is_ok());
    }

    #[test]
    fn rejects_non_ws_peer_urls() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.peers = vec!["http://example.com/events".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_log_format() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.log_format = "xml".to_string();
        assert!(config.validate().is_err());
    }
}
