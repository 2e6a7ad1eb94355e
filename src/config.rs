use std::path::PathBuf;
use std::time::Duration;

use crate::limits::MAX_HEARTBEAT_SEC;
use crate::model::Ms;

/// Engine tuning. `Default` is sensible for a single node; `from_env`
/// reads `TAPLINE_*` overrides the way a deployment would set them.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub wal_path: PathBuf,
    /// Cadence of the expiry/retention sweeper.
    pub sweep_interval: Duration,
    /// WAL appends between compactions.
    pub compact_threshold: u64,
    /// Cut retention; must outlive a snapshot+tail handshake.
    pub cut_ttl_ms: Ms,
    pub heartbeat_default_sec: u32,
    /// Server-side ceiling; requests above it are clamped down.
    pub heartbeat_max_sec: u32,
    /// Frames buffered per subscription before backpressure.
    pub stream_buffer: usize,
    pub wal_retry_attempts: u32,
    pub wal_retry_backoff_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            wal_path: PathBuf::from("./data/tapline.wal"),
            sweep_interval: Duration::from_secs(5),
            compact_threshold: 1_000,
            // 5× the widest allowed heartbeat, per the retention policy.
            cut_ttl_ms: 5 * MAX_HEARTBEAT_SEC as Ms * 1_000,
            heartbeat_default_sec: 15,
            heartbeat_max_sec: MAX_HEARTBEAT_SEC,
            stream_buffer: 1_024,
            wal_retry_attempts: 3,
            wal_retry_backoff_ms: 10,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(path) = std::env::var("TAPLINE_WAL_PATH") {
            cfg.wal_path = PathBuf::from(path);
        }
        if let Some(secs) = env_parse::<u64>("TAPLINE_SWEEP_INTERVAL_SEC") {
            cfg.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(n) = env_parse("TAPLINE_COMPACT_THRESHOLD") {
            cfg.compact_threshold = n;
        }
        if let Some(secs) = env_parse::<i64>("TAPLINE_CUT_TTL_SEC") {
            cfg.cut_ttl_ms = secs * 1_000;
        }
        if let Some(secs) = env_parse("TAPLINE_HEARTBEAT_SEC") {
            cfg.heartbeat_default_sec = secs;
        }
        if let Some(secs) = env_parse("TAPLINE_HEARTBEAT_MAX_SEC") {
            cfg.heartbeat_max_sec = secs;
        }
        if let Some(n) = env_parse("TAPLINE_STREAM_BUFFER") {
            cfg.stream_buffer = n;
        }
        cfg
    }

    /// Default config with a given WAL path — the common test shape.
    pub fn at(wal_path: impl Into<PathBuf>) -> Self {
        Self {
            wal_path: wal_path.into(),
            ..Self::default()
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}
