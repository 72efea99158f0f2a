//! Runtime wiring for the recommendation-similarity dashboard backend.
//!
//! One process loads a single Parquet snapshot into an embedded DataFusion
//! session and serves the query catalogue, health probes and metrics over a
//! small HTTP/1.1 endpoint. Readiness flips only after the snapshot is loaded
//! and its metadata summary computed.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use recsim_query::snapshot::{DEFAULT_ENGINE_THREADS, DEFAULT_FETCH_ATTEMPTS};
use recsim_query::{
    EngineSettings, MetadataSummary, QueryMetrics, QueryService, ResourceCache,
    ResultCachePolicy, Snapshot, SnapshotSource,
};
use tokio::net::TcpListener;
use tokio::sync::{watch, OnceCell};
use tracing::{error, info, warn};

mod http;

use http::{run_http_server, AppState};

const DEFAULT_SNAPSHOT: &str = "data/snapshot.parquet";
const DEFAULT_HTTP_ADDR: &str = "127.0.0.1:8080";
const DEFAULT_MEMORY_LIMIT_MB: usize = 2048;
const DEFAULT_RESULT_CACHE_TTL_SECS: u64 = 600;
const DEFAULT_RESULT_CACHE_MAX_ENTRIES: usize = 1024;
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 300;

/// Coarse runtime health states surfaced by the health endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Snapshot load in progress.
    Bootstrapping = 0,
    /// Snapshot loaded and summarized; queries are served.
    Ready = 1,
    /// Fatal load error or shutdown.
    NotReady = 2,
}

impl HealthState {
    fn from_u8(raw: u8) -> Self {
        // Unknown values never report readiness.
        match raw {
            1 => Self::Ready,
            2 => Self::NotReady,
            _ => Self::Bootstrapping,
        }
    }
}

/// Shared health state read by the HTTP tasks.
#[derive(Clone)]
pub struct RuntimeHealth {
    state: Arc<AtomicU8>,
    detail: Arc<tokio::sync::RwLock<String>>,
}

impl RuntimeHealth {
    fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(HealthState::Bootstrapping as u8)),
            detail: Arc::new(tokio::sync::RwLock::new("bootstrapping".to_string())),
        }
    }

    pub fn state(&self) -> HealthState {
        HealthState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Operator-facing message paired with the state.
    pub async fn detail(&self) -> String {
        self.detail.read().await.clone()
    }

    async fn set(&self, state: HealthState, detail: impl Into<String>) {
        let detail = detail.into();
        info!(state = ?state, detail = %detail, "health state changed");
        self.state.store(state as u8, Ordering::SeqCst);
        *self.detail.write().await = detail;
    }
}

/// Process configuration.
#[derive(Clone, Debug)]
pub struct RecsimConfig {
    /// Local path, `http(s)://` URL or `gdrive:<file-id>`.
    pub snapshot: String,
    pub http_addr: SocketAddr,
    /// Engine memory pool; queries spill to `scratch_dir` beyond it.
    pub memory_limit_mb: usize,
    pub engine_threads: usize,
    pub scratch_dir: PathBuf,
    pub result_cache_ttl: Duration,
    pub result_cache_max_entries: usize,
    pub fetch_attempts: u32,
    pub fetch_timeout: Duration,
}

impl Default for RecsimConfig {
    fn default() -> Self {
        let engine = EngineSettings::default();
        let cache = ResultCachePolicy::default();
        Self {
            snapshot: DEFAULT_SNAPSHOT.to_string(),
            http_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            memory_limit_mb: DEFAULT_MEMORY_LIMIT_MB,
            engine_threads: engine.worker_threads,
            scratch_dir: engine.scratch_dir,
            result_cache_ttl: cache.ttl,
            result_cache_max_entries: cache.max_entries,
            fetch_attempts: engine.fetch_attempts,
            fetch_timeout: engine.fetch_timeout,
        }
    }
}

impl RecsimConfig {
    /// Loads configuration from `RECSIM_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let snapshot =
            std::env::var("RECSIM_SNAPSHOT").unwrap_or_else(|_| DEFAULT_SNAPSHOT.to_string());
        let http_addr =
            parse_socket_addr(std::env::var("RECSIM_HTTP_ADDR").ok(), DEFAULT_HTTP_ADDR)?;
        let memory_limit_mb = parse_usize(
            std::env::var("RECSIM_MEMORY_LIMIT_MB").ok(),
            DEFAULT_MEMORY_LIMIT_MB,
        )?
        .max(1);
        let engine_threads = parse_usize(
            std::env::var("RECSIM_ENGINE_THREADS").ok(),
            DEFAULT_ENGINE_THREADS,
        )?
        .max(1);
        let scratch_dir = std::env::var("RECSIM_SCRATCH_DIR")
            .ok()
            .filter(|raw| !raw.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| EngineSettings::default().scratch_dir);
        let ttl_secs = parse_u64(
            std::env::var("RECSIM_RESULT_CACHE_TTL_SECS").ok(),
            DEFAULT_RESULT_CACHE_TTL_SECS,
        )?;
        let result_cache_max_entries = parse_usize(
            std::env::var("RECSIM_RESULT_CACHE_MAX_ENTRIES").ok(),
            DEFAULT_RESULT_CACHE_MAX_ENTRIES,
        )?
        .max(1);
        let fetch_attempts = parse_u32(
            std::env::var("RECSIM_FETCH_ATTEMPTS").ok(),
            DEFAULT_FETCH_ATTEMPTS,
        )?
        .max(1);
        let fetch_timeout_secs = parse_u64(
            std::env::var("RECSIM_FETCH_TIMEOUT_SECS").ok(),
            DEFAULT_FETCH_TIMEOUT_SECS,
        )?;

        Ok(Self {
            snapshot,
            http_addr,
            memory_limit_mb,
            engine_threads,
            scratch_dir,
            result_cache_ttl: Duration::from_secs(ttl_secs),
            result_cache_max_entries,
            fetch_attempts,
            fetch_timeout: Duration::from_secs(fetch_timeout_secs),
        })
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            memory_limit_bytes: self.memory_limit_mb.saturating_mul(1024 * 1024),
            worker_threads: self.engine_threads,
            fetch_attempts: self.fetch_attempts,
            fetch_timeout: self.fetch_timeout,
            ..EngineSettings::default().with_scratch_dir(self.scratch_dir.clone())
        }
    }

    pub fn cache_policy(&self) -> ResultCachePolicy {
        ResultCachePolicy {
            ttl: self.result_cache_ttl,
            max_entries: self.result_cache_max_entries,
        }
    }
}

/// Runs the server until Ctrl-C is received.
pub async fn run(config: RecsimConfig) -> Result<()> {
    run_with_shutdown(config, tokio::signal::ctrl_c()).await
}

/// Runs the HTTP surface and loads the snapshot, stopping when `shutdown`
/// resolves. A snapshot that cannot be loaded is fatal.
pub async fn run_with_shutdown<F>(config: RecsimConfig, shutdown: F) -> Result<()>
where
    F: std::future::Future<Output = Result<(), std::io::Error>> + Send,
{
    let source = SnapshotSource::parse(&config.snapshot).context("parse RECSIM_SNAPSHOT")?;
    let health = RuntimeHealth::new();
    let metrics = Arc::new(QueryMetrics::default());
    let service = Arc::new(OnceCell::new());

    let listener = TcpListener::bind(config.http_addr)
        .await
        .with_context(|| format!("bind http server {}", config.http_addr))?;
    let (http_shutdown_tx, http_shutdown_rx) = watch::channel(false);
    let http_task = tokio::spawn(run_http_server(
        listener,
        AppState::new(health.clone(), metrics.clone(), service.clone()),
        http_shutdown_rx,
    ));
    info!(addr = %config.http_addr, snapshot = %source, "http server listening");

    health
        .set(
            HealthState::Bootstrapping,
            format!("loading snapshot {}", source.reference()),
        )
        .await;

    let snapshots = ResourceCache::new();
    let settings = config.engine_settings();
    tokio::pin!(shutdown);
    let loaded = tokio::select! {
        loaded = open_service(source, &settings, &snapshots, config.cache_policy(), metrics.clone()) => Some(loaded),
        stop = &mut shutdown => {
            if let Err(err) = stop {
                warn!(error = %err, "shutdown signal failed");
            }
            None
        }
    };

    let result = match loaded {
        Some(Ok((ready, summary))) => {
            let detail = format!(
                "ready (snapshot={}, rows={}, recommendations={})",
                ready.snapshot().reference(),
                summary.total_rows,
                summary.recommendations
            );
            // The cell is only ever filled here.
            let _ = service.set(ready);
            health.set(HealthState::Ready, detail).await;
            shutdown.await.context("wait for shutdown signal")
        }
        Some(Err(err)) => {
            error!(error = %err, "snapshot load failed");
            health.set(HealthState::NotReady, err.to_string()).await;
            Err(anyhow::Error::from(err).context("load snapshot"))
        }
        None => Ok(()),
    };

    if result.is_ok() {
        health.set(HealthState::NotReady, "shutdown requested").await;
    }
    let _ = http_shutdown_tx.send(true);

    match http_task.await {
        Ok(Err(err)) if result.is_ok() => return Err(err).context("http server task failed"),
        Err(err) if result.is_ok() => return Err(anyhow!("http server join failed: {err}")),
        _ => {}
    }
    result
}

/// Loads the configured snapshot and computes its summary without serving.
pub async fn summarize(config: &RecsimConfig) -> Result<Arc<MetadataSummary>> {
    let source = SnapshotSource::parse(&config.snapshot).context("parse snapshot reference")?;
    let metrics = Arc::new(QueryMetrics::default());
    let snapshots = ResourceCache::new();
    let (_, summary) = open_service(
        source,
        &config.engine_settings(),
        &snapshots,
        config.cache_policy(),
        metrics,
    )
    .await
    .context("load snapshot")?;
    Ok(summary)
}

async fn open_service(
    source: SnapshotSource,
    settings: &EngineSettings,
    snapshots: &ResourceCache<Snapshot>,
    policy: ResultCachePolicy,
    metrics: Arc<QueryMetrics>,
) -> recsim_query::QueryResult<(Arc<QueryService>, Arc<MetadataSummary>)> {
    let service = QueryService::open(source, settings, snapshots, policy, metrics).await?;
    let summary = service.metadata_summary().await?;
    Ok((Arc::new(service), summary))
}

fn parse_usize(value: Option<String>, default_value: usize) -> Result<usize> {
    match value {
        Some(raw) => raw
            .trim()
            .parse::<usize>()
            .with_context(|| format!("invalid usize value: {raw}")),
        None => Ok(default_value),
    }
}

fn parse_u64(value: Option<String>, default_value: u64) -> Result<u64> {
    match value {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid u64 value: {raw}")),
        None => Ok(default_value),
    }
}

fn parse_u32(value: Option<String>, default_value: u32) -> Result<u32> {
    match value {
        Some(raw) => raw
            .trim()
            .parse::<u32>()
            .with_context(|| format!("invalid u32 value: {raw}")),
        None => Ok(default_value),
    }
}

fn parse_socket_addr(value: Option<String>, default_addr: &str) -> Result<SocketAddr> {
    let raw = value.unwrap_or_else(|| default_addr.to_string());
    raw.trim()
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid socket address: {raw}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 9] = [
        "RECSIM_SNAPSHOT",
        "RECSIM_HTTP_ADDR",
        "RECSIM_MEMORY_LIMIT_MB",
        "RECSIM_ENGINE_THREADS",
        "RECSIM_SCRATCH_DIR",
        "RECSIM_RESULT_CACHE_TTL_SECS",
        "RECSIM_RESULT_CACHE_MAX_ENTRIES",
        "RECSIM_FETCH_ATTEMPTS",
        "RECSIM_FETCH_TIMEOUT_SECS",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn from_env_uses_defaults() {
        clear_env();
        let config = RecsimConfig::from_env().expect("defaults parse");
        assert_eq!(config.snapshot, "data/snapshot.parquet");
        assert_eq!(config.http_addr, "127.0.0.1:8080".parse::<SocketAddr>().unwrap());
        assert_eq!(config.memory_limit_mb, 2048);
        assert_eq!(config.engine_threads, 2);
        assert_eq!(config.result_cache_ttl, Duration::from_secs(600));
        assert_eq!(config.result_cache_max_entries, 1024);
        assert_eq!(config.fetch_attempts, 3);
        assert_eq!(config.fetch_timeout, Duration::from_secs(300));

        let settings = config.engine_settings();
        assert_eq!(settings.memory_limit_bytes, 2048 * 1024 * 1024);
        assert_eq!(settings.scratch_dir, config.scratch_dir);
    }

    #[test]
    #[serial]
    fn from_env_reads_overrides() {
        clear_env();
        std::env::set_var("RECSIM_SNAPSHOT", "gdrive:abc123");
        std::env::set_var("RECSIM_HTTP_ADDR", "0.0.0.0:9000");
        std::env::set_var("RECSIM_MEMORY_LIMIT_MB", "512");
        std::env::set_var("RECSIM_SCRATCH_DIR", "/var/tmp/recsim-test");
        std::env::set_var("RECSIM_RESULT_CACHE_TTL_SECS", "30");
        std::env::set_var("RECSIM_FETCH_ATTEMPTS", "0");
        let config = RecsimConfig::from_env().expect("overrides parse");
        clear_env();

        assert_eq!(config.snapshot, "gdrive:abc123");
        assert_eq!(config.http_addr.port(), 9000);
        assert_eq!(config.memory_limit_mb, 512);
        assert_eq!(config.scratch_dir, PathBuf::from("/var/tmp/recsim-test"));
        assert_eq!(config.cache_policy().ttl, Duration::from_secs(30));
        assert_eq!(config.fetch_attempts, 1);
    }

    #[test]
    #[serial]
    fn from_env_rejects_garbage() {
        clear_env();
        std::env::set_var("RECSIM_ENGINE_THREADS", "many");
        let err = RecsimConfig::from_env().expect_err("not a number");
        clear_env();
        assert!(format!("{err:#}").contains("many"));
    }

    #[test]
    fn unknown_health_bytes_are_not_ready() {
        assert_eq!(HealthState::from_u8(1), HealthState::Ready);
        assert_eq!(HealthState::from_u8(2), HealthState::NotReady);
        assert_eq!(HealthState::from_u8(42), HealthState::Bootstrapping);
    }
}
