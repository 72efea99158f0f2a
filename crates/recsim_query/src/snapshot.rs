//! Snapshot loader: resolves a snapshot reference to a local Parquet file,
//! registers it with DataFusion and installs the normalized `sentences` view.
//!
//! Remote snapshots are downloaded once into the scratch directory under a
//! name derived from the reference, so restarts reuse the cached file. A
//! download lands in a temporary file and is renamed into place only after the
//! Parquet magic bytes check out.

use std::fmt;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, Instant};

use datafusion::dataframe::DataFrame;
use datafusion::execution::runtime_env::RuntimeEnvBuilder;
use datafusion::prelude::{ParquetReadOptions, SessionConfig, SessionContext};
use reqwest::StatusCode;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{info, warn};

use crate::error::{QueryError, QueryResult};
use crate::metrics::QueryMetrics;
use crate::schema::{plan_sentences_view, KindSource, RAW_TABLE, SENTENCES_VIEW};

/// Default engine memory limit (2 GiB).
pub const DEFAULT_MEMORY_LIMIT_BYTES: usize = 2 * 1024 * 1024 * 1024;
/// Default engine worker threads.
pub const DEFAULT_ENGINE_THREADS: usize = 2;
/// Default download attempts before giving up.
pub const DEFAULT_FETCH_ATTEMPTS: u32 = 3;
/// Default whole-request download timeout.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(300);
/// Base delay between download attempts; attempt `n` waits `n` times this.
pub const DEFAULT_FETCH_BACKOFF: Duration = Duration::from_secs(2);

const PARQUET_MAGIC: &[u8; 4] = b"PAR1";
const GDRIVE_PREFIX: &str = "gdrive:";

/// Where a snapshot comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotSource {
    /// Parquet file on the local filesystem.
    Local(PathBuf),
    /// Parquet file fetched over HTTP(S). `reference` is what the operator
    /// configured; `url` is what gets requested.
    Remote { reference: String, url: String },
}

impl SnapshotSource {
    /// Parses a local path, an `http(s)://` URL or a `gdrive:<file-id>` reference.
    pub fn parse(reference: &str) -> QueryResult<Self> {
        let trimmed = reference.trim();
        if trimmed.is_empty() {
            return Err(QueryError::invalid("snapshot reference must not be empty"));
        }
        if let Some(id) = trimmed.strip_prefix(GDRIVE_PREFIX) {
            let id = id.trim();
            if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
                return Err(QueryError::invalid(format!(
                    "invalid Google Drive file id in '{trimmed}'"
                )));
            }
            return Ok(Self::Remote {
                reference: trimmed.to_string(),
                url: format!(
                    "https://drive.usercontent.google.com/download?id={id}&export=download&confirm=t"
                ),
            });
        }
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            return Ok(Self::Remote {
                reference: trimmed.to_string(),
                url: trimmed.to_string(),
            });
        }
        Ok(Self::Local(PathBuf::from(trimmed)))
    }

    /// Stable identity used for resource-cache keys and error messages.
    pub fn reference(&self) -> String {
        match self {
            Self::Local(path) => path.display().to_string(),
            Self::Remote { reference, .. } => reference.clone(),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. })
    }
}

impl FromStr for SnapshotSource {
    type Err = QueryError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::parse(raw)
    }
}

impl fmt::Display for SnapshotSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reference())
    }
}

/// Engine tuning and download policy.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Upper bound of the DataFusion memory pool.
    pub memory_limit_bytes: usize,
    /// DataFusion target partitions.
    pub worker_threads: usize,
    /// Spill files and the snapshot download cache live here.
    pub scratch_dir: PathBuf,
    pub fetch_attempts: u32,
    pub fetch_timeout: Duration,
    pub fetch_backoff: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            memory_limit_bytes: DEFAULT_MEMORY_LIMIT_BYTES,
            worker_threads: DEFAULT_ENGINE_THREADS,
            scratch_dir: std::env::temp_dir().join("recsim"),
            fetch_attempts: DEFAULT_FETCH_ATTEMPTS,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            fetch_backoff: DEFAULT_FETCH_BACKOFF,
        }
    }
}

impl EngineSettings {
    pub fn with_scratch_dir(mut self, scratch_dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = scratch_dir.into();
        self
    }

    /// Builds a session context bounded by these settings.
    pub fn session_context(&self) -> QueryResult<SessionContext> {
        let runtime = RuntimeEnvBuilder::new()
            .with_memory_limit(self.memory_limit_bytes.max(1), 1.0)
            .with_temp_file_path(self.scratch_dir.clone())
            .build_arc()?;
        let config = SessionConfig::new()
            .with_target_partitions(self.worker_threads.max(1))
            .with_repartition_aggregations(true)
            .with_repartition_sorts(true)
            .with_information_schema(false);
        Ok(SessionContext::new_with_config_rt(config, runtime))
    }
}

/// Loaded, immutable snapshot exposed as the `sentences` view.
pub struct Snapshot {
    source: SnapshotSource,
    local_path: PathBuf,
    ctx: SessionContext,
    row_count: u64,
    missing_optional: Vec<&'static str>,
    kind_source: KindSource,
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("source", &self.source)
            .field("local_path", &self.local_path)
            .field("row_count", &self.row_count)
            .field("kind_source", &self.kind_source)
            .finish()
    }
}

impl Snapshot {
    /// Resolves, registers and verifies a snapshot.
    ///
    /// Either returns a fully usable snapshot or an error; nothing is left
    /// half-registered in shared state because the context is private to the
    /// returned value.
    pub async fn load(
        source: SnapshotSource,
        settings: &EngineSettings,
        metrics: &QueryMetrics,
    ) -> QueryResult<Self> {
        let started = Instant::now();
        let reference = source.reference();
        tokio::fs::create_dir_all(&settings.scratch_dir).await?;

        let local_path = match &source {
            SnapshotSource::Local(path) => {
                ensure_local_parquet(&reference, path).await?;
                path.clone()
            }
            SnapshotSource::Remote { url, .. } => fetch_remote(&reference, url, settings, metrics).await?,
        };

        let ctx = settings.session_context()?;
        let location = local_path.to_string_lossy().to_string();
        let extension = local_path
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_default();
        let options = ParquetReadOptions {
            file_extension: extension.as_str(),
            ..Default::default()
        };
        ctx.register_parquet(RAW_TABLE, location.as_str(), options)
            .await
            .map_err(|err| malformed(&reference, err))?;

        let provider = ctx.table_provider(RAW_TABLE).await?;
        let plan = plan_sentences_view(provider.schema().as_ref()).map_err(|missing| {
            malformed(
                &reference,
                format!("missing required columns: {}", missing.join(", ")),
            )
        })?;
        if !plan.missing_optional.is_empty() {
            warn!(
                snapshot = %reference,
                columns = %plan.missing_optional.join(","),
                "snapshot lacks optional columns; they surface as NULL"
            );
        }
        ctx.sql(&plan.sql).await?.collect().await?;

        let row_count = ctx
            .table(SENTENCES_VIEW)
            .await?
            .count()
            .await
            .map_err(|err| malformed(&reference, err))? as u64;

        info!(
            snapshot = %reference,
            path = %local_path.display(),
            rows = row_count,
            kind_source = ?plan.kind_source,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "snapshot loaded"
        );
        Ok(Self {
            source,
            local_path,
            ctx,
            row_count,
            missing_optional: plan.missing_optional,
            kind_source: plan.kind_source,
        })
    }

    pub fn source(&self) -> &SnapshotSource {
        &self.source
    }

    pub fn reference(&self) -> String {
        self.source.reference()
    }

    /// Local file backing the snapshot (the download cache for remote sources).
    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    /// Row count verified at load time.
    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    pub fn missing_optional_columns(&self) -> &[&'static str] {
        &self.missing_optional
    }

    pub fn kind_source(&self) -> KindSource {
        self.kind_source
    }

    /// Fresh DataFrame over the normalized view.
    pub async fn sentences(&self) -> QueryResult<DataFrame> {
        Ok(self.ctx.table(SENTENCES_VIEW).await?)
    }
}

fn unavailable(reference: &str, reason: impl fmt::Display) -> QueryError {
    QueryError::SnapshotUnavailable {
        reference: reference.to_string(),
        reason: reason.to_string(),
    }
}

fn malformed(reference: &str, reason: impl fmt::Display) -> QueryError {
    QueryError::MalformedSnapshot {
        reference: reference.to_string(),
        reason: reason.to_string(),
    }
}

async fn ensure_local_parquet(reference: &str, path: &Path) -> QueryResult<()> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => {}
        Ok(_) => return Err(unavailable(reference, "not a regular file")),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(unavailable(reference, "file not found"))
        }
        Err(err) => return Err(unavailable(reference, err)),
    }
    if !has_parquet_magic(path).await? {
        return Err(malformed(reference, "not a Parquet file (missing PAR1 magic)"));
    }
    Ok(())
}

/// Scratch-directory file name for a remote reference.
pub fn cache_file_name(reference: &str) -> String {
    format!("snapshot-{:08x}.parquet", crc32fast::hash(reference.as_bytes()))
}

/// Checks the `PAR1` marker at both ends of the file.
pub async fn has_parquet_magic(path: &Path) -> io::Result<bool> {
    let mut file = match File::open(path).await {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err),
    };
    let len = file.metadata().await?.len();
    if len < (PARQUET_MAGIC.len() * 3) as u64 {
        return Ok(false);
    }
    let mut head = [0u8; 4];
    file.read_exact(&mut head).await?;
    file.seek(SeekFrom::End(-(PARQUET_MAGIC.len() as i64))).await?;
    let mut tail = [0u8; 4];
    file.read_exact(&mut tail).await?;
    Ok(&head == PARQUET_MAGIC && &tail == PARQUET_MAGIC)
}

#[derive(Debug)]
enum FetchError {
    /// Worth another attempt: connect failures, timeouts, 5xx, 429.
    Transient(String),
    Permanent(String),
    /// The server answered, but not with a Parquet file.
    NotParquet,
    Io(io::Error),
}

impl From<io::Error> for FetchError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() || err.is_body() {
            return Self::Transient(err.to_string());
        }
        match err.status() {
            Some(status) if is_transient_status(status) => Self::Transient(err.to_string()),
            _ => Self::Permanent(err.to_string()),
        }
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

async fn fetch_remote(
    reference: &str,
    url: &str,
    settings: &EngineSettings,
    metrics: &QueryMetrics,
) -> QueryResult<PathBuf> {
    let dest = settings.scratch_dir.join(cache_file_name(reference));
    if has_parquet_magic(&dest).await? {
        info!(snapshot = %reference, path = %dest.display(), "reusing cached snapshot download");
        return Ok(dest);
    }

    let client = reqwest::Client::builder()
        .timeout(settings.fetch_timeout)
        .build()
        .map_err(|err| unavailable(reference, err))?;
    let attempts = settings.fetch_attempts.max(1);
    let mut last_error = String::new();
    for attempt in 1..=attempts {
        info!(snapshot = %reference, attempt, attempts, "downloading snapshot");
        match download_once(&client, url, &dest).await {
            Ok(bytes) => {
                metrics.record_fetch_attempt(false);
                info!(snapshot = %reference, bytes, path = %dest.display(), "snapshot downloaded");
                return Ok(dest);
            }
            Err(FetchError::Transient(reason)) => {
                metrics.record_fetch_attempt(true);
                warn!(snapshot = %reference, attempt, attempts, error = %reason, "snapshot download failed");
                last_error = reason;
                if attempt < attempts {
                    tokio::time::sleep(settings.fetch_backoff * attempt).await;
                }
            }
            Err(FetchError::Permanent(reason)) => {
                metrics.record_fetch_attempt(true);
                return Err(unavailable(reference, reason));
            }
            Err(FetchError::NotParquet) => {
                metrics.record_fetch_attempt(true);
                return Err(malformed(
                    reference,
                    "downloaded content is not a Parquet file (missing PAR1 magic)",
                ));
            }
            Err(FetchError::Io(err)) => {
                metrics.record_fetch_attempt(true);
                return Err(QueryError::Io(err));
            }
        }
    }
    Err(unavailable(
        reference,
        format!("download failed after {attempts} attempts: {last_error}"),
    ))
}

/// Streams one download into `<dest>.part` and renames it into place.
async fn download_once(
    client: &reqwest::Client,
    url: &str,
    dest: &Path,
) -> Result<u64, FetchError> {
    let mut response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        let reason = format!("HTTP {status}");
        return Err(if is_transient_status(status) {
            FetchError::Transient(reason)
        } else {
            FetchError::Permanent(reason)
        });
    }

    let tmp_path = dest.with_extension("part");
    let mut file = File::create(&tmp_path).await?;
    let mut written = 0u64;
    let streamed = async {
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.sync_all().await?;
        Ok::<_, FetchError>(())
    }
    .await;
    drop(file);
    if let Err(err) = streamed {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(err);
    }

    if !has_parquet_magic(&tmp_path).await? {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(FetchError::NotParquet);
    }
    tokio::fs::rename(&tmp_path, dest).await?;
    Ok(written)
}
