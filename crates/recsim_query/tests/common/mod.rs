#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use recsim_query::testing::{write_fixture, FixtureOptions};
use recsim_query::{
    EngineSettings, QueryMetrics, QueryService, ResultCachePolicy, Snapshot, SnapshotSource,
};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

pub struct Fixture {
    pub service: QueryService,
    pub metrics: Arc<QueryMetrics>,
    pub path: PathBuf,
    _temp_dir: TempDir,
}

pub async fn open_fixture() -> Result<Fixture> {
    open_fixture_with(FixtureOptions::default()).await
}

pub async fn open_fixture_with(options: FixtureOptions) -> Result<Fixture> {
    let temp_dir = TempDir::new().context("create temp dir")?;
    let path = temp_dir.path().join("snapshot.parquet");
    write_fixture(&path, &options).context("write fixture snapshot")?;

    let settings = test_settings(&temp_dir);
    let metrics = Arc::new(QueryMetrics::default());
    let snapshot = Snapshot::load(SnapshotSource::Local(path.clone()), &settings, &metrics)
        .await
        .context("load fixture snapshot")?;
    let service = QueryService::new(
        Arc::new(snapshot),
        ResultCachePolicy::default(),
        metrics.clone(),
    );
    Ok(Fixture {
        service,
        metrics,
        path,
        _temp_dir: temp_dir,
    })
}

pub fn test_settings(temp_dir: &TempDir) -> EngineSettings {
    EngineSettings {
        memory_limit_bytes: 256 * 1024 * 1024,
        worker_threads: 2,
        fetch_backoff: Duration::from_millis(10),
        fetch_timeout: Duration::from_secs(10),
        ..EngineSettings::default().with_scratch_dir(temp_dir.path().join("scratch"))
    }
}

/// Canned reply for the one-shot HTTP file server.
#[derive(Clone)]
pub struct Reply {
    pub status: u16,
    pub body: Vec<u8>,
}

impl Reply {
    pub fn ok(body: Vec<u8>) -> Self {
        Self { status: 200, body }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: format!("status {status}").into_bytes(),
        }
    }
}

/// Serves `replies` in order (repeating the last one) and counts requests.
pub async fn serve_replies(replies: Vec<Reply>) -> Result<(SocketAddr, Arc<AtomicUsize>)> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .context("bind file server")?;
    let addr = listener.local_addr()?;
    let served = Arc::new(AtomicUsize::new(0));
    let counter = served.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let index = counter.fetch_add(1, Ordering::SeqCst);
            let reply = replies
                .get(index)
                .or_else(|| replies.last())
                .cloned()
                .unwrap_or_else(|| Reply::status(500));
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let _ = stream.read(&mut buf).await;
                let head = format!(
                    "HTTP/1.1 {} X\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    reply.status,
                    reply.body.len()
                );
                let _ = stream.write_all(head.as_bytes()).await;
                let _ = stream.write_all(&reply.body).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    Ok((addr, served))
}
