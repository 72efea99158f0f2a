use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use recsim_query::testing::write_default_fixture;
use recsim_server::{run_with_shutdown, RecsimConfig};
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::oneshot;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn probes_report_ready_after_load() -> Result<()> {
    let harness = TestHarness::start().await?;

    assert_eq!(http_status(harness.addr, "GET", "/live")?, 200);
    assert_eq!(http_status(harness.addr, "GET", "/ready")?, 200);
    let state = http_body(harness.addr, "GET", "/state")?;
    assert!(state.contains("state=Ready"), "{state}");
    assert!(state.contains("rows=84"), "{state}");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn summary_and_ranking_over_http() -> Result<()> {
    let harness = TestHarness::start().await?;

    let summary = harness.get_json("/api/summary")?;
    assert_eq!(summary["status"], "ok");
    assert_eq!(summary["empty"], false);
    assert_eq!(summary["data"]["total_rows"], 84);
    assert_eq!(summary["data"]["municipalities"], 5);

    let ranking = harness.get_json("/api/municipalities/ranking?threshold=0.65&limit=2")?;
    let rows = ranking["data"].as_array().context("ranking rows")?;
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["territory_code"], "05001");
    assert_eq!(rows[0]["rank"], 1);
    assert_eq!(rows[1]["territory_code"], "05002");

    let rollup = harness.get_json("/api/departments/rollup?department=Antioquia")?;
    assert_eq!(rollup["data"].as_array().map(Vec::len), Some(1));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn empty_results_are_flagged() -> Result<()> {
    let harness = TestHarness::start().await?;
    let top = harness.get_json("/api/recommendations/top?municipality=Tumaco")?;
    assert_eq!(top["status"], "ok");
    assert_eq!(top["empty"], true);
    assert_eq!(top["data"], Value::Array(Vec::new()));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn paginated_matches_over_http() -> Result<()> {
    let harness = TestHarness::start().await?;
    let page = harness.get_json("/api/matches?territory=5001&page=2&page_size=3")?;
    assert_eq!(page["data"]["total_rows"], 8);
    assert_eq!(page["data"]["total_pages"], 3);
    assert_eq!(page["data"]["rows"].as_array().map(Vec::len), Some(2));

    let paragraphs = harness.get_json("/api/paragraphs?territory=05001&recommendation=MCV1")?;
    assert_eq!(paragraphs["data"]["total_rows"], 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn invalid_filters_are_rejected_and_counted() -> Result<()> {
    let harness = TestHarness::start().await?;

    let (status, body) = http_request(harness.addr, "GET", "/api/departments/rollup?threshold=1.01")?;
    assert_eq!(status, 400);
    let body: Value = serde_json::from_str(&body)?;
    assert_eq!(body["status"], "error");
    assert_eq!(body["kind"], "invalid_request");

    let (status, _) = http_request(harness.addr, "GET", "/api/matches?page_size=5")?;
    assert_eq!(status, 400);

    let metrics = http_body(harness.addr, "GET", "/metrics")?;
    assert_eq!(metric_value(&metrics, "rejected_requests"), Some(2));
    // Readiness runs the summary; nothing else touched the engine.
    assert_eq!(metric_value(&metrics, "queries_executed"), Some(1));

    assert_eq!(http_status(harness.addr, "GET", "/api/nowhere")?, 404);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn request_split_across_writes_keeps_its_filters() -> Result<()> {
    let harness = TestHarness::start().await?;

    let mut stream = TcpStream::connect(harness.addr).context("connect http server")?;
    stream.write_all(b"GET /api/departments/rollup?thres")?;
    stream.flush()?;
    std::thread::sleep(Duration::from_millis(100));
    stream.write_all(b"hold=1.01 HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")?;

    let mut resp = String::new();
    stream
        .read_to_string(&mut resp)
        .context("read http response")?;
    assert!(resp.starts_with("HTTP/1.1 400"), "{resp}");
    assert!(resp.contains("threshold"), "{resp}");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cache_invalidation_forces_recomputation() -> Result<()> {
    let harness = TestHarness::start().await?;

    harness.get_json("/api/recommendations/catalog")?;
    harness.get_json("/api/recommendations/catalog")?;
    let metrics = http_body(harness.addr, "GET", "/metrics")?;
    assert_eq!(metric_value(&metrics, "cache_hits"), Some(1));

    let (status, body) = http_request(
        harness.addr,
        "POST",
        "/api/cache/invalidate?query=recommendation_catalog",
    )?;
    assert_eq!(status, 200);
    let body: Value = serde_json::from_str(&body)?;
    assert_eq!(body["data"]["removed"], 1);

    harness.get_json("/api/recommendations/catalog")?;
    let metrics = http_body(harness.addr, "GET", "/metrics")?;
    assert_eq!(
        metric_value(&metrics, "query_recommendation_catalog_executions"),
        Some(2)
    );

    let (status, _) = http_request(harness.addr, "POST", "/api/cache/invalidate?query=bogus")?;
    assert_eq!(status, 400);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn missing_snapshot_is_fatal() -> Result<()> {
    let temp_dir = TempDir::new().context("create temp dir")?;
    let config = test_config(&temp_dir, temp_dir.path().join("absent.parquet").display().to_string())?;

    let err = run_with_shutdown(config, std::future::pending::<Result<(), std::io::Error>>())
        .await
        .expect_err("snapshot does not exist");
    let message = format!("{err:#}");
    assert!(message.contains("absent.parquet"), "{message}");
    assert!(message.contains("unavailable"), "{message}");
    Ok(())
}

struct TestHarness {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    runtime_task: Option<tokio::task::JoinHandle<anyhow::Result<()>>>,
    _temp_dir: TempDir,
}

impl TestHarness {
    async fn start() -> Result<Self> {
        let temp_dir = TempDir::new().context("create temp dir")?;
        let snapshot = temp_dir.path().join("snapshot.parquet");
        write_default_fixture(&snapshot).context("write fixture snapshot")?;
        let config = test_config(&temp_dir, snapshot.display().to_string())?;
        let addr = config.http_addr;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let runtime_task = tokio::spawn(async move {
            run_with_shutdown(config, async move {
                let _ = shutdown_rx.await;
                Ok::<(), std::io::Error>(())
            })
            .await
        });

        wait_for_ready(addr, Duration::from_secs(30)).context("wait for runtime readiness")?;

        Ok(Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
            runtime_task: Some(runtime_task),
            _temp_dir: temp_dir,
        })
    }

    fn get_json(&self, path: &str) -> Result<Value> {
        let (status, body) = http_request(self.addr, "GET", path)?;
        anyhow::ensure!(status == 200, "GET {path} returned {status}: {body}");
        serde_json::from_str(&body).with_context(|| format!("decode {path} response"))
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.runtime_task.take() {
            task.abort();
        }
    }
}

fn test_config(temp_dir: &TempDir, snapshot: String) -> Result<RecsimConfig> {
    Ok(RecsimConfig {
        snapshot,
        http_addr: format!("127.0.0.1:{}", free_port()?).parse()?,
        memory_limit_mb: 256,
        engine_threads: 2,
        scratch_dir: temp_dir.path().join("scratch"),
        ..RecsimConfig::default()
    })
}

fn free_port() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").context("bind ephemeral port")?;
    Ok(listener.local_addr()?.port())
}

fn wait_for_ready(addr: SocketAddr, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Ok(status) = http_status(addr, "GET", "/ready") {
            if status == 200 {
                return Ok(());
            }
        }
        if Instant::now() >= deadline {
            anyhow::bail!("timed out waiting for /ready on {addr}");
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

fn http_request(addr: SocketAddr, method: &str, path: &str) -> Result<(u16, String)> {
    let mut stream = TcpStream::connect(addr).context("connect http server")?;
    let request =
        format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream
        .write_all(request.as_bytes())
        .context("write http request")?;

    let mut resp = String::new();
    stream
        .read_to_string(&mut resp)
        .context("read http response")?;
    let status = resp
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .ok_or_else(|| anyhow::anyhow!("invalid http response: {resp}"))?
        .parse::<u16>()
        .context("parse http status code")?;
    let body = resp
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default();
    Ok((status, body))
}

fn http_status(addr: SocketAddr, method: &str, path: &str) -> Result<u16> {
    Ok(http_request(addr, method, path)?.0)
}

fn http_body(addr: SocketAddr, method: &str, path: &str) -> Result<String> {
    Ok(http_request(addr, method, path)?.1)
}

fn metric_value(body: &str, key: &str) -> Option<u64> {
    let prefix = format!("{key}=");
    body.lines()
        .find_map(|line| line.strip_prefix(prefix.as_str()))
        .and_then(|raw| raw.trim().parse::<u64>().ok())
}
