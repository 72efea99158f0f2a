//! Minimal HTTP/1.1 surface: health probes, metrics and the JSON query API.
//!
//! One request per connection. Filters travel as query-string parameters;
//! set-valued options accept repeated keys or comma-separated lists.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use recsim_query::filter::POVERTY_INDEX_BOUNDS;
use recsim_query::queries::{DEFAULT_TERRITORIES_PER_RECOMMENDATION, DEFAULT_TOP_RECOMMENDATIONS};
use recsim_query::{
    DetailScope, ErrorKind, FilterConfig, PageRequest, ProgramFilter, QueryError, QueryMetrics,
    QueryName, QueryOutput, QueryResult, QueryService, TerritoryKind, DEFAULT_PAGE_SIZE,
};
use serde::Serialize;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, OnceCell};
use tracing::{debug, warn};
use url::Url;

use crate::{HealthState, RuntimeHealth};

const MAX_REQUEST_BYTES: usize = 8 * 1024;

/// Everything a connection handler needs.
#[derive(Clone)]
pub(crate) struct AppState {
    health: RuntimeHealth,
    metrics: Arc<QueryMetrics>,
    service: Arc<OnceCell<Arc<QueryService>>>,
}

impl AppState {
    pub(crate) fn new(
        health: RuntimeHealth,
        metrics: Arc<QueryMetrics>,
        service: Arc<OnceCell<Arc<QueryService>>>,
    ) -> Self {
        Self {
            health,
            metrics,
            service,
        }
    }
}

/// Accepts connections until shutdown is signaled.
pub(crate) async fn run_http_server(
    listener: TcpListener,
    state: AppState,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return Ok(());
                }
            }
            accept = listener.accept() => {
                let (stream, peer) = accept.context("accept http connection")?;
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(stream, state).await {
                        debug!(peer = %peer, error = %err, "http connection failed");
                    }
                });
            }
        }
    }
}

#[derive(Debug, PartialEq)]
struct Response {
    status: u16,
    content_type: &'static str,
    body: String,
}

impl Response {
    fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: "text/plain",
            body: body.into(),
        }
    }

    fn json(status: u16, value: serde_json::Value) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: value.to_string(),
        }
    }
}

/// Outcome of reading a request head off the socket.
#[derive(Debug, PartialEq)]
enum RequestHead {
    Complete(String),
    TooLarge,
    Truncated,
}

/// Reads until the blank line ending the headers, across as many reads as the
/// peer needs. A head larger than [`MAX_REQUEST_BYTES`] is never parsed.
async fn read_request_head<R>(reader: &mut R) -> Result<RequestHead>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(end) = head_end(&buf) {
            buf.truncate(end);
            return Ok(RequestHead::Complete(String::from_utf8_lossy(&buf).into_owned()));
        }
        if buf.len() >= MAX_REQUEST_BYTES {
            return Ok(RequestHead::TooLarge);
        }
        let n = reader.read(&mut chunk).await.context("read http request")?;
        if n == 0 {
            // Peer closed early; a complete request line is still usable.
            return Ok(if buf.contains(&b'\n') {
                RequestHead::Complete(String::from_utf8_lossy(&buf).into_owned())
            } else {
                RequestHead::Truncated
            });
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn head_end(buf: &[u8]) -> Option<usize> {
    let crlf = buf.windows(4).position(|window| window == b"\r\n\r\n");
    let lf = buf.windows(2).position(|window| window == b"\n\n");
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

async fn handle_connection(mut stream: TcpStream, state: AppState) -> Result<()> {
    let response = match read_request_head(&mut stream).await? {
        RequestHead::Complete(raw) => match Request::parse(&raw) {
            Some(request) => route(&state, &request).await,
            None => error_json(400, "invalid_request", "malformed request line"),
        },
        RequestHead::TooLarge => error_json(
            400,
            "invalid_request",
            format!("request head exceeds {MAX_REQUEST_BYTES} bytes"),
        ),
        RequestHead::Truncated => error_json(400, "invalid_request", "incomplete request line"),
    };

    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        response.status,
        http_status_text(response.status),
        response.content_type,
        response.body.len(),
    );
    stream
        .write_all(head.as_bytes())
        .await
        .context("write http response head")?;
    stream
        .write_all(response.body.as_bytes())
        .await
        .context("write http response body")?;
    stream.flush().await.context("flush http response")?;
    Ok(())
}

/// Method, path and decoded query parameters of one request.
#[derive(Debug, PartialEq)]
struct Request {
    method: String,
    path: String,
    params: Params,
}

impl Request {
    fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.lines().next()?.split_whitespace();
        let method = parts.next()?.to_ascii_uppercase();
        let target = parts.next()?;
        if !target.starts_with('/') {
            return None;
        }
        let url = Url::parse(&format!("http://localhost{target}")).ok()?;
        Some(Self {
            method,
            path: url.path().to_string(),
            params: Params(url.query_pairs().into_owned().collect()),
        })
    }
}

#[derive(Debug, Default, PartialEq)]
struct Params(Vec<(String, String)>);

impl Params {
    /// Last non-empty value for `name`.
    fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .rev()
            .find(|(key, value)| key == name && !value.trim().is_empty())
            .map(|(_, value)| value.trim())
    }

    /// Every value for `name`, splitting comma lists.
    fn all(&self, name: &str) -> Vec<String> {
        self.0
            .iter()
            .filter(|(key, _)| key == name)
            .flat_map(|(_, value)| value.split(','))
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .collect()
    }

    fn parse<T>(&self, name: &str) -> QueryResult<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(name)
            .map(|raw| {
                raw.parse::<T>()
                    .map_err(|err| QueryError::invalid(format!("{name}: {err}")))
            })
            .transpose()
    }

    fn parse_or<T>(&self, name: &str, default: T) -> QueryResult<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        Ok(self.parse(name)?.unwrap_or(default))
    }

    fn flag(&self, name: &str) -> QueryResult<Option<bool>> {
        match self.get(name).map(str::to_ascii_lowercase).as_deref() {
            None => Ok(None),
            Some("true" | "1" | "yes" | "on") => Ok(Some(true)),
            Some("false" | "0" | "no" | "off") => Ok(Some(false)),
            Some(other) => Err(QueryError::invalid(format!("{name}: '{other}' is not a boolean"))),
        }
    }

    fn filter(&self) -> QueryResult<FilterConfig> {
        let mut filter = FilterConfig::default();
        if let Some(threshold) = self.parse::<f64>("threshold")? {
            filter = filter.with_threshold(threshold);
        }
        if let Some(kind) = self.parse::<TerritoryKind>("kind")? {
            filter = filter.with_kind(kind);
        }
        if let Some(department) = self.get("department") {
            filter = filter.in_department(department);
        }
        if let Some(municipality) = self.get("municipality") {
            filter = filter.in_municipality(municipality);
        }
        if let Some(policy_only) = self.flag("policy_only")? {
            filter = filter.with_policy_only(policy_only);
        }
        if let Some(program) = self.parse::<ProgramFilter>("program")? {
            filter = filter.with_program(program);
        }
        filter = filter
            .with_conflict_categories(self.all("conflict"))
            .with_capacity_groups(self.all("capacity"));
        let poverty_min = self.parse::<f64>("poverty_min")?;
        let poverty_max = self.parse::<f64>("poverty_max")?;
        if poverty_min.is_some() || poverty_max.is_some() {
            filter = filter.with_poverty_range(
                poverty_min.unwrap_or(POVERTY_INDEX_BOUNDS.0),
                poverty_max.unwrap_or(POVERTY_INDEX_BOUNDS.1),
            );
        }
        Ok(filter)
    }

    fn page(&self) -> QueryResult<PageRequest> {
        Ok(PageRequest::new(
            self.parse_or("page", 0)?,
            self.parse_or("page_size", DEFAULT_PAGE_SIZE as i64)?,
        ))
    }

    fn scope(&self) -> DetailScope {
        DetailScope {
            recommendation: self.get("recommendation").map(str::to_string),
            territory_code: self.get("territory").map(str::to_string),
        }
    }
}

async fn route(state: &AppState, request: &Request) -> Response {
    let path = request.path.as_str();
    match (request.method.as_str(), path) {
        ("GET", "/live") => Response::text(200, "live\n"),
        ("GET", "/ready") => match state.health.state() {
            HealthState::Ready => Response::text(200, "ready\n"),
            other => Response::text(503, format!("not-ready ({other:?})\n")),
        },
        ("GET", "/state" | "/") => Response::text(
            200,
            format!(
                "state={:?}\ndetail={}\n",
                state.health.state(),
                state.health.detail().await
            ),
        ),
        ("GET", "/metrics") => Response::text(200, state.metrics.render_text()),
        ("POST", "/api/cache/invalidate") => match state.service.get() {
            Some(service) => invalidate(service, &request.params),
            None => not_ready(state).await,
        },
        ("GET", api) if api.starts_with("/api/") => match state.service.get() {
            Some(service) => api_get(service, api, &request.params).await,
            None => not_ready(state).await,
        },
        (_, "/live" | "/ready" | "/state" | "/metrics" | "/api/cache/invalidate") => {
            error_json(405, "method_not_allowed", "method not allowed")
        }
        _ => error_json(404, "not_found", format!("no route for {path}")),
    }
}

/// A parsed `/api` request.
#[derive(Debug, Clone, PartialEq)]
enum ApiCall {
    Summary,
    FilteredSummary(FilterConfig),
    DepartmentRollup(FilterConfig),
    DepartmentOverview(FilterConfig),
    MunicipalRanking(FilterConfig, Option<usize>),
    TopRecommendations(FilterConfig, usize),
    RecommendationTerritories(FilterConfig, String, usize),
    SentenceMatches(FilterConfig, DetailScope, PageRequest),
    ParagraphMatches(FilterConfig, DetailScope, PageRequest),
    RecommendationCatalog,
    Municipalities,
    Departments,
}

impl ApiCall {
    /// `None` for unknown paths.
    fn parse(path: &str, params: &Params) -> Option<QueryResult<Self>> {
        let call = match path {
            "/api/summary" => Ok(Self::Summary),
            "/api/summary/filtered" => params.filter().map(Self::FilteredSummary),
            "/api/departments/rollup" => params.filter().map(Self::DepartmentRollup),
            "/api/departments/overview" => params.filter().map(Self::DepartmentOverview),
            "/api/municipalities/ranking" => params
                .filter()
                .and_then(|filter| Ok(Self::MunicipalRanking(filter, params.parse("limit")?))),
            "/api/recommendations/top" => params.filter().and_then(|filter| {
                Ok(Self::TopRecommendations(
                    filter,
                    params.parse_or("limit", DEFAULT_TOP_RECOMMENDATIONS)?,
                ))
            }),
            "/api/recommendations/municipalities" => params.filter().and_then(|filter| {
                Ok(Self::RecommendationTerritories(
                    filter,
                    params.get("code").unwrap_or_default().to_string(),
                    params.parse_or("limit", DEFAULT_TERRITORIES_PER_RECOMMENDATION)?,
                ))
            }),
            "/api/recommendations/catalog" => Ok(Self::RecommendationCatalog),
            "/api/matches" => params.filter().and_then(|filter| {
                Ok(Self::SentenceMatches(filter, params.scope(), params.page()?))
            }),
            "/api/paragraphs" => params.filter().and_then(|filter| {
                Ok(Self::ParagraphMatches(filter, params.scope(), params.page()?))
            }),
            "/api/territories/municipalities" => Ok(Self::Municipalities),
            "/api/territories/departments" => Ok(Self::Departments),
            _ => return None,
        };
        Some(call)
    }

    async fn execute(self, service: &QueryService) -> QueryResult<Response> {
        Ok(match self {
            Self::Summary => ok_json(service.metadata_summary().await?),
            Self::FilteredSummary(filter) => ok_json(service.filtered_summary(filter).await?),
            Self::DepartmentRollup(filter) => ok_json(service.department_rollup(filter).await?),
            Self::DepartmentOverview(filter) => {
                ok_json(service.department_overview(filter).await?)
            }
            Self::MunicipalRanking(filter, limit) => {
                ok_json(service.municipal_ranking(filter, limit).await?)
            }
            Self::TopRecommendations(filter, limit) => {
                ok_json(service.top_recommendations(filter, limit).await?)
            }
            Self::RecommendationTerritories(filter, code, limit) => ok_json(
                service
                    .recommendation_territories(filter, &code, limit)
                    .await?,
            ),
            Self::SentenceMatches(filter, scope, page) => {
                ok_json(service.sentence_matches(filter, scope, page).await?)
            }
            Self::ParagraphMatches(filter, scope, page) => {
                ok_json(service.paragraph_matches(filter, scope, page).await?)
            }
            Self::RecommendationCatalog => ok_json(service.recommendation_catalog().await?),
            Self::Municipalities => ok_json(service.municipalities().await?),
            Self::Departments => ok_json(service.departments().await?),
        })
    }
}

async fn api_get(service: &QueryService, path: &str, params: &Params) -> Response {
    let call = match ApiCall::parse(path, params) {
        Some(Ok(call)) => call,
        Some(Err(err)) => {
            // Malformed parameters never reach the service.
            service.metrics().record_rejection();
            return query_error(&err);
        }
        None => return error_json(404, "not_found", format!("no route for {path}")),
    };
    call.execute(service)
        .await
        .unwrap_or_else(|err| query_error(&err))
}

/// Payload of a cache invalidation.
#[derive(Debug, Serialize)]
struct Invalidated {
    #[serde(skip_serializing_if = "Option::is_none")]
    query: Option<&'static str>,
    removed: usize,
}

impl QueryOutput for Invalidated {
    fn row_count(&self) -> u64 {
        self.removed as u64
    }
}

fn invalidate(service: &QueryService, params: &Params) -> Response {
    match params.parse::<QueryName>("query") {
        Ok(Some(query)) => ok_json(Arc::new(Invalidated {
            query: Some(query.as_str()),
            removed: service.invalidate_query(query),
        })),
        Ok(None) => ok_json(Arc::new(Invalidated {
            query: None,
            removed: service.invalidate_results(),
        })),
        Err(err) => query_error(&err),
    }
}

async fn not_ready(state: &AppState) -> Response {
    error_json(
        503,
        "not_ready",
        format!(
            "service is {:?}: {}",
            state.health.state(),
            state.health.detail().await
        ),
    )
}

fn ok_json<T>(data: Arc<T>) -> Response
where
    T: Serialize + QueryOutput,
{
    match serde_json::to_value(&*data) {
        Ok(value) => Response::json(
            200,
            json!({ "status": "ok", "empty": data.is_empty_result(), "data": value }),
        ),
        Err(err) => {
            warn!(error = %err, "response serialization failed");
            error_json(500, "internal", "response serialization failed")
        }
    }
}

fn query_error(err: &QueryError) -> Response {
    let status = match err.kind() {
        ErrorKind::InvalidRequest => 400,
        ErrorKind::SnapshotUnavailable | ErrorKind::MalformedSnapshot => 503,
        ErrorKind::Internal => 500,
    };
    if status >= 500 {
        warn!(kind = err.kind().as_str(), error = %err, "query request failed");
    }
    error_json(status, err.kind().as_str(), err.to_string())
}

fn error_json(status: u16, kind: &str, message: impl Into<String>) -> Response {
    Response::json(
        status,
        json!({ "status": "error", "kind": kind, "message": message.into() }),
    )
}

fn http_status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(query: &str) -> Params {
        Request::parse(&format!("GET /api/x?{query} HTTP/1.1\r\nHost: localhost\r\n\r\n"))
            .expect("valid request")
            .params
    }

    fn idle_state() -> AppState {
        AppState::new(
            RuntimeHealth::new(),
            Arc::new(QueryMetrics::default()),
            Arc::new(OnceCell::new()),
        )
    }

    #[test]
    fn parses_request_line_and_decodes_query() {
        let request = Request::parse(
            "GET /api/departments/rollup?department=Nari%C3%B1o&threshold=0.7 HTTP/1.1\r\n\r\n",
        )
        .expect("valid request");
        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/api/departments/rollup");
        assert_eq!(request.params.get("department"), Some("Nariño"));
        assert_eq!(request.params.get("threshold"), Some("0.7"));

        assert!(Request::parse("").is_none());
        assert!(Request::parse("GET\r\n").is_none());
        assert!(Request::parse("GET http://elsewhere/ HTTP/1.1\r\n").is_none());
    }

    #[test]
    fn builds_filter_from_parameters() {
        let filter = params(
            "threshold=0.8&kind=department&policy_only=false&program=only\
             &conflict=Bajo,Medio&conflict=Alto&capacity=G1&poverty_max=40",
        )
        .filter()
        .expect("valid filter");
        assert_eq!(filter.threshold, 0.8);
        assert_eq!(filter.territory_kind, TerritoryKind::Department);
        assert!(!filter.policy_only);
        assert_eq!(filter.program, ProgramFilter::OnlyParticipating);
        assert_eq!(filter.conflict_categories.len(), 3);
        assert!(filter.capacity_groups.contains("G1"));
        assert_eq!(filter.poverty_range.min, 0.0);
        assert_eq!(filter.poverty_range.max, 40.0);
    }

    #[test]
    fn empty_parameters_keep_defaults() {
        let filter = params("department=&municipality=").filter().expect("defaults");
        assert_eq!(filter, FilterConfig::default());
    }

    #[test]
    fn malformed_parameters_are_invalid_requests() {
        for query in ["threshold=high", "kind=province", "policy_only=maybe", "page=two"] {
            let parsed = ApiCall::parse("/api/matches", &params(query))
                .expect("known route")
                .expect_err(query);
            assert_eq!(parsed.kind(), ErrorKind::InvalidRequest, "{query}");
        }
    }

    #[test]
    fn maps_api_paths_to_calls() {
        let call = ApiCall::parse("/api/recommendations/top", &params("limit=3"))
            .expect("known route")
            .expect("valid");
        assert_eq!(call, ApiCall::TopRecommendations(FilterConfig::default(), 3));

        let call = ApiCall::parse(
            "/api/matches",
            &params("territory=5001&recommendation=MCV1&page=2&page_size=10"),
        )
        .expect("known route")
        .expect("valid");
        assert_eq!(
            call,
            ApiCall::SentenceMatches(
                FilterConfig::default(),
                DetailScope::territory("5001").and_recommendation("MCV1"),
                PageRequest::new(2, 10),
            )
        );

        let call = ApiCall::parse("/api/recommendations/municipalities", &params("code=MCV4"))
            .expect("known route")
            .expect("valid");
        assert_eq!(
            call,
            ApiCall::RecommendationTerritories(
                FilterConfig::default(),
                "MCV4".to_string(),
                DEFAULT_TERRITORIES_PER_RECOMMENDATION,
            )
        );
        assert!(ApiCall::parse("/api/nope", &Params::default()).is_none());
    }

    #[test]
    fn error_kinds_map_to_statuses() {
        assert_eq!(query_error(&QueryError::invalid("bad")).status, 400);
        let unavailable = QueryError::SnapshotUnavailable {
            reference: "gdrive:x".to_string(),
            reason: "offline".to_string(),
        };
        let response = query_error(&unavailable);
        assert_eq!(response.status, 503);
        let body: serde_json::Value = serde_json::from_str(&response.body).expect("json body");
        assert_eq!(body["status"], "error");
        assert_eq!(body["kind"], "snapshot_unavailable");
    }

    #[tokio::test]
    async fn api_is_unavailable_until_the_snapshot_loads() {
        let state = idle_state();
        let live = route(&state, &Request::parse("GET /live HTTP/1.1\r\n").unwrap()).await;
        assert_eq!(live.status, 200);

        let ready = route(&state, &Request::parse("GET /ready HTTP/1.1\r\n").unwrap()).await;
        assert_eq!(ready.status, 503);

        let api = route(&state, &Request::parse("GET /api/summary HTTP/1.1\r\n").unwrap()).await;
        assert_eq!(api.status, 503);
        assert!(api.body.contains("not_ready"));

        let missing = route(&state, &Request::parse("GET /nowhere HTTP/1.1\r\n").unwrap()).await;
        assert_eq!(missing.status, 404);

        let wrong = route(&state, &Request::parse("DELETE /live HTTP/1.1\r\n").unwrap()).await;
        assert_eq!(wrong.status, 405);
    }

    #[tokio::test]
    async fn request_head_spans_multiple_reads() {
        let mut reader = AsyncReadExt::chain(
            &b"GET /api/departments/rollup?thres"[..],
            &b"hold=1.01 HTTP/1.1\r\nHost: localhost\r\n\r\n"[..],
        );
        let head = read_request_head(&mut reader).await.expect("read head");
        let RequestHead::Complete(raw) = head else {
            panic!("expected a complete head, got {head:?}");
        };
        let request = Request::parse(&raw).expect("valid request");
        assert_eq!(request.params.get("threshold"), Some("1.01"));
    }

    #[tokio::test]
    async fn oversized_or_cut_request_heads_are_not_parsed() {
        let long = format!(
            "GET /api/matches?territory={} HTTP/1.1\r\n\r\n",
            "5".repeat(MAX_REQUEST_BYTES)
        );
        let mut reader = long.as_bytes();
        assert_eq!(
            read_request_head(&mut reader).await.expect("read head"),
            RequestHead::TooLarge
        );

        let mut reader = &b"GET /api/summary?thr"[..];
        assert_eq!(
            read_request_head(&mut reader).await.expect("read head"),
            RequestHead::Truncated
        );

        let mut reader = &b"GET /live HTTP/1.1\r\n"[..];
        assert_eq!(
            read_request_head(&mut reader).await.expect("read head"),
            RequestHead::Complete("GET /live HTTP/1.1\r\n".to_string())
        );
    }
}
