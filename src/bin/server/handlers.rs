//! HTTP handlers for the Historical Datastore server
//!
//! Thin translation layer: request decoding on one side, the registry,
//! ingestion facade and aggregation index on the other. Every failure
//! serializes as one `{code, message}` JSON body.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{Path, Query as UrlQuery, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use hds::aggregation::{Aggregation, InfluxAggr};
use hds::config::Config;
use hds::data::{Ingester, Query, RecordSet, Sort};
use hds::metrics;
use hds::registry::{FilterOp, Registry, MAX_PER_PAGE};
use hds::senml::Record;
use hds::types::{Stream, ID_SEPARATOR};

// =============================================================================
// Application State
// =============================================================================

/// Shared application state
pub struct AppState {
    /// Stream registry
    pub registry: Arc<dyn Registry>,
    /// Ingestion and query facade
    pub ingester: Ingester,
    /// Aggregation index
    pub aggr: Arc<InfluxAggr>,
    /// Process configuration
    pub config: Config,
}

/// Error envelope returned on every failure
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// HTTP status code
    pub code: u16,
    /// Human-readable message
    pub message: String,
}

/// Wrapper turning [`hds::Error`] into an HTTP response
pub struct ApiError(hds::Error);

impl From<hds::Error> for ApiError {
    fn from(e: hds::Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.0.status();
        let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(ErrorBody { code, message: self.0.to_string() })).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// =============================================================================
// Generic handlers
// =============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Health check endpoint
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy", version: env!("CARGO_PKG_VERSION") })
}

/// API index
pub async fn index() -> Json<BTreeMap<&'static str, &'static str>> {
    let mut endpoints = BTreeMap::new();
    endpoints.insert("registry", "/registry");
    endpoints.insert("data", "/data/{id}");
    endpoints.insert("aggregation", "/aggr");
    endpoints.insert("health", "/health");
    endpoints.insert("metrics", "/metrics");
    Json(endpoints)
}

/// Prometheus metrics in text format
pub async fn prom_metrics() -> ([(header::HeaderName, &'static str); 1], String) {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather(),
    )
}

// =============================================================================
// Registry handlers
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct PagingParams {
    page: Option<usize>,
    per_page: Option<usize>,
}

impl PagingParams {
    fn page(&self) -> usize {
        self.page.unwrap_or(1)
    }
    fn per_page(&self) -> usize {
        self.per_page.unwrap_or(MAX_PER_PAGE)
    }
}

#[derive(Serialize)]
pub struct StreamList {
    url: String,
    streams: Vec<Stream>,
    page: usize,
    per_page: usize,
    total: usize,
}

/// `GET /registry`
pub async fn registry_index(
    State(state): State<Arc<AppState>>,
    UrlQuery(paging): UrlQuery<PagingParams>,
) -> ApiResult<Json<StreamList>> {
    let (streams, total) = state
        .registry
        .get_many(paging.page(), paging.per_page())
        .await?;
    Ok(Json(StreamList {
        url: state.config.public_url("/registry"),
        streams,
        page: paging.page(),
        per_page: paging.per_page(),
        total,
    }))
}

/// `POST /registry`
pub async fn registry_create(
    State(state): State<Arc<AppState>>,
    Json(stream): Json<Stream>,
) -> ApiResult<(StatusCode, Json<Stream>)> {
    let result = state.registry.create(stream).await;
    metrics::REGISTRY_MUTATIONS
        .with_label_values(&["create", if result.is_ok() { "ok" } else { "error" }])
        .inc();
    Ok((StatusCode::CREATED, Json(result?)))
}

/// `GET /registry/{id}`
pub async fn registry_get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Stream>> {
    Ok(Json(state.registry.get(&id).await?))
}

/// `PUT /registry/{id}`
pub async fn registry_update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(stream): Json<Stream>,
) -> ApiResult<Json<Stream>> {
    let result = state.registry.update(&id, stream).await;
    metrics::REGISTRY_MUTATIONS
        .with_label_values(&["update", if result.is_ok() { "ok" } else { "error" }])
        .inc();
    Ok(Json(result?))
}

/// `DELETE /registry/{id}`
pub async fn registry_delete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let result = state.registry.delete(&id).await;
    metrics::REGISTRY_MUTATIONS
        .with_label_values(&["delete", if result.is_ok() { "ok" } else { "error" }])
        .inc();
    result?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /registry/{type}/{path}/{op}/{value}`
pub async fn registry_filter(
    State(state): State<Arc<AppState>>,
    Path((fetch, path, op, value)): Path<(String, String, String, String)>,
    UrlQuery(paging): UrlQuery<PagingParams>,
) -> ApiResult<Response> {
    let op = FilterOp::parse(&op)?;
    match fetch.as_str() {
        "one" => {
            let (matched, _) = state.registry.filter(&path, op, &value, 1, 1).await?;
            let stream = matched.into_iter().next().ok_or_else(|| {
                hds::Error::NotFound("no stream matches the filter".to_string())
            })?;
            Ok(Json(stream).into_response())
        }
        "many" => {
            let (streams, total) = state
                .registry
                .filter(&path, op, &value, paging.page(), paging.per_page())
                .await?;
            Ok(Json(StreamList {
                url: state.config.public_url("/registry"),
                streams,
                page: paging.page(),
                per_page: paging.per_page(),
                total,
            })
            .into_response())
        }
        other => Err(hds::Error::BadRequest(format!(
            "fetch type must be one or many, got {other}"
        ))
        .into()),
    }
}

// =============================================================================
// Data handlers
// =============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct DataParams {
    start: Option<String>,
    end: Option<String>,
    sort: Option<String>,
    limit: Option<i64>,
    page: Option<usize>,
    per_page: Option<usize>,
}

impl DataParams {
    fn is_empty(&self) -> bool {
        self.start.is_none()
            && self.end.is_none()
            && self.sort.is_none()
            && self.limit.is_none()
            && self.page.is_none()
            && self.per_page.is_none()
    }

    /// Erroneous or missing times fall back to the zero value, making the
    /// query open-ended
    fn to_query(&self) -> Query {
        let parse = |s: &Option<String>| {
            s.as_deref()
                .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_default()
        };
        Query {
            start: parse(&self.start),
            end: parse(&self.end),
            sort: self.sort.as_deref().map(Sort::parse).unwrap_or_default(),
            limit: self.limit.unwrap_or(-1),
        }
    }
}

fn split_ids(raw: &str) -> Vec<String> {
    raw.split(ID_SEPARATOR)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn content_type(headers: &HeaderMap) -> String {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// `POST /data/{id}` with one or many comma-separated ids
pub async fn data_submit(
    State(state): State<Arc<AppState>>,
    Path(ids): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let ids = split_ids(&ids);
    state
        .ingester
        .submit(&content_type(&headers), &body, Some(&ids))
        .await?;
    Ok(StatusCode::ACCEPTED)
}

/// `POST /data` resolving streams by record name only
pub async fn data_submit_unaddressed(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<StatusCode> {
    state
        .ingester
        .submit(&content_type(&headers), &body, None)
        .await?;
    Ok(StatusCode::ACCEPTED)
}

/// `GET /data/{id}` with `?start&end&sort&limit&page&per_page`. Without
/// parameters, returns the last value of each addressed stream.
pub async fn data_query(
    State(state): State<Arc<AppState>>,
    Path(ids): Path<String>,
    UrlQuery(params): UrlQuery<DataParams>,
) -> ApiResult<Json<RecordSet>> {
    let started = Instant::now();
    let ids = split_ids(&ids);
    let page = params.page.unwrap_or(1);
    let per_page = params.per_page.unwrap_or(MAX_PER_PAGE);

    let (data, total): (Vec<Record>, usize) = if params.is_empty() {
        let last = state.ingester.get_last(&ids).await?;
        let total = last.len();
        (last, total)
    } else {
        state
            .ingester
            .query(&ids, params.to_query(), page, per_page)
            .await?
    };

    Ok(Json(RecordSet {
        url: state.config.public_url(&format!("/data/{}", ids.join(","))),
        data,
        time: started.elapsed().as_secs_f64() * 1e3,
        page,
        per_page,
        total,
    }))
}

// =============================================================================
// Aggregation handlers
// =============================================================================

#[derive(Serialize)]
pub struct AggregationList {
    url: String,
    aggregations: Vec<Aggregation>,
    page: usize,
    per_page: usize,
    total: usize,
}

/// `GET /aggr`
pub async fn aggr_index(
    State(state): State<Arc<AppState>>,
    UrlQuery(paging): UrlQuery<PagingParams>,
) -> ApiResult<Json<AggregationList>> {
    let (aggregations, total) = state.aggr.index(paging.page(), paging.per_page())?;
    Ok(Json(AggregationList {
        url: state.config.public_url("/aggr"),
        aggregations,
        page: paging.page(),
        per_page: paging.per_page(),
        total,
    }))
}

/// `GET /aggr/{path}/{op}/{value}`
pub async fn aggr_filter(
    State(state): State<Arc<AppState>>,
    Path((path, op, value)): Path<(String, String, String)>,
    UrlQuery(paging): UrlQuery<PagingParams>,
) -> ApiResult<Json<AggregationList>> {
    let op = FilterOp::parse(&op)?;
    let (aggregations, total) = state
        .aggr
        .filter(&path, op, &value, paging.page(), paging.per_page())?;
    Ok(Json(AggregationList {
        url: state.config.public_url("/aggr"),
        aggregations,
        page: paging.page(),
        per_page: paging.per_page(),
        total,
    }))
}

#[derive(Serialize)]
pub struct AggregationTarget {
    aggregation: Aggregation,
    stream: Stream,
    measurement: String,
}

/// `GET /aggr/{aggrid}/{uuid}`: the aggregation artifacts of one stream
pub async fn aggr_get(
    State(state): State<Arc<AppState>>,
    Path((aggr_id, stream_id)): Path<(String, String)>,
) -> ApiResult<Json<AggregationTarget>> {
    let aggregation = state.aggr.get(&aggr_id)?;
    let stream = state.registry.get(&stream_id).await?;
    let measurement = hds::aggregation::measurement_name(&aggregation.id, &stream.id);
    Ok(Json(AggregationTarget { aggregation, stream, measurement }))
}
