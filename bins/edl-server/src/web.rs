//! HTTP dataset surface.
//!
//! Entity streams are written incrementally: the `@context` element first,
//! then one chunk per entity, then the `@continuation` element for cursored
//! reads. Each request resolves its dataset against the registry snapshot
//! in force when it arrived and keeps that snapshot for its lifetime.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::extract::{MatchedPath, Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use edl_core::entity::{Continuation, Entity, NamespaceContext};
use edl_core::error::LayerError;
use edl_core::registry::Registry;
use edl_pg::read::{changes, ChangesRequest};
use edl_pg::{PoolManager, WritePipeline};

const STREAM_CHUNK_CAPACITY: usize = 16;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub pools: Arc<PoolManager>,
    pub service_name: String,
    pub authorization: String,
    pub metrics: PrometheusHandle,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .route("/datasets", get(list_datasets))
        .route(
            "/datasets/:dataset/entities",
            get(get_entities).post(post_entities),
        )
        .route(
            "/datasets/:dataset/changes",
            get(get_changes).post(post_entities),
        )
        .layer(middleware::from_fn_with_state(state.clone(), authorize))
        .layer(middleware::from_fn_with_state(state.clone(), track))
        .with_state(state)
}

/// Error shape on the HTTP boundary: a status, a short message, and a
/// machine-readable code for refusals a client must tell apart from
/// ordinary bad requests.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    code: Option<&'static str>,
}

impl ApiError {
    fn not_found(dataset: &str) -> Self {
        ApiError {
            status: StatusCode::NOT_FOUND,
            message: format!("dataset {dataset} not found"),
            code: None,
        }
    }

    fn bad_request(message: String) -> Self {
        ApiError {
            status: StatusCode::BAD_REQUEST,
            message,
            code: None,
        }
    }

    fn internal(message: String) -> Self {
        ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message,
            code: None,
        }
    }
}

impl From<LayerError> for ApiError {
    fn from(err: LayerError) -> Self {
        let (status, code) = match &err {
            LayerError::NotSupported(_) => (StatusCode::BAD_REQUEST, Some("not_supported")),
            LayerError::BadParameter(_) => (StatusCode::BAD_REQUEST, None),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, None),
        };
        ApiError {
            status,
            message: err.to_string(),
            code,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = serde_json::json!({"error": self.message});
        if let Some(code) = self.code {
            body["code"] = serde_json::Value::String(code.to_string());
        }
        (self.status, Json(body)).into_response()
    }
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn render_metrics(State(state): State<AppState>) -> String {
    state.metrics.render()
}

#[derive(Debug, Serialize)]
struct DatasetName {
    name: String,
    #[serde(rename = "type")]
    types: Vec<String>,
}

async fn list_datasets(State(state): State<AppState>) -> Json<Vec<DatasetName>> {
    let names = state
        .registry
        .list()
        .into_iter()
        .map(|name| DatasetName {
            name,
            types: vec!["GET".to_string(), "POST".to_string()],
        })
        .collect();
    Json(names)
}

#[derive(Debug, Default, Deserialize)]
struct ChangeParams {
    since: Option<String>,
    limit: Option<i64>,
    #[serde(rename = "latestOnly")]
    latest_only: Option<bool>,
}

async fn get_changes(
    State(state): State<AppState>,
    Path(dataset): Path<String>,
    Query(params): Query<ChangeParams>,
) -> Result<Response, ApiError> {
    stream_dataset(state, dataset, params, true).await
}

async fn get_entities(
    State(state): State<AppState>,
    Path(dataset): Path<String>,
    Query(params): Query<ChangeParams>,
) -> Result<Response, ApiError> {
    // served by the change-set read; no continuation on this endpoint
    let params = ChangeParams {
        since: None,
        ..params
    };
    stream_dataset(state, dataset, params, false).await
}

async fn stream_dataset(
    state: AppState,
    dataset: String,
    params: ChangeParams,
    with_token: bool,
) -> Result<Response, ApiError> {
    let snapshot = state.registry.snapshot();
    let definition = snapshot
        .lookup(&dataset)
        .ok_or_else(|| ApiError::not_found(&dataset))?;
    let pool = state.pools.get(&snapshot, &definition).await?;

    let request = ChangesRequest {
        since: params.since,
        limit: params.limit.unwrap_or(0),
        latest_only: params.latest_only.unwrap_or(false),
    };
    let cancel = CancellationToken::new();
    let mut iter = changes(&pool, definition.clone(), request, cancel).await?;
    let base_uri = definition.base_uri(&snapshot.config.base_name_space);

    let (tx, rx) = mpsc::channel::<Result<Bytes, Infallible>>(STREAM_CHUNK_CAPACITY);
    tokio::spawn(async move {
        let context = NamespaceContext::for_dataset(&base_uri);
        let mut head = vec![b'['];
        match serde_json::to_vec(&context) {
            Ok(bytes) => head.extend(bytes),
            Err(_) => return,
        }
        if tx.send(Ok(head.into())).await.is_err() {
            return;
        }

        loop {
            match iter.next().await {
                Ok(Some(entity)) => {
                    let mut chunk = vec![b','];
                    match serde_json::to_vec(&entity) {
                        Ok(bytes) => chunk.extend(bytes),
                        Err(e) => {
                            warn!(error = %e, "failed to serialize entity");
                            return;
                        }
                    }
                    if tx.send(Ok(chunk.into())).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    // headers are gone; a truncated array signals the failure
                    warn!(error = %e, "failed to stream entities");
                    return;
                }
            }
        }

        let mut tail = Vec::new();
        if with_token {
            if let Some(token) = iter.token() {
                let continuation = Continuation::new(token.to_string());
                if let Ok(bytes) = serde_json::to_vec(&continuation) {
                    tail.push(b',');
                    tail.extend(bytes);
                }
            }
        }
        tail.push(b']');
        let _ = tx.send(Ok(tail.into())).await;
    });

    let body = Body::from_stream(ReceiverStream::new(rx));
    Ok((
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response())
}

async fn post_entities(
    State(state): State<AppState>,
    Path(dataset): Path<String>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let snapshot = state.registry.snapshot();
    let definition = snapshot
        .lookup(&dataset)
        .ok_or_else(|| ApiError::not_found(&dataset))?;
    let pool = state.pools.get(&snapshot, &definition).await?;

    let elements: Vec<serde_json::Value> = serde_json::from_slice(&body)
        .map_err(|e| ApiError::bad_request(format!("could not parse entity stream: {e}")))?;

    let pipeline = WritePipeline::new(pool, &definition)?;
    let stop = CancellationToken::new();
    // an aborted request abandons the in-flight batch instead of flushing it
    let _stop_guard = stop.clone().drop_guard();
    let capacity = definition.source_config.flush_threshold.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    let consumer = tokio::spawn(pipeline.run(rx, stop.clone()));

    let mut producer_err = None;
    for element in elements {
        if stop.is_cancelled() {
            break;
        }
        let id = element.get("id").and_then(|v| v.as_str()).unwrap_or_default();
        if id == "@context" || id == "@continuation" {
            continue;
        }
        match serde_json::from_value::<Entity>(element) {
            Ok(entity) => {
                let sent = tokio::select! {
                    _ = stop.cancelled() => break,
                    sent = tx.send(entity) => sent,
                };
                if sent.is_err() {
                    break;
                }
            }
            Err(e) => {
                producer_err = Some(ApiError::bad_request(format!("malformed entity: {e}")));
                stop.cancel();
                break;
            }
        }
    }
    drop(tx);

    let outcome = consumer
        .await
        .map_err(|e| ApiError::internal(format!("write pipeline failed: {e}")))?;
    if let Some(err) = producer_err {
        return Err(err);
    }
    outcome?;
    Ok(StatusCode::OK)
}

/// Bearer gate for dataset routes. Claim verification is delegated to the
/// auth collaborator; `noop` bypasses entirely.
async fn authorize(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let path = req.uri().path();
    if state.authorization == "noop" || path == "/health" || path == "/metrics" {
        return next.run(req).await;
    }
    let has_bearer = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("Bearer "))
        .unwrap_or(false);
    if !has_bearer {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": "missing bearer token"})),
        )
            .into_response();
    }
    next.run(req).await
}

/// Request log and metrics with {application, method, url, status} tags.
async fn track(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let method = req.method().to_string();
    let url = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());

    let start = Instant::now();
    let response = next.run(req).await;
    let status = response.status().as_u16().to_string();
    let elapsed = start.elapsed();

    info!(
        application = %state.service_name,
        %method,
        %url,
        %status,
        elapsed_ms = elapsed.as_millis() as u64,
        "request"
    );
    metrics::increment_counter!(
        "http_requests_total",
        "application" => state.service_name.clone(),
        "method" => method.clone(),
        "url" => url.clone(),
        "status" => status.clone()
    );
    metrics::histogram!(
        "http_request_duration_seconds",
        elapsed.as_secs_f64(),
        "application" => state.service_name,
        "method" => method,
        "url" => url,
        "status" => status
    );
    response
}
