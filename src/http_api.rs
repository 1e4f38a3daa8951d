//! Localhost-only dashboard API: read endpoints mirror `HistoryStore`
//! queries directly; write endpoints let a `run` invocation that isn't
//! colocated with the daemon post its own run/event/completion rows
//! through HTTP instead of a direct `HistoryStore` handle.
//!
//! Grounded on `web3infra-foundation-git-internal`'s `examples/http_server.rs`
//! (`Router`/`State`/`Path`/`Query` extractors, `IntoResponse` tuples for
//! error bodies) generalized from a git-smart-http server to a JSON CRUD
//! API over `crate::history::HistoryStore`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use crate::events::Event;
use crate::history::{GetEventsFilter, GraphSnapshot, HistoryStore, ListRunsFilter, Run, RunStatus};

#[derive(Clone)]
struct ApiState {
    history: Arc<HistoryStore>,
}

/// Error codes the dashboard and CLI-as-client callers can match on,
/// distinct from `crate::error::RpcErrorKind`'s daemon-RPC vocabulary.
#[derive(Debug, Clone, Copy)]
enum ApiErrorCode {
    MissingParam,
    InvalidJson,
    InvalidParam,
    NotFound,
    AlreadyExists,
    Internal,
}

impl ApiErrorCode {
    fn as_str(self) -> &'static str {
        match self {
            ApiErrorCode::MissingParam => "MISSING_PARAM",
            ApiErrorCode::InvalidJson => "INVALID_JSON",
            ApiErrorCode::InvalidParam => "INVALID_PARAM",
            ApiErrorCode::NotFound => "NOT_FOUND",
            ApiErrorCode::AlreadyExists => "ALREADY_EXISTS",
            ApiErrorCode::Internal => "INTERNAL",
        }
    }

    fn status(self) -> StatusCode {
        match self {
            ApiErrorCode::MissingParam | ApiErrorCode::InvalidJson | ApiErrorCode::InvalidParam => {
                StatusCode::BAD_REQUEST
            }
            ApiErrorCode::NotFound => StatusCode::NOT_FOUND,
            ApiErrorCode::AlreadyExists => StatusCode::CONFLICT,
            ApiErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

struct ApiError {
    code: ApiErrorCode,
    message: String,
}

impl ApiError {
    fn new(code: ApiErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({"error": self.message, "code": self.code.as_str()});
        (self.code.status(), Json(body)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::new(ApiErrorCode::Internal, e.to_string())
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Builds the router; the caller binds it to a `127.0.0.1` listener
/// (`crate::cli` does this for the `run`/daemon startup path).
pub fn router(history: Arc<HistoryStore>) -> Router {
    Router::new()
        .route("/api/history/runs", get(list_runs).post(create_run))
        .route("/api/history/runs/:id", get(get_run))
        .route("/api/history/runs/:id/events", get(get_events).post(post_event))
        .route("/api/history/runs/:id/graph", get(get_graph))
        .route("/api/runs", post(create_run))
        .route("/api/runs/:id/events", post(post_event))
        .route("/api/runs/:id/complete", post(complete_run))
        .with_state(ApiState { history })
}

/// Serves the dashboard API on `127.0.0.1:<port>` until `shutdown` fires.
pub async fn serve(history: Arc<HistoryStore>, port: u16, shutdown: tokio_util::sync::CancellationToken) -> anyhow::Result<()> {
    let app = router(history);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

fn parse_status(raw: &str) -> ApiResult<RunStatus> {
    match raw {
        "running" => Ok(RunStatus::Running),
        "completed" => Ok(RunStatus::Completed),
        "failed" => Ok(RunStatus::Failed),
        "stopped" => Ok(RunStatus::Stopped),
        other => Err(ApiError::new(ApiErrorCode::InvalidParam, format!("unknown status {other:?}"))),
    }
}

fn parse_u32(params: &HashMap<String, String>, key: &str, default: u32) -> ApiResult<u32> {
    match params.get(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| ApiError::new(ApiErrorCode::InvalidParam, format!("{key} must be a non-negative integer"))),
    }
}

async fn list_runs(State(state): State<ApiState>, Query(params): Query<HashMap<String, String>>) -> ApiResult<Json<Vec<Run>>> {
    let status = params.get("status").map(|s| parse_status(s)).transpose()?;
    let limit = parse_u32(&params, "limit", 20)?;
    let offset = parse_u32(&params, "offset", 0)?;
    let filter = ListRunsFilter {
        repo_path: params.get("repo").map(String::as_str),
        limit,
        offset,
        status,
    };
    let runs = state.history.list_runs(filter)?;
    Ok(Json(runs))
}

async fn get_run(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult<Json<Run>> {
    state
        .history
        .get_run(&id)?
        .map(Json)
        .ok_or_else(|| ApiError::new(ApiErrorCode::NotFound, format!("no run {id:?}")))
}

async fn get_events(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Json<serde_json::Value>> {
    let limit = parse_u32(&params, "limit", 100)?;
    let offset = parse_u32(&params, "offset", 0)?;
    let filter = GetEventsFilter {
        limit,
        offset,
        after_seq: 0,
        type_prefix: params.get("type").map(String::as_str),
        unit: params.get("unit").map(String::as_str),
    };
    let page = state.history.get_run_events(&id, filter)?;
    Ok(Json(json!({"events": page.events, "has_more": page.has_more})))
}

async fn get_graph(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult<Json<GraphSnapshot>> {
    state
        .history
        .get_graph(&id)?
        .map(Json)
        .ok_or_else(|| ApiError::new(ApiErrorCode::NotFound, format!("no graph for run {id:?}")))
}

async fn create_run(State(state): State<ApiState>, body: axum::body::Bytes) -> ApiResult<impl IntoResponse> {
    let run: Run = serde_json::from_slice(&body).map_err(|e| ApiError::new(ApiErrorCode::InvalidJson, e.to_string()))?;
    if state.history.get_run(&run.id)?.is_some() {
        return Err(ApiError::new(ApiErrorCode::AlreadyExists, format!("run {:?} already exists", run.id)));
    }
    state.history.create_run(&run)?;
    Ok((StatusCode::CREATED, Json(run)))
}

#[derive(Deserialize)]
struct PostEventBody {
    #[serde(flatten)]
    event: Event,
}

async fn post_event(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    body: axum::body::Bytes,
) -> ApiResult<impl IntoResponse> {
    let PostEventBody { mut event } = serde_json::from_slice(&body).map_err(|e| ApiError::new(ApiErrorCode::InvalidJson, e.to_string()))?;
    if event.run_id.is_empty() {
        event.run_id = id.clone();
    } else if event.run_id != id {
        return Err(ApiError::new(ApiErrorCode::InvalidParam, "event run_id does not match path"));
    }
    let stored = state.history.insert_event(event)?;
    Ok((StatusCode::CREATED, Json(stored)))
}

#[derive(Deserialize)]
struct CompleteRunBody {
    status: String,
    error: Option<String>,
}

async fn complete_run(State(state): State<ApiState>, Path(id): Path<String>, body: axum::body::Bytes) -> ApiResult<impl IntoResponse> {
    let payload: CompleteRunBody =
        serde_json::from_slice(&body).map_err(|e| ApiError::new(ApiErrorCode::InvalidJson, e.to_string()))?;
    let status = parse_status(&payload.status)?;
    if state.history.get_run(&id)?.is_none() {
        return Err(ApiError::new(ApiErrorCode::NotFound, format!("no run {id:?}")));
    }
    state.history.complete_run(&id, status, payload.error.as_deref())?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;

    fn sample_run(id: &str) -> Run {
        Run {
            id: id.to_string(),
            repo_path: "/repo".into(),
            started_at: chrono::Utc::now(),
            completed_at: None,
            status: RunStatus::Running,
            parallelism: 4,
            total_units: 2,
            completed_units: 0,
            failed_units: 0,
            blocked_units: 0,
            error: None,
            tasks_dir: "tasks".into(),
            dry_run: false,
        }
    }

    #[tokio::test]
    async fn get_run_returns_not_found_for_unknown_id() {
        let history = Arc::new(HistoryStore::open_in_memory().unwrap());
        let app = router(history);
        let response = app
            .oneshot(Request::builder().uri("/api/history/runs/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn list_runs_rejects_unknown_status() {
        let history = Arc::new(HistoryStore::open_in_memory().unwrap());
        let app = router(history);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/history/runs?status=bogus")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn create_run_then_get_round_trips() {
        let history = Arc::new(HistoryStore::open_in_memory().unwrap());
        let app = router(history);
        let run = sample_run("run_1");
        let body = serde_json::to_vec(&run).unwrap();
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/runs")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .oneshot(Request::builder().uri("/api/history/runs/run_1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn create_run_twice_reports_already_exists() {
        let history = Arc::new(HistoryStore::open_in_memory().unwrap());
        history.create_run(&sample_run("run_1")).unwrap();
        let app = router(history);
        let body = serde_json::to_vec(&sample_run("run_1")).unwrap();
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/runs")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn complete_run_rejects_malformed_json() {
        let history = Arc::new(HistoryStore::open_in_memory().unwrap());
        history.create_run(&sample_run("run_1")).unwrap();
        let app = router(history);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/runs/run_1/complete")
                    .header("content-type", "application/json")
                    .body(Body::from("not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
