use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use ctxforge_core::error::CtxError;
use ctxforge_core::graph::Graph;
use ctxforge_core::types::{ComparisonId, SessionId};
use ctxforge_engine::{order_graph, RunLogger};

use crate::connection;
use crate::state::AppState;

/// Engine errors mapped onto HTTP statuses.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(what: &str, id: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: format!("{} not found: {}", what, id),
        }
    }

    fn conflict(id: &str) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: format!("run id already in use: {}", id),
        }
    }
}

impl From<CtxError> for ApiError {
    fn from(e: CtxError) -> Self {
        let status = match &e {
            CtxError::CycleDetected { .. } | CtxError::InvalidGraph(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            CtxError::GraphNotFound(_) => StatusCode::NOT_FOUND,
            CtxError::TooManyComparisons { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

// GET /api/health
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulateBody {
    /// Inline graph; takes precedence over `graph_id`.
    #[serde(default)]
    pub graph: Option<Graph>,
    #[serde(default, alias = "graph_id")]
    pub graph_id: Option<String>,
    #[serde(default)]
    pub input: Value,
    #[serde(default, alias = "session_id")]
    pub session_id: Option<String>,
    /// Answer with the terminal session instead of 202.
    #[serde(default)]
    pub wait: bool,
}

// POST /api/simulate
pub async fn simulate(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SimulateBody>,
) -> Result<Response, ApiError> {
    let graph = match (body.graph, body.graph_id) {
        (Some(graph), _) => graph,
        (None, Some(id)) => state.graphs.resolve_graph(&id).await?,
        (None, None) => {
            return Err(CtxError::InvalidGraph("either graph or graphId is required".into()).into())
        }
    };
    // Structural errors are answered here, before anything runs
    order_graph(&graph)?;

    let session_id = body
        .session_id
        .map(|s| SessionId::from_string(&s))
        .unwrap_or_default();
    let claim = state
        .claim_run(&session_id.0)
        .await
        .ok_or_else(|| ApiError::conflict(&session_id.0))?;
    let cancel = state.shutdown.child_token();
    start_run_log(&state, &session_id.0);
    info!(session_id = %session_id, graph_id = graph.id.as_deref().unwrap_or("-"), "Simulation requested");

    if body.wait {
        let session = state
            .runner
            .run_with(&graph, body.input, session_id, cancel)
            .await?;
        drop(claim);
        return Ok(Json(session).into_response());
    }

    let runner = state.runner.clone();
    let sid = session_id.clone();
    let input = body.input;
    tokio::spawn(async move {
        let _claim = claim;
        if let Err(e) = runner.run_with(&graph, input, sid.clone(), cancel).await {
            warn!(session_id = %sid, error = %e, "Background simulation rejected");
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "sessionId": session_id,
            "channel": format!("/ws/{}", session_id),
        })),
    )
        .into_response())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompareBody {
    #[serde(alias = "graph_ids")]
    pub graph_ids: Vec<String>,
    #[serde(default)]
    pub input: Value,
    #[serde(default, alias = "comparison_id")]
    pub comparison_id: Option<String>,
    #[serde(default)]
    pub wait: bool,
}

// POST /api/compare
pub async fn compare(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CompareBody>,
) -> Result<Response, ApiError> {
    let limit = state.comparisons.limit();
    if body.graph_ids.len() > limit {
        return Err(CtxError::TooManyComparisons {
            requested: body.graph_ids.len(),
            limit,
        }
        .into());
    }
    if body.graph_ids.is_empty() {
        return Err(CtxError::InvalidGraph("graphIds must not be empty".into()).into());
    }

    let comparison_id = body
        .comparison_id
        .map(|s| ComparisonId::from_string(&s))
        .unwrap_or_default();
    let claim = state
        .claim_run(&comparison_id.0)
        .await
        .ok_or_else(|| ApiError::conflict(&comparison_id.0))?;
    let cancel = state.shutdown.child_token();
    start_run_log(&state, &comparison_id.0);
    info!(comparison_id = %comparison_id, graphs = body.graph_ids.len(), "Comparison requested");

    if body.wait {
        let run = state
            .comparisons
            .compare_with(&body.graph_ids, body.input, comparison_id, cancel)
            .await?;
        drop(claim);
        return Ok(Json(run).into_response());
    }

    let comparisons = state.comparisons.clone();
    let cid = comparison_id.clone();
    let graph_ids = body.graph_ids;
    let input = body.input;
    tokio::spawn(async move {
        let _claim = claim;
        if let Err(e) = comparisons.compare_with(&graph_ids, input, cid.clone(), cancel).await {
            warn!(comparison_id = %cid, error = %e, "Background comparison rejected");
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "comparisonId": comparison_id,
            "channel": format!("/ws/{}", comparison_id),
        })),
    )
        .into_response())
}

// GET /api/sessions/{id}
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    match state.store.load_session(&id).await? {
        Some(session) => Ok(Json(session).into_response()),
        None => Err(ApiError::not_found("session", &id)),
    }
}

// GET /api/comparisons/{id}
pub async fn get_comparison(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    match state.store.load_comparison(&id).await? {
        Some(run) => Ok(Json(run).into_response()),
        None => Err(ApiError::not_found("comparison", &id)),
    }
}

// GET /ws/{channel}
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(channel): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, channel, state))
}

async fn handle_ws(socket: WebSocket, channel: String, state: Arc<AppState>) {
    info!(channel = %channel, "WebSocket client connected");
    connection::handle_channel(socket, channel.clone(), state).await;
    debug!(channel = %channel, "WebSocket client disconnected");
}

/// Follow `channel` into the JSONL run log, when one is configured.
fn start_run_log(state: &AppState, channel: &str) {
    let Some((dir, level)) = &state.run_log else {
        return;
    };
    let rx = state.event_bus.subscribe_channel(channel);
    let logger = RunLogger::new(dir.clone(), *level);
    tokio::spawn(logger.run(rx, channel.to_string(), state.shutdown.child_token()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use ctxforge_core::event::EventBus;
    use ctxforge_core::config::GatewayConfig;
    use ctxforge_engine::{ComparisonCoordinator, RuntimeContext, SessionRunner};
    use ctxforge_memory::{MemoryRunStore, StaticGraphs};
    use ctxforge_test_utils::{cyclic, linear_chain};
    use tokio_util::sync::CancellationToken;

    fn app() -> axum::Router {
        let bus = Arc::new(EventBus::default());
        let store = Arc::new(MemoryRunStore::new());
        let graphs = Arc::new(StaticGraphs::new().with("chain", linear_chain("chain")));
        let runner = Arc::new(
            SessionRunner::new(RuntimeContext::mock(Some(5)), bus.clone()).with_store(store.clone()),
        );
        let comparisons =
            Arc::new(ComparisonCoordinator::new(runner.clone(), graphs.clone()).with_limit(2));
        crate::router(Arc::new(AppState {
            config: GatewayConfig::default(),
            runner,
            comparisons,
            event_bus: bus,
            graphs,
            store,
            run_log: None,
            shutdown: CancellationToken::new(),
            active_runs: Default::default(),
        }))
    }

    async fn call(app: axum::Router, method: &str, uri: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(if body.is_null() {
                Body::empty()
            } else {
                Body::from(body.to_string())
            })
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = call(app(), "GET", "/api/health", Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_simulate_and_fetch() {
        let app = app();
        let (status, body) = call(
            app.clone(),
            "POST",
            "/api/simulate",
            json!({"graphId": "chain", "input": "hello", "sessionId": "s-1", "wait": true}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "completed");
        assert_eq!(body["steps"].as_array().unwrap().len(), 3);

        let (status, body) = call(app, "GET", "/api/sessions/s-1", Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sessionId"], "s-1");
    }

    #[tokio::test]
    async fn test_simulate_rejects_cycle() {
        let graph = serde_json::to_value(cyclic("loop")).unwrap();
        let (status, body) = call(
            app(),
            "POST",
            "/api/simulate",
            json!({"graph": graph, "input": "x"}),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["error"].as_str().unwrap().contains("cycle"));
    }

    #[tokio::test]
    async fn test_simulate_accepts_in_background() {
        let (status, body) = call(
            app(),
            "POST",
            "/api/simulate",
            json!({"graphId": "chain", "input": "x", "sessionId": "bg"}),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["channel"], "/ws/bg");
    }

    #[tokio::test]
    async fn test_compare_limit_and_unknown_ids() {
        let (status, _) = call(
            app(),
            "POST",
            "/api/compare",
            json!({"graphIds": ["a", "b", "c"], "input": "x"}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(
            app(),
            "POST",
            "/api/compare",
            json!({"graphIds": ["chain", "ghost"], "input": "x", "wait": true}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["summary"]["graphCount"], 2);
        assert_eq!(body["summary"]["succeededCount"], 1);
    }

    #[tokio::test]
    async fn test_reused_run_id_conflicts() {
        let app = app();
        let (status, _) = call(
            app.clone(),
            "POST",
            "/api/simulate",
            json!({"graphId": "chain", "input": "x", "sessionId": "dup", "wait": true}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(
            app.clone(),
            "POST",
            "/api/simulate",
            json!({"graphId": "chain", "input": "y", "sessionId": "dup", "wait": true}),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("dup"));

        // Session and comparison ids share one channel namespace
        let (status, _) = call(
            app,
            "POST",
            "/api/compare",
            json!({"graphIds": ["chain"], "input": "x", "comparisonId": "dup", "wait": true}),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_in_flight_run_id_conflicts() {
        let bus = Arc::new(EventBus::default());
        let store = Arc::new(MemoryRunStore::new());
        let graphs = Arc::new(StaticGraphs::new());
        let runner = Arc::new(SessionRunner::new(RuntimeContext::mock(Some(5)), bus.clone()));
        let comparisons = Arc::new(ComparisonCoordinator::new(runner.clone(), graphs.clone()));
        let state = Arc::new(AppState {
            config: GatewayConfig::default(),
            runner,
            comparisons,
            event_bus: bus,
            graphs,
            store,
            run_log: None,
            shutdown: CancellationToken::new(),
            active_runs: Default::default(),
        });

        let claim = state.claim_run("live").await;
        assert!(claim.is_some());
        assert!(state.claim_run("live").await.is_none());
        drop(claim);
        assert!(state.claim_run("live").await.is_some());
    }

    #[tokio::test]
    async fn test_missing_session_is_404() {
        let (status, _) = call(app(), "GET", "/api/sessions/nope", Value::Null).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(app(), "GET", "/api/comparisons/nope", Value::Null).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
