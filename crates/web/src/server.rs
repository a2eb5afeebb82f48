//! HTTP API
//!
//! Public: /health, /healthz, /metrics. Everything under /api/v1 requires
//! `Authorization: Bearer <token>`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, Path, Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use meshsync_common::{
    AclPolicy, ApplyOptions, AuthError, AuthKeyRequest, ControlPlaneError, DesiredState,
    LoadError, Route, StoreError, User, ValidationError, ValidationReport, SERVICE_NAME, VERSION,
};
use meshsync_engine::{
    validate, validate_policy, ApplyError, AuthKeyIssuer, ControlPlane, DesiredStateStore,
    DriftDetector, DriftError, MetricsSink, Reconciler,
};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

/// Paths served without a bearer token
const PUBLIC_PATHS: &[&str] = &["/health", "/healthz", "/metrics"];

// ============================================================================
// State
// ============================================================================

/// Shared state handed to every handler
pub struct AppState {
    pub store: DesiredStateStore,
    pub control_plane: Arc<dyn ControlPlane>,
    pub reconciler: Reconciler,
    pub drift: DriftDetector,
    pub keys: AuthKeyIssuer,
    pub metrics: Arc<dyn MetricsSink>,
    api_token: String,
    started: Instant,
}

impl AppState {
    pub fn new(
        store: DesiredStateStore,
        control_plane: Arc<dyn ControlPlane>,
        metrics: Arc<dyn MetricsSink>,
        api_token: impl Into<String>,
    ) -> Self {
        Self {
            reconciler: Reconciler::new(control_plane.clone(), metrics.clone()),
            drift: DriftDetector::new(control_plane.clone(), metrics.clone()),
            keys: AuthKeyIssuer::new(control_plane.clone()),
            store,
            control_plane,
            metrics,
            api_token: api_token.into(),
            started: Instant::now(),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Handler error, rendered as `{"error": message}`
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Unauthorized(#[from] AuthError),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("{}", self);
        } else {
            debug!("{}: {}", status, self);
        }
        (status, Json(json!({"error": self.to_string()}))).into_response()
    }
}

impl From<LoadError> for ApiError {
    fn from(e: LoadError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { .. } => ApiError::NotFound(e.to_string()),
            _ => ApiError::Internal(e.to_string()),
        }
    }
}

/// 404 is reserved for the desired-state store; any control-plane failure,
/// including an entity Headscale does not know, is a 500.
impl From<ControlPlaneError> for ApiError {
    fn from(e: ControlPlaneError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl From<ApplyError> for ApiError {
    fn from(e: ApplyError) -> Self {
        match e {
            ApplyError::InProgress => ApiError::Conflict(e.to_string()),
            ApplyError::Load(e) => e.into(),
        }
    }
}

impl From<DriftError> for ApiError {
    fn from(e: DriftError) -> Self {
        match e {
            DriftError::Load(e) => e.into(),
            DriftError::ControlPlane(e) => e.into(),
        }
    }
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        ApiError::BadRequest(e.body_text())
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ============================================================================
// Router
// ============================================================================

/// Build the API router
pub fn router(state: Arc<AppState>) -> Router {
    let auth_state = state.clone();
    let auth_layer = middleware::from_fn(move |req, next| {
        let state = auth_state.clone();
        async move { auth_middleware_inner(state, req, next).await }
    });

    let api = Router::new()
        // Reconciliation
        .route("/apply", post(apply_handler))
        .route("/drift", get(drift_handler))
        .route("/validate", get(validate_handler))
        // Pre-auth keys
        .route("/keys", get(list_keys_handler).post(create_key_handler))
        .route("/keys/:key", delete(revoke_key_handler))
        // Desired users
        .route("/users", get(list_users_handler).post(upsert_user_handler))
        .route("/users/:name", delete(delete_user_handler))
        // Live nodes
        .route("/nodes", get(list_nodes_handler))
        .route("/nodes/:id", delete(delete_node_handler))
        .route("/nodes/:id/expire", post(expire_node_handler))
        // Desired routes
        .route("/routes", get(list_routes_handler).post(upsert_route_handler))
        .route("/routes/:node", delete(delete_routes_handler))
        // Desired ACL policy
        .route("/acl", get(get_acl_handler).put(put_acl_handler))
        .route("/status", get(status_handler));

    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .nest("/api/v1", api)
        .layer(auth_layer)
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until ctrl-c
pub async fn serve(addr: SocketAddr, state: Arc<AppState>) -> anyhow::Result<()> {
    info!("meshsync API listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received shutdown signal");
            }
        })
        .await?;

    Ok(())
}

async fn auth_middleware_inner(
    state: Arc<AppState>,
    req: Request,
    next: middleware::Next,
) -> Response {
    if PUBLIC_PATHS.contains(&req.uri().path()) {
        return next.run(req).await;
    }

    match check_bearer(req.headers(), &state.api_token) {
        Ok(()) => next.run(req).await,
        Err(e) => ApiError::from(e).into_response(),
    }
}

fn check_bearer(headers: &HeaderMap, expected: &str) -> Result<(), AuthError> {
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .unwrap_or("");

    if provided.is_empty() {
        return Err(AuthError::Missing);
    }
    if !constant_time_eq(provided, expected) {
        return Err(AuthError::Invalid);
    }
    Ok(())
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut v: u8 = 0;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes().iter()) {
        v |= x ^ y;
    }
    v == 0
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "time": Utc::now().timestamp(),
        "service": SERVICE_NAME,
    }))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render().unwrap_or_default(),
    )
}

/// An empty body means all options off.
async fn apply_handler(State(state): State<Arc<AppState>>, body: Bytes) -> ApiResult<impl IntoResponse> {
    let options: ApplyOptions = if body.iter().all(u8::is_ascii_whitespace) {
        ApplyOptions::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("invalid apply request: {e}")))?
    };

    let result = state.reconciler.apply_from(&state.store, options).await?;
    Ok(Json(result))
}

async fn drift_handler(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    let report = state.drift.detect_from(&state.store).await?;
    Ok(Json(report))
}

/// A document that fails to load is reported as invalid.
async fn validate_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let report = match state.store.load().await {
        Ok(desired) => validate(&desired),
        Err(e) => ValidationReport::from_issues(vec![e.to_string()]),
    };
    Json(report)
}

#[derive(Debug, Deserialize)]
struct KeyQuery {
    user: Option<String>,
}

async fn create_key_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<AuthKeyRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    if request.user.trim().is_empty() {
        return Err(ApiError::BadRequest("user is required".to_string()));
    }
    let key = state.keys.issue(request).await?;
    Ok(Json(key))
}

async fn list_keys_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<KeyQuery>,
) -> ApiResult<impl IntoResponse> {
    let keys = match query.user.as_deref().filter(|u| !u.is_empty()) {
        Some(user) => state.keys.list(user).await?,
        None => state.keys.list_all().await?,
    };
    Ok(Json(keys))
}

async fn revoke_key_handler(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Query(query): Query<KeyQuery>,
) -> ApiResult<impl IntoResponse> {
    let user = query
        .user
        .filter(|u| !u.is_empty())
        .ok_or_else(|| ApiError::BadRequest("user query parameter is required".to_string()))?;
    state.keys.revoke(&user, &key).await?;
    Ok(Json(json!({"message": format!("Auth key {key} revoked")})))
}

async fn list_users_handler(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.store.load_users().await?))
}

async fn upsert_user_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<User>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(user) = payload?;
    validate(&DesiredState {
        users: vec![user.clone()],
        ..Default::default()
    })
    .into_result()?;

    let created = state.store.upsert_user(user.clone()).await?;
    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(user)))
}

async fn delete_user_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.store.remove_user(&name).await?;
    Ok(Json(json!({"message": format!("User {name} deleted")})))
}

async fn list_nodes_handler(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.control_plane.list_nodes().await?))
}

/// Headscale node ids are unsigned integers
fn node_id(id: &str) -> ApiResult<&str> {
    if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ApiError::BadRequest(format!("invalid node id: {id}")));
    }
    Ok(id)
}

async fn delete_node_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.control_plane.delete_node(node_id(&id)?).await?;
    info!("Deleted node {}", id);
    Ok(Json(json!({"message": format!("Node {id} deleted")})))
}

async fn expire_node_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.control_plane.expire_node(node_id(&id)?).await?;
    info!("Expired node {}", id);
    Ok(Json(json!({"message": format!("Node {id} expired")})))
}

async fn list_routes_handler(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.store.load_routes().await?))
}

async fn upsert_route_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<Route>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(route) = payload?;
    validate(&DesiredState {
        routes: vec![route.clone()],
        ..Default::default()
    })
    .into_result()?;

    let created = state.store.upsert_route(route.clone()).await?;
    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(route)))
}

async fn delete_routes_handler(
    State(state): State<Arc<AppState>>,
    Path(node): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let removed = state.store.remove_routes_for_node(&node).await?;
    Ok(Json(json!({
        "message": format!("Removed {removed} route entries for node {node}")
    })))
}

async fn get_acl_handler(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.store.load_policy().await?))
}

async fn put_acl_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<AclPolicy>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(policy) = payload?;
    validate_policy(&policy).into_result()?;
    state.store.save_policy(&policy).await?;
    Ok(Json(json!({"message": "ACL updated successfully"})))
}

async fn status_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (store, control_plane) =
        tokio::join!(state.store.load(), state.control_plane.list_users());

    let storage = match &store {
        Ok(_) => "ok".to_string(),
        Err(e) => e.to_string(),
    };
    let headscale = match &control_plane {
        Ok(_) => "reachable".to_string(),
        Err(e) => e.to_string(),
    };
    let healthy = store.is_ok() && control_plane.is_ok();

    Json(json!({
        "service": SERVICE_NAME,
        "version": VERSION,
        "status": if healthy { "ok" } else { "degraded" },
        "uptime_seconds": state.started.elapsed().as_secs(),
        "timestamp": Utc::now().timestamp(),
        "apply_in_progress": state.reconciler.is_applying(),
        "health": {
            "storage": storage,
            "headscale": headscale,
        },
    }))
}
