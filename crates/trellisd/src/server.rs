//! HTTP API for the state manager.
//!
//! JSON over axum. Every endpoint except `/health` requires the
//! `x-api-key` header to match the configured API key. Domain errors map
//! to 400/404; anything unexpected is logged and surfaced as a stable 500
//! body.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use trellis_core::{
    Encrypter, GraphTemplate, Id, NodeSchema, NodeTemplate, RegisteredNode, RetryPolicy,
    StateStatus, StoreConfig, ValidationStatus,
};

use crate::config::DaemonConfig;
use crate::lease;
use crate::lifecycle::{self, CreateStateRequest, LifecycleError};
use crate::storage::Storage;
use crate::validator;

/// Header carrying the API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Shared state for HTTP handlers.
pub struct AppState {
    pub storage: Arc<Storage>,
    pub encrypter: Arc<Encrypter>,
    pub config: DaemonConfig,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

/// Create the HTTP router with all endpoints.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route(
            "/v0/namespace/{namespace}/graph/{graph_name}",
            put(put_graph).get(get_graph),
        )
        .route("/v0/namespace/{namespace}/graphs", get(list_graphs))
        .route(
            "/v0/namespace/{namespace}/graph/{graph_name}/states/create",
            post(create_states),
        )
        .route(
            "/v0/namespace/{namespace}/graph/{graph_name}/trigger",
            post(trigger_graph),
        )
        .route("/v0/namespace/{namespace}/nodes/register", post(register_node))
        .route(
            "/v0/namespace/{namespace}/nodes/{node_name}/lease",
            post(lease_states),
        )
        .route(
            "/v0/namespace/{namespace}/states/{state_id}/executed",
            post(executed_state),
        )
        .route(
            "/v0/namespace/{namespace}/states/{state_id}/errored",
            post(errored_state),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn start_server(state: Arc<AppState>) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.port));
    let router = create_router(state);
    info!("HTTP server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await
}

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn bad_request(message: impl Into<String>) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

fn not_found(message: impl Into<String>) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

/// Unexpected failures get a stable body; details go to the log only.
fn internal_error(err: impl std::fmt::Display) -> ApiError {
    error!(error = %err, "internal server error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: "internal server error".to_string(),
        }),
    )
}

fn map_lifecycle_error(err: LifecycleError) -> ApiError {
    match &err {
        LifecycleError::TemplateNotFound
        | LifecycleError::NodeTemplateNotFound
        | LifecycleError::StateNotFound => not_found(err.to_string()),
        LifecycleError::StateNotQueued
        | LifecycleError::OutputSchemaViolation { .. }
        | LifecycleError::MissingStoreKey(_) => bad_request(err.to_string()),
        LifecycleError::Storage(_) => internal_error(err),
    }
}

/// Validate the API key header when auth is configured.
fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = &state.config.api_key else {
        return Ok(());
    };

    let provided = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok());
    if provided == Some(expected.as_str()) {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse {
                error: "Invalid API key".to_string(),
            }),
        ))
    }
}

// --- Request/Response types ---

#[derive(Debug, Deserialize)]
struct GraphUpsertRequest {
    nodes: Vec<NodeTemplate>,
    /// Plaintext secret values; sealed before they touch storage.
    #[serde(default)]
    secrets: BTreeMap<String, String>,
    #[serde(default)]
    store_config: Option<StoreConfig>,
}

#[derive(Debug, Serialize)]
struct GraphListResponse {
    graphs: Vec<GraphTemplate>,
}

#[derive(Debug, Deserialize)]
struct RegisterNodeRequest {
    name: String,
    inputs_schema: NodeSchema,
    outputs_schema: NodeSchema,
    #[serde(default)]
    secrets: Option<Vec<String>>,
    #[serde(default)]
    retry_policy: Option<RetryPolicy>,
}

#[derive(Debug, Deserialize)]
struct CreateStatesRequest {
    run_id: String,
    states: Vec<CreateStateRequest>,
}

#[derive(Debug, Deserialize)]
struct TriggerRequest {
    states: Vec<CreateStateRequest>,
    /// Run-store values merged over `store_config.default_values`.
    #[serde(default)]
    store: BTreeMap<String, String>,
}

/// State summary returned by create/trigger.
#[derive(Debug, Serialize)]
struct ResponseState {
    state_id: Id,
    identifier: String,
    node_name: String,
    graph_name: String,
    run_id: String,
    inputs: BTreeMap<String, String>,
    created_at: DateTime<Utc>,
}

impl From<&trellis_core::State> for ResponseState {
    fn from(state: &trellis_core::State) -> Self {
        Self {
            state_id: state.id.clone(),
            identifier: state.identifier.clone(),
            node_name: state.node_name.clone(),
            graph_name: state.graph_name.clone(),
            run_id: state.run_id.clone(),
            inputs: state.inputs.clone(),
            created_at: state.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
struct CreateStatesResponse {
    status: StateStatus,
    states: Vec<ResponseState>,
}

#[derive(Debug, Serialize)]
struct TriggerResponse {
    run_id: String,
    status: StateStatus,
    states: Vec<ResponseState>,
}

#[derive(Debug, Deserialize)]
struct LeaseRequest {
    batch_size: u32,
}

#[derive(Debug, Serialize)]
struct LeaseResponse {
    namespace: String,
    node_name: String,
    count: usize,
    states: Vec<lease::LeasedState>,
}

#[derive(Debug, Deserialize)]
struct ExecutedRequest {
    outputs: Vec<BTreeMap<String, String>>,
    /// Optional run-store writes; upserts, last-writer-wins.
    #[serde(default)]
    store: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct ErroredRequest {
    error: String,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    status: StateStatus,
}

// --- Handlers ---

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn put_graph(
    State(state): State<Arc<AppState>>,
    Path((namespace, graph_name)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<GraphUpsertRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let mut sealed_secrets = BTreeMap::new();
    for (name, value) in &body.secrets {
        let sealed = state
            .encrypter
            .encrypt(value)
            .map_err(internal_error)?;
        sealed_secrets.insert(name.clone(), sealed);
    }

    let now = Utc::now();
    let mut template = GraphTemplate {
        namespace: namespace.clone(),
        name: graph_name.clone(),
        nodes: body.nodes,
        secrets: sealed_secrets,
        store_config: body.store_config,
        validation_status: ValidationStatus::Pending,
        validation_errors: Vec::new(),
        created_at: now,
        updated_at: now,
    };

    let structure_errors = template.validate_structure();
    if !structure_errors.is_empty() {
        return Err(bad_request(structure_errors.join("; ")));
    }

    state
        .storage
        .upsert_graph_template(&template)
        .await
        .map_err(internal_error)?;

    tokio::spawn(validator::verify_graph(
        Arc::clone(&state.storage),
        template.clone(),
    ));

    info!(namespace = %namespace, graph = %graph_name, "graph template upserted");
    Ok((StatusCode::CREATED, Json(template)))
}

async fn get_graph(
    State(state): State<Arc<AppState>>,
    Path((namespace, graph_name)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<GraphTemplate>, ApiError> {
    check_auth(&state, &headers)?;
    let template = lifecycle::require_template(&state.storage, &namespace, &graph_name)
        .await
        .map_err(map_lifecycle_error)?;
    Ok(Json(template))
}

async fn list_graphs(
    State(state): State<Arc<AppState>>,
    Path(namespace): Path<String>,
    headers: HeaderMap,
) -> Result<Json<GraphListResponse>, ApiError> {
    check_auth(&state, &headers)?;
    let graphs = state
        .storage
        .list_graph_templates(&namespace)
        .await
        .map_err(internal_error)?;
    Ok(Json(GraphListResponse { graphs }))
}

async fn register_node(
    State(state): State<Arc<AppState>>,
    Path(namespace): Path<String>,
    headers: HeaderMap,
    Json(body): Json<RegisterNodeRequest>,
) -> Result<Json<RegisteredNode>, ApiError> {
    check_auth(&state, &headers)?;

    let now = Utc::now();
    let node = RegisteredNode {
        namespace: namespace.clone(),
        name: body.name,
        inputs_schema: body.inputs_schema,
        outputs_schema: body.outputs_schema,
        secrets: body.secrets,
        retry_policy: body.retry_policy.unwrap_or_default(),
        created_at: now,
        updated_at: now,
    };

    state
        .storage
        .upsert_registered_node(&node)
        .await
        .map_err(internal_error)?;

    // Re-fetch so the response reflects the stored record (original
    // created_at on re-registration).
    let stored = state
        .storage
        .get_registered_node(&namespace, &node.name)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| internal_error("registered node vanished after upsert"))?;

    info!(namespace = %namespace, node = %stored.name, "node registered");
    Ok(Json(stored))
}

async fn create_states(
    State(state): State<Arc<AppState>>,
    Path((namespace, graph_name)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<CreateStatesRequest>,
) -> Result<Json<CreateStatesResponse>, ApiError> {
    check_auth(&state, &headers)?;

    let states = lifecycle::create_states(
        &state.storage,
        &namespace,
        &graph_name,
        &body.run_id,
        &body.states,
    )
    .await
    .map_err(map_lifecycle_error)?;

    Ok(Json(CreateStatesResponse {
        status: StateStatus::Created,
        states: states.iter().map(ResponseState::from).collect(),
    }))
}

async fn trigger_graph(
    State(state): State<Arc<AppState>>,
    Path((namespace, graph_name)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<TriggerRequest>,
) -> Result<Json<TriggerResponse>, ApiError> {
    check_auth(&state, &headers)?;

    let (run_id, states) = lifecycle::trigger(
        &state.storage,
        &namespace,
        &graph_name,
        &body.states,
        &body.store,
    )
    .await
    .map_err(map_lifecycle_error)?;

    Ok(Json(TriggerResponse {
        run_id,
        status: StateStatus::Created,
        states: states.iter().map(ResponseState::from).collect(),
    }))
}

async fn lease_states(
    State(state): State<Arc<AppState>>,
    Path((namespace, node_name)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<LeaseRequest>,
) -> Result<Json<LeaseResponse>, ApiError> {
    check_auth(&state, &headers)?;

    if body.batch_size == 0 {
        return Err(bad_request("batch_size must be at least 1"));
    }
    let batch_size = body.batch_size.min(state.config.max_lease_batch);

    let states = lease::lease(
        Arc::clone(&state.storage),
        &state.encrypter,
        &namespace,
        &node_name,
        batch_size,
    )
    .await
    .map_err(internal_error)?;

    Ok(Json(LeaseResponse {
        namespace,
        node_name,
        count: states.len(),
        states,
    }))
}

async fn executed_state(
    State(state): State<Arc<AppState>>,
    Path((namespace, state_id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<ExecutedRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    check_auth(&state, &headers)?;

    let status = lifecycle::executed(
        Arc::clone(&state.storage),
        &namespace,
        &Id::from_string(state_id),
        body.outputs,
        &body.store,
        Duration::from_secs(state.config.graph_valid_timeout_secs),
    )
    .await
    .map_err(map_lifecycle_error)?;

    Ok(Json(StatusResponse { status }))
}

async fn errored_state(
    State(state): State<Arc<AppState>>,
    Path((namespace, state_id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<ErroredRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    check_auth(&state, &headers)?;

    let status = lifecycle::errored(
        Arc::clone(&state.storage),
        &namespace,
        &Id::from_string(state_id),
        &body.error,
    )
    .await
    .map_err(map_lifecycle_error)?;

    Ok(Json(StatusResponse { status }))
}
