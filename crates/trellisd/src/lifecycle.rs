//! State lifecycle controllers.
//!
//! Trigger and create-states materialize CREATED states for a graph run;
//! executed and errored accept worker commits and drive the state machine
//! forward. Fanout and retry continue in background tasks; those tasks
//! never propagate errors, they convert failures into state transitions.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info, warn};
use trellis_core::{new_run_id, GraphTemplate, Id, State, StateStatus};

use crate::fanout;
use crate::storage::{Storage, StorageError};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Graph template not found")]
    TemplateNotFound,
    #[error("Node template not found")]
    NodeTemplateNotFound,
    #[error("State not found")]
    StateNotFound,
    #[error("State is not queued")]
    StateNotQueued,
    #[error("Output field {field} is missing for node {node_name}")]
    OutputSchemaViolation { field: String, node_name: String },
    #[error("Store key {0} is required but was not provided at trigger time")]
    MissingStoreKey(String),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, LifecycleError>;

/// One requested root state.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct CreateStateRequest {
    pub identifier: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
}

/// Materialize CREATED states for `requests` under an existing run id.
/// Root states are self-inclusive: each one's `parents` maps its own
/// identifier to its own id.
pub async fn create_states(
    storage: &Storage,
    namespace: &str,
    graph_name: &str,
    run_id: &str,
    requests: &[CreateStateRequest],
) -> Result<Vec<State>> {
    let template = storage
        .get_graph_template(namespace, graph_name)
        .await?
        .ok_or(LifecycleError::TemplateNotFound)?;

    let mut states = Vec::with_capacity(requests.len());
    for request in requests {
        let node_template = template
            .node_by_identifier(&request.identifier)
            .ok_or(LifecycleError::NodeTemplateNotFound)?;

        let id = Id::new();
        let parents = BTreeMap::from([(request.identifier.clone(), id.clone())]);
        states.push(State::created(
            id,
            run_id,
            node_template.namespace.clone(),
            graph_name,
            request.identifier.clone(),
            node_template.node_name.clone(),
            request.inputs.clone(),
            parents,
        ));
    }

    storage.insert_states(&states).await?;
    info!(namespace, graph = graph_name, run_id, count = states.len(), "created states");
    Ok(states)
}

/// Allocate a fresh run id, seed the run store, and create root states.
/// The caller-provided `store` map overrides `store_config` defaults;
/// required keys missing from the merge reject the trigger.
pub async fn trigger(
    storage: &Storage,
    namespace: &str,
    graph_name: &str,
    requests: &[CreateStateRequest],
    store: &BTreeMap<String, String>,
) -> Result<(String, Vec<State>)> {
    let template = storage
        .get_graph_template(namespace, graph_name)
        .await?
        .ok_or(LifecycleError::TemplateNotFound)?;

    let run_id = new_run_id();

    let mut seed: BTreeMap<&str, &str> = BTreeMap::new();
    if let Some(store_config) = &template.store_config {
        for (key, value) in &store_config.default_values {
            seed.insert(key.as_str(), value.as_str());
        }
    }
    for (key, value) in store {
        seed.insert(key.as_str(), value.as_str());
    }
    if let Some(store_config) = &template.store_config {
        for key in &store_config.required_keys {
            if !seed.contains_key(key.as_str()) {
                return Err(LifecycleError::MissingStoreKey(key.clone()));
            }
        }
    }

    for (key, value) in &seed {
        storage
            .upsert_store_value(&run_id, namespace, graph_name, key, value)
            .await?;
    }

    let states = create_states(storage, namespace, graph_name, &run_id, requests).await?;
    info!(namespace, graph = graph_name, run_id = %run_id, "triggered graph");
    Ok((run_id, states))
}

/// Worker commit with outputs. Validates every output map against the
/// registered node's output schema, moves the state to EXECUTED, applies
/// optional store writes, and schedules successor creation. A state whose
/// node template has no successors completes immediately.
pub async fn executed(
    storage: Arc<Storage>,
    namespace: &str,
    state_id: &Id,
    outputs: Vec<BTreeMap<String, String>>,
    store_writes: &BTreeMap<String, String>,
    graph_valid_timeout: Duration,
) -> Result<StateStatus> {
    let state = fetch_namespaced_state(&storage, namespace, state_id).await?;
    if state.status != StateStatus::Queued {
        return Err(LifecycleError::StateNotQueued);
    }

    if let Some(node) = storage
        .get_registered_node(&state.namespace_name, &state.node_name)
        .await?
    {
        for output in &outputs {
            if let Err(e) = node.outputs_schema.validate_output(output) {
                let violation = LifecycleError::OutputSchemaViolation {
                    field: match e {
                        trellis_core::SchemaError::MissingField(field) => field,
                    },
                    node_name: state.node_name.clone(),
                };
                // The commit is rejected and the state goes through the
                // retry gate with the failing field named.
                if storage
                    .mark_errored_from(state_id, StateStatus::Queued, &violation.to_string())
                    .await?
                {
                    schedule_retry(Arc::clone(&storage), state_id.clone()).await?;
                }
                return Err(violation);
            }
        }
    }

    let first_output = outputs.first().cloned().unwrap_or_default();
    if !storage.mark_executed(state_id, &first_output).await? {
        return Err(LifecycleError::StateNotQueued);
    }
    info!(state_id = %state_id, node = %state.node_name, outputs = outputs.len(),
        "state executed");

    for (key, value) in store_writes {
        storage
            .upsert_store_value(&state.run_id, &state.namespace_name, &state.graph_name, key, value)
            .await?;
    }

    let template = storage
        .get_graph_template(&state.namespace_name, &state.graph_name)
        .await?;
    let has_successors = template
        .as_ref()
        .and_then(|t| t.node_by_identifier(&state.identifier))
        .is_some_and(|n| !n.next_nodes.is_empty());

    if has_successors || template.is_none() {
        // Missing templates surface through the fanout task's own error
        // handling rather than failing the commit.
        let mut committed = state;
        committed.status = StateStatus::Executed;
        committed.outputs = first_output;
        tokio::spawn(fanout::create_next_states(
            storage,
            committed,
            outputs,
            graph_valid_timeout,
        ));
    } else {
        storage
            .set_status_from(state_id, StateStatus::Executed, StateStatus::Success)
            .await?;
    }

    Ok(StateStatus::Executed)
}

/// Worker commit with an error. The state moves to ERRORED and, while
/// retry budget remains, a delayed task re-creates it.
pub async fn errored(
    storage: Arc<Storage>,
    namespace: &str,
    state_id: &Id,
    message: &str,
) -> Result<StateStatus> {
    let state = fetch_namespaced_state(&storage, namespace, state_id).await?;
    if state.status != StateStatus::Queued {
        return Err(LifecycleError::StateNotQueued);
    }

    if !storage
        .mark_errored_from(state_id, StateStatus::Queued, message)
        .await?
    {
        return Err(LifecycleError::StateNotQueued);
    }
    warn!(state_id = %state_id, node = %state.node_name, error = message, "state errored");

    schedule_retry(storage, state_id.clone()).await?;
    Ok(StateStatus::Errored)
}

/// Schedule the retry gate for an ERRORED state. When budget remains, a
/// delayed task waits out the policy's backoff and re-creates the state;
/// otherwise the state stays terminally ERRORED.
pub async fn schedule_retry(
    storage: Arc<Storage>,
    state_id: Id,
) -> std::result::Result<(), StorageError> {
    let Some(state) = storage.get_state(&state_id).await? else {
        return Ok(());
    };

    let policy = storage
        .get_registered_node(&state.namespace_name, &state.node_name)
        .await?
        .map(|n| n.retry_policy)
        .unwrap_or_default();

    if state.retry_count >= policy.max_retries {
        info!(state_id = %state_id, retry_count = state.retry_count,
            "retry budget exhausted, state is terminal");
        return Ok(());
    }

    let delay_ms = policy
        .compute_delay(state.retry_count + 1)
        .unwrap_or(policy.backoff_factor);
    let max_retries = policy.max_retries;

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        match storage.mark_retry_created(&state_id, max_retries).await {
            Ok(true) => {
                info!(state_id = %state_id, delay_ms, "state re-created for retry");
            }
            Ok(false) => {
                // Lost the CAS: the state moved on or ran out of budget.
            }
            Err(e) => {
                error!(state_id = %state_id, error = %e, "retry transition failed");
            }
        }
    });
    Ok(())
}

async fn fetch_namespaced_state(
    storage: &Storage,
    namespace: &str,
    state_id: &Id,
) -> Result<State> {
    let state = storage
        .get_state(state_id)
        .await?
        .ok_or(LifecycleError::StateNotFound)?;
    if state.namespace_name != namespace {
        return Err(LifecycleError::StateNotFound);
    }
    Ok(state)
}

/// Convenience used by handlers that only need template presence.
pub async fn require_template(
    storage: &Storage,
    namespace: &str,
    graph_name: &str,
) -> Result<GraphTemplate> {
    storage
        .get_graph_template(namespace, graph_name)
        .await?
        .ok_or(LifecycleError::TemplateNotFound)
}
