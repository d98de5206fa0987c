//! Successor creation.
//!
//! After a state commits outputs, a background task builds the next
//! generation: one successor chain per committed output map, with
//! placeholders resolved from ancestor outputs and the run store. The task
//! waits for the graph template to turn VALID (bounded), creates each
//! generation in one batch, then completes the originating state. Any
//! failure lands the originator in NEXT_CREATED_ERROR with the reason.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info};
use trellis_core::{GraphTemplate, Id, State, StateStatus};

use crate::resolve::{ResolveError, Resolver};
use crate::storage::{Storage, StorageError};
use crate::validator::{self, WaitError};

#[derive(Debug, Error)]
enum FanoutError {
    #[error("{0}")]
    Wait(#[from] WaitError),
    #[error("Node template {0} not found")]
    NodeTemplateNotFound(String),
    #[error("Registered node {0} not found")]
    RegisteredNodeNotFound(String),
    #[error("Input {field} is not declared by node template {identifier}")]
    InputNotDeclared { identifier: String, field: String },
    #[error("{0}")]
    Resolve(#[from] ResolveError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Background task entry point. Never returns an error; failures become a
/// NEXT_CREATED_ERROR transition on `state`.
pub async fn create_next_states(
    storage: Arc<Storage>,
    state: State,
    output_maps: Vec<BTreeMap<String, String>>,
    graph_valid_timeout: Duration,
) {
    let state_id = state.id.clone();
    if let Err(e) = run(&storage, &state, &output_maps, graph_valid_timeout).await {
        error!(state_id = %state_id, error = %e, "successor creation failed");
        if let Err(persist_err) = storage
            .mark_next_created_error(&state_id, &e.to_string())
            .await
        {
            error!(state_id = %state_id, error = %persist_err,
                "failed to record successor-creation failure");
        }
    }
}

async fn run(
    storage: &Arc<Storage>,
    state: &State,
    output_maps: &[BTreeMap<String, String>],
    graph_valid_timeout: Duration,
) -> Result<(), FanoutError> {
    let template = validator::wait_until_valid(
        storage,
        &state.namespace_name,
        &state.graph_name,
        graph_valid_timeout,
    )
    .await?;

    let node_template = template
        .node_by_identifier(&state.identifier)
        .ok_or_else(|| FanoutError::NodeTemplateNotFound(state.identifier.clone()))?;

    if !node_template.next_nodes.is_empty() {
        // One successor generation per output map, in commit order.
        for output_map in output_maps {
            let successors =
                build_successors(storage, &template, state, &node_template.next_nodes, output_map)
                    .await?;
            storage.insert_states(&successors).await?;
            info!(state_id = %state.id, successors = successors.len(),
                "created successor states");
        }
    }

    storage
        .set_status_from(&state.id, StateStatus::Executed, StateStatus::Success)
        .await?;
    Ok(())
}

async fn build_successors(
    storage: &Arc<Storage>,
    template: &GraphTemplate,
    state: &State,
    next_nodes: &[String],
    output_map: &BTreeMap<String, String>,
) -> Result<Vec<State>, FanoutError> {
    let mut resolver = Resolver::new(storage, &state.run_id, &state.namespace_name, &state.graph_name)
        .with_override(&state.identifier, output_map);

    let mut successors = Vec::with_capacity(next_nodes.len());
    for identifier in next_nodes {
        let next_template = template
            .node_by_identifier(identifier)
            .ok_or_else(|| FanoutError::NodeTemplateNotFound(identifier.clone()))?;

        let registered = storage
            .get_registered_node(&next_template.namespace, &next_template.node_name)
            .await?
            .ok_or_else(|| FanoutError::RegisteredNodeNotFound(next_template.node_name.clone()))?;

        let mut inputs = BTreeMap::new();
        for field in registered.inputs_schema.field_names() {
            let raw = next_template.inputs.get(field).ok_or_else(|| {
                FanoutError::InputNotDeclared {
                    identifier: identifier.clone(),
                    field: field.to_string(),
                }
            })?;
            let value = resolver.resolve_value(field, raw, &state.parents).await?;
            inputs.insert(field.to_string(), value);
        }

        // The chain grows one step: the successor records its own instance
        // id under its own identifier.
        let id = Id::new();
        let mut parents = state.parents.clone();
        parents.insert(identifier.clone(), id.clone());

        successors.push(State::created(
            id,
            state.run_id.clone(),
            next_template.namespace.clone(),
            state.graph_name.clone(),
            identifier.clone(),
            next_template.node_name.clone(),
            inputs,
            parents,
        ));
    }
    Ok(successors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;
    use trellis_core::{
        NodeSchema, NodeTemplate, RegisteredNode, RetryPolicy, ValidationStatus,
    };

    struct TestEnv {
        storage: Arc<Storage>,
        _dir: TempDir,
    }

    async fn create_env() -> TestEnv {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(&dir.path().join("test.db")).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        TestEnv {
            storage: Arc::new(storage),
            _dir: dir,
        }
    }

    async fn register(env: &TestEnv, name: &str, inputs: &[&str], outputs: &[&str]) {
        let now = Utc::now();
        env.storage
            .upsert_registered_node(&RegisteredNode {
                namespace: "ns".to_string(),
                name: name.to_string(),
                inputs_schema: NodeSchema::strings(inputs.iter().copied()),
                outputs_schema: NodeSchema::strings(outputs.iter().copied()),
                secrets: None,
                retry_policy: RetryPolicy::default(),
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
    }

    async fn seed_chain_graph(env: &TestEnv) {
        register(env, "a_node", &[], &["msg", "k"]).await;
        register(env, "b_node", &["x"], &[]).await;

        let now = Utc::now();
        env.storage
            .upsert_graph_template(&GraphTemplate {
                namespace: "ns".to_string(),
                name: "graph".to_string(),
                nodes: vec![
                    NodeTemplate {
                        node_name: "a_node".to_string(),
                        namespace: "ns".to_string(),
                        identifier: "a".to_string(),
                        inputs: BTreeMap::new(),
                        next_nodes: vec!["b".to_string()],
                        unites: None,
                    },
                    NodeTemplate {
                        node_name: "b_node".to_string(),
                        namespace: "ns".to_string(),
                        identifier: "b".to_string(),
                        inputs: BTreeMap::from([(
                            "x".to_string(),
                            "hi ${{ a.outputs.msg }}".to_string(),
                        )]),
                        next_nodes: Vec::new(),
                        unites: None,
                    },
                ],
                secrets: BTreeMap::new(),
                store_config: None,
                validation_status: ValidationStatus::Valid,
                validation_errors: Vec::new(),
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
    }

    async fn executed_root(env: &TestEnv, outputs: &[(&str, &str)]) -> State {
        let id = Id::new();
        let mut state = State::created(
            id.clone(),
            "run-1",
            "ns",
            "graph",
            "a",
            "a_node",
            BTreeMap::new(),
            BTreeMap::from([("a".to_string(), id)]),
        );
        state.status = StateStatus::Executed;
        state.outputs = outputs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        env.storage.insert_states(&[state.clone()]).await.unwrap();
        state
    }

    #[tokio::test]
    async fn creates_successor_with_resolved_inputs() {
        let env = create_env().await;
        seed_chain_graph(&env).await;
        let root = executed_root(&env, &[("msg", "there"), ("k", "1")]).await;

        create_next_states(
            Arc::clone(&env.storage),
            root.clone(),
            vec![root.outputs.clone()],
            Duration::from_secs(5),
        )
        .await;

        let run_states = env.storage.list_run_states("run-1").await.unwrap();
        assert_eq!(run_states.len(), 2);

        let child = run_states.iter().find(|s| s.identifier == "b").unwrap();
        assert_eq!(child.status, StateStatus::Created);
        assert_eq!(child.inputs.get("x").map(String::as_str), Some("hi there"));
        assert_eq!(child.node_name, "b_node");
        assert_eq!(child.depth(), 2);
        assert_eq!(child.parents.get("a"), Some(&root.id));
        assert_eq!(child.parents.get("b"), Some(&child.id));

        let parent = env.storage.get_state(&root.id).await.unwrap().unwrap();
        assert_eq!(parent.status, StateStatus::Success);
    }

    #[tokio::test]
    async fn fans_out_one_chain_per_output_map() {
        let env = create_env().await;
        seed_chain_graph(&env).await;
        let root = executed_root(&env, &[("msg", "one"), ("k", "1")]).await;

        let maps = vec![
            BTreeMap::from([("msg".to_string(), "one".to_string()), ("k".to_string(), "1".to_string())]),
            BTreeMap::from([("msg".to_string(), "two".to_string()), ("k".to_string(), "2".to_string())]),
        ];
        create_next_states(Arc::clone(&env.storage), root, maps, Duration::from_secs(5)).await;

        let run_states = env.storage.list_run_states("run-1").await.unwrap();
        let mut child_inputs: Vec<String> = run_states
            .iter()
            .filter(|s| s.identifier == "b")
            .filter_map(|s| s.inputs.get("x").cloned())
            .collect();
        child_inputs.sort();
        assert_eq!(child_inputs, vec!["hi one".to_string(), "hi two".to_string()]);
    }

    #[tokio::test]
    async fn missing_output_field_lands_in_next_created_error() {
        let env = create_env().await;
        seed_chain_graph(&env).await;
        let root = executed_root(&env, &[("k", "1")]).await;

        // The output map lacks `msg`, which b's input placeholder needs.
        create_next_states(
            Arc::clone(&env.storage),
            root.clone(),
            vec![root.outputs.clone()],
            Duration::from_secs(5),
        )
        .await;

        let parent = env.storage.get_state(&root.id).await.unwrap().unwrap();
        assert_eq!(parent.status, StateStatus::NextCreatedError);
        assert!(parent.error.unwrap().contains("msg"));

        let run_states = env.storage.list_run_states("run-1").await.unwrap();
        assert_eq!(run_states.len(), 1, "no successor may exist");
    }

    #[tokio::test]
    async fn invalid_template_fails_the_fanout() {
        let env = create_env().await;
        seed_chain_graph(&env).await;
        env.storage
            .set_graph_validation("ns", "graph", ValidationStatus::Invalid, &["bad".to_string()])
            .await
            .unwrap();
        let root = executed_root(&env, &[("msg", "x"), ("k", "1")]).await;

        create_next_states(
            Arc::clone(&env.storage),
            root.clone(),
            vec![root.outputs.clone()],
            Duration::from_secs(5),
        )
        .await;

        let parent = env.storage.get_state(&root.id).await.unwrap().unwrap();
        assert_eq!(parent.status, StateStatus::NextCreatedError);
        assert!(parent.error.unwrap().contains("INVALID"));
    }
}
