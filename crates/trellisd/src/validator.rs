//! Asynchronous graph-template validation.
//!
//! A freshly upserted template is PENDING. [`verify_graph`] runs three
//! checks concurrently against one batched registry lookup, aggregates
//! every error rather than stopping at the first, and flips the template
//! to VALID or INVALID. Successor creation waits on VALID through
//! [`wait_until_valid`] with a hard ceiling.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info};
use trellis_core::{GraphTemplate, RegisteredNode, ValidationStatus};

use crate::storage::Storage;

/// Poll granularity of the validity wait loop.
const VALIDITY_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum WaitError {
    #[error("graph template {namespace}/{graph} not found")]
    NotFound { namespace: String, graph: String },
    #[error("graph template {namespace}/{graph} is INVALID: {errors:?}")]
    Invalid {
        namespace: String,
        graph: String,
        errors: Vec<String>,
    },
    #[error(
        "timeout waiting for graph template {namespace}/{graph} to become valid after {secs} seconds"
    )]
    Timeout {
        namespace: String,
        graph: String,
        secs: u64,
    },
    #[error("storage error while waiting for graph template: {0}")]
    Storage(#[from] crate::storage::StorageError),
}

/// Validate `template` against the node registry and persist the verdict.
/// Never propagates an error: unexpected failures mark the template
/// INVALID with a descriptive entry.
pub async fn verify_graph(storage: Arc<Storage>, template: GraphTemplate) {
    let namespace = template.namespace.clone();
    let name = template.name.clone();

    let (status, errors) = match run_checks(&storage, &template).await {
        Ok(errors) if errors.is_empty() => (ValidationStatus::Valid, Vec::new()),
        Ok(errors) => (ValidationStatus::Invalid, errors),
        Err(e) => (
            ValidationStatus::Invalid,
            vec![format!("Validation failed due to unexpected error: {e}")],
        ),
    };

    if let Err(e) = storage
        .set_graph_validation(&namespace, &name, status, &errors)
        .await
    {
        error!(namespace = %namespace, graph = %name, error = %e,
            "failed to persist graph validation verdict");
        return;
    }

    info!(namespace = %namespace, graph = %name, status = status.as_str(),
        errors = errors.len(), "graph template verified");
}

async fn run_checks(
    storage: &Storage,
    template: &GraphTemplate,
) -> crate::storage::Result<Vec<String>> {
    let registered = storage.registered_nodes_for(&template.nodes).await?;

    let (node_errors, secret_errors, input_errors) = tokio::join!(
        verify_nodes_exist(template, &registered),
        verify_secrets(template, &registered),
        verify_inputs(template, &registered),
    );

    let mut errors = node_errors;
    errors.extend(secret_errors);
    errors.extend(input_errors);
    Ok(errors)
}

/// Every `(node_name, namespace)` referenced by the template must resolve
/// in the registry.
async fn verify_nodes_exist(
    template: &GraphTemplate,
    registered: &[RegisteredNode],
) -> Vec<String> {
    let registered_set: BTreeSet<(&str, &str)> = registered
        .iter()
        .map(|n| (n.name.as_str(), n.namespace.as_str()))
        .collect();

    let mut errors = Vec::new();
    let mut reported = BTreeSet::new();
    for node in &template.nodes {
        let key = (node.node_name.as_str(), node.namespace.as_str());
        if !registered_set.contains(&key) && reported.insert(key) {
            errors.push(format!(
                "Node {} in namespace {} does not exist.",
                node.node_name, node.namespace
            ));
        }
    }
    errors
}

/// Every secret required by any referenced registered node must be present
/// in the template's secrets map.
async fn verify_secrets(template: &GraphTemplate, registered: &[RegisteredNode]) -> Vec<String> {
    let mut required: BTreeSet<&str> = BTreeSet::new();
    for node in registered {
        if let Some(secrets) = &node.secrets {
            required.extend(secrets.iter().map(String::as_str));
        }
    }

    required
        .into_iter()
        .filter(|name| !template.secrets.contains_key(*name))
        .map(|name| format!("Secret {name} is required but not present in the graph template"))
        .collect()
}

/// Every declared input must be present and string-typed, and every
/// placeholder must point at a template-local node whose registered node
/// declares the referenced field as a string output.
async fn verify_inputs(template: &GraphTemplate, registered: &[RegisteredNode]) -> Vec<String> {
    let lookup: BTreeMap<(&str, &str), &RegisteredNode> = registered
        .iter()
        .map(|n| ((n.name.as_str(), n.namespace.as_str()), n))
        .collect();

    let mut errors = Vec::new();
    for node in &template.nodes {
        let Some(registered_node) = lookup.get(&(node.node_name.as_str(), node.namespace.as_str()))
        else {
            // Reported by the existence check.
            continue;
        };

        for input_name in registered_node.inputs_schema.field_names() {
            if !registered_node.inputs_schema.is_string_field(input_name) {
                errors.push(format!(
                    "Input {input_name} in node {} in namespace {} is not a string",
                    node.node_name, node.namespace
                ));
                continue;
            }
            if !node.inputs.contains_key(input_name) {
                errors.push(format!(
                    "Input {input_name} in node {} in namespace {} is not present in the graph template",
                    node.node_name, node.namespace
                ));
            }
        }

        let dependent_strings = match node.dependent_strings() {
            Ok(parsed) => parsed,
            Err(e) => {
                errors.push(format!(
                    "Node {} in namespace {} has a malformed input: {e}",
                    node.node_name, node.namespace
                ));
                continue;
            }
        };

        for dependent_string in dependent_strings {
            for (identifier, field) in dependent_string.identifier_fields() {
                if identifier == trellis_core::STORE_IDENTIFIER {
                    // Store keys are run-scoped; nothing to check statically.
                    continue;
                }

                let Some(target) = template.node_by_identifier(&identifier) else {
                    errors.push(format!(
                        "Node {identifier} does not exist in the graph template"
                    ));
                    continue;
                };

                let Some(target_registered) =
                    lookup.get(&(target.node_name.as_str(), target.namespace.as_str()))
                else {
                    errors.push(format!(
                        "Node {} in namespace {} does not exist",
                        target.node_name, target.namespace
                    ));
                    continue;
                };

                if !target_registered.outputs_schema.has_field(&field) {
                    errors.push(format!(
                        "Field {field} in node {} in namespace {} does not exist",
                        target.node_name, target.namespace
                    ));
                    continue;
                }
                if !target_registered.outputs_schema.is_string_field(&field) {
                    errors.push(format!(
                        "Field {field} in node {} in namespace {} is not a string",
                        target.node_name, target.namespace
                    ));
                }
            }
        }
    }
    errors
}

/// Poll until the template is VALID, with 1-second granularity and a hard
/// ceiling of `timeout`. INVALID templates fail fast.
pub async fn wait_until_valid(
    storage: &Storage,
    namespace: &str,
    graph: &str,
    timeout: Duration,
) -> Result<GraphTemplate, WaitError> {
    let started = tokio::time::Instant::now();
    loop {
        let template = storage
            .get_graph_template(namespace, graph)
            .await?
            .ok_or_else(|| WaitError::NotFound {
                namespace: namespace.to_string(),
                graph: graph.to_string(),
            })?;

        match template.validation_status {
            ValidationStatus::Valid => return Ok(template),
            ValidationStatus::Invalid => {
                return Err(WaitError::Invalid {
                    namespace: namespace.to_string(),
                    graph: graph.to_string(),
                    errors: template.validation_errors,
                })
            }
            ValidationStatus::Pending => {}
        }

        if started.elapsed() > timeout {
            return Err(WaitError::Timeout {
                namespace: namespace.to_string(),
                graph: graph.to_string(),
                secs: timeout.as_secs(),
            });
        }
        tokio::time::sleep(VALIDITY_POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use tempfile::TempDir;
    use trellis_core::{NodeSchema, NodeTemplate, RetryPolicy};

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

    fn registered(
        name: &str,
        inputs: &[&str],
        outputs: &[&str],
        secrets: &[&str],
    ) -> RegisteredNode {
        let now = Utc::now();
        RegisteredNode {
            namespace: "ns".to_string(),
            name: name.to_string(),
            inputs_schema: NodeSchema::strings(inputs.iter().copied()),
            outputs_schema: NodeSchema::strings(outputs.iter().copied()),
            secrets: if secrets.is_empty() {
                None
            } else {
                Some(secrets.iter().map(|s| (*s).to_string()).collect())
            },
            retry_policy: RetryPolicy::default(),
            created_at: now,
            updated_at: now,
        }
    }

    fn node_template(
        identifier: &str,
        node_name: &str,
        inputs: &[(&str, &str)],
        next_nodes: &[&str],
    ) -> NodeTemplate {
        NodeTemplate {
            node_name: node_name.to_string(),
            namespace: "ns".to_string(),
            identifier: identifier.to_string(),
            inputs: inputs
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            next_nodes: next_nodes.iter().map(|s| (*s).to_string()).collect(),
            unites: None,
        }
    }

    fn template(nodes: Vec<NodeTemplate>, secrets: &[(&str, &str)]) -> GraphTemplate {
        let now = Utc::now();
        GraphTemplate {
            namespace: "ns".to_string(),
            name: "graph".to_string(),
            nodes,
            secrets: secrets
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            store_config: None,
            validation_status: ValidationStatus::Pending,
            validation_errors: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    async fn verify_and_fetch(env: &TestEnv, template: GraphTemplate) -> GraphTemplate {
        env.storage.upsert_graph_template(&template).await.unwrap();
        verify_graph(Arc::clone(&env.storage), template).await;
        env.storage
            .get_graph_template("ns", "graph")
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn valid_graph_is_marked_valid() {
        let env = create_env().await;
        env.storage
            .upsert_registered_node(&registered("a_node", &[], &["msg"], &[]))
            .await
            .unwrap();
        env.storage
            .upsert_registered_node(&registered("b_node", &["x"], &[], &[]))
            .await
            .unwrap();

        let t = template(
            vec![
                node_template("a", "a_node", &[], &["b"]),
                node_template("b", "b_node", &[("x", "hi ${{ a.outputs.msg }}")], &[]),
            ],
            &[],
        );
        let stored = verify_and_fetch(&env, t).await;
        assert_eq!(stored.validation_status, ValidationStatus::Valid);
        assert!(stored.validation_errors.is_empty());
    }

    #[tokio::test]
    async fn unregistered_node_is_reported() {
        let env = create_env().await;
        let t = template(vec![node_template("a", "ghost_node", &[], &[])], &[]);
        let stored = verify_and_fetch(&env, t).await;
        assert_eq!(stored.validation_status, ValidationStatus::Invalid);
        assert!(stored.validation_errors.iter().any(
            |e| e.contains("Node ghost_node in namespace ns does not exist")
        ));
    }

    #[tokio::test]
    async fn missing_secret_is_reported() {
        let env = create_env().await;
        env.storage
            .upsert_registered_node(&registered("a_node", &[], &[], &["API_KEY", "TOKEN"]))
            .await
            .unwrap();

        let t = template(
            vec![node_template("a", "a_node", &[], &[])],
            &[("API_KEY", "sealed")],
        );
        let stored = verify_and_fetch(&env, t).await;
        assert_eq!(stored.validation_status, ValidationStatus::Invalid);
        assert_eq!(
            stored.validation_errors,
            vec!["Secret TOKEN is required but not present in the graph template".to_string()]
        );
    }

    #[tokio::test]
    async fn missing_input_is_reported() {
        let env = create_env().await;
        env.storage
            .upsert_registered_node(&registered("a_node", &["x", "y"], &[], &[]))
            .await
            .unwrap();

        let t = template(vec![node_template("a", "a_node", &[("x", "1")], &[])], &[]);
        let stored = verify_and_fetch(&env, t).await;
        assert_eq!(stored.validation_status, ValidationStatus::Invalid);
        assert!(stored
            .validation_errors
            .iter()
            .any(|e| e.contains("Input y in node a_node in namespace ns is not present")));
    }

    #[tokio::test]
    async fn placeholder_to_unknown_output_field_is_reported() {
        let env = create_env().await;
        env.storage
            .upsert_registered_node(&registered("a_node", &[], &["msg"], &[]))
            .await
            .unwrap();
        env.storage
            .upsert_registered_node(&registered("b_node", &["x"], &[], &[]))
            .await
            .unwrap();

        let t = template(
            vec![
                node_template("a", "a_node", &[], &["b"]),
                node_template("b", "b_node", &[("x", "${{ a.outputs.missing }}")], &[]),
            ],
            &[],
        );
        let stored = verify_and_fetch(&env, t).await;
        assert_eq!(stored.validation_status, ValidationStatus::Invalid);
        assert!(stored.validation_errors.iter().any(
            |e| e.contains("Field missing in node a_node in namespace ns does not exist")
        ));
    }

    #[tokio::test]
    async fn placeholder_to_unknown_identifier_is_reported() {
        let env = create_env().await;
        env.storage
            .upsert_registered_node(&registered("b_node", &["x"], &[], &[]))
            .await
            .unwrap();

        let t = template(
            vec![node_template("b", "b_node", &[("x", "${{ ghost.outputs.f }}")], &[])],
            &[],
        );
        let stored = verify_and_fetch(&env, t).await;
        assert!(stored
            .validation_errors
            .iter()
            .any(|e| e.contains("Node ghost does not exist in the graph template")));
    }

    #[tokio::test]
    async fn errors_aggregate_across_checks() {
        let env = create_env().await;
        env.storage
            .upsert_registered_node(&registered("b_node", &["x"], &[], &["TOKEN"]))
            .await
            .unwrap();

        let t = template(
            vec![
                node_template("a", "ghost_node", &[], &[]),
                node_template("b", "b_node", &[], &[]),
            ],
            &[],
        );
        let stored = verify_and_fetch(&env, t).await;
        assert_eq!(stored.validation_status, ValidationStatus::Invalid);
        // One existence error, one secret error, one missing input error.
        assert_eq!(stored.validation_errors.len(), 3, "{:?}", stored.validation_errors);
    }

    #[tokio::test]
    async fn wait_until_valid_returns_valid_template() {
        let env = create_env().await;
        let mut t = template(Vec::new(), &[]);
        t.validation_status = ValidationStatus::Valid;
        env.storage.upsert_graph_template(&t).await.unwrap();

        let got = wait_until_valid(&env.storage, "ns", "graph", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(got.validation_status, ValidationStatus::Valid);
    }

    #[tokio::test]
    async fn wait_until_valid_fails_fast_on_invalid() {
        let env = create_env().await;
        let mut t = template(Vec::new(), &[]);
        t.validation_status = ValidationStatus::Invalid;
        t.validation_errors = vec!["bad".to_string()];
        env.storage.upsert_graph_template(&t).await.unwrap();

        let err = wait_until_valid(&env.storage, "ns", "graph", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, WaitError::Invalid { .. }));
    }

    #[tokio::test]
    async fn wait_until_valid_errors_on_missing_template() {
        let env = create_env().await;
        let err = wait_until_valid(&env.storage, "ns", "ghost", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, WaitError::NotFound { .. }));
    }

    #[tokio::test]
    async fn wait_until_valid_times_out_on_pending() {
        let env = create_env().await;
        let t = template(Vec::new(), &[]);
        env.storage.upsert_graph_template(&t).await.unwrap();

        let err = wait_until_valid(&env.storage, "ns", "graph", Duration::from_secs(3))
            .await
            .unwrap_err();
        assert!(matches!(err, WaitError::Timeout { secs: 3, .. }));
    }
}
