//! Placeholder resolution.
//!
//! Turns template input strings into concrete values by threading ancestor
//! outputs (looked up through the state's `parents` map) and run-store
//! entries into `${{ … }}` slots. Used at lease time for the state being
//! handed out, and at fanout time for the successors being built; in the
//! fanout case the committing node's outputs come from the in-flight
//! output map rather than from storage.

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;
use trellis_core::{DependentString, Id, State};

use crate::storage::{Storage, StorageError};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("invalid input placeholder for field {field}: {source}")]
    Parse {
        field: String,
        source: trellis_core::ParseError,
    },
    #[error("parent identifier '{identifier}' not found in state parents")]
    ParentNotFound { identifier: String },
    #[error("dependent state {identifier} ({state_id}) not found")]
    StateNotFound { identifier: String, state_id: Id },
    #[error("output field {field} not found in dependent state {identifier}")]
    OutputFieldNotFound { identifier: String, field: String },
    #[error("store key {key} not found for run {run_id}")]
    StoreKeyNotFound { key: String, run_id: String },
    #[error("storage error during resolution: {0}")]
    Storage(#[from] StorageError),
}

/// One resolution pass over a set of input strings. Caches dependent-state
/// lookups for its lifetime (one lease item or one fanout task).
pub struct Resolver<'a> {
    storage: &'a Storage,
    run_id: &'a str,
    namespace: &'a str,
    graph_name: &'a str,
    /// Outputs of the committing node, keyed by its identifier; consulted
    /// before storage so fan-out-by-data sees the right output map.
    override_outputs: Option<(&'a str, &'a BTreeMap<String, String>)>,
    cache: HashMap<Id, State>,
}

impl<'a> Resolver<'a> {
    pub fn new(storage: &'a Storage, run_id: &'a str, namespace: &'a str, graph_name: &'a str) -> Self {
        Self {
            storage,
            run_id,
            namespace,
            graph_name,
            override_outputs: None,
            cache: HashMap::new(),
        }
    }

    /// Use `outputs` for placeholders referring to `identifier` instead of
    /// that state's persisted outputs.
    pub fn with_override(
        mut self,
        identifier: &'a str,
        outputs: &'a BTreeMap<String, String>,
    ) -> Self {
        self.override_outputs = Some((identifier, outputs));
        self
    }

    /// Resolve one input value against `parents`.
    pub async fn resolve_value(
        &mut self,
        field: &str,
        raw: &str,
        parents: &BTreeMap<String, Id>,
    ) -> Result<String, ResolveError> {
        let mut parsed = DependentString::parse(raw).map_err(|source| ResolveError::Parse {
            field: field.to_string(),
            source,
        })?;
        if parsed.is_literal() {
            return Ok(raw.to_string());
        }

        for (identifier, field) in parsed.identifier_fields() {
            let value = self.lookup(&identifier, &field, parents).await?;
            parsed.set_value(&identifier, &field, &value);
        }

        // Every slot was just filled; render cannot report an unfilled one.
        parsed
            .render()
            .map_err(|e| ResolveError::OutputFieldNotFound {
                identifier: e.identifier,
                field: e.field,
            })
    }

    /// Resolve a whole input map in place.
    pub async fn resolve_inputs(
        &mut self,
        inputs: &BTreeMap<String, String>,
        parents: &BTreeMap<String, Id>,
    ) -> Result<BTreeMap<String, String>, ResolveError> {
        let mut resolved = BTreeMap::new();
        for (field, raw) in inputs {
            let value = self.resolve_value(field, raw, parents).await?;
            resolved.insert(field.clone(), value);
        }
        Ok(resolved)
    }

    async fn lookup(
        &mut self,
        identifier: &str,
        field: &str,
        parents: &BTreeMap<String, Id>,
    ) -> Result<String, ResolveError> {
        if identifier == trellis_core::STORE_IDENTIFIER {
            return self
                .storage
                .get_store_value(self.run_id, self.namespace, self.graph_name, field)
                .await?
                .ok_or_else(|| ResolveError::StoreKeyNotFound {
                    key: field.to_string(),
                    run_id: self.run_id.to_string(),
                });
        }

        if let Some((override_identifier, outputs)) = self.override_outputs {
            if override_identifier == identifier {
                return outputs.get(field).cloned().ok_or_else(|| {
                    ResolveError::OutputFieldNotFound {
                        identifier: identifier.to_string(),
                        field: field.to_string(),
                    }
                });
            }
        }

        let state_id = parents
            .get(identifier)
            .ok_or_else(|| ResolveError::ParentNotFound {
                identifier: identifier.to_string(),
            })?
            .clone();

        if !self.cache.contains_key(&state_id) {
            let state = self.storage.get_state(&state_id).await?.ok_or_else(|| {
                ResolveError::StateNotFound {
                    identifier: identifier.to_string(),
                    state_id: state_id.clone(),
                }
            })?;
            self.cache.insert(state_id.clone(), state);
        }

        let state = &self.cache[&state_id];
        state
            .outputs
            .get(field)
            .cloned()
            .ok_or_else(|| ResolveError::OutputFieldNotFound {
                identifier: identifier.to_string(),
                field: field.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use trellis_core::StateStatus;

    struct TestEnv {
        storage: Storage,
        _dir: TempDir,
    }

    async fn create_env() -> TestEnv {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(&dir.path().join("test.db")).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        TestEnv {
            storage,
            _dir: dir,
        }
    }

    async fn insert_parent(env: &TestEnv, id: &str, outputs: &[(&str, &str)]) -> Id {
        let state_id = Id::from_string(id);
        let mut state = State::created(
            state_id.clone(),
            "run-1",
            "ns",
            "graph",
            "a",
            "a_node",
            BTreeMap::new(),
            BTreeMap::from([("a".to_string(), state_id.clone())]),
        );
        state.status = StateStatus::Success;
        state.outputs = outputs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        env.storage.insert_states(&[state]).await.unwrap();
        state_id
    }

    #[tokio::test]
    async fn literal_values_pass_through() {
        let env = create_env().await;
        let mut resolver = Resolver::new(&env.storage, "run-1", "ns", "graph");
        let out = resolver
            .resolve_value("x", "plain", &BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(out, "plain");
    }

    #[tokio::test]
    async fn resolves_parent_outputs_via_parents_map() {
        let env = create_env().await;
        let parent_id = insert_parent(&env, "s-a", &[("msg", "there")]).await;
        let parents = BTreeMap::from([("a".to_string(), parent_id)]);

        let mut resolver = Resolver::new(&env.storage, "run-1", "ns", "graph");
        let out = resolver
            .resolve_value("x", "hi ${{ a.outputs.msg }}", &parents)
            .await
            .unwrap();
        assert_eq!(out, "hi there");
    }

    #[tokio::test]
    async fn resolves_store_keys() {
        let env = create_env().await;
        env.storage
            .upsert_store_value("run-1", "ns", "graph", "region", "eu-west-1")
            .await
            .unwrap();

        let mut resolver = Resolver::new(&env.storage, "run-1", "ns", "graph");
        let out = resolver
            .resolve_value("x", "${{ store.region }}/bucket", &BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(out, "eu-west-1/bucket");
    }

    #[tokio::test]
    async fn override_outputs_shadow_persisted_outputs() {
        let env = create_env().await;
        let parent_id = insert_parent(&env, "s-a", &[("k", "persisted")]).await;
        let parents = BTreeMap::from([("a".to_string(), parent_id)]);
        let current = BTreeMap::from([("k".to_string(), "in-flight".to_string())]);

        let mut resolver =
            Resolver::new(&env.storage, "run-1", "ns", "graph").with_override("a", &current);
        let out = resolver
            .resolve_value("x", "${{ a.outputs.k }}", &parents)
            .await
            .unwrap();
        assert_eq!(out, "in-flight");
    }

    #[tokio::test]
    async fn missing_parent_identifier_fails() {
        let env = create_env().await;
        let mut resolver = Resolver::new(&env.storage, "run-1", "ns", "graph");
        let err = resolver
            .resolve_value("x", "${{ ghost.outputs.f }}", &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::ParentNotFound { .. }));
    }

    #[tokio::test]
    async fn missing_output_field_fails() {
        let env = create_env().await;
        let parent_id = insert_parent(&env, "s-a", &[("msg", "v")]).await;
        let parents = BTreeMap::from([("a".to_string(), parent_id)]);

        let mut resolver = Resolver::new(&env.storage, "run-1", "ns", "graph");
        let err = resolver
            .resolve_value("x", "${{ a.outputs.other }}", &parents)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::OutputFieldNotFound { .. }));
    }

    #[tokio::test]
    async fn missing_store_key_fails() {
        let env = create_env().await;
        let mut resolver = Resolver::new(&env.storage, "run-1", "ns", "graph");
        let err = resolver
            .resolve_value("x", "${{ store.ghost }}", &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::StoreKeyNotFound { .. }));
    }

    #[tokio::test]
    async fn malformed_placeholder_fails_with_field() {
        let env = create_env().await;
        let mut resolver = Resolver::new(&env.storage, "run-1", "ns", "graph");
        let err = resolver
            .resolve_value("x", "${{ a.f }}", &BTreeMap::new())
            .await
            .unwrap_err();
        match err {
            ResolveError::Parse { field, .. } => assert_eq!(field, "x"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn resolve_inputs_handles_mixed_maps() {
        let env = create_env().await;
        let parent_id = insert_parent(&env, "s-a", &[("msg", "there")]).await;
        env.storage
            .upsert_store_value("run-1", "ns", "graph", "k", "stored")
            .await
            .unwrap();
        let parents = BTreeMap::from([("a".to_string(), parent_id)]);

        let inputs = BTreeMap::from([
            ("plain".to_string(), "value".to_string()),
            ("dep".to_string(), "hi ${{ a.outputs.msg }}".to_string()),
            ("store".to_string(), "${{ store.k }}".to_string()),
        ]);

        let mut resolver = Resolver::new(&env.storage, "run-1", "ns", "graph");
        let resolved = resolver.resolve_inputs(&inputs, &parents).await.unwrap();
        assert_eq!(resolved.get("plain").map(String::as_str), Some("value"));
        assert_eq!(resolved.get("dep").map(String::as_str), Some("hi there"));
        assert_eq!(resolved.get("store").map(String::as_str), Some("stored"));
    }
}
