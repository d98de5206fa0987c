//! SQLite storage for the state manager.
//!
//! Persists registered nodes, graph templates, states, and run-store
//! entries. Every lifecycle transition is a conditional update keyed on
//! the current status; callers learn from the returned flag whether their
//! compare-and-set won. The canonical-joiner claim additionally leans on
//! the partial unique index over `(run_id, state_fingerprint)`.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use thiserror::Error;
use trellis_core::{
    GraphTemplate, Id, NodeSchema, NodeTemplate, RegisteredNode, RetryPolicy, State, StateStatus,
    StoreConfig, ValidationStatus,
};

/// Explicit column list for state queries. Explicit columns keep row
/// mapping correct regardless of column order after ALTER TABLE.
const STATE_COLUMNS: &str = "id, run_id, namespace_name, graph_name, identifier, node_name, \
    status, inputs, outputs, error, parents, does_unites, state_fingerprint, retry_count, \
    created_at, updated_at";

const GRAPH_COLUMNS: &str = "namespace, name, nodes, secrets, store_config, validation_status, \
    validation_errors, created_at, updated_at";

const NODE_COLUMNS: &str =
    "namespace, name, inputs_schema, outputs_schema, secrets, retry_policy, created_at, updated_at";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt row in {table}: {reason}")]
    Corrupt { table: String, reason: String },
}

pub type Result<T> = std::result::Result<T, StorageError>;

fn corrupt(table: &str, reason: impl Into<String>) -> StorageError {
    StorageError::Corrupt {
        table: table.to_string(),
        reason: reason.into(),
    }
}

/// Whether a database error is a unique-constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.message().contains("UNIQUE constraint failed"))
}

fn millis_to_datetime(table: &str, millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| corrupt(table, format!("bad timestamp {millis}")))
}

/// Storage backend for the daemon.
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").finish_non_exhaustive()
    }
}

impl Storage {
    /// Open (creating if needed) the database at `db_path`.
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// Run the embedded migrations.
    pub async fn migrate_embedded(&self) -> Result<()> {
        let migrations = [include_str!("../../../migrations/0001_init.sql")];

        for migration_sql in migrations {
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if let Err(e) = sqlx::query(trimmed).execute(&self.pool).await {
                    let msg = e.to_string();
                    if !msg.contains("duplicate column") && !msg.contains("already exists") {
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(())
    }

    // --- Registered nodes ---

    /// Idempotent upsert keyed on `(namespace, name)`. Re-registration
    /// replaces schemas, secrets, and retry policy.
    pub async fn upsert_registered_node(&self, node: &RegisteredNode) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO registered_nodes (namespace, name, inputs_schema, outputs_schema,
                                          secrets, retry_policy, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT (namespace, name) DO UPDATE SET
                inputs_schema = excluded.inputs_schema,
                outputs_schema = excluded.outputs_schema,
                secrets = excluded.secrets,
                retry_policy = excluded.retry_policy,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&node.namespace)
        .bind(&node.name)
        .bind(serde_json::to_string(&node.inputs_schema)?)
        .bind(serde_json::to_string(&node.outputs_schema)?)
        .bind(
            node.secrets
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(serde_json::to_string(&node.retry_policy)?)
        .bind(node.created_at.timestamp_millis())
        .bind(node.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_registered_node(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<RegisteredNode>> {
        let query =
            format!("SELECT {NODE_COLUMNS} FROM registered_nodes WHERE namespace = ?1 AND name = ?2");
        let row = sqlx::query_as::<_, RegisteredNodeRow>(&query)
            .bind(namespace)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(RegisteredNodeRow::into_node).transpose()
    }

    /// Batched lookup for the validator: one fetch per distinct
    /// `(namespace, node_name)` pair referenced by the templates.
    pub async fn registered_nodes_for(
        &self,
        templates: &[NodeTemplate],
    ) -> Result<Vec<RegisteredNode>> {
        let mut keys: Vec<(&str, &str)> = templates
            .iter()
            .map(|t| (t.namespace.as_str(), t.node_name.as_str()))
            .collect();
        keys.sort_unstable();
        keys.dedup();

        let mut nodes = Vec::with_capacity(keys.len());
        for (namespace, name) in keys {
            if let Some(node) = self.get_registered_node(namespace, name).await? {
                nodes.push(node);
            }
        }
        Ok(nodes)
    }

    // --- Graph templates ---

    pub async fn upsert_graph_template(&self, template: &GraphTemplate) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO graph_templates (namespace, name, nodes, secrets, store_config,
                                         validation_status, validation_errors, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT (namespace, name) DO UPDATE SET
                nodes = excluded.nodes,
                secrets = excluded.secrets,
                store_config = excluded.store_config,
                validation_status = excluded.validation_status,
                validation_errors = excluded.validation_errors,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&template.namespace)
        .bind(&template.name)
        .bind(serde_json::to_string(&template.nodes)?)
        .bind(serde_json::to_string(&template.secrets)?)
        .bind(
            template
                .store_config
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(template.validation_status.as_str())
        .bind(serde_json::to_string(&template.validation_errors)?)
        .bind(template.created_at.timestamp_millis())
        .bind(template.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_graph_template(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<GraphTemplate>> {
        let query =
            format!("SELECT {GRAPH_COLUMNS} FROM graph_templates WHERE namespace = ?1 AND name = ?2");
        let row = sqlx::query_as::<_, GraphTemplateRow>(&query)
            .bind(namespace)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(GraphTemplateRow::into_template).transpose()
    }

    pub async fn list_graph_templates(&self, namespace: &str) -> Result<Vec<GraphTemplate>> {
        let query = format!(
            "SELECT {GRAPH_COLUMNS} FROM graph_templates WHERE namespace = ?1 ORDER BY name"
        );
        let rows = sqlx::query_as::<_, GraphTemplateRow>(&query)
            .bind(namespace)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(GraphTemplateRow::into_template).collect()
    }

    pub async fn set_graph_validation(
        &self,
        namespace: &str,
        name: &str,
        status: ValidationStatus,
        errors: &[String],
    ) -> Result<()> {
        sqlx::query(
            "UPDATE graph_templates SET validation_status = ?1, validation_errors = ?2, \
             updated_at = ?3 WHERE namespace = ?4 AND name = ?5",
        )
        .bind(status.as_str())
        .bind(serde_json::to_string(errors)?)
        .bind(Utc::now().timestamp_millis())
        .bind(namespace)
        .bind(name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // --- States ---

    /// Insert a batch of states in one transaction.
    pub async fn insert_states(&self, states: &[State]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for state in states {
            sqlx::query(
                r#"
                INSERT INTO states (id, run_id, namespace_name, graph_name, identifier, node_name,
                                    status, inputs, outputs, error, parents, does_unites,
                                    state_fingerprint, retry_count, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
                "#,
            )
            .bind(state.id.as_ref())
            .bind(&state.run_id)
            .bind(&state.namespace_name)
            .bind(&state.graph_name)
            .bind(&state.identifier)
            .bind(&state.node_name)
            .bind(state.status.as_str())
            .bind(serde_json::to_string(&state.inputs)?)
            .bind(serde_json::to_string(&state.outputs)?)
            .bind(&state.error)
            .bind(serde_json::to_string(&state.parents)?)
            .bind(i64::from(state.does_unites))
            .bind(&state.state_fingerprint)
            .bind(i64::from(state.retry_count))
            .bind(state.created_at.timestamp_millis())
            .bind(state.updated_at.timestamp_millis())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_state(&self, id: &Id) -> Result<Option<State>> {
        let query = format!("SELECT {STATE_COLUMNS} FROM states WHERE id = ?1");
        let row = sqlx::query_as::<_, StateRow>(&query)
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?;
        row.map(StateRow::into_state).transpose()
    }

    /// All states of one run, oldest first.
    pub async fn list_run_states(&self, run_id: &str) -> Result<Vec<State>> {
        let query =
            format!("SELECT {STATE_COLUMNS} FROM states WHERE run_id = ?1 ORDER BY created_at, id");
        let rows = sqlx::query_as::<_, StateRow>(&query)
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(StateRow::into_state).collect()
    }

    /// CREATED states for one `(namespace, node_name)` routing key, oldest
    /// first, capped at `limit`.
    pub async fn lease_candidates(
        &self,
        namespace: &str,
        node_name: &str,
        limit: u32,
    ) -> Result<Vec<State>> {
        let query = format!(
            "SELECT {STATE_COLUMNS} FROM states \
             WHERE namespace_name = ?1 AND node_name = ?2 AND status = 'CREATED' \
             ORDER BY created_at, id LIMIT ?3"
        );
        let rows = sqlx::query_as::<_, StateRow>(&query)
            .bind(namespace)
            .bind(node_name)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(StateRow::into_state).collect()
    }

    /// QUEUED states last touched before `cutoff`.
    pub async fn stale_queued_states(&self, cutoff: DateTime<Utc>) -> Result<Vec<State>> {
        let query = format!(
            "SELECT {STATE_COLUMNS} FROM states WHERE status = 'QUEUED' AND updated_at < ?1"
        );
        let rows = sqlx::query_as::<_, StateRow>(&query)
            .bind(cutoff.timestamp_millis())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(StateRow::into_state).collect()
    }

    /// Generic status compare-and-set. Returns whether this caller won.
    pub async fn set_status_from(
        &self,
        id: &Id,
        from: StateStatus,
        to: StateStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE states SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
        )
        .bind(to.as_str())
        .bind(Utc::now().timestamp_millis())
        .bind(id.as_ref())
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Lease flip: `CREATED -> QUEUED`, persisting the resolved inputs.
    pub async fn mark_queued(&self, id: &Id, inputs: &BTreeMap<String, String>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE states SET status = 'QUEUED', inputs = ?1, updated_at = ?2 \
             WHERE id = ?3 AND status = 'CREATED'",
        )
        .bind(serde_json::to_string(inputs)?)
        .bind(Utc::now().timestamp_millis())
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Executed commit: `QUEUED -> EXECUTED` with the first output map.
    pub async fn mark_executed(
        &self,
        id: &Id,
        outputs: &BTreeMap<String, String>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE states SET status = 'EXECUTED', outputs = ?1, updated_at = ?2 \
             WHERE id = ?3 AND status = 'QUEUED'",
        )
        .bind(serde_json::to_string(outputs)?)
        .bind(Utc::now().timestamp_millis())
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Record a failure: transition from `from` to ERRORED with a message.
    pub async fn mark_errored_from(
        &self,
        id: &Id,
        from: StateStatus,
        error: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE states SET status = 'ERRORED', error = ?1, updated_at = ?2 \
             WHERE id = ?3 AND status = ?4",
        )
        .bind(error)
        .bind(Utc::now().timestamp_millis())
        .bind(id.as_ref())
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Fanout failure terminal: `EXECUTED -> NEXT_CREATED_ERROR`.
    pub async fn mark_next_created_error(&self, id: &Id, error: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE states SET status = 'NEXT_CREATED_ERROR', error = ?1, updated_at = ?2 \
             WHERE id = ?3 AND status = 'EXECUTED'",
        )
        .bind(error)
        .bind(Utc::now().timestamp_millis())
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Retry re-creation: `ERRORED -> CREATED`, consuming one retry and
    /// clearing the error. Inputs and parents are preserved. The guard on
    /// `retry_count` keeps it within the policy's budget.
    pub async fn mark_retry_created(&self, id: &Id, max_retries: u32) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE states SET status = 'CREATED', error = NULL, retry_count = retry_count + 1, \
             updated_at = ?1 WHERE id = ?2 AND status = 'ERRORED' AND retry_count < ?3",
        )
        .bind(Utc::now().timestamp_millis())
        .bind(id.as_ref())
        .bind(i64::from(max_retries))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Reaper re-creation: `QUEUED -> CREATED`, consuming one retry.
    pub async fn mark_reaped(&self, id: &Id) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE states SET status = 'CREATED', retry_count = retry_count + 1, \
             updated_at = ?1 WHERE id = ?2 AND status = 'QUEUED'",
        )
        .bind(Utc::now().timestamp_millis())
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Claim the canonical-joiner slot for a join point. The partial
    /// unique index over `(run_id, state_fingerprint)` turns a lost race
    /// into a unique violation, reported as `Ok(false)`.
    pub async fn claim_canonical_joiner(&self, id: &Id, fingerprint: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE states SET does_unites = 1, state_fingerprint = ?1, updated_at = ?2 \
             WHERE id = ?3 AND status = 'CREATED'",
        )
        .bind(fingerprint)
        .bind(Utc::now().timestamp_millis())
        .bind(id.as_ref())
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => Ok(done.rows_affected() > 0),
            Err(e) if is_unique_violation(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    // --- Run store ---

    /// Upsert one run-store entry; writes are last-writer-wins.
    pub async fn upsert_store_value(
        &self,
        run_id: &str,
        namespace: &str,
        graph_name: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        sqlx::query(
            r#"
            INSERT INTO store_entries (run_id, namespace, graph_name, key, value, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT (run_id, namespace, graph_name, key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(run_id)
        .bind(namespace)
        .bind(graph_name)
        .bind(key)
        .bind(value)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_store_value(
        &self,
        run_id: &str,
        namespace: &str,
        graph_name: &str,
        key: &str,
    ) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT value FROM store_entries \
             WHERE run_id = ?1 AND namespace = ?2 AND graph_name = ?3 AND key = ?4",
        )
        .bind(run_id)
        .bind(namespace)
        .bind(graph_name)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(value,)| value))
    }
}

// --- Row mapping ---

#[derive(sqlx::FromRow)]
struct RegisteredNodeRow {
    namespace: String,
    name: String,
    inputs_schema: String,
    outputs_schema: String,
    secrets: Option<String>,
    retry_policy: String,
    created_at: i64,
    updated_at: i64,
}

impl RegisteredNodeRow {
    fn into_node(self) -> Result<RegisteredNode> {
        const TABLE: &str = "registered_nodes";
        let inputs_schema: NodeSchema = serde_json::from_str(&self.inputs_schema)?;
        let outputs_schema: NodeSchema = serde_json::from_str(&self.outputs_schema)?;
        let secrets: Option<Vec<String>> = self
            .secrets
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        let retry_policy: RetryPolicy = serde_json::from_str(&self.retry_policy)?;
        Ok(RegisteredNode {
            namespace: self.namespace,
            name: self.name,
            inputs_schema,
            outputs_schema,
            secrets,
            retry_policy,
            created_at: millis_to_datetime(TABLE, self.created_at)?,
            updated_at: millis_to_datetime(TABLE, self.updated_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct GraphTemplateRow {
    namespace: String,
    name: String,
    nodes: String,
    secrets: String,
    store_config: Option<String>,
    validation_status: String,
    validation_errors: String,
    created_at: i64,
    updated_at: i64,
}

impl GraphTemplateRow {
    fn into_template(self) -> Result<GraphTemplate> {
        const TABLE: &str = "graph_templates";
        let nodes: Vec<NodeTemplate> = serde_json::from_str(&self.nodes)?;
        let secrets: BTreeMap<String, String> = serde_json::from_str(&self.secrets)?;
        let store_config: Option<StoreConfig> = self
            .store_config
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        let validation_status = ValidationStatus::from_str(&self.validation_status)
            .ok_or_else(|| corrupt(TABLE, format!("bad status {}", self.validation_status)))?;
        let validation_errors: Vec<String> = serde_json::from_str(&self.validation_errors)?;
        Ok(GraphTemplate {
            namespace: self.namespace,
            name: self.name,
            nodes,
            secrets,
            store_config,
            validation_status,
            validation_errors,
            created_at: millis_to_datetime(TABLE, self.created_at)?,
            updated_at: millis_to_datetime(TABLE, self.updated_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct StateRow {
    id: String,
    run_id: String,
    namespace_name: String,
    graph_name: String,
    identifier: String,
    node_name: String,
    status: String,
    inputs: String,
    outputs: String,
    error: Option<String>,
    parents: String,
    does_unites: i64,
    state_fingerprint: Option<String>,
    retry_count: i64,
    created_at: i64,
    updated_at: i64,
}

impl StateRow {
    fn into_state(self) -> Result<State> {
        const TABLE: &str = "states";
        let status = StateStatus::from_str(&self.status)
            .ok_or_else(|| corrupt(TABLE, format!("bad status {}", self.status)))?;
        let inputs: BTreeMap<String, String> = serde_json::from_str(&self.inputs)?;
        let outputs: BTreeMap<String, String> = serde_json::from_str(&self.outputs)?;
        let parents: BTreeMap<String, Id> = serde_json::from_str(&self.parents)?;
        Ok(State {
            id: Id::from_string(self.id),
            run_id: self.run_id,
            namespace_name: self.namespace_name,
            graph_name: self.graph_name,
            identifier: self.identifier,
            node_name: self.node_name,
            status,
            inputs,
            outputs,
            error: self.error,
            parents,
            does_unites: self.does_unites != 0,
            state_fingerprint: self.state_fingerprint,
            retry_count: self.retry_count as u32,
            created_at: millis_to_datetime(TABLE, self.created_at)?,
            updated_at: millis_to_datetime(TABLE, self.updated_at)?,
        })
    }
}
