//! Core types for the workflow state manager.
//!
//! A [`State`] is one node's execution instance within a run. Its `parents`
//! map records, for every ancestor slot traversed from the graph root down
//! to (and including) the state itself, the id of that slot's instance.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::retry::RetryPolicy;
use crate::schema::NodeSchema;

/// Unique identifier for states.
/// Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Allocate a fresh run id (UUIDv4) for one trigger of one graph.
pub fn new_run_id() -> String {
    Uuid::new_v4().to_string()
}

/// State lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateStatus {
    Created,
    Queued,
    Executed,
    Success,
    Errored,
    NextCreatedError,
}

impl StateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Queued => "QUEUED",
            Self::Executed => "EXECUTED",
            Self::Success => "SUCCESS",
            Self::Errored => "ERRORED",
            Self::NextCreatedError => "NEXT_CREATED_ERROR",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "CREATED" => Some(Self::Created),
            "QUEUED" => Some(Self::Queued),
            "EXECUTED" => Some(Self::Executed),
            "SUCCESS" => Some(Self::Success),
            "ERRORED" => Some(Self::Errored),
            "NEXT_CREATED_ERROR" => Some(Self::NextCreatedError),
            _ => None,
        }
    }

    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::NextCreatedError)
    }
}

/// A named unit of work implemented by an external runtime, registered on
/// runtime handshake with its declared schemas and secret requirements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredNode {
    pub namespace: String,
    pub name: String,
    pub inputs_schema: NodeSchema,
    pub outputs_schema: NodeSchema,
    /// Secret names this node requires the graph template to carry.
    #[serde(default)]
    pub secrets: Option<Vec<String>>,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One node's execution instance within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    pub id: Id,
    pub run_id: String,
    pub namespace_name: String,
    pub graph_name: String,
    /// Node-template slot within the graph this state represents.
    pub identifier: String,
    /// Denormalized from the template at creation time.
    pub node_name: String,
    pub status: StateStatus,
    pub inputs: BTreeMap<String, String>,
    pub outputs: BTreeMap<String, String>,
    pub error: Option<String>,
    /// Ancestor slot identifier -> state id of that slot's instance,
    /// self-inclusive. The map size is the state's depth.
    pub parents: BTreeMap<String, Id>,
    /// Set when this state is the canonical joiner for its join point.
    pub does_unites: bool,
    pub state_fingerprint: Option<String>,
    /// Completed retries so far.
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl State {
    /// Build a fresh CREATED state. `parents` must already include the
    /// state's own identifier entry.
    pub fn created(
        id: Id,
        run_id: impl Into<String>,
        namespace_name: impl Into<String>,
        graph_name: impl Into<String>,
        identifier: impl Into<String>,
        node_name: impl Into<String>,
        inputs: BTreeMap<String, String>,
        parents: BTreeMap<String, Id>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            run_id: run_id.into(),
            namespace_name: namespace_name.into(),
            graph_name: graph_name.into(),
            identifier: identifier.into(),
            node_name: node_name.into(),
            status: StateStatus::Created,
            inputs,
            outputs: BTreeMap::new(),
            error: None,
            parents,
            does_unites: false,
            state_fingerprint: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Depth of this state in the graph projection taken at trigger time.
    pub fn depth(&self) -> usize {
        self.parents.len()
    }

    /// Fingerprint of this state's join point: SHA-256 over the state's
    /// own identifier plus the canonical form of `parents` with every
    /// identifier in `excluded` removed. Entries are sorted by identifier
    /// and joined as `k=v` pairs with `&`.
    ///
    /// `excluded` is the uniting subtree (the uniting identifier plus its
    /// template-DAG descendants, which covers the state's own identifier),
    /// so only ancestry above the join contributes. Sibling joins that
    /// differ only below the uniting node collide deliberately; distinct
    /// join nodes never do, because the identifier prefix separates them.
    pub fn join_fingerprint(&self, excluded: &BTreeSet<String>) -> String {
        let mut hasher = Sha256::new();
        let canonical: Vec<String> = self
            .parents
            .iter()
            .filter(|(identifier, _)| !excluded.contains(identifier.as_str()))
            .map(|(identifier, id)| format!("{identifier}={id}"))
            .collect();
        hasher.update(self.identifier.as_bytes());
        hasher.update(b"|");
        hasher.update(canonical.join("&").as_bytes());
        format!("{:x}", hasher.finalize())
    }
}
