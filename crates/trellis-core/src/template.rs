//! Graph templates.
//!
//! A graph template is a declarative DAG of node-template slots, scoped by
//! `(namespace, name)`. Structural invariants (identifier uniqueness,
//! successor references, store-config key rules) are checked synchronously
//! on upsert; registry-dependent checks run in the asynchronous validator.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::depstr::{DependentString, ParseError, STORE_IDENTIFIER};

/// Fan-in strategy for a unites declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnitesStrategy {
    /// Every sibling branch upstream of the uniting node must be SUCCESS.
    #[default]
    AllSuccess,
    /// Terminally errored branches are acceptable.
    AllDone,
}

impl UnitesStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AllSuccess => "ALL_SUCCESS",
            Self::AllDone => "ALL_DONE",
        }
    }
}

/// Join declaration: an ancestor identifier this node waits on before any
/// sibling copy of it may proceed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unites {
    pub identifier: String,
    #[serde(default)]
    pub strategy: UnitesStrategy,
}

/// One slot within a graph template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTemplate {
    pub node_name: String,
    pub namespace: String,
    /// Unique within the graph template. `store` is reserved.
    pub identifier: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
    #[serde(default)]
    pub next_nodes: Vec<String>,
    #[serde(default)]
    pub unites: Option<Unites>,
}

impl NodeTemplate {
    /// Parse every input value into its dependent-string form.
    pub fn dependent_strings(&self) -> Result<Vec<DependentString>, ParseError> {
        self.inputs.values().map(|v| DependentString::parse(v)).collect()
    }
}

/// Declaration of run-store keys a graph relies on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub required_keys: Vec<String>,
    #[serde(default)]
    pub default_values: BTreeMap<String, String>,
}

impl StoreConfig {
    /// Validate key rules: keys are trimmed and must be non-empty, free of
    /// `.`, and unique. Returns every offence, normalizing keys in place.
    pub fn validate(&mut self) -> Vec<String> {
        let mut errors = Vec::new();

        let mut seen = BTreeSet::new();
        let mut keys = Vec::new();
        for key in &self.required_keys {
            if let Some(normalized) = normalize_key(key, &mut seen, &mut errors) {
                keys.push(normalized);
            }
        }
        self.required_keys = keys;

        let mut seen = BTreeSet::new();
        let mut values = BTreeMap::new();
        for (key, value) in &self.default_values {
            if let Some(normalized) = normalize_key(key, &mut seen, &mut errors) {
                values.insert(normalized, value.clone());
            }
        }
        self.default_values = values;

        errors
    }
}

fn normalize_key(
    key: &str,
    seen: &mut BTreeSet<String>,
    errors: &mut Vec<String>,
) -> Option<String> {
    let trimmed = key.trim();
    if trimmed.is_empty() {
        errors.push("Key cannot be empty or contain only whitespace".to_string());
        return None;
    }
    if trimmed.contains('.') {
        errors.push(format!("Key '{trimmed}' cannot contain '.' character"));
        return None;
    }
    if !seen.insert(trimmed.to_string()) {
        errors.push(format!("Key '{trimmed}' is duplicated"));
        return None;
    }
    Some(trimmed.to_string())
}

/// Validation lifecycle of a graph template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationStatus {
    #[default]
    Pending,
    Valid,
    Invalid,
}

impl ValidationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Valid => "VALID",
            Self::Invalid => "INVALID",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "VALID" => Some(Self::Valid),
            "INVALID" => Some(Self::Invalid),
            _ => None,
        }
    }
}

/// A stored graph template. Secret values are ciphertext at rest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphTemplate {
    pub namespace: String,
    pub name: String,
    pub nodes: Vec<NodeTemplate>,
    #[serde(default)]
    pub secrets: BTreeMap<String, String>,
    #[serde(default)]
    pub store_config: Option<StoreConfig>,
    #[serde(default)]
    pub validation_status: ValidationStatus,
    #[serde(default)]
    pub validation_errors: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GraphTemplate {
    pub fn node_by_identifier(&self, identifier: &str) -> Option<&NodeTemplate> {
        self.nodes.iter().find(|n| n.identifier == identifier)
    }

    /// Identifiers reachable from `identifier` by following `next_nodes`,
    /// including `identifier` itself. This is the uniting subtree used for
    /// fingerprint canonicalization and the join gate.
    pub fn subtree_identifiers(&self, identifier: &str) -> BTreeSet<String> {
        let mut reached = BTreeSet::new();
        let mut frontier = vec![identifier.to_string()];
        while let Some(current) = frontier.pop() {
            if !reached.insert(current.clone()) {
                continue;
            }
            if let Some(node) = self.node_by_identifier(&current) {
                for next in &node.next_nodes {
                    if !reached.contains(next) {
                        frontier.push(next.clone());
                    }
                }
            }
        }
        reached
    }

    /// Structural validation, independent of the node registry. Aggregates
    /// every offence instead of stopping at the first.
    pub fn validate_structure(&mut self) -> Vec<String> {
        let mut errors = Vec::new();

        let mut identifiers = BTreeSet::new();
        for node in &self.nodes {
            if node.identifier == STORE_IDENTIFIER {
                errors.push(format!(
                    "Node identifier cannot be reserved word '{STORE_IDENTIFIER}'"
                ));
            }
            if node.identifier.trim().is_empty() {
                errors.push(format!(
                    "Node {} in namespace {} has an empty identifier",
                    node.node_name, node.namespace
                ));
            }
            if !identifiers.insert(node.identifier.clone()) {
                errors.push(format!("Node identifier '{}' is duplicated", node.identifier));
            }
        }

        for node in &self.nodes {
            let mut seen_next = BTreeSet::new();
            for next in &node.next_nodes {
                if next.trim().is_empty() {
                    errors.push(format!(
                        "Node '{}' has an empty next_nodes entry",
                        node.identifier
                    ));
                    continue;
                }
                if !seen_next.insert(next.clone()) {
                    errors.push(format!(
                        "Node '{}' lists next node '{next}' more than once",
                        node.identifier
                    ));
                }
                if !identifiers.contains(next) {
                    errors.push(format!(
                        "Node '{}' references unknown next node '{next}'",
                        node.identifier
                    ));
                }
            }
            if let Some(unites) = &node.unites {
                if !identifiers.contains(&unites.identifier) {
                    errors.push(format!(
                        "Node '{}' unites on unknown identifier '{}'",
                        node.identifier, unites.identifier
                    ));
                }
            }
        }

        if let Some(store_config) = &mut self.store_config {
            errors.extend(store_config.validate());
        }

        errors
    }
}
