//! The lease protocol.
//!
//! Workers poll for CREATED states matching their `(namespace, node_name)`
//! routing key. Each candidate passes the fan-in gate (when its template
//! declares `unites`), is atomically flipped to QUEUED, has its input
//! placeholders resolved, and is returned with the node's decrypted
//! secrets. Candidates whose resolution fails are routed through the
//! errored/retry path instead of being handed out.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use trellis_core::{
    Encrypter, GraphTemplate, Id, State, StateStatus, Unites, UnitesStrategy,
};

use crate::lifecycle;
use crate::resolve::Resolver;
use crate::storage::{Storage, StorageError};

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// One leased state as returned to a worker.
#[derive(Debug, Clone, Serialize)]
pub struct LeasedState {
    pub state_id: Id,
    pub run_id: String,
    pub graph_name: String,
    pub identifier: String,
    pub inputs: BTreeMap<String, String>,
    /// Decrypted values for the node's required secrets.
    pub secrets: BTreeMap<String, String>,
}

/// Lease up to `batch_size` ready states for `(namespace, node_name)`.
pub async fn lease(
    storage: Arc<Storage>,
    encrypter: &Encrypter,
    namespace: &str,
    node_name: &str,
    batch_size: u32,
) -> Result<Vec<LeasedState>, LeaseError> {
    let candidates = storage
        .lease_candidates(namespace, node_name, batch_size)
        .await?;

    let required_secrets = storage
        .get_registered_node(namespace, node_name)
        .await?
        .and_then(|n| n.secrets)
        .unwrap_or_default();

    let mut templates: HashMap<String, Option<GraphTemplate>> = HashMap::new();
    let mut leased = Vec::new();

    for candidate in candidates {
        if !templates.contains_key(&candidate.graph_name) {
            let template = storage
                .get_graph_template(&candidate.namespace_name, &candidate.graph_name)
                .await?;
            templates.insert(candidate.graph_name.clone(), template);
        }
        let Some(template) = &templates[&candidate.graph_name] else {
            // Orphaned state; nothing to do until its template reappears.
            continue;
        };

        if let Some(item) =
            try_lease_candidate(&storage, encrypter, template, &required_secrets, candidate)
                .await?
        {
            leased.push(item);
        }
    }

    info!(namespace, node_name, leased = leased.len(), "lease batch served");
    Ok(leased)
}

/// Attempt to lease one candidate. Returns `None` when the candidate was
/// skipped (join pending), coalesced, lost its CAS, or errored.
async fn try_lease_candidate(
    storage: &Arc<Storage>,
    encrypter: &Encrypter,
    template: &GraphTemplate,
    required_secrets: &[String],
    candidate: State,
) -> Result<Option<LeasedState>, LeaseError> {
    let unites = template
        .node_by_identifier(&candidate.identifier)
        .and_then(|n| n.unites.clone());

    // A retried canonical joiner already holds its slot.
    if let Some(unites) = unites.filter(|_| !candidate.does_unites) {
        let subtree = template.subtree_identifiers(&unites.identifier);
        let fingerprint = candidate.join_fingerprint(&subtree);

        let run_states = storage.list_run_states(&candidate.run_id).await?;
        if !join_satisfied(&candidate, &unites, &subtree, &run_states) {
            return Ok(None);
        }

        if !storage
            .claim_canonical_joiner(&candidate.id, &fingerprint)
            .await?
        {
            // A sibling claimed this join point first; coalesce without
            // execution.
            storage
                .set_status_from(&candidate.id, StateStatus::Created, StateStatus::Success)
                .await?;
            info!(state_id = %candidate.id, "coalesced duplicate joiner");
            return Ok(None);
        }

        // Canonical claim won: retire the remaining CREATED siblings of
        // this join point.
        for sibling in &run_states {
            if sibling.id != candidate.id
                && sibling.identifier == candidate.identifier
                && sibling.status == StateStatus::Created
                && sibling.join_fingerprint(&subtree) == fingerprint
            {
                storage
                    .set_status_from(&sibling.id, StateStatus::Created, StateStatus::Success)
                    .await?;
                info!(state_id = %sibling.id, "coalesced duplicate joiner");
            }
        }
    }

    // Resolve inputs before the flip so the QUEUED record already carries
    // concrete values.
    let mut resolver = Resolver::new(
        storage,
        &candidate.run_id,
        &candidate.namespace_name,
        &candidate.graph_name,
    );
    let resolved = match resolver
        .resolve_inputs(&candidate.inputs, &candidate.parents)
        .await
    {
        Ok(resolved) => resolved,
        Err(e) => {
            warn!(state_id = %candidate.id, error = %e, "input resolution failed at lease");
            if storage
                .mark_errored_from(&candidate.id, StateStatus::Created, &e.to_string())
                .await?
            {
                lifecycle::schedule_retry(Arc::clone(storage), candidate.id.clone()).await?;
            }
            return Ok(None);
        }
    };

    let mut secrets = BTreeMap::new();
    for name in required_secrets {
        let Some(sealed) = template.secrets.get(name) else {
            // Validation guarantees presence on VALID templates; a stale
            // template leaves the worker without this secret.
            warn!(state_id = %candidate.id, secret = %name, "required secret missing from template");
            continue;
        };
        match encrypter.decrypt(sealed) {
            Ok(value) => {
                secrets.insert(name.clone(), value);
            }
            Err(e) => {
                warn!(state_id = %candidate.id, secret = %name, error = %e,
                    "secret decryption failed");
            }
        }
    }

    if !storage.mark_queued(&candidate.id, &resolved).await? {
        // Lost the lease race to a concurrent poll.
        return Ok(None);
    }

    Ok(Some(LeasedState {
        state_id: candidate.id,
        run_id: candidate.run_id,
        graph_name: candidate.graph_name,
        identifier: candidate.identifier,
        inputs: resolved,
        secrets,
    }))
}

/// Whether the fan-in barrier for `candidate` is satisfied: no outstanding
/// state remains on the uniting branches (the uniting identifier and its
/// subtree) that shares the candidate's ancestry above the join.
fn join_satisfied(
    candidate: &State,
    unites: &Unites,
    subtree: &BTreeSet<String>,
    run_states: &[State],
) -> bool {
    let outstanding: &[StateStatus] = match unites.strategy {
        UnitesStrategy::AllSuccess => &[
            StateStatus::Created,
            StateStatus::Queued,
            StateStatus::Executed,
            StateStatus::Errored,
        ],
        UnitesStrategy::AllDone => &[
            StateStatus::Created,
            StateStatus::Queued,
            StateStatus::Executed,
        ],
    };

    for state in run_states {
        if state.id == candidate.id || state.identifier == candidate.identifier {
            continue;
        }
        if !subtree.contains(&state.identifier) {
            continue;
        }
        if !outstanding.contains(&state.status) {
            continue;
        }
        if shares_ancestry_above_join(candidate, state, subtree) {
            return false;
        }
    }
    true
}

/// Two states belong to the same join group when their `parents` agree on
/// every common identifier outside the uniting subtree.
fn shares_ancestry_above_join(candidate: &State, other: &State, subtree: &BTreeSet<String>) -> bool {
    for (identifier, id) in &other.parents {
        if subtree.contains(identifier) {
            continue;
        }
        if let Some(candidate_id) = candidate.parents.get(identifier) {
            if candidate_id != id {
                return false;
            }
        }
    }
    true
}
