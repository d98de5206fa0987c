//! Lease-timeout reaper.
//!
//! A worker that leases a state and disappears leaves it stranded in
//! QUEUED. The reaper sweeps on an interval and returns any QUEUED state
//! older than the lease timeout to CREATED, consuming one retry; states
//! whose budget is already spent go to ERRORED instead.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};
use trellis_core::State;

use crate::storage::Storage;

/// Run the reaper loop until the process exits. Spawned once at daemon
/// startup.
pub async fn run(storage: Arc<Storage>, lease_timeout: Duration, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if let Err(e) = sweep(&storage, lease_timeout).await {
            error!(error = %e, "reaper sweep failed");
        }
    }
}

/// One sweep over stale QUEUED states.
pub async fn sweep(storage: &Arc<Storage>, lease_timeout: Duration) -> crate::storage::Result<()> {
    let cutoff = Utc::now()
        - chrono::Duration::from_std(lease_timeout).unwrap_or(chrono::Duration::zero());
    let stale = storage.stale_queued_states(cutoff).await?;

    for state in stale {
        reap_one(storage, &state).await?;
    }
    Ok(())
}

async fn reap_one(storage: &Arc<Storage>, state: &State) -> crate::storage::Result<()> {
    let max_retries = storage
        .get_registered_node(&state.namespace_name, &state.node_name)
        .await?
        .map(|n| n.retry_policy)
        .unwrap_or_default()
        .max_retries;

    if state.retry_count < max_retries {
        if storage.mark_reaped(&state.id).await? {
            info!(state_id = %state.id, retry_count = state.retry_count + 1,
                "reaped stale lease back to CREATED");
        }
    } else if storage
        .mark_errored_from(
            &state.id,
            trellis_core::StateStatus::Queued,
            "lease timeout exceeded with no retry budget remaining",
        )
        .await?
    {
        warn!(state_id = %state.id, "stale lease exhausted its retry budget");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use tempfile::TempDir;
    use trellis_core::{
        Id, NodeSchema, RegisteredNode, RetryPolicy, State, StateStatus,
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

    async fn register_with_budget(env: &TestEnv, max_retries: u32) {
        let now = Utc::now();
        env.storage
            .upsert_registered_node(&RegisteredNode {
                namespace: "ns".to_string(),
                name: "worker".to_string(),
                inputs_schema: NodeSchema::default(),
                outputs_schema: NodeSchema::default(),
                secrets: None,
                retry_policy: RetryPolicy {
                    max_retries,
                    ..RetryPolicy::default()
                },
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
    }

    async fn queued_state(env: &TestEnv, id: &str, retry_count: u32) -> State {
        let state_id = Id::from_string(id);
        let mut state = State::created(
            state_id.clone(),
            "run-1",
            "ns",
            "graph",
            "a",
            "worker",
            BTreeMap::new(),
            BTreeMap::from([("a".to_string(), state_id)]),
        );
        state.status = StateStatus::Queued;
        state.retry_count = retry_count;
        // Backdate the lease so zero-timeout sweeps see it as stale.
        state.updated_at = Utc::now() - chrono::Duration::seconds(10);
        env.storage.insert_states(&[state.clone()]).await.unwrap();
        state
    }

    #[tokio::test]
    async fn fresh_leases_are_left_alone() {
        let env = create_env().await;
        register_with_budget(&env, 3).await;
        let state = queued_state(&env, "s1", 0).await;

        sweep(&env.storage, Duration::from_secs(300)).await.unwrap();

        let stored = env.storage.get_state(&state.id).await.unwrap().unwrap();
        assert_eq!(stored.status, StateStatus::Queued);
    }

    #[tokio::test]
    async fn stale_lease_returns_to_created_and_consumes_budget() {
        let env = create_env().await;
        register_with_budget(&env, 3).await;
        let state = queued_state(&env, "s1", 0).await;

        // Zero timeout: everything QUEUED is stale.
        sweep(&env.storage, Duration::from_secs(0)).await.unwrap();

        let stored = env.storage.get_state(&state.id).await.unwrap().unwrap();
        assert_eq!(stored.status, StateStatus::Created);
        assert_eq!(stored.retry_count, 1);
    }

    #[tokio::test]
    async fn exhausted_budget_goes_terminal() {
        let env = create_env().await;
        register_with_budget(&env, 1).await;
        let state = queued_state(&env, "s1", 1).await;

        sweep(&env.storage, Duration::from_secs(0)).await.unwrap();

        let stored = env.storage.get_state(&state.id).await.unwrap().unwrap();
        assert_eq!(stored.status, StateStatus::Errored);
        assert!(stored.error.unwrap().contains("lease timeout"));
        assert_eq!(stored.retry_count, 1);
    }

    #[tokio::test]
    async fn unregistered_node_gets_the_default_budget() {
        let env = create_env().await;
        let state = queued_state(&env, "s1", 0).await;

        // No registration: the default policy (3 retries) applies, same as
        // the errored-commit path.
        sweep(&env.storage, Duration::from_secs(0)).await.unwrap();

        let stored = env.storage.get_state(&state.id).await.unwrap().unwrap();
        assert_eq!(stored.status, StateStatus::Created);
        assert_eq!(stored.retry_count, 1);

        // At the budget boundary the next stale lease goes terminal.
        let exhausted = queued_state(&env, "s2", 3).await;
        sweep(&env.storage, Duration::from_secs(0)).await.unwrap();

        let stored = env.storage.get_state(&exhausted.id).await.unwrap().unwrap();
        assert_eq!(stored.status, StateStatus::Errored);
        assert_eq!(stored.retry_count, 3);
    }
}
