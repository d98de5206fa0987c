//! trellisd - Workflow state manager daemon.
//!
//! Library components for the daemon process: persistence, the graph
//! validator, the state lifecycle engine, the lease protocol, background
//! fanout/retry tasks, the lease-timeout reaper, and the HTTP surface.

pub mod config;
pub mod fanout;
pub mod lease;
pub mod lifecycle;
pub mod reaper;
pub mod resolve;
pub mod server;
pub mod storage;
pub mod validator;

use std::sync::Arc;
use std::time::Duration;

use eyre::WrapErr;
use tracing::{info, warn};
use trellis_core::Encrypter;

use crate::config::DaemonConfig;
use crate::server::AppState;
use crate::storage::Storage;

/// Type alias for application-level errors with context.
pub type AppResult<T> = eyre::Result<T>;

/// The daemon process: storage, encrypter, reaper, HTTP server.
pub struct Daemon {
    state: Arc<AppState>,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon").finish_non_exhaustive()
    }
}

impl Daemon {
    /// Initialize storage and crypto. A missing or malformed encryption
    /// key fails startup.
    pub async fn new(config: DaemonConfig) -> AppResult<Self> {
        let encrypter = match &config.encryption_key {
            Some(key) => Encrypter::new(key).wrap_err("invalid SECRETS_ENCRYPTION_KEY")?,
            None => {
                return Err(eyre::eyre!(
                    "SECRETS_ENCRYPTION_KEY is not set; generate one with `trellisctl keygen`"
                ))
            }
        };

        if config.api_key.is_none() {
            warn!("STATE_MANAGER_SECRET is not set; API authentication is disabled");
        }

        let storage = Storage::new(&config.db_path)
            .await
            .wrap_err_with(|| format!("failed to open database at {}", config.db_path.display()))?;
        storage
            .migrate_embedded()
            .await
            .wrap_err("failed to run migrations")?;
        info!(db = %config.db_path.display(), "storage ready");

        Ok(Self {
            state: Arc::new(AppState {
                storage: Arc::new(storage),
                encrypter: Arc::new(encrypter),
                config,
            }),
        })
    }

    /// Run the reaper and the HTTP server until the process is stopped.
    pub async fn run(&self) -> AppResult<()> {
        let config = &self.state.config;
        tokio::spawn(reaper::run(
            Arc::clone(&self.state.storage),
            Duration::from_secs(config.lease_timeout_secs),
            Duration::from_secs(config.reaper_interval_secs),
        ));

        server::start_server(Arc::clone(&self.state))
            .await
            .wrap_err("HTTP server failed")?;
        Ok(())
    }
}
