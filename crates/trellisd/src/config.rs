//! Daemon configuration.
//!
//! Values come from an optional TOML file, overridden by environment
//! variables, overridden by CLI flags (applied in `main`). The API key and
//! encryption key are only ever read from the environment.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use trellis_core::ENCRYPTION_KEY_ENV;

/// Environment variable carrying the API key for the HTTP surface.
pub const API_KEY_ENV: &str = "STATE_MANAGER_SECRET";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Path to the SQLite database.
    pub db_path: PathBuf,
    /// HTTP listen port.
    pub port: u16,
    /// API key expected in `x-api-key`; `None` disables auth.
    pub api_key: Option<String>,
    /// Raw base64 key material for the secrets encrypter.
    pub encryption_key: Option<String>,
    /// Seconds a QUEUED state may sit without commit before the reaper
    /// returns it to CREATED.
    pub lease_timeout_secs: u64,
    /// Seconds between reaper sweeps.
    pub reaper_interval_secs: u64,
    /// Ceiling in seconds on the wait for a graph template to turn VALID.
    pub graph_valid_timeout_secs: u64,
    /// Upper bound on `batch_size` accepted by the lease endpoint.
    pub max_lease_batch: u32,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            port: 7900,
            api_key: std::env::var(API_KEY_ENV).ok(),
            encryption_key: std::env::var(ENCRYPTION_KEY_ENV).ok(),
            lease_timeout_secs: 300,
            reaper_interval_secs: 30,
            graph_valid_timeout_secs: 300,
            max_lease_batch: 100,
        }
    }
}

/// File-level overrides. Every field is optional; unset fields keep the
/// defaults (or environment values).
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    db_path: Option<PathBuf>,
    port: Option<u16>,
    lease_timeout_secs: Option<u64>,
    reaper_interval_secs: Option<u64>,
    graph_valid_timeout_secs: Option<u64>,
    max_lease_batch: Option<u32>,
}

impl DaemonConfig {
    /// Load defaults, then apply overrides from `path` when given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let Some(path) = path else {
            return Ok(config);
        };

        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let file: FileConfig = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;

        if let Some(db_path) = file.db_path {
            config.db_path = db_path;
        }
        if let Some(port) = file.port {
            config.port = port;
        }
        if let Some(secs) = file.lease_timeout_secs {
            config.lease_timeout_secs = secs;
        }
        if let Some(secs) = file.reaper_interval_secs {
            config.reaper_interval_secs = secs;
        }
        if let Some(secs) = file.graph_valid_timeout_secs {
            config.graph_valid_timeout_secs = secs;
        }
        if let Some(batch) = file.max_lease_batch {
            config.max_lease_batch = batch;
        }
        Ok(config)
    }
}

/// Default database path (~/.local/share/trellisd/trellisd.db).
fn default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("trellisd")
        .join("trellisd.db")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn defaults_are_sane() {
        let config = DaemonConfig::default();
        assert_eq!(config.port, 7900);
        assert_eq!(config.lease_timeout_secs, 300);
        assert_eq!(config.reaper_interval_secs, 30);
        assert_eq!(config.graph_valid_timeout_secs, 300);
        assert_eq!(config.max_lease_batch, 100);
    }

    #[test]
    fn file_overrides_apply() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trellisd.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "port = 8123").unwrap();
        writeln!(file, "lease_timeout_secs = 42").unwrap();

        let config = DaemonConfig::load(Some(&path)).unwrap();
        assert_eq!(config.port, 8123);
        assert_eq!(config.lease_timeout_secs, 42);
        // Untouched fields keep defaults.
        assert_eq!(config.reaper_interval_secs, 30);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trellisd.toml");
        std::fs::write(&path, "nonsense = true\n").unwrap();
        assert!(matches!(
            DaemonConfig::load(Some(&path)),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(matches!(
            DaemonConfig::load(Some(Path::new("/nonexistent/trellisd.toml"))),
            Err(ConfigError::Read { .. })
        ));
    }
}
