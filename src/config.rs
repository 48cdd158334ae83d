//! Config loading and persistence.
//!
//! Subsystem configs live next to the code they configure; this module
//! aggregates them into one TOML document and handles disk round-trips.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bus::BusServerConfig;
use crate::cache::SlruCacheConfig;
use crate::changelog::ChangelogConfig;
use crate::error::Transience;
use crate::telemetry::TelemetryConfig;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub telemetry: TelemetryConfig,
    pub server: BusServerConfig,
    pub cache: SlruCacheConfig,
    pub changelog: ChangelogConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {path}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to render config")]
    Serialize {
        #[source]
        source: toml::ser::Error,
    },
    #[error("failed to write config at {path}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    pub fn transience(&self) -> Transience {
        match self {
            ConfigError::Read { .. } | ConfigError::Write { .. } => Transience::Retryable,
            ConfigError::Parse { .. } | ConfigError::Serialize { .. } => Transience::Permanent,
        }
    }
}

pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

/// Loads `path`, falling back to defaults (with a warning) when the file
/// is missing or unusable.
pub fn load_or_default(path: &Path) -> Config {
    if !path.exists() {
        return Config::default();
    }
    match load(path) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("config load failed, using defaults: {err}");
            Config::default()
        }
    }
}

pub fn store(path: &Path, config: &Config) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|source| ConfigError::Write {
            path: dir.display().to_string(),
            source,
        })?;
    }
    let contents =
        toml::to_string_pretty(config).map_err(|source| ConfigError::Serialize { source })?;
    atomic_write(path, contents.as_bytes())
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<(), ConfigError> {
    let write_error = |source| ConfigError::Write {
        path: path.display().to_string(),
        source,
    };
    let dir = path.parent().ok_or_else(|| ConfigError::Write {
        path: path.display().to_string(),
        source: std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "config path has no parent directory",
        ),
    })?;
    let temp = tempfile::NamedTempFile::new_in(dir).map_err(write_error)?;
    fs::write(temp.path(), data).map_err(write_error)?;
    temp.persist(path).map_err(|err| write_error(err.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.cache.capacity, 1 << 20);
        assert_eq!(config.changelog.index_flush_size, 1 << 20);
        assert_eq!(config.server.bind_retry_count, 5);
        assert_eq!(config.telemetry.verbosity, 0);
    }

    #[test]
    fn config_round_trips_through_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("millrace.toml");
        let mut config = Config::default();
        config.telemetry.verbosity = 2;
        config.cache.capacity = 4096;
        config.cache.shard_count = 4;
        config.changelog.preallocate_size = Some(1 << 16);
        config.server.max_connections = Some(7);
        store(&path, &config).expect("store config");
        let loaded = load(&path).expect("load config");
        assert_eq!(loaded.telemetry.verbosity, 2);
        assert_eq!(loaded.cache.capacity, 4096);
        assert_eq!(loaded.cache.shard_count, 4);
        assert_eq!(loaded.changelog.preallocate_size, Some(1 << 16));
        assert_eq!(loaded.server.max_connections, Some(7));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = load_or_default(&dir.path().join("absent.toml"));
        assert_eq!(config.cache.shard_count, 16);
    }
}
