//! Engine configuration loaded from TOML.
//!
//! Every setting has a default, so a missing file is equivalent to an empty
//! one. Relative paths inside the file resolve against the file's directory.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::query::scope::DEFAULT_SUBREGION_PREFIX_LEN;
use crate::temporal::PhaseCutoff;

/// Default number of concurrent entity fetches per wave.
pub const DEFAULT_BATCH_SIZE: usize = 500;
/// Default deadline for a whole query.
pub const DEFAULT_QUERY_TIMEOUT_MS: u64 = 120_000;
/// Default per-request timeout against the remote store.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
/// Default listen address.
pub const DEFAULT_BIND: &str = "127.0.0.1:8080";

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The file is not valid TOML for this layout.
    #[error("failed to parse config {path}: {source}")]
    Parse {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: toml::de::Error,
    },
    /// A value is out of range.
    #[error("invalid config value for {field}: {reason}")]
    Invalid {
        /// Dotted setting name.
        field: &'static str,
        /// What was wrong.
        reason: String,
    },
}

/// Remote store settings.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Base URL of the REST endpoint.
    pub base_url: Option<String>,
    /// Token appended as `?auth=`.
    pub auth_token: Option<String>,
    /// JSON fixture served instead of a remote store.
    pub fixture: Option<PathBuf>,
    /// Per-request timeout in milliseconds.
    pub request_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            auth_token: None,
            fixture: None,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

impl StoreConfig {
    /// Per-request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Evaluation settings.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineSection {
    /// Concurrent entity fetches per wave.
    pub batch_size: usize,
    /// Deadline for a whole query, in milliseconds.
    pub query_timeout_ms: u64,
    /// Length of the region code prefixed to subregion ids.
    pub subregion_prefix_len: usize,
    /// Whether the grouped-intersection strategy may be chosen.
    pub grouped_intersection: bool,
    /// Field schema replacing the built-in one.
    pub schema_path: Option<PathBuf>,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            query_timeout_ms: DEFAULT_QUERY_TIMEOUT_MS,
            subregion_prefix_len: DEFAULT_SUBREGION_PREFIX_LEN,
            grouped_intersection: true,
            schema_path: None,
        }
    }
}

impl EngineSection {
    /// Query deadline.
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

/// HTTP server settings.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerSection {
    /// Listen address.
    pub bind: String,
    /// Origins allowed by CORS; empty disables the CORS layer.
    pub allow_origins: Vec<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_owned(),
            allow_origins: Vec::new(),
        }
    }
}

/// Complete configuration.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// `[store]`
    pub store: StoreConfig,
    /// `[phase]`
    pub phase: PhaseCutoff,
    /// `[engine]`
    pub engine: EngineSection,
    /// `[server]`
    pub server: ServerSection,
}

impl EngineConfig {
    /// Loads `explicit`, or the default location when `None`. A missing file
    /// yields the defaults.
    pub fn load(explicit: Option<PathBuf>) -> Result<Self, ConfigError> {
        let path = explicit.or_else(default_config_path);
        let config = match path.as_ref() {
            Some(path) if path.exists() => read_file(path)?,
            _ => EngineConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Parses configuration text; relative paths resolve against `base_dir`.
    pub fn from_toml_str(contents: &str, base_dir: Option<&Path>) -> Result<Self, toml::de::Error> {
        let mut config: EngineConfig = toml::from_str(contents)?;
        if let Some(base) = base_dir {
            config.store.fixture = config.store.fixture.map(|p| resolve(base, p));
            config.engine.schema_path = config.engine.schema_path.map(|p| resolve(base, p));
        }
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.batch_size == 0 {
            return Err(ConfigError::Invalid {
                field: "engine.batch_size",
                reason: "must be at least 1".into(),
            });
        }
        if self.engine.query_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "engine.query_timeout_ms",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

fn resolve(base: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

fn read_file(path: &Path) -> Result<EngineConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    EngineConfig::from_toml_str(&contents, path.parent()).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// `<config dir>/cohort/cohort.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("cohort").join("cohort.toml"))
}
