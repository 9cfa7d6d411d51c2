//! User configuration.
//!
//! Settings come from `<config dir>/rfetch/config.toml` (optional) with
//! `RFETCH_*` environment variables layered on top. Every field has a
//! default so an empty configuration is valid.
use ::config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Base directory for finished files. Defaults to the platform documents directory.
    pub documents_dir: Option<PathBuf>,
    /// Where partial transfers are staged. Defaults to `<temp>/rfetch`.
    pub staging_dir: Option<PathBuf>,
    /// Minimum spacing between progress events from the transport.
    pub progress_interval_ms: u64,
    pub user_agent: String,
    pub connect_timeout_secs: u64,
    /// Fallback `tracing` filter when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            documents_dir: None,
            staging_dir: None,
            progress_interval_ms: 100,
            user_agent: concat!("rfetch/", env!("CARGO_PKG_VERSION")).to_string(),
            connect_timeout_secs: 30,
            log_level: "warn".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from the user config file and environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = Self::config_file() {
            builder = builder.add_source(File::from(path).required(false));
        }
        builder
            .add_source(Environment::with_prefix("RFETCH"))
            .build()?
            .try_deserialize()
    }

    pub fn config_file() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("rfetch").join("config.toml"))
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.staging_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("rfetch"))
    }
}
