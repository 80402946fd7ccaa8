//! Configuration loading and management.

use std::path::{Path, PathBuf};

use dwell_core::EngineConfig;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to the database file.
    pub database_path: PathBuf,

    /// Base URL of the host application. Without one, host messages are
    /// written to stdout as JSON lines.
    pub host_url: Option<String>,

    /// Engine tuning, the `[engine]` table.
    pub engine: EngineConfig,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs_data_path().unwrap_or_else(|| PathBuf::from("."));
        Self {
            database_path: data_dir.join("dwell.db"),
            host_url: None,
            engine: EngineConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration, optionally from a specific file.
    #[expect(
        clippy::result_large_err,
        reason = "figment::Error is large but only returned at startup"
    )]
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Some(config_dir) = dirs_config_path() {
            figment = figment.merge(Toml::file(config_dir.join("config.toml")));
        }

        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        // DWELL_ENGINE__INACTIVITY_TIMEOUT_SECONDS sets engine.inactivity_timeout_seconds
        figment = figment.merge(Env::prefixed("DWELL_").split("__"));

        figment.extract()
    }

    /// The lock file guarding the database against a second engine.
    pub fn lock_path(&self) -> PathBuf {
        self.database_path.with_extension("lock")
    }
}

/// Returns the platform-specific config directory for dwell.
fn dirs_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("dwell"))
}

/// Returns the platform-specific data directory for dwell.
///
/// On Linux: `~/.local/share/dwell`
pub fn dirs_data_path() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("dwell"))
}
