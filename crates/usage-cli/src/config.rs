//! Configuration loading and management.

use std::fmt;
use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use usage_core::report::DEFAULT_PRECISION;
use usage_core::{CausalityPolicy, RollupPolicy};
use usage_db::DEFAULT_PAGE_SIZE;

/// Application configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to the database file.
    pub database_path: PathBuf,
    /// Rows fetched per database page during a replay.
    pub page_size: usize,
    /// Decimal places in rendered reports.
    pub precision: u32,
    pub causality: CausalityPolicy,
    pub rollup: RollupPolicy,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("database_path", &self.database_path)
            .field("page_size", &self.page_size)
            .field("precision", &self.precision)
            .field("causality", &self.causality.as_str())
            .field("rollup", &self.rollup.as_str())
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs_data_path().unwrap_or_else(|| PathBuf::from("."));
        Self {
            database_path: data_dir.join("usage.db"),
            page_size: DEFAULT_PAGE_SIZE,
            precision: DEFAULT_PRECISION,
            causality: CausalityPolicy::default(),
            rollup: RollupPolicy::default(),
        }
    }
}

impl Config {
    /// Loads configuration, optionally from a specific file.
    ///
    /// Later sources win: defaults, the user config file, `config_path`,
    /// then `USAGE_*` environment variables.
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

        figment = figment.merge(Env::prefixed("USAGE_"));

        figment.extract()
    }
}

/// Returns the platform-specific config directory.
///
/// On Linux: `~/.config/usage`
fn dirs_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("usage"))
}

/// Returns the platform-specific data directory.
///
/// On Linux: `~/.local/share/usage`
pub fn dirs_data_path() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("usage"))
}
