//! Configuration loading and config file resolution
//!
//! Config file resolution, highest priority first:
//! 1. Explicit path (command-line or embedding application)
//! 2. `CITEFLOW_CONFIG` environment variable
//! 3. Platform config directory (`<config dir>/citeflow/config.toml`)
//! 4. Compiled defaults (no file)
//!
//! A missing file is never fatal: a warning is logged and defaults apply.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "CITEFLOW_CONFIG";

/// Raw TOML configuration, every field optional
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TomlConfig {
    /// SQLite database file
    pub database_path: Option<PathBuf>,
    pub dispatch: DispatchSection,
    pub menu_skip: MenuSkipSection,
    pub registry: RegistrySection,
}

/// `[dispatch]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatchSection {
    /// In-flight records older than this are presumed dead
    pub stall_timeout_secs: u64,
    /// Re-queue threshold as a multiple of the stall timeout
    pub requeue_multiplier: u32,
    /// Completed results older than this are expired
    pub response_expire_interval_secs: Option<u64>,
    /// Cron expression; results expire once the next occurrence after their creation has passed
    pub response_expire_schedule: Option<String>,
    /// Suggested delay between client polls
    pub poll_interval_secs: u64,
    /// Stop suggesting re-polls after this many attempts
    pub max_poll_attempts: Option<u32>,
    /// Upper bound on services running at once within one tier
    pub max_concurrent_services: usize,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            stall_timeout_secs: 30,
            requeue_multiplier: 10,
            response_expire_interval_secs: None,
            response_expire_schedule: None,
            poll_interval_secs: 5,
            max_poll_attempts: None,
            max_concurrent_services: 8,
        }
    }
}

/// `[menu_skip]` section
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MenuSkipSection {
    /// `"disabled"` (default) or `"rule"`
    pub mode: Option<String>,
    pub service_types: Vec<String>,
    pub excluded_referrers: Vec<String>,
    pub allowed_services: Option<Vec<String>>,
}

/// `[registry]` section
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RegistrySection {
    /// Service ids applied to every request
    pub default_services: Vec<String>,
    pub institutions: Vec<InstitutionSection>,
}

/// One `[[registry.institutions]]` entry
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InstitutionSection {
    pub name: String,
    /// CIDR networks whose clients belong to this institution
    pub ip_networks: Vec<String>,
    pub services: Vec<String>,
}

impl TomlConfig {
    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Read and parse a config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Load configuration following the resolution order
    ///
    /// Unreadable or missing files fall back to defaults with a warning;
    /// a file that exists but does not parse is an error.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match resolve_config_path(explicit) {
            Some(path) if path.exists() => Self::from_file(&path),
            Some(path) => {
                warn!(
                    "Config file {} not found, using compiled defaults",
                    path.display()
                );
                Ok(Self::default())
            }
            None => {
                info!("No config file found, using compiled defaults");
                Ok(Self::default())
            }
        }
    }

    /// Database path from config, or the platform default
    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(default_database_path)
    }
}

/// Resolve which config file to read, if any
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    dirs::config_dir()
        .map(|d| d.join("citeflow").join("config.toml"))
        .filter(|p| p.exists())
}

/// OS-dependent default database location
pub fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("citeflow"))
        .unwrap_or_else(|| PathBuf::from("./citeflow_data"))
        .join("citeflow.db")
}

/// Reject obviously unusable numeric settings
pub fn validate(config: &TomlConfig) -> Result<()> {
    let dispatch = &config.dispatch;
    if dispatch.stall_timeout_secs == 0 {
        return Err(Error::Config(
            "dispatch.stall_timeout_secs must be greater than zero".to_string(),
        ));
    }
    if dispatch.requeue_multiplier == 0 {
        return Err(Error::Config(
            "dispatch.requeue_multiplier must be at least 1".to_string(),
        ));
    }
    if dispatch.max_concurrent_services == 0 {
        return Err(Error::Config(
            "dispatch.max_concurrent_services must be at least 1".to_string(),
        ));
    }
    Ok(())
}
