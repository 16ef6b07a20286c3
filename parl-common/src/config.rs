//! Configuration loading and root folder resolution
//!
//! Bootstrap configuration comes from a TOML file. Every section is optional;
//! missing values fall back to compiled defaults.
//!
//! Priority order for paths:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. TOML config file
//! 4. OS-dependent compiled default (fallback)

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable overriding the root folder
pub const ENV_ROOT_FOLDER: &str = "PARL_ROOT_FOLDER";
/// Environment variable overriding the database path
pub const ENV_DATABASE: &str = "PARL_DATABASE";
/// Environment variable pointing at the TOML config file
pub const ENV_CONFIG: &str = "PARL_CONFIG";

const CONFIG_FILE_NAME: &str = "parl-ingest.toml";
const DATABASE_FILE_NAME: &str = "parl.db";

/// Bootstrap configuration loaded from TOML file
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TomlConfig {
    /// Root folder holding the database (optional)
    #[serde(default)]
    pub root_folder: Option<PathBuf>,

    /// Explicit database path; defaults to `<root_folder>/parl.db`
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub fetch: FetchConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub normalize: NormalizeConfig,

    #[serde(default)]
    pub source: SourceConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

/// Adapter fetch behaviour
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FetchConfig {
    /// Total attempts per fetch call, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Timeout for a single adapter fetch call
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            timeout_ms: default_timeout_ms(),
            page_size: default_page_size(),
        }
    }
}

/// Store access behaviour
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    /// Maximum total time spent retrying "database is locked" errors
    #[serde(default = "default_max_lock_wait_ms")]
    pub max_lock_wait_ms: u64,

    /// Disable the set-based upsert path even when the store supports it
    #[serde(default)]
    pub force_fallback: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_lock_wait_ms: default_max_lock_wait_ms(),
            force_fallback: false,
        }
    }
}

/// Record normalization options
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct NormalizeConfig {
    /// UTC offset applied to source timestamps that carry no offset.
    ///
    /// When absent, such timestamps are rejected.
    #[serde(default)]
    pub source_utc_offset_minutes: Option<i32>,

    /// Jurisdiction assumed for payloads that carry none (e.g. "ca-federal")
    #[serde(default)]
    pub default_jurisdiction: Option<String>,
}

/// Which source adapter to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Http,
    File,
}

/// Source adapter configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    #[serde(default = "default_source_kind")]
    pub kind: SourceKind,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// JSON fixture path for `kind = "file"`
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_min_request_interval_ms")]
    pub min_request_interval_ms: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: default_source_kind(),
            base_url: default_base_url(),
            path: None,
            min_request_interval_ms: default_min_request_interval_ms(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_page_size() -> u32 {
    100
}

fn default_max_lock_wait_ms() -> u64 {
    5000
}

fn default_source_kind() -> SourceKind {
    SourceKind::Http
}

fn default_base_url() -> String {
    "https://api.openparliament.ca".to_string()
}

fn default_min_request_interval_ms() -> u64 {
    1000
}

/// Parse a TOML config file
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))
}

/// Load configuration with graceful degradation
///
/// An explicitly named file (CLI or `PARL_CONFIG`) must exist and parse.
/// Otherwise the platform locations are searched; if none exists the
/// compiled defaults are used and a warning is logged.
pub fn load_config(explicit: Option<&Path>) -> Result<TomlConfig> {
    let explicit = explicit
        .map(Path::to_path_buf)
        .or_else(|| std::env::var(ENV_CONFIG).ok().map(PathBuf::from));

    if let Some(path) = explicit {
        let config = load_toml_config(&path)?;
        info!("Loaded configuration from {}", path.display());
        return Ok(config);
    }

    match find_config_file() {
        Some(path) => {
            let config = load_toml_config(&path)?;
            info!("Loaded configuration from {}", path.display());
            Ok(config)
        }
        None => {
            warn!("No configuration file found, using built-in defaults");
            Ok(TomlConfig::default())
        }
    }
}

/// Resolve the root folder (CLI → ENV → TOML → compiled default)
pub fn resolve_root_folder(cli_arg: Option<&Path>, config: &TomlConfig) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(ENV_ROOT_FOLDER) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(path) = &config.root_folder {
        return path.clone();
    }

    default_root_folder()
}

/// Resolve the database path (CLI → ENV → TOML → `<root_folder>/parl.db`)
pub fn resolve_database_path(
    cli_arg: Option<&Path>,
    root_folder: &Path,
    config: &TomlConfig,
) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(ENV_DATABASE) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(path) = &config.database_path {
        return path.clone();
    }

    root_folder.join(DATABASE_FILE_NAME)
}

/// First existing config file among the platform locations
fn find_config_file() -> Option<PathBuf> {
    let user_config = dirs::config_dir().map(|d| d.join("parl").join(CONFIG_FILE_NAME));
    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
    }

    if cfg!(unix) {
        let system_config = PathBuf::from("/etc/parl").join(CONFIG_FILE_NAME);
        if system_config.exists() {
            return Some(system_config);
        }
    }

    None
}

/// Get OS-dependent default root folder path
pub fn default_root_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("parl"))
        .unwrap_or_else(|| PathBuf::from("./parl_data"))
}
