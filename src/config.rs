use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;
use tracing::info;

use crate::error::MeterError;

/// Application configuration, loaded from a TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Mailbox the payment notifications arrive in
    pub imap: ImapConfig,

    /// Local ledger database
    #[serde(default)]
    pub store: StoreConfig,

    /// Ingestion cadence and limits
    #[serde(default)]
    pub ingest: IngestConfig,
}

/// IMAP connection settings
#[derive(Debug, Clone, Deserialize)]
pub struct ImapConfig {
    /// Server hostname
    pub host: String,

    /// IMAP server port (default: 993, implicit TLS)
    #[serde(default = "default_imap_port")]
    pub port: u16,

    /// Login user (usually the mailbox address)
    pub user: String,

    /// Password (raw value, or command for password-manager integration)
    pub password: PasswordSource,

    /// Folder the notifications land in
    #[serde(default = "default_folder")]
    pub folder: String,
}

/// Password, given directly or produced by a command
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PasswordSource {
    /// Literal password
    Raw(String),
    /// Shell command whose stdout is the password
    Command { command: String },
}

impl PasswordSource {
    /// Resolve to the actual password. Command output is trimmed of the
    /// trailing newline most password managers print.
    pub fn resolve(&self) -> Result<String, MeterError> {
        match self {
            PasswordSource::Raw(value) => Ok(value.clone()),
            PasswordSource::Command { command } => {
                let output = Command::new("sh")
                    .arg("-c")
                    .arg(command)
                    .output()
                    .map_err(|e| {
                        MeterError::Config(format!("Password command failed to run: {}", e))
                    })?;
                if !output.status.success() {
                    return Err(MeterError::Config(format!(
                        "Password command exited with {}",
                        output.status
                    )));
                }
                let password = String::from_utf8_lossy(&output.stdout)
                    .trim_end_matches(['\r', '\n'])
                    .to_string();
                if password.is_empty() {
                    return Err(MeterError::Config(
                        "Password command produced no output".into(),
                    ));
                }
                Ok(password)
            }
        }
    }
}

/// Ledger database configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
    /// Database file path; defaults to the platform data directory
    pub db_path: Option<PathBuf>,
}

impl StoreConfig {
    pub fn resolved_db_path(&self) -> PathBuf {
        match &self.db_path {
            Some(path) => path.clone(),
            None => dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("spendometer")
                .join("spendometer.db"),
        }
    }
}

/// Ingestion run configuration
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Seconds between polling cycles
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Maximum messages fetched per cycle
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,

    /// Retry budget for transient mailbox failures within one run
    #[serde(default = "default_max_fetch_retries")]
    pub max_fetch_retries: u32,

    /// Wall-clock budget for one run
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            batch_limit: default_batch_limit(),
            max_fetch_retries: default_max_fetch_retries(),
            run_timeout_secs: default_run_timeout_secs(),
        }
    }
}

fn default_imap_port() -> u16 {
    993
}

fn default_folder() -> String {
    "INBOX".to_string()
}

fn default_interval_secs() -> u64 {
    300
}

fn default_batch_limit() -> usize {
    50
}

fn default_max_fetch_retries() -> u32 {
    3
}

fn default_run_timeout_secs() -> u64 {
    120
}

/// Candidate config file locations, in lookup order.
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("spendometer").join("config.toml"));
    }

    if let Some(home_dir) = dirs::home_dir() {
        paths.push(
            home_dir
                .join(".config")
                .join("spendometer")
                .join("config.toml"),
        );
    }

    paths
}

/// Load configuration from an explicit path, or the first default path
/// that exists.
pub fn load_config(explicit: Option<&Path>) -> Result<AppConfig, MeterError> {
    if let Some(path) = explicit {
        return load_config_from_path(path);
    }

    for path in default_config_paths() {
        if path.exists() {
            return load_config_from_path(&path);
        }
    }

    Err(MeterError::Config(
        "No config file found; pass --config or create config.toml".into(),
    ))
}

fn load_config_from_path(path: &Path) -> Result<AppConfig, MeterError> {
    info!(path = %path.display(), "Loading configuration");

    let content = fs::read_to_string(path)
        .map_err(|e| MeterError::Config(format!("Failed to read config: {}", e)))?;

    let config: AppConfig = toml::from_str(&content)
        .map_err(|e| MeterError::Config(format!("Failed to parse config: {}", e)))?;

    Ok(config)
}
