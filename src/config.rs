//! Configuration loader and validator for the payout disbursement engine.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub providers: Providers,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub poll_interval_ms: u64,
    /// Upper bound on a single provider dispatch; a call that outlives it is
    /// recorded as FAILED rather than left in PROCESSING.
    pub dispatch_timeout_seconds: u64,
}

/// Payment rail credentials and endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Providers {
    pub line_pay: LinePay,
    pub bank_transfer: BankTransfer,
}

/// LINE Pay channel settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinePay {
    pub base_url: String,
    pub channel_id: String,
    pub channel_secret: String,
}

/// Bank-transfer rail settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BankTransfer {
    pub base_url: String,
    pub api_key: String,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// Default database location under `app.data_dir`; callers may override
    /// it with the `DATABASE_URL` environment variable.
    pub fn default_database_url(&self) -> String {
        format!("sqlite://{}/payouts.db", self.app.data_dir)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }
    if cfg.app.dispatch_timeout_seconds == 0 {
        return Err(ConfigError::Invalid(
            "app.dispatch_timeout_seconds must be > 0",
        ));
    }

    if cfg.providers.line_pay.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "providers.line_pay.base_url must be non-empty",
        ));
    }
    if cfg.providers.line_pay.channel_id.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "providers.line_pay.channel_id must be non-empty",
        ));
    }
    if cfg.providers.line_pay.channel_secret.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "providers.line_pay.channel_secret must be non-empty",
        ));
    }

    if cfg.providers.bank_transfer.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "providers.bank_transfer.base_url must be non-empty",
        ));
    }
    if cfg.providers.bank_transfer.api_key.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "providers.bank_transfer.api_key must be non-empty",
        ));
    }

    Ok(())
}

/// Example YAML configuration, used by tests and as a starting point for
/// deployments.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 500
  dispatch_timeout_seconds: 30

providers:
  line_pay:
    base_url: "https://api-pay.line.me/"
    channel_id: "YOUR_LINE_PAY_CHANNEL_ID"
    channel_secret: "YOUR_LINE_PAY_CHANNEL_SECRET"
  bank_transfer:
    base_url: "https://rails.example.com/"
    api_key: "YOUR_BANK_RAIL_API_KEY"
"#
}
