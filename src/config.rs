//! Application configuration: file loading, defaults, environment rules.
//!
//! Config is read once at startup from a YAML file. Per-method payment
//! settings additionally live in the database and are served hot by
//! [`crate::payment::PaymentConfigStore`]; this module only carries the
//! process-level surface (environment, database, logging, security, limits)
//! plus the static per-method wire settings (gateway URLs, credentials).

use rust_decimal::Decimal;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Validation(String),
}

/// Deployment environment. Production tightens several knobs (see
/// [`AppConfig::validate`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Test,
    Prod,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Dev => "dev",
            Environment::Test => "test",
            Environment::Prod => "prod",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_log_file")]
    pub log_file: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// "hourly", "daily" or anything else for a single file
    #[serde(default = "default_rotation")]
    pub rotation: String,
    #[serde(default)]
    pub use_json: bool,
}

fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_log_file() -> String {
    "mallx.log".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            log_file: default_log_file(),
            log_level: default_log_level(),
            rotation: default_rotation(),
            use_json: false,
        }
    }
}

/// Static wire settings for one payment method. Hot-reloadable business
/// settings (enabled flag, amount bounds) live in the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodWireConfig {
    pub app_id: String,
    /// Shared secret / signing key for this method
    pub secret: String,
    pub gateway_url: String,
    #[serde(default)]
    pub notify_url: String,
    #[serde(default)]
    pub return_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// "MD5" or "HMAC-SHA256"
    #[serde(default = "default_sign_type")]
    pub sign_type: String,
}

fn default_sign_type() -> String {
    "MD5".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackConfig {
    #[serde(default = "default_callback_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_true")]
    pub verify_signature: bool,
    /// Single IPs or v4 CIDR ranges. Empty list disables the allowlist
    /// outside prod; prod requires a non-empty list.
    #[serde(default)]
    pub allowed_ips: Vec<String>,
}

fn default_callback_retries() -> u32 {
    3
}
fn default_retry_interval() -> u64 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_true() -> bool {
    true
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            max_retries: default_callback_retries(),
            retry_interval_secs: default_retry_interval(),
            timeout_secs: default_timeout_secs(),
            verify_signature: true,
            allowed_ips: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default = "default_true")]
    pub enable_signature: bool,
    #[serde(default)]
    pub enable_encrypt: bool,
    pub secret_key: String,
    #[serde(default = "default_token_expiry")]
    pub token_expiry_secs: u64,
    #[serde(default = "default_max_request_size")]
    pub max_request_size: usize,
    #[serde(default = "default_rate_limit")]
    pub rate_limit_rps: u32,
}

fn default_token_expiry() -> u64 {
    1800
}
fn default_max_request_size() -> usize {
    64 * 1024
}
fn default_rate_limit() -> u32 {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodLimit {
    pub min_amount: Decimal,
    pub max_amount: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub min_amount: Decimal,
    pub max_amount: Decimal,
    pub daily_max_amount: Decimal,
    pub daily_max_count: i64,
    #[serde(default)]
    pub method_limits: FxHashMap<String, MethodLimit>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            min_amount: Decimal::new(1, 2), // 0.01
            max_amount: Decimal::from(50_000),
            daily_max_amount: Decimal::from(200_000),
            daily_max_count: 100,
            method_limits: FxHashMap::default(),
        }
    }
}

/// Complete application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub environment: Environment,
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_currency")]
    pub default_currency: String,
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_callback_retries")]
    pub max_retries: u32,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub methods: FxHashMap<String, MethodWireConfig>,
    #[serde(default)]
    pub callback: CallbackConfig,
    pub security: SecurityConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

fn default_currency() -> String {
    "CNY".to_string()
}

impl AppConfig {
    /// Load and validate configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: AppConfig = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Environment rules. Production mandates hardened settings; invalid
    /// combinations fail startup rather than running loose.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limits.min_amount > self.limits.max_amount {
            return Err(ConfigError::Validation(
                "limits.min_amount exceeds limits.max_amount".to_string(),
            ));
        }
        for (method, limit) in &self.limits.method_limits {
            if limit.min_amount > limit.max_amount {
                return Err(ConfigError::Validation(format!(
                    "method_limits.{}: min_amount exceeds max_amount",
                    method
                )));
            }
        }
        if self.security.secret_key.is_empty() {
            return Err(ConfigError::Validation(
                "security.secret_key must not be empty".to_string(),
            ));
        }

        if self.environment == Environment::Prod {
            if self.debug {
                return Err(ConfigError::Validation(
                    "debug must be false in prod".to_string(),
                ));
            }
            if !self.security.enable_encrypt {
                return Err(ConfigError::Validation(
                    "security.enable_encrypt must be true in prod".to_string(),
                ));
            }
            if self.callback.allowed_ips.is_empty() {
                return Err(ConfigError::Validation(
                    "callback.allowed_ips must not be empty in prod".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Effective amount bounds for a method: per-method override or the
    /// global limits.
    pub fn amount_bounds(&self, method: &str) -> (Decimal, Decimal) {
        match self.limits.method_limits.get(method) {
            Some(limit) => (limit.min_amount, limit.max_amount),
            None => (self.limits.min_amount, self.limits.max_amount),
        }
    }
}
