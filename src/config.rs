use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{GmailError, Result};
use crate::output::OutputFormat;

/// Hard cap Gmail places on sub-requests per batch call
pub const MAX_BATCH_SIZE: usize = 100;

/// Largest page `users.messages.list` accepts
pub const MAX_LIST_PAGE_SIZE: u32 = 500;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_credentials_file")]
    pub credentials_file: PathBuf,
    #[serde(default = "default_token_cache")]
    pub token_cache: PathBuf,
    #[serde(default = "default_batch_endpoint")]
    pub batch_endpoint: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            credentials_file: default_credentials_file(),
            token_cache: default_token_cache(),
            batch_endpoint: default_batch_endpoint(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: f64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: f64,
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_requests_per_second(),
            max_retries: default_max_retries(),
            base_delay_secs: default_base_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    #[serde(default = "default_daily_limit_units")]
    pub daily_limit_units: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            daily_limit_units: default_daily_limit_units(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_reset_timeout_secs")]
    pub reset_timeout_secs: u64,
    /// Probe successes needed in half-open before closing
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: default_failure_threshold(),
            reset_timeout_secs: default_reset_timeout_secs(),
            success_threshold: default_success_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Cap on ids enumerated per run
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub format: OutputFormat,
    #[serde(default = "default_checkpoint_path")]
    pub checkpoint_path: PathBuf,
    /// Newline-delimited JSON index of fetched messages
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_results: default_max_results(),
            batch_size: default_batch_size(),
            max_concurrent: default_max_concurrent(),
            max_workers: default_max_workers(),
            output_dir: default_output_dir(),
            format: OutputFormat::default(),
            checkpoint_path: default_checkpoint_path(),
            store_path: default_store_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Directories user-supplied paths must resolve into; empty means the working directory
    #[serde(default)]
    pub allowed_base_dirs: Vec<PathBuf>,
    #[serde(default = "default_subprocess_timeout_secs")]
    pub subprocess_timeout_secs: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            allowed_base_dirs: Vec::new(),
            subprocess_timeout_secs: default_subprocess_timeout_secs(),
        }
    }
}

fn default_credentials_file() -> PathBuf {
    PathBuf::from("credentials.json")
}

fn default_token_cache() -> PathBuf {
    PathBuf::from(".gmail-backup/token.json")
}

fn default_batch_endpoint() -> String {
    "https://www.googleapis.com/batch/gmail/v1".to_string()
}

fn default_requests_per_second() -> f64 {
    10.0
}

fn default_max_retries() -> u32 {
    5
}

fn default_base_delay_secs() -> f64 {
    1.0
}

fn default_max_delay_secs() -> f64 {
    300.0
}

fn default_true() -> bool {
    true
}

fn default_daily_limit_units() -> u64 {
    1_000_000_000
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout_secs() -> u64 {
    60
}

fn default_success_threshold() -> u32 {
    1
}

fn default_max_results() -> usize {
    500
}

fn default_batch_size() -> usize {
    MAX_BATCH_SIZE
}

fn default_max_concurrent() -> usize {
    10
}

fn default_max_workers() -> usize {
    4
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("backup")
}

fn default_checkpoint_path() -> PathBuf {
    PathBuf::from(".gmail-backup/checkpoint.json")
}

fn default_store_path() -> PathBuf {
    PathBuf::from(".gmail-backup/index.jsonl")
}

fn default_subprocess_timeout_secs() -> u64 {
    300
}

impl Config {
    pub async fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| GmailError::ConfigError(format!("Failed to read config file: {}", e)))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| GmailError::ConfigError(format!("Failed to parse config file: {}", e)))?;

        config.validate()?;

        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                GmailError::ConfigError(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| GmailError::ConfigError(format!("Failed to serialize config: {}", e)))?;

        tokio::fs::write(path, content)
            .await
            .map_err(|e| GmailError::ConfigError(format!("Failed to write config file: {}", e)))?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let rate = &self.rate_limit;
        if !(rate.requests_per_second > 0.0 && rate.requests_per_second.is_finite()) {
            return Err(GmailError::ConfigError(
                "rate_limit.requests_per_second must be a positive number".to_string(),
            ));
        }
        if rate.requests_per_second > 250.0 {
            return Err(GmailError::ConfigError(
                "rate_limit.requests_per_second cannot exceed 250 (Gmail per-user ceiling)"
                    .to_string(),
            ));
        }
        if !(rate.base_delay_secs >= 0.0 && rate.base_delay_secs.is_finite()) {
            return Err(GmailError::ConfigError(
                "rate_limit.base_delay_secs must be zero or positive".to_string(),
            ));
        }
        if !(rate.max_delay_secs >= rate.base_delay_secs && rate.max_delay_secs.is_finite()) {
            return Err(GmailError::ConfigError(
                "rate_limit.max_delay_secs must be at least rate_limit.base_delay_secs".to_string(),
            ));
        }

        if self.quota.daily_limit_units == 0 {
            return Err(GmailError::ConfigError(
                "quota.daily_limit_units must be greater than 0".to_string(),
            ));
        }

        if self.circuit_breaker.failure_threshold == 0 {
            return Err(GmailError::ConfigError(
                "circuit_breaker.failure_threshold must be greater than 0".to_string(),
            ));
        }
        if self.circuit_breaker.reset_timeout_secs == 0 {
            return Err(GmailError::ConfigError(
                "circuit_breaker.reset_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.circuit_breaker.success_threshold == 0 {
            return Err(GmailError::ConfigError(
                "circuit_breaker.success_threshold must be greater than 0".to_string(),
            ));
        }

        let fetch = &self.fetch;
        if fetch.max_results == 0 {
            return Err(GmailError::ConfigError(
                "fetch.max_results must be at least 1".to_string(),
            ));
        }
        if fetch.batch_size == 0 || fetch.batch_size > MAX_BATCH_SIZE {
            return Err(GmailError::ConfigError(format!(
                "fetch.batch_size must be between 1 and {}",
                MAX_BATCH_SIZE
            )));
        }
        if fetch.max_concurrent == 0 || fetch.max_concurrent > 50 {
            return Err(GmailError::ConfigError(
                "fetch.max_concurrent must be between 1 and 50".to_string(),
            ));
        }
        if fetch.max_workers == 0 {
            return Err(GmailError::ConfigError(
                "fetch.max_workers must be at least 1".to_string(),
            ));
        }

        if self.security.subprocess_timeout_secs == 0 {
            return Err(GmailError::ConfigError(
                "security.subprocess_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if !self.auth.batch_endpoint.starts_with("http") {
            return Err(GmailError::ConfigError(format!(
                "auth.batch_endpoint must be an http(s) URL, got '{}'",
                self.auth.batch_endpoint
            )));
        }

        tracing::debug!("Configuration validation passed");
        Ok(())
    }

    /// Create an example configuration file
    pub async fn create_example(path: &Path) -> Result<()> {
        let config = Self::default();
        config.save(path).await?;

        let body = tokio::fs::read_to_string(path).await?;
        let header = "# gmail-backup configuration\n\
                      # Every key is optional; missing keys fall back to the values below.\n\n";
        tokio::fs::write(path, format!("{}{}", header, body)).await?;
        Ok(())
    }
}
