/*!
 * Configuration types for Skyhaul
 */

use crate::download::DownloadOptions;
use crate::error::{Result, TransferError};
use crate::recovery::{BackoffStrategy, RetryPolicy};
use crate::upload::DEFAULT_PART_SIZE;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding `account.account_id`
pub const ENV_ACCOUNT_ID: &str = "SKYHAUL_ACCOUNT_ID";

/// Environment variable overriding `account.application_key`
pub const ENV_APPLICATION_KEY: &str = "SKYHAUL_APPLICATION_KEY";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransferConfig {
    #[serde(default)]
    pub account: AccountConfig,

    #[serde(default)]
    pub download: DownloadConfig,

    #[serde(default)]
    pub upload: UploadConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub http: HttpConfig,

    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Log file path (None = stdout)
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Enable verbose logging (shorthand for debug level)
    #[serde(default)]
    pub verbose: bool,
}

/// Account credentials and API endpoint
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountConfig {
    #[serde(default)]
    pub account_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_key: Option<String>,

    /// Base URL used for authorization
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            account_id: None,
            application_key: None,
            api_base: default_api_base(),
        }
    }
}

impl std::fmt::Debug for AccountConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountConfig")
            .field("account_id", &self.account_id)
            .field(
                "application_key",
                &self.application_key.as_ref().map(|_| "<redacted>"),
            )
            .field("api_base", &self.api_base)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Bytes per range request
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// Parallel range requests per download
    #[serde(default = "default_download_concurrency")]
    pub concurrency: usize,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            concurrency: default_download_concurrency(),
        }
    }
}

impl DownloadConfig {
    pub fn options(&self) -> DownloadOptions {
        DownloadOptions {
            chunk_size: self.chunk_size,
            concurrency: self.concurrency,
        }
        .normalized()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Bytes per part (raised to the service minimum when smaller)
    #[serde(default = "default_part_size")]
    pub part_size: u64,

    /// Parts uploaded at once
    #[serde(default = "default_upload_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_content_type")]
    pub content_type: String,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            part_size: default_part_size(),
            concurrency: default_upload_concurrency(),
            content_type: default_content_type(),
        }
    }
}

impl UploadConfig {
    /// Part size to use given the session's minimum part size
    pub fn effective_part_size(&self, min_part_size: u64) -> u64 {
        self.part_size.max(min_part_size).max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts per operation, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First backoff delay in milliseconds
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Backoff cap in seconds
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,

    /// Retry connection and timeout failures with backoff
    #[serde(default = "default_true")]
    pub retry_transport_errors: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_secs: default_max_delay_secs(),
            retry_transport_errors: true,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_secs(self.max_delay_secs),
            backoff: BackoffStrategy::ExponentialWithJitter,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Per-request timeout in seconds
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Ask the service to fail some uploads at random (test mode)
    #[serde(default)]
    pub fail_some_uploads: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout_seconds(),
            fail_some_uploads: false,
        }
    }
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_api_base() -> String {
    "https://api.backblazeb2.com".to_string()
}

fn default_chunk_size() -> u64 {
    crate::download::DEFAULT_CHUNK_SIZE
}

fn default_download_concurrency() -> usize {
    crate::download::DEFAULT_CONCURRENCY
}

fn default_part_size() -> u64 {
    DEFAULT_PART_SIZE
}

fn default_upload_concurrency() -> usize {
    4
}

fn default_content_type() -> String {
    "b2/x-auto".to_string()
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_secs() -> u64 {
    64
}

fn default_timeout_seconds() -> u64 {
    300
}

impl TransferConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            TransferError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        toml::from_str(&contents)
            .map_err(|e| TransferError::Config(format!("cannot parse {}: {}", path.display(), e)))
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| TransferError::Config(format!("cannot serialize config: {}", e)))?;
        std::fs::write(path, contents).map_err(|e| {
            TransferError::Config(format!("cannot write {}: {}", path.display(), e))
        })
    }

    /// Take credentials from the environment when set
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(id) = lookup(ENV_ACCOUNT_ID).filter(|v| !v.is_empty()) {
            self.account.account_id = Some(id);
        }
        if let Some(key) = lookup(ENV_APPLICATION_KEY).filter(|v| !v.is_empty()) {
            self.account.application_key = Some(key);
        }
    }

    /// Check invariants that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(TransferError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_secs.saturating_mul(1000) {
            return Err(TransferError::Config(
                "retry.initial_delay_ms exceeds retry.max_delay_secs".to_string(),
            ));
        }
        if self.upload.concurrency == 0 {
            return Err(TransferError::Config(
                "upload.concurrency must be at least 1".to_string(),
            ));
        }
        if self.http.timeout_seconds == 0 {
            return Err(TransferError::Config(
                "http.timeout_seconds must be at least 1".to_string(),
            ));
        }
        if !self.account.api_base.starts_with("http://")
            && !self.account.api_base.starts_with("https://")
        {
            return Err(TransferError::Config(format!(
                "account.api_base is not an http(s) URL: {}",
                self.account.api_base
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = TransferConfig::default();
        assert_eq!(config.download.chunk_size, 10_000_000);
        assert_eq!(config.download.concurrency, 1);
        assert_eq!(config.upload.part_size, 100_000_000);
        assert_eq!(config.upload.concurrency, 4);
        assert_eq!(config.upload.content_type, "b2/x-auto");
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.http.timeout_seconds, 300);
        assert_eq!(config.account.api_base, "https://api.backblazeb2.com");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: TransferConfig = toml::from_str(
            r#"
            log_level = "debug"

            [download]
            concurrency = 8

            [retry]
            max_attempts = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.download.concurrency, 8);
        assert_eq!(config.download.chunk_size, 10_000_000);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.initial_delay_ms, 1000);
    }

    #[test]
    fn test_file_round_trip() {
        let mut config = TransferConfig::default();
        config.account.account_id = Some("acct".to_string());
        config.upload.part_size = 5_000_000;

        let file = NamedTempFile::new().unwrap();
        config.to_file(file.path()).unwrap();
        let loaded = TransferConfig::from_file(file.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_application_key_is_redacted_in_debug() {
        let mut config = TransferConfig::default();
        config.account.application_key = Some("very-secret".to_string());

        let debug = format!("{:?}", config);
        assert!(!debug.contains("very-secret"));
    }

    #[test]
    fn test_env_overrides_credentials() {
        let env: HashMap<&str, &str> = [(ENV_ACCOUNT_ID, "from-env"), (ENV_APPLICATION_KEY, "")]
            .into_iter()
            .collect();
        let mut config = TransferConfig::default();
        config.account.application_key = Some("from-file".to_string());
        config.apply_env_from(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.account.account_id.as_deref(), Some("from-env"));
        assert_eq!(config.account.application_key.as_deref(), Some("from-file"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = TransferConfig::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = TransferConfig::default();
        config.account.api_base = "ftp://example.com".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_policy_from_config() {
        let retry = RetryConfig {
            max_attempts: 7,
            initial_delay_ms: 250,
            max_delay_secs: 10,
            retry_transport_errors: false,
        };
        let policy = retry.policy();
        assert_eq!(policy.max_attempts, 7);
        assert_eq!(policy.initial_delay, Duration::from_millis(250));
        assert_eq!(policy.max_delay, Duration::from_secs(10));
    }

    #[test]
    fn test_effective_part_size() {
        let upload = UploadConfig {
            part_size: 1_000,
            ..Default::default()
        };
        assert_eq!(upload.effective_part_size(5_000_000), 5_000_000);
        assert_eq!(upload.effective_part_size(0), 1_000);
    }
}
