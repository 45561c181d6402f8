//! Configuration loaded from `cascade.toml`.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    ReadFailed {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    ParseFailed(#[from] toml::de::Error),

    #[error("config validation error: {message}")]
    Validation { message: String },
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CascadeConfig {
    pub executor: ExecutorConfig,
    pub retry: RetryConfig,
    pub approval: ApprovalConfig,
    pub database: DatabaseConfig,
}

/// Executor scheduling and timeout knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ExecutorConfig {
    /// Upper bound on simultaneously active runs; excess starts queue.
    pub max_concurrent_runs: usize,
    /// Ceiling applied to any node without an explicit timeout.
    pub default_node_timeout_seconds: u64,
    /// Safety cap on loop iterations when a node does not set its own.
    pub default_max_iterations: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 32,
            default_node_timeout_seconds: 300,
            default_max_iterations: 1000,
        }
    }
}

/// Centralized retry defaults. A node's `retryPolicy` overrides these
/// field-by-field; nodes without a policy inherit them unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 500,
            backoff_multiplier: 2.0,
            max_backoff_ms: 30_000,
        }
    }
}

/// Approval-node defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ApprovalConfig {
    /// Applied when an approval node does not set `timeoutMinutes`.
    pub default_timeout_minutes: u64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            default_timeout_minutes: 60 * 24,
        }
    }
}

/// Relational store connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://cascade.db".to_string(),
            max_connections: 5,
        }
    }
}

/// Load and validate a `CascadeConfig` from a TOML file path.
///
/// Returns the default config if the file does not exist.
pub fn load_config(path: &Path) -> Result<CascadeConfig, ConfigError> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "config file not found, using defaults");
        return Ok(CascadeConfig::default());
    }

    let data = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed {
        path: path.display().to_string(),
        source: e,
    })?;

    parse_config(&data)
}

/// Parse and validate a `CascadeConfig` from a TOML string.
pub fn parse_config(data: &str) -> Result<CascadeConfig, ConfigError> {
    let config: CascadeConfig = toml::from_str(data)?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &CascadeConfig) -> Result<(), ConfigError> {
    if config.executor.max_concurrent_runs == 0 {
        return Err(ConfigError::Validation {
            message: "executor.max_concurrent_runs must be > 0".to_string(),
        });
    }

    if config.executor.default_node_timeout_seconds == 0 {
        return Err(ConfigError::Validation {
            message: "executor.default_node_timeout_seconds must be > 0".to_string(),
        });
    }

    if config.retry.max_attempts == 0 {
        return Err(ConfigError::Validation {
            message: "retry.max_attempts must be > 0".to_string(),
        });
    }

    if !config.retry.backoff_multiplier.is_finite() || config.retry.backoff_multiplier < 1.0 {
        return Err(ConfigError::Validation {
            message: format!(
                "retry.backoff_multiplier must be >= 1.0, got {}",
                config.retry.backoff_multiplier
            ),
        });
    }

    if config.retry.max_backoff_ms < config.retry.backoff_ms {
        return Err(ConfigError::Validation {
            message: "retry.max_backoff_ms must be >= retry.backoff_ms".to_string(),
        });
    }

    if config.approval.default_timeout_minutes == 0 {
        return Err(ConfigError::Validation {
            message: "approval.default_timeout_minutes must be > 0".to_string(),
        });
    }

    if config.database.max_connections == 0 {
        return Err(ConfigError::Validation {
            message: "database.max_connections must be > 0".to_string(),
        });
    }

    Ok(())
}
