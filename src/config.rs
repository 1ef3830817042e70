//! Configuration file schema, defaults, and load/create helpers.

use crate::shared::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Append log output to this file instead of stderr.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,
    /// Log every proxied request, not only failures.
    pub log_requests: bool,
    /// Censor credential-shaped parameter values in the request log.
    pub censor_log: bool,
    pub debug: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_file: None,
            log_requests: false,
            censor_log: true,
            debug: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen: String,
    /// Runtime worker threads; zero picks the tokio default.
    pub threads: usize,
    /// Upstream worker tasks; bounds outstanding upstream POSTs.
    pub workers: usize,
    pub retries: u32,
    pub api_timeout_secs: u64,
    pub requests_per_second: usize,
    pub error_period_secs: u64,
    pub max_errors: usize,
    pub base_url: String,
    pub user_agent: String,
    pub cache_path: PathBuf,
    /// Clear the persisted cache at startup instead of reloading it.
    pub fast_start: bool,
    /// Additional pages to proxy with the default handler.
    pub extra_pages: Vec<String>,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:3748".to_string(),
            threads: 0,
            workers: 10,
            retries: 3,
            api_timeout_secs: 60,
            requests_per_second: 30,
            error_period_secs: 60,
            max_errors: 75,
            base_url: "https://api.eveonline.com/".to_string(),
            user_agent: format!("apiproxy/{}", env!("CARGO_PKG_VERSION")),
            cache_path: PathBuf::from("apicache.db"),
            fast_start: false,
            extra_pages: Vec::new(),
            logging: LoggingConfig::default(),
        }
    }
}

fn validate(config: &Config) -> AppResult<()> {
    if config.listen.trim().is_empty() {
        return Err(AppError::new("CONFIG_INVALID", "listen address is required"));
    }
    if config.base_url.trim().is_empty() {
        return Err(AppError::new("CONFIG_INVALID", "base_url is required"));
    }
    if config.workers == 0 {
        return Err(AppError::new("CONFIG_INVALID", "workers must be > 0"));
    }
    if config.requests_per_second == 0 {
        return Err(AppError::new(
            "CONFIG_INVALID",
            "requests_per_second must be > 0",
        ));
    }
    if config.max_errors == 0 || config.error_period_secs == 0 {
        return Err(AppError::new(
            "CONFIG_INVALID",
            "max_errors and error_period_secs must be > 0",
        ));
    }
    Ok(())
}

pub fn load(path: &Path) -> AppResult<Config> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| AppError::new("CONFIG_READ", format!("{}: {e}", path.display())))?;
    let config: Config = toml::from_str(&raw)
        .map_err(|e| AppError::new("CONFIG_INVALID", format!("{}: {e}", path.display())))?;
    validate(&config)?;
    Ok(config)
}

/// Write the default configuration for operators to edit.
pub fn write_default(path: &Path) -> AppResult<()> {
    let rendered = toml::to_string_pretty(&Config::default())
        .map_err(|e| AppError::new("CONFIG_ENCODE", e.to_string()))?;
    std::fs::write(path, rendered)
        .map_err(|e| AppError::new("CONFIG_WRITE", format!("{}: {e}", path.display())))?;
    Ok(())
}
