use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use thiserror::Error;

const DEFAULT_SERVER_URL: &str = "http://localhost:8080";
const DEFAULT_WORKERS: usize = 10;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

/// Runtime settings for one remediation run.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemediationConfig {
    pub server_url: String,
    pub token: Option<String>,
    /// Download worker pool size.
    pub workers: usize,
    /// Scratch tree for backups and staged artifacts.
    pub workdir: PathBuf,
    /// Filesystem root the OS fixers operate on.
    pub root: PathBuf,
    pub request_timeout_secs: u64,
}

impl Default for RemediationConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            token: None,
            workers: DEFAULT_WORKERS,
            workdir: env::temp_dir().join("package-sealer"),
            root: PathBuf::from("/"),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl RemediationConfig {
    /// Builds the configuration from `PACKAGE_SEALER_*` variables on top of
    /// the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(url) = get("PACKAGE_SEALER_SERVER_URL") {
            config.server_url = url;
        }
        config.token = get("PACKAGE_SEALER_TOKEN");
        if let Some(raw) = get("PACKAGE_SEALER_WORKERS") {
            config.workers = match raw.parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(ConfigError::Invalid {
                        key: "PACKAGE_SEALER_WORKERS",
                        value: raw,
                    })
                }
            };
        }
        if let Some(dir) = get("PACKAGE_SEALER_WORKDIR") {
            config.workdir = PathBuf::from(dir);
        }
        if let Some(root) = get("PACKAGE_SEALER_ROOT") {
            config.root = PathBuf::from(root);
        }
        if let Some(raw) = get("PACKAGE_SEALER_REQUEST_TIMEOUT_SECS") {
            config.request_timeout_secs =
                raw.parse::<u64>().map_err(|_| ConfigError::Invalid {
                    key: "PACKAGE_SEALER_REQUEST_TIMEOUT_SECS",
                    value: raw,
                })?;
        }
        Ok(config)
    }
}
