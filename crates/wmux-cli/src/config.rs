//! Client configuration at `~/.config/wmux/client.toml`.
//!
//! Provides the default worker URL and auth token. CLI flags always
//! override the environment, which overrides config file values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;
use wmux_core::AUTH_TOKEN_ENV;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Worker connection settings.
    #[serde(default)]
    pub worker: WorkerTarget,
}

/// `[worker]` section of the config TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerTarget {
    /// Worker WebSocket URL.
    #[serde(default = "default_url")]
    pub url: String,

    /// Shared-secret auth token.
    #[serde(default)]
    pub token: Option<String>,
}

impl Default for WorkerTarget {
    fn default() -> Self {
        Self {
            url: default_url(),
            token: None,
        }
    }
}

fn default_url() -> String {
    "ws://127.0.0.1:7703".to_string()
}

impl Config {
    /// Load configuration from a TOML file, returning defaults if the file
    /// does not exist.
    pub fn load(path: &str) -> Result<Self> {
        let path = Path::new(path);
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;

        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }
}

/// Effective worker URL: CLI flag, else config file, else the local default.
pub fn resolve_url(cli_url: Option<String>, cfg: &Config) -> String {
    cli_url.unwrap_or_else(|| cfg.worker.url.clone())
}

/// Effective auth token: CLI flag, else `WMUX_AUTH_TOKEN`, else config file.
pub fn resolve_token(cli_token: Option<String>, cfg: &Config) -> Result<String> {
    if let Some(token) = cli_token.filter(|t| !t.is_empty()) {
        return Ok(token);
    }
    if let Ok(token) = std::env::var(AUTH_TOKEN_ENV) {
        if !token.is_empty() {
            return Ok(token);
        }
    }
    if let Some(token) = cfg.worker.token.clone().filter(|t| !t.is_empty()) {
        return Ok(token);
    }
    anyhow::bail!(
        "no auth token: pass --token, set {AUTH_TOKEN_ENV}, or add one to the config file"
    )
}
