//! Worker configuration: TOML file + environment + CLI overrides.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::info;
use wmux_core::{WmuxResult, AUTH_TOKEN_ENV};

/// Top-level config file structure.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub worker: WorkerSection,
    #[serde(default)]
    pub session: SessionSection,
}

/// `[worker]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub token: Option<String>,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            token: None,
        }
    }
}

/// `[session]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_true")]
    pub default_session: bool,
    #[serde(default = "default_session_id")]
    pub default_session_id: String,
    #[serde(default = "default_history_bytes")]
    pub history_bytes: usize,
    #[serde(default)]
    pub shell: Option<String>,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            default_session: true,
            default_session_id: default_session_id(),
            history_bytes: default_history_bytes(),
            shell: None,
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:7703".to_string()
}
fn default_session_id() -> String {
    wmux_core::DEFAULT_SESSION_ID.to_string()
}
fn default_history_bytes() -> usize {
    wmux_core::DEFAULT_HISTORY_BYTES
}
fn default_true() -> bool {
    true
}

/// Resolved worker configuration (CLI and environment overrides applied).
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub listen: String,
    pub auth_token: String,
    /// True when no token was configured and an ephemeral one was generated.
    pub token_generated: bool,
    pub default_session: bool,
    pub default_session_id: String,
    pub history_bytes: usize,
    pub shell: Option<String>,
}

impl WorkerConfig {
    /// Load config from TOML file, then apply environment and CLI overrides.
    /// Token precedence: CLI flag, then `WMUX_AUTH_TOKEN`, then config file.
    pub fn load(
        config_path: Option<&Path>,
        cli_listen: Option<&str>,
        cli_token: Option<&str>,
    ) -> WmuxResult<Self> {
        // Load base config from file
        let file_config = if let Some(path) = config_path {
            let expanded = expand_tilde(path);
            if expanded.exists() {
                info!(path = %expanded.display(), "loading config file");
                let content = std::fs::read_to_string(&expanded)?;
                toml::from_str::<ConfigFile>(&content).map_err(|e| {
                    wmux_core::WmuxError::Config(format!("config parse error: {e}"))
                })?
            } else {
                info!(path = %expanded.display(), "config file not found, using defaults");
                ConfigFile {
                    worker: WorkerSection::default(),
                    session: SessionSection::default(),
                }
            }
        } else {
            ConfigFile {
                worker: WorkerSection::default(),
                session: SessionSection::default(),
            }
        };

        // Merge overrides
        let listen = cli_listen
            .map(|s| s.to_string())
            .unwrap_or(file_config.worker.listen);
        let env_token = std::env::var(AUTH_TOKEN_ENV).ok().filter(|t| !t.is_empty());
        let configured_token = cli_token
            .map(|s| s.to_string())
            .or(env_token)
            .or(file_config.worker.token);
        let (auth_token, token_generated) = match configured_token {
            Some(token) => (token, false),
            None => (wmux_core::generate_token(), true),
        };

        Ok(Self {
            listen,
            auth_token,
            token_generated,
            default_session: file_config.session.default_session,
            default_session_id: file_config.session.default_session_id,
            history_bytes: file_config.session.history_bytes,
            shell: file_config.session.shell,
        })
    }

    /// Parse the listen string into a socket address.
    pub fn listen_addr(&self) -> WmuxResult<SocketAddr> {
        self.listen.parse().map_err(|e| {
            wmux_core::WmuxError::Config(format!("invalid listen address '{}': {e}", self.listen))
        })
    }
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

pub fn expand_tilde_str(s: &str) -> PathBuf {
    if s.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(&s[2..]);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_when_file_missing() {
        let config =
            WorkerConfig::load(Some(Path::new("/nonexistent/wmux-worker.toml")), None, Some("tok"))
                .unwrap();
        assert_eq!(config.listen, "0.0.0.0:7703");
        assert_eq!(config.default_session_id, "session-1");
        assert!(config.default_session);
        assert_eq!(config.history_bytes, wmux_core::DEFAULT_HISTORY_BYTES);
        assert_eq!(config.auth_token, "tok");
        assert!(!config.token_generated);
    }

    #[test]
    fn file_values_are_read() {
        std::env::remove_var(AUTH_TOKEN_ENV);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[worker]\nlisten = \"127.0.0.1:9900\"\ntoken = \"filetok\"\n\n\
             [session]\ndefault_session = false\nhistory_bytes = 4096\nshell = \"/bin/bash\""
        )
        .unwrap();
        let config = WorkerConfig::load(Some(file.path()), None, None).unwrap();
        assert_eq!(config.listen, "127.0.0.1:9900");
        assert_eq!(config.auth_token, "filetok");
        assert!(!config.default_session);
        assert_eq!(config.history_bytes, 4096);
        assert_eq!(config.shell.as_deref(), Some("/bin/bash"));
    }

    #[test]
    fn cli_overrides_beat_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[worker]\nlisten = \"127.0.0.1:9900\"\ntoken = \"filetok\"").unwrap();
        let config =
            WorkerConfig::load(Some(file.path()), Some("127.0.0.1:1234"), Some("clitok")).unwrap();
        assert_eq!(config.listen, "127.0.0.1:1234");
        assert_eq!(config.auth_token, "clitok");
    }

    #[test]
    fn missing_token_generates_ephemeral() {
        std::env::remove_var(AUTH_TOKEN_ENV);
        let config =
            WorkerConfig::load(Some(Path::new("/nonexistent/wmux-worker.toml")), None, None)
                .unwrap();
        assert!(config.token_generated);
        assert_eq!(config.auth_token.len(), 64);
    }

    #[test]
    fn listen_addr_parses() {
        let config = WorkerConfig::load(None, Some("127.0.0.1:7000"), Some("t")).unwrap();
        assert_eq!(config.listen_addr().unwrap().port(), 7000);
        let bad = WorkerConfig::load(None, Some("not-an-addr"), Some("t")).unwrap();
        assert!(bad.listen_addr().is_err());
    }

    #[test]
    fn tilde_paths_expand() {
        let expanded = expand_tilde_str("~/wmux/worker.toml");
        assert!(!expanded.to_string_lossy().starts_with('~'));
        assert_eq!(expand_tilde_str("/abs/path"), PathBuf::from("/abs/path"));
    }
}
