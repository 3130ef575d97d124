//! Configuration loading
//!
//! Settings come from four layers, later ones winning: built-in
//! defaults, a YAML config file, `RELAY_*` environment variables, and
//! command-line flags. The environment variables are wired through clap,
//! so they behave exactly like their flags.

use std::path::{Path, PathBuf};

use clap::Parser;
use serde::Deserialize;
use thiserror::Error;

use relay_core::config::{AgentConfig, ConfigError};

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error(transparent)]
    Invalid(#[from] ConfigError),
}

/// Command-line interface.
#[derive(Debug, Parser)]
#[command(name = "relay-agent", version, about = "Persistent remote-execution agent")]
pub struct Cli {
    /// Path to a YAML config file
    #[arg(short, long, env = "RELAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// WebSocket server URL (ws:// or wss://)
    #[arg(short, long, env = "RELAY_SERVER")]
    pub server: Option<String>,

    /// Authentication token
    #[arg(short, long, env = "RELAY_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Agent display name (defaults to the hostname)
    #[arg(short, long, env = "RELAY_NAME")]
    pub name: Option<String>,

    /// Root directory for task workspaces
    #[arg(long, env = "RELAY_WORKSPACE_ROOT")]
    pub workspace_root: Option<PathBuf>,

    /// Log level directive (e.g. info, debug, relay_agent=trace)
    #[arg(long, env = "RELAY_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Register the agent to start at login
    #[arg(long, env = "RELAY_AUTOSTART")]
    pub autostart: bool,
}

/// Shape of the YAML config file; every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    server: Option<String>,
    token: Option<String>,
    name: Option<String>,
    workspace_root: Option<PathBuf>,
    heartbeat_interval_secs: Option<u64>,
    reconnect_base_secs: Option<u64>,
    reconnect_cap_secs: Option<u64>,
    max_reconnect_attempts: Option<u32>,
    default_timeout_secs: Option<u64>,
    max_capture_bytes: Option<usize>,
    progress_interval_ms: Option<u64>,
    autostart: Option<bool>,
    autostart_args: Option<Vec<String>>,
    log_level: Option<String>,
}

impl FileConfig {
    fn load(path: &Path) -> Result<Self, ConfigLoadError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigLoadError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|source| ConfigLoadError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn apply(self, config: &mut AgentConfig) {
        macro_rules! take {
            ($field:ident) => {
                if let Some(value) = self.$field {
                    config.$field = value;
                }
            };
        }
        take!(server);
        take!(token);
        take!(name);
        take!(workspace_root);
        take!(heartbeat_interval_secs);
        take!(reconnect_base_secs);
        take!(reconnect_cap_secs);
        take!(max_reconnect_attempts);
        take!(default_timeout_secs);
        take!(max_capture_bytes);
        take!(progress_interval_ms);
        take!(autostart);
        take!(autostart_args);
        take!(log_level);
    }
}

/// Merge all layers into a validated configuration.
pub fn load(cli: &Cli) -> Result<AgentConfig, ConfigLoadError> {
    let mut config = AgentConfig::default();

    if let Some(path) = &cli.config {
        FileConfig::load(path)?.apply(&mut config);
    }

    if let Some(server) = &cli.server {
        config.server = server.clone();
    }
    if let Some(token) = &cli.token {
        config.token = token.clone();
    }
    if let Some(name) = &cli.name {
        config.name = name.clone();
    }
    if let Some(root) = &cli.workspace_root {
        config.workspace_root = root.clone();
    }
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }
    if cli.autostart {
        config.autostart = true;
    }

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn cli(args: &[&str]) -> Cli {
        let mut full = vec!["relay-agent"];
        full.extend_from_slice(args);
        Cli::parse_from(full)
    }

    fn write_config(yaml: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_cli_only() {
        let cli = cli(&["--server", "ws://localhost:8001/ws/agent/", "--token", "s"]);
        let config = load(&cli).unwrap();
        assert_eq!(config.server, "ws://localhost:8001/ws/agent/");
        assert_eq!(config.token, "s");
        assert_eq!(config.heartbeat_interval_secs, 30);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let file = write_config(
            "server: ws://example.com/ws/agent/\ntoken: secret\nheartbeat_interval_secs: 10\n",
        );
        let cli = cli(&["--config", file.path().to_str().unwrap()]);
        let config = load(&cli).unwrap();
        assert_eq!(config.server, "ws://example.com/ws/agent/");
        assert_eq!(config.heartbeat_interval_secs, 10);
    }

    #[test]
    fn test_cli_overrides_file() {
        let file = write_config("server: ws://file.example/ws/\ntoken: from-file\n");
        let cli = cli(&[
            "--config",
            file.path().to_str().unwrap(),
            "--token",
            "from-cli",
        ]);
        let config = load(&cli).unwrap();
        assert_eq!(config.server, "ws://file.example/ws/");
        assert_eq!(config.token, "from-cli");
    }

    #[test]
    fn test_missing_token_is_rejected() {
        let cli = cli(&["--server", "ws://localhost:8001/"]);
        assert!(matches!(
            load(&cli),
            Err(ConfigLoadError::Invalid(ConfigError::MissingToken))
        ));
    }

    #[test]
    fn test_unknown_file_key_is_rejected() {
        let file = write_config("server: ws://x/\ntoken: t\nshenanigans: true\n");
        let cli = cli(&["--config", file.path().to_str().unwrap()]);
        assert!(matches!(load(&cli), Err(ConfigLoadError::Parse { .. })));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let cli = cli(&["--config", "/no/such/file.yaml"]);
        assert!(matches!(load(&cli), Err(ConfigLoadError::Read { .. })));
    }
}
