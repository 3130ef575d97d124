//! Agent configuration
//!
//! Built once at startup by the configuration loader (defaults, environment,
//! config file, CLI flags merged in that order) and never mutated afterwards.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use url::Url;

/// Errors from configuration validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("server URL is required")]
    MissingServer,

    #[error("authentication token is required")]
    MissingToken,

    #[error("server URL must start with ws:// or wss://: {url}")]
    InvalidServerScheme { url: String },

    #[error("invalid server URL: {0}")]
    InvalidServerUrl(#[from] url::ParseError),
}

/// Immutable configuration for one agent process.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// WebSocket endpoint, e.g. `wss://nexus.example.com/ws/agent/`.
    pub server: String,
    /// Authentication token presented on connect.
    pub token: String,
    /// Display name; defaults to the hostname.
    pub name: String,
    /// Root directory for task workspaces.
    pub workspace_root: PathBuf,
    /// Seconds between heartbeats; the ack window equals the interval.
    pub heartbeat_interval_secs: u64,
    /// Base delay for reconnect backoff, in seconds.
    pub reconnect_base_secs: u64,
    /// Cap for reconnect backoff, in seconds.
    pub reconnect_cap_secs: u64,
    /// Give up after this many consecutive failed connect attempts;
    /// 0 retries forever.
    pub max_reconnect_attempts: u32,
    /// Default command timeout when an assignment does not carry one.
    pub default_timeout_secs: u64,
    /// Per-stream cap on captured command output, in bytes.
    pub max_capture_bytes: usize,
    /// Minimum spacing between progress frames, in milliseconds.
    pub progress_interval_ms: u64,
    /// Register the agent as a login item at startup.
    pub autostart: bool,
    /// Extra arguments baked into the login-item command line.
    pub autostart_args: Vec<String>,
    /// Log level directive for the subscriber.
    pub log_level: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            token: String::new(),
            name: default_agent_name(),
            workspace_root: PathBuf::from("./workspaces"),
            heartbeat_interval_secs: 30,
            reconnect_base_secs: 1,
            reconnect_cap_secs: 60,
            max_reconnect_attempts: 0,
            default_timeout_secs: 3600,
            max_capture_bytes: 512 * 1024,
            progress_interval_ms: 1000,
            autostart: false,
            autostart_args: Vec::new(),
            log_level: "info".to_string(),
        }
    }
}

impl AgentConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn reconnect_base(&self) -> Duration {
        Duration::from_secs(self.reconnect_base_secs)
    }

    pub fn reconnect_cap(&self) -> Duration {
        Duration::from_secs(self.reconnect_cap_secs)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    /// Check the configuration before the runtime starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.is_empty() {
            return Err(ConfigError::MissingServer);
        }
        if self.token.is_empty() {
            return Err(ConfigError::MissingToken);
        }
        let url = Url::parse(&self.server)?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(ConfigError::InvalidServerScheme {
                url: self.server.clone(),
            });
        }
        Ok(())
    }

    /// Connect URL with the token and display name as query parameters.
    pub fn endpoint(&self) -> Result<Url, ConfigError> {
        let mut url = Url::parse(&self.server)?;
        url.query_pairs_mut()
            .append_pair("token", &self.token)
            .append_pair("name", &self.name);
        Ok(url)
    }
}

fn default_agent_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "relay-agent".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> AgentConfig {
        AgentConfig {
            server: "ws://localhost:8001/ws/agent/".to_string(),
            token: "secret".to_string(),
            ..AgentConfig::default()
        }
    }

    #[test]
    fn test_validate_ok() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validate_missing_fields() {
        let mut config = valid_config();
        config.server = String::new();
        assert!(matches!(config.validate(), Err(ConfigError::MissingServer)));

        let mut config = valid_config();
        config.token = String::new();
        assert!(matches!(config.validate(), Err(ConfigError::MissingToken)));
    }

    #[test]
    fn test_validate_rejects_http_scheme() {
        let mut config = valid_config();
        config.server = "http://localhost:8001".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidServerScheme { .. })
        ));
    }

    #[test]
    fn test_endpoint_carries_token_and_name() {
        let mut config = valid_config();
        config.name = "build box".to_string();
        let url = config.endpoint().unwrap();
        let query = url.query().unwrap();
        assert!(query.contains("token=secret"));
        assert!(query.contains("name=build+box"));
    }
}
