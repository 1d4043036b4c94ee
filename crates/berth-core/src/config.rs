//! Hub configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Configuration for the hub daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Address the realtime gateway binds to
    pub bind_address: String,

    /// Directory for scrollback and other hub-owned state
    pub data_dir: PathBuf,

    /// Address spawned CLIs use to call back into the hub (hooks)
    pub callback_address: String,

    /// Agent CLI invocation
    pub agent: AgentCliConfig,

    /// Grace period between the soft kill and the forced kill
    #[serde(with = "duration_secs")]
    pub kill_grace: Duration,

    /// Timeout for one-shot remote exec commands
    #[serde(with = "duration_secs")]
    pub exec_timeout: Duration,

    /// Timeout for establishing an SSH connection
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Per-shell scrollback cap on disk
    pub scrollback_limit_bytes: u64,

    /// Local worker provisioning
    pub local_worker: LocalWorkerConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:4970".to_string(),
            data_dir: default_data_dir(),
            callback_address: "http://127.0.0.1:4970".to_string(),
            agent: AgentCliConfig::default(),
            kill_grace: Duration::from_secs(5),
            exec_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            scrollback_limit_bytes: 256 * 1024,
            local_worker: LocalWorkerConfig::default(),
        }
    }
}

/// How to invoke the wrapped agent CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentCliConfig {
    /// Executable name or path
    pub command: String,
    /// Arguments always passed
    pub base_args: Vec<String>,
    /// Flag used to resume a specific conversation (takes the token)
    pub resume_flag: String,
    /// Flag used to continue the most recent conversation (no token)
    pub continue_flag: String,
}

impl Default for AgentCliConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            base_args: vec![],
            resume_flag: "--resume".to_string(),
            continue_flag: "--continue".to_string(),
        }
    }
}

impl AgentCliConfig {
    /// Arguments for a first-run session
    pub fn fresh_args(&self) -> Vec<String> {
        self.base_args.clone()
    }

    /// Arguments for a continued session. Uses the resume flag when a
    /// token is known, the bare continue flag otherwise.
    pub fn continue_args(&self, resume_token: Option<&str>) -> Vec<String> {
        let mut args = self.base_args.clone();
        match resume_token {
            Some(token) => {
                args.push(self.resume_flag.clone());
                args.push(token.to_string());
            }
            None => args.push(self.continue_flag.clone()),
        }
        args
    }
}

/// Provisioning for the singleton local worker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalWorkerConfig {
    /// Display name (defaults to "local")
    pub name: String,
    /// Admission limit
    pub max_concurrent_sessions: u32,
}

impl Default for LocalWorkerConfig {
    fn default() -> Self {
        Self {
            name: "local".to_string(),
            max_concurrent_sessions: 3,
        }
    }
}

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("berth")
}

/// Get the default configuration file path
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("hub.toml")
}

/// Get the default data directory
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("berth")
}

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    let config: T = toml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to a file
pub fn save_config<T: serde::Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ConfigError::Invalid(format!("Failed to create config dir: {}", e)))?;
    }

    std::fs::write(path, content)
        .map_err(|e| ConfigError::Invalid(format!("Failed to write config: {}", e)))?;

    Ok(())
}

// Helper module for Duration serialization as whole seconds
mod duration_secs {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HubConfig::default();
        assert_eq!(config.kill_grace, Duration::from_secs(5));
        assert_eq!(config.exec_timeout, Duration::from_secs(10));
        assert_eq!(config.agent.command, "claude");
        assert_eq!(config.local_worker.max_concurrent_sessions, 3);
    }

    #[test]
    fn test_continue_args_prefers_token() {
        let agent = AgentCliConfig::default();
        assert_eq!(
            agent.continue_args(Some("abc-123")),
            vec!["--resume".to_string(), "abc-123".to_string()]
        );
        assert_eq!(agent.continue_args(None), vec!["--continue".to_string()]);
    }

    #[test]
    fn test_partial_toml_round_trip() {
        let toml_src = r#"
            bind_address = "0.0.0.0:5000"
            kill_grace = 2

            [agent]
            command = "my-agent"
        "#;
        let config: HubConfig = toml::from_str(toml_src).unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:5000");
        assert_eq!(config.kill_grace, Duration::from_secs(2));
        assert_eq!(config.agent.command, "my-agent");
        // Unspecified fields keep defaults
        assert_eq!(config.exec_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_load_missing_file() {
        let err = load_config::<HubConfig>(Path::new("/nonexistent/hub.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }
}
