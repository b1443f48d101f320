//! Bridge configuration
//!
//! Loaded once at startup from a YAML file supplied by the host plugin
//! runtime. The access token may come from the `HA_BRIDGE_TOKEN`
//! environment variable instead of the file.

mod error;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

pub use error::{ConfigError, ConfigResult};

/// Environment variable overriding the configured access token
pub const TOKEN_ENV_VAR: &str = "HA_BRIDGE_TOKEN";

/// Subdirectory of the host state directory owned by the bridge
const STATE_SUBDIR: &str = "ha-agent-bridge";

/// Top-level bridge configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// WebSocket API endpoint, e.g. `ws://homeassistant.local:8123/api/websocket`
    pub url: String,

    /// Long-lived access token; may be empty in the file when supplied
    /// via [`TOKEN_ENV_VAR`]
    #[serde(default)]
    pub access_token: String,

    /// Host state directory the rules file lives under
    pub state_dir: PathBuf,

    /// Session timing knobs
    #[serde(default)]
    pub session: SessionTuning,

    /// Which delivery sink to run
    #[serde(default)]
    pub delivery: DeliveryConfig,
}

/// Session timing knobs, in seconds
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionTuning {
    pub keepalive_secs: u64,
    pub backoff_initial_secs: u64,
    pub backoff_max_secs: u64,
    pub command_timeout_secs: u64,
}

impl Default for SessionTuning {
    fn default() -> Self {
        Self {
            keepalive_secs: 30,
            backoff_initial_secs: 1,
            backoff_max_secs: 30,
            command_timeout_secs: 120,
        }
    }
}

impl SessionTuning {
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_secs(self.backoff_initial_secs)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Delivery sink selection
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DeliveryConfig {
    /// Inject trigger text into the active agent session
    Session,

    /// Spawn an external command with the trigger text as final argument
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self::Session
    }
}

impl BridgeConfig {
    /// Load configuration from a YAML file
    ///
    /// `HA_BRIDGE_TOKEN` overrides the file's `access_token` when set;
    /// a token must come from one of the two.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config: Self =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::ParseYaml {
                path: path.to_path_buf(),
                source,
            })?;

        if let Ok(token) = std::env::var(TOKEN_ENV_VAR) {
            if !token.is_empty() {
                config.access_token = token;
            }
        }

        if config.access_token.is_empty() {
            return Err(ConfigError::MissingToken {
                path: path.to_path_buf(),
            });
        }

        debug!(url = %config.url, "Loaded bridge configuration");
        Ok(config)
    }

    /// Path of the rules file under the bridge-scoped state subdirectory
    pub fn rules_path(&self) -> PathBuf {
        self.state_dir.join(STATE_SUBDIR).join("rules.json")
    }
}
