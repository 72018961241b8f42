//! SDK configuration.
//!
//! Layered from lowest to highest precedence: compiled-in defaults, an
//! optional TOML file, `EVALLINK_*` environment variables, and finally
//! explicit values from the caller (the CLI maps its flags onto
//! [`SdkConfig::apply`]).

use std::path::{Path, PathBuf};

use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::ConfigError;

pub const DEFAULT_BASE_PATH: &str = "https://evallink.dev/api";

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "EVALLINK_CONFIG";

/// Config file looked up in the working directory when `EVALLINK_CONFIG` is unset.
pub const LOCAL_CONFIG_FILE: &str = "evallink.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SdkConfig {
    pub api_key: Option<String>,
    /// Base URL of the platform REST API, e.g. `https://evallink.dev/api`.
    pub base_path: String,
    /// Label used to identify this process to the orchestrator.
    pub environment_name: Option<String>,
}

impl Default for SdkConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_path: DEFAULT_BASE_PATH.to_string(),
            environment_name: None,
        }
    }
}

/// Caller-supplied values that override every other layer.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub api_key: Option<String>,
    pub base_path: Option<String>,
    pub environment_name: Option<String>,
}

impl SdkConfig {
    /// Load a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Defaults, then the config file, then environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::file_or_default();
        config.apply(ConfigOverrides {
            api_key: env_var("EVALLINK_API_KEY"),
            base_path: env_var("EVALLINK_BASE_PATH"),
            environment_name: env_var("EVALLINK_ENVIRONMENT"),
        });
        config
    }

    fn file_or_default() -> Self {
        let path = match std::env::var(CONFIG_ENV) {
            Ok(p) => PathBuf::from(p),
            Err(_) => {
                let local = PathBuf::from(LOCAL_CONFIG_FILE);
                if !local.exists() {
                    debug!("no config file found, using defaults");
                    return Self::default();
                }
                local
            }
        };

        match Self::load(&path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "config file could not be loaded, using defaults");
                Self::default()
            }
        }
    }

    /// Overlay any values present in `overrides`.
    pub fn apply(&mut self, overrides: ConfigOverrides) {
        if let Some(key) = overrides.api_key {
            self.api_key = Some(key);
        }
        if let Some(base) = overrides.base_path {
            self.base_path = base;
        }
        if let Some(env) = overrides.environment_name {
            self.environment_name = Some(env);
        }
    }

    /// The API key, or the one error that is fatal at `listen()` entry.
    pub fn require_api_key(&self) -> Result<&str, ConfigError> {
        self.api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or(ConfigError::MissingApiKey)
    }

    /// WebSocket endpoint derived from the base path.
    pub fn websocket_url(&self) -> Result<String, ConfigError> {
        let url = Url::parse(&self.base_path).map_err(|e| ConfigError::InvalidBasePath {
            base_path: self.base_path.clone(),
            reason: e.to_string(),
        })?;
        let host = url.host_str().ok_or_else(|| ConfigError::InvalidBasePath {
            base_path: self.base_path.clone(),
            reason: "no host".to_string(),
        })?;

        if host == "localhost" {
            Ok("ws://localhost:3001".to_string())
        } else {
            Ok(format!("wss://{host}/ws"))
        }
    }

    /// Environment name, falling back to the machine's hostname.
    pub fn environment_label(&self) -> String {
        self.environment_name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(hostname)
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn hostname() -> String {
    if let Some(name) = env_var("HOSTNAME") {
        return name;
    }
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown-host".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn with_base(base: &str) -> SdkConfig {
        SdkConfig {
            base_path: base.to_string(),
            ..SdkConfig::default()
        }
    }

    #[test]
    fn test_localhost_maps_to_dev_socket() {
        assert_eq!(
            with_base("http://localhost:3000/api").websocket_url().unwrap(),
            "ws://localhost:3001"
        );
    }

    #[test]
    fn test_remote_host_maps_to_wss_path() {
        assert_eq!(
            with_base("https://eu.evallink.dev/api").websocket_url().unwrap(),
            "wss://eu.evallink.dev/ws"
        );
    }

    #[test]
    fn test_invalid_base_path_is_reported() {
        assert!(matches!(
            with_base("not a url").websocket_url(),
            Err(ConfigError::InvalidBasePath { .. })
        ));
    }

    #[test]
    fn test_missing_or_blank_api_key_is_fatal() {
        let mut config = SdkConfig::default();
        assert!(matches!(config.require_api_key(), Err(ConfigError::MissingApiKey)));

        config.api_key = Some("  ".into());
        assert!(config.require_api_key().is_err());

        config.api_key = Some("sk-1".into());
        assert_eq!(config.require_api_key().unwrap(), "sk-1");
    }

    #[test]
    fn test_explicit_environment_name_wins_over_hostname() {
        let mut config = SdkConfig::default();
        config.environment_name = Some("staging".into());
        assert_eq!(config.environment_label(), "staging");

        config.environment_name = None;
        assert!(!config.environment_label().is_empty());
    }

    #[test]
    fn test_overrides_apply_only_present_values() {
        let mut config = SdkConfig {
            api_key: Some("file-key".into()),
            ..SdkConfig::default()
        };
        config.apply(ConfigOverrides {
            base_path: Some("http://localhost:3000/api".into()),
            ..ConfigOverrides::default()
        });
        assert_eq!(config.api_key.as_deref(), Some("file-key"));
        assert_eq!(config.base_path, "http://localhost:3000/api");
    }

    #[test]
    fn test_load_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "api_key = \"sk-file\"\nenvironment_name = \"ci\"").unwrap();

        let config = SdkConfig::load(file.path()).unwrap();
        assert_eq!(config.api_key.as_deref(), Some("sk-file"));
        assert_eq!(config.base_path, DEFAULT_BASE_PATH);
        assert_eq!(config.environment_name.as_deref(), Some("ci"));
    }

    #[test]
    fn test_load_rejects_bad_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "api_key = [").unwrap();
        assert!(matches!(
            SdkConfig::load(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }
}
