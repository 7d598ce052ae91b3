// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Askbox Contributors

//! Configuration management for the Askbox chat client.
//!
//! Configuration is loaded from the XDG config directory
//! (`~/.config/askbox/config.toml` on Linux). Every table is optional:
//!
//! ```toml
//! [server]
//! url = "ws://localhost:3000/relay"
//!
//! [api]
//! base_url = "http://localhost:3000"
//!
//! [session]
//! user_id = "alice"
//! reconnect = true
//! backoff_base_ms = 1000
//! backoff_max_ms = 30000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::SessionConfig;

/// Errors raised while reading or writing the config file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config I/O error for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Failed to determine XDG directories")]
    NoProjectDirs,
}

/// Relay server connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// WebSocket URL of the relay endpoint
    pub url: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            url: "ws://localhost:3000/relay".into(),
        }
    }
}

/// Persistence API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSection {
    /// Base URL of the chat persistence API
    pub base_url: String,
    /// Bearer token sent with API requests
    #[serde(skip_serializing)]
    pub token: Option<String>,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".into(),
            token: None,
        }
    }
}

/// Relay session behaviour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// Identity announced on every connect
    pub user_id: Option<String>,
    /// Reconnect after the connection drops
    pub reconnect: bool,
    /// First reconnect delay
    pub backoff_base_ms: u64,
    /// Upper bound for reconnect delays
    pub backoff_max_ms: u64,
    /// Give up after this many consecutive failures
    pub max_attempts: Option<u32>,
    /// Timeout for a single connection attempt
    pub connect_timeout_ms: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            user_id: None,
            reconnect: true,
            backoff_base_ms: 1000,
            backoff_max_ms: 30_000,
            max_attempts: None,
            connect_timeout_ms: 10_000,
        }
    }
}

/// Main configuration struct
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ClientConfig {
    pub server: ServerSection,
    pub api: ApiSection,
    pub session: SessionSection,
}

impl ClientConfig {
    /// Load configuration from the XDG config directory
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_file_path()?)
    }

    /// Load configuration from a specific file; a missing file yields
    /// the defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config file found at {:?}, using defaults", path);
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to the XDG config directory
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_file_path()?)
    }

    /// Save configuration to a specific file
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(io_err)?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Get the path to the config file
    pub fn config_file_path() -> Result<PathBuf, ConfigError> {
        let dirs = Self::project_dirs()?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    fn project_dirs() -> Result<ProjectDirs, ConfigError> {
        ProjectDirs::from("app", "askbox", "askbox").ok_or(ConfigError::NoProjectDirs)
    }

    /// Session settings for the relay connection.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            url: self.server.url.clone(),
            reconnect: self.session.reconnect,
            backoff_base: Duration::from_millis(self.session.backoff_base_ms),
            backoff_max: Duration::from_millis(self.session.backoff_max_ms),
            max_attempts: self.session.max_attempts,
            connect_timeout: Duration::from_millis(self.session.connect_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.server.url, "ws://localhost:3000/relay");
        assert!(config.session.reconnect);
        assert_eq!(config.session.backoff_base_ms, 1000);
        assert_eq!(config.session.backoff_max_ms, 30_000);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: ClientConfig = toml::from_str(
            r#"
            [session]
            user_id = "alice"
            reconnect = false
            "#,
        )
        .unwrap();

        assert_eq!(config.session.user_id.as_deref(), Some("alice"));
        assert!(!config.session.reconnect);
        assert_eq!(config.server, ServerSection::default());
        assert_eq!(config.api, ApiSection::default());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig::load_from(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config, ClientConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = ClientConfig::default();
        config.server.url = "ws://relay.example/relay".into();
        config.session.max_attempts = Some(5);
        config.api.token = Some("secret".into());
        config.save_to(&path).unwrap();

        let loaded = ClientConfig::load_from(&path).unwrap();
        assert_eq!(loaded.server.url, "ws://relay.example/relay");
        assert_eq!(loaded.session.max_attempts, Some(5));
        assert_eq!(loaded.api.token, None);
    }

    #[test]
    fn test_invalid_toml_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server\nurl = 1").unwrap();

        let err = ClientConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("config.toml"));
    }

    #[test]
    fn test_session_config() {
        let mut config = ClientConfig::default();
        config.session.backoff_base_ms = 250;
        let session = config.session_config();
        assert_eq!(session.backoff_base, Duration::from_millis(250));
        assert_eq!(session.url, "ws://localhost:3000/relay");
    }
}
