//! Server configuration.
//!
//! Values are layered, lowest precedence first:
//!
//! 1. Built-in defaults
//! 2. An optional `askbox-server.toml` file
//! 3. `ASKBOX_`-prefixed environment variables
//! 4. `PORT`, the variable hosting platforms use to assign the listen port
//!
//! # Environment Variables
//!
//! - `PORT`: Listen port. Missing is logged as an error and `3000` is used
//! - `ASKBOX_HOST`: Bind address. Default: `0.0.0.0`
//! - `ASKBOX_PORT`: Listen port when `PORT` is not set
//! - `ASKBOX_ALLOWED_ORIGINS`: Comma-separated CORS origins, `*` for any
//! - `ASKBOX_REGISTRATION_POLICY`: `first_wins` (default) or `last_wins`
//! - `ASKBOX_PRESENCE_MODE`: `delta` (default) or `snapshot`
//! - `ASKBOX_OUTBOUND_BUFFER`: Per-connection outbound frames. Default: `256`
//! - `ASKBOX_PRESENCE_CAPACITY`: Presence frames buffered per connection. Default: `1024`

use std::path::Path;

use anyhow::{bail, Context, Result};
use askbox_relay::hub::{DEFAULT_OUTBOUND_BUFFER, DEFAULT_PRESENCE_CAPACITY};
use askbox_relay::{PresenceMode, RegistrationPolicy, RelayConfig};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

/// Config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "askbox-server.toml";

/// Port used when none is configured.
pub const DEFAULT_PORT: u16 = 3000;

const ENV_PREFIX: &str = "ASKBOX";

/// Relay server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Origins allowed by CORS; `*` allows any origin
    pub allowed_origins: Vec<String>,
    /// Policy for a second registration of the same user
    pub registration_policy: RegistrationPolicy,
    /// How presence changes are published
    pub presence_mode: PresenceMode,
    /// Per-connection outbound channel size
    pub outbound_buffer: usize,
    /// Presence frames buffered per connection before it lags
    pub presence_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            allowed_origins: vec![
                "https://c42-team-c.herokuapp.com".to_string(),
                "http://localhost:8080".to_string(),
            ],
            registration_policy: RegistrationPolicy::default(),
            presence_mode: PresenceMode::default(),
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            presence_capacity: DEFAULT_PRESENCE_CAPACITY,
        }
    }
}

impl ServerConfig {
    /// Load configuration from the process environment and `file`, or
    /// [`DEFAULT_CONFIG_FILE`] when no file is given.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let file = file.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        Self::load_from(Some(file), std::env::vars().collect())
    }

    /// Load configuration from an optional file and an explicit set of
    /// environment variables.
    pub fn load_from(file: Option<&Path>, env: config::Map<String, String>) -> Result<Self> {
        let port_override = env.get("PORT").cloned();
        let port_configured = port_override.is_some() || env.contains_key("ASKBOX_PORT");

        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("allowed_origins")
                .source(Some(env)),
        );
        if let Some(port) = port_override {
            builder = builder
                .set_override("port", port)
                .context("Failed to apply PORT")?;
        }

        let settings = builder.build().context("Failed to read server configuration")?;

        if !port_configured && settings.get_int("port").is_err() {
            error!(
                default = DEFAULT_PORT,
                "Cannot find a PORT number, falling back to the default"
            );
        }

        let config: ServerConfig = settings
            .try_deserialize()
            .context("Invalid server configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.outbound_buffer == 0 {
            bail!("outbound_buffer must be greater than zero");
        }
        if self.presence_capacity == 0 {
            bail!("presence_capacity must be greater than zero");
        }
        Ok(())
    }

    /// `host:port` to bind.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether CORS accepts any origin.
    pub fn allows_any_origin(&self) -> bool {
        self.allowed_origins.iter().any(|o| o.trim() == "*")
    }

    /// Relay hub settings carried by this configuration.
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            registration_policy: self.registration_policy,
            presence_mode: self.presence_mode,
            outbound_buffer: self.outbound_buffer,
            presence_capacity: self.presence_capacity,
        }
    }

    /// Log the current server configuration.
    pub fn log_config(&self) {
        info!("Listening address: {}", self.bind_addr());
        info!("Registration policy: {}", self.registration_policy);
        info!("Presence mode: {}", self.presence_mode);
        if self.allows_any_origin() {
            info!("CORS: any origin");
        } else {
            info!("CORS origins: {}", self.allowed_origins.join(", "));
        }
    }
}
