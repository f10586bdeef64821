//! Supervisor settings
//!
//! Layered with the `config` crate: built-in defaults, then an optional TOML
//! file, then `MODEM__`-prefixed environment variables
//! (`MODEM__SESSION__GPRS_ENABLED=true`).

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File, FileFormat};
use modem_protocol::{HandshakeConfig, LinkConfig, ModemConfig, PowerConfig, SessionConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Prefix of environment overrides
pub const ENV_PREFIX: &str = "MODEM";

/// What the supervisor does when the session fails
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RecoveryPolicy {
    /// Report the error and exit
    Halt,
    /// Power-cycle and start again, giving up after `max_restarts`
    /// consecutive failed starts
    Restart { max_restarts: u32, backoff_ms: u64 },
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        RecoveryPolicy::Restart {
            max_restarts: 5,
            backoff_ms: 5000,
        }
    }
}

impl RecoveryPolicy {
    pub fn backoff(&self) -> Option<Duration> {
        match self {
            RecoveryPolicy::Halt => None,
            RecoveryPolicy::Restart { backoff_ms, .. } => Some(Duration::from_millis(*backoff_ms)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// `trace`, `debug`, `info`, `warn` or `error`
    pub level: String,
    /// Emit JSON lines instead of plain text
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Serial device carrying AT traffic
    pub device: String,
    /// Serial adapter whose DTR/DSR lines drive the power key and status pin
    pub control_device: String,
    /// Forward stdin lines to the modem
    pub passthrough: bool,
    pub power: PowerConfig,
    pub handshake: HandshakeConfig,
    pub link: LinkConfig,
    pub session: SessionConfig,
    pub recovery: RecoveryPolicy,
    pub logging: LoggingSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            device: "/dev/ttyUSB0".to_string(),
            control_device: "/dev/ttyUSB1".to_string(),
            passthrough: false,
            power: PowerConfig::default(),
            handshake: HandshakeConfig::default(),
            link: LinkConfig::default(),
            session: SessionConfig::default(),
            recovery: RecoveryPolicy::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from `path` (skipped when missing) and the environment
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::layered(Config::builder().add_source(File::from(path).format(FileFormat::Toml).required(false)))
    }

    /// Load settings from TOML text and the environment
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Self::layered(Config::builder().add_source(File::from_str(text, FileFormat::Toml)))
    }

    fn layered(builder: ConfigBuilder<DefaultState>) -> Result<Self, ConfigError> {
        builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Protocol configuration for the session
    pub fn modem_config(&self) -> ModemConfig {
        ModemConfig {
            power: self.power.clone(),
            handshake: self.handshake.clone(),
            link: self.link.clone(),
            session: self.session.clone(),
        }
    }
}
