//! Configuration management for the ptybridge daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/ptybridge/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::FramingPolicy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Well-known port the browser terminal connects to.
pub const DEFAULT_PORT: u16 = 8080;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("bind_address must not be empty")]
    EmptyBindAddress,

    #[error("max_sessions must be between 1 and 10000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("grace_period_secs must be between 1 and 300 seconds, got {0}")]
    InvalidGracePeriod(u64),

    #[error("shell program does not exist: {0}")]
    InvalidShellPath(String),

    #[error("container runtime must not be empty")]
    EmptyContainerRuntime,

    #[error("container command must not be empty")]
    EmptyContainerCommand,

    #[error("log level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the ptybridge daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Listener configuration.
    pub server: ServerConfig,

    /// Host shell backend configuration.
    pub shell: ShellConfig,

    /// Container exec backend configuration.
    pub container: ContainerConfig,

    /// Wire protocol options.
    pub protocol: ProtocolConfig,

    /// Shutdown behaviour.
    pub shutdown: ShutdownConfig,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind the WebSocket listener to.
    pub bind_address: String,

    /// Port to listen on.
    pub port: u16,

    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,
}

/// Host shell configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShellConfig {
    /// Shell program to run inside the pseudo-terminal.
    pub program: String,

    /// Extra arguments passed to the shell.
    pub args: Vec<String>,

    /// Value of `TERM` for the shell.
    pub term: String,

    /// Locale forced through `LANG` and `LC_ALL`.
    pub locale: String,

    /// Working directory. Defaults to the home directory of the daemon user.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
}

/// Container exec configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ContainerConfig {
    /// Container runtime binary (`docker`, `podman`, ...).
    pub runtime: String,

    /// Command run inside the container.
    pub command: Vec<String>,
}

/// Wire protocol options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Which inbound frames may carry control messages.
    pub framing: FramingPolicy,
}

/// Shutdown configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShutdownConfig {
    /// How long live sessions get to close before the process is forced down.
    pub grace_period_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,

    /// Directory for daily-rolling log files. Logs go to stderr only when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            max_sessions: 64,
        }
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            program: default_shell(),
            args: Vec::new(),
            term: "xterm-color".to_string(),
            locale: "en_US.UTF-8".to_string(),
            working_dir: None,
        }
    }
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            runtime: "docker".to_string(),
            command: vec!["/bin/sh".to_string(), "-i".to_string()],
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: 5,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
        }
    }
}

impl ServerConfig {
    /// Returns the `host:port` string to bind.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

impl ShellConfig {
    /// Returns the working directory for new shells.
    pub fn resolved_working_dir(&self) -> Option<PathBuf> {
        self.working_dir.clone().or_else(dirs::home_dir)
    }
}

impl ShutdownConfig {
    /// Returns the grace period as a duration.
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ptybridge")
        .join("config.toml")
}

/// Returns the default shell for the current platform.
fn default_shell() -> String {
    if cfg!(windows) {
        "powershell.exe".to_string()
    } else {
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
    }
}

/// One environment variable that [`Config::apply_env_overrides`] acted on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvOverride {
    /// The variable replaced a configuration value.
    Applied {
        /// Variable name.
        variable: &'static str,
        /// Value taken from it.
        value: String,
    },
    /// The variable was set but could not be used.
    Ignored {
        /// Variable name.
        variable: &'static str,
        /// Value it held.
        value: String,
        /// Why it was not used.
        reason: String,
    },
}

impl EnvOverride {
    /// Logs this override. Call once tracing is initialized.
    pub fn log(&self) {
        match self {
            EnvOverride::Applied { variable, value } => {
                tracing::info!("Overriding configuration from {}: {}", variable, value);
            }
            EnvOverride::Ignored {
                variable,
                value,
                reason,
            } => {
                tracing::warn!("Ignoring invalid {} {:?}: {}", variable, value, reason);
            }
        }
    }
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - PTYBRIDGE_BIND_ADDRESS: Override the listen address
    /// - PTYBRIDGE_PORT: Override the listen port
    /// - PTYBRIDGE_SHELL: Override the host shell program
    /// - PTYBRIDGE_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    ///
    /// Overrides usually run before logging is set up, so nothing is logged
    /// here. The returned list says what happened; see [`EnvOverride::log`].
    pub fn apply_env_overrides(&mut self) -> Vec<EnvOverride> {
        let mut overrides = Vec::new();
        let applied = |variable, value: &str| EnvOverride::Applied {
            variable,
            value: value.to_string(),
        };

        if let Some(address) = non_empty_env("PTYBRIDGE_BIND_ADDRESS") {
            overrides.push(applied("PTYBRIDGE_BIND_ADDRESS", &address));
            self.server.bind_address = address;
        }

        if let Some(port) = non_empty_env("PTYBRIDGE_PORT") {
            match port.parse::<u16>() {
                Ok(parsed) => {
                    overrides.push(applied("PTYBRIDGE_PORT", &port));
                    self.server.port = parsed;
                }
                Err(e) => overrides.push(EnvOverride::Ignored {
                    variable: "PTYBRIDGE_PORT",
                    value: port,
                    reason: e.to_string(),
                }),
            }
        }

        if let Some(shell) = non_empty_env("PTYBRIDGE_SHELL") {
            overrides.push(applied("PTYBRIDGE_SHELL", &shell));
            self.shell.program = shell;
        }

        if let Some(level) = non_empty_env("PTYBRIDGE_LOG_LEVEL") {
            overrides.push(applied("PTYBRIDGE_LOG_LEVEL", &level));
            self.logging.level = level;
        }

        overrides
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.bind_address.trim().is_empty() {
            return Err(ConfigError::EmptyBindAddress);
        }

        if self.server.max_sessions < 1 || self.server.max_sessions > 10_000 {
            return Err(ConfigError::InvalidMaxSessions(self.server.max_sessions));
        }

        if self.shutdown.grace_period_secs < 1 || self.shutdown.grace_period_secs > 300 {
            return Err(ConfigError::InvalidGracePeriod(
                self.shutdown.grace_period_secs,
            ));
        }

        // The shell must exist, either as an absolute path or somewhere on PATH
        let shell_path = Path::new(&self.shell.program);
        if shell_path.is_absolute() {
            if !shell_path.exists() {
                return Err(ConfigError::InvalidShellPath(self.shell.program.clone()));
            }
        } else if which::which(&self.shell.program).is_err() {
            return Err(ConfigError::InvalidShellPath(self.shell.program.clone()));
        }

        // The container runtime is only looked up at spawn time; a host without
        // one can still serve local shells.
        if self.container.runtime.trim().is_empty() {
            return Err(ConfigError::EmptyContainerRuntime);
        }
        if self.container.command.is_empty() {
            return Err(ConfigError::EmptyContainerCommand);
        }

        let level = self.logging.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
