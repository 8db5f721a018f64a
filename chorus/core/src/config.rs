//! Configuration
//!
//! Settings are layered, lowest priority first:
//!
//! 1. Built-in defaults
//! 2. TOML file (`--config <path>` or `$XDG_CONFIG_HOME/chorus/config.toml`)
//! 3. Environment variables
//! 4. Command-line overrides
//!
//! # Example file
//!
//! ```toml
//! [server]
//! listen_addr = "127.0.0.1:5000"
//!
//! [backend]
//! host = "localhost"
//! port = 11434
//! default_model = "llama3.2"
//!
//! [session]
//! idle_poll_ms = 50
//! channel_capacity = 100
//! max_models = 16
//! ```
//!
//! # Environment Variables
//!
//! - `OLLAMA_HOST` / `OLLAMA_PORT`: inference server address
//! - `CHORUS_LISTEN_ADDR`: HTTP listen address
//! - `CHORUS_DEFAULT_MODEL`: model used by `/query` when none is given
//! - `CHORUS_REQUEST_TIMEOUT`: non-streaming request timeout in seconds
//! - `CHORUS_IDLE_POLL_MS`: aggregator idle wait between empty poll passes
//! - `CHORUS_CHANNEL_CAPACITY`: per-model fragment channel capacity
//! - `CHORUS_MAX_MODELS`: maximum distinct models per session

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Where the effective configuration came from (highest layer applied)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConfigSource {
    /// Nothing but built-in defaults
    #[default]
    Default,
    /// A TOML file supplied values
    File,
    /// At least one environment variable was applied
    Env,
    /// At least one command-line override was applied
    Cli,
}

/// Errors while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// File that failed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML for this schema
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// File that failed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: toml::de::Error,
    },

    /// A value is out of range
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// `[server]` section
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP surface binds to
    pub listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:5000".to_string(),
        }
    }
}

/// `[backend]` section: where the inference server lives
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Host name, or a full base URL such as `http://gpu-box:11434`
    pub host: String,
    /// Port (ignored when `host` is a full URL)
    pub port: u16,
    /// TCP connect timeout in seconds
    pub connect_timeout_secs: u64,
    /// Timeout for non-streaming generate requests in seconds
    pub request_timeout_secs: u64,
    /// Timeout for listing models in seconds
    pub list_timeout_secs: u64,
    /// Model used when a non-streaming query names none
    pub default_model: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 11434,
            connect_timeout_secs: 5,
            request_timeout_secs: 120,
            list_timeout_secs: 10,
            default_model: "llama3.2".to_string(),
        }
    }
}

impl BackendConfig {
    /// Create a configuration pointing at `host:port`
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Base URL of the server, without the `/api` suffix
    #[must_use]
    pub fn base_url(&self) -> String {
        if self.host.contains("://") {
            self.host.trim_end_matches('/').to_string()
        } else {
            format!("http://{}:{}", self.host, self.port)
        }
    }

    /// Connect timeout
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Non-streaming request timeout
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// List-models timeout
    #[must_use]
    pub fn list_timeout(&self) -> Duration {
        Duration::from_secs(self.list_timeout_secs)
    }
}

/// `[session]` section: multi-model session tuning
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle wait between poll passes that found nothing, in milliseconds
    pub idle_poll_ms: u64,
    /// Capacity of each per-model fragment channel
    pub channel_capacity: usize,
    /// Maximum distinct models in one session
    pub max_models: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_poll_ms: 50,
            channel_capacity: 100,
            max_models: 16,
        }
    }
}

/// Complete daemon configuration
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChorusConfig {
    /// HTTP surface settings
    pub server: ServerConfig,
    /// Inference server settings
    pub backend: BackendConfig,
    /// Multi-model session settings
    pub session: SessionConfig,
    #[serde(skip)]
    source: ConfigSource,
}

impl ChorusConfig {
    /// Where the effective values came from
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Parse a TOML document
    pub fn from_toml_str(content: &str, path: &Path) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.source = ConfigSource::File;
        Ok(config)
    }

    /// Apply environment variables from the process environment
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Apply environment variables using `lookup` to read them.
    ///
    /// Unparseable values are ignored with a warning, leaving the lower layer
    /// in place.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let mut applied = false;

        if let Some(host) = lookup("OLLAMA_HOST") {
            self.backend.host = host;
            applied = true;
        }
        if let Some(port) = parse_var(&lookup, "OLLAMA_PORT") {
            self.backend.port = port;
            applied = true;
        }
        if let Some(addr) = lookup("CHORUS_LISTEN_ADDR") {
            self.server.listen_addr = addr;
            applied = true;
        }
        if let Some(model) = lookup("CHORUS_DEFAULT_MODEL") {
            self.backend.default_model = model;
            applied = true;
        }
        if let Some(secs) = parse_var(&lookup, "CHORUS_REQUEST_TIMEOUT") {
            self.backend.request_timeout_secs = secs;
            applied = true;
        }
        if let Some(ms) = parse_var(&lookup, "CHORUS_IDLE_POLL_MS") {
            self.session.idle_poll_ms = ms;
            applied = true;
        }
        if let Some(capacity) = parse_var(&lookup, "CHORUS_CHANNEL_CAPACITY") {
            self.session.channel_capacity = capacity;
            applied = true;
        }
        if let Some(max) = parse_var(&lookup, "CHORUS_MAX_MODELS") {
            self.session.max_models = max;
            applied = true;
        }

        if applied {
            self.source = ConfigSource::Env;
        }
    }

    /// Reject values the aggregator cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "session.channel_capacity must be at least 1".into(),
            ));
        }
        if self.session.max_models == 0 {
            return Err(ConfigError::Invalid(
                "session.max_models must be at least 1".into(),
            ));
        }
        if self.session.idle_poll_ms == 0 {
            return Err(ConfigError::Invalid(
                "session.idle_poll_ms must be at least 1".into(),
            ));
        }
        if self.backend.host.trim().is_empty() {
            return Err(ConfigError::Invalid("backend.host must not be empty".into()));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(var = key, value = %raw, "Ignoring unparseable environment variable");
            None
        }
    }
}

/// Command-line overrides, applied last
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    listen_addr: Option<String>,
    ollama_host: Option<String>,
    ollama_port: Option<u16>,
    default_model: Option<String>,
}

impl ConfigOverrides {
    /// No overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the listen address
    #[must_use]
    pub fn with_listen_addr(mut self, addr: String) -> Self {
        self.listen_addr = Some(addr);
        self
    }

    /// Override the inference server host
    #[must_use]
    pub fn with_ollama_host(mut self, host: String) -> Self {
        self.ollama_host = Some(host);
        self
    }

    /// Override the inference server port
    #[must_use]
    pub fn with_ollama_port(mut self, port: u16) -> Self {
        self.ollama_port = Some(port);
        self
    }

    /// Override the default model
    #[must_use]
    pub fn with_default_model(mut self, model: String) -> Self {
        self.default_model = Some(model);
        self
    }

    /// Whether any override is set
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.listen_addr.is_none()
            && self.ollama_host.is_none()
            && self.ollama_port.is_none()
            && self.default_model.is_none()
    }

    /// Apply overrides on top of `config`
    pub fn apply(&self, config: &mut ChorusConfig) {
        if let Some(addr) = &self.listen_addr {
            config.server.listen_addr.clone_from(addr);
        }
        if let Some(host) = &self.ollama_host {
            config.backend.host.clone_from(host);
        }
        if let Some(port) = self.ollama_port {
            config.backend.port = port;
        }
        if let Some(model) = &self.default_model {
            config.backend.default_model.clone_from(model);
        }
        if !self.is_empty() {
            config.source = ConfigSource::Cli;
        }
    }
}

/// Default config file location: `$XDG_CONFIG_HOME/chorus/config.toml`
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("chorus").join("config.toml"))
}

/// Load file and environment layers.
///
/// An explicit `path` must exist. Without one, the default location is used
/// if present and built-in defaults otherwise.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<ChorusConfig, ConfigError> {
    let file = match path {
        Some(path) => Some(path),
        None => default_config_path().filter(|p| p.exists()),
    };

    let mut config = match file {
        Some(path) => {
            let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
                path: path.clone(),
                source,
            })?;
            tracing::info!(path = %path.display(), "Loaded configuration file");
            ChorusConfig::from_toml_str(&content, &path)?
        }
        None => ChorusConfig::default(),
    };

    config.apply_env();
    Ok(config)
}

/// Load every layer, including command-line overrides, and validate.
pub fn load_config(
    path: Option<PathBuf>,
    overrides: &ConfigOverrides,
) -> Result<ChorusConfig, ConfigError> {
    let mut config = load_config_from_path(path)?;
    overrides.apply(&mut config);
    config.validate()?;
    Ok(config)
}
