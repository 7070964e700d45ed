//! Configuration loading
//!
//! Reads a JSON5 config file, applies typed defaults, then layers environment
//! overrides on top. The resulting [`GatewayConfig`] lives in a shared
//! [`ConfigStore`] that handlers read and the liveness supervisor re-reads
//! when it rebinds the listener.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default listening port for client connections.
pub const DEFAULT_SOCKET_PORT: u16 = 1234;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse JSON5 at {path}: {message}")]
    ParseError { path: String, message: String },

    #[error("Failed to read config file {path}: {message}")]
    ReadError { path: String, message: String },

    #[error("Invalid value for {var}: {value}")]
    InvalidEnvVar { var: String, value: String },

    #[error("Validation error at {path}: {message}")]
    ValidationError { path: String, message: String },
}

/// Process-wide gateway configuration.
///
/// Field names match the keys clients see through `get-server-config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Port the client listener binds to.
    pub socket_port: u16,
    /// Shared secret presented by clients during the handshake.
    pub password: String,
    /// Encrypt outbound payloads with the password-derived key.
    pub encrypt_coms: bool,
    /// Public address advertised to clients. Never sent back over the socket.
    pub server_address: String,
    /// Directory for chunk buffers, converted media, contacts exports.
    pub data_dir: Option<PathBuf>,
    /// Seconds between listener liveness checks.
    pub health_check_interval_secs: u64,
    /// Seconds between transport pings.
    pub ping_interval_secs: u64,
    /// Seconds of silence after which a connection is dropped.
    pub ping_timeout_secs: u64,
    /// Seconds an unfinished chunk transfer may stay idle before eviction.
    pub chunk_ttl_secs: u64,
    /// Seconds between chunk expiry sweeps.
    pub chunk_sweep_secs: u64,
    /// Days a registered device may stay inactive before it is purged.
    pub device_retention_days: u64,
    /// External program used to convert host audio attachments.
    pub convert_command: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            socket_port: DEFAULT_SOCKET_PORT,
            password: String::new(),
            encrypt_coms: false,
            server_address: String::new(),
            data_dir: None,
            health_check_interval_secs: 60,
            ping_interval_secs: 25,
            ping_timeout_secs: 60,
            chunk_ttl_secs: 3600,
            chunk_sweep_secs: 300,
            device_retention_days: 7,
            convert_command: "ffmpeg".to_string(),
        }
    }
}

impl GatewayConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs.max(1))
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs.max(1))
    }

    pub fn chunk_ttl(&self) -> Duration {
        Duration::from_secs(self.chunk_ttl_secs)
    }

    pub fn chunk_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.chunk_sweep_secs.max(1))
    }

    /// Resolved data directory (falls back to the state directory).
    pub fn resolved_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(resolve_state_dir)
    }

    /// Config as clients may see it: secrets and the advertised address removed.
    pub fn public_view(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Value::Object(ref mut map) = value {
            map.remove("password");
            map.remove("server_address");
        }
        value
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.socket_port == 0 {
            return Err(ConfigError::ValidationError {
                path: "socket_port".to_string(),
                message: "port must be non-zero".to_string(),
            });
        }
        if self.ping_timeout_secs < self.ping_interval_secs {
            return Err(ConfigError::ValidationError {
                path: "ping_timeout_secs".to_string(),
                message: "timeout must not be shorter than the ping interval".to_string(),
            });
        }
        Ok(())
    }
}

/// Shared, mutable configuration.
///
/// Writers replace the whole value; readers take cheap clones.
#[derive(Debug, Default)]
pub struct ConfigStore {
    inner: RwLock<GatewayConfig>,
    path: Option<PathBuf>,
}

impl ConfigStore {
    /// Store backed by an in-memory value only (`reload` is a no-op).
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            inner: RwLock::new(config),
            path: None,
        }
    }

    /// Store backed by a config file on disk.
    pub fn from_path(path: PathBuf) -> Result<Self, ConfigError> {
        let config = load_config_from(&path)?;
        Ok(Self {
            inner: RwLock::new(config),
            path: Some(path),
        })
    }

    pub fn snapshot(&self) -> GatewayConfig {
        self.inner.read().clone()
    }

    pub fn socket_port(&self) -> u16 {
        self.inner.read().socket_port
    }

    pub fn password(&self) -> String {
        self.inner.read().password.clone()
    }

    pub fn encrypt_coms(&self) -> bool {
        self.inner.read().encrypt_coms
    }

    pub fn update<F: FnOnce(&mut GatewayConfig)>(&self, f: F) {
        let mut guard = self.inner.write();
        f(&mut guard);
    }

    /// Re-read the backing file. Keeps the current value on failure.
    pub fn reload(&self) -> Result<bool, ConfigError> {
        let Some(path) = self.path.as_ref() else {
            return Ok(false);
        };
        let fresh = load_config_from(path)?;
        let mut guard = self.inner.write();
        let changed = *guard != fresh;
        *guard = fresh;
        Ok(changed)
    }
}

/// Get the state directory.
/// Priority: BRIDGEGATE_STATE_DIR > ~/.bridgegate
pub fn resolve_state_dir() -> PathBuf {
    if let Ok(dir) = env::var("BRIDGEGATE_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".bridgegate")
}

/// Get the config file path.
/// Priority: BRIDGEGATE_CONFIG_PATH > state dir/bridgegate.json5
/// Falls back to .json if the .json5 file doesn't exist.
pub fn get_config_path() -> PathBuf {
    if let Ok(path) = env::var("BRIDGEGATE_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    let base = resolve_state_dir();
    let json5 = base.join("bridgegate.json5");
    if json5.exists() {
        return json5;
    }
    base.join("bridgegate.json")
}

/// Load the config from the default path.
pub fn load_config() -> Result<GatewayConfig, ConfigError> {
    load_config_from(&get_config_path())
}

/// Load a config file, apply defaults and environment overrides.
/// A missing file yields the defaults.
pub fn load_config_from(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let mut config = if path.exists() {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        parse_config(&content, path)?
    } else {
        GatewayConfig::default()
    };
    apply_env_overrides(&mut config)?;
    config.validate()?;
    Ok(config)
}

fn parse_config(content: &str, path: &Path) -> Result<GatewayConfig, ConfigError> {
    let value: Value = json5::from_str(content).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    serde_json::from_value(value).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

fn apply_env_overrides(config: &mut GatewayConfig) -> Result<(), ConfigError> {
    if let Ok(port) = env::var("BRIDGEGATE_PORT") {
        config.socket_port = port.trim().parse().map_err(|_| ConfigError::InvalidEnvVar {
            var: "BRIDGEGATE_PORT".to_string(),
            value: port.clone(),
        })?;
    }
    if let Ok(password) = env::var("BRIDGEGATE_PASSWORD") {
        config.password = password;
    }
    Ok(())
}
