//! Relay Configuration
//!
//! Build-time style constants for a relay deployment, loaded from a TOML file
//! at `~/.config/rproc-relay/relay.toml`, environment variables and CLI
//! overrides.
//!
//! # Configuration Priority
//!
//! Highest first:
//! 1. CLI arguments (via [`ConfigOverrides`])
//! 2. Environment variables (`RELAY_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! Only the remote MTU is not configured here for negotiated channels; it is
//! discovered from the remote channel at establishment.
//!
//! # Example Configuration
//!
//! ```toml
//! [relay]
//! endpoint_name = "kws-app"
//! buffer_capacity = 1024
//! single_instance = true
//! announce_on_establish = true
//!
//! [local]
//! protocol_id = 19
//! runtime_dir = "/run/rproc-relay"
//!
//! [remote]
//! device = "/dev/rpmsg0"
//! mtu = 496
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::buffer::DEFAULT_BUFFER_CAPACITY;
use crate::channel::DEFAULT_RPMSG_MTU;

/// Default local channel protocol id
pub const DEFAULT_PROTOCOL_ID: u32 = 17;

/// Default remote endpoint name
pub const DEFAULT_ENDPOINT_NAME: &str = "rpmsg-tflite";

/// Default rpmsg character device
pub const DEFAULT_REMOTE_DEVICE: &str = "/dev/rpmsg0";

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Tracks where the configuration came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[relay]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayToml {
    /// Remote endpoint name
    pub endpoint_name: Option<String>,
    /// Last-message buffer capacity in bytes
    pub buffer_capacity: Option<usize>,
    /// Allow only one active pairing
    pub single_instance: Option<bool>,
    /// Relay command queue capacity
    pub command_queue_capacity: Option<usize>,
    /// Send a sync message to the remote side on establishment
    pub announce_on_establish: Option<bool>,
    /// Chunk size used by the passive read socket
    pub read_chunk: Option<usize>,
}

/// `[local]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalToml {
    /// Local channel protocol id
    pub protocol_id: Option<u32>,
    /// Directory for sockets
    pub runtime_dir: Option<String>,
}

/// `[remote]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteToml {
    /// rpmsg character device path
    pub device: Option<String>,
    /// MTU of the rpmsg endpoint
    pub mtu: Option<usize>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfigToml {
    /// Relay section
    pub relay: RelayToml,
    /// Local channel section
    pub local: LocalToml,
    /// Remote channel section
    pub remote: RemoteToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Resolved relay configuration
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Local channel identity
    pub protocol_id: u32,
    /// Remote endpoint name, also the registry key
    pub endpoint_name: String,
    /// Last-message buffer capacity in bytes
    pub buffer_capacity: usize,
    /// Limit the registry to one active pairing
    pub single_instance: bool,
    /// Relay command queue capacity
    pub command_queue_capacity: usize,
    /// Send a one-byte sync message to the remote side on establishment
    pub announce_on_establish: bool,
    /// Chunk size used when serving the passive read surface
    pub read_chunk: usize,
    /// Directory for sockets (None = default runtime dir)
    pub runtime_dir: Option<PathBuf>,
    /// rpmsg character device path
    pub remote_device: PathBuf,
    /// MTU of the rpmsg character device
    pub remote_mtu: usize,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,
    /// Where the highest-priority value came from
    pub source: ConfigSource,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            protocol_id: DEFAULT_PROTOCOL_ID,
            endpoint_name: DEFAULT_ENDPOINT_NAME.to_string(),
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            single_instance: true,
            command_queue_capacity: 256,
            announce_on_establish: false,
            read_chunk: 4096,
            runtime_dir: None,
            remote_device: PathBuf::from(DEFAULT_REMOTE_DEVICE),
            remote_mtu: DEFAULT_RPMSG_MTU,
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl RelayConfig {
    /// Create a configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory holding the relay's sockets
    #[must_use]
    pub fn runtime_dir(&self) -> PathBuf {
        self.runtime_dir.clone().unwrap_or_else(default_runtime_dir)
    }

    /// Path of the passive read socket for this endpoint
    #[must_use]
    pub fn reader_socket_path(&self) -> PathBuf {
        self.runtime_dir()
            .join(format!("{}.last", self.endpoint_name))
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint_name.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "endpoint_name must not be empty".into(),
            ));
        }
        if self.endpoint_name.contains('/') {
            return Err(ConfigError::ValidationError(format!(
                "endpoint_name {:?} must not contain '/'",
                self.endpoint_name
            )));
        }
        if self.buffer_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "buffer_capacity must be greater than 0".into(),
            ));
        }
        if self.command_queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "command_queue_capacity must be greater than 0".into(),
            ));
        }
        if self.read_chunk == 0 {
            return Err(ConfigError::ValidationError(
                "read_chunk must be greater than 0".into(),
            ));
        }
        if self.remote_mtu == 0 {
            return Err(ConfigError::ValidationError(
                "remote mtu must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/rproc-relay/relay.toml`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("rproc-relay").join("relay.toml"))
}

/// Get the default runtime directory
///
/// Uses `XDG_RUNTIME_DIR` if available, otherwise `/tmp/rproc-relay-$UID/`.
#[must_use]
pub fn default_runtime_dir() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir).join("rproc-relay")
    } else {
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/rproc-relay-{uid}"))
    }
}

/// Load configuration from the default path, environment and defaults
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or the
/// result fails validation. A missing config file is not an error.
pub fn load_config() -> Result<RelayConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed,
/// or the result fails validation.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<RelayConfig, ConfigError> {
    load_config_with_overrides(path, &ConfigOverrides::new())
}

/// Load configuration from a specific path with command-line overrides on top
///
/// Layers are applied as defaults, file, environment, then `overrides`.
/// Validation runs once on the merged result, so a higher layer can correct
/// a value a lower one got wrong.
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed,
/// or the merged configuration fails validation.
pub fn load_config_with_overrides(
    path: Option<PathBuf>,
    overrides: &ConfigOverrides,
) -> Result<RelayConfig, ConfigError> {
    let mut config = RelayConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: RelayConfigToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config);
    overrides.apply(&mut config);
    config.validate()?;
    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut RelayConfig, toml: &RelayConfigToml) {
    if let Some(ref name) = toml.relay.endpoint_name {
        config.endpoint_name = name.clone();
    }
    if let Some(capacity) = toml.relay.buffer_capacity {
        config.buffer_capacity = capacity;
    }
    if let Some(single) = toml.relay.single_instance {
        config.single_instance = single;
    }
    if let Some(capacity) = toml.relay.command_queue_capacity {
        config.command_queue_capacity = capacity;
    }
    if let Some(announce) = toml.relay.announce_on_establish {
        config.announce_on_establish = announce;
    }
    if let Some(chunk) = toml.relay.read_chunk {
        config.read_chunk = chunk;
    }

    if let Some(id) = toml.local.protocol_id {
        config.protocol_id = id;
    }
    if let Some(ref dir) = toml.local.runtime_dir {
        config.runtime_dir = Some(PathBuf::from(dir));
    }

    if let Some(ref device) = toml.remote.device {
        config.remote_device = PathBuf::from(device);
    }
    if let Some(mtu) = toml.remote.mtu {
        config.remote_mtu = mtu;
    }
}

/// Apply environment variable overrides
///
/// Environment variables:
/// - `RELAY_ENDPOINT`: Remote endpoint name
/// - `RELAY_PROTOCOL_ID`: Local channel protocol id
/// - `RELAY_BUFFER_CAPACITY`: Last-message buffer capacity
/// - `RELAY_SINGLE_INSTANCE`: "0" or "false" to allow several pairings
/// - `RELAY_RUNTIME_DIR`: Socket directory
/// - `RELAY_DEVICE`: rpmsg character device
/// - `RELAY_MTU`: rpmsg MTU
fn apply_env_config(config: &mut RelayConfig) {
    let mut from_env = false;

    if let Ok(name) = std::env::var("RELAY_ENDPOINT") {
        config.endpoint_name = name;
        from_env = true;
    }
    if let Some(id) = env_parse("RELAY_PROTOCOL_ID") {
        config.protocol_id = id;
        from_env = true;
    }
    if let Some(capacity) = env_parse("RELAY_BUFFER_CAPACITY") {
        config.buffer_capacity = capacity;
        from_env = true;
    }
    if let Ok(v) = std::env::var("RELAY_SINGLE_INSTANCE") {
        config.single_instance = v != "0" && v.to_lowercase() != "false";
        from_env = true;
    }
    if let Ok(dir) = std::env::var("RELAY_RUNTIME_DIR") {
        config.runtime_dir = Some(PathBuf::from(dir));
        from_env = true;
    }
    if let Ok(device) = std::env::var("RELAY_DEVICE") {
        config.remote_device = PathBuf::from(device);
        from_env = true;
    }
    if let Some(mtu) = env_parse("RELAY_MTU") {
        config.remote_mtu = mtu;
        from_env = true;
    }

    if from_env {
        config.source = ConfigSource::Env;
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

// =============================================================================
// CLI Overrides
// =============================================================================

/// Overrides applied on top of file and environment configuration
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Protocol id override
    pub protocol_id: Option<u32>,
    /// Endpoint name override
    pub endpoint_name: Option<String>,
    /// Runtime directory override
    pub runtime_dir: Option<PathBuf>,
    /// Device path override
    pub remote_device: Option<PathBuf>,
    /// MTU override
    pub remote_mtu: Option<usize>,
    /// Single-instance override
    pub single_instance: Option<bool>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set protocol id override
    #[must_use]
    pub fn with_protocol_id(mut self, id: u32) -> Self {
        self.protocol_id = Some(id);
        self
    }

    /// Set endpoint name override
    #[must_use]
    pub fn with_endpoint_name(mut self, name: String) -> Self {
        self.endpoint_name = Some(name);
        self
    }

    /// Set runtime directory override
    #[must_use]
    pub fn with_runtime_dir(mut self, dir: PathBuf) -> Self {
        self.runtime_dir = Some(dir);
        self
    }

    /// Set device override
    #[must_use]
    pub fn with_remote_device(mut self, device: PathBuf) -> Self {
        self.remote_device = Some(device);
        self
    }

    /// Set MTU override
    #[must_use]
    pub fn with_remote_mtu(mut self, mtu: usize) -> Self {
        self.remote_mtu = Some(mtu);
        self
    }

    /// Set single-instance override
    #[must_use]
    pub fn with_single_instance(mut self, single: bool) -> Self {
        self.single_instance = Some(single);
        self
    }

    /// Whether any override is set
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.protocol_id.is_none()
            && self.endpoint_name.is_none()
            && self.runtime_dir.is_none()
            && self.remote_device.is_none()
            && self.remote_mtu.is_none()
            && self.single_instance.is_none()
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut RelayConfig) {
        if !self.is_empty() {
            config.source = ConfigSource::Cli;
        }
        if let Some(id) = self.protocol_id {
            config.protocol_id = id;
        }
        if let Some(ref name) = self.endpoint_name {
            config.endpoint_name = name.clone();
        }
        if let Some(ref dir) = self.runtime_dir {
            config.runtime_dir = Some(dir.clone());
        }
        if let Some(ref device) = self.remote_device {
            config.remote_device = device.clone();
        }
        if let Some(mtu) = self.remote_mtu {
            config.remote_mtu = mtu;
        }
        if let Some(single) = self.single_instance {
            config.single_instance = single;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    /// Environment is process-global; tests touching it hold this lock
    static ENV_LOCK: parking_lot::Mutex<()> = parking_lot::const_mutex(());

    fn clear_config_env_vars() {
        for key in [
            "RELAY_ENDPOINT",
            "RELAY_PROTOCOL_ID",
            "RELAY_BUFFER_CAPACITY",
            "RELAY_SINGLE_INSTANCE",
            "RELAY_RUNTIME_DIR",
            "RELAY_DEVICE",
            "RELAY_MTU",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.protocol_id, 17);
        assert_eq!(config.endpoint_name, "rpmsg-tflite");
        assert_eq!(config.buffer_capacity, 1024);
        assert!(config.single_instance);
        assert!(!config.announce_on_establish);
        assert_eq!(config.remote_mtu, DEFAULT_RPMSG_MTU);
        assert_eq!(config.source, ConfigSource::Default);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let _guard = ENV_LOCK.lock();
        clear_config_env_vars();

        let config =
            load_config_from_path(Some(PathBuf::from("/nonexistent/relay.toml"))).unwrap();
        assert_eq!(config.protocol_id, DEFAULT_PROTOCOL_ID);
        assert_eq!(config.source, ConfigSource::Default);
        assert!(config.config_file_path.is_none());
    }

    #[test]
    fn test_load_from_toml() {
        let _guard = ENV_LOCK.lock();
        clear_config_env_vars();

        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[relay]
endpoint_name = "kws-app"
buffer_capacity = 2048
announce_on_establish = true

[local]
protocol_id = 19
runtime_dir = "/run/test-relay"

[remote]
device = "/dev/rpmsg3"
mtu = 256
"#
        )
        .unwrap();

        let config = load_config_from_path(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.endpoint_name, "kws-app");
        assert_eq!(config.buffer_capacity, 2048);
        assert!(config.announce_on_establish);
        assert_eq!(config.protocol_id, 19);
        assert_eq!(config.runtime_dir(), PathBuf::from("/run/test-relay"));
        assert_eq!(config.remote_device, PathBuf::from("/dev/rpmsg3"));
        assert_eq!(config.remote_mtu, 256);
        assert_eq!(config.source, ConfigSource::File);
        assert_eq!(
            config.reader_socket_path(),
            PathBuf::from("/run/test-relay/kws-app.last")
        );
    }

    #[test]
    fn test_invalid_toml_is_error() {
        let _guard = ENV_LOCK.lock();
        clear_config_env_vars();

        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[relay\nendpoint_name = ").unwrap();

        let result = load_config_from_path(Some(file.path().to_path_buf()));
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let _guard = ENV_LOCK.lock();
        clear_config_env_vars();

        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[relay]\nbuffer_capacity = 0").unwrap();

        let result = load_config_from_path(Some(file.path().to_path_buf()));
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_env_overrides_file() {
        let _guard = ENV_LOCK.lock();
        clear_config_env_vars();

        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[local]\nprotocol_id = 19").unwrap();

        std::env::set_var("RELAY_PROTOCOL_ID", "23");
        std::env::set_var("RELAY_SINGLE_INSTANCE", "false");
        let config = load_config_from_path(Some(file.path().to_path_buf())).unwrap();
        clear_config_env_vars();

        assert_eq!(config.protocol_id, 23);
        assert!(!config.single_instance);
        assert_eq!(config.source, ConfigSource::Env);
    }

    #[test]
    fn test_cli_corrects_invalid_env_value() {
        let _guard = ENV_LOCK.lock();
        clear_config_env_vars();

        std::env::set_var("RELAY_MTU", "0");
        let path = Some(PathBuf::from("/nonexistent/relay.toml"));
        let env_only = load_config_from_path(path.clone());
        let corrected =
            load_config_with_overrides(path, &ConfigOverrides::new().with_remote_mtu(496));
        clear_config_env_vars();

        assert!(matches!(env_only, Err(ConfigError::ValidationError(_))));
        let config = corrected.unwrap();
        assert_eq!(config.remote_mtu, 496);
        assert_eq!(config.source, ConfigSource::Cli);
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        let _guard = ENV_LOCK.lock();
        clear_config_env_vars();

        let result = load_config_with_overrides(
            Some(PathBuf::from("/nonexistent/relay.toml")),
            &ConfigOverrides::new().with_endpoint_name("a/b".into()),
        );
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_cli_overrides() {
        let mut config = RelayConfig::default();
        let overrides = ConfigOverrides::new()
            .with_protocol_id(19)
            .with_endpoint_name("kws-app".into())
            .with_remote_mtu(128)
            .with_single_instance(false);
        overrides.apply(&mut config);

        assert_eq!(config.protocol_id, 19);
        assert_eq!(config.endpoint_name, "kws-app");
        assert_eq!(config.remote_mtu, 128);
        assert!(!config.single_instance);
        assert_eq!(config.source, ConfigSource::Cli);
    }

    #[test]
    fn test_empty_overrides_keep_source() {
        let mut config = RelayConfig::default();
        ConfigOverrides::new().apply(&mut config);
        assert_eq!(config.source, ConfigSource::Default);
    }

    #[test]
    fn test_endpoint_name_validation() {
        let config = RelayConfig {
            endpoint_name: "a/b".into(),
            ..RelayConfig::default()
        };
        assert!(config.validate().is_err());

        let config = RelayConfig {
            endpoint_name: "  ".into(),
            ..RelayConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
