//! Configuration management for Tether.
//!
//! Configuration is stored in TOML format at:
//! - Linux: `~/.config/tether/config.toml`
//! - macOS: `~/Library/Application Support/com.tether.Tether/config.toml`
//! - Windows: `%APPDATA%\tether\Tether\config\config.toml`
//!
//! ## Example Configuration
//!
//! ```toml
//! [network]
//! local_port = 47100
//! remote_port = 47100
//! remote_address = "192.168.1.20"
//!
//! [transfer]
//! frame_size = 1024
//! socket_buffer_size = 1024
//! pool_capacity = 10
//! dial_backoff = "500ms"
//! worker_threads = 16
//! verify_checksum = true
//!
//! [storage]
//! download_dir = "~/Downloads/tether"
//! ```

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::{HEADER_SIZE, MAX_PAYLOAD_LEN};

/// Smallest accepted frame size (header plus one payload byte).
pub const MIN_FRAME_SIZE: usize = HEADER_SIZE + 1;

/// Largest accepted frame size (header plus the longest encodable payload).
pub const MAX_FRAME_SIZE: usize = HEADER_SIZE + MAX_PAYLOAD_LEN;

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Peer addressing
    pub network: NetworkConfig,
    /// Framing, pooling and runtime settings
    pub transfer: TransferConfig,
    /// Where received files land
    pub storage: StorageConfig,
}

/// Network configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Port the listener binds to
    pub local_port: u16,
    /// Port dialed on the peer
    pub remote_port: u16,
    /// Peer address; learned from the first inbound connection when unset
    pub remote_address: Option<IpAddr>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            local_port: crate::DEFAULT_PORT,
            remote_port: crate::DEFAULT_PORT,
            remote_address: None,
        }
    }
}

/// Transfer configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Total frame size including the 3-byte header
    pub frame_size: usize,
    /// Size of a single socket read
    pub socket_buffer_size: usize,
    /// Maximum number of idle outbound connections
    pub pool_capacity: usize,
    /// Delay between failed dial attempts
    #[serde(with = "humantime_serde")]
    pub dial_backoff: Duration,
    /// Runtime worker threads (CLI only)
    pub worker_threads: usize,
    /// Reject received payloads whose checksum does not match
    pub verify_checksum: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            frame_size: crate::DEFAULT_FRAME_SIZE,
            socket_buffer_size: crate::DEFAULT_SOCKET_BUFFER_SIZE,
            pool_capacity: crate::DEFAULT_POOL_CAPACITY,
            dial_backoff: Duration::from_millis(crate::DEFAULT_DIAL_BACKOFF_MS),
            worker_threads: crate::DEFAULT_WORKER_THREADS,
            verify_checksum: true,
        }
    }
}

impl TransferConfig {
    /// Payload bytes that fit in one frame.
    #[must_use]
    pub fn max_payload(&self) -> usize {
        self.frame_size.saturating_sub(HEADER_SIZE)
    }
}

/// Storage configuration options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Download directory; the platform default is used when unset
    pub download_dir: Option<PathBuf>,
}

impl StorageConfig {
    /// Effective download directory.
    ///
    /// Falls back to `<platform downloads>/tether`, then `./tether`.
    #[must_use]
    pub fn resolved_download_dir(&self) -> PathBuf {
        self.download_dir.clone().unwrap_or_else(|| {
            directories::UserDirs::new()
                .and_then(|dirs| dirs.download_dir().map(|d| d.join("tether")))
                .unwrap_or_else(|| PathBuf::from("tether"))
        })
    }
}

/// Runtime settings consumed by the session layer.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Total frame size including the header
    pub frame_size: usize,
    /// Size of a single socket read
    pub socket_buffer_size: usize,
    /// Maximum number of idle outbound connections
    pub pool_capacity: usize,
    /// Delay between failed dial attempts
    pub dial_backoff: Duration,
    /// Directory received files are written to
    pub download_dir: PathBuf,
    /// Reject received payloads whose checksum does not match
    pub verify_checksum: bool,
}

impl SessionConfig {
    /// Payload bytes that fit in one frame.
    #[must_use]
    pub fn max_payload(&self) -> usize {
        self.frame_size.saturating_sub(HEADER_SIZE)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        (&Config::default()).into()
    }
}

impl From<&Config> for SessionConfig {
    fn from(config: &Config) -> Self {
        Self {
            frame_size: config.transfer.frame_size,
            socket_buffer_size: config.transfer.socket_buffer_size,
            pool_capacity: config.transfer.pool_capacity,
            dial_backoff: config.transfer.dial_backoff,
            download_dir: config.storage.resolved_download_dir(),
            verify_checksum: config.transfer.verify_checksum,
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// Returns default configuration if the file doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigError(format!("Failed to read config: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::ConfigError(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location.
    ///
    /// Creates the configuration directory if it doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    /// Save configuration to a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::ConfigError(format!("Failed to create config directory: {e}"))
            })?;
        }

        let content = self.to_toml()?;

        std::fs::write(path, content)
            .map_err(|e| Error::ConfigError(format!("Failed to write config: {e}")))
    }

    /// Render the configuration as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::ConfigError(format!("Failed to serialize config: {e}")))
    }

    /// Check values that would otherwise fail deep inside a transfer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the offending key.
    pub fn validate(&self) -> Result<()> {
        let frame_size = self.transfer.frame_size;
        if !(MIN_FRAME_SIZE..=MAX_FRAME_SIZE).contains(&frame_size) {
            return Err(Error::InvalidConfig {
                key: "transfer.frame_size".to_string(),
                reason: format!(
                    "must be between {MIN_FRAME_SIZE} and {MAX_FRAME_SIZE}, got {frame_size}"
                ),
            });
        }
        if self.transfer.socket_buffer_size == 0 {
            return Err(Error::InvalidConfig {
                key: "transfer.socket_buffer_size".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.transfer.pool_capacity == 0 {
            return Err(Error::InvalidConfig {
                key: "transfer.pool_capacity".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.transfer.worker_threads == 0 {
            return Err(Error::InvalidConfig {
                key: "transfer.worker_threads".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// Get the configuration directory path.
    #[must_use]
    pub fn config_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "tether", "Tether")
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the full path to the configuration file.
    #[must_use]
    pub fn config_path() -> PathBuf {
        Self::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("config.toml")
    }
}

mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let s = s.trim();
        let parse = |digits: &str| digits.trim().parse::<u64>().map_err(serde::de::Error::custom);

        if let Some(ms) = s.strip_suffix("ms") {
            parse(ms).map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            parse(secs).map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            parse(mins).map(|m| Duration::from_secs(m * 60))
        } else {
            Err(serde::de::Error::custom("invalid duration format"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_default() {
        let config = Config::default();

        assert_eq!(config.network.local_port, crate::DEFAULT_PORT);
        assert_eq!(config.network.remote_port, crate::DEFAULT_PORT);
        assert!(config.network.remote_address.is_none());
        assert_eq!(config.transfer.frame_size, 1024);
        assert_eq!(config.transfer.max_payload(), 1021);
        assert_eq!(config.transfer.pool_capacity, 10);
        assert_eq!(config.transfer.dial_backoff, Duration::from_millis(500));
        assert_eq!(config.transfer.worker_threads, 16);
        assert!(config.transfer.verify_checksum);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config").join("config.toml");

        let mut original = Config::default();
        original.network.remote_address = Some("10.0.0.7".parse().unwrap());
        original.network.local_port = 50000;
        original.transfer.frame_size = 4096;
        original.transfer.dial_backoff = Duration::from_secs(2);
        original.storage.download_dir = Some(temp_dir.path().join("inbox"));
        original.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.network.remote_address, original.network.remote_address);
        assert_eq!(loaded.network.local_port, 50000);
        assert_eq!(loaded.transfer.frame_size, 4096);
        assert_eq!(loaded.transfer.dial_backoff, Duration::from_secs(2));
        assert_eq!(loaded.storage.download_dir, original.storage.download_dir);
    }

    #[test]
    fn test_config_serialization() {
        let toml_str = Config::default().to_toml().expect("serialize");

        assert!(toml_str.contains("[network]"), "Should have [network] section");
        assert!(toml_str.contains("[transfer]"), "Should have [transfer] section");
        assert!(toml_str.contains("dial_backoff = \"500ms\""));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config = toml::from_str("[network]\nremote_port = 9000\n").unwrap();

        assert_eq!(config.network.remote_port, 9000);
        assert_eq!(config.network.local_port, crate::DEFAULT_PORT);
        assert_eq!(config.transfer.frame_size, crate::DEFAULT_FRAME_SIZE);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::load_from(&temp_dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.transfer.pool_capacity, crate::DEFAULT_POOL_CAPACITY);
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "[transfer\nframe_size = ").unwrap();

        assert!(matches!(Config::load_from(&path), Err(Error::ConfigError(_))));
    }

    #[test]
    fn test_duration_formats() {
        let parse = |s: &str| {
            toml::from_str::<TransferConfig>(&format!("dial_backoff = \"{s}\""))
                .map(|c| c.dial_backoff)
        };

        assert_eq!(parse("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse("3s").unwrap(), Duration::from_secs(3));
        assert_eq!(parse("2m").unwrap(), Duration::from_secs(120));
        assert!(parse("soon").is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.transfer.frame_size = HEADER_SIZE;
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidConfig { ref key, .. }) if key == "transfer.frame_size"
        ));

        config.transfer.frame_size = MAX_FRAME_SIZE;
        assert!(config.validate().is_ok());
        config.transfer.frame_size = MAX_FRAME_SIZE + 1;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.transfer.pool_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_session_config_from_config() {
        let mut config = Config::default();
        config.storage.download_dir = Some(PathBuf::from("/tmp/inbox"));
        config.transfer.verify_checksum = false;

        let session: SessionConfig = (&config).into();
        assert_eq!(session.download_dir, PathBuf::from("/tmp/inbox"));
        assert_eq!(session.max_payload(), 1021);
        assert!(!session.verify_checksum);
    }
}
