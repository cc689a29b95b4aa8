//! Configuration management

use crate::crypto::{CipherKind, MasterKey};
use crate::protocol::Timeouts;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: Option<ServerConfig>,
    /// Client configuration
    pub client: Option<ClientConfig>,
    /// Shared secret and cipher
    #[serde(default)]
    pub crypto: CryptoConfig,
    /// Timers
    #[serde(default)]
    pub tuning: TuningConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        Self::parse(&content)
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, crate::Error> {
        toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Tunnel listen address
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8400".to_string(),
        }
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server tunnel endpoint
    pub server: String,
    /// Number of tunnels to keep open
    #[serde(default = "default_tunnels")]
    pub tunnels: usize,
    /// Local forward listen address
    pub listen: String,
    /// Destination dialed by the server for every forwarded connection
    pub dest: String,
}

fn default_tunnels() -> usize {
    6
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1:8400".to_string(),
            tunnels: default_tunnels(),
            listen: "127.0.0.1:8388".to_string(),
            dest: "127.0.0.1:22".to_string(),
        }
    }
}

/// Cipher and pre-shared secret
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoConfig {
    /// AEAD cipher name (chacha20-poly1305, aes-128-gcm, aes-256-gcm)
    pub cipher: String,
    /// Password the key is derived from
    #[serde(default)]
    pub password: String,
    /// Raw key (base64), takes precedence over the password
    pub key: Option<String>,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            cipher: CipherKind::ChaCha20Poly1305.to_string(),
            password: String::new(),
            key: None,
        }
    }
}

impl CryptoConfig {
    /// Build the master key shared by every tunnel
    pub fn master_key(&self) -> Result<MasterKey, crate::Error> {
        let kind: CipherKind = self.cipher.parse()?;
        match &self.key {
            Some(encoded) => Ok(MasterKey::from_base64(kind, encoded)?),
            None if self.password.is_empty() => Err(crate::Error::Config(
                "Either [crypto] password or key must be set".to_string(),
            )),
            None => Ok(MasterKey::from_password(kind, &self.password)?),
        }
    }
}

/// Timer settings, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningConfig {
    pub block_wait_timeout: u64,
    pub dial_backoff: u64,
    pub tunnel_write_timeout: u64,
    pub empty_peer_grace: u64,
    pub handshake_timeout: u64,
    pub connect_timeout: u64,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            block_wait_timeout: 7,
            dial_backoff: 3,
            tunnel_write_timeout: 8,
            empty_peer_grace: 60,
            handshake_timeout: 30,
            connect_timeout: 10,
        }
    }
}

impl From<&TuningConfig> for Timeouts {
    fn from(tuning: &TuningConfig) -> Self {
        Self {
            block_wait: Duration::from_secs(tuning.block_wait_timeout),
            dial_backoff: Duration::from_secs(tuning.dial_backoff),
            tunnel_write: Duration::from_secs(tuning.tunnel_write_timeout),
            empty_peer_grace: Duration::from_secs(tuning.empty_peer_grace),
            handshake: Duration::from_secs(tuning.handshake_timeout),
            connect: Duration::from_secs(tuning.connect_timeout),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        server: Some(ServerConfig::default()),
        client: Some(ClientConfig::default()),
        crypto: CryptoConfig {
            password: "change-me".to_string(),
            ..CryptoConfig::default()
        },
        tuning: TuningConfig::default(),
        logging: LoggingConfig::default(),
    }
}
