//! Configuration for dc-session
//!
//! The session layer treats configuration as an opaque, immutable value
//! supplied at construction. It can be built in code or loaded from TOML:
//!
//! ```toml
//! request_timeout_ms = 30000
//!
//! [app]
//! api_id = 12345
//! device_model = "server"
//! system_version = "linux"
//! app_version = "0.1.0"
//! lang_code = "en"
//!
//! [[endpoints]]
//! dc = 2
//! host = "149.154.167.40"
//! port = 443
//!
//! [[server_keys]]
//! modulus_hex = "c150023e2f70db79..."
//! exponent = 65537
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::crypto::RsaPublicKey;
use crate::error::ConfigError;
use crate::types::{DcId, Endpoint};

/// Application identity announced to the server on every new connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppInfo {
    pub api_id: i32,
    #[serde(default = "default_device_model")]
    pub device_model: String,
    #[serde(default = "default_system_version")]
    pub system_version: String,
    #[serde(default = "default_app_version")]
    pub app_version: String,
    #[serde(default = "default_lang_code")]
    pub lang_code: String,
}

impl Default for AppInfo {
    fn default() -> Self {
        Self {
            api_id: 0,
            device_model: default_device_model(),
            system_version: default_system_version(),
            app_version: default_app_version(),
            lang_code: default_lang_code(),
        }
    }
}

/// A server RSA public key the client recognises during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerKeyConfig {
    /// Big-endian modulus, hex encoded
    pub modulus_hex: String,
    #[serde(default = "default_exponent")]
    pub exponent: u32,
}

impl ServerKeyConfig {
    pub fn to_public_key(&self) -> Result<RsaPublicKey, ConfigError> {
        let modulus = hex::decode(self.modulus_hex.trim())
            .map_err(|e| ConfigError::Invalid(format!("server key modulus: {}", e)))?;
        RsaPublicKey::from_be_bytes(&modulus, self.exponent)
            .ok_or_else(|| ConfigError::Invalid("server key modulus is too short".into()))
    }
}

/// Session layer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub app: AppInfo,

    /// Seed endpoints. The first entry's data center is the initial primary.
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,

    /// Server public keys accepted during the handshake
    #[serde(default)]
    pub server_keys: Vec<ServerKeyConfig>,

    /// Deadline applied to every call
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// How often pending requests are swept for expired deadlines
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Timeout of each individual handshake round trip
    #[serde(default = "default_handshake_step_timeout_ms")]
    pub handshake_step_timeout_ms: u64,

    /// Timeout for establishing a TCP connection
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// First reconnection delay; doubled after every failed attempt
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,

    /// Reconnection attempts before pending requests fail with `ConnectionLost`
    #[serde(default = "default_reconnect_max_attempts")]
    pub reconnect_max_attempts: u32,

    /// Upper bound on `dh_gen_retry` rounds within one handshake
    #[serde(default = "default_max_dh_retries")]
    pub max_dh_retries: u32,

    /// Miller-Rabin rounds used when validating a DH prime
    #[serde(default = "default_primality_rounds")]
    pub primality_rounds: u32,
}

fn default_device_model() -> String {
    "dc-session".to_string()
}

fn default_system_version() -> String {
    std::env::consts::OS.to_string()
}

fn default_app_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_lang_code() -> String {
    "en".to_string()
}

fn default_exponent() -> u32 {
    65537
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_sweep_interval_ms() -> u64 {
    500
}

fn default_handshake_step_timeout_ms() -> u64 {
    10_000
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_reconnect_base_delay_ms() -> u64 {
    250
}

fn default_reconnect_max_attempts() -> u32 {
    5
}

fn default_max_dh_retries() -> u32 {
    3
}

fn default_primality_rounds() -> u32 {
    16
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            app: AppInfo::default(),
            endpoints: Vec::new(),
            server_keys: Vec::new(),
            request_timeout_ms: default_request_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            handshake_step_timeout_ms: default_handshake_step_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_attempts: default_reconnect_max_attempts(),
            max_dh_retries: default_max_dh_retries(),
            primality_rounds: default_primality_rounds(),
        }
    }
}

impl SessionConfig {
    /// Load config from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check the invariants the session layer relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoints.is_empty() {
            return Err(ConfigError::Invalid("at least one seed endpoint is required".into()));
        }
        if self.server_keys.is_empty() {
            return Err(ConfigError::Invalid("at least one server key is required".into()));
        }
        for (name, value) in [
            ("request_timeout_ms", self.request_timeout_ms),
            ("sweep_interval_ms", self.sweep_interval_ms),
            ("handshake_step_timeout_ms", self.handshake_step_timeout_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be non-zero", name)));
            }
        }
        self.public_keys()?;
        Ok(())
    }

    /// Data center of the first seed endpoint.
    pub fn initial_primary_dc(&self) -> Option<DcId> {
        self.endpoints.first().map(Endpoint::dc)
    }

    pub fn public_keys(&self) -> Result<Vec<RsaPublicKey>, ConfigError> {
        self.server_keys.iter().map(ServerKeyConfig::to_public_key).collect()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn handshake_step_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_step_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }
}
