//! Layered runtime configuration: compiled-in defaults, an optional TOML
//! file, then `MESHLINE_`-prefixed environment variables, each layer
//! overriding the last. Loading never panics — a malformed file or env var
//! surfaces `Error::Config` and leaves the choice of falling back to the
//! caller.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const ENV_PREFIX: &str = "MESHLINE_";
const DEFAULT_CONFIG_FILE: &str = "meshline.toml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IdentityConfig {
    /// Path to the opaque identity blob (Ed25519 + X25519 key material).
    pub key_path: PathBuf,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            key_path: default_data_dir().join("identity.key"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BleConfig {
    pub service_uuid: String,
    pub write_characteristic_uuid: String,
    pub notify_characteristic_uuid: String,
    pub mtu: usize,
    /// Index into the platform's adapter list; `None` picks the first adapter found.
    pub adapter_index: Option<usize>,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            service_uuid: "12345678-1234-5678-1234-56789abcdef0".into(),
            write_characteristic_uuid: "12345678-1234-5678-1234-56789abcdef1".into(),
            notify_characteristic_uuid: "12345678-1234-5678-1234-56789abcdef2".into(),
            mtu: crate::protocol::constants::BLE_MTU,
            adapter_index: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NostrConfig {
    pub enabled: bool,
    pub relay_urls: Vec<String>,
    /// Minimum relays that must ack a publish for it to count as accepted.
    pub min_relay_threshold: usize,
    pub max_reconnect_attempts: u32,
}

impl Default for NostrConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            relay_urls: vec![
                "wss://relay.damus.io".into(),
                "wss://nos.lol".into(),
                "wss://relay.primal.net".into(),
            ],
            min_relay_threshold: 1,
            max_reconnect_attempts: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboxConfig {
    pub sqlite_path: PathBuf,
    pub max_attempts: u32,
    /// How long an undelivered message stays eligible for retry before it's marked Expired.
    pub expiry_horizon: Duration,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_data_dir().join("outbox.sqlite3"),
            max_attempts: 10,
            expiry_horizon: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    pub handshake_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: crate::session::HANDSHAKE_TIMEOUT,
            idle_timeout: crate::session::IDLE_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MeshlineConfig {
    pub identity: IdentityConfig,
    pub ble: BleConfig,
    pub nostr: NostrConfig,
    pub outbox: OutboxConfig,
    pub session: SessionConfig,
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("meshline")
}

impl MeshlineConfig {
    /// Loads defaults, then overlays `path` (or `meshline.toml` in the
    /// current directory if `path` is `None` and that file exists), then
    /// overlays `MESHLINE_`-prefixed environment variables.
    pub fn load(path: Option<&std::path::Path>) -> Result<Self> {
        let mut config = Self::default();

        let file_path = path.map(PathBuf::from).unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        if file_path.exists() {
            config = config.merge_file(&file_path)?;
        } else if path.is_some() {
            return Err(Error::Config(format!("config file not found: {}", file_path.display())));
        }

        config.merge_env()?;
        Ok(config)
    }

    fn merge_file(mut self, path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(Error::Io)?;
        let from_file: MeshlineConfig = toml::from_str(&contents)?;
        self = from_file;
        Ok(self)
    }

    fn merge_env(&mut self) -> Result<()> {
        if let Ok(value) = std::env::var(format!("{ENV_PREFIX}IDENTITY_KEY_PATH")) {
            self.identity.key_path = PathBuf::from(value);
        }
        if let Ok(value) = std::env::var(format!("{ENV_PREFIX}BLE_MTU")) {
            self.ble.mtu = value
                .parse()
                .map_err(|_| Error::Config(format!("invalid {ENV_PREFIX}BLE_MTU: {value}")))?;
        }
        if let Ok(value) = std::env::var(format!("{ENV_PREFIX}NOSTR_ENABLED")) {
            self.nostr.enabled = value
                .parse()
                .map_err(|_| Error::Config(format!("invalid {ENV_PREFIX}NOSTR_ENABLED: {value}")))?;
        }
        if let Ok(value) = std::env::var(format!("{ENV_PREFIX}NOSTR_RELAY_URLS")) {
            self.nostr.relay_urls = value.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(value) = std::env::var(format!("{ENV_PREFIX}OUTBOX_SQLITE_PATH")) {
            self.outbox.sqlite_path = PathBuf::from(value);
        }
        if let Ok(value) = std::env::var(format!("{ENV_PREFIX}OUTBOX_MAX_ATTEMPTS")) {
            self.outbox.max_attempts = value
                .parse()
                .map_err(|_| Error::Config(format!("invalid {ENV_PREFIX}OUTBOX_MAX_ATTEMPTS: {value}")))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_internally_consistent() {
        let config = MeshlineConfig::default();
        assert_eq!(config.ble.mtu, crate::protocol::constants::BLE_MTU);
        assert!(config.nostr.relay_urls.len() >= 3);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let err = MeshlineConfig::load(Some(std::path::Path::new("/nonexistent/meshline.toml"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn env_overrides_apply_on_top_of_defaults() {
        std::env::set_var("MESHLINE_BLE_MTU", "400");
        let mut config = MeshlineConfig::default();
        config.merge_env().unwrap();
        assert_eq!(config.ble.mtu, 400);
        std::env::remove_var("MESHLINE_BLE_MTU");
    }
}
