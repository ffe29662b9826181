// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : sltp_guard — stop-loss / take-profit guard for Bybit perpetuals
Module  : config.rs
Version : 0.6.0

Summary : Persistent JSON settings (encrypted API credentials, trading
          defaults, monitor/runtime knobs), environment overrides, masked
          key display, non-sensitive export/import, and the 2s file watcher
          that feeds live setting changes into a running guard.
=============================================================================
*/
use std::env;
use std::path::{Path, PathBuf};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::domain::GuardSettings;
use crate::secrets::{self, SecretsError, KEY_LEN};

pub const DEFAULT_CONFIG_FILE: &str = "config.json";
const KEY_FILE: &str = "guard.key";
const RELOAD_EVERY_SECS: u64 = 2;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config io: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(transparent)]
    Secrets(#[from] SecretsError),
    #[error("no API credentials configured (run `credentials set`, or export BYBIT_API_KEY / BYBIT_API_SECRET)")]
    MissingCredentials,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Network { Mainnet, Testnet }

impl Network {
    pub fn default_rest_url(&self) -> &'static str {
        match self {
            Network::Mainnet => "https://api.bybit.com",
            Network::Testnet => "https://api-testnet.bybit.com",
        }
    }

    pub fn default_ws_url(&self) -> &'static str {
        match self {
            Network::Mainnet => "wss://stream.bybit.com/v5/private",
            Network::Testnet => "wss://stream-testnet.bybit.com/v5/private",
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
        })
    }
}

// ===== Persistent schema =====

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    /// base64(nonce || ciphertext); empty = unset
    pub api_key: String,
    pub api_secret: String,
    pub testnet: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    pub default_symbol: String,
    pub sl_enabled: bool,
    /// maximum loss in settlement currency (USDT)
    pub sl_amount: Decimal,
    pub tp_enabled: bool,
    /// profit target as percent over entry
    pub tp_percent: Decimal,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            default_symbol: "BTCUSDT".to_string(),
            sl_enabled: false,
            sl_amount: Decimal::from(10),
            tp_enabled: false,
            tp_percent: Decimal::from(2),
        }
    }
}

impl TradingConfig {
    pub fn guard(&self) -> GuardSettings {
        GuardSettings {
            sl_enabled: self.sl_enabled,
            sl_amount: self.sl_amount,
            tp_enabled: self.tp_enabled,
            tp_percent: self.tp_percent,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub refresh_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self { refresh_secs: 5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub metrics_port: u16,
    pub record_file: Option<String>,
    pub recv_window_ms: u64,
    pub poll_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self { metrics_port: 9898, record_file: None, recv_window_ms: 5000, poll_secs: 1 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub credentials: CredentialsConfig,
    pub trading: TradingConfig,
    pub monitor: MonitorConfig,
    pub runtime: RuntimeConfig,
}

/// Only these sections travel through export/import.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PortableSettings {
    trading: TradingConfig,
    monitor: MonitorConfig,
}

// ===== Store =====

pub struct ConfigStore {
    path: PathBuf,
    pub cfg: AppConfig,
    key: [u8; KEY_LEN],
}

impl ConfigStore {
    /// Load the config file, or create it with defaults on first run. The
    /// encryption key lives in `guard.key` next to the config.
    pub fn open(path: &Path) -> Result<Self, ConfigError> {
        let cfg = if path.exists() {
            let text = std::fs::read_to_string(path)?;
            serde_json::from_str(&text)?
        } else {
            AppConfig::default()
        };
        let key = secrets::load_or_create_key(&key_path(path))?;
        let store = Self { path: path.to_path_buf(), cfg, key };
        if !store.path.exists() {
            store.save()?;
        }
        Ok(store)
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let text = serde_json::to_string_pretty(&self.cfg)?;
        std::fs::write(&self.path, text)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // ----- credentials -----

    pub fn set_credentials(&mut self, api_key: &str, api_secret: &str, testnet: bool) -> Result<(), ConfigError> {
        self.cfg.credentials.api_key = secrets::encrypt(&self.key, api_key)?;
        self.cfg.credentials.api_secret = secrets::encrypt(&self.key, api_secret)?;
        self.cfg.credentials.testnet = testnet;
        self.save()
    }

    pub fn clear_credentials(&mut self) -> Result<(), ConfigError> {
        self.cfg.credentials.api_key.clear();
        self.cfg.credentials.api_secret.clear();
        self.save()
    }

    fn stored_api_key(&self) -> Result<String, ConfigError> {
        Ok(secrets::decrypt(&self.key, &self.cfg.credentials.api_key)?)
    }

    fn stored_api_secret(&self) -> Result<String, ConfigError> {
        Ok(secrets::decrypt(&self.key, &self.cfg.credentials.api_secret)?)
    }

    /// Effective API key: `BYBIT_API_KEY` wins over the encrypted store.
    pub fn api_key(&self) -> Result<String, ConfigError> {
        if let Ok(k) = env::var("BYBIT_API_KEY") {
            if !k.is_empty() {
                return Ok(k);
            }
        }
        match self.stored_api_key() {
            Ok(k) if !k.is_empty() => Ok(k),
            Ok(_) => Err(ConfigError::MissingCredentials),
            Err(e) => Err(e),
        }
    }

    pub fn api_secret(&self) -> Result<String, ConfigError> {
        if let Ok(s) = env::var("BYBIT_API_SECRET") {
            if !s.is_empty() {
                return Ok(s);
            }
        }
        match self.stored_api_secret() {
            Ok(s) if !s.is_empty() => Ok(s),
            Ok(_) => Err(ConfigError::MissingCredentials),
            Err(e) => Err(e),
        }
    }

    /// Whether the store holds a decryptable, non-empty key pair. Decrypt
    /// failures count as "not configured" rather than an error, so a stale
    /// key file never wedges the CLI.
    pub fn has_credentials(&self) -> bool {
        matches!((self.stored_api_key(), self.stored_api_secret()), (Ok(k), Ok(s)) if !k.is_empty() && !s.is_empty())
    }

    // ----- environment-aware accessors -----

    pub fn network(&self) -> Network {
        let testnet = match env::var("BYBIT_TESTNET") {
            Ok(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
            Err(_) => self.cfg.credentials.testnet,
        };
        if testnet { Network::Testnet } else { Network::Mainnet }
    }

    pub fn rest_url(&self) -> String {
        env::var("BYBIT_REST_URL").unwrap_or_else(|_| self.network().default_rest_url().to_string())
    }

    pub fn ws_url(&self) -> String {
        env::var("BYBIT_WS_URL").unwrap_or_else(|_| self.network().default_ws_url().to_string())
    }

    pub fn recv_window_ms(&self) -> u64 {
        env::var("BYBIT_RECV_WINDOW")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(self.cfg.runtime.recv_window_ms)
    }

    pub fn metrics_port(&self) -> u16 {
        env::var("METRICS_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(self.cfg.runtime.metrics_port)
    }

    pub fn record_file(&self) -> Option<String> {
        env::var("RECORD_FILE").ok().or_else(|| self.cfg.runtime.record_file.clone())
    }

    // ----- portable settings -----

    pub fn export_settings(&self, path: &Path) -> Result<(), ConfigError> {
        let portable = PortableSettings {
            trading: self.cfg.trading.clone(),
            monitor: self.cfg.monitor.clone(),
        };
        std::fs::write(path, serde_json::to_string_pretty(&portable)?)?;
        Ok(())
    }

    /// Import trading/monitor sections from a file. Credential fields in
    /// the source file, if any, are ignored.
    pub fn import_settings(&mut self, path: &Path) -> Result<(), ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let portable: PortableSettings = serde_json::from_str(&text)?;
        self.cfg.trading = portable.trading;
        self.cfg.monitor = portable.monitor;
        self.save()
    }
}

fn key_path(config_path: &Path) -> PathBuf {
    config_path.with_file_name(KEY_FILE)
}

/// Display form of an API key: first and last 8 characters.
pub fn mask_key(key: &str) -> String {
    if key.len() > 16 && key.is_ascii() {
        format!("{}...{}", &key[..8], &key[key.len() - 8..])
    } else {
        key.to_string()
    }
}

/// Re-read the config file every couple of seconds and push changed trading
/// settings to the guard. Parse failures (for example a half-written file
/// from a concurrent `settings set`) are skipped silently until the next
/// tick.
pub async fn watch_trading(path: PathBuf, tx: watch::Sender<GuardSettings>) {
    let mut tick = interval(Duration::from_secs(RELOAD_EVERY_SECS));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last = tx.borrow().clone();

    loop {
        tick.tick().await;
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, path = %path.display(), "settings reload: read failed");
                continue;
            }
        };
        let cfg: AppConfig = match serde_json::from_str(&text) {
            Ok(c) => c,
            Err(e) => {
                debug!(error = %e, "settings reload: parse failed, retrying next tick");
                continue;
            }
        };
        let fresh = cfg.trading.guard();
        if fresh != last {
            info!(
                sl_enabled = fresh.sl_enabled,
                sl_amount = %fresh.sl_amount,
                tp_enabled = fresh.tp_enabled,
                tp_percent = %fresh.tp_percent,
                "trading settings changed, applying live"
            );
            last = fresh.clone();
            let _ = tx.send(fresh);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("sltp_guard_cfg_{}_{}", name, std::process::id()));
        let _ = std::fs::create_dir_all(&dir);
        dir
    }

    #[test]
    fn defaults_match_the_documented_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.trading.default_symbol, "BTCUSDT");
        assert_eq!(cfg.trading.sl_amount, dec!(10));
        assert_eq!(cfg.trading.tp_percent, dec!(2));
        assert!(!cfg.trading.sl_enabled);
        assert!(!cfg.trading.tp_enabled);
        assert_eq!(cfg.monitor.refresh_secs, 5);
        assert_eq!(cfg.runtime.metrics_port, 9898);
        assert_eq!(cfg.runtime.recv_window_ms, 5000);
        assert_eq!(cfg.runtime.poll_secs, 1);
        assert!(!cfg.credentials.testnet);
    }

    #[test]
    fn open_creates_file_and_credentials_roundtrip() {
        let dir = temp_dir("roundtrip");
        let path = dir.join("config.json");
        let _ = std::fs::remove_file(&path);

        let mut store = ConfigStore::open(&path).unwrap();
        assert!(path.exists());
        assert!(!store.has_credentials());

        store.set_credentials("my-key-0123456789", "my-secret-987654321", true).unwrap();
        assert_ne!(store.cfg.credentials.api_key, "my-key-0123456789");

        let reopened = ConfigStore::open(&path).unwrap();
        assert!(reopened.has_credentials());
        assert_eq!(reopened.stored_api_key().unwrap(), "my-key-0123456789");
        assert_eq!(reopened.stored_api_secret().unwrap(), "my-secret-987654321");
        assert!(reopened.cfg.credentials.testnet);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn clear_credentials_keeps_other_settings() {
        let dir = temp_dir("clear");
        let path = dir.join("config.json");
        let mut store = ConfigStore::open(&path).unwrap();
        store.cfg.trading.sl_amount = dec!(25);
        store.set_credentials("key", "secret", false).unwrap();
        store.clear_credentials().unwrap();

        assert!(!store.has_credentials());
        assert_eq!(store.cfg.trading.sl_amount, dec!(25));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn export_import_moves_only_portable_sections() {
        let dir = temp_dir("portable");
        let src_path = dir.join("a.json");
        let dst_path = dir.join("b.json");
        let export_path = dir.join("settings.json");

        let mut a = ConfigStore::open(&src_path).unwrap();
        a.set_credentials("key-a", "secret-a", false).unwrap();
        a.cfg.trading.default_symbol = "ETHUSDT".into();
        a.cfg.trading.tp_percent = dec!(3.5);
        a.cfg.monitor.refresh_secs = 7;
        a.save().unwrap();
        a.export_settings(&export_path).unwrap();

        let exported = std::fs::read_to_string(&export_path).unwrap();
        assert!(!exported.contains("api_key"));

        let mut b = ConfigStore::open(&dst_path).unwrap();
        b.import_settings(&export_path).unwrap();
        assert_eq!(b.cfg.trading.default_symbol, "ETHUSDT");
        assert_eq!(b.cfg.trading.tp_percent, dec!(3.5));
        assert_eq!(b.cfg.monitor.refresh_secs, 7);
        assert!(!b.has_credentials());

        // importing a full config file must also leave credentials alone
        b.import_settings(&src_path).unwrap();
        assert!(!b.has_credentials());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn partial_config_file_fills_defaults() {
        let cfg: AppConfig =
            serde_json::from_str(r#"{"trading": {"sl_enabled": true, "sl_amount": "12.5"}}"#).unwrap();
        assert!(cfg.trading.sl_enabled);
        assert_eq!(cfg.trading.sl_amount, dec!(12.5));
        assert_eq!(cfg.trading.tp_percent, dec!(2));
        assert_eq!(cfg.runtime.metrics_port, 9898);
    }

    #[test]
    fn mask_key_short_and_long() {
        assert_eq!(mask_key("shortkey"), "shortkey");
        assert_eq!(mask_key("ABCDEFGH0123456789WXYZABCD"), "ABCDEFGH...WXYZABCD");
    }

    #[test]
    fn network_urls() {
        assert_eq!(Network::Mainnet.default_rest_url(), "https://api.bybit.com");
        assert_eq!(Network::Testnet.default_rest_url(), "https://api-testnet.bybit.com");
        assert!(Network::Mainnet.default_ws_url().starts_with("wss://"));
    }
}
