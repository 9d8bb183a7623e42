use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::mqtt::config::{BrokerSettings, Credentials, SessionTiming};

const CONFIG_DIR: &str = "miniplayer";
const CONFIG_FILE: &str = "config.toml";

/// Kiosk dashboard client for MQTT driven music, weather and printer screens
#[derive(Parser, Debug, Default, Clone)]
#[command(name = "miniplayer", version, about)]
pub struct Args {
    /// Path to the config file (default: <config dir>/miniplayer/config.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Broker host
    #[arg(long)]
    pub host: Option<String>,

    /// Broker port
    #[arg(long)]
    pub port: Option<u16>,

    #[arg(long)]
    pub username: Option<String>,

    #[arg(long)]
    pub password: Option<String>,

    /// Override the hardware derived client identity
    #[arg(long)]
    pub client_id: Option<String>,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "homeassistant.local".to_string(),
            port: 1883,
            username: None,
            password: None,
            keep_alive_secs: 5,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct TimingConfig {
    pub tick_ms: u64,
    pub connect_timeout_ms: u64,
    pub connect_poll_ms: u64,
    pub retry_base_secs: u64,
    pub retry_cap_secs: u64,
    /// 0 disables the watchdog.
    pub watchdog_silence_ms: u64,
    pub screensaver_delay_ms: u64,
    pub action_timeout_ms: u64,
    pub timeout_notice_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            tick_ms: 66,
            connect_timeout_ms: 10_000,
            connect_poll_ms: 250,
            retry_base_secs: 9,
            retry_cap_secs: 1800,
            watchdog_silence_ms: 900_000,
            screensaver_delay_ms: 60_000,
            action_timeout_ms: 12_000,
            timeout_notice_ms: 5_000,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct UserSettings {
    pub screensaver: bool,
    pub remote_window_change: bool,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            screensaver: true,
            remote_window_change: true,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct MiniplayerConfig {
    pub client_id: Option<String>,
    pub namespace: String,
    pub windows: Vec<String>,
    pub default_window: Option<String>,
    pub broker: BrokerConfig,
    pub timing: TimingConfig,
    pub settings: UserSettings,
}

impl Default for MiniplayerConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            namespace: "miniplayer".to_string(),
            windows: vec![
                "weather".to_string(),
                "music".to_string(),
                "printer".to_string(),
            ],
            default_window: None,
            broker: BrokerConfig::default(),
            timing: TimingConfig::default(),
            settings: UserSettings::default(),
        }
    }
}

impl MiniplayerConfig {
    pub fn default_path() -> Result<PathBuf> {
        let mut path = dirs::config_dir().ok_or_else(|| eyre!("No config directory on this system"))?;
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        Ok(path)
    }

    /// Writes the default config to `path` unless a file is already there.
    pub async fn ensure_default_config(path: &Path) -> Result<()> {
        if tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check if config file exists: {}", e))?
        {
            return Ok(());
        }
        info!("Creating default configuration at {}", path.display());
        MiniplayerConfig::default().save(path).await
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
        let config: MiniplayerConfig =
            toml::from_str(&content).map_err(|e| eyre!("Failed to parse config file: {}", e))?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| eyre!("Failed to serialize config: {}", e))?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write config file: {}", e))?;
        Ok(())
    }

    /// Resolves the config file from the arguments, creating a default one
    /// on first run, and applies the command line overrides.
    pub async fn from_args(args: &Args) -> Result<Self> {
        let path = match &args.config {
            Some(path) => path.clone(),
            None => Self::default_path()?,
        };
        Self::ensure_default_config(&path).await?;
        let mut config = Self::load(&path).await?;
        config.apply_args(args);
        config.validate()?;
        Ok(config)
    }

    pub fn apply_args(&mut self, args: &Args) {
        if let Some(host) = &args.host {
            self.broker.host = host.clone();
        }
        if let Some(port) = args.port {
            self.broker.port = port;
        }
        if let Some(username) = &args.username {
            self.broker.username = Some(username.clone());
        }
        if let Some(password) = &args.password {
            self.broker.password = Some(password.clone());
        }
        if let Some(client_id) = &args.client_id {
            self.client_id = Some(client_id.clone());
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.broker.host.trim().is_empty() {
            return Err(eyre!("broker.host must not be empty"));
        }
        if self.broker.port == 0 {
            return Err(eyre!("broker.port must not be 0"));
        }
        if self.timing.tick_ms == 0 {
            return Err(eyre!("timing.tick_ms must be positive"));
        }
        if self.timing.connect_poll_ms == 0 {
            return Err(eyre!("timing.connect_poll_ms must be positive"));
        }
        if self.windows.is_empty() {
            return Err(eyre!("windows must list at least one window"));
        }
        if let Some(default) = &self.default_window {
            if !self.windows.iter().any(|name| name.eq_ignore_ascii_case(default)) {
                warn!("default_window {} is not in windows, using {}", default, self.windows[0]);
            }
        }
        Ok(())
    }

    pub fn broker_settings(&self) -> BrokerSettings {
        let credentials = self.broker.username.as_ref().map(|username| Credentials {
            username: username.clone(),
            password: self.broker.password.clone().unwrap_or_default(),
        });
        BrokerSettings {
            host: self.broker.host.clone(),
            port: self.broker.port,
            credentials,
            keep_alive: Duration::from_secs(self.broker.keep_alive_secs),
        }
    }

    pub fn session_timing(&self) -> SessionTiming {
        let timing = &self.timing;
        SessionTiming {
            connect_timeout: Duration::from_millis(timing.connect_timeout_ms),
            connect_poll: Duration::from_millis(timing.connect_poll_ms),
            retry_base: Duration::from_secs(timing.retry_base_secs),
            retry_cap: Duration::from_secs(timing.retry_cap_secs),
            watchdog_silence: (timing.watchdog_silence_ms > 0)
                .then(|| Duration::from_millis(timing.watchdog_silence_ms)),
        }
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.timing.tick_ms)
    }

    pub fn screensaver_delay(&self) -> Duration {
        Duration::from_millis(self.timing.screensaver_delay_ms)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.timing.action_timeout_ms)
    }

    pub fn timeout_notice(&self) -> Duration {
        Duration::from_millis(self.timing.timeout_notice_ms)
    }
}
