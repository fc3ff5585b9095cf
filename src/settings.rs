//! Application settings (TOML)
//!
//! These are operator-level knobs (endpoints, timeouts, cache windows,
//! certificate pins). User preferences live in [`crate::user_config`].

use crate::constants;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub api: ApiSettings,
    pub cache: CacheSettings,
    pub paths: PathSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    pub url: String,
    pub app_version: String,
    pub user_agent: String,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub retry_after_cap_secs: u64,
    pub unavailable_backoff_ms: u64,
    /// Host -> accepted SPKI SHA-256 pins (base64). Empty disables pinning.
    pub pins: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub full_expire_secs: u64,
    pub loads_expire_secs: u64,
    pub stale_ceiling_secs: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    /// Overrides `~/.config/protonvpn`
    pub config_dir: Option<PathBuf>,
    /// Overrides `~/.cache/protonvpn`
    pub cache_dir: Option<PathBuf>,
    /// OpenVPN template holding the provider CA and tls-auth key
    pub openvpn_template: Option<PathBuf>,
}

impl Default for ApiSettings {
    fn default() -> Self {
        let mut pins = HashMap::new();
        pins.insert(
            "api.protonvpn.ch".to_string(),
            constants::API_PINS.iter().map(|p| p.to_string()).collect(),
        );
        Self {
            url: constants::API_URL.to_string(),
            app_version: constants::APP_VERSION.to_string(),
            user_agent: constants::USER_AGENT.to_string(),
            connect_timeout_secs: constants::CONNECT_TIMEOUT.as_secs(),
            request_timeout_secs: constants::REQUEST_TIMEOUT.as_secs(),
            retry_after_cap_secs: constants::RETRY_AFTER_CAP.as_secs(),
            unavailable_backoff_ms: constants::UNAVAILABLE_BACKOFF.as_millis() as u64,
            pins,
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            full_expire_secs: constants::FULL_CACHE_TIME_EXPIRE.as_secs(),
            loads_expire_secs: constants::LOADS_CACHE_TIME_EXPIRE.as_secs(),
            stale_ceiling_secs: constants::STALE_CACHE_CEILING.as_secs(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api: ApiSettings::default(),
            cache: CacheSettings::default(),
            paths: PathSettings::default(),
        }
    }
}

impl ApiSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_after_cap(&self) -> Duration {
        Duration::from_secs(self.retry_after_cap_secs)
    }

    pub fn unavailable_backoff(&self) -> Duration {
        Duration::from_millis(self.unavailable_backoff_ms)
    }
}

impl CacheSettings {
    pub fn full_expire(&self) -> Duration {
        Duration::from_secs(self.full_expire_secs)
    }

    pub fn loads_expire(&self) -> Duration {
        Duration::from_secs(self.loads_expire_secs)
    }

    pub fn stale_ceiling(&self) -> Duration {
        Duration::from_secs(self.stale_ceiling_secs)
    }
}

impl Settings {
    /// Settings used under `PROTONVPN_ENV_CI=true`: no pinning, no backoff
    pub fn ci() -> Self {
        let mut settings = Self::default();
        settings.api.pins.clear();
        settings.api.unavailable_backoff_ms = 0;
        settings
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)?;
        Ok(settings)
    }

    /// Load from `path` if it exists, otherwise fall back to defaults
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            debug!("Loading settings from {}", path.display());
            Self::load(path)
        } else {
            info!("No settings file at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn config_dir(&self) -> PathBuf {
        self.paths.config_dir.clone().unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(constants::APP_DIR)
        })
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.paths.cache_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(constants::APP_DIR)
        })
    }

    pub fn openvpn_template_path(&self) -> PathBuf {
        self.paths
            .openvpn_template
            .clone()
            .unwrap_or_else(|| self.config_dir().join(constants::OPENVPN_TEMPLATE_FILE))
    }
}

/// Default location of the settings file
pub fn default_settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(constants::APP_DIR)
        .join(constants::SETTINGS_FILE)
}
