//! Persisted user preferences (`user_configurations.json`)

use crate::error::{Error, Result};
use crate::fsutil::{self, LockMode};
use crate::protocol::Protocol;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::info;

/// Upper bound on custom DNS servers
pub const MAX_CUSTOM_DNS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KillswitchMode {
    Disabled,
    Soft,
    Hard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DnsStatus {
    Enabled,
    Disabled,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetshieldLevel {
    Disabled,
    Malware,
    AdsMalware,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SplitTunnelingStatus {
    Enabled,
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsConfig {
    pub status: DnsStatus,
    #[serde(default)]
    pub custom_dns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitTunneling {
    pub status: SplitTunnelingStatus,
    #[serde(default)]
    pub ip_list: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserConfiguration {
    pub default_protocol: Protocol,
    pub killswitch: KillswitchMode,
    pub dns: DnsConfig,
    pub netshield: NetshieldLevel,
    pub split_tunneling: SplitTunneling,
}

impl Default for UserConfiguration {
    fn default() -> Self {
        Self {
            default_protocol: Protocol::Udp,
            killswitch: KillswitchMode::Disabled,
            dns: DnsConfig {
                status: DnsStatus::Enabled,
                custom_dns: Vec::new(),
            },
            netshield: NetshieldLevel::Disabled,
            split_tunneling: SplitTunneling {
                status: SplitTunnelingStatus::Disabled,
                ip_list: Vec::new(),
            },
        }
    }
}

impl NetshieldLevel {
    /// Numeric level sent to the VPN servers
    pub fn code(&self) -> u8 {
        match self {
            NetshieldLevel::Disabled => 0,
            NetshieldLevel::Malware => 1,
            NetshieldLevel::AdsMalware => 2,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(NetshieldLevel::Disabled),
            1 => Ok(NetshieldLevel::Malware),
            2 => Ok(NetshieldLevel::AdsMalware),
            _ => Err(Error::IllegalValue(format!("netshield level {}", code))),
        }
    }
}

macro_rules! str_enum {
    ($ty:ident { $($name:literal => $variant:ident),+ $(,)? }) => {
        impl FromStr for $ty {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                match s.trim().to_lowercase().as_str() {
                    $($name => Ok($ty::$variant),)+
                    _ => Err(Error::IllegalValue(format!(
                        "{:?} is not a valid {}",
                        s,
                        stringify!($ty)
                    ))),
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let name = match self {
                    $($ty::$variant => $name,)+
                };
                f.write_str(name)
            }
        }
    };
}

str_enum!(KillswitchMode { "disabled" => Disabled, "soft" => Soft, "hard" => Hard });
str_enum!(DnsStatus { "enabled" => Enabled, "disabled" => Disabled, "custom" => Custom });
str_enum!(NetshieldLevel { "disabled" => Disabled, "malware" => Malware, "ads_malware" => AdsMalware });
str_enum!(SplitTunnelingStatus { "enabled" => Enabled, "disabled" => Disabled });

/// Strict IPv4 dotted-quad check
pub fn is_valid_ip(s: &str) -> bool {
    Ipv4Addr::from_str(s).is_ok()
}

fn validate_ips(ips: &[String]) -> Result<()> {
    match ips.iter().find(|ip| !is_valid_ip(ip)) {
        Some(bad) => Err(Error::IllegalValue(format!("{:?} is not a valid IPv4 address", bad))),
        None => Ok(()),
    }
}

pub struct UserConfigManager {
    path: PathBuf,
}

impl UserConfigManager {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get_user_configurations(&self) -> Result<UserConfiguration> {
        let _lock = fsutil::lock(&self.path, LockMode::Shared)?;
        fsutil::read_json(&self.path)
    }

    pub fn reset_default_configs(&self) -> Result<()> {
        let _lock = fsutil::lock(&self.path, LockMode::Exclusive)?;
        fsutil::write_json_atomic(&self.path, &UserConfiguration::default())?;
        info!("User configuration reset to defaults");
        Ok(())
    }

    pub fn update_default_protocol(&self, protocol: Protocol) -> Result<()> {
        self.update(|c| {
            c.default_protocol = protocol;
            Ok(())
        })
    }

    pub fn update_killswitch(&self, mode: KillswitchMode) -> Result<()> {
        self.update(|c| {
            c.killswitch = mode;
            Ok(())
        })
    }

    pub fn update_netshield(&self, level: NetshieldLevel) -> Result<()> {
        self.update(|c| {
            c.netshield = level;
            Ok(())
        })
    }

    /// Custom status requires 1..=3 IPv4 servers; other statuses clear the list
    pub fn update_dns(&self, status: DnsStatus, custom_dns: Vec<String>) -> Result<()> {
        let custom_dns = if status == DnsStatus::Custom {
            if custom_dns.is_empty() || custom_dns.len() > MAX_CUSTOM_DNS {
                return Err(Error::IllegalValue(format!(
                    "custom DNS needs 1 to {} servers, got {}",
                    MAX_CUSTOM_DNS,
                    custom_dns.len()
                )));
            }
            validate_ips(&custom_dns)?;
            custom_dns
        } else {
            Vec::new()
        };

        self.update(|c| {
            c.dns = DnsConfig { status, custom_dns };
            Ok(())
        })
    }

    pub fn update_split_tunneling(&self, status: SplitTunnelingStatus, ip_list: Vec<String>) -> Result<()> {
        validate_ips(&ip_list)?;
        self.update(|c| {
            c.split_tunneling = SplitTunneling { status, ip_list };
            Ok(())
        })
    }

    /// Read-modify-write under the exclusive lock; a missing file starts from defaults
    fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut UserConfiguration) -> Result<()>,
    {
        let _lock = fsutil::lock(&self.path, LockMode::Exclusive)?;
        let mut config = match fsutil::read_json(&self.path) {
            Ok(c) => c,
            Err(Error::FileNotFound(_)) => UserConfiguration::default(),
            Err(e) => return Err(e),
        };
        f(&mut config)?;
        fsutil::write_json_atomic(&self.path, &config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(temp_dir: &TempDir) -> UserConfigManager {
        UserConfigManager::new(temp_dir.path().join("user_configurations.json"))
    }

    #[test]
    fn test_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let err = manager(&temp_dir).get_user_configurations().unwrap_err();
        assert!(matches!(err, Error::FileNotFound(_)));
    }

    #[test]
    fn test_reset_writes_documented_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir);
        manager.reset_default_configs().unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(manager.path()).unwrap()).unwrap();
        assert_eq!(
            raw,
            serde_json::json!({
                "default_protocol": "udp",
                "killswitch": "disabled",
                "dns": {"status": "enabled", "custom_dns": []},
                "netshield": "disabled",
                "split_tunneling": {"status": "disabled", "ip_list": []}
            })
        );
    }

    #[test]
    fn test_setters() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir);

        manager.update_default_protocol(Protocol::Tcp).unwrap();
        manager.update_killswitch(KillswitchMode::Hard).unwrap();
        manager.update_netshield(NetshieldLevel::AdsMalware).unwrap();
        manager
            .update_dns(DnsStatus::Custom, vec!["1.1.1.1".to_string()])
            .unwrap();
        manager
            .update_split_tunneling(SplitTunnelingStatus::Enabled, vec!["192.168.1.10".to_string()])
            .unwrap();

        let config = manager.get_user_configurations().unwrap();
        assert_eq!(config.default_protocol, Protocol::Tcp);
        assert_eq!(config.killswitch, KillswitchMode::Hard);
        assert_eq!(config.netshield, NetshieldLevel::AdsMalware);
        assert_eq!(config.dns.custom_dns, vec!["1.1.1.1".to_string()]);
        assert_eq!(config.split_tunneling.status, SplitTunnelingStatus::Enabled);
    }

    #[test]
    fn test_invalid_dns_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir);

        let err = manager
            .update_dns(DnsStatus::Custom, vec!["999.1.1.1".to_string()])
            .unwrap_err();
        assert!(matches!(err, Error::IllegalValue(_)));

        let err = manager.update_dns(DnsStatus::Custom, vec![]).unwrap_err();
        assert!(matches!(err, Error::IllegalValue(_)));

        let four = vec!["1.1.1.1".to_string(); 4];
        assert!(manager.update_dns(DnsStatus::Custom, four).is_err());
    }

    #[test]
    fn test_non_custom_dns_clears_list() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir);
        manager
            .update_dns(DnsStatus::Enabled, vec!["1.1.1.1".to_string()])
            .unwrap();
        assert!(manager.get_user_configurations().unwrap().dns.custom_dns.is_empty());
    }

    #[test]
    fn test_enum_parsing() {
        assert_eq!("soft".parse::<KillswitchMode>().unwrap(), KillswitchMode::Soft);
        assert_eq!("ads_malware".parse::<NetshieldLevel>().unwrap(), NetshieldLevel::AdsMalware);
        assert!(matches!(
            "sometimes".parse::<KillswitchMode>(),
            Err(Error::IllegalValue(_))
        ));
        assert!("maybe".parse::<DnsStatus>().is_err());
        assert_eq!(NetshieldLevel::Malware.to_string(), "malware");
    }

    #[test]
    fn test_netshield_codes() {
        assert_eq!(NetshieldLevel::Disabled.code(), 0);
        assert_eq!(NetshieldLevel::Malware.code(), 1);
        assert_eq!(NetshieldLevel::AdsMalware.code(), 2);
        assert_eq!(NetshieldLevel::from_code(2).unwrap(), NetshieldLevel::AdsMalware);
        assert!(NetshieldLevel::from_code(3).is_err());
    }

    #[test]
    fn test_is_valid_ip() {
        assert!(is_valid_ip("10.0.0.1"));
        assert!(is_valid_ip("255.255.255.255"));
        assert!(!is_valid_ip("256.0.0.1"));
        assert!(!is_valid_ip("10.0.0"));
        assert!(!is_valid_ip("::1"));
        assert!(!is_valid_ip("abc"));
    }
}
