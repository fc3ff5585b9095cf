//! Logical and physical server records as served by `/vpn/logicals`

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Location {
    pub lat: f64,
    pub long: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PhysicalServer {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "EntryIP")]
    pub entry_ip: String,
    #[serde(rename = "ExitIP")]
    pub exit_ip: String,
    pub domain: String,
    pub status: u8,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(rename = "X25519PublicKey", default)]
    pub x25519_public_key: Option<String>,
}

impl PhysicalServer {
    pub fn is_enabled(&self) -> bool {
        self.status == 1
    }

    /// Label, treating an empty string as absent
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref().filter(|l| !l.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LogicalServer {
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
    pub entry_country: String,
    pub exit_country: String,
    pub domain: String,
    pub tier: u8,
    pub features: u32,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    pub score: f64,
    #[serde(default)]
    pub load: u8,
    pub status: u8,
    #[serde(default)]
    pub location: Option<Location>,
    #[serde(rename = "Servers", default)]
    pub physical_servers: Vec<PhysicalServer>,
}

impl LogicalServer {
    pub fn has_feature(&self, feature: Feature) -> bool {
        self.features & feature.bit() != 0
    }

    pub fn feature_list(&self) -> Vec<Feature> {
        Feature::all()
            .iter()
            .copied()
            .filter(|f| self.has_feature(*f))
            .collect()
    }

    pub fn enabled_physical_servers(&self) -> impl Iterator<Item = &PhysicalServer> {
        self.physical_servers.iter().filter(|p| p.is_enabled())
    }

    /// Online, within `max_tier`, and backed by at least one online host
    pub fn is_permitted(&self, max_tier: u8) -> bool {
        self.status == 1 && self.tier <= max_tier && self.enabled_physical_servers().next().is_some()
    }
}

/// Capability bits carried in `Features`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    SecureCore,
    Tor,
    P2p,
    Streaming,
    Ipv6,
}

impl Feature {
    pub fn all() -> &'static [Feature] {
        &[
            Feature::SecureCore,
            Feature::Tor,
            Feature::P2p,
            Feature::Streaming,
            Feature::Ipv6,
        ]
    }

    pub fn bit(&self) -> u32 {
        match self {
            Feature::SecureCore => 1,
            Feature::Tor => 2,
            Feature::P2p => 4,
            Feature::Streaming => 8,
            Feature::Ipv6 => 16,
        }
    }

    /// Short name used on the command line
    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::SecureCore => "sc",
            Feature::Tor => "tor",
            Feature::P2p => "p2p",
            Feature::Streaming => "stream",
            Feature::Ipv6 => "ipv6",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Feature {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Feature::all()
            .iter()
            .copied()
            .find(|f| f.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::IllegalValue(format!("unknown server feature {:?}", s)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServerLoad {
    #[serde(rename = "ID")]
    pub id: String,
    pub load: u8,
    pub score: f64,
}

/// On-disk server cache document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerCacheEnvelope {
    /// Unix seconds of the last `/vpn/logicals` fetch
    pub fetched_at_full: u64,
    /// Unix seconds of the last `/vpn/loads` merge (or full fetch)
    pub fetched_at_loads: u64,
    /// Tier the list was fetched for
    pub logical_server_tier: u8,
    pub servers: Vec<LogicalServer>,
}

impl ServerCacheEnvelope {
    /// Merge `Load` and `Score` by server ID; unknown IDs are ignored
    pub fn merge_loads(&mut self, loads: &[ServerLoad]) -> usize {
        let mut merged = 0;
        for load in loads {
            if let Some(server) = self.servers.iter_mut().find(|s| s.id == load.id) {
                server.load = load.load;
                server.score = load.score;
                merged += 1;
            }
        }
        merged
    }
}
