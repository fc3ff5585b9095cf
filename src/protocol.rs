//! VPN protocol identifiers and their implementations

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// User-facing protocol choice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Ikev2,
    Wireguard,
}

/// Software stack that carries a protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Implementation {
    OpenVpn,
    StrongSwan,
    WireGuard,
}

impl Protocol {
    pub fn all() -> &'static [Protocol] {
        &[
            Protocol::Tcp,
            Protocol::Udp,
            Protocol::Ikev2,
            Protocol::Wireguard,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Ikev2 => "ikev2",
            Protocol::Wireguard => "wireguard",
        }
    }

    pub fn implementation(&self) -> Implementation {
        match self {
            Protocol::Tcp | Protocol::Udp => Implementation::OpenVpn,
            Protocol::Ikev2 => Implementation::StrongSwan,
            Protocol::Wireguard => Implementation::WireGuard,
        }
    }
}

impl Implementation {
    /// File extension of the emitted profile
    pub fn extension(&self) -> &'static str {
        match self {
            Implementation::OpenVpn => "ovpn",
            Implementation::StrongSwan => "sswan",
            Implementation::WireGuard => "conf",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "ikev2" => Ok(Protocol::Ikev2),
            "wireguard" => Ok(Protocol::Wireguard),
            _ => Err(Error::IllegalVpnProtocol(s.to_string())),
        }
    }
}
