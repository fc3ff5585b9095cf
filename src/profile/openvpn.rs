//! OpenVPN `.ovpn` rendering
//!
//! Certificate material comes from a local template holding the provider's
//! `<ca>` and `<tls-auth>` blocks and a `dev tun|tap` line.

use crate::constants::{OPENVPN_TCP_PORTS, OPENVPN_UDP_PORTS};
use crate::error::{Error, Result};
use crate::profile::ProfileTarget;
use crate::protocol::Protocol;
use crate::user_config::{DnsStatus, SplitTunnelingStatus, UserConfiguration};
use std::fmt::Write as _;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtualDevice {
    Tun,
    Tap,
}

impl VirtualDevice {
    pub fn as_str(&self) -> &'static str {
        match self {
            VirtualDevice::Tun => "tun",
            VirtualDevice::Tap => "tap",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpenVpnTemplate {
    pub device: VirtualDevice,
    pub ca: String,
    pub tls_auth: Option<String>,
    pub key_direction: Option<String>,
}

/// Content between `<tag>` and `</tag>`, trimmed
fn inline_block(content: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = content.find(&open)? + open.len();
    let end = start + content[start..].find(&close)?;
    Some(content[start..end].trim().to_string())
}

impl OpenVpnTemplate {
    pub fn load(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::FileNotFound(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };
        debug!("Parsing OpenVPN template {}", path.display());
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let device = content
            .lines()
            .map(str::trim)
            .find_map(|line| line.strip_prefix("dev ").or_else(|| (line == "dev").then_some("")))
            .ok_or(Error::VirtualDeviceNotFound)?;
        let device = match device.trim() {
            "tun" => VirtualDevice::Tun,
            "tap" => VirtualDevice::Tap,
            other => return Err(Error::IllegalVirtualDevice(other.to_string())),
        };

        let ca = inline_block(content, "ca")
            .filter(|ca| !ca.is_empty())
            .ok_or_else(|| Error::IllegalData("OpenVPN template has no <ca> block".to_string()))?;
        let key_direction = content
            .lines()
            .map(str::trim)
            .find_map(|line| line.strip_prefix("key-direction "))
            .map(|d| d.trim().to_string());

        Ok(Self {
            device,
            ca,
            tls_auth: inline_block(content, "tls-auth"),
            key_direction,
        })
    }
}

pub fn ports(protocol: Protocol) -> &'static [u16] {
    match protocol {
        Protocol::Tcp => OPENVPN_TCP_PORTS,
        _ => OPENVPN_UDP_PORTS,
    }
}

pub fn render(
    template: &OpenVpnTemplate,
    target: &ProfileTarget,
    protocol: Protocol,
    user_config: &UserConfiguration,
) -> Result<String> {
    let mut out = String::new();
    writeln!(out, "# ProtonVPN {} ({})", target.servername, protocol)?;
    writeln!(out, "client")?;
    writeln!(out, "dev {}", template.device.as_str())?;
    writeln!(out, "proto {}", protocol)?;
    for port in ports(protocol) {
        writeln!(out, "remote {} {}", target.entry_ip, port)?;
    }
    out.push_str(
        "remote-random\n\
         resolv-retry infinite\n\
         nobind\n\
         cipher AES-256-GCM\n\
         auth SHA512\n\
         verb 3\n\
         tun-mtu 1500\n\
         mssfix 0\n\
         persist-key\n\
         persist-tun\n\
         reneg-sec 0\n\
         remote-cert-tls server\n\
         auth-user-pass\n\
         pull\n\
         fast-io\n",
    );
    writeln!(out, "verify-x509-name {} name", target.domain)?;

    if user_config.split_tunneling.status == SplitTunnelingStatus::Enabled {
        for ip in &user_config.split_tunneling.ip_list {
            writeln!(out, "route {} 255.255.255.255 net_gateway", ip)?;
        }
    }

    if user_config.dns.status == DnsStatus::Custom {
        writeln!(out, "pull-filter ignore \"dhcp-option DNS\"")?;
        for dns in &user_config.dns.custom_dns {
            writeln!(out, "dhcp-option DNS {}", dns)?;
        }
    }

    writeln!(out, "<ca>\n{}\n</ca>", template.ca)?;
    if let Some(tls_auth) = &template.tls_auth {
        let direction = template.key_direction.as_deref().unwrap_or("1");
        writeln!(out, "key-direction {}", direction)?;
        writeln!(out, "<tls-auth>\n{}\n</tls-auth>", tls_auth)?;
    }
    Ok(out)
}
