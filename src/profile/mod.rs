//! Connection profile emitters
//!
//! All three formats are rendered from the same [`ProfileTarget`]: the
//! chosen logical server projected onto one online physical host.

pub mod openvpn;
pub mod strongswan;
pub mod wireguard;

use crate::credentials::VpnCredentials;
use crate::error::{Error, Result};
use crate::fsutil;
use crate::protocol::{Implementation, Protocol};
use crate::servers::model::{LogicalServer, PhysicalServer};
use crate::servers::selector;
use crate::user_config::{NetshieldLevel, UserConfiguration};
use rand::Rng;
use std::path::{Path, PathBuf};
use tracing::info;

/// Fields every emitter needs
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileTarget {
    pub servername: String,
    pub domain: String,
    pub entry_ip: String,
    pub exit_ip: String,
    pub label: Option<String>,
    pub x25519_public_key: Option<String>,
}

impl ProfileTarget {
    pub fn project(logical: &LogicalServer, physical: &PhysicalServer) -> Self {
        let (entry_ip, exit_ip) = selector::get_server_entry_exit_ip(physical);
        Self {
            servername: logical.name.clone(),
            domain: physical.domain.clone(),
            entry_ip: entry_ip.to_string(),
            exit_ip: exit_ip.to_string(),
            label: selector::get_server_label(physical).map(String::from),
            x25519_public_key: physical.x25519_public_key.clone(),
        }
    }
}

/// User-side inputs to rendering
#[derive(Debug, Clone)]
pub struct EmitOptions {
    pub credentials: VpnCredentials,
    pub user_config: UserConfiguration,
    pub openvpn_template: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmittedProfile {
    pub path: PathBuf,
    pub protocol: Protocol,
    pub servername: String,
    pub domain: String,
    pub entry_ip: String,
    pub exit_ip: String,
    pub label: Option<String>,
    /// VPN username including NetShield suffix
    pub username: String,
    /// Client public key, WireGuard only
    pub wireguard_public_key: Option<String>,
}

/// VPN username with the NetShield suffix the gateways understand
pub fn vpn_username(credentials: &VpnCredentials, netshield: NetshieldLevel) -> String {
    match netshield {
        NetshieldLevel::Disabled => credentials.name.clone(),
        level => format!("{}+f{}", credentials.name, level.code()),
    }
}

fn profile_file_name(servername: &str, protocol: Protocol) -> String {
    let stem: String = servername
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    format!(
        "protonvpn-{}-{}.{}",
        stem,
        protocol,
        protocol.implementation().extension()
    )
}

/// Render a profile for `servername` and write it under `output_dir`
pub fn generate_vpn_cert<R: Rng + ?Sized>(
    protocol: &str,
    servername: &str,
    servers: &[LogicalServer],
    output_dir: &Path,
    options: &EmitOptions,
    rng: &mut R,
) -> Result<EmittedProfile> {
    let protocol: Protocol = protocol.parse()?;
    if servers.is_empty() {
        return Err(Error::EmptyServerList("server list is empty".to_string()));
    }
    let logical = selector::get_server(servers, servername)
        .ok_or_else(|| Error::ServerNotFound(servername.to_string()))?;
    let physical = selector::choose_physical(logical, rng)?;
    let target = ProfileTarget::project(logical, physical);
    let username = vpn_username(&options.credentials, options.user_config.netshield);

    let mut wireguard_public_key = None;
    let content = match protocol.implementation() {
        Implementation::OpenVpn => {
            let template = openvpn::OpenVpnTemplate::load(&options.openvpn_template)?;
            openvpn::render(&template, &target, protocol, &options.user_config)?
        }
        Implementation::StrongSwan => strongswan::render(&target, &username)?,
        Implementation::WireGuard => {
            let keys = wireguard::KeyPair::generate();
            wireguard_public_key = Some(keys.public_key_base64());
            wireguard::render(&target, &keys, &options.user_config)?
        }
    };

    let path = output_dir.join(profile_file_name(&target.servername, protocol));
    fsutil::write_atomic(&path, content.as_bytes())?;
    info!(
        "Wrote {} profile for {} ({}) to {}",
        protocol,
        target.servername,
        target.entry_ip,
        path.display()
    );

    Ok(EmittedProfile {
        path,
        protocol,
        servername: target.servername,
        domain: target.domain,
        entry_ip: target.entry_ip,
        exit_ip: target.exit_ip,
        label: target.label,
        username,
        wireguard_public_key,
    })
}


#[cfg(test)]
mod tests {
    use super::test_support::{TEMPLATE, options};
    use super::*;
    use crate::servers::fixtures::raw_server_list;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use tempfile::TempDir;

    fn setup() -> (TempDir, EmitOptions) {
        let temp_dir = TempDir::new().unwrap();
        let template = temp_dir.path().join("template.ovpn");
        std::fs::write(&template, TEMPLATE).unwrap();
        let options = options(template);
        (temp_dir, options)
    }

    #[test]
    fn test_unknown_protocol() {
        let (temp_dir, options) = setup();
        let mut rng = StdRng::seed_from_u64(0);
        for protocol in ["pptp", "", "udp6", "openvpn"] {
            let err = generate_vpn_cert(
                protocol,
                "TEST#6",
                &raw_server_list(),
                temp_dir.path(),
                &options,
                &mut rng,
            )
            .unwrap_err();
            assert!(matches!(err, Error::IllegalVpnProtocol(_)), "{}: {:?}", protocol, err);
        }
    }

    #[test]
    fn test_empty_server_list() {
        let (temp_dir, options) = setup();
        let mut rng = StdRng::seed_from_u64(0);
        let err = generate_vpn_cert("udp", "TEST#6", &[], temp_dir.path(), &options, &mut rng).unwrap_err();
        assert!(matches!(err, Error::EmptyServerList(_)));
    }

    #[test]
    fn test_unknown_server() {
        let (temp_dir, options) = setup();
        let mut rng = StdRng::seed_from_u64(0);
        let err = generate_vpn_cert("udp", "XX#1", &raw_server_list(), temp_dir.path(), &options, &mut rng)
            .unwrap_err();
        assert!(matches!(err, Error::ServerNotFound(_)));
    }

    #[test]
    fn test_every_protocol_emits() {
        let (temp_dir, options) = setup();
        let servers = raw_server_list();
        let mut rng = StdRng::seed_from_u64(0);

        for protocol in Protocol::all() {
            let emitted = generate_vpn_cert(
                protocol.as_str(),
                "TEST#5",
                &servers,
                temp_dir.path(),
                &options,
                &mut rng,
            )
            .unwrap();
            assert!(emitted.path.exists());
            assert_eq!(
                emitted.path.extension().unwrap(),
                protocol.implementation().extension()
            );
            assert_eq!(emitted.domain, "node-pt-05.protonvpn.test");
            assert_eq!(emitted.entry_ip, "185.159.157.5");
            assert_eq!(emitted.label.as_deref(), Some("TestLabel"));
            assert_eq!(
                emitted.wireguard_public_key.is_some(),
                *protocol == Protocol::Wireguard
            );
        }
    }

    #[test]
    fn test_profile_file_name() {
        assert_eq!(
            profile_file_name("CH-FI#8", Protocol::Udp),
            "protonvpn-ch-fi-8-udp.ovpn"
        );
        assert_eq!(
            profile_file_name("TEST#6", Protocol::Ikev2),
            "protonvpn-test-6-ikev2.sswan"
        );
    }

    #[test]
    fn test_netshield_username() {
        let (_temp_dir, options) = setup();
        let creds = &options.credentials;
        assert_eq!(vpn_username(creds, NetshieldLevel::Disabled), "vpnuser");
        assert_eq!(vpn_username(creds, NetshieldLevel::Malware), "vpnuser+f1");
        assert_eq!(vpn_username(creds, NetshieldLevel::AdsMalware), "vpnuser+f2");
    }

    #[test]
    fn test_projection() {
        let servers = raw_server_list();
        let logical = selector::get_server(&servers, "TEST#6").unwrap();
        let target = ProfileTarget::project(logical, &logical.physical_servers[0]);
        assert_eq!(target.entry_ip, "255.211.255.0");
        assert_eq!(target.exit_ip, "255.211.255.0");
        assert_eq!(target.label, None);
        assert_eq!(target.servername, "TEST#6");
    }
}
