//! WireGuard `.conf` rendering and client key generation

use crate::constants::{WIREGUARD_ADDRESS, WIREGUARD_DNS, WIREGUARD_PORT};
use crate::error::{Error, Result};
use crate::profile::ProfileTarget;
use crate::user_config::{DnsStatus, UserConfiguration};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use rand::rngs::OsRng;
use std::fmt;
use x25519_dalek::{PublicKey, StaticSecret};

/// Client Curve25519 key pair
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
}

impl KeyPair {
    pub fn generate() -> Self {
        Self {
            secret: StaticSecret::random_from_rng(OsRng),
        }
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            secret: StaticSecret::from(bytes),
        }
    }

    pub fn private_key_base64(&self) -> String {
        BASE64.encode(self.secret.to_bytes())
    }

    pub fn public_key_base64(&self) -> String {
        BASE64.encode(PublicKey::from(&self.secret).as_bytes())
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public_key_base64())
            .finish_non_exhaustive()
    }
}

fn is_valid_key(key: &str) -> bool {
    BASE64.decode(key).map(|b| b.len() == 32).unwrap_or(false)
}

pub fn render(target: &ProfileTarget, keys: &KeyPair, user_config: &UserConfiguration) -> Result<String> {
    let peer_key = target
        .x25519_public_key
        .as_deref()
        .filter(|k| is_valid_key(k))
        .ok_or_else(|| {
            Error::IllegalData(format!("{} has no usable WireGuard public key", target.servername))
        })?;

    let dns = match user_config.dns.status {
        DnsStatus::Custom if !user_config.dns.custom_dns.is_empty() => user_config.dns.custom_dns.join(", "),
        _ => WIREGUARD_DNS.to_string(),
    };

    Ok(format!(
        "# ProtonVPN {name}\n\
         [Interface]\n\
         PrivateKey = {private}\n\
         Address = {address}\n\
         DNS = {dns}\n\
         \n\
         [Peer]\n\
         PublicKey = {peer}\n\
         AllowedIPs = 0.0.0.0/0\n\
         Endpoint = {entry}:{port}\n",
        name = target.servername,
        private = keys.private_key_base64(),
        address = WIREGUARD_ADDRESS,
        dns = dns,
        peer = peer_key,
        entry = target.entry_ip,
        port = WIREGUARD_PORT,
    ))
}
