//! Secret storage for session tokens and VPN credentials
//!
//! Values are JSON documents keyed by `(service, username)`. The backend is
//! pluggable: the OS keyring in production (Secret Service, Keychain,
//! Credential Manager) and an in-memory map for CI and tests.

use crate::constants::{KEYRING_PROTON_USER, KEYRING_SERVICE, KEYRING_SESSION_DATA, KEYRING_USER_DATA};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Binary-safe key-value secret store
pub trait SecretBackend: Send + Sync {
    fn get(&self, service: &str, username: &str) -> Result<Option<Vec<u8>>>;
    fn set(&self, service: &str, username: &str, secret: &[u8]) -> Result<()>;
    /// Deleting a missing entry is not an error
    fn delete(&self, service: &str, username: &str) -> Result<()>;
}

/// OS keyring backend
#[derive(Debug, Default)]
pub struct KeyringBackend;

impl SecretBackend for KeyringBackend {
    fn get(&self, service: &str, username: &str) -> Result<Option<Vec<u8>>> {
        let entry = keyring::Entry::new(service, username)?;
        match entry.get_secret() {
            Ok(secret) => Ok(Some(secret)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, service: &str, username: &str, secret: &[u8]) -> Result<()> {
        let entry = keyring::Entry::new(service, username)?;
        entry.set_secret(secret)?;
        Ok(())
    }

    fn delete(&self, service: &str, username: &str) -> Result<()> {
        let entry = keyring::Entry::new(service, username)?;
        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Process-local backend
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryBackend {
    fn entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<(String, String), Vec<u8>>>> {
        self.entries
            .lock()
            .map_err(|_| Error::Keyring("memory backend poisoned".to_string()))
    }
}

impl SecretBackend for MemoryBackend {
    fn get(&self, service: &str, username: &str) -> Result<Option<Vec<u8>>> {
        let key = (service.to_string(), username.to_string());
        Ok(self.entries()?.get(&key).cloned())
    }

    fn set(&self, service: &str, username: &str, secret: &[u8]) -> Result<()> {
        let key = (service.to_string(), username.to_string());
        self.entries()?.insert(key, secret.to_vec());
        Ok(())
    }

    fn delete(&self, service: &str, username: &str) -> Result<()> {
        let key = (service.to_string(), username.to_string());
        self.entries()?.remove(&key);
        Ok(())
    }
}

/// Session cookies returned alongside the tokens
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionCookies {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

/// Authenticated API session tokens
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionData {
    pub uid: String,
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub cookies: SessionCookies,
}

impl fmt::Debug for SessionData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionData")
            .field("uid", &self.uid)
            .field("access_token", &"[redacted]")
            .field("refresh_token", &"[redacted]")
            .field("scopes", &self.scopes)
            .finish()
    }
}

/// OpenVPN/IKEv2 credentials and subscription tier
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VpnCredentials {
    pub name: String,
    pub password: String,
    pub max_tier: u8,
}

impl fmt::Debug for VpnCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VpnCredentials")
            .field("name", &self.name)
            .field("password", &"[redacted]")
            .field("max_tier", &self.max_tier)
            .finish()
    }
}

/// Stored shape of the VPN user data slot: `{"VPN": {...}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VpnUserData {
    #[serde(rename = "VPN")]
    pub vpn: VpnCredentials,
}

pub const MAX_TIER: u8 = 3;

pub struct CredentialStore {
    backend: Arc<dyn SecretBackend>,
}

impl CredentialStore {
    pub fn new(backend: Arc<dyn SecretBackend>) -> Self {
        Self { backend }
    }

    pub fn keyring() -> Self {
        Self::new(Arc::new(KeyringBackend))
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::default()))
    }

    /// Store a JSON document under `(service, username)`
    ///
    /// With `is_user_data` the document must have the `{"VPN": {...}}` shape.
    pub fn store(&self, data: &Value, username: &str, service: &str, is_user_data: bool) -> Result<()> {
        let empty = match data {
            Value::Null => true,
            Value::String(s) => s.is_empty(),
            Value::Object(map) => map.is_empty(),
            Value::Array(items) => items.is_empty(),
            _ => false,
        };
        if empty {
            return Err(Error::IllegalData(format!(
                "refusing to store empty data for {}/{}",
                service, username
            )));
        }
        if is_user_data {
            let user_data: VpnUserData = serde_json::from_value(data.clone())
                .map_err(|e| Error::IllegalData(format!("invalid VPN user data: {}", e)))?;
            if user_data.vpn.max_tier > MAX_TIER {
                return Err(Error::IllegalData(format!(
                    "tier {} out of range",
                    user_data.vpn.max_tier
                )));
            }
        }

        let bytes = serde_json::to_vec(data)?;
        self.backend.set(service, username, &bytes)?;
        debug!("Stored secret {}/{}", service, username);
        Ok(())
    }

    pub fn get(&self, username: &str, service: &str) -> Result<Value> {
        let bytes = self
            .backend
            .get(service, username)?
            .ok_or_else(|| Error::StoredSessionNotFound {
                service: service.to_string(),
                username: username.to_string(),
            })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn delete(&self, username: &str, service: &str) -> Result<()> {
        self.backend.delete(service, username)?;
        debug!("Deleted secret {}/{}", service, username);
        Ok(())
    }

    pub fn store_session(&self, session: &SessionData) -> Result<()> {
        let value = serde_json::to_value(session)?;
        self.store(&value, KEYRING_SESSION_DATA, KEYRING_SERVICE, false)
    }

    pub fn load_session(&self) -> Result<SessionData> {
        let value = self.get(KEYRING_SESSION_DATA, KEYRING_SERVICE)?;
        Ok(serde_json::from_value(value)?)
    }

    pub fn store_vpn_credentials(&self, credentials: &VpnCredentials) -> Result<()> {
        let value = serde_json::to_value(VpnUserData {
            vpn: credentials.clone(),
        })?;
        self.store(&value, KEYRING_USER_DATA, KEYRING_SERVICE, true)
    }

    pub fn load_vpn_credentials(&self) -> Result<VpnCredentials> {
        let value = self.get(KEYRING_USER_DATA, KEYRING_SERVICE)?;
        let user_data: VpnUserData = serde_json::from_value(value)?;
        Ok(user_data.vpn)
    }

    pub fn store_proton_username(&self, username: &str) -> Result<()> {
        self.store(
            &Value::String(username.to_string()),
            KEYRING_PROTON_USER,
            KEYRING_SERVICE,
            false,
        )
    }

    pub fn load_proton_username(&self) -> Result<String> {
        match self.get(KEYRING_PROTON_USER, KEYRING_SERVICE)? {
            Value::String(s) => Ok(s),
            other => Err(Error::IllegalData(format!("unexpected username value: {}", other))),
        }
    }

    /// Remove all three slots
    pub fn clear(&self) -> Result<()> {
        for slot in [KEYRING_SESSION_DATA, KEYRING_USER_DATA, KEYRING_PROTON_USER] {
            self.delete(slot, KEYRING_SERVICE)?;
        }
        info!("Cleared stored credentials");
        Ok(())
    }
}
