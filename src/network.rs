//! Hand-off to the system network stack

use crate::error::{Error, Result};
use crate::profile::EmittedProfile;
use crate::protocol::{Implementation, Protocol};
use std::io::Write;
use std::path::Path;
use std::process::{Command, Output};
use std::sync::Mutex;
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// Something that can bring a tunnel up from an emitted profile
pub trait NetworkBackend: Send + Sync {
    /// Import and activate `profile`; returns the backend's connection name
    fn start(&self, profile: &EmittedProfile, password: &str) -> Result<String>;
    /// Deactivate and forget the connection
    fn stop(&self, connection_name: &str) -> Result<()>;
    fn is_active(&self, connection_name: &str) -> Result<bool>;
}

/// NetworkManager via `nmcli`
pub struct NmcliBackend;

impl NmcliBackend {
    pub fn new() -> Self {
        Self
    }

    fn run(args: &[&str]) -> Result<Output> {
        debug!("nmcli {}", args.join(" "));
        let output = Command::new("nmcli")
            .args(args)
            .output()
            .map_err(|e| Error::Backend(format!("failed to run nmcli: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Backend(stderr.trim().to_string()));
        }
        Ok(output)
    }

    fn import(kind: &str, path: &Path) -> Result<String> {
        let path = path.to_string_lossy();
        let output = Self::run(&["connection", "import", "type", kind, "file", &path])?;
        parse_import_name(&String::from_utf8_lossy(&output.stdout))
            .ok_or_else(|| Error::Backend("could not read connection name from nmcli".to_string()))
    }
}

impl Default for NmcliBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// `Connection 'name' (uuid) successfully added.` -> `name`
fn parse_import_name(stdout: &str) -> Option<String> {
    let start = stdout.find('\'')? + 1;
    let end = start + stdout[start..].find('\'')?;
    Some(stdout[start..end].to_string())
}

/// Interface names are capped at 15 bytes; wireguard imports name the interface after the file
const WIREGUARD_IMPORT_NAME: &str = "protonwg0.conf";

impl NetworkBackend for NmcliBackend {
    fn start(&self, profile: &EmittedProfile, password: &str) -> Result<String> {
        let name = match profile.protocol.implementation() {
            Implementation::OpenVpn => {
                let name = Self::import("openvpn", &profile.path)?;
                let user = format!("username={}", profile.username);
                Self::run(&["connection", "modify", &name, "+vpn.data", &user])?;

                let mut secrets = NamedTempFile::new()?;
                writeln!(secrets, "vpn.secrets.password:{}", password)?;
                let secrets_path = secrets.path().to_string_lossy().to_string();
                Self::run(&["connection", "up", &name, "passwd-file", &secrets_path])?;
                name
            }
            Implementation::WireGuard => {
                let staging = tempfile::tempdir()?;
                let staged = staging.path().join(WIREGUARD_IMPORT_NAME);
                std::fs::copy(&profile.path, &staged)?;
                let name = Self::import("wireguard", &staged)?;
                Self::run(&["connection", "up", &name])?;
                name
            }
            Implementation::StrongSwan => {
                return Err(Error::Backend(format!(
                    "{} profiles are imported by the strongSwan client, not NetworkManager: {}",
                    Protocol::Ikev2,
                    profile.path.display()
                )));
            }
        };
        info!("Activated {} via NetworkManager", name);
        Ok(name)
    }

    fn stop(&self, connection_name: &str) -> Result<()> {
        if self.is_active(connection_name)? {
            Self::run(&["connection", "down", connection_name])?;
        }
        Self::run(&["connection", "delete", connection_name])?;
        info!("Removed {} from NetworkManager", connection_name);
        Ok(())
    }

    fn is_active(&self, connection_name: &str) -> Result<bool> {
        let output = Self::run(&["-t", "-f", "NAME", "connection", "show", "--active"])?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .any(|line| line == connection_name))
    }
}

/// Backend that only records what it was asked to do
///
/// Used under `PROTONVPN_ENV_CI` and in tests.
#[derive(Debug, Default)]
pub struct DryRunBackend {
    active: Mutex<Vec<String>>,
    fail_start: bool,
}

impl DryRunBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend whose `start` always fails
    pub fn failing() -> Self {
        Self {
            fail_start: true,
            ..Self::default()
        }
    }

    pub fn active(&self) -> Vec<String> {
        self.active.lock().map(|a| a.clone()).unwrap_or_default()
    }
}

impl NetworkBackend for DryRunBackend {
    fn start(&self, profile: &EmittedProfile, _password: &str) -> Result<String> {
        if self.fail_start {
            return Err(Error::Backend("dry run: start refused".to_string()));
        }
        let name = format!("ProtonVPN {}", profile.servername);
        if let Ok(mut active) = self.active.lock() {
            active.push(name.clone());
        }
        info!("Dry run: would activate {}", profile.path.display());
        Ok(name)
    }

    fn stop(&self, connection_name: &str) -> Result<()> {
        if let Ok(mut active) = self.active.lock() {
            active.retain(|n| n != connection_name);
        }
        info!("Dry run: would remove {}", connection_name);
        Ok(())
    }

    fn is_active(&self, connection_name: &str) -> Result<bool> {
        Ok(self.active().iter().any(|n| n == connection_name))
    }
}
