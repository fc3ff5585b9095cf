//! Persisted connection state machine
//!
//! ```text
//! IDLE -> CONFIGURING -> STARTING -> CONNECTED -> TEARING_DOWN -> IDLE
//!              |             |
//!              +---> IDLE <--+  (failure)
//! ```
//!
//! IDLE has no CONNECTION file. Every other state lives in the CONNECTION
//! metadata file, so a restarted process picks up where the last one left
//! off. When a tunnel that was started goes back to IDLE, its metadata is
//! copied to LAST_CONNECTION before CONNECTION is removed.

use crate::error::{Error, Result};
use crate::fsutil::{FileLock, LockMode};
use crate::metadata::{MetadataStore, MetadataType};
use crate::profile::EmittedProfile;
use crate::protocol::Protocol;
use crate::servers::cache::now_secs;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Idle,
    Configuring,
    Starting,
    Connected,
    TearingDown,
}

impl ConnectionState {
    pub fn can_transition_to(&self, to: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, to),
            (Idle, Configuring)
                | (Configuring, Starting)
                | (Configuring, Idle)
                | (Starting, Connected)
                | (Starting, Idle)
                | (Connected, TearingDown)
                | (TearingDown, Idle)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Idle => "IDLE",
            ConnectionState::Configuring => "CONFIGURING",
            ConnectionState::Starting => "STARTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::TearingDown => "TEARING_DOWN",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionMetadata {
    pub state: ConnectionState,
    #[serde(default)]
    pub connected_server: Option<String>,
    #[serde(default)]
    pub connected_protocol: Option<Protocol>,
    /// Unix seconds when the tunnel came up
    #[serde(default)]
    pub connected_time: Option<u64>,
    /// Entry IP the tunnel was opened to
    #[serde(default)]
    pub connected_ip: Option<String>,
    /// Exit IP shown to the user
    #[serde(default)]
    pub display_server_ip: Option<String>,
    #[serde(default)]
    pub profile_path: Option<PathBuf>,
    /// Handle of the tunnel in the network backend
    #[serde(default)]
    pub connection_name: Option<String>,
}

impl ConnectionMetadata {
    fn new(state: ConnectionState, servername: &str, protocol: Protocol) -> Self {
        Self {
            state,
            connected_server: Some(servername.to_string()),
            connected_protocol: Some(protocol),
            connected_time: None,
            connected_ip: None,
            display_server_ip: None,
            profile_path: None,
            connection_name: None,
        }
    }
}

fn check(from: ConnectionState, to: ConnectionState) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(Error::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionManager {
    store: MetadataStore,
}

impl ConnectionManager {
    pub fn new(store: MetadataStore) -> Self {
        Self { store }
    }

    fn lock(&self) -> Result<FileLock> {
        self.store.lock(MetadataType::Connection, LockMode::Exclusive)
    }

    fn read_current(&self) -> Result<Option<ConnectionMetadata>> {
        match self.store.read_unlocked(MetadataType::Connection) {
            Ok(meta) => Ok(Some(meta)),
            Err(Error::FileNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn state(&self) -> Result<ConnectionState> {
        let _lock = self.store.lock(MetadataType::Connection, LockMode::Shared)?;
        Ok(self
            .read_current()?
            .map(|m| m.state)
            .unwrap_or(ConnectionState::Idle))
    }

    pub fn get_connection_metadata(&self) -> Result<ConnectionMetadata> {
        self.store.get(MetadataType::Connection)
    }

    pub fn get_last_connection_metadata(&self) -> Result<ConnectionMetadata> {
        self.store.get(MetadataType::LastConnection)
    }

    /// IDLE -> CONFIGURING
    pub fn begin(&self, servername: &str, protocol: Protocol) -> Result<ConnectionMetadata> {
        let _lock = self.lock()?;
        let from = self
            .read_current()?
            .map(|m| m.state)
            .unwrap_or(ConnectionState::Idle);
        check(from, ConnectionState::Configuring)?;

        let meta = ConnectionMetadata::new(ConnectionState::Configuring, servername, protocol);
        self.store.write_unlocked(MetadataType::Connection, &meta)?;
        info!("Connection {} -> {} ({} over {})", from, meta.state, servername, protocol);
        Ok(meta)
    }

    /// CONFIGURING -> STARTING once the profile is on disk
    pub fn profile_emitted(&self, profile: &EmittedProfile) -> Result<ConnectionMetadata> {
        self.advance(ConnectionState::Starting, |meta| {
            meta.connected_server = Some(profile.servername.clone());
            meta.connected_protocol = Some(profile.protocol);
            meta.connected_ip = Some(profile.entry_ip.clone());
            meta.display_server_ip = Some(profile.exit_ip.clone());
            meta.profile_path = Some(profile.path.clone());
        })
    }

    /// STARTING -> CONNECTED
    pub fn tunnel_up(&self, connection_name: &str) -> Result<ConnectionMetadata> {
        self.advance(ConnectionState::Connected, |meta| {
            meta.connection_name = Some(connection_name.to_string());
            meta.connected_time = Some(now_secs());
        })
    }

    /// CONNECTED -> TEARING_DOWN
    pub fn disconnect(&self) -> Result<ConnectionMetadata> {
        self.advance(ConnectionState::TearingDown, |_| {})
    }

    /// CONFIGURING or STARTING -> IDLE
    pub fn fail(&self) -> Result<()> {
        self.enter_idle()
    }

    /// TEARING_DOWN -> IDLE
    pub fn finish_teardown(&self) -> Result<()> {
        self.enter_idle()
    }

    fn advance<F>(&self, to: ConnectionState, f: F) -> Result<ConnectionMetadata>
    where
        F: FnOnce(&mut ConnectionMetadata),
    {
        let _lock = self.lock()?;
        let mut meta = self.read_current()?.ok_or(Error::ConnectionNotFound)?;
        let from = meta.state;
        check(from, to)?;

        meta.state = to;
        f(&mut meta);
        self.store.write_unlocked(MetadataType::Connection, &meta)?;
        info!("Connection {} -> {}", from, to);
        Ok(meta)
    }

    fn enter_idle(&self) -> Result<()> {
        let _lock = self.lock()?;
        let meta = self.read_current()?.ok_or(Error::ConnectionNotFound)?;
        check(meta.state, ConnectionState::Idle)?;

        if meta.state != ConnectionState::Configuring {
            self.store.write(MetadataType::LastConnection, &meta)?;
            debug!("Saved {} as last connection", meta.connected_server.as_deref().unwrap_or("?"));
        }
        self.store.remove_unlocked(MetadataType::Connection)?;
        info!("Connection {} -> {}", meta.state, ConnectionState::Idle);
        Ok(())
    }

    fn mutate<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut ConnectionMetadata),
    {
        self.store
            .update::<ConnectionMetadata, _>(MetadataType::Connection, f)
            .map(|_| ())
    }

    pub fn save_servername(&self, servername: &str) -> Result<()> {
        self.mutate(|m| m.connected_server = Some(servername.to_string()))
    }

    pub fn save_connected_time(&self) -> Result<()> {
        let now = now_secs();
        self.mutate(|m| m.connected_time = Some(now))
    }

    pub fn save_connected_ip(&self, ip: &str) -> Result<()> {
        self.mutate(|m| m.connected_ip = Some(ip.to_string()))
    }

    pub fn save_display_server_ip(&self, ip: &str) -> Result<()> {
        self.mutate(|m| m.display_server_ip = Some(ip.to_string()))
    }
}
