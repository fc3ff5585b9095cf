//! JSON metadata files: current connection, last connection, server cache
//!
//! Every operation re-reads the file; nothing is cached in memory, so edits
//! made by another process are visible on the next call.

use crate::constants::{CONNECTION_METADATA_FILE, LAST_CONNECTION_METADATA_FILE, SERVER_CACHE_FILE};
use crate::error::{Error, Result};
use crate::fsutil::{self, FileLock, LockMode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataAction {
    Get,
    Write,
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetadataType {
    Connection,
    LastConnection,
    ServerCache,
}

impl FromStr for MetadataAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "GET" => Ok(MetadataAction::Get),
            "WRITE" => Ok(MetadataAction::Write),
            "REMOVE" => Ok(MetadataAction::Remove),
            _ => Err(Error::IllegalMetadataAction(s.to_string())),
        }
    }
}

impl FromStr for MetadataType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "CONNECTION" => Ok(MetadataType::Connection),
            "LAST_CONNECTION" => Ok(MetadataType::LastConnection),
            "SERVER_CACHE" => Ok(MetadataType::ServerCache),
            _ => Err(Error::IllegalMetadataType(s.to_string())),
        }
    }
}

impl fmt::Display for MetadataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MetadataType::Connection => "CONNECTION",
            MetadataType::LastConnection => "LAST_CONNECTION",
            MetadataType::ServerCache => "SERVER_CACHE",
        })
    }
}

#[derive(Debug, Clone)]
pub struct MetadataStore {
    connection: PathBuf,
    last_connection: PathBuf,
    server_cache: PathBuf,
}

impl MetadataStore {
    pub fn new(cache_dir: &Path) -> Self {
        Self {
            connection: cache_dir.join(CONNECTION_METADATA_FILE),
            last_connection: cache_dir.join(LAST_CONNECTION_METADATA_FILE),
            server_cache: cache_dir.join(SERVER_CACHE_FILE),
        }
    }

    pub fn path(&self, kind: MetadataType) -> &Path {
        match kind {
            MetadataType::Connection => &self.connection,
            MetadataType::LastConnection => &self.last_connection,
            MetadataType::ServerCache => &self.server_cache,
        }
    }

    /// Dispatch an action on one metadata kind
    ///
    /// `GET` returns the document; `WRITE` requires a payload; `REMOVE` on a
    /// missing file succeeds.
    pub fn manage_metadata(
        &self,
        action: MetadataAction,
        kind: MetadataType,
        payload: Option<&Value>,
    ) -> Result<Option<Value>> {
        debug!("Metadata {:?} on {}", action, kind);
        match action {
            MetadataAction::Get => self.get::<Value>(kind).map(Some),
            MetadataAction::Write => {
                let payload = payload.ok_or_else(|| {
                    Error::IllegalData(format!("WRITE on {} without payload", kind))
                })?;
                self.write(kind, payload)?;
                Ok(None)
            }
            MetadataAction::Remove => {
                self.remove(kind)?;
                Ok(None)
            }
        }
    }

    /// String-keyed entry point for callers outside the type system
    pub fn manage_metadata_by_name(
        &self,
        action: &str,
        kind: &str,
        payload: Option<&Value>,
    ) -> Result<Option<Value>> {
        let action: MetadataAction = action.parse()?;
        let kind: MetadataType = kind.parse()?;
        self.manage_metadata(action, kind, payload)
    }

    pub fn get<T: DeserializeOwned>(&self, kind: MetadataType) -> Result<T> {
        let _lock = self.lock(kind, LockMode::Shared)?;
        self.read_unlocked(kind)
    }

    pub fn write<T: Serialize + ?Sized>(&self, kind: MetadataType, value: &T) -> Result<()> {
        let _lock = self.lock(kind, LockMode::Exclusive)?;
        self.write_unlocked(kind, value)
    }

    pub fn remove(&self, kind: MetadataType) -> Result<()> {
        let _lock = self.lock(kind, LockMode::Exclusive)?;
        self.remove_unlocked(kind)
    }

    pub fn exists(&self, kind: MetadataType) -> bool {
        self.path(kind).exists()
    }

    /// Read-modify-write under the exclusive lock; the file must already exist
    pub fn update<T, F>(&self, kind: MetadataType, f: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T),
    {
        let _lock = self.lock(kind, LockMode::Exclusive)?;
        let mut value: T = self.read_unlocked(kind)?;
        f(&mut value);
        self.write_unlocked(kind, &value)?;
        Ok(value)
    }

    pub(crate) fn lock(&self, kind: MetadataType, mode: LockMode) -> Result<FileLock> {
        fsutil::lock(self.path(kind), mode)
    }

    pub(crate) fn read_unlocked<T: DeserializeOwned>(&self, kind: MetadataType) -> Result<T> {
        fsutil::read_json(self.path(kind))
    }

    pub(crate) fn write_unlocked<T: Serialize + ?Sized>(&self, kind: MetadataType, value: &T) -> Result<()> {
        fsutil::write_json_atomic(self.path(kind), value)
    }

    pub(crate) fn remove_unlocked(&self, kind: MetadataType) -> Result<()> {
        if !fsutil::remove_if_exists(self.path(kind))? {
            debug!("{} already absent", kind);
        }
        Ok(())
    }
}
