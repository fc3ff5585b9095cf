//! ProtonVPN - session and server control plane
//!
//! Authenticates against the VPN API, keeps a cached and scored server list,
//! picks a server for the user's intent, writes an OpenVPN, StrongSwan or
//! WireGuard profile for it and tracks the resulting connection across
//! process restarts.
//!
//! # Architecture
//!
//! - `api`: authenticated API session (token refresh, retries, pinning)
//! - `credentials`: secret storage (OS keyring or in-memory)
//! - `user_config`, `settings`: user preferences (JSON) and app settings (TOML)
//! - `metadata`: locked, atomic JSON metadata files
//! - `servers`: server model, two-TTL cache and selection
//! - `profile`: `.ovpn` / `.sswan` / `.conf` emitters
//! - `connection`: persisted connection state machine
//! - `network`: hand-off to NetworkManager
//! - `context`: owns all of the above and runs connect/disconnect
//!
//! # Usage
//!
//! ```bash
//! protonvpn login USERNAME
//! protonvpn connect --cc CH
//! protonvpn disconnect
//! ```

pub mod api;
pub mod connection;
pub mod constants;
pub mod context;
pub mod country;
pub mod credentials;
pub mod error;
pub mod fsutil;
pub mod metadata;
pub mod network;
pub mod profile;
pub mod protocol;
pub mod servers;
pub mod settings;
pub mod user_config;

pub use context::VpnContext;
pub use error::{Error, Result};
pub use protocol::Protocol;
pub use servers::ServerIntent;
pub use settings::Settings;
