//! Well-known names, endpoints and defaults

use std::time::Duration;

pub const APP_DIR: &str = "protonvpn";

pub const USER_CONFIG_FILE: &str = "user_configurations.json";
pub const CONNECTION_METADATA_FILE: &str = "connection_metadata.json";
pub const LAST_CONNECTION_METADATA_FILE: &str = "last_connection_metadata.json";
pub const SERVER_CACHE_FILE: &str = "servers.json";
pub const SETTINGS_FILE: &str = "protonvpn.toml";
pub const OPENVPN_TEMPLATE_FILE: &str = "openvpn_template.ovpn";
pub const PROFILE_DIR: &str = "profiles";

pub const API_URL: &str = "https://api.protonvpn.ch";
pub const APP_VERSION: &str = concat!("LinuxVPN_", env!("CARGO_PKG_VERSION"));
pub const USER_AGENT: &str = concat!("ProtonVPN/", env!("CARGO_PKG_VERSION"), " (Linux)");
pub const REFRESH_REDIRECT_URI: &str = "http://protonmail.ch";

pub const AUTH_ENDPOINT: &str = "/auth";
pub const REFRESH_ENDPOINT: &str = "/auth/refresh";
pub const VPN_ENDPOINT: &str = "/vpn";
pub const LOGICALS_ENDPOINT: &str = "/vpn/logicals";
pub const LOADS_ENDPOINT: &str = "/vpn/loads";
pub const SESSIONS_ENDPOINT: &str = "/vpn/sessions";
pub const CLIENT_CONFIG_ENDPOINT: &str = "/vpn/clientconfig";

pub const KEYRING_SERVICE: &str = "ProtonVPN";
pub const KEYRING_SESSION_DATA: &str = "AuthData";
pub const KEYRING_USER_DATA: &str = "UserData";
pub const KEYRING_PROTON_USER: &str = "ProtonUser";

pub const FULL_CACHE_TIME_EXPIRE: Duration = Duration::from_secs(24 * 60 * 60);
pub const LOADS_CACHE_TIME_EXPIRE: Duration = Duration::from_secs(15 * 60);
pub const STALE_CACHE_CEILING: Duration = Duration::from_secs(7 * 24 * 60 * 60);

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const RETRY_AFTER_CAP: Duration = Duration::from_secs(60);
pub const UNAVAILABLE_BACKOFF: Duration = Duration::from_secs(1);

pub const OPENVPN_UDP_PORTS: &[u16] = &[80, 443, 4569, 1194, 5060];
pub const OPENVPN_TCP_PORTS: &[u16] = &[443, 5995, 8443];
pub const WIREGUARD_PORT: u16 = 51820;
pub const WIREGUARD_ADDRESS: &str = "10.2.0.2/32";
pub const WIREGUARD_DNS: &str = "10.2.0.1";

pub const ENV_CI: &str = "PROTONVPN_ENV_CI";

/// SPKI pins for the API hosts (base64 SHA-256)
pub const API_PINS: &[&str] = &[
    "IEwk65VSaxv3s1/88vF/rM8PauJoIun3rzVCX5mLS3M=",
    "drtmcR2kFkM8qJClsuWgUzxgBkePfRCkRpqUesyDmeE=",
    "YRGlaY0jyJ4Jw2/4M8FIftwbDIQfh8Sdro96CeEel54=",
    "AfMENBVvOS8MnISprtvyPsjKlPooqh8nMB/pvCrpJpw=",
];

/// True when running against CI fixtures instead of the OS keyring
pub fn is_ci() -> bool {
    std::env::var(ENV_CI)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}
