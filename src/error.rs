//! Error taxonomy shared by every component
//!
//! Components map backend errors (keyring, HTTP, filesystem) into this enum at
//! their boundary. Only the front end turns these into exit codes.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("API error {code}: {message}")]
    Api { code: i64, message: String },

    #[error("Unhandled API error: {0}")]
    UnhandledApi(String),

    #[error("Insufficient scope: {0}")]
    Api403(String),

    #[error("App version deprecated: {0}")]
    Api5002(String),

    #[error("Upgrade required: {0}")]
    Api5003(String),

    #[error("API request timed out")]
    ApiTimeout,

    #[error("Unhandled API method: {0}")]
    UnhandledApiMethod(String),

    #[error("Illegal VPN protocol: {0}")]
    IllegalVpnProtocol(String),

    #[error("Illegal virtual device: {0}")]
    IllegalVirtualDevice(String),

    #[error("No virtual device found in OpenVPN template")]
    VirtualDeviceNotFound,

    #[error("Illegal servername: {0}")]
    IllegalServername(String),

    #[error("Server not found: {0}")]
    ServerNotFound(String),

    #[error("No servers available: {0}")]
    EmptyServerList(String),

    #[error("Server cache expired and could not be refreshed ({age_secs}s old)")]
    CacheExpired { age_secs: u64 },

    #[error("No active connection")]
    ConnectionNotFound,

    #[error("Illegal metadata action: {0}")]
    IllegalMetadataAction(String),

    #[error("Illegal metadata type: {0}")]
    IllegalMetadataType(String),

    #[error("Illegal data: {0}")]
    IllegalData(String),

    #[error("Illegal value: {0}")]
    IllegalValue(String),

    #[error("Keyring error: {0}")]
    Keyring(String),

    #[error("Stored session not found for {service}/{username}")]
    StoredSessionNotFound { service: String, username: String },

    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("Invalid connection state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Network backend error: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to parse settings: {0}")]
    SettingsParse(#[from] toml::de::Error),

    #[error("Failed to serialize settings: {0}")]
    SettingsSerialize(#[from] toml::ser::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to format profile: {0}")]
    Format(#[from] std::fmt::Error),

    #[error("TLS setup failed: {0}")]
    Tls(String),
}

impl Error {
    /// Numeric API code carried by the error, if any
    pub fn api_code(&self) -> Option<i64> {
        match self {
            Error::Api { code, .. } => Some(*code),
            Error::Api403(_) => Some(403),
            Error::Api5002(_) => Some(5002),
            Error::Api5003(_) => Some(5003),
            _ => None,
        }
    }
}

impl From<keyring::Error> for Error {
    fn from(e: keyring::Error) -> Self {
        Error::Keyring(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Api {
            code: 404,
            message: "Not found".to_string(),
        };
        assert_eq!(err.to_string(), "API error 404: Not found");

        let err = Error::FileNotFound(PathBuf::from("/tmp/missing.json"));
        assert_eq!(err.to_string(), "File not found: /tmp/missing.json");

        let err = Error::StoredSessionNotFound {
            service: "ProtonVPN".to_string(),
            username: "AuthData".to_string(),
        };
        assert!(err.to_string().contains("ProtonVPN/AuthData"));

        let err: Error = std::fmt::Error.into();
        assert!(matches!(err, Error::Format(_)));
        assert!(err.to_string().starts_with("Failed to format profile"));
    }

    #[test]
    fn test_api_code() {
        let err = Error::Api {
            code: 422,
            message: String::new(),
        };
        assert_eq!(err.api_code(), Some(422));
        assert_eq!(Error::Api5002(String::new()).api_code(), Some(5002));
        assert_eq!(Error::ApiTimeout.api_code(), None);
    }
}
