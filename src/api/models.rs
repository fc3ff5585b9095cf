//! Wire models for API responses

use crate::credentials::VpnCredentials;
use crate::servers::model::{LogicalServer, ServerLoad};
use serde::Deserialize;

/// `Scope` arrives either as a space-separated string or a list
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ScopeField {
    List(Vec<String>),
    Text(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AuthResponse {
    #[serde(rename = "UID")]
    pub uid: String,
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub scope: Option<ScopeField>,
    #[serde(default)]
    pub scopes: Option<Vec<String>>,
}

impl AuthResponse {
    pub fn scopes(&self) -> Vec<String> {
        if let Some(scopes) = &self.scopes {
            return scopes.clone();
        }
        match &self.scope {
            Some(ScopeField::List(list)) => list.clone(),
            Some(ScopeField::Text(text)) => text.split_whitespace().map(String::from).collect(),
            None => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VpnInfoResponse {
    #[serde(rename = "VPN")]
    pub vpn: VpnCredentials,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LogicalsResponse {
    pub logical_servers: Vec<LogicalServer>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LoadsResponse {
    pub logical_servers: Vec<ServerLoad>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VpnSession {
    #[serde(rename = "SessionID")]
    pub session_id: String,
    #[serde(rename = "ExitIP", default)]
    pub exit_ip: Option<String>,
    #[serde(default)]
    pub protocol: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SessionsResponse {
    #[serde(default)]
    pub sessions: Vec<VpnSession>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DefaultPorts {
    #[serde(rename = "UDP", default)]
    pub udp: Vec<u16>,
    #[serde(rename = "TCP", default)]
    pub tcp: Vec<u16>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OpenVpnClientConfig {
    #[serde(default)]
    pub default_ports: DefaultPorts,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClientConfigResponse {
    #[serde(rename = "OpenVPNConfig", default)]
    pub openvpn_config: OpenVpnClientConfig,
    #[serde(rename = "HolesIPs", default)]
    pub holes_ips: Vec<String>,
    #[serde(default)]
    pub server_refresh_interval: Option<u64>,
}
