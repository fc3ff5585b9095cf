//! StrongSwan `.sswan` profile (JSON, as imported by the strongSwan app)

use crate::error::Result;
use crate::profile::ProfileTarget;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Serialize)]
struct SswanRemote<'a> {
    addr: &'a str,
    id: &'a str,
}

#[derive(Debug, Serialize)]
struct SswanLocal<'a> {
    eap_id: &'a str,
}

#[derive(Debug, Serialize)]
struct SswanProfile<'a> {
    uuid: String,
    name: String,
    #[serde(rename = "type")]
    kind: &'static str,
    remote: SswanRemote<'a>,
    local: SswanLocal<'a>,
}

pub fn render(target: &ProfileTarget, username: &str) -> Result<String> {
    let profile = SswanProfile {
        uuid: Uuid::new_v4().to_string(),
        name: format!("ProtonVPN {}", target.servername),
        kind: "ikev2-eap",
        remote: SswanRemote {
            addr: &target.entry_ip,
            id: &target.domain,
        },
        local: SswanLocal { eap_id: username },
    };
    Ok(serde_json::to_string_pretty(&profile)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_render() {
        let target = ProfileTarget {
            servername: "CH-FI#8".to_string(),
            domain: "node-ch-fi-08.protonvpn.test".to_string(),
            entry_ip: "10.1.1.8".to_string(),
            exit_ip: "10.1.1.9".to_string(),
            label: None,
            x25519_public_key: None,
        };
        let rendered = render(&target, "vpnuser+f2").unwrap();
        let value: Value = serde_json::from_str(&rendered).unwrap();

        assert_eq!(value["type"], "ikev2-eap");
        assert_eq!(value["name"], "ProtonVPN CH-FI#8");
        assert_eq!(value["remote"]["addr"], "10.1.1.8");
        assert_eq!(value["remote"]["id"], "node-ch-fi-08.protonvpn.test");
        assert_eq!(value["local"]["eap_id"], "vpnuser+f2");
        assert!(Uuid::parse_str(value["uuid"].as_str().unwrap()).is_ok());
    }
}
