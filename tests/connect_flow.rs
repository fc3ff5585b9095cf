//! End-to-end flows through `VpnContext` with scripted HTTP and dry-run networking

use protonvpn::api::{HttpResponse, ScriptedTransport};
use protonvpn::connection::ConnectionState;
use protonvpn::credentials::CredentialStore;
use protonvpn::network::DryRunBackend;
use protonvpn::servers::{CacheStatus, Feature};
use protonvpn::{Error, Protocol, ServerIntent, Settings, VpnContext};
use reqwest::Method;
use serde_json::{Value, json};
use std::sync::Arc;
use tempfile::TempDir;

const RAW_SERVER_LIST: &str = include_str!("fixtures/raw_server_list.json");

const TEMPLATE: &str = "client\n\
dev tun\n\
remote-cert-tls server\n\
<ca>\n\
-----BEGIN CERTIFICATE-----\n\
FLOWCA\n\
-----END CERTIFICATE-----\n\
</ca>\n\
key-direction 1\n\
<tls-auth>\n\
-----BEGIN OpenVPN Static key V1-----\n\
FLOWKEY\n\
-----END OpenVPN Static key V1-----\n\
</tls-auth>\n";

struct Setup {
    temp_dir: TempDir,
    transport: Arc<ScriptedTransport>,
    network: Arc<DryRunBackend>,
    context: VpnContext,
}

fn setup() -> Setup {
    setup_with(Arc::new(DryRunBackend::new()))
}

fn setup_with(network: Arc<DryRunBackend>) -> Setup {
    let temp_dir = TempDir::new().unwrap();
    let template = temp_dir.path().join("template.ovpn");
    std::fs::write(&template, TEMPLATE).unwrap();

    let mut settings = Settings::ci();
    settings.paths.config_dir = Some(temp_dir.path().join("config"));
    settings.paths.cache_dir = Some(temp_dir.path().join("cache"));
    settings.paths.openvpn_template = Some(template);

    let transport = Arc::new(ScriptedTransport::new());
    let context = VpnContext::new(
        settings,
        Arc::new(CredentialStore::in_memory()),
        transport.clone(),
        network.clone(),
    )
    .unwrap();

    Setup {
        temp_dir,
        transport,
        network,
        context,
    }
}

fn logicals() -> HttpResponse {
    let body: Value = serde_json::from_str(RAW_SERVER_LIST).unwrap();
    HttpResponse::new(200, body)
}

async fn login(setup: &Setup, max_tier: u8) {
    setup.transport.push(
        Method::POST,
        "/auth",
        HttpResponse::new(
            200,
            json!({
                "Code": 1000,
                "UID": "uid-flow",
                "AccessToken": "flow-access",
                "RefreshToken": "flow-refresh",
                "Scope": "full self vpn"
            }),
        )
        .with_header("Set-Cookie", "Session-Id=flow; Path=/"),
    );
    setup.transport.push(
        Method::GET,
        "/vpn",
        HttpResponse::new(
            200,
            json!({"Code": 1000, "VPN": {"Name": "flowuser", "Password": "flowpass", "MaxTier": max_tier}}),
        ),
    );
    let credentials = setup.context.login("alice", "secret").await.unwrap();
    assert_eq!(credentials.max_tier, max_tier);
}

#[tokio::test]
async fn test_login_connect_disconnect_logout() {
    let setup = setup();
    assert!(!setup.context.is_logged_in().unwrap());

    login(&setup, 2).await;
    assert!(setup.context.is_logged_in().unwrap());
    assert!(setup.context.user_config().path().exists());

    setup.transport.push(Method::GET, "/vpn/logicals", logicals());
    let outcome = setup
        .context
        .connect(ServerIntent::FastestInCountry("pt".to_string()), Some(Protocol::Tcp))
        .await
        .unwrap();

    assert_eq!(outcome.profile.servername, "TEST#6");
    assert_eq!(outcome.cache_status, CacheStatus::RefreshedFull);
    assert_eq!(outcome.profile.username, "flowuser");

    let ovpn = std::fs::read_to_string(&outcome.profile.path).unwrap();
    assert!(ovpn.contains("proto tcp"));
    assert!(ovpn.contains("FLOWCA"));
    assert!(ovpn.contains("FLOWKEY"));

    let status = setup.context.status().unwrap();
    assert_eq!(status.state, ConnectionState::Connected);
    let meta = status.connection.unwrap();
    assert_eq!(meta.connected_protocol, Some(Protocol::Tcp));
    assert!(meta.connected_time.is_some());

    setup.context.disconnect().unwrap();
    assert!(setup.network.active().is_empty());
    assert!(matches!(setup.context.disconnect(), Err(Error::ConnectionNotFound)));

    setup
        .transport
        .push(Method::DELETE, "/auth", HttpResponse::new(200, json!({"Code": 1000})));
    setup.context.logout().await.unwrap();
    assert!(!setup.context.is_logged_in().unwrap());
    assert!(matches!(
        setup.context.vpn_credentials(),
        Err(Error::StoredSessionNotFound { .. })
    ));
    assert!(!setup.temp_dir.path().join("cache").join("servers.json").exists());
}

#[tokio::test]
async fn test_connect_without_login() {
    let setup = setup();
    let err = setup.context.connect(ServerIntent::Fastest, None).await.unwrap_err();
    assert!(matches!(err, Error::StoredSessionNotFound { .. }));
    assert!(setup.transport.requests().is_empty());
    assert_eq!(setup.context.status().unwrap().state, ConnectionState::Idle);
}

#[tokio::test]
async fn test_expired_token_is_refreshed_during_connect() {
    let setup = setup();
    login(&setup, 2).await;

    setup.transport.push(
        Method::GET,
        "/vpn/logicals",
        HttpResponse::new(401, json!({"Code": 401, "Error": "Invalid access token"})),
    );
    setup.transport.push(
        Method::POST,
        "/auth/refresh",
        HttpResponse::new(
            200,
            json!({"Code": 1000, "AccessToken": "fresh-access", "RefreshToken": "fresh-refresh"}),
        ),
    );
    setup.transport.push(Method::GET, "/vpn/logicals", logicals());

    let outcome = setup
        .context
        .connect(ServerIntent::Feature(Feature::P2p), Some(Protocol::Udp))
        .await
        .unwrap();
    assert_eq!(outcome.profile.servername, "TEST_P2P#9");

    assert_eq!(setup.transport.count(&Method::POST, "/auth/refresh"), 1);
    let replay = setup.transport.requests().pop().unwrap();
    assert_eq!(replay.header("Authorization"), Some("Bearer fresh-access"));
    assert_eq!(
        setup.context.credentials().load_session().unwrap().access_token,
        "fresh-access"
    );
}

#[tokio::test]
async fn test_free_tier_cannot_reach_paid_server() {
    let setup = setup();
    login(&setup, 0).await;

    setup.transport.push(Method::GET, "/vpn/logicals", logicals());
    let err = setup
        .context
        .connect(ServerIntent::Name("TEST#6".to_string()), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ServerNotFound(_)));
    assert_eq!(setup.context.status().unwrap().state, ConnectionState::Idle);

    let outcome = setup.context.connect(ServerIntent::Fastest, None).await.unwrap();
    assert_eq!(outcome.profile.servername, "TEST#1");
    assert_eq!(outcome.cache_status, CacheStatus::Fresh);
}

#[tokio::test]
async fn test_backend_failure_rolls_back() {
    let setup = setup_with(Arc::new(DryRunBackend::failing()));
    login(&setup, 2).await;

    setup.transport.push(Method::GET, "/vpn/logicals", logicals());
    let err = setup.context.connect(ServerIntent::Fastest, None).await.unwrap_err();
    assert!(matches!(err, Error::Backend(_)));

    let status = setup.context.status().unwrap();
    assert_eq!(status.state, ConnectionState::Idle);
    assert!(status.connection.is_none());
    assert_eq!(
        status.last_connection.unwrap().connected_server.as_deref(),
        Some("TEST_IPV6#11")
    );
}

#[tokio::test]
async fn test_in_memory_secrets_do_not_outlive_the_context() {
    let setup = setup();
    login(&setup, 2).await;

    let next_run = VpnContext::new(
        setup.context.settings().clone(),
        Arc::new(CredentialStore::in_memory()),
        Arc::new(ScriptedTransport::new()),
        Arc::new(DryRunBackend::new()),
    )
    .unwrap();
    assert!(!next_run.is_logged_in().unwrap());
    assert!(next_run.user_config().path().exists());

    let err = next_run.connect(ServerIntent::Fastest, None).await.unwrap_err();
    assert!(matches!(err, Error::StoredSessionNotFound { .. }));
}
