//! Application context
//!
//! [`VpnContext`] owns the credential store, user configuration, metadata
//! store, server cache and API session, and runs the end-to-end flows:
//! `cache_servers -> select -> emit -> state transition -> network`.

use crate::api::{ApiSession, ReqwestTransport, Transport};
use crate::api::models::SessionsResponse;
use crate::connection::{ConnectionManager, ConnectionMetadata, ConnectionState};
use crate::constants::{self, PROFILE_DIR, USER_CONFIG_FILE};
use crate::credentials::{CredentialStore, VpnCredentials};
use crate::error::{Error, Result};
use crate::metadata::MetadataStore;
use crate::network::{DryRunBackend, NetworkBackend, NmcliBackend};
use crate::profile::{self, EmitOptions, EmittedProfile};
use crate::protocol::Protocol;
use crate::servers::{CacheStatus, LogicalServer, ServerCache, ServerIntent, selector};
use crate::settings::Settings;
use crate::user_config::{UserConfigManager, UserConfiguration};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Result of a successful connect
#[derive(Debug, Clone)]
pub struct ConnectOutcome {
    pub profile: EmittedProfile,
    pub cache_status: CacheStatus,
    pub connection: ConnectionMetadata,
}

#[derive(Debug, Clone)]
pub struct Status {
    pub state: ConnectionState,
    pub connection: Option<ConnectionMetadata>,
    pub last_connection: Option<ConnectionMetadata>,
}

pub struct VpnContext {
    settings: Settings,
    credentials: Arc<CredentialStore>,
    user_config: UserConfigManager,
    cache: ServerCache,
    connection: ConnectionManager,
    api: ApiSession,
    network: Arc<dyn NetworkBackend>,
}

/// `Ok(None)` for a missing file or secret, otherwise the result
fn optional<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(Error::FileNotFound(_)) | Err(Error::StoredSessionNotFound { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

impl VpnContext {
    /// Assemble a context; a stored session is restored without network I/O
    pub fn new(
        settings: Settings,
        credentials: Arc<CredentialStore>,
        transport: Arc<dyn Transport>,
        network: Arc<dyn NetworkBackend>,
    ) -> Result<Self> {
        let cache_dir = settings.cache_dir();
        let metadata = MetadataStore::new(&cache_dir);

        let api = match optional(credentials.load_session())? {
            Some(session) => {
                info!("Restoring stored session");
                let dump = serde_json::to_value(session)?;
                ApiSession::load(&dump, transport, &settings.api, Some(credentials.clone()))?
            }
            None => ApiSession::new(transport, &settings.api).with_credentials(credentials.clone()),
        };

        Ok(Self {
            user_config: UserConfigManager::new(settings.config_dir().join(USER_CONFIG_FILE)),
            cache: ServerCache::new(metadata.clone(), settings.cache.clone()),
            connection: ConnectionManager::new(metadata),
            credentials,
            api,
            network,
            settings,
        })
    }

    /// Production wiring, or CI wiring when `PROTONVPN_ENV_CI=true`
    ///
    /// CI wiring still talks HTTP (without pins) but keeps secrets in memory
    /// and never touches NetworkManager, so a login lasts only as long as
    /// the process.
    pub fn from_env(mut settings: Settings) -> Result<Self> {
        if constants::is_ci() {
            info!("{} set, using in-memory secrets and dry-run networking", constants::ENV_CI);
            settings.api.pins.clear();
            let transport = Arc::new(ReqwestTransport::new(&settings.api)?);
            return Self::new(
                settings,
                Arc::new(CredentialStore::in_memory()),
                transport,
                Arc::new(DryRunBackend::new()),
            );
        }

        let transport = Arc::new(ReqwestTransport::new(&settings.api)?);
        Self::new(
            settings,
            Arc::new(CredentialStore::keyring()),
            transport,
            Arc::new(NmcliBackend::new()),
        )
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn api(&self) -> &ApiSession {
        &self.api
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    pub fn user_config(&self) -> &UserConfigManager {
        &self.user_config
    }

    pub fn cache(&self) -> &ServerCache {
        &self.cache
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn profile_dir(&self) -> PathBuf {
        self.settings.cache_dir().join(PROFILE_DIR)
    }

    /// Current configuration, defaults if none was saved yet
    pub fn load_user_config(&self) -> Result<UserConfiguration> {
        Ok(optional(self.user_config.get_user_configurations())?.unwrap_or_default())
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<VpnCredentials> {
        self.api.authenticate(username, password).await?;
        if !self.user_config.path().exists() {
            self.user_config.reset_default_configs()?;
        }
        self.credentials.load_vpn_credentials()
    }

    pub async fn logout(&self) -> Result<()> {
        if self.connection.state()? != ConnectionState::Idle {
            warn!("Logging out with an active connection; disconnect first to tear it down");
        }
        self.api.logout().await?;
        self.cache.clear()?;
        Ok(())
    }

    pub fn is_logged_in(&self) -> Result<bool> {
        Ok(optional(self.credentials.load_session())?.is_some())
    }

    pub fn vpn_credentials(&self) -> Result<VpnCredentials> {
        self.credentials.load_vpn_credentials()
    }

    pub async fn refresh_servers(&self) -> Result<CacheStatus> {
        let tier = self.vpn_credentials()?.max_tier;
        let status = self.cache.cache_servers(&self.api, tier).await?;
        if let CacheStatus::RestoredFromStale { age } = status {
            warn!("Using a server list {}s old", age.as_secs());
        }
        Ok(status)
    }

    pub async fn servers(&self) -> Result<Vec<LogicalServer>> {
        self.refresh_servers().await?;
        self.cache.servers()
    }

    pub async fn sessions(&self) -> Result<SessionsResponse> {
        self.api.get_sessions().await
    }

    /// Leftovers from a process that died mid-connect
    fn recover_stale_state(&self) -> Result<()> {
        match self.connection.state()? {
            ConnectionState::Configuring | ConnectionState::Starting => {
                warn!("Clearing connection left half-configured by a previous run");
                self.connection.fail()
            }
            ConnectionState::TearingDown => {
                warn!("Finishing teardown left by a previous run");
                self.teardown()?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub async fn connect(&self, intent: ServerIntent, protocol: Option<Protocol>) -> Result<ConnectOutcome> {
        let credentials = self.vpn_credentials()?;
        self.recover_stale_state()?;

        let cache_status = self.refresh_servers().await?;
        let servers = self.cache.servers()?;
        let user_config = self.load_user_config()?;
        let protocol = protocol.unwrap_or(user_config.default_protocol);

        let mut rng = StdRng::from_entropy();
        let servername = selector::select(&servers, &intent, credentials.max_tier, &mut rng)?
            .name
            .clone();
        info!("Connecting to {} over {}", servername, protocol);

        self.connection.begin(&servername, protocol)?;

        let options = EmitOptions {
            credentials: credentials.clone(),
            user_config,
            openvpn_template: self.settings.openvpn_template_path(),
        };
        let emitted = profile::generate_vpn_cert(
            protocol.as_str(),
            &servername,
            &servers,
            &self.profile_dir(),
            &options,
            &mut rng,
        );
        let profile = match emitted {
            Ok(profile) => profile,
            Err(e) => {
                self.connection.fail()?;
                return Err(e);
            }
        };
        self.connection.profile_emitted(&profile)?;

        let connection_name = match self.network.start(&profile, &credentials.password) {
            Ok(name) => name,
            Err(e) => {
                self.connection.fail()?;
                return Err(e);
            }
        };
        let connection = self.connection.tunnel_up(&connection_name)?;

        Ok(ConnectOutcome {
            profile,
            cache_status,
            connection,
        })
    }

    /// Tear down the current connection; returns what it was
    pub fn disconnect(&self) -> Result<ConnectionMetadata> {
        match self.connection.state()? {
            ConnectionState::Idle => Err(Error::ConnectionNotFound),
            ConnectionState::Configuring | ConnectionState::Starting => {
                let meta = self.connection.get_connection_metadata()?;
                self.connection.fail()?;
                Ok(meta)
            }
            ConnectionState::Connected => {
                self.connection.disconnect()?;
                self.teardown()
            }
            ConnectionState::TearingDown => self.teardown(),
        }
    }

    fn teardown(&self) -> Result<ConnectionMetadata> {
        let meta = self.connection.get_connection_metadata()?;
        if let Some(name) = &meta.connection_name {
            self.network.stop(name)?;
        }
        if let Some(path) = &meta.profile_path {
            crate::fsutil::remove_if_exists(path)?;
        }
        self.connection.finish_teardown()?;
        Ok(meta)
    }

    pub fn status(&self) -> Result<Status> {
        Ok(Status {
            state: self.connection.state()?,
            connection: optional(self.connection.get_connection_metadata())?,
            last_connection: optional(self.connection.get_last_connection_metadata())?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{HttpResponse, ScriptedTransport};
    use crate::credentials::{SessionCookies, SessionData};
    use crate::profile::test_support::TEMPLATE;
    use crate::servers::fixtures::RAW_SERVER_LIST;
    use reqwest::Method;
    use serde_json::Value;
    use tempfile::TempDir;

    struct Harness {
        temp_dir: TempDir,
        transport: Arc<ScriptedTransport>,
        network: Arc<DryRunBackend>,
        context: VpnContext,
    }

    fn settings(temp_dir: &TempDir) -> Settings {
        let mut settings = Settings::ci();
        settings.paths.config_dir = Some(temp_dir.path().join("config"));
        settings.paths.cache_dir = Some(temp_dir.path().join("cache"));
        let template = temp_dir.path().join("template.ovpn");
        std::fs::write(&template, TEMPLATE).unwrap();
        settings.paths.openvpn_template = Some(template);
        settings
    }

    fn logged_in_store() -> Arc<CredentialStore> {
        let store = CredentialStore::in_memory();
        store
            .store_session(&SessionData {
                uid: "uid".to_string(),
                access_token: "access".to_string(),
                refresh_token: "refresh".to_string(),
                scopes: vec!["vpn".to_string()],
                cookies: SessionCookies::default(),
            })
            .unwrap();
        store
            .store_vpn_credentials(&VpnCredentials {
                name: "vpnuser".to_string(),
                password: "vpnpass".to_string(),
                max_tier: 2,
            })
            .unwrap();
        Arc::new(store)
    }

    fn harness_with(network: Arc<DryRunBackend>) -> Harness {
        let temp_dir = TempDir::new().unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        let body: Value = serde_json::from_str(RAW_SERVER_LIST).unwrap();
        transport.push(Method::GET, "/vpn/logicals", HttpResponse::new(200, body));

        let context = VpnContext::new(
            settings(&temp_dir),
            logged_in_store(),
            transport.clone(),
            network.clone(),
        )
        .unwrap();
        Harness {
            temp_dir,
            transport,
            network,
            context,
        }
    }

    fn harness() -> Harness {
        harness_with(Arc::new(DryRunBackend::new()))
    }

    #[tokio::test]
    async fn test_restores_stored_session() {
        let h = harness();
        assert!(h.context.is_logged_in().unwrap());
        assert!(h.context.api().is_authenticated().await);
    }

    #[tokio::test]
    async fn test_connect_fastest_and_disconnect() {
        let h = harness();
        let outcome = h.context.connect(ServerIntent::Fastest, None).await.unwrap();

        assert_eq!(outcome.profile.servername, "TEST_IPV6#11");
        assert_eq!(outcome.profile.protocol, Protocol::Udp);
        assert_eq!(outcome.cache_status, CacheStatus::RefreshedFull);
        assert!(outcome.profile.path.starts_with(h.temp_dir.path().join("cache").join("profiles")));
        assert_eq!(outcome.connection.state, ConnectionState::Connected);
        assert_eq!(h.network.active(), vec!["ProtonVPN TEST_IPV6#11".to_string()]);

        let requests = h.transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].header("Authorization"), Some("Bearer access"));

        let meta = h.context.disconnect().unwrap();
        assert_eq!(meta.connected_server.as_deref(), Some("TEST_IPV6#11"));
        assert!(h.network.active().is_empty());
        assert!(!outcome.profile.path.exists());

        let status = h.context.status().unwrap();
        assert_eq!(status.state, ConnectionState::Idle);
        assert!(status.connection.is_none());
        assert_eq!(
            status.last_connection.unwrap().connected_server.as_deref(),
            Some("TEST_IPV6#11")
        );
    }

    #[tokio::test]
    async fn test_connect_uses_configured_protocol() {
        let h = harness();
        h.context.user_config().update_default_protocol(Protocol::Wireguard).unwrap();
        let outcome = h
            .context
            .connect(ServerIntent::FastestInCountry("PT".to_string()), None)
            .await
            .unwrap();
        assert_eq!(outcome.profile.servername, "TEST#6");
        assert_eq!(outcome.profile.protocol, Protocol::Wireguard);
        assert!(outcome.profile.wireguard_public_key.is_some());
    }

    #[tokio::test]
    async fn test_connect_twice_is_rejected() {
        let h = harness();
        h.context.connect(ServerIntent::Fastest, Some(Protocol::Tcp)).await.unwrap();
        let err = h
            .context
            .connect(ServerIntent::Fastest, Some(Protocol::Tcp))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
    }

    #[tokio::test]
    async fn test_backend_failure_returns_to_idle() {
        let h = harness_with(Arc::new(DryRunBackend::failing()));
        let err = h.context.connect(ServerIntent::Fastest, None).await.unwrap_err();
        assert!(matches!(err, Error::Backend(_)));

        let status = h.context.status().unwrap();
        assert_eq!(status.state, ConnectionState::Idle);
        assert_eq!(
            status.last_connection.unwrap().state,
            ConnectionState::Starting
        );
    }

    #[tokio::test]
    async fn test_selection_failure_leaves_state_untouched() {
        let h = harness();
        let err = h
            .context
            .connect(ServerIntent::Name("XX#404".to_string()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ServerNotFound(_)));
        assert_eq!(h.context.status().unwrap().state, ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_stale_configuring_state_is_recovered() {
        let h = harness();
        h.context.connection().begin("TEST#5", Protocol::Udp).unwrap();

        let outcome = h.context.connect(ServerIntent::Fastest, None).await.unwrap();
        assert_eq!(outcome.connection.state, ConnectionState::Connected);
    }

    #[test]
    fn test_disconnect_without_connection() {
        let h = harness();
        assert!(matches!(h.context.disconnect(), Err(Error::ConnectionNotFound)));
    }

    #[tokio::test]
    async fn test_logout_clears_everything() {
        let h = harness();
        h.context.refresh_servers().await.unwrap();
        h.transport.push(Method::DELETE, "/auth", HttpResponse::new(200, serde_json::json!({"Code": 1000})));

        h.context.logout().await.unwrap();
        assert!(!h.context.is_logged_in().unwrap());
        assert!(h.context.cache().snapshot().is_err());
        assert!(matches!(
            h.context.vpn_credentials(),
            Err(Error::StoredSessionNotFound { .. })
        ));
    }

    #[test]
    fn test_user_config_defaults_when_missing() {
        let h = harness();
        assert_eq!(h.context.load_user_config().unwrap(), UserConfiguration::default());
    }
}
