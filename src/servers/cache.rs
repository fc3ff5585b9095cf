//! Server cache with two refresh windows
//!
//! The full list is re-fetched once the full TTL has passed (or the user's
//! tier changed); in between, only loads and scores are merged in once the
//! loads TTL has passed. If the API is unreachable, a cached copy younger
//! than the stale ceiling is served with a warning.

use crate::api::ApiSession;
use crate::error::{Error, Result};
use crate::fsutil::LockMode;
use crate::metadata::{MetadataStore, MetadataType};
use crate::servers::model::{LogicalServer, ServerCacheEnvelope};
use crate::settings::CacheSettings;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Fresh,
    RefreshedFull,
    RefreshedLoads,
    /// API unreachable; the cached list is `age` old
    RestoredFromStale { age: Duration },
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheStatus::Fresh => write!(f, "fresh"),
            CacheStatus::RefreshedFull => write!(f, "refreshed"),
            CacheStatus::RefreshedLoads => write!(f, "loads refreshed"),
            CacheStatus::RestoredFromStale { age } => {
                write!(f, "restored from stale copy ({}h old)", age.as_secs() / 3600)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Refresh {
    None,
    Loads,
    Full,
}

fn due_refresh(cached: Option<&ServerCacheEnvelope>, tier: u8, now: u64, settings: &CacheSettings) -> Refresh {
    let Some(envelope) = cached else {
        return Refresh::Full;
    };
    if envelope.logical_server_tier != tier {
        return Refresh::Full;
    }
    if now.saturating_sub(envelope.fetched_at_full) >= settings.full_expire().as_secs() {
        Refresh::Full
    } else if now.saturating_sub(envelope.fetched_at_loads) >= settings.loads_expire().as_secs() {
        Refresh::Loads
    } else {
        Refresh::None
    }
}

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug, Clone)]
pub struct ServerCache {
    store: MetadataStore,
    settings: CacheSettings,
    /// Serialises refreshes within this process; the file lock is never held across a fetch
    refresh_gate: Arc<Mutex<()>>,
}

/// Missing or unreadable cache documents both read as `None`
fn parse_envelope(read: Result<ServerCacheEnvelope>) -> Result<Option<ServerCacheEnvelope>> {
    match read {
        Ok(envelope) => Ok(Some(envelope)),
        Err(Error::FileNotFound(_)) => Ok(None),
        Err(Error::Json(e)) => {
            warn!("Discarding unreadable server cache: {}", e);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

impl ServerCache {
    pub fn new(store: MetadataStore, settings: CacheSettings) -> Self {
        Self {
            store,
            settings,
            refresh_gate: Arc::new(Mutex::new(())),
        }
    }

    /// Bring the cache up to date for `tier`, fetching as little as possible
    pub async fn cache_servers(&self, api: &ApiSession, tier: u8) -> Result<CacheStatus> {
        self.cache_servers_at(api, tier, now_secs()).await
    }

    pub(crate) async fn cache_servers_at(&self, api: &ApiSession, tier: u8, now: u64) -> Result<CacheStatus> {
        let _gate = self.refresh_gate.lock().await;
        let cached = parse_envelope(self.store.get(MetadataType::ServerCache))?;

        match due_refresh(cached.as_ref(), tier, now, &self.settings) {
            Refresh::None => Ok(CacheStatus::Fresh),
            Refresh::Full => {
                info!("Fetching full server list for tier {}", tier);
                match api.get_logicals().await {
                    Ok(servers) => {
                        let envelope = self.commit(|current| {
                            let (prev_full, prev_loads) = current
                                .map(|c| (c.fetched_at_full, c.fetched_at_loads))
                                .unwrap_or((0, 0));
                            ServerCacheEnvelope {
                                fetched_at_full: now.max(prev_full),
                                fetched_at_loads: now.max(prev_loads),
                                logical_server_tier: tier,
                                servers,
                            }
                        })?;
                        info!("Cached {} servers", envelope.servers.len());
                        Ok(CacheStatus::RefreshedFull)
                    }
                    Err(e) => self.fall_back(cached.as_ref(), now, e),
                }
            }
            Refresh::Loads => {
                info!("Refreshing server loads");
                let Some(envelope) = cached else {
                    return Err(Error::UnhandledApi("loads refresh without a cached list".to_string()));
                };
                match api.get_loads().await {
                    Ok(loads) => {
                        let mut merged = 0;
                        self.commit(|current| {
                            // another process may have rewritten the list while we fetched
                            let mut envelope = current
                                .filter(|c| c.logical_server_tier == tier)
                                .unwrap_or(envelope);
                            merged = envelope.merge_loads(&loads);
                            envelope.fetched_at_loads = now.max(envelope.fetched_at_loads);
                            envelope
                        })?;
                        info!("Merged loads for {} servers", merged);
                        Ok(CacheStatus::RefreshedLoads)
                    }
                    Err(e) => self.fall_back(Some(&envelope), now, e),
                }
            }
        }
    }

    /// Re-read the cache under an exclusive lock, let `update` build the new
    /// document from it, and write the result
    fn commit<F>(&self, update: F) -> Result<ServerCacheEnvelope>
    where
        F: FnOnce(Option<ServerCacheEnvelope>) -> ServerCacheEnvelope,
    {
        let _lock = self.store.lock(MetadataType::ServerCache, LockMode::Exclusive)?;
        let current = parse_envelope(self.store.read_unlocked(MetadataType::ServerCache))?;
        let envelope = update(current);
        self.store.write_unlocked(MetadataType::ServerCache, &envelope)?;
        Ok(envelope)
    }

    fn fall_back(&self, cached: Option<&ServerCacheEnvelope>, now: u64, error: Error) -> Result<CacheStatus> {
        let Some(envelope) = cached else {
            return Err(error);
        };
        let age = now.saturating_sub(envelope.fetched_at_full);
        if age <= self.settings.stale_ceiling().as_secs() {
            warn!("Server list refresh failed ({}), using cached copy {}s old", error, age);
            Ok(CacheStatus::RestoredFromStale {
                age: Duration::from_secs(age),
            })
        } else {
            warn!("Server list refresh failed ({}) and cache is too old", error);
            Err(Error::CacheExpired { age_secs: age })
        }
    }

    /// Current cache document, read under a shared lock
    pub fn snapshot(&self) -> Result<ServerCacheEnvelope> {
        self.store.get(MetadataType::ServerCache)
    }

    pub fn servers(&self) -> Result<Vec<LogicalServer>> {
        Ok(self.snapshot()?.servers)
    }

    pub fn clear(&self) -> Result<()> {
        self.store.remove(MetadataType::ServerCache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{HttpRequest, HttpResponse, ScriptedTransport, Transport};
    use crate::servers::fixtures::RAW_SERVER_LIST;
    use crate::settings::Settings;
    use async_trait::async_trait;
    use reqwest::Method;
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    const T0: u64 = 1_700_000_000;
    const MINUTE: u64 = 60;
    const HOUR: u64 = 3600;
    const DAY: u64 = 24 * HOUR;

    struct Harness {
        _temp_dir: TempDir,
        transport: Arc<ScriptedTransport>,
        api: ApiSession,
        cache: ServerCache,
    }

    fn harness() -> Harness {
        let temp_dir = TempDir::new().unwrap();
        let settings = Settings::ci();
        let transport = Arc::new(ScriptedTransport::new());
        let api = ApiSession::new(transport.clone(), &settings.api);
        let cache = ServerCache::new(MetadataStore::new(temp_dir.path()), settings.cache);
        Harness {
            _temp_dir: temp_dir,
            transport,
            api,
            cache,
        }
    }

    fn push_logicals(transport: &ScriptedTransport) {
        let body: Value = serde_json::from_str(RAW_SERVER_LIST).unwrap();
        transport.push(Method::GET, "/vpn/logicals", HttpResponse::new(200, body));
    }

    #[tokio::test]
    async fn test_first_fetch_is_full() {
        let h = harness();
        push_logicals(&h.transport);

        let status = h.cache.cache_servers_at(&h.api, 2, T0).await.unwrap();
        assert_eq!(status, CacheStatus::RefreshedFull);

        let snapshot = h.cache.snapshot().unwrap();
        assert_eq!(snapshot.fetched_at_full, T0);
        assert_eq!(snapshot.fetched_at_loads, T0);
        assert_eq!(snapshot.logical_server_tier, 2);
        assert_eq!(snapshot.servers.len(), 11);

        let status = h.cache.cache_servers_at(&h.api, 2, T0 + MINUTE).await.unwrap();
        assert_eq!(status, CacheStatus::Fresh);
        assert_eq!(h.transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_loads_refresh_merges_by_id() {
        let h = harness();
        push_logicals(&h.transport);
        h.cache.cache_servers_at(&h.api, 2, T0).await.unwrap();

        h.transport.push(
            Method::GET,
            "/vpn/loads",
            HttpResponse::new(
                200,
                json!({"Code": 1000, "LogicalServers": [{"ID": "srv-test-6", "Load": 90, "Score": 7.5}]}),
            ),
        );
        let status = h.cache.cache_servers_at(&h.api, 2, T0 + 16 * MINUTE).await.unwrap();
        assert_eq!(status, CacheStatus::RefreshedLoads);

        let snapshot = h.cache.snapshot().unwrap();
        assert_eq!(snapshot.fetched_at_full, T0);
        assert_eq!(snapshot.fetched_at_loads, T0 + 16 * MINUTE);
        assert_eq!(snapshot.servers.len(), 11);
        let test6 = snapshot.servers.iter().find(|s| s.name == "TEST#6").unwrap();
        assert_eq!((test6.load, test6.score), (90, 7.5));
        assert_eq!(h.transport.count(&Method::GET, "/vpn/logicals"), 1);
    }

    #[tokio::test]
    async fn test_full_refresh_after_full_ttl() {
        let h = harness();
        push_logicals(&h.transport);
        push_logicals(&h.transport);
        h.cache.cache_servers_at(&h.api, 2, T0).await.unwrap();

        let status = h.cache.cache_servers_at(&h.api, 2, T0 + 25 * HOUR).await.unwrap();
        assert_eq!(status, CacheStatus::RefreshedFull);
        assert_eq!(h.cache.snapshot().unwrap().fetched_at_full, T0 + 25 * HOUR);
    }

    #[tokio::test]
    async fn test_tier_change_forces_full_refresh() {
        let h = harness();
        push_logicals(&h.transport);
        push_logicals(&h.transport);
        h.cache.cache_servers_at(&h.api, 0, T0).await.unwrap();

        let status = h.cache.cache_servers_at(&h.api, 2, T0 + MINUTE).await.unwrap();
        assert_eq!(status, CacheStatus::RefreshedFull);
        assert_eq!(h.cache.snapshot().unwrap().logical_server_tier, 2);
    }

    #[tokio::test]
    async fn test_timestamps_never_move_backwards() {
        let h = harness();
        push_logicals(&h.transport);
        push_logicals(&h.transport);
        h.cache.cache_servers_at(&h.api, 1, T0).await.unwrap();

        h.cache.cache_servers_at(&h.api, 2, T0 - HOUR).await.unwrap();
        let snapshot = h.cache.snapshot().unwrap();
        assert_eq!(snapshot.fetched_at_full, T0);
        assert_eq!(snapshot.fetched_at_loads, T0);
    }

    #[tokio::test]
    async fn test_stale_copy_served_when_api_fails() {
        let h = harness();
        push_logicals(&h.transport);
        h.cache.cache_servers_at(&h.api, 2, T0).await.unwrap();

        let status = h.cache.cache_servers_at(&h.api, 2, T0 + 2 * DAY).await.unwrap();
        assert_eq!(
            status,
            CacheStatus::RestoredFromStale {
                age: Duration::from_secs(2 * DAY)
            }
        );
        assert_eq!(h.cache.snapshot().unwrap().fetched_at_full, T0);
    }

    #[tokio::test]
    async fn test_loads_failure_serves_cached_list() {
        let h = harness();
        push_logicals(&h.transport);
        h.cache.cache_servers_at(&h.api, 2, T0).await.unwrap();

        let status = h.cache.cache_servers_at(&h.api, 2, T0 + 20 * MINUTE).await.unwrap();
        assert!(matches!(status, CacheStatus::RestoredFromStale { .. }));
        assert_eq!(h.cache.snapshot().unwrap().fetched_at_loads, T0);
    }

    #[tokio::test]
    async fn test_cache_expired_beyond_ceiling() {
        let h = harness();
        push_logicals(&h.transport);
        h.cache.cache_servers_at(&h.api, 2, T0).await.unwrap();

        let err = h.cache.cache_servers_at(&h.api, 2, T0 + 8 * DAY).await.unwrap_err();
        assert!(matches!(err, Error::CacheExpired { age_secs } if age_secs == 8 * DAY));
    }

    #[tokio::test]
    async fn test_no_cache_and_api_failure() {
        let h = harness();
        let err = h.cache.cache_servers_at(&h.api, 2, T0).await.unwrap_err();
        assert!(matches!(err, Error::Api { code: 404, .. }));
        assert!(matches!(h.cache.snapshot(), Err(Error::FileNotFound(_))));
    }

    #[tokio::test]
    async fn test_corrupt_cache_is_refetched() {
        let h = harness();
        let path = h.cache.store.path(MetadataType::ServerCache).to_path_buf();
        std::fs::write(&path, b"{not json").unwrap();
        push_logicals(&h.transport);

        let status = h.cache.cache_servers_at(&h.api, 2, T0).await.unwrap();
        assert_eq!(status, CacheStatus::RefreshedFull);
        assert_eq!(h.cache.servers().unwrap().len(), 11);
    }

    /// Answers every request with the fixture list after a delay
    struct SlowTransport {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Transport for SlowTransport {
        async fn send(&self, _request: HttpRequest) -> Result<HttpResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(200)).await;
            let body: Value = serde_json::from_str(RAW_SERVER_LIST)?;
            Ok(HttpResponse::new(200, body))
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_concurrent_refreshes_on_one_thread() {
        let temp_dir = TempDir::new().unwrap();
        let settings = Settings::ci();
        let transport = Arc::new(SlowTransport {
            calls: AtomicUsize::new(0),
        });
        let api = ApiSession::new(transport.clone(), &settings.api);
        let cache = ServerCache::new(MetadataStore::new(temp_dir.path()), settings.cache);
        let other = cache.clone();

        let joined = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(
                cache.cache_servers_at(&api, 2, T0),
                other.cache_servers_at(&api, 2, T0)
            )
        })
        .await
        .expect("concurrent refreshes finished");

        let mut statuses = vec![joined.0.unwrap(), joined.1.unwrap()];
        statuses.sort_by_key(|s| *s == CacheStatus::Fresh);
        assert_eq!(statuses, vec![CacheStatus::RefreshedFull, CacheStatus::Fresh]);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.servers().unwrap().len(), 11);
    }

    #[tokio::test]
    async fn test_clear() {
        let h = harness();
        push_logicals(&h.transport);
        h.cache.cache_servers_at(&h.api, 2, T0).await.unwrap();
        h.cache.clear().unwrap();
        h.cache.clear().unwrap();
        assert!(h.cache.snapshot().is_err());
    }
}
