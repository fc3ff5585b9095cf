//! Authenticated API session
//!
//! Wraps the transport with the provider's error taxonomy:
//!
//! | Code | Handling |
//! |------|----------|
//! | 1000, 1001, 200 | success |
//! | 401 | refresh tokens, replay once |
//! | 403 | `Api403`, not retried |
//! | 429 | sleep `Retry-After` (capped), retry once |
//! | 503 | short backoff, retry once |
//! | 5002 / 5003 | `Api5002` / `Api5003` |
//! | 400, 404, 409, 422, 500, 501, 502, 504 | `Api { code }` |
//! | anything else | `UnhandledApi` |
//!
//! Token refresh is serialized: a request that hits 401 after another
//! request already rotated the tokens replays with the new tokens instead of
//! refreshing again.

use crate::api::models::{
    AuthResponse, ClientConfigResponse, LoadsResponse, LogicalsResponse, SessionsResponse,
    VpnInfoResponse,
};
use crate::api::transport::{HttpRequest, HttpResponse, Transport};
use crate::constants::{
    AUTH_ENDPOINT, CLIENT_CONFIG_ENDPOINT, LOADS_ENDPOINT, LOGICALS_ENDPOINT, REFRESH_ENDPOINT,
    REFRESH_REDIRECT_URI, SESSIONS_ENDPOINT, VPN_ENDPOINT,
};
use crate::credentials::{CredentialStore, SessionCookies, SessionData, VpnCredentials};
use crate::error::{Error, Result};
use crate::servers::model::{LogicalServer, ServerLoad};
use crate::settings::ApiSettings;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

const KNOWN_ERROR_CODES: &[i64] = &[400, 404, 409, 422, 500, 501, 502, 504];

/// Operations a front end may dispatch by name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiMethod {
    ApiRequest,
    Authenticate,
    Logout,
}

impl FromStr for ApiMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "api_request" => Ok(ApiMethod::ApiRequest),
            "authenticate" => Ok(ApiMethod::Authenticate),
            "logout" => Ok(ApiMethod::Logout),
            _ => Err(Error::UnhandledApiMethod(s.to_string())),
        }
    }
}

/// A method together with its arguments
#[derive(Debug, Clone)]
pub enum ApiCall {
    ApiRequest {
        endpoint: String,
        json: Option<Value>,
        headers: HashMap<String, String>,
        method: Method,
    },
    Authenticate {
        username: String,
        password: String,
    },
    Logout,
}

impl ApiCall {
    pub fn method(&self) -> ApiMethod {
        match self {
            ApiCall::ApiRequest { .. } => ApiMethod::ApiRequest,
            ApiCall::Authenticate { .. } => ApiMethod::Authenticate,
            ApiCall::Logout => ApiMethod::Logout,
        }
    }

    /// Build a call from a method name and a JSON argument object
    pub fn parse(method: &str, args: &Value) -> Result<Self> {
        let str_arg = |key: &str| -> Result<String> {
            args.get(key)
                .and_then(Value::as_str)
                .map(String::from)
                .ok_or_else(|| Error::IllegalData(format!("missing argument {:?}", key)))
        };

        match method.parse::<ApiMethod>()? {
            ApiMethod::ApiRequest => {
                let http_method = match args.get("method").and_then(Value::as_str) {
                    Some(m) => Method::from_bytes(m.to_uppercase().as_bytes())
                        .map_err(|_| Error::IllegalData(format!("bad HTTP method {:?}", m)))?,
                    None => Method::GET,
                };
                let headers = args
                    .get("headers")
                    .and_then(Value::as_object)
                    .map(|h| {
                        h.iter()
                            .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(ApiCall::ApiRequest {
                    endpoint: str_arg("endpoint")?,
                    json: args.get("json").filter(|v| !v.is_null()).cloned(),
                    headers,
                    method: http_method,
                })
            }
            ApiMethod::Authenticate => Ok(ApiCall::Authenticate {
                username: str_arg("username")?,
                password: str_arg("password")?,
            }),
            ApiMethod::Logout => Ok(ApiCall::Logout),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub retry_after_cap: Duration,
    pub unavailable_backoff: Duration,
}

impl From<&ApiSettings> for RetryPolicy {
    fn from(settings: &ApiSettings) -> Self {
        Self {
            retry_after_cap: settings.retry_after_cap(),
            unavailable_backoff: settings.unavailable_backoff(),
        }
    }
}

/// How a response should be handled
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ResponseKind {
    Success,
    TokenExpired,
    Forbidden,
    RateLimited,
    Unavailable,
    Deprecated,
    UpgradeRequired,
    Known(i64),
    Unhandled(String),
}

/// Classify a response by transport status and body `Code`
///
/// 401/403/429/503 at the HTTP level win over the body; otherwise the body
/// `Code` decides, falling back to the HTTP status when absent.
pub(crate) fn classify(response: &HttpResponse) -> ResponseKind {
    let status = response.status as i64;
    let code = if matches!(status, 401 | 403 | 429 | 503) {
        status
    } else {
        match response.body.get("Code") {
            Some(Value::Number(n)) => match n.as_i64() {
                Some(code) => code,
                None => return ResponseKind::Unhandled(format!("non-integer code {}", n)),
            },
            Some(other) => return ResponseKind::Unhandled(format!("non-numeric code {}", other)),
            None if (200..300).contains(&status) => return ResponseKind::Success,
            None => status,
        }
    };

    match code {
        1000 | 1001 | 200 if (200..300).contains(&status) => ResponseKind::Success,
        401 => ResponseKind::TokenExpired,
        403 => ResponseKind::Forbidden,
        429 => ResponseKind::RateLimited,
        503 => ResponseKind::Unavailable,
        5002 => ResponseKind::Deprecated,
        5003 => ResponseKind::UpgradeRequired,
        c if KNOWN_ERROR_CODES.contains(&c) => ResponseKind::Known(c),
        c => ResponseKind::Unhandled(format!("unrecognized code {} (HTTP {})", c, status)),
    }
}

fn error_message(response: &HttpResponse) -> String {
    response
        .body
        .get("Error")
        .and_then(Value::as_str)
        .map(String::from)
        .unwrap_or_else(|| format!("HTTP {}", response.status))
}

impl ResponseKind {
    fn into_error(self, response: &HttpResponse) -> Error {
        let message = error_message(response);
        match self {
            ResponseKind::Success => Error::UnhandledApi("success treated as error".to_string()),
            ResponseKind::TokenExpired => Error::Api { code: 401, message },
            ResponseKind::RateLimited => Error::Api { code: 429, message },
            ResponseKind::Unavailable => Error::Api { code: 503, message },
            ResponseKind::Forbidden => Error::Api403(message),
            ResponseKind::Deprecated => Error::Api5002(message),
            ResponseKind::UpgradeRequired => Error::Api5003(message),
            ResponseKind::Known(code) => Error::Api { code, message },
            ResponseKind::Unhandled(detail) => Error::UnhandledApi(format!("{}: {}", detail, message)),
        }
    }
}

/// Result of a retried request: success or terminal error, no more retries
fn finish(response: HttpResponse) -> Result<HttpResponse> {
    match classify(&response) {
        ResponseKind::Success => Ok(response),
        kind => Err(kind.into_error(&response)),
    }
}

/// `Retry-After` in (possibly fractional) seconds, capped
fn retry_after(response: &HttpResponse, cap: Duration, fallback: Duration) -> Duration {
    response
        .header("retry-after")
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(|secs| Duration::from_secs_f64(secs).min(cap))
        .unwrap_or(fallback)
}

fn decode<T: DeserializeOwned>(value: Value, what: &str) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| Error::UnhandledApi(format!("malformed {} response: {}", what, e)))
}

fn session_cookie(response: &HttpResponse) -> Option<String> {
    let cookie = response.header("set-cookie")?;
    cookie
        .split(';')
        .filter_map(|part| part.trim().split_once('='))
        .find(|(k, _)| k.eq_ignore_ascii_case("Session-Id"))
        .map(|(_, v)| v.to_string())
}

struct PreparedRequest {
    method: Method,
    endpoint: String,
    json: Option<Value>,
    headers: HashMap<String, String>,
}

impl PreparedRequest {
    fn new(method: Method, endpoint: &str) -> Self {
        Self {
            method,
            endpoint: endpoint.to_string(),
            json: None,
            headers: HashMap::new(),
        }
    }

    fn json(mut self, body: Value) -> Self {
        self.json = Some(body);
        self
    }
}

pub struct ApiSession {
    transport: Arc<dyn Transport>,
    base_url: String,
    app_version: String,
    retry: RetryPolicy,
    tokens: RwLock<Option<SessionData>>,
    refresh_gate: Mutex<()>,
    credentials: Option<Arc<CredentialStore>>,
}

impl ApiSession {
    pub fn new(transport: Arc<dyn Transport>, settings: &ApiSettings) -> Self {
        Self {
            transport,
            base_url: settings.url.trim_end_matches('/').to_string(),
            app_version: settings.app_version.clone(),
            retry: RetryPolicy::from(settings),
            tokens: RwLock::new(None),
            refresh_gate: Mutex::new(()),
            credentials: None,
        }
    }

    /// Persist tokens and VPN credentials into `store` after login and refresh
    pub fn with_credentials(mut self, store: Arc<CredentialStore>) -> Self {
        self.credentials = Some(store);
        self
    }

    /// Rebuild a session from a [`dump`](Self::dump) without network I/O
    pub fn load(
        dump: &Value,
        transport: Arc<dyn Transport>,
        settings: &ApiSettings,
        credentials: Option<Arc<CredentialStore>>,
    ) -> Result<Self> {
        let session: SessionData = serde_json::from_value(dump.clone())
            .map_err(|e| Error::IllegalData(format!("invalid session dump: {}", e)))?;
        let mut api = Self::new(transport, settings);
        api.tokens = RwLock::new(Some(session));
        api.credentials = credentials;
        Ok(api)
    }

    pub async fn dump(&self) -> Result<Value> {
        let tokens = self.tokens.read().await;
        let session = tokens
            .as_ref()
            .ok_or_else(|| Error::IllegalData("no authenticated session".to_string()))?;
        Ok(serde_json::to_value(session)?)
    }

    pub async fn session_data(&self) -> Option<SessionData> {
        self.tokens.read().await.clone()
    }

    pub async fn is_authenticated(&self) -> bool {
        self.tokens.read().await.is_some()
    }

    /// Dispatch a call by its method
    pub async fn call(&self, call: ApiCall) -> Result<Value> {
        debug!("Dispatching {:?}", call.method());
        match call {
            ApiCall::ApiRequest {
                endpoint,
                json,
                headers,
                method,
            } => self.api_request(&endpoint, json.as_ref(), &headers, method).await,
            ApiCall::Authenticate { username, password } => {
                let session = self.authenticate(&username, &password).await?;
                Ok(serde_json::to_value(session)?)
            }
            ApiCall::Logout => {
                self.logout().await?;
                Ok(Value::Null)
            }
        }
    }

    /// Log in, then fetch and store VPN credentials
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<SessionData> {
        info!("Authenticating as {}", username);
        let request = PreparedRequest::new(Method::POST, AUTH_ENDPOINT)
            .json(json!({"Username": username, "Password": password}));
        let response = self.execute(&request, false).await?;

        let cookie = session_cookie(&response);
        let auth: AuthResponse = decode(response.body, "auth")?;
        let session = SessionData {
            uid: auth.uid.clone(),
            access_token: auth.access_token.clone(),
            refresh_token: auth.refresh_token.clone(),
            scopes: auth.scopes(),
            cookies: SessionCookies {
                session_id: cookie,
                version: None,
            },
        };
        let previous = self.tokens.write().await.replace(session.clone());

        let vpn = match self.get_vpn_credentials().await {
            Ok(vpn) => vpn,
            Err(e) => {
                *self.tokens.write().await = previous;
                return Err(e);
            }
        };
        if let Some(store) = &self.credentials {
            store.store_session(&session)?;
            store.store_vpn_credentials(&vpn)?;
            store.store_proton_username(username)?;
        }
        info!("Authenticated, VPN tier {}", vpn.max_tier);
        Ok(session)
    }

    /// Revoke the session server-side (best effort) and drop stored secrets
    pub async fn logout(&self) -> Result<()> {
        if self.is_authenticated().await {
            let request = PreparedRequest::new(Method::DELETE, AUTH_ENDPOINT);
            if let Err(e) = self.execute(&request, false).await {
                warn!("Logout request failed: {}", e);
            }
        }
        *self.tokens.write().await = None;
        if let Some(store) = &self.credentials {
            store.clear()?;
        }
        info!("Logged out");
        Ok(())
    }

    pub async fn api_request(
        &self,
        endpoint: &str,
        json: Option<&Value>,
        headers: &HashMap<String, String>,
        method: Method,
    ) -> Result<Value> {
        let request = PreparedRequest {
            method,
            endpoint: endpoint.to_string(),
            json: json.cloned(),
            headers: headers.clone(),
        };
        Ok(self.execute(&request, true).await?.body)
    }

    pub async fn get(&self, endpoint: &str) -> Result<Value> {
        self.api_request(endpoint, None, &HashMap::new(), Method::GET)
            .await
    }

    pub async fn get_vpn_credentials(&self) -> Result<VpnCredentials> {
        let info: VpnInfoResponse = decode(self.get(VPN_ENDPOINT).await?, "vpn")?;
        Ok(info.vpn)
    }

    /// Re-poll `/vpn` and store the result
    pub async fn refresh_vpn_credentials(&self) -> Result<VpnCredentials> {
        let vpn = self.get_vpn_credentials().await?;
        if let Some(store) = &self.credentials {
            store.store_vpn_credentials(&vpn)?;
        }
        Ok(vpn)
    }

    pub async fn get_logicals(&self) -> Result<Vec<LogicalServer>> {
        let logicals: LogicalsResponse = decode(self.get(LOGICALS_ENDPOINT).await?, "logicals")?;
        Ok(logicals.logical_servers)
    }

    pub async fn get_loads(&self) -> Result<Vec<ServerLoad>> {
        let loads: LoadsResponse = decode(self.get(LOADS_ENDPOINT).await?, "loads")?;
        Ok(loads.logical_servers)
    }

    pub async fn get_sessions(&self) -> Result<SessionsResponse> {
        decode(self.get(SESSIONS_ENDPOINT).await?, "sessions")
    }

    pub async fn get_client_config(&self) -> Result<ClientConfigResponse> {
        decode(self.get(CLIENT_CONFIG_ENDPOINT).await?, "clientconfig")
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_url, endpoint)
    }

    fn base_headers(&self) -> Vec<(String, String)> {
        vec![
            ("x-pm-appversion".to_string(), self.app_version.clone()),
            (
                "Accept".to_string(),
                "application/vnd.protonmail.v1+json".to_string(),
            ),
        ]
    }

    fn build(&self, request: &PreparedRequest, session: Option<&SessionData>) -> HttpRequest {
        let mut headers = self.base_headers();
        if let Some(session) = session {
            headers.push(("x-pm-uid".to_string(), session.uid.clone()));
            headers.push((
                "Authorization".to_string(),
                format!("Bearer {}", session.access_token),
            ));
        }
        headers.extend(request.headers.iter().map(|(k, v)| (k.clone(), v.clone())));

        HttpRequest {
            method: request.method.clone(),
            url: self.url(&request.endpoint),
            headers,
            body: request.json.clone(),
        }
    }

    /// One exchange with the current tokens; a timeout is retried once.
    /// Returns the access token the request was sent with.
    async fn send(&self, request: &PreparedRequest) -> Result<(Option<String>, HttpResponse)> {
        let session = self.tokens.read().await.clone();
        let http = self.build(request, session.as_ref());
        let token = session.map(|s| s.access_token);

        match self.transport.send(http.clone()).await {
            Err(Error::ApiTimeout) => {
                warn!("{} {} timed out, retrying once", request.method, request.endpoint);
                let response = self.transport.send(http).await?;
                Ok((token, response))
            }
            other => other.map(|response| (token, response)),
        }
    }

    async fn execute(&self, request: &PreparedRequest, allow_refresh: bool) -> Result<HttpResponse> {
        let (token, response) = self.send(request).await?;

        match classify(&response) {
            ResponseKind::Success => Ok(response),
            ResponseKind::TokenExpired if allow_refresh => {
                info!("Access token expired on {}, refreshing", request.endpoint);
                self.refresh(token.as_deref()).await?;
                let (_, replay) = self.send(request).await?;
                finish(replay)
            }
            ResponseKind::RateLimited => {
                let delay = retry_after(&response, self.retry.retry_after_cap, self.retry.unavailable_backoff);
                warn!("Rate limited on {}, retrying in {:?}", request.endpoint, delay);
                tokio::time::sleep(delay).await;
                let (_, retry) = self.send(request).await?;
                finish(retry)
            }
            ResponseKind::Unavailable => {
                warn!(
                    "Service unavailable on {}, retrying in {:?}",
                    request.endpoint, self.retry.unavailable_backoff
                );
                tokio::time::sleep(self.retry.unavailable_backoff).await;
                let (_, retry) = self.send(request).await?;
                finish(retry)
            }
            kind => Err(kind.into_error(&response)),
        }
    }

    /// Rotate tokens unless another request already did since `stale_token` was used
    async fn refresh(&self, stale_token: Option<&str>) -> Result<()> {
        let _gate = self.refresh_gate.lock().await;

        let current = self
            .tokens
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::UnhandledApi("no session to refresh".to_string()))?;
        if stale_token.is_some_and(|used| used != current.access_token) {
            debug!("Tokens already refreshed by a concurrent request");
            return Ok(());
        }

        let mut headers = self.base_headers();
        headers.push(("x-pm-uid".to_string(), current.uid.clone()));
        let request = HttpRequest {
            method: Method::POST,
            url: self.url(REFRESH_ENDPOINT),
            headers,
            body: Some(json!({
                "ResponseType": "token",
                "GrantType": "refresh_token",
                "RefreshToken": current.refresh_token,
                "RedirectURI": REFRESH_REDIRECT_URI,
            })),
        };
        let response = finish(self.transport.send(request).await?)?;

        let body = &response.body;
        let access = body.get("AccessToken").and_then(Value::as_str);
        let refresh = body.get("RefreshToken").and_then(Value::as_str);
        let (Some(access), Some(refresh)) = (access, refresh) else {
            return Err(Error::UnhandledApi(
                "refresh response is missing AccessToken or RefreshToken".to_string(),
            ));
        };

        let mut updated = current;
        updated.access_token = access.to_string();
        updated.refresh_token = refresh.to_string();
        if let Some(uid) = body.get("UID").and_then(Value::as_str) {
            updated.uid = uid.to_string();
        }
        *self.tokens.write().await = Some(updated.clone());

        if let Some(store) = &self.credentials {
            store.store_session(&updated)?;
        }
        info!("Session tokens refreshed");
        Ok(())
    }
}
