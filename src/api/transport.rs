//! HTTP transport seam
//!
//! The session speaks to the API through [`Transport`], so retry and refresh
//! logic can be exercised without a network. [`ReqwestTransport`] is the
//! production implementation.

use crate::api::tls;
use crate::error::{Error, Result};
use crate::settings::ApiSettings;
use async_trait::async_trait;
use reqwest::Method;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status: u16,
    /// Header names are lowercased
    pub headers: HashMap<String, String>,
    /// Decoded JSON body; `Null` when the body is empty or not JSON
    pub body: Value,
}

impl HttpResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body,
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_lowercase(), value.to_string());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(|s| s.as_str())
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform one HTTP exchange. Timeouts surface as [`Error::ApiTimeout`].
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(settings: &ApiSettings) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .user_agent(settings.user_agent.clone())
            .connect_timeout(settings.connect_timeout())
            .timeout(settings.request_timeout())
            .cookie_store(true);

        if !settings.pins.is_empty() {
            let config = tls::pinned_client_config(settings.pins.clone())?;
            builder = builder.use_preconfigured_tls(config);
        }

        Ok(Self {
            client: builder.build()?,
        })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let mut headers = HeaderMap::new();
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::UnhandledApi(format!("invalid header name {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::UnhandledApi(format!("invalid header value: {}", e)))?;
            headers.insert(name, value);
        }

        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .headers(headers);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|v| (k.as_str().to_lowercase(), v.to_string()))
            })
            .collect();
        let text = response.text().await.map_err(map_reqwest_error)?;
        debug!("{} {} -> {}", request.method, request.url, status);

        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::Null)
        };

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

fn map_reqwest_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::ApiTimeout
    } else {
        Error::Http(e)
    }
}

/// Transport answering from per-endpoint queues of canned responses
///
/// Used by tests to drive sessions without a network. Every request is
/// recorded; an endpoint with an exhausted queue answers 404.
#[derive(Default)]
pub struct ScriptedTransport {
    routes: Mutex<HashMap<(Method, String), VecDeque<Result<HttpResponse>>>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for `method path` (path without the base URL)
    pub fn push(&self, method: Method, path: &str, response: HttpResponse) {
        self.push_result(method, path, Ok(response));
    }

    pub fn push_result(&self, method: Method, path: &str, response: Result<HttpResponse>) {
        if let Ok(mut routes) = self.routes.lock() {
            routes
                .entry((method, path.to_string()))
                .or_default()
                .push_back(response);
        }
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn count(&self, method: &Method, path: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| &r.method == method && request_path(&r.url) == path)
            .count()
    }
}

/// Path component of a URL, without query string
fn request_path(url: &str) -> &str {
    let without_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let path = without_scheme
        .find('/')
        .map(|i| &without_scheme[i..])
        .unwrap_or("/");
    path.split('?').next().unwrap_or(path)
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let key = (request.method.clone(), request_path(&request.url).to_string());
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        let next = self
            .routes
            .lock()
            .ok()
            .and_then(|mut routes| routes.get_mut(&key).and_then(|q| q.pop_front()));
        match next {
            Some(response) => response,
            None => Ok(HttpResponse::new(
                404,
                serde_json::json!({"Code": 404, "Error": format!("no scripted response for {} {}", key.0, key.1)}),
            )),
        }
    }
}
