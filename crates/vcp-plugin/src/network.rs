//! Permission-checked outbound HTTP for plugins.
//!
//! A request passes, in order: URL validation, the `network.request` grant
//! check against the host, the plugin's token bucket, the GET cache, and
//! finally the transport under an application-level timeout. Each stage is
//! audited.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use vcp_config::NetworkConfig;
use vcp_core::{NetworkError, Result, VcpError};

use crate::audit::AuditLogger;
use crate::cache::{CacheKey, ResponseCache};
use crate::permissions::PermissionManager;
use crate::ratelimit::{RateLimitConfig, RateLimiter};

pub const NETWORK_REQUEST: &str = "network.request";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "HEAD" => Ok(HttpMethod::Head),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "PATCH" => Ok(HttpMethod::Patch),
            "DELETE" => Ok(HttpMethod::Delete),
            other => Err(format!("unsupported method '{other}'")),
        }
    }
}

fn find_header<'a>(headers: &'a BTreeMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRequest {
    pub url: String,
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<Vec<u8>>,
    /// Requested timeout; `None` means the configured default.
    #[serde(default)]
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn get(url: &str) -> Self {
        Self {
            url: url.to_string(),
            method: HttpMethod::Get,
            headers: BTreeMap::new(),
            body: None,
            timeout: None,
        }
    }

    pub fn post(url: &str, body: Vec<u8>) -> Self {
        Self {
            method: HttpMethod::Post,
            body: Some(body),
            ..Self::get(url)
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    /// Served from the response cache rather than the network.
    #[serde(default)]
    pub from_cache: bool,
}

impl HttpResponse {
    pub fn new(status: u16, body: Vec<u8>) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body,
            from_cache: false,
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Performs the actual request. The proxy enforces its own timer on top.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(
        &self,
        request: &HttpRequest,
        timeout: Duration,
    ) -> std::result::Result<HttpResponse, NetworkError>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|e| NetworkError::ConnectionFailed(e.to_string()))?;
        Ok(Self { client })
    }
}

fn to_reqwest_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Head => reqwest::Method::HEAD,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Patch => reqwest::Method::PATCH,
        HttpMethod::Delete => reqwest::Method::DELETE,
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(
        &self,
        request: &HttpRequest,
        timeout: Duration,
    ) -> std::result::Result<HttpResponse, NetworkError> {
        let classify = |e: reqwest::Error| {
            if e.is_timeout() {
                NetworkError::Timeout { after: timeout }
            } else {
                NetworkError::ConnectionFailed(e.to_string())
            }
        };

        let mut builder = self
            .client
            .request(to_reqwest_method(request.method), &request.url)
            .timeout(timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let resp = builder.send().await.map_err(classify)?;
        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|v| (k.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = resp.bytes().await.map_err(classify)?.to_vec();

        Ok(HttpResponse {
            status,
            headers,
            body,
            from_cache: false,
        })
    }
}

pub struct NetworkProxy {
    permissions: Arc<PermissionManager>,
    audit: Arc<AuditLogger>,
    transport: Arc<dyn HttpTransport>,
    cache: ResponseCache,
    limiter: RateLimiter,
    default_timeout: Duration,
    max_timeout: Duration,
}

impl NetworkProxy {
    pub fn new(
        config: &NetworkConfig,
        permissions: Arc<PermissionManager>,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        Self {
            audit: Arc::clone(permissions.audit()),
            permissions,
            transport,
            cache: ResponseCache::new(
                Duration::from_secs(config.cache_ttl_secs),
                config.cache_max_entries,
            ),
            limiter: RateLimiter::new(RateLimitConfig::from(config)),
            default_timeout: Duration::from_secs(config.default_timeout_secs),
            max_timeout: Duration::from_secs(config.max_timeout_secs),
        }
    }

    /// Proxy backed by a real HTTP client.
    pub fn with_reqwest(config: &NetworkConfig, permissions: Arc<PermissionManager>) -> Result<Self> {
        let transport = ReqwestTransport::new(&config.user_agent)?;
        Ok(Self::new(config, permissions, Arc::new(transport)))
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// The timeout actually enforced for a request asking for `requested`:
    /// the default when unset, clamped to the maximum when larger.
    pub fn effective_timeout(&self, requested: Option<Duration>) -> Duration {
        match requested {
            None => self.default_timeout.min(self.max_timeout),
            Some(t) if t > self.max_timeout => {
                warn!(requested = ?t, max = ?self.max_timeout, "request timeout clamped");
                self.max_timeout
            }
            Some(t) => t,
        }
    }

    pub async fn request(&self, plugin_id: &str, request: HttpRequest) -> Result<HttpResponse> {
        let url = url::Url::parse(&request.url)
            .map_err(|e| NetworkError::InvalidUrl(format!("{}: {e}", request.url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(NetworkError::InvalidUrl(format!("unsupported scheme '{}'", url.scheme())).into());
        }
        let host = url
            .host_str()
            .ok_or_else(|| NetworkError::InvalidUrl(format!("{}: missing host", request.url)))?
            .to_ascii_lowercase();
        let target = redacted(&url);

        if !self.permissions.check(plugin_id, NETWORK_REQUEST, &host) {
            warn!(plugin = plugin_id, %host, "network request denied");
            return Err(VcpError::denied(plugin_id, NETWORK_REQUEST, host));
        }

        if let Err(retry_after) = self.limiter.check(plugin_id) {
            warn!(plugin = plugin_id, ?retry_after, "network request rate limited");
            self.audit
                .log_detail(plugin_id, "network.ratelimit", &target, false, "rate_limited");
            return Err(NetworkError::RateLimited { retry_after }.into());
        }
        self.audit
            .log_detail(plugin_id, "network.ratelimit", &target, true, "token_consumed");

        let cache_key = CacheKey::for_request(&request);
        if let Some(key) = &cache_key {
            if let Some(mut hit) = self.cache.get(key) {
                debug!(plugin = plugin_id, url = %target, "cache hit");
                self.audit
                    .log_detail(plugin_id, "network.cache", &target, true, "cache_hit");
                hit.from_cache = true;
                return Ok(hit);
            }
            self.audit
                .log_detail(plugin_id, "network.cache", &target, true, "cache_miss");
        }

        let timeout = self.effective_timeout(request.timeout);
        debug!(plugin = plugin_id, method = %request.method, url = %target, ?timeout, "sending request");

        let outcome = match tokio::time::timeout(timeout, self.transport.send(&request, timeout)).await {
            Ok(result) => result,
            Err(_) => Err(NetworkError::Timeout { after: timeout }),
        };

        let response = match outcome {
            Ok(resp) => resp,
            Err(e) => {
                warn!(plugin = plugin_id, url = %target, error = %e, "network request failed");
                self.audit
                    .log_detail(plugin_id, "network.response", &target, false, &e.to_string());
                return Err(e.into());
            }
        };

        let status = response.status;
        if status >= 400 {
            warn!(plugin = plugin_id, url = %target, status, "network request returned error status");
            self.audit.log_detail(
                plugin_id,
                "network.response",
                &target,
                false,
                &format!("status {status}"),
            );
            return Err(NetworkError::HttpStatus { status }.into());
        }

        self.audit.log_detail(
            plugin_id,
            "network.response",
            &target,
            true,
            &format!("status {status}"),
        );
        if let Some(key) = cache_key {
            self.cache.insert(key, &response);
        }
        Ok(response)
    }

    /// Forget per-plugin limiter state (on uninstall).
    pub fn forget_plugin(&self, plugin_id: &str) {
        if self.limiter.reset(plugin_id) {
            info!(plugin = plugin_id, "rate-limit bucket cleared");
        }
    }
}

/// URL for logs and audit records: no credentials, query, or fragment.
fn redacted(url: &url::Url) -> String {
    let mut url = url.clone();
    let _ = url.set_username("");
    let _ = url.set_password(None);
    url.set_query(None);
    url.set_fragment(None);
    url.to_string()
}
