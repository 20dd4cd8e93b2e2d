//! Response cache for idempotent requests.
//!
//! Only `GET` responses are ever stored or served. The key includes the
//! `Authorization` header value so credentials never leak between callers.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::network::{HttpMethod, HttpRequest, HttpResponse};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub method: HttpMethod,
    pub url: String,
    pub authorization: Option<String>,
}

impl CacheKey {
    /// Key for a cache-eligible request; `None` for anything but `GET`.
    pub fn for_request(request: &HttpRequest) -> Option<Self> {
        if request.method != HttpMethod::Get {
            return None;
        }
        let url = normalize_url(&request.url)?;
        Some(Self {
            method: request.method,
            url,
            authorization: request.header("authorization").map(|v| v.trim().to_string()),
        })
    }
}

/// Lowercase scheme and host, default port dropped, fragment removed.
pub fn normalize_url(raw: &str) -> Option<String> {
    let mut url = url::Url::parse(raw).ok()?;
    url.set_fragment(None);
    Some(url.to_string())
}

#[derive(Debug, Clone)]
struct CacheEntry {
    response: HttpResponse,
    stored_at: Instant,
    expires_at: Instant,
}

pub struct ResponseCache {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    ttl: Duration,
    capacity: usize,
}

impl ResponseCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            capacity,
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<HttpResponse> {
        if key.method != HttpMethod::Get {
            return None;
        }
        let entries = self.entries.read();
        let entry = entries.get(key)?;
        if Instant::now() >= entry.expires_at {
            return None;
        }
        Some(entry.response.clone())
    }

    /// Store a response. Non-GET keys, non-2xx statuses, and responses marked
    /// `no-store`/`no-cache` (or `max-age=0`) are refused. Returns whether
    /// the response was stored.
    pub fn insert(&self, key: CacheKey, response: &HttpResponse) -> bool {
        if key.method != HttpMethod::Get || !(200..300).contains(&response.status) {
            return false;
        }
        let ttl = match freshness(response, self.ttl) {
            Some(ttl) if !ttl.is_zero() => ttl,
            _ => return false,
        };
        if self.capacity == 0 {
            return false;
        }

        let now = Instant::now();
        let Some(expires_at) = now.checked_add(ttl) else {
            return false;
        };
        let mut entries = self.entries.write();
        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            entries.retain(|_, e| now < e.expires_at);
            while entries.len() >= self.capacity {
                let Some(oldest) = entries
                    .iter()
                    .min_by_key(|(_, e)| e.stored_at)
                    .map(|(k, _)| k.clone())
                else {
                    break;
                };
                entries.remove(&oldest);
            }
        }

        debug!(url = %key.url, ttl = ?ttl, "caching response");
        let mut stored = response.clone();
        stored.from_cache = false;
        entries.insert(
            key,
            CacheEntry {
                response: stored,
                stored_at: now,
                expires_at,
            },
        );
        true
    }

    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| now < e.expires_at);
        before - entries.len()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Lifetime from `Cache-Control`, never longer than `default`; `None` when
/// the response must not be stored.
fn freshness(response: &HttpResponse, default: Duration) -> Option<Duration> {
    let Some(cc) = response.header("cache-control") else {
        return Some(default);
    };
    let mut ttl = default;
    for directive in cc.split(',').map(|d| d.trim().to_ascii_lowercase()) {
        match directive.as_str() {
            "no-store" | "no-cache" => return None,
            d => {
                if let Some(secs) = d.strip_prefix("max-age=")
                    && let Ok(secs) = secs.trim_matches('"').parse::<u64>()
                {
                    ttl = Duration::from_secs(secs).min(default);
                }
            }
        }
    }
    Some(ttl)
}
