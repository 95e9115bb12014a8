use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// A cached value with timestamp for TTL
#[derive(Debug, Clone)]
struct CacheEntry<T> {
    value: T,
    expires_at: Option<Instant>, // None = never expires
}

impl<T> CacheEntry<T> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }
}

#[derive(Debug)]
pub struct Cache<K, V> {
    store: RwLock<HashMap<K, CacheEntry<V>>>,
}

impl<K, V> Cache<K, V>
where
    K: std::cmp::Eq + std::hash::Hash + Clone,
    V: Clone,
{
    pub fn new() -> Arc<Self> {
        Arc::new(Self { store: RwLock::new(HashMap::new()) })
    }

    /// Insert value with its own TTL, last writer wins
    pub async fn insert_with_ttl(&self, key: K, value: V, ttl: Option<Duration>) {
        let expires_at = ttl.map(|t| Instant::now() + t);
        let entry = CacheEntry { value, expires_at };

        let mut store = self.store.write().await;
        store.insert(key, entry);
    }

    /// Get value if not expired. Expired entries are evicted here.
    pub async fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        {
            let store = self.store.read().await;
            match store.get(key) {
                None => return None,
                Some(entry) if !entry.is_expired(now) => return Some(entry.value.clone()),
                Some(_) => {}
            }
        }
        let mut store = self.store.write().await;
        if store.get(key).map(|e| e.is_expired(now)).unwrap_or(false) {
            store.remove(key);
        }
        None
    }

    /// Remove every key matching `pred`
    pub async fn remove_where<F>(&self, pred: F) -> usize
    where
        F: Fn(&K) -> bool,
    {
        let mut store = self.store.write().await;
        let before = store.len();
        store.retain(|k, _| !pred(k));
        before - store.len()
    }

    /// Active eviction of everything past its TTL
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut store = self.store.write().await;
        let before = store.len();
        store.retain(|_, e| !e.is_expired(now));
        before - store.len()
    }

    pub async fn len(&self) -> usize {
        self.store.read().await.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// Responses keyed by (endpoint id, request signature).
#[derive(Debug, Clone)]
pub struct ResponseCache {
    inner: Arc<Cache<(String, String), CachedResponse>>,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseCache {
    pub fn new() -> Self {
        Self { inner: Cache::new() }
    }

    pub async fn get(&self, endpoint_id: &str, signature: &str) -> Option<CachedResponse> {
        self.inner
            .get(&(endpoint_id.to_string(), signature.to_string()))
            .await
    }

    pub async fn put(&self, endpoint_id: &str, signature: &str, response: CachedResponse, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        self.inner
            .insert_with_ttl((endpoint_id.to_string(), signature.to_string()), response, Some(ttl))
            .await;
    }

    pub async fn invalidate_endpoint(&self, endpoint_id: &str) -> usize {
        self.inner.remove_where(|(id, _)| id == endpoint_id).await
    }

    pub async fn purge_expired(&self) -> usize {
        self.inner.purge_expired().await
    }

    pub async fn len(&self) -> usize {
        self.inner.len().await
    }
}

/// Stable signature of a request: method, path and query with its
/// parameters sorted, so reordered parameters hit the same entry.
pub fn request_signature(method: &str, path: &str, query: Option<&str>) -> String {
    let mut params: Vec<(String, String)> = query
        .map(|q| {
            form_urlencoded::parse(q.as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect()
        })
        .unwrap_or_default();
    params.sort();
    let normalized = form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params.iter())
        .finish();

    let mut hasher = Sha256::new();
    hasher.update(method.to_ascii_uppercase().as_bytes());
    hasher.update(b" ");
    hasher.update(path.as_bytes());
    hasher.update(b"?");
    hasher.update(normalized.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}
