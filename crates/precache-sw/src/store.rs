//! Cache storage: named cache generations holding request/response pairs.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::try_join_all;
use hashbrown::HashMap;
use http::{HeaderMap, Method, StatusCode};
use precache_net::{Fetch, Request, Response, ResponseType};
use tokio::sync::RwLock;
use tracing::{debug, trace};
use url::Url;

use crate::{AgentError, Result};

/// Identity of a cached request: method plus URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    pub method: Method,
    pub url: String,
}

impl RequestKey {
    /// Key for a GET of `url`.
    pub fn get(url: &Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn new(method: Method, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method,
            url: url.into(),
        }
    }

    pub fn from_request(request: &Request) -> Self {
        Self::new(request.method.clone(), &request.url)
    }
}

impl std::fmt::Display for RequestKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// A stored response snapshot.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Final response URL.
    pub url: Url,

    /// Response status.
    pub status: StatusCode,

    /// Response headers.
    pub headers: HeaderMap,

    /// Response type at the time it was stored.
    pub response_type: ResponseType,

    /// Response body.
    pub body: Bytes,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Snapshot a response.
    pub fn from_response(response: Response) -> Self {
        let url = response.url.clone();
        let status = response.status;
        let headers = response.headers.clone();
        let response_type = response.response_type;
        Self {
            url,
            status,
            headers,
            response_type,
            body: response.bytes(),
            cached_at: now_millis(),
        }
    }

    /// Materialize a fresh response from the snapshot.
    pub fn to_response(&self) -> Response {
        let mut response = Response::new(self.url.clone(), self.status, self.body.clone())
            .with_type(self.response_type);
        response.headers = self.headers.clone();
        response
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// One named cache generation.
#[async_trait]
pub trait CacheHandle: Send + Sync {
    /// Cache name.
    fn name(&self) -> &str;

    /// Fetch every URL and store the responses.
    ///
    /// All-or-nothing: if any fetch fails or returns a non-OK status,
    /// nothing is stored.
    async fn add_all(&self, urls: &[Url]) -> Result<()>;

    /// Look up a stored response.
    async fn match_request(&self, key: &RequestKey) -> Result<Option<Response>>;

    /// Store a response, replacing any previous entry for `key`.
    async fn put(&self, key: RequestKey, response: Response) -> Result<()>;

    /// Remove an entry.
    async fn delete(&self, key: &RequestKey) -> Result<bool>;

    /// All stored request keys.
    async fn keys(&self) -> Result<Vec<RequestKey>>;
}

/// The set of cache generations.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Open a cache, creating it if it doesn't exist.
    async fn open(&self, name: &str) -> Result<Arc<dyn CacheHandle>>;

    /// Check if a cache exists.
    async fn has(&self, name: &str) -> Result<bool>;

    /// Names of all caches.
    async fn keys(&self) -> Result<Vec<String>>;

    /// Delete a cache. Returns whether it existed.
    async fn delete(&self, name: &str) -> Result<bool>;
}

/// In-memory cache generation.
pub struct MemoryCache {
    name: String,
    entries: RwLock<HashMap<RequestKey, CacheEntry>>,
    network: Arc<dyn Fetch>,
}

impl MemoryCache {
    fn new(name: &str, network: Arc<dyn Fetch>) -> Self {
        Self {
            name: name.to_string(),
            entries: RwLock::new(HashMap::new()),
            network,
        }
    }

    async fn fetch_for_cache(&self, url: &Url) -> Result<(RequestKey, CacheEntry)> {
        let response = self.network.fetch(Request::get(url.clone())).await?;
        if !response.ok() {
            return Err(AgentError::BadResponse {
                url: url.to_string(),
                status: response.status.as_u16(),
            });
        }
        Ok((RequestKey::get(url), CacheEntry::from_response(response)))
    }
}

#[async_trait]
impl CacheHandle for MemoryCache {
    fn name(&self) -> &str {
        &self.name
    }

    async fn add_all(&self, urls: &[Url]) -> Result<()> {
        debug!(cache = %self.name, count = urls.len(), "Adding URLs to cache");
        let fetched = try_join_all(urls.iter().map(|url| self.fetch_for_cache(url))).await?;

        let mut entries = self.entries.write().await;
        for (key, entry) in fetched {
            entries.insert(key, entry);
        }
        Ok(())
    }

    async fn match_request(&self, key: &RequestKey) -> Result<Option<Response>> {
        let entries = self.entries.read().await;
        let found = entries.get(key).map(CacheEntry::to_response);
        trace!(cache = %self.name, key = %key, hit = found.is_some(), "Cache lookup");
        Ok(found)
    }

    async fn put(&self, key: RequestKey, response: Response) -> Result<()> {
        trace!(cache = %self.name, key = %key, "Cache put");
        self.entries
            .write()
            .await
            .insert(key, CacheEntry::from_response(response));
        Ok(())
    }

    async fn delete(&self, key: &RequestKey) -> Result<bool> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn keys(&self) -> Result<Vec<RequestKey>> {
        Ok(self.entries.read().await.keys().cloned().collect())
    }
}

/// In-memory cache storage.
///
/// `add_all` goes through the injected network.
pub struct MemoryCacheStore {
    caches: RwLock<HashMap<String, Arc<MemoryCache>>>,
    network: Arc<dyn Fetch>,
}

impl MemoryCacheStore {
    /// Create new cache storage.
    pub fn new(network: Arc<dyn Fetch>) -> Self {
        Self {
            caches: RwLock::new(HashMap::new()),
            network,
        }
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn open(&self, name: &str) -> Result<Arc<dyn CacheHandle>> {
        if let Some(cache) = self.caches.read().await.get(name) {
            return Ok(Arc::clone(cache) as Arc<dyn CacheHandle>);
        }

        let mut caches = self.caches.write().await;
        let cache = caches
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(cache = %name, "Creating cache");
                Arc::new(MemoryCache::new(name, Arc::clone(&self.network)))
            })
            .clone();
        Ok(cache as Arc<dyn CacheHandle>)
    }

    async fn has(&self, name: &str) -> Result<bool> {
        Ok(self.caches.read().await.contains_key(name))
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.caches.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        Ok(self.caches.write().await.remove(name).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{url, FakeNetwork};

    fn store(network: &Arc<FakeNetwork>) -> MemoryCacheStore {
        MemoryCacheStore::new(network.clone())
    }

    #[test]
    fn test_request_key_strips_fragment() {
        let a = RequestKey::get(&url("https://example.com/index.html#top"));
        let b = RequestKey::get(&url("https://example.com/index.html"));
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "GET https://example.com/index.html");

        let post = RequestKey::new(Method::POST, &url("https://example.com/index.html"));
        assert_ne!(a, post);
    }

    #[tokio::test]
    async fn test_open_creates_and_reuses() {
        let network = FakeNetwork::new();
        let storage = store(&network);

        assert!(!storage.has("v1").await.unwrap());
        let first = storage.open("v1").await.unwrap();
        assert!(storage.has("v1").await.unwrap());

        let key = RequestKey::get(&url("https://example.com/a.js"));
        first
            .put(key.clone(), Response::new(url("https://example.com/a.js"), StatusCode::OK, "a"))
            .await
            .unwrap();

        let second = storage.open("v1").await.unwrap();
        assert!(second.match_request(&key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_cache() {
        let network = FakeNetwork::new();
        let storage = store(&network);

        storage.open("v1").await.unwrap();
        storage.open("v2").await.unwrap();
        assert_eq!(storage.keys().await.unwrap(), vec!["v1", "v2"]);

        assert!(storage.delete("v1").await.unwrap());
        assert!(!storage.delete("v1").await.unwrap());
        assert_eq!(storage.keys().await.unwrap(), vec!["v2"]);
    }

    #[tokio::test]
    async fn test_add_all_stores_every_url() {
        let network = FakeNetwork::new();
        network.serve("https://example.com/", "<html>");
        network.serve("https://example.com/app.js", "js");

        let cache = store(&network).open("v1").await.unwrap();
        cache
            .add_all(&[url("https://example.com/"), url("https://example.com/app.js")])
            .await
            .unwrap();

        let keys = cache.keys().await.unwrap();
        assert_eq!(keys.len(), 2);

        let hit = cache
            .match_request(&RequestKey::get(&url("https://example.com/app.js")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.status, StatusCode::OK);
        assert_eq!(hit.text().unwrap(), "js");
    }

    #[tokio::test]
    async fn test_add_all_is_all_or_nothing() {
        let network = FakeNetwork::new();
        network.serve("https://example.com/", "<html>");
        // styles.css is not served, so the fake answers 404

        let cache = store(&network).open("v1").await.unwrap();
        let err = cache
            .add_all(&[url("https://example.com/"), url("https://example.com/styles.css")])
            .await
            .unwrap_err();

        assert!(matches!(err, AgentError::BadResponse { status: 404, .. }));
        assert!(cache.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_add_all_offline_fails() {
        let network = FakeNetwork::new();
        network.serve("https://example.com/", "<html>");
        network.set_offline(true);

        let cache = store(&network).open("v1").await.unwrap();
        let err = cache
            .add_all(&[url("https://example.com/")])
            .await
            .unwrap_err();

        assert!(matches!(err, AgentError::Network(_)));
        assert!(cache.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let network = FakeNetwork::new();
        let cache = store(&network).open("v1").await.unwrap();
        let target = url("https://example.com/data.json");
        let key = RequestKey::get(&target);

        cache
            .put(key.clone(), Response::new(target.clone(), StatusCode::OK, "old"))
            .await
            .unwrap();
        cache
            .put(key.clone(), Response::new(target, StatusCode::OK, "new"))
            .await
            .unwrap();

        assert_eq!(cache.keys().await.unwrap().len(), 1);
        let hit = cache.match_request(&key).await.unwrap().unwrap();
        assert_eq!(hit.text().unwrap(), "new");

        assert!(cache.delete(&key).await.unwrap());
        assert!(cache.match_request(&key).await.unwrap().is_none());
    }
}
