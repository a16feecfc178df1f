//! Request interception: answer reads from the cache or the network.

use std::sync::Arc;

use precache_net::{Fetch, Request, Response};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::store::{CacheHandle, CacheStore, RequestKey};
use crate::{AgentError, Result};

/// Which source is consulted first for an intercepted read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionPolicy {
    /// Serve from cache; fetch and store on a miss.
    #[default]
    CacheFirst,
    /// Fetch and store; fall back to the cache when the network fails.
    NetworkFirst,
}

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Cache,
    Network,
}

/// Result of intercepting a request.
#[derive(Debug)]
pub enum FetchOutcome {
    /// Not handled; the host should perform the request itself.
    PassThrough(Request),
    /// Answered by the agent.
    Respond {
        response: Response,
        source: ResponseSource,
    },
}

impl FetchOutcome {
    pub fn response(&self) -> Option<&Response> {
        match self {
            FetchOutcome::Respond { response, .. } => Some(response),
            FetchOutcome::PassThrough(_) => None,
        }
    }

    pub fn source(&self) -> Option<ResponseSource> {
        match self {
            FetchOutcome::Respond { source, .. } => Some(*source),
            FetchOutcome::PassThrough(_) => None,
        }
    }

    pub fn into_response(self) -> Option<Response> {
        match self {
            FetchOutcome::Respond { response, .. } => Some(response),
            FetchOutcome::PassThrough(_) => None,
        }
    }
}

/// Resolves intercepted GET requests against one cache generation.
pub struct RequestInterceptor {
    policy: ResolutionPolicy,
    cache_name: String,
    store: Arc<dyn CacheStore>,
    network: Arc<dyn Fetch>,
    pending: Mutex<JoinSet<()>>,
}

impl RequestInterceptor {
    pub fn new(
        policy: ResolutionPolicy,
        cache_name: &str,
        store: Arc<dyn CacheStore>,
        network: Arc<dyn Fetch>,
    ) -> Self {
        Self {
            policy,
            cache_name: cache_name.to_string(),
            store,
            network,
            pending: Mutex::new(JoinSet::new()),
        }
    }

    pub fn policy(&self) -> ResolutionPolicy {
        self.policy
    }

    /// Intercept a request.
    ///
    /// Non-GET requests are handed back untouched and never reach the cache.
    pub async fn intercept(&self, request: Request) -> Result<FetchOutcome> {
        if !request.is_get() {
            return Ok(FetchOutcome::PassThrough(request));
        }

        match self.policy {
            ResolutionPolicy::CacheFirst => self.cache_first(request).await,
            ResolutionPolicy::NetworkFirst => self.network_first(request).await,
        }
    }

    /// Wait for every background cache write started so far.
    pub async fn settle(&self) {
        let mut pending = self.pending.lock().await;
        while let Some(joined) = pending.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Cache write task failed");
            }
        }
    }

    async fn cache_first(&self, request: Request) -> Result<FetchOutcome> {
        let key = RequestKey::from_request(&request);

        if let Some(response) = self.lookup(&key).await {
            debug!(url = %request.url, "Serving from cache");
            return Ok(FetchOutcome::Respond {
                response,
                source: ResponseSource::Cache,
            });
        }

        debug!(url = %request.url, "Fetching from network");
        let url = request.url.clone();
        let response = self.network.fetch(request).await.map_err(|e| {
            warn!(url = %url, error = %e, "Network fetch failed");
            AgentError::Network(e)
        })?;

        Ok(FetchOutcome::Respond {
            response: self.store_copy(key, response).await,
            source: ResponseSource::Network,
        })
    }

    async fn network_first(&self, request: Request) -> Result<FetchOutcome> {
        let key = RequestKey::from_request(&request);
        let url = request.url.clone();

        match self.network.fetch(request).await {
            Ok(response) => Ok(FetchOutcome::Respond {
                response: self.store_copy(key, response).await,
                source: ResponseSource::Network,
            }),
            Err(e) => {
                debug!(url = %url, error = %e, "Network failed, trying cache");
                match self.lookup(&key).await {
                    Some(response) => Ok(FetchOutcome::Respond {
                        response,
                        source: ResponseSource::Cache,
                    }),
                    None => Err(AgentError::NotFound(url.to_string())),
                }
            }
        }
    }

    /// A read failure counts as a miss.
    async fn lookup(&self, key: &RequestKey) -> Option<Response> {
        let found = async {
            match current_generation(self.store.as_ref(), &self.cache_name).await? {
                Some(cache) => cache.match_request(key).await,
                None => Ok(None),
            }
        }
        .await;

        match found {
            Ok(hit) => hit,
            Err(e) => {
                warn!(key = %key, error = %e, "Cache lookup failed");
                None
            }
        }
    }

    /// Start storing a copy of a cacheable response and return the original.
    async fn store_copy(&self, key: RequestKey, response: Response) -> Response {
        if !response.is_cacheable() {
            debug!(
                key = %key,
                status = %response.status,
                response_type = ?response.response_type,
                "Not caching response"
            );
            return response;
        }

        let (response, copy) = response.tee();
        let store = Arc::clone(&self.store);
        let cache_name = self.cache_name.clone();

        let mut pending = self.pending.lock().await;
        while pending.try_join_next().is_some() {}
        pending.spawn(async move {
            let written = async {
                match current_generation(store.as_ref(), &cache_name).await? {
                    Some(cache) => cache.put(key.clone(), copy).await.map(|()| true),
                    None => Ok(false),
                }
            }
            .await;
            match written {
                Ok(true) => {}
                Ok(false) => {
                    debug!(key = %key, cache = %cache_name, "Cache is gone, dropping write")
                }
                Err(e) => warn!(key = %key, error = %e, "Failed to cache response"),
            }
        });

        response
    }
}

/// Open `name` only if it already exists. Generations are created by the
/// lifecycle, never by a read or write here.
async fn current_generation(
    store: &dyn CacheStore,
    name: &str,
) -> Result<Option<Arc<dyn CacheHandle>>> {
    if !store.has(name).await? {
        return Ok(None);
    }
    store.open(name).await.map(Some)
}
