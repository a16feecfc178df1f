//! Test doubles for the injected network and helpers shared by unit tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::{HashMap, HashSet};
use http::StatusCode;
use precache_net::{Fetch, NetError, Request, Response, ResponseType};
use url::Url;

use crate::{AgentConfig, ResolutionPolicy};

pub const SCOPE: &str = "https://example.com/";

pub fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
}

/// Config for `SCOPE` with the assets from the usage example.
pub fn config(version: &str, policy: ResolutionPolicy) -> AgentConfig {
    let mut config = AgentConfig::new(
        url(SCOPE),
        version,
        vec!["/".into(), "/index.html".into(), "/app.js".into()],
    );
    config.policy = policy;
    config
}

struct Route {
    status: StatusCode,
    response_type: ResponseType,
    body: Bytes,
}

/// Scripted network. Unknown URLs answer 404.
#[derive(Default)]
pub struct FakeNetwork {
    routes: Mutex<HashMap<String, Route>>,
    unreachable: Mutex<HashSet<String>>,
    offline: AtomicBool,
    requests: Mutex<Vec<String>>,
}

impl FakeNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Network serving the usage-example assets under `SCOPE`.
    pub fn with_app() -> Arc<Self> {
        let network = Self::new();
        network.serve("https://example.com/", "<html>root</html>");
        network.serve("https://example.com/index.html", "<html>index</html>");
        network.serve("https://example.com/app.js", "console.log('v1')");
        network
    }

    pub fn serve(&self, url: &str, body: &str) {
        self.serve_with(url, StatusCode::OK, ResponseType::Basic, body);
    }

    pub fn serve_with(&self, url: &str, status: StatusCode, response_type: ResponseType, body: &str) {
        self.routes.lock().unwrap().insert(
            url.to_string(),
            Route {
                status,
                response_type,
                body: Bytes::copy_from_slice(body.as_bytes()),
            },
        );
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Make a single URL fail at the connection level.
    pub fn unreachable(&self, url: &str) {
        self.unreachable.lock().unwrap().insert(url.to_string());
    }

    pub fn hits(&self, url: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|u| u.as_str() == url)
            .count()
    }

    pub fn total_hits(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl Fetch for FakeNetwork {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        let target = request.url.to_string();
        self.requests.lock().unwrap().push(target.clone());

        if self.offline.load(Ordering::SeqCst) || self.unreachable.lock().unwrap().contains(&target)
        {
            return Err(NetError::Offline(target));
        }

        let routes = self.routes.lock().unwrap();
        Ok(match routes.get(&target) {
            Some(route) => Response::new(request.url, route.status, route.body.clone())
                .with_type(route.response_type),
            None => Response::new(request.url, StatusCode::NOT_FOUND, Bytes::new()),
        })
    }
}
