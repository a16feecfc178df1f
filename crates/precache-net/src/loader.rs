//! `reqwest`-backed implementation of [`Fetch`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::{Fetch, NetError, Origin, Request, Response, ResponseType};

/// Resource loader configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Per-request timeout. `None` leaves requests unbounded.
    pub timeout: Option<Duration>,
    /// Maximum redirects.
    pub max_redirects: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("precache/{}", env!("CARGO_PKG_VERSION")),
            timeout: Some(Duration::from_secs(30)),
            max_redirects: 10,
        }
    }
}

/// Fetches resources over HTTP on behalf of one origin.
pub struct HttpFetcher {
    client: Client,
    config: LoaderConfig,
    origin: Option<Origin>,
}

impl HttpFetcher {
    /// Create a new fetcher.
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let mut builder = Client::builder()
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects));
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!(user_agent = %config.user_agent, "HttpFetcher initialized");

        Ok(Self {
            client,
            config,
            origin: None,
        })
    }

    /// Classify responses relative to the origin of `scope`.
    pub fn with_scope(mut self, scope: &Url) -> Self {
        self.origin = Some(Origin::from_url(scope));
        self
    }

    fn map_error(&self, url: &Url, err: reqwest::Error) -> NetError {
        if err.is_timeout() {
            warn!(url = %url, "Request timed out");
            NetError::Timeout(self.config.timeout.unwrap_or_default())
        } else if err.is_connect() {
            warn!(url = %url, error = %err, "Network unreachable");
            NetError::Offline(err.to_string())
        } else {
            NetError::HttpError(err)
        }
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        debug!(url = %request.url, method = %request.method, "Fetching resource");

        let mut req_builder = self
            .client
            .request(request.method.clone(), request.url.clone());

        for (name, value) in request.headers.iter() {
            req_builder = req_builder.header(name, value);
        }

        if let Some(body) = request.body {
            req_builder = req_builder.body(body);
        }

        let response = req_builder
            .send()
            .await
            .map_err(|e| self.map_error(&request.url, e))?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let response_type = ResponseType::classify(self.origin.as_ref(), &url);

        let body = response
            .bytes()
            .await
            .map_err(|e| self.map_error(&request.url, e))?;

        trace!(
            url = %url,
            status = %status,
            response_type = ?response_type,
            body_len = body.len(),
            "Response received"
        );

        let mut out = Response::new(url, status, body).with_type(response_type);
        out.headers = headers;
        Ok(out)
    }
}
