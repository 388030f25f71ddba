//! `reqwest`-backed network access.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, trace};

use crate::{Fetcher, NetError, Request, Response, ResponseSource};

/// Loader configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Accept-Language header added when the request has none.
    pub accept_language: String,
    /// Client-level timeout; an expired request surfaces as a network failure.
    pub timeout: Option<Duration>,
    /// Maximum redirects.
    pub max_redirects: usize,
    /// Keep session cookies between requests.
    pub cookies_enabled: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("FinSync/{}", env!("CARGO_PKG_VERSION")),
            accept_language: "en-US,en;q=0.9".to_string(),
            timeout: None,
            max_redirects: 10,
            cookies_enabled: true,
        }
    }
}

/// Fetches over real HTTP.
pub struct HttpFetcher {
    client: Client,
    config: LoaderConfig,
}

impl HttpFetcher {
    /// Create a new fetcher.
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let mut builder = Client::builder()
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .cookie_store(config.cookies_enabled);

        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }

        let client = builder
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        debug!("HttpFetcher initialized");

        Ok(Self { client, config })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        debug!(url = %request.url, method = %request.method, "Fetching resource");

        let mut req_builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());

        if !request.headers.contains_key(http::header::ACCEPT_LANGUAGE) {
            req_builder = req_builder.header(http::header::ACCEPT_LANGUAGE, &self.config.accept_language);
        }

        if let Some(ref body) = request.body {
            req_builder = req_builder.body(body.clone());
        }

        let response = req_builder.send().await?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        trace!(
            url = %request.url,
            status = %status,
            body_len = body.len(),
            "Response received"
        );

        Ok(Response {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or("").to_string(),
            headers,
            body,
            source: ResponseSource::Network,
        })
    }
}
