//! # FinSync Net
//!
//! Request/response model shared by every FinSync component, the `Fetcher`
//! seam the worker reaches the network through, and the response
//! classification all strategies agree on.
//!
//! ## Design Goals
//!
//! 1. **One notion of success**: `classify_response` decides what counts as a
//!    network success (2xx) for every strategy and for queue replay
//! 2. **Injectable network**: strategies hold an `Arc<dyn Fetcher>`, so tests
//!    swap in scripted fakes
//! 3. **Snapshots**: responses carry their full body so they can be cached and
//!    replayed byte-for-byte

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::de::DeserializeOwned;
use thiserror::Error;
use url::Url;

pub mod loader;

pub use loader::{HttpFetcher, LoaderConfig};

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid body: {0}")]
    InvalidBody(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// What the page intends to do with the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Destination {
    /// Top-level navigation.
    Document,
    Script,
    Style,
    Image,
    Font,
    Manifest,
    /// `fetch()` / XHR.
    #[default]
    Empty,
}

/// An intercepted HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub destination: Destination,
}

impl Request {
    /// Create a request with an explicit method.
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method,
            headers: HeaderMap::new(),
            body: None,
            destination: Destination::Empty,
        }
    }

    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// Create a top-level navigation request.
    pub fn navigate(url: Url) -> Self {
        Self::get(url).destination(Destination::Document)
    }

    /// Parse a URL and build a request from it.
    pub fn parse(method: Method, url: &str) -> Result<Self, NetError> {
        let url = Url::parse(url).map_err(|e| NetError::InvalidUrl(e.to_string()))?;
        Ok(Self::new(method, url))
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the body.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Set the destination.
    pub fn destination(mut self, destination: Destination) -> Self {
        self.destination = destination;
        self
    }

    /// Whether the scheme is one the worker handles.
    pub fn is_http(&self) -> bool {
        matches!(self.url.scheme(), "http" | "https")
    }

    /// URL path without query or fragment.
    pub fn path(&self) -> &str {
        self.url.path()
    }

    /// Whether the method changes server state.
    pub fn is_mutation(&self) -> bool {
        self.method == Method::POST || self.method == Method::PUT || self.method == Method::DELETE
    }

    /// Headers flattened to a name → value map. Values that are not visible
    /// ASCII are skipped; repeated headers keep the last value.
    pub fn header_pairs(&self) -> BTreeMap<String, String> {
        flatten_headers(&self.headers)
    }

    /// Body decoded as UTF-8 text.
    pub fn body_text(&self) -> Result<Option<String>, NetError> {
        match self.body {
            Some(ref body) => String::from_utf8(body.to_vec())
                .map(Some)
                .map_err(|e| NetError::InvalidBody(e.to_string())),
            None => Ok(None),
        }
    }
}

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseSource {
    #[default]
    Network,
    Cache,
    LocalStore,
    Synthesized,
}

/// An HTTP response snapshot.
#[derive(Debug, Clone)]
pub struct Response {
    /// Status code; 0 for a network error.
    pub status: u16,
    pub status_text: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub source: ResponseSource,
}

impl Response {
    /// Create a response.
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            status_text: reason_phrase(status).to_string(),
            headers: HeaderMap::new(),
            body: body.into(),
            source: ResponseSource::Network,
        }
    }

    /// Synthesize a JSON response.
    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        let mut response = Self::new(status, value.to_string());
        response.headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        response.source = ResponseSource::Synthesized;
        response
    }

    /// Synthesize a plain-text response.
    pub fn text(status: u16, body: &str) -> Self {
        let mut response = Self::new(status, body.to_string());
        response.headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain"),
        );
        response.source = ResponseSource::Synthesized;
        response
    }

    /// The response a page sees when the fetch itself fails.
    pub fn network_error() -> Self {
        Self {
            status: 0,
            status_text: "Network Error".to_string(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            source: ResponseSource::Synthesized,
        }
    }

    /// Check if this is a network error response.
    pub fn is_network_error(&self) -> bool {
        self.status == 0
    }

    /// Check if request was successful (2xx).
    pub fn ok(&self) -> bool {
        classify_response(self.status) == ResponseClass::Success
    }

    /// Add a header.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the source.
    pub fn with_source(mut self, source: ResponseSource) -> Self {
        self.source = source;
        self
    }

    /// Get a header value as a string.
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Get the body as text.
    pub fn text_body(&self) -> Result<String, NetError> {
        String::from_utf8(self.body.to_vec()).map_err(|e| NetError::InvalidBody(e.to_string()))
    }

    /// Parse the body as JSON.
    pub fn json_body<T: DeserializeOwned>(&self) -> Result<T, NetError> {
        serde_json::from_slice(&self.body).map_err(|e| NetError::InvalidBody(e.to_string()))
    }
}

/// Outcome of a network response as far as the fallback chains care.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    Success,
    Failure,
}

/// Only 2xx counts as success; every other status takes the offline path.
pub fn classify_response(status: u16) -> ResponseClass {
    if (200..300).contains(&status) {
        ResponseClass::Success
    } else {
        ResponseClass::Failure
    }
}

/// The worker's only way to reach the network.
#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
    /// Perform the request. `Err` means the request never produced a
    /// response (offline, DNS, refused, timed out).
    async fn fetch(&self, request: &Request) -> Result<Response, NetError>;
}

/// Flatten a header map into name → value pairs.
pub fn flatten_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

/// Rebuild a header map from flattened pairs, dropping invalid entries.
pub fn headers_from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a String, &'a String)>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        if let (Ok(n), Ok(v)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            headers.insert(n, v);
        }
    }
    headers
}

fn reason_phrase(status: u16) -> &'static str {
    http::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("")
}
