//! # sitecache net
//!
//! Request and response model shared by the offline worker and its hosts,
//! plus the [`Fetcher`] seam through which the worker reaches the network.
//!
//! ## Design Goals
//!
//! 1. **Cloneable responses**: bodies are [`Bytes`], so a response can be
//!    returned to the page and written to cache without re-reading it
//! 2. **Response typing**: every response carries a [`ResponseType`]; only
//!    same-origin (`Basic`) 200 responses are cacheable
//! 3. **Swappable network**: the worker only sees `dyn Fetcher`, tests script it

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{ACCEPT, CONTENT_TYPE};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use mime::Mime;
use thiserror::Error;
use url::Url;

pub mod loader;

pub use loader::{LoaderConfig, ResourceLoader};

pub use http;
pub use url;

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Network unreachable: {0}")]
    Offline(String),

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

/// Request mode, as reported by the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level document navigation.
    Navigate,
    /// Same-origin subresource.
    SameOrigin,
    /// Cross-origin with CORS.
    Cors,
    /// Cross-origin without CORS (opaque).
    #[default]
    NoCors,
}

/// HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub mode: RequestMode,
    pub body: Option<Bytes>,
}

impl Request {
    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            mode: RequestMode::NoCors,
            body: None,
        }
    }

    /// Create a POST request.
    pub fn post(url: Url, body: Bytes) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method: Method::POST,
            headers: HeaderMap::new(),
            mode: RequestMode::Cors,
            body: Some(body),
        }
    }

    /// Create a page navigation (GET, `Accept: text/html`).
    pub fn navigate(url: Url) -> Self {
        Self::get(url)
            .mode(RequestMode::Navigate)
            .header(ACCEPT, HeaderValue::from_static("text/html,application/xhtml+xml"))
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the `Accept` header. Invalid header text is ignored.
    pub fn accept(self, value: &str) -> Self {
        match HeaderValue::from_str(value) {
            Ok(value) => self.header(ACCEPT, value),
            Err(_) => self,
        }
    }

    /// Set the request mode.
    pub fn mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Whether this is a GET.
    pub fn is_get(&self) -> bool {
        self.method == Method::GET
    }

    /// Whether the `Accept` header mentions `needle` (e.g. `"image"`).
    pub fn accepts(&self, needle: &str) -> bool {
        self.headers
            .get_all(ACCEPT)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|v| v.contains(needle))
    }
}

/// How a response relates to the requesting origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseType {
    /// Same-origin, fully readable.
    #[default]
    Basic,
    /// Cross-origin with CORS.
    Cors,
    /// Cross-origin without CORS.
    Opaque,
    /// Network error placeholder.
    Error,
}

/// HTTP response.
#[derive(Debug, Clone)]
pub struct Response {
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub response_type: ResponseType,
    body: Bytes,
}

impl Response {
    /// Create a same-origin response.
    pub fn new(url: Url, status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            url,
            status,
            headers: HeaderMap::new(),
            response_type: ResponseType::Basic,
            body: body.into(),
        }
    }

    /// Create a network error response.
    pub fn error(url: Url) -> Self {
        Self {
            url,
            // http has no status 0
            status: StatusCode::SERVICE_UNAVAILABLE,
            headers: HeaderMap::new(),
            response_type: ResponseType::Error,
            body: Bytes::new(),
        }
    }

    /// Add a header.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the `Content-Type` header. Invalid header text is ignored.
    pub fn with_content_type(self, content_type: &str) -> Self {
        match HeaderValue::from_str(content_type) {
            Ok(value) => self.with_header(CONTENT_TYPE, value),
            Err(_) => self,
        }
    }

    /// Set the response type.
    pub fn with_type(mut self, response_type: ResponseType) -> Self {
        self.response_type = response_type;
        self
    }

    /// Check if request was successful (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Only a plain 200 from the site's own origin may be stored.
    pub fn is_cacheable(&self) -> bool {
        self.status == StatusCode::OK && self.response_type == ResponseType::Basic
    }

    /// Get a header value as a string.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Parsed `Content-Type`.
    pub fn content_type(&self) -> Option<Mime> {
        self.header(CONTENT_TYPE.as_str())
            .and_then(|s| s.parse::<Mime>().ok())
    }

    /// Borrow the body.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Get the body as bytes.
    pub fn bytes(self) -> Bytes {
        self.body
    }

    /// Get the body as text.
    pub fn text(&self) -> Result<String, NetError> {
        String::from_utf8(self.body.to_vec()).map_err(|e| NetError::RequestFailed(e.to_string()))
    }

    /// Get the body as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, NetError> {
        serde_json::from_slice(&self.body).map_err(|e| NetError::RequestFailed(e.to_string()))
    }
}

/// The worker's only way out to the network.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Perform the request. A non-2xx status is a response, not an error.
    async fn fetch(&self, request: &Request) -> Result<Response, NetError>;
}
