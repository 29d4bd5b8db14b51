//! Request capability interface
//!
//! Instrumentation sources observe differently-shaped request objects. The
//! tracker only needs a stable identity, a URL, an optional method, and (when
//! the source can mutate the outgoing request) its headers.

use http::HeaderMap;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_KEY: AtomicU64 = AtomicU64::new(1);

/// Stable identity of an outbound request object for its lifetime
///
/// Two logically different calls never share a key while both are pending.
/// A key may be reused only after the call that held it has terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RequestKey(u64);

impl RequestKey {
    /// Allocate a fresh process-unique key
    pub fn next() -> Self {
        Self(NEXT_KEY.fetch_add(1, Ordering::Relaxed))
    }

    /// Wrap an id supplied by an instrumentation source
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the tracker needs from a request at Begin
pub trait OutboundRequest {
    /// Identity of the request object
    fn key(&self) -> RequestKey;

    /// HTTP method, when the source knows it
    fn method(&self) -> Option<&str> {
        None
    }

    /// Absolute URL or resource string
    fn url(&self) -> &str;

    /// Outgoing headers, when the source may inject correlation headers
    fn headers_mut(&mut self) -> Option<&mut HeaderMap> {
        None
    }
}

/// An outbound HTTP request observed by a source that can mutate it
#[derive(Debug, Clone)]
pub struct HttpRequest {
    key: RequestKey,
    pub method: String,
    pub url: String,
    pub headers: HeaderMap,
}

impl HttpRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            key: RequestKey::next(),
            method: method.into(),
            url: url.into(),
            headers: HeaderMap::new(),
        }
    }

    /// `GET` request to `url`
    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url)
    }

    pub fn key(&self) -> RequestKey {
        self.key
    }
}

impl OutboundRequest for HttpRequest {
    fn key(&self) -> RequestKey {
        self.key
    }

    fn method(&self) -> Option<&str> {
        Some(&self.method)
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn headers_mut(&mut self) -> Option<&mut HeaderMap> {
        Some(&mut self.headers)
    }
}

/// The response side of an HTTP call
#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
        }
    }

    pub fn with_header(mut self, name: &'static str, value: &str) -> Self {
        if let Ok(value) = value.parse() {
            self.headers.insert(name, value);
        }
        self
    }
}

/// A call reported only by id and resource name (event-based sources)
///
/// Such sources cannot touch the outgoing request, so no headers are injected.
#[derive(Debug, Clone)]
pub struct ResourceCall<'a> {
    pub key: RequestKey,
    pub resource_name: &'a str,
}

impl OutboundRequest for ResourceCall<'_> {
    fn key(&self) -> RequestKey {
        self.key
    }

    fn url(&self) -> &str {
        self.resource_name
    }
}
