//! Correlation header wire format
//!
//! `Request-Context` carries comma-separated `key=value` pairs. Outgoing
//! requests get our own identity under [`SOURCE_KEY`]; responses are read for
//! the callee's identity under [`TARGET_KEY`]. Identities are opaque strings
//! prefixed with [`CORRELATION_ID_PREFIX`].

use http::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::debug;

/// Header carrying component identities
pub const REQUEST_CONTEXT_HEADER: HeaderName = HeaderName::from_static("request-context");

/// Hierarchical request id of the outgoing call
pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("request-id");

/// Legacy parent id header
pub const PARENT_ID_HEADER: HeaderName = HeaderName::from_static("x-ms-request-id");

/// Legacy root (operation) id header
pub const ROOT_ID_HEADER: HeaderName = HeaderName::from_static("x-ms-request-root-id");

/// Ambient baggage
pub const CORRELATION_CONTEXT_HEADER: HeaderName = HeaderName::from_static("correlation-context");

/// Key under which the caller's identity is sent
pub const SOURCE_KEY: &str = "appId";

/// Key under which the callee reports its identity
pub const TARGET_KEY: &str = "appId";

/// Version tag on every correlation identity
pub const CORRELATION_ID_PREFIX: &str = "cid-v1:";

/// Format a raw application id as a correlation identity
pub fn format_correlation_id(raw: &str) -> String {
    format!("{}{}", CORRELATION_ID_PREFIX, raw)
}

/// Iterate the `key=value` pairs of a name/value header value
pub fn parse_name_values(value: &str) -> impl Iterator<Item = (&str, &str)> {
    value.split(',').filter_map(|pair| {
        let (key, val) = pair.split_once('=')?;
        let key = key.trim();
        if key.is_empty() {
            return None;
        }
        Some((key, val.trim()))
    })
}

/// Read `key` from a name/value header; the first non-empty match wins
pub fn get_name_value(headers: &HeaderMap, header: &HeaderName, key: &str) -> Option<String> {
    headers
        .get_all(header)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(parse_name_values)
        .find(|(k, v)| *k == key && !v.is_empty())
        .map(|(_, v)| v.to_string())
}

/// Set `key=value` on a name/value header
///
/// An existing header value is kept byte-for-byte and the pair is appended to
/// it. Returns `false` if the pair could not be encoded.
pub fn set_name_value(headers: &mut HeaderMap, header: HeaderName, key: &str, value: &str) -> bool {
    let combined = match headers.get(&header).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.trim().is_empty() => format!("{}, {}={}", existing, key, value),
        _ => format!("{}={}", key, value),
    };

    match HeaderValue::from_str(&combined) {
        Ok(v) => {
            headers.insert(header, v);
            true
        }
        Err(e) => {
            debug!("Cannot encode {} header: {}", header, e);
            false
        }
    }
}

/// Insert `value` under `header` only when the header is absent
///
/// Returns `true` if the header was added.
pub fn insert_if_absent(headers: &mut HeaderMap, header: HeaderName, value: &str) -> bool {
    if headers.contains_key(&header) {
        return false;
    }
    match HeaderValue::from_str(value) {
        Ok(v) => {
            headers.insert(header, v);
            true
        }
        Err(_) => false,
    }
}

/// Render baggage as a `Correlation-Context` value
pub fn format_baggage<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    pairs
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(", ")
}
