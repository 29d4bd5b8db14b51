//! Ambient operation context and id generation
//!
//! An [`OperationContext`] is the logical operation (typically the inbound
//! request being served) that outbound calls are nested under. Ids follow the
//! hierarchical `Request-Id` scheme: a root is `|<root>.` and every dependency
//! appends a random suffix terminated by `_`. Calls made outside any operation
//! get a compact id: 8 random bytes, base64 encoded, with no separators.

use crate::headers;
use base64::prelude::*;
use std::future::Future;
use uuid::Uuid;

tokio::task_local! {
    static CURRENT: OperationContext;
}

/// The currently active logical operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationContext {
    /// Root id of the trace
    pub operation_id: String,

    /// Hierarchical id of this operation
    pub id: String,

    /// Operation name
    pub name: Option<String>,

    /// Baggage propagated to callees via `Correlation-Context`
    pub baggage: Vec<(String, String)>,
}

impl OperationContext {
    /// Start a new trace
    pub fn new_root(name: impl Into<String>) -> Self {
        let operation_id = Uuid::new_v4().simple().to_string();
        Self {
            id: format!("|{}.", operation_id),
            operation_id,
            name: Some(name.into()),
            baggage: Vec::new(),
        }
    }

    /// Continue a trace from an incoming `Request-Id`
    ///
    /// Ids without hierarchy markers are wrapped so that children stay
    /// well-formed.
    pub fn from_request_id(request_id: &str) -> Option<Self> {
        let request_id = request_id.trim();
        if request_id.is_empty() {
            return None;
        }

        let id = if request_id.starts_with('|') {
            if request_id.ends_with('.') || request_id.ends_with('_') {
                request_id.to_string()
            } else {
                format!("{}.", request_id)
            }
        } else {
            format!("|{}.", request_id)
        };

        Some(Self {
            operation_id: root_id(&id).to_string(),
            id,
            name: None,
            baggage: Vec::new(),
        })
    }

    /// A nested operation within this one
    pub fn child(&self, name: impl Into<String>) -> Self {
        Self {
            operation_id: self.operation_id.clone(),
            id: dependency_id(&self.id),
            name: Some(name.into()),
            baggage: self.baggage.clone(),
        }
    }

    pub fn with_baggage(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.baggage.push((key.into(), value.into()));
        self
    }

    /// `Correlation-Context` value for this operation's baggage
    pub fn baggage_header(&self) -> Option<String> {
        if self.baggage.is_empty() {
            return None;
        }
        Some(headers::format_baggage(
            self.baggage.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        ))
    }

    /// Run `fut` with this context as the ambient operation
    pub async fn scope<F: Future>(self, fut: F) -> F::Output {
        CURRENT.scope(self, fut).await
    }

    /// The ambient operation of the current task, if any
    pub fn current() -> Option<Self> {
        CURRENT.try_with(|ctx| ctx.clone()).ok()
    }
}

/// Id for a dependency nested under `parent_id`
pub fn dependency_id(parent_id: &str) -> String {
    let bytes = Uuid::new_v4().into_bytes();
    let suffix = hex::encode(&bytes[..4]);

    if parent_id.starts_with('|') && (parent_id.ends_with('.') || parent_id.ends_with('_')) {
        format!("{}{}_", parent_id, suffix)
    } else {
        format!("|{}.{}_", parent_id, suffix)
    }
}

/// Compact 8-byte id for calls made outside any operation
pub fn compact_id() -> String {
    let bytes = Uuid::new_v4().into_bytes();
    BASE64_STANDARD.encode(&bytes[..8])
}

/// Root portion of a hierarchical id: `|abc.1_` -> `abc`
pub fn root_id(id: &str) -> &str {
    let trimmed = id.strip_prefix('|').unwrap_or(id);
    match trimmed.find('.') {
        Some(end) => &trimmed[..end],
        None => trimmed.trim_end_matches('_'),
    }
}
