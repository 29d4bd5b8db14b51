//! Dependency call records
//!
//! A [`CallRecord`] is created when an instrumentation source reports the start
//! of an outbound call and finalized exactly once when the call ends.

use crate::request::RequestKey;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

/// Kind of dependency call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    Http,
    Sql,
    Other(String),
}

impl DependencyKind {
    pub fn as_str(&self) -> &str {
        match self {
            DependencyKind::Http => "Http",
            DependencyKind::Sql => "SQL",
            DependencyKind::Other(kind) => kind,
        }
    }
}

/// One in-flight or completed dependency call
#[derive(Debug, Clone, Serialize)]
pub struct CallRecord {
    /// Identity of the underlying request object
    pub request_key: RequestKey,

    /// Dependency id; sent to the callee as its parent id
    pub id: String,

    /// Root id of the trace this call belongs to
    pub operation_id: String,

    /// Id of the ambient operation the call is nested under
    pub parent_id: Option<String>,

    /// Call type
    pub kind: DependencyKind,

    /// Display name, e.g. `GET /orders`
    pub name: String,

    /// Remote target, optionally annotated with the callee's correlation id
    pub target: String,

    /// Full request descriptor (the URL for HTTP calls)
    pub data: String,

    /// Wall-clock start time
    pub timestamp: DateTime<Utc>,

    /// Monotonic start time
    #[serde(skip)]
    pub started_at: Instant,

    /// Duration in milliseconds (set at End)
    pub duration_ms: Option<u64>,

    /// Outcome (set at End)
    pub success: Option<bool>,

    /// Status code as text; empty when the call produced no response
    pub result_code: Option<String>,

    /// Which instrumentation source produced this record, e.g. `rdddsd:0.1.0`
    pub sdk_version: String,
}

impl CallRecord {
    /// Start a new record at the current instant
    pub fn begin(request_key: RequestKey, kind: DependencyKind) -> Self {
        Self {
            request_key,
            id: String::new(),
            operation_id: String::new(),
            parent_id: None,
            kind,
            name: String::new(),
            target: String::new(),
            data: String::new(),
            timestamp: Utc::now(),
            started_at: Instant::now(),
            duration_ms: None,
            success: None,
            result_code: None,
            sdk_version: String::new(),
        }
    }

    /// Finalize the outcome and duration
    pub fn complete(&mut self, success: bool, result_code: Option<String>) {
        self.duration_ms = Some(self.started_at.elapsed().as_millis() as u64);
        self.success = Some(success);
        self.result_code = result_code;
    }

    /// Whether End has been applied
    pub fn is_complete(&self) -> bool {
        self.success.is_some()
    }

    /// Append a resolved correlation id to the target: `"<host> | <id>"`
    pub fn annotate_target(&mut self, correlation_id: &str) {
        self.target = format!("{} | {}", self.target, correlation_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_complete_sets_duration() {
        let mut record = CallRecord::begin(RequestKey::from_raw(7), DependencyKind::Http);
        assert!(!record.is_complete());

        tokio::time::advance(Duration::from_millis(120)).await;
        record.complete(true, Some("200".to_string()));

        assert!(record.is_complete());
        assert_eq!(record.duration_ms, Some(120));
        assert_eq!(record.result_code.as_deref(), Some("200"));
    }

    #[test]
    fn test_annotate_target() {
        let mut record = CallRecord::begin(RequestKey::from_raw(1), DependencyKind::Http);
        record.target = "api.example.com".to_string();
        record.annotate_target("cid-v1:abc");
        assert_eq!(record.target, "api.example.com | cid-v1:abc");
    }

    #[test]
    fn test_serialize_skips_monotonic_clock() {
        let record = CallRecord::begin(RequestKey::from_raw(3), DependencyKind::Sql);
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("started_at").is_none());
        assert_eq!(json["kind"], "sql");
        assert_eq!(json["request_key"], 3);
    }
}
