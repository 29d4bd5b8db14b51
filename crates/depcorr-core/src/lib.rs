//! depcorr core - call records, header wire format, and configuration
//!
//! This crate provides the foundational types shared by the correlation engine:
//!
//! - **Records**: the dependency call record emitted once per logical call
//! - **Requests**: the capability interface instrumentation sources hand to the tracker
//! - **Headers**: the `Request-Context` / `Request-Id` wire format
//! - **Context**: ambient operation context and id generation
//! - **Sink**: where finished records go
//! - **Config** and **Metrics**

pub mod config;
pub mod context;
pub mod headers;
pub mod metrics;
pub mod record;
pub mod request;
pub mod sink;

// Re-export commonly used types
pub use config::{ConfigError, ConfigLoader, ConfigResult, SuccessPolicy, TrackerConfig};
pub use context::OperationContext;
pub use metrics::{create_metrics, SharedMetrics, TrackerMetrics};
pub use record::{CallRecord, DependencyKind};
pub use request::{HttpRequest, HttpResponse, OutboundRequest, RequestKey, ResourceCall};
pub use sink::{ChannelSink, MemorySink, TelemetrySink};

/// Crate version, stamped into every record's `sdk_version`
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
