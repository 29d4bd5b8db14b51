//! Begin/End correlation for outbound dependency calls
//!
//! - [`CorrelationCache`]: pending calls keyed by request identity, with an
//!   atomic take that guarantees at most one record per logical call
//! - [`CorrelationIdResolver`]: endpoint to correlation identity, coalescing
//!   concurrent lookups and backing off after failures
//! - [`DependencyTracker`]: the Begin -> End -> emit state machine
//! - [`sources`]: adapters for the instrumentation sources that drive it
//! - [`DependencyTrackingModule`]: wiring and lifecycle

pub mod cache;
pub mod error;
pub mod filter;
pub mod module;
pub mod resolver;
pub mod sources;
pub mod tracker;

pub use cache::{CorrelationCache, Pending, Take};
pub use error::{TrackError, TrackResult};
pub use filter::{IngestionUrlFilter, SanitizedHostList};
pub use module::{DependencyTrackingModule, InstrumentationMode};
pub use resolver::{
    CorrelationIdFetcher, CorrelationIdResolver, FetchError, ResolutionState,
};
pub use sources::{DiagnosticSourceHttp, FrameworkEventHttp, ProfilerHttp, SqlCommandEvents};
pub use tracker::{BeginOutcome, DependencyTracker, EndOutcome, SourceKind};
