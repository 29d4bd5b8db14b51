//! Error types for the correlation engine
//!
//! None of these ever reach the instrumented application; the tracker logs
//! them at the hook boundary and drops the affected call.

use thiserror::Error;

/// Errors raised while handling a Begin or End notification
#[derive(Debug, Error)]
pub enum TrackError {
    /// The call's URL or resource string could not be parsed
    #[error("Invalid URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// An event-based source reported a call without a resource name
    #[error("Empty resource name for request {0}")]
    EmptyResource(u64),

    /// A SQL command reported neither a data source nor a database
    #[error("No data source or database for SQL request {0}")]
    MissingSqlTarget(u64),

    /// Hook code panicked
    #[error("Hook panicked: {0}")]
    Panicked(String),
}

/// Result type for tracker operations
pub type TrackResult<T> = Result<T, TrackError>;

impl TrackError {
    pub(crate) fn invalid_url(url: &str, reason: impl ToString) -> Self {
        TrackError::InvalidUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Render a caught panic payload
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        TrackError::Panicked(message)
    }
}
