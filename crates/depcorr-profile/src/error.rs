//! Error types for the profile-query client

use depcorr_correlate::FetchError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProfileError {
    /// Network/HTTP error
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The configured endpoint cannot be used as a base URL
    #[error("Invalid profile endpoint: {0}")]
    InvalidEndpoint(String),

    /// No profile for this instrumentation key
    #[error("Profile not found: {0}")]
    NotFound(String),

    /// Rate limited by server
    #[error("Rate limited: retry after {0}s")]
    RateLimited(u64),

    /// Server error
    #[error("Server error: {status} - {message}")]
    Server { status: u16, message: String },

    /// The body was not a usable application id
    #[error("Invalid application id: {0:?}")]
    InvalidAppId(String),
}

/// Result type for profile queries
pub type ProfileResult<T> = Result<T, ProfileError>;

impl ProfileError {
    /// Check if this is a network-related error
    pub fn is_network_error(&self) -> bool {
        matches!(self, ProfileError::Network(_))
    }

    /// Check if the same query may succeed later
    pub fn is_retryable(&self) -> bool {
        match self {
            ProfileError::Network(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            ProfileError::RateLimited(_) => true,
            ProfileError::Server { status, .. } => *status >= 500,
            ProfileError::InvalidEndpoint(_)
            | ProfileError::NotFound(_)
            | ProfileError::InvalidAppId(_) => false,
        }
    }
}

impl From<ProfileError> for FetchError {
    fn from(e: ProfileError) -> Self {
        match e {
            ProfileError::NotFound(key) => FetchError::NotFound(key),
            ProfileError::InvalidAppId(body) => FetchError::Malformed(body),
            ProfileError::Network(e) if e.is_timeout() => FetchError::Timeout,
            other => FetchError::Network(other.to_string()),
        }
    }
}
