//! HTTP client for the profile-query endpoint
//!
//! `GET {endpoint}/api/profiles/{instrumentation_key}/appId` answers with the
//! bare application id as plain text.

use crate::error::{ProfileError, ProfileResult};
use async_trait::async_trait;
use depcorr_core::headers::format_correlation_id;
use depcorr_correlate::{CorrelationIdFetcher, FetchError};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Longest application id accepted from the endpoint
const MAX_APP_ID_LEN: usize = 50;

/// Profile-query client
pub struct ProfileClient {
    client: Client,
    base_url: Url,
}

impl ProfileClient {
    /// Create a new client for `endpoint`
    pub fn new(endpoint: &str, timeout: Duration) -> ProfileResult<Self> {
        let base_url = Url::parse(endpoint.trim())
            .map_err(|e| ProfileError::InvalidEndpoint(format!("{}: {}", endpoint, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(ProfileError::InvalidEndpoint(endpoint.to_string()));
        }

        let client = Client::builder()
            .timeout(timeout)
            .user_agent(format!("depcorr/{}", env!("CARGO_PKG_VERSION")))
            .gzip(true)
            .build()?;

        Ok(Self { client, base_url })
    }

    /// URL of the profile query for `instrumentation_key`
    pub fn app_id_url(&self, instrumentation_key: &str) -> ProfileResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ProfileError::InvalidEndpoint(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(["api", "profiles", instrumentation_key, "appId"]);
        Ok(url)
    }

    /// Fetch the application id registered for `instrumentation_key`
    pub async fn fetch_app_id(&self, instrumentation_key: &str) -> ProfileResult<String> {
        let url = self.app_id_url(instrumentation_key)?;
        debug!("Querying application id: {}", url);

        let response = self.client.get(url).send().await?;
        let status = response.status();

        match status {
            StatusCode::OK => {
                let body = response.text().await?;
                validate_app_id(body.trim())
            }
            StatusCode::NOT_FOUND => Err(ProfileError::NotFound(instrumentation_key.to_string())),
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(60);
                warn!("Profile query rate limited, retry after {}s", retry_after);
                Err(ProfileError::RateLimited(retry_after))
            }
            _ => {
                let message = response.text().await.unwrap_or_default();
                if status.is_server_error() {
                    warn!("Profile query server error {}: {}", status, message);
                }
                Err(ProfileError::Server {
                    status: status.as_u16(),
                    message,
                })
            }
        }
    }
}

/// Accept only ids that are short and made of letters, digits, and dashes
fn validate_app_id(body: &str) -> ProfileResult<String> {
    let valid = !body.is_empty()
        && body.len() <= MAX_APP_ID_LEN
        && body.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
    if valid {
        Ok(body.to_string())
    } else {
        Err(ProfileError::InvalidAppId(body.to_string()))
    }
}

#[async_trait]
impl CorrelationIdFetcher for ProfileClient {
    async fn fetch(&self, endpoint: &str) -> Result<String, FetchError> {
        let app_id = self.fetch_app_id(endpoint).await?;
        Ok(format_correlation_id(&app_id))
    }
}
