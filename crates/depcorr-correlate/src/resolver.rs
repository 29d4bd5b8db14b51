//! Correlation id resolution
//!
//! Maps an endpoint (an instrumentation key or a target host) to the opaque
//! correlation identity of the component behind it. Lookups are best-effort:
//!
//! - a resolved identity is cached for the life of the process
//! - a failed lookup is cached for the backoff window and answers `None`
//! - at most one fetch per endpoint is in flight; concurrent callers await it
//!
//! The fetch runs on its own task under a timeout, so a caller that gives up
//! waiting never leaves the endpoint stuck in flight.

use async_trait::async_trait;
use depcorr_core::metrics::{incr, SharedMetrics};
use futures_util::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Why a correlation id could not be fetched
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("No correlation id registered for {0}")]
    NotFound(String),

    #[error("Malformed correlation id: {0:?}")]
    Malformed(String),

    #[error("Correlation id fetch timed out")]
    Timeout,

    #[error("Correlation id fetch panicked")]
    Panicked,
}

/// The external service that knows each endpoint's correlation identity
#[async_trait]
pub trait CorrelationIdFetcher: Send + Sync {
    /// Fetch the full identity (including its version prefix) for `endpoint`
    async fn fetch(&self, endpoint: &str) -> Result<String, FetchError>;
}

/// Observable state of one endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionState {
    Resolved(String),
    Failed { until: Instant },
    InFlight,
}

/// `None` while the fetch runs, `Some(outcome)` once it finished
type FetchOutcome = Option<Option<String>>;

enum Slot {
    Resolved(String),
    Failed(Instant),
    InFlight(watch::Receiver<FetchOutcome>),
}

enum Lookup {
    Ready(Option<String>),
    /// A fetch was already in flight
    Joined(watch::Receiver<FetchOutcome>),
    /// This lookup started the fetch
    Started(watch::Receiver<FetchOutcome>),
}

struct Inner {
    fetcher: Arc<dyn CorrelationIdFetcher>,
    slots: Mutex<HashMap<String, Slot>>,
    failure_backoff: Duration,
    fetch_timeout: Duration,
    metrics: SharedMetrics,
}

/// Shared handle to the resolution cache
#[derive(Clone)]
pub struct CorrelationIdResolver {
    inner: Arc<Inner>,
}

fn normalize(endpoint: &str) -> String {
    endpoint.trim().to_ascii_lowercase()
}

/// An identity must survive being embedded in a `key=value` header list
fn is_valid_correlation_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_graphic() && c != ',' && c != '=' && c != ';')
}

impl CorrelationIdResolver {
    pub fn new(
        fetcher: Arc<dyn CorrelationIdFetcher>,
        failure_backoff: Duration,
        fetch_timeout: Duration,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                fetcher,
                slots: Mutex::new(HashMap::new()),
                failure_backoff,
                fetch_timeout,
                metrics,
            }),
        }
    }

    /// Resolve `endpoint`, awaiting an outstanding fetch if there is one
    pub async fn resolve(&self, endpoint: &str) -> Option<String> {
        let key = normalize(endpoint);
        if key.is_empty() {
            return None;
        }

        match self.lookup(key.clone()) {
            Lookup::Ready(id) => id,
            Lookup::Joined(rx) => {
                incr(&self.inner.metrics.resolver.coalesced);
                self.wait(&key, rx).await
            }
            Lookup::Started(rx) => self.wait(&key, rx).await,
        }
    }

    async fn wait(&self, key: &str, mut rx: watch::Receiver<FetchOutcome>) -> Option<String> {
        if let Ok(outcome) = rx.wait_for(|outcome| outcome.is_some()).await {
            return (*outcome).clone().flatten();
        }

        // The fetch task was dropped without reporting; retry after the backoff
        let mut slots = self.inner.slots.lock();
        if let Some(Slot::InFlight(current)) = slots.get(key) {
            if current.same_channel(&rx) {
                incr(&self.inner.metrics.resolver.fetch_failures);
                warn!("Correlation id fetch for {} was abandoned", key);
                let until = Instant::now() + self.inner.failure_backoff;
                slots.insert(key.to_string(), Slot::Failed(until));
            }
        }
        None
    }

    /// Non-suspending lookup
    ///
    /// Returns a cached identity if there is one. Otherwise starts a background
    /// fetch (when called inside a Tokio runtime) and returns `None`.
    pub fn try_resolve(&self, endpoint: &str) -> Option<String> {
        let key = normalize(endpoint);
        if key.is_empty() {
            return None;
        }

        match self.lookup(key) {
            Lookup::Ready(id) => id,
            Lookup::Joined(_) | Lookup::Started(_) => None,
        }
    }

    /// The resolved identity, without ever fetching
    pub fn cached(&self, endpoint: &str) -> Option<String> {
        match self.inner.slots.lock().get(&normalize(endpoint)) {
            Some(Slot::Resolved(id)) => Some(id.clone()),
            _ => None,
        }
    }

    pub fn state(&self, endpoint: &str) -> Option<ResolutionState> {
        let slots = self.inner.slots.lock();
        slots.get(&normalize(endpoint)).map(|slot| match slot {
            Slot::Resolved(id) => ResolutionState::Resolved(id.clone()),
            Slot::Failed(until) => ResolutionState::Failed { until: *until },
            Slot::InFlight(_) => ResolutionState::InFlight,
        })
    }

    /// Seed a known identity
    pub fn prime(&self, endpoint: &str, correlation_id: impl Into<String>) {
        let key = normalize(endpoint);
        if key.is_empty() {
            return;
        }
        self.inner
            .slots
            .lock()
            .insert(key, Slot::Resolved(correlation_id.into()));
    }

    /// Check the cache and, when needed, start exactly one fetch
    fn lookup(&self, key: String) -> Lookup {
        let mut slots = self.inner.slots.lock();

        match slots.get(&key) {
            Some(Slot::Resolved(id)) => return Lookup::Ready(Some(id.clone())),
            Some(Slot::Failed(until)) if Instant::now() < *until => {
                incr(&self.inner.metrics.resolver.backoff_skips);
                return Lookup::Ready(None);
            }
            Some(Slot::InFlight(rx)) => return Lookup::Joined(rx.clone()),
            _ => {}
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                debug!("No runtime available to resolve {}", key);
                return Lookup::Ready(None);
            }
        };

        let (tx, rx) = watch::channel(None);
        slots.insert(key.clone(), Slot::InFlight(rx.clone()));
        drop(slots);

        runtime.spawn(Self::run_fetch(Arc::clone(&self.inner), key, tx));
        Lookup::Started(rx)
    }

    async fn run_fetch(inner: Arc<Inner>, key: String, tx: watch::Sender<FetchOutcome>) {
        incr(&inner.metrics.resolver.fetches);
        debug!("Fetching correlation id for {}", key);

        let fetch = tokio::time::timeout(inner.fetch_timeout, inner.fetcher.fetch(&key));
        let result = match AssertUnwindSafe(fetch).catch_unwind().await {
            Ok(Ok(Ok(id))) if is_valid_correlation_id(&id) => Ok(id),
            Ok(Ok(Ok(id))) => Err(FetchError::Malformed(id)),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(FetchError::Timeout),
            Err(_) => Err(FetchError::Panicked),
        };

        let resolved = match result {
            Ok(id) => {
                info!("Resolved correlation id for {}: {}", key, id);
                inner
                    .slots
                    .lock()
                    .insert(key, Slot::Resolved(id.clone()));
                Some(id)
            }
            Err(e) => {
                incr(&inner.metrics.resolver.fetch_failures);
                warn!(
                    "Correlation id lookup for {} failed, retrying after {}s: {}",
                    key,
                    inner.failure_backoff.as_secs(),
                    e
                );
                let until = Instant::now() + inner.failure_backoff;
                inner.slots.lock().insert(key, Slot::Failed(until));
                None
            }
        };

        // Waiters may all have gone away
        let _ = tx.send(Some(resolved));
    }
}
