//! Instrumentation source adapters
//!
//! Each adapter translates one source's callbacks into tracker Begin/End
//! notifications. Sources can overlap on the same physical call; the tracker
//! guarantees a single record regardless of which adapter gets there first.

use crate::error::TrackError;
use crate::tracker::{BeginOutcome, DependencyTracker, EndOutcome, SourceKind};
use depcorr_core::metrics::incr;
use depcorr_core::{HttpRequest, HttpResponse, OperationContext, RequestKey, ResourceCall};
use std::sync::Arc;
use tracing::{debug, warn};

/// HTTP diagnostic source events
///
/// Sees the outgoing request before it is sent, so it can inject headers, and
/// the full response including its `Request-Context`.
#[derive(Clone)]
pub struct DiagnosticSourceHttp {
    tracker: Arc<DependencyTracker>,
}

impl DiagnosticSourceHttp {
    pub fn new(tracker: Arc<DependencyTracker>) -> Self {
        Self { tracker }
    }

    pub fn on_request_send(
        &self,
        request: &mut HttpRequest,
        ambient: Option<&OperationContext>,
    ) -> BeginOutcome {
        self.tracker.mark_diagnostic_source_active();
        self.tracker
            .on_begin(SourceKind::DiagnosticSource, request, ambient)
    }

    pub async fn on_response_receive(
        &self,
        request: &HttpRequest,
        response: &HttpResponse,
    ) -> EndOutcome {
        self.tracker
            .on_end(
                request.key(),
                None,
                Some(i32::from(response.status)),
                Some(&response.headers),
            )
            .await
    }
}

/// Framework event callbacks
///
/// Events carry only an id and a resource name. Begin is skipped while the
/// diagnostic source is delivering the same calls with richer data.
#[derive(Clone)]
pub struct FrameworkEventHttp {
    tracker: Arc<DependencyTracker>,
}

impl FrameworkEventHttp {
    pub fn new(tracker: Arc<DependencyTracker>) -> Self {
        Self { tracker }
    }

    pub fn on_begin_http_callback(
        &self,
        key: RequestKey,
        resource_name: &str,
        ambient: Option<&OperationContext>,
    ) -> BeginOutcome {
        if self.tracker.is_diagnostic_source_active() {
            debug!("Diagnostic source active, skipping framework Begin for {}", key);
            return BeginOutcome::Skipped;
        }

        if resource_name.trim().is_empty() {
            incr(&self.tracker.metrics().calls.begins_rejected);
            warn!("{}", TrackError::EmptyResource(key.as_u64()));
            return BeginOutcome::Rejected;
        }

        // Framework events fire more than once per call; never restart one
        if self.tracker.cache().get(key).is_some() {
            incr(&self.tracker.metrics().calls.begins_duplicate);
            debug!("Request {} already tracked, ignoring framework Begin", key);
            return BeginOutcome::Duplicate;
        }

        let mut call = ResourceCall { key, resource_name };
        self.tracker.on_begin(SourceKind::Framework, &mut call, ambient)
    }

    pub async fn on_end_http_callback(
        &self,
        key: RequestKey,
        success: Option<bool>,
        synchronous: bool,
        status_code: Option<i32>,
    ) -> EndOutcome {
        debug!(
            "Framework End for {} (synchronous={}, status={:?})",
            key, synchronous, status_code
        );
        self.tracker.on_end(key, success, status_code, None).await
    }
}

/// Runtime profiler callbacks around request send and response read
#[derive(Clone)]
pub struct ProfilerHttp {
    tracker: Arc<DependencyTracker>,
}

impl ProfilerHttp {
    pub fn new(tracker: Arc<DependencyTracker>) -> Self {
        Self { tracker }
    }

    pub fn on_begin(
        &self,
        request: &mut HttpRequest,
        ambient: Option<&OperationContext>,
    ) -> BeginOutcome {
        self.tracker.on_begin(SourceKind::Profiler, request, ambient)
    }

    /// `response` is `None` when the call failed without one
    pub async fn on_end(&self, request: &HttpRequest, response: Option<&HttpResponse>) -> EndOutcome {
        match response {
            Some(response) => {
                self.tracker
                    .on_end(
                        request.key(),
                        None,
                        Some(i32::from(response.status)),
                        Some(&response.headers),
                    )
                    .await
            }
            None => self.tracker.on_end(request.key(), Some(false), None, None).await,
        }
    }
}

/// SQL command execution callbacks
///
/// Fed by whichever source is active, the runtime profiler or framework
/// events; records are stamped with that source.
#[derive(Clone)]
pub struct SqlCommandEvents {
    tracker: Arc<DependencyTracker>,
    source: SourceKind,
}

impl SqlCommandEvents {
    pub fn new(tracker: Arc<DependencyTracker>, source: SourceKind) -> Self {
        Self { tracker, source }
    }

    pub fn source(&self) -> SourceKind {
        self.source
    }

    pub fn on_begin_execute(
        &self,
        key: RequestKey,
        data_source: &str,
        database: &str,
        command_text: &str,
        ambient: Option<&OperationContext>,
    ) -> BeginOutcome {
        self.tracker
            .on_begin_sql(self.source, key, data_source, database, command_text, ambient)
    }

    /// `error_number` is `0` unless the server raised an error
    pub fn on_end_execute(&self, key: RequestKey, success: bool, error_number: i32) -> EndOutcome {
        self.tracker.on_end_sql(key, success, error_number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CorrelationCache;
    use crate::resolver::{CorrelationIdFetcher, CorrelationIdResolver, FetchError};
    use async_trait::async_trait;
    use depcorr_core::{create_metrics, MemorySink, TrackerConfig};

    struct NoFetcher;

    #[async_trait]
    impl CorrelationIdFetcher for NoFetcher {
        async fn fetch(&self, endpoint: &str) -> Result<String, FetchError> {
            Err(FetchError::NotFound(endpoint.to_string()))
        }
    }

    fn setup() -> (Arc<DependencyTracker>, Arc<MemorySink>) {
        let config = TrackerConfig::default();
        let metrics = create_metrics();
        let cache = Arc::new(CorrelationCache::new(config.cache.entry_ttl(), metrics.clone()));
        let resolver = CorrelationIdResolver::new(
            Arc::new(NoFetcher),
            config.resolver.failure_backoff(),
            config.resolver.fetch_timeout(),
            metrics.clone(),
        );
        let sink = Arc::new(MemorySink::new());
        let tracker = Arc::new(DependencyTracker::new(
            &config,
            cache,
            resolver,
            sink.clone(),
            metrics,
        ));
        (tracker, sink)
    }

    #[tokio::test]
    async fn test_framework_skipped_once_diagnostic_source_active() {
        let (tracker, sink) = setup();
        let diagnostic = DiagnosticSourceHttp::new(tracker.clone());
        let framework = FrameworkEventHttp::new(tracker.clone());

        let mut request = HttpRequest::get("http://api.example.com/a");
        assert_eq!(diagnostic.on_request_send(&mut request, None), BeginOutcome::Tracked);
        assert_eq!(
            framework.on_begin_http_callback(request.key(), &request.url, None),
            BeginOutcome::Skipped
        );

        let response = HttpResponse::new(200);
        assert_eq!(
            diagnostic.on_response_receive(&request, &response).await,
            EndOutcome::Emitted
        );
        assert_eq!(
            framework
                .on_end_http_callback(request.key(), Some(true), false, Some(200))
                .await,
            EndOutcome::Unmatched
        );
        assert_eq!(sink.len(), 1);
        assert!(sink.records()[0].sdk_version.starts_with("rdddsd:"));
    }

    #[tokio::test]
    async fn test_framework_and_profiler_emit_once() {
        let (tracker, sink) = setup();
        let framework = FrameworkEventHttp::new(tracker.clone());
        let profiler = ProfilerHttp::new(tracker.clone());

        let mut request = HttpRequest::get("http://api.example.com/b");
        assert_eq!(
            framework.on_begin_http_callback(request.key(), &request.url, None),
            BeginOutcome::Tracked
        );
        // Same call seen by the profiler; overwrites the pending record
        assert_eq!(profiler.on_begin(&mut request, None), BeginOutcome::Tracked);

        framework
            .on_end_http_callback(request.key(), Some(true), true, Some(404))
            .await;
        profiler.on_end(&request, Some(&HttpResponse::new(404))).await;

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].success, Some(false));
        assert_eq!(records[0].result_code.as_deref(), Some("404"));
    }

    #[tokio::test]
    async fn test_framework_begin_is_not_restarted() {
        let (tracker, _sink) = setup();
        let framework = FrameworkEventHttp::new(tracker.clone());
        let key = RequestKey::next();

        assert_eq!(
            framework.on_begin_http_callback(key, "http://api.example.com/c", None),
            BeginOutcome::Tracked
        );
        let first = tracker.cache().get(key).unwrap().record.id;

        for _ in 0..4 {
            assert_eq!(
                framework.on_begin_http_callback(key, "http://api.example.com/c", None),
                BeginOutcome::Duplicate
            );
        }
        assert_eq!(tracker.cache().get(key).unwrap().record.id, first);
    }

    #[tokio::test]
    async fn test_framework_rejects_empty_resource() {
        let (tracker, _sink) = setup();
        let framework = FrameworkEventHttp::new(tracker.clone());

        assert_eq!(
            framework.on_begin_http_callback(RequestKey::next(), "  ", None),
            BeginOutcome::Rejected
        );
        assert!(tracker.cache().is_empty());
    }

    #[tokio::test]
    async fn test_profiler_end_without_response() {
        let (tracker, sink) = setup();
        let profiler = ProfilerHttp::new(tracker);

        let mut request = HttpRequest::get("http://unreachable.example.com/");
        profiler.on_begin(&mut request, None);
        assert_eq!(profiler.on_end(&request, None).await, EndOutcome::Emitted);

        let records = sink.records();
        assert_eq!(records[0].success, Some(false));
        assert!(records[0].sdk_version.starts_with("rddp:"));
    }

    #[tokio::test]
    async fn test_sql_events_stamp_their_source() {
        let (tracker, sink) = setup();
        let profiler_sql = SqlCommandEvents::new(tracker.clone(), SourceKind::Profiler);
        let key = RequestKey::next();

        assert_eq!(
            profiler_sql.on_begin_execute(key, "db.example.com", "inventory", "SELECT 1", None),
            BeginOutcome::Tracked
        );
        // A duplicate End from the same command is ignored
        assert_eq!(profiler_sql.on_end_execute(key, false, 208), EndOutcome::Emitted);
        assert_eq!(profiler_sql.on_end_execute(key, false, 208), EndOutcome::Unmatched);

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, depcorr_core::DependencyKind::Sql);
        assert_eq!(records[0].result_code.as_deref(), Some("208"));
        assert!(records[0].sdk_version.starts_with("rddp:"));
    }
}
