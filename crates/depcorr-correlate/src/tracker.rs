//! Dependency tracker
//!
//! The Begin -> End -> emit state machine. Per request key:
//!
//! ```text
//! Untracked --on_begin--> Began --on_end--> Ended (removed, emitted once)
//! Untracked --track_external--> ExternallyOwned --complete_external--> (caller)
//! ```
//!
//! Several instrumentation sources may report the same physical call. No
//! source is ever told apart from another: the first Begin creates the
//! record, and the first End wins the atomic take. Every later End finds
//! nothing and is ignored.
//!
//! Both hooks run inside the instrumented application's own call path, so
//! neither returns an error nor lets a panic escape.

use crate::cache::{CorrelationCache, Take};
use crate::error::{TrackError, TrackResult};
use crate::filter::{IngestionUrlFilter, SanitizedHostList};
use crate::resolver::CorrelationIdResolver;
use depcorr_core::context::{compact_id, dependency_id};
use depcorr_core::headers::{
    self, CORRELATION_CONTEXT_HEADER, PARENT_ID_HEADER, REQUEST_CONTEXT_HEADER,
    REQUEST_ID_HEADER, ROOT_ID_HEADER, SOURCE_KEY, TARGET_KEY,
};
use depcorr_core::metrics::{incr, SharedMetrics};
use depcorr_core::{
    CallRecord, DependencyKind, OperationContext, OutboundRequest, RequestKey, SuccessPolicy,
    TelemetrySink, TrackerConfig,
};
use futures_util::FutureExt;
use http::HeaderMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

/// Which instrumentation source reported a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// Runtime profiler callbacks
    Profiler,
    /// Framework event callbacks
    Framework,
    /// HTTP diagnostic source events
    DiagnosticSource,
    /// Caller code
    Manual,
}

impl SourceKind {
    pub fn prefix(self) -> &'static str {
        match self {
            SourceKind::Profiler => "rddp",
            SourceKind::Framework => "rddf",
            SourceKind::DiagnosticSource => "rdddsd",
            SourceKind::Manual => "rddm",
        }
    }

    /// `sdk_version` stamped on records from this source
    pub fn sdk_version(self) -> String {
        format!("{}:{}", self.prefix(), depcorr_core::VERSION)
    }
}

/// What a Begin notification did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeginOutcome {
    /// A record was stored
    Tracked,
    /// The call targets the SDK's own endpoints
    Ignored,
    /// An externally owned record already holds the key
    Owned,
    /// The key is already being tracked by this source
    Duplicate,
    /// Another source is responsible for this call
    Skipped,
    /// Malformed input or an internal error; nothing stored
    Rejected,
}

/// What an End notification did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndOutcome {
    /// The record was completed and sent to the sink
    Emitted,
    /// No pending call: a duplicate End, an End without Begin, or an expired entry
    Unmatched,
    /// The pending call is externally owned and was left alone
    Owned,
    /// An internal error was caught at the boundary
    Failed,
}

/// Success and result code for a finished call
///
/// A status code decides on its own: success iff `0 < code < 400`, result
/// code empty when non-positive. Without one, `policy` decides whether the
/// source's own success flag is consulted.
pub fn call_outcome(
    policy: SuccessPolicy,
    signaled_success: Option<bool>,
    status_code: Option<i32>,
) -> (bool, Option<String>) {
    match status_code {
        Some(code) => {
            let result_code = if code > 0 {
                code.to_string()
            } else {
                String::new()
            };
            (code > 0 && code < 400, Some(result_code))
        }
        None => match policy {
            SuccessPolicy::StatusCode => (false, None),
            SuccessPolicy::StatusCodeThenSignal => (signaled_success.unwrap_or(false), None),
        },
    }
}

/// Correlates Begin/End notifications into one record per call
pub struct DependencyTracker {
    cache: Arc<CorrelationCache>,
    resolver: CorrelationIdResolver,
    sink: Arc<dyn TelemetrySink>,
    metrics: SharedMetrics,

    ingestion_filter: IngestionUrlFilter,
    excluded_hosts: SanitizedHostList,
    inject_headers: bool,
    success_policy: SuccessPolicy,
    resolve_unannotated_targets: bool,

    /// Endpoint under which our own identity resolves
    instrumentation_key: Option<String>,

    diagnostic_source_active: AtomicBool,
}

impl DependencyTracker {
    pub fn new(
        config: &TrackerConfig,
        cache: Arc<CorrelationCache>,
        resolver: CorrelationIdResolver,
        sink: Arc<dyn TelemetrySink>,
        metrics: SharedMetrics,
    ) -> Self {
        let ingestion_filter = IngestionUrlFilter::new([
            config.module.ingestion_endpoint.clone(),
            config.module.effective_profile_query_endpoint(),
        ]);

        Self {
            cache,
            resolver,
            sink,
            metrics,
            ingestion_filter,
            excluded_hosts: config.correlation.excluded_domains.iter().collect(),
            inject_headers: config.correlation.set_component_correlation_headers,
            success_policy: config.correlation.success_policy,
            resolve_unannotated_targets: config.correlation.resolve_unannotated_targets,
            instrumentation_key: config
                .module
                .instrumentation_key
                .clone()
                .filter(|k| !k.trim().is_empty()),
            diagnostic_source_active: AtomicBool::new(false),
        }
    }

    pub fn cache(&self) -> &Arc<CorrelationCache> {
        &self.cache
    }

    pub fn resolver(&self) -> &CorrelationIdResolver {
        &self.resolver
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }

    pub fn instrumentation_key(&self) -> Option<&str> {
        self.instrumentation_key.as_deref()
    }

    /// Record that the diagnostic source is delivering HTTP events
    pub fn mark_diagnostic_source_active(&self) {
        if !self.diagnostic_source_active.swap(true, Ordering::AcqRel) {
            debug!("HTTP diagnostic source active, framework Begin events will be skipped");
        }
    }

    pub fn is_diagnostic_source_active(&self) -> bool {
        self.diagnostic_source_active.load(Ordering::Acquire)
    }

    /// Our own correlation identity, if it is already known
    ///
    /// Never suspends; a first call kicks off the lookup in the background.
    pub fn own_correlation_id(&self) -> Option<String> {
        self.instrumentation_key
            .as_deref()
            .and_then(|key| self.resolver.try_resolve(key))
    }

    /// Handle the start of an outbound call
    ///
    /// `ambient` defaults to the task's current [`OperationContext`].
    pub fn on_begin<R>(
        &self,
        source: SourceKind,
        request: &mut R,
        ambient: Option<&OperationContext>,
    ) -> BeginOutcome
    where
        R: OutboundRequest + ?Sized,
    {
        let current;
        let ambient = match ambient {
            Some(ctx) => Some(ctx),
            None => {
                current = OperationContext::current();
                current.as_ref()
            }
        };

        let key = request.key();
        self.guard_begin(key, || self.begin_inner(source, request, ambient))
    }

    /// Run a Begin body behind the hook's error and panic boundary
    fn guard_begin<F>(&self, key: RequestKey, begin: F) -> BeginOutcome
    where
        F: FnOnce() -> TrackResult<BeginOutcome>,
    {
        match std::panic::catch_unwind(AssertUnwindSafe(begin)) {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                incr(&self.metrics.calls.begins_rejected);
                warn!("Begin aborted for request {}: {}", key, e);
                BeginOutcome::Rejected
            }
            Err(payload) => {
                incr(&self.metrics.calls.hook_errors);
                warn!("Begin hook failed: {}", TrackError::from_panic(payload));
                BeginOutcome::Rejected
            }
        }
    }

    fn begin_inner<R>(
        &self,
        source: SourceKind,
        request: &mut R,
        ambient: Option<&OperationContext>,
    ) -> TrackResult<BeginOutcome>
    where
        R: OutboundRequest + ?Sized,
    {
        let key = request.key();
        let raw_url = request.url().trim().to_string();

        if self.ingestion_filter.is_ingestion(&raw_url) {
            incr(&self.metrics.calls.begins_ignored);
            debug!("Ignoring call to SDK endpoint: {}", raw_url);
            return Ok(BeginOutcome::Ignored);
        }

        if self.cache.get(key).is_some_and(|p| p.externally_owned) {
            incr(&self.metrics.calls.begins_skipped_owned);
            debug!("Request {} is externally owned, leaving it alone", key);
            return Ok(BeginOutcome::Owned);
        }

        let url = Url::parse(&raw_url).map_err(|e| TrackError::invalid_url(&raw_url, e))?;
        let host = url
            .host_str()
            .ok_or_else(|| TrackError::invalid_url(&raw_url, "no host"))?;

        let mut record = CallRecord::begin(key, DependencyKind::Http);
        record.name = match request.method().map(str::trim) {
            Some(method) if !method.is_empty() => {
                format!("{} {}", method.to_ascii_uppercase(), url.path())
            }
            _ => url.path().to_string(),
        };
        record.target = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        record.data = raw_url;
        record.sdk_version = source.sdk_version();
        link_operation(&mut record, ambient);

        if self.inject_headers && !self.excluded_hosts.matches(host) {
            if let Some(headers) = request.headers_mut() {
                if self.inject_correlation_headers(headers, &record, ambient) {
                    incr(&self.metrics.calls.headers_injected);
                }
            }
        }

        Ok(self.store_pending(key, record))
    }

    /// Store a new engine-owned record; an owned entry that appeared since the
    /// fast-path check still wins
    fn store_pending(&self, key: RequestKey, record: CallRecord) -> BeginOutcome {
        debug!("Tracking {} as {} ({})", key, record.name, record.id);
        if !self.cache.store_unless_owned(key, record) {
            incr(&self.metrics.calls.begins_skipped_owned);
            debug!("Request {} became externally owned, dropping Begin", key);
            return BeginOutcome::Owned;
        }
        incr(&self.metrics.calls.begins);
        BeginOutcome::Tracked
    }

    /// Add every correlation header the request does not already carry
    fn inject_correlation_headers(
        &self,
        headers: &mut HeaderMap,
        record: &CallRecord,
        ambient: Option<&OperationContext>,
    ) -> bool {
        let mut injected = false;

        if headers::get_name_value(headers, &REQUEST_CONTEXT_HEADER, SOURCE_KEY).is_none() {
            if let Some(own_id) = self.own_correlation_id() {
                injected |=
                    headers::set_name_value(headers, REQUEST_CONTEXT_HEADER, SOURCE_KEY, &own_id);
            }
        }

        injected |= headers::insert_if_absent(headers, REQUEST_ID_HEADER, &record.id);
        injected |= headers::insert_if_absent(headers, PARENT_ID_HEADER, &record.id);
        injected |= headers::insert_if_absent(headers, ROOT_ID_HEADER, &record.operation_id);

        if let Some(baggage) = ambient.and_then(OperationContext::baggage_header) {
            injected |= headers::insert_if_absent(headers, CORRELATION_CONTEXT_HEADER, &baggage);
        }

        injected
    }

    /// Handle the start of a SQL command
    ///
    /// `data_source` and `database` together name the target; the command
    /// text becomes the record's data. No headers are involved.
    pub fn on_begin_sql(
        &self,
        source: SourceKind,
        key: RequestKey,
        data_source: &str,
        database: &str,
        command_text: &str,
        ambient: Option<&OperationContext>,
    ) -> BeginOutcome {
        let current;
        let ambient = match ambient {
            Some(ctx) => Some(ctx),
            None => {
                current = OperationContext::current();
                current.as_ref()
            }
        };

        self.guard_begin(key, || {
            self.begin_sql_inner(source, key, data_source, database, command_text, ambient)
        })
    }

    fn begin_sql_inner(
        &self,
        source: SourceKind,
        key: RequestKey,
        data_source: &str,
        database: &str,
        command_text: &str,
        ambient: Option<&OperationContext>,
    ) -> TrackResult<BeginOutcome> {
        if self.cache.get(key).is_some_and(|p| p.externally_owned) {
            incr(&self.metrics.calls.begins_skipped_owned);
            debug!("Request {} is externally owned, leaving it alone", key);
            return Ok(BeginOutcome::Owned);
        }

        let data_source = data_source.trim();
        let database = database.trim();
        if data_source.is_empty() && database.is_empty() {
            return Err(TrackError::MissingSqlTarget(key.as_u64()));
        }

        let mut record = CallRecord::begin(key, DependencyKind::Sql);
        record.target = match (data_source.is_empty(), database.is_empty()) {
            (false, false) => format!("{} | {}", data_source, database),
            (false, true) => data_source.to_string(),
            _ => database.to_string(),
        };
        record.name = record.target.clone();
        record.data = command_text.to_string();
        record.sdk_version = source.sdk_version();
        link_operation(&mut record, ambient);

        Ok(self.store_pending(key, record))
    }

    /// Handle the end of a SQL command
    ///
    /// `error_number` is the server's error number, `0` when none was raised;
    /// it is reported as the result code either way.
    pub fn on_end_sql(&self, key: RequestKey, success: bool, error_number: i32) -> EndOutcome {
        let end = || {
            let mut record = match self.take_pending(key) {
                Ok(record) => record,
                Err(outcome) => return outcome,
            };
            record.complete(success, Some(error_number.to_string()));
            self.emit(record)
        };

        match std::panic::catch_unwind(AssertUnwindSafe(end)) {
            Ok(outcome) => outcome,
            Err(payload) => {
                incr(&self.metrics.calls.hook_errors);
                warn!("SQL End hook failed: {}", TrackError::from_panic(payload));
                EndOutcome::Failed
            }
        }
    }

    /// Handle the end of an outbound call
    ///
    /// May suspend while the callee's identity is resolved.
    pub async fn on_end(
        &self,
        key: RequestKey,
        signaled_success: Option<bool>,
        status_code: Option<i32>,
        response_headers: Option<&HeaderMap>,
    ) -> EndOutcome {
        let end = self.end_inner(key, signaled_success, status_code, response_headers);
        match AssertUnwindSafe(end).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(payload) => {
                incr(&self.metrics.calls.hook_errors);
                warn!("End hook failed: {}", TrackError::from_panic(payload));
                EndOutcome::Failed
            }
        }
    }

    async fn end_inner(
        &self,
        key: RequestKey,
        signaled_success: Option<bool>,
        status_code: Option<i32>,
        response_headers: Option<&HeaderMap>,
    ) -> EndOutcome {
        let mut record = match self.take_pending(key) {
            Ok(record) => record,
            Err(outcome) => return outcome,
        };

        let (success, result_code) =
            call_outcome(self.success_policy, signaled_success, status_code);

        self.annotate_target(&mut record, response_headers).await;
        record.complete(success, result_code);
        self.emit(record)
    }

    /// Take the pending record the engine may complete, or say why not
    fn take_pending(&self, key: RequestKey) -> Result<CallRecord, EndOutcome> {
        match self.cache.take_unless_owned(key) {
            Take::Taken(record) => Ok(record),
            Take::Owned => {
                incr(&self.metrics.calls.ends_owned);
                debug!("Request {} is externally owned, not emitting", key);
                Err(EndOutcome::Owned)
            }
            Take::Missing => {
                incr(&self.metrics.calls.ends_unmatched);
                debug!("End for request {} with no pending Begin, ignoring", key);
                Err(EndOutcome::Unmatched)
            }
        }
    }

    fn emit(&self, record: CallRecord) -> EndOutcome {
        debug!(
            "Emitting {} {} success={:?} duration={:?}ms",
            record.id, record.name, record.success, record.duration_ms
        );
        incr(&self.metrics.calls.emitted);
        self.sink.send(record);
        EndOutcome::Emitted
    }

    /// Append the callee's identity to the target
    async fn annotate_target(&self, record: &mut CallRecord, response_headers: Option<&HeaderMap>) {
        let reported = response_headers
            .and_then(|h| headers::get_name_value(h, &REQUEST_CONTEXT_HEADER, TARGET_KEY));

        let target_id = match reported {
            Some(id) => Some(id),
            None if self.resolve_unannotated_targets => self.resolver.resolve(&record.target).await,
            None => None,
        };

        let Some(target_id) = target_id else {
            return;
        };

        // A call into our own component is not annotated
        let own_id = match self.instrumentation_key.as_deref() {
            Some(key) => self.resolver.resolve(key).await,
            None => None,
        };
        if own_id.as_deref() == Some(target_id.as_str()) {
            return;
        }

        record.annotate_target(&target_id);
    }

    /// Track a call whose completion belongs to caller code
    ///
    /// Source hooks leave the key alone until [`complete_external`] hands the
    /// record back.
    ///
    /// [`complete_external`]: DependencyTracker::complete_external
    pub fn track_external(&self, key: RequestKey, mut record: CallRecord) {
        record.request_key = key;
        if record.sdk_version.is_empty() {
            record.sdk_version = SourceKind::Manual.sdk_version();
        }
        self.cache.store(key, record, true);
    }

    /// Take back an externally owned record; never emitted by the tracker
    pub fn complete_external(&self, key: RequestKey) -> Option<CallRecord> {
        self.cache.take_owned(key)
    }
}

/// Link `record` to the ambient operation, or start a new trace without one
fn link_operation(record: &mut CallRecord, ambient: Option<&OperationContext>) {
    match ambient {
        Some(ctx) => {
            record.id = dependency_id(&ctx.id);
            record.operation_id = ctx.operation_id.clone();
            record.parent_id = Some(ctx.id.clone());
        }
        None => {
            record.id = compact_id();
            record.operation_id = record.id.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{CorrelationIdFetcher, FetchError};
    use async_trait::async_trait;
    use depcorr_core::config::{CacheSettings, CorrelationSettings, ModuleSettings};
    use depcorr_core::{create_metrics, HttpRequest, HttpResponse, MemorySink, ResourceCall};
    use http::HeaderValue;
    use std::collections::HashMap;
    use std::time::Duration;

    const OWN_KEY: &str = "own-ikey";
    const OWN_ID: &str = "cid-v1:own-app";

    /// Answers from a fixed table; unknown endpoints fail
    struct TableFetcher(HashMap<String, String>);

    #[async_trait]
    impl CorrelationIdFetcher for TableFetcher {
        async fn fetch(&self, endpoint: &str) -> Result<String, FetchError> {
            self.0
                .get(endpoint)
                .cloned()
                .ok_or_else(|| FetchError::NotFound(endpoint.to_string()))
        }
    }

    struct PanickingSink;

    impl TelemetrySink for PanickingSink {
        fn send(&self, _record: CallRecord) {
            panic!("sink failure");
        }
    }

    struct Fixture {
        tracker: DependencyTracker,
        sink: Arc<MemorySink>,
    }

    fn config() -> TrackerConfig {
        TrackerConfig {
            module: ModuleSettings {
                instrumentation_key: Some(OWN_KEY.to_string()),
                ingestion_endpoint: "https://ingest.example.com/v2/track".to_string(),
                ..Default::default()
            },
            correlation: CorrelationSettings {
                excluded_domains: vec!["excluded.example.com".to_string()],
                ..Default::default()
            },
            cache: CacheSettings {
                entry_ttl_ms: 1_000,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn fixture_with(config: TrackerConfig, known: &[(&str, &str)]) -> Fixture {
        let metrics = create_metrics();
        let cache = Arc::new(CorrelationCache::new(config.cache.entry_ttl(), metrics.clone()));
        let fetcher = TableFetcher(
            known
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        let resolver = CorrelationIdResolver::new(
            Arc::new(fetcher),
            config.resolver.failure_backoff(),
            config.resolver.fetch_timeout(),
            metrics.clone(),
        );
        resolver.prime(OWN_KEY, OWN_ID);

        let sink = Arc::new(MemorySink::new());
        let tracker = DependencyTracker::new(&config, cache, resolver, sink.clone(), metrics);
        Fixture { tracker, sink }
    }

    fn fixture() -> Fixture {
        fixture_with(config(), &[])
    }

    #[tokio::test]
    async fn test_begin_end_emits_one_record() {
        let f = fixture();
        let mut request = HttpRequest::get("http://api.example.com/orders?id=1");

        let outcome = f.tracker.on_begin(SourceKind::DiagnosticSource, &mut request, None);
        assert_eq!(outcome, BeginOutcome::Tracked);

        let outcome = f.tracker.on_end(request.key(), None, Some(200), None).await;
        assert_eq!(outcome, EndOutcome::Emitted);

        let records = f.sink.records();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.name, "GET /orders");
        assert_eq!(record.target, "api.example.com");
        assert_eq!(record.data, "http://api.example.com/orders?id=1");
        assert_eq!(record.success, Some(true));
        assert_eq!(record.result_code.as_deref(), Some("200"));
        assert!(record.sdk_version.starts_with("rdddsd:"));
        assert!(f.tracker.cache().is_empty());
    }

    #[tokio::test]
    async fn test_success_follows_status_code() {
        let cases = [
            (1, true),
            (200, true),
            (302, true),
            (399, true),
            (400, false),
            (500, false),
            (0, false),
            (-1, false),
        ];
        for (status, success) in cases {
            let f = fixture();
            let mut request = HttpRequest::get("http://api.example.com/");
            f.tracker.on_begin(SourceKind::Profiler, &mut request, None);
            // The source's own flag is never trusted over a status code
            f.tracker.on_end(request.key(), Some(!success), Some(status), None).await;

            let records = f.sink.records();
            assert_eq!(records[0].success, Some(success), "status {}", status);
        }
    }

    #[test]
    fn test_call_outcome() {
        assert_eq!(
            call_outcome(SuccessPolicy::StatusCode, Some(true), Some(404)),
            (false, Some("404".to_string()))
        );
        assert_eq!(
            call_outcome(SuccessPolicy::StatusCode, Some(true), Some(-1)),
            (false, Some(String::new()))
        );
        assert_eq!(call_outcome(SuccessPolicy::StatusCode, Some(true), None), (false, None));
        assert_eq!(
            call_outcome(SuccessPolicy::StatusCodeThenSignal, Some(true), None),
            (true, None)
        );
        assert_eq!(
            call_outcome(SuccessPolicy::StatusCodeThenSignal, None, None),
            (false, None)
        );
    }

    #[tokio::test]
    async fn test_end_without_status_still_emits() {
        let f = fixture();
        let mut request = HttpRequest::get("http://api.example.com/");
        f.tracker.on_begin(SourceKind::Framework, &mut request, None);
        f.tracker.on_end(request.key(), Some(true), None, None).await;

        let records = f.sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].success, Some(false));
        assert!(records[0].result_code.is_none());
    }

    #[tokio::test]
    async fn test_repeated_begins_and_ends_emit_once() {
        let f = fixture();
        let mut request = HttpRequest::get("http://api.example.com/redirect");

        for _ in 0..5 {
            f.tracker.on_begin(SourceKind::Profiler, &mut request, None);
        }
        assert_eq!(
            f.tracker.on_end(request.key(), None, Some(302), None).await,
            EndOutcome::Emitted
        );
        assert_eq!(
            f.tracker.on_end(request.key(), None, Some(200), None).await,
            EndOutcome::Unmatched
        );
        assert_eq!(
            f.tracker.on_end(request.key(), None, Some(500), None).await,
            EndOutcome::Unmatched
        );

        let records = f.sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].result_code.as_deref(), Some("302"));
    }

    #[tokio::test]
    async fn test_end_without_begin_is_ignored() {
        let f = fixture();
        let outcome = f
            .tracker
            .on_end(RequestKey::from_raw(999_999), None, Some(200), None)
            .await;
        assert_eq!(outcome, EndOutcome::Unmatched);
        assert!(f.sink.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_begin_is_never_emitted() {
        let f = fixture();
        let mut request = HttpRequest::get("http://api.example.com/slow");
        f.tracker.on_begin(SourceKind::Profiler, &mut request, None);

        tokio::time::advance(Duration::from_millis(1_001)).await;
        let outcome = f.tracker.on_end(request.key(), None, Some(200), None).await;
        assert_eq!(outcome, EndOutcome::Unmatched);
        assert!(f.sink.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duration_measured_from_begin() {
        let f = fixture();
        let mut request = HttpRequest::get("http://api.example.com/");
        f.tracker.on_begin(SourceKind::Profiler, &mut request, None);
        tokio::time::advance(Duration::from_millis(250)).await;
        f.tracker.on_end(request.key(), None, Some(200), None).await;
        assert_eq!(f.sink.records()[0].duration_ms, Some(250));
    }

    #[tokio::test]
    async fn test_response_identity_annotates_target() {
        let f = fixture();
        let mut request = HttpRequest::get("https://callee.example.com:8443/api");
        f.tracker.on_begin(SourceKind::DiagnosticSource, &mut request, None);

        let response = HttpResponse::new(200).with_header("request-context", "appId=cid-v1:X");
        f.tracker
            .on_end(request.key(), None, Some(200), Some(&response.headers))
            .await;

        assert_eq!(f.sink.records()[0].target, "callee.example.com:8443 | cid-v1:X");
    }

    #[tokio::test]
    async fn test_own_identity_is_not_annotated() {
        let f = fixture();
        let mut request = HttpRequest::get("https://self.example.com/");
        f.tracker.on_begin(SourceKind::DiagnosticSource, &mut request, None);

        let response = HttpResponse::new(200).with_header("request-context", &format!("appId={}", OWN_ID));
        f.tracker
            .on_end(request.key(), None, Some(200), Some(&response.headers))
            .await;

        assert_eq!(f.sink.records()[0].target, "self.example.com");
    }

    #[tokio::test]
    async fn test_absent_identity_leaves_bare_host() {
        let f = fixture_with(config(), &[("callee.example.com", "cid-v1:lookup")]);
        let mut request = HttpRequest::get("https://callee.example.com/");
        f.tracker.on_begin(SourceKind::DiagnosticSource, &mut request, None);

        let response = HttpResponse::new(200).with_header("request-context", "roleName=x");
        f.tracker
            .on_end(request.key(), None, Some(200), Some(&response.headers))
            .await;

        assert_eq!(f.sink.records()[0].target, "callee.example.com");
    }

    #[tokio::test]
    async fn test_unannotated_target_resolution() {
        let mut config = config();
        config.correlation.resolve_unannotated_targets = true;
        let f = fixture_with(config, &[("callee.example.com", "cid-v1:lookup")]);

        let mut request = HttpRequest::get("https://callee.example.com/");
        f.tracker.on_begin(SourceKind::DiagnosticSource, &mut request, None);
        f.tracker.on_end(request.key(), None, Some(200), None).await;

        let mut unknown = HttpRequest::get("https://unknown.example.com/");
        f.tracker.on_begin(SourceKind::DiagnosticSource, &mut unknown, None);
        f.tracker.on_end(unknown.key(), None, Some(200), None).await;

        let records = f.sink.records();
        assert_eq!(records[0].target, "callee.example.com | cid-v1:lookup");
        assert_eq!(records[1].target, "unknown.example.com");
    }

    #[tokio::test]
    async fn test_headers_injected() {
        let f = fixture();
        let mut request = HttpRequest::get("http://api.example.com/");
        f.tracker.on_begin(SourceKind::DiagnosticSource, &mut request, None);

        let record = f.tracker.cache().get(request.key()).unwrap().record;
        assert_eq!(
            request.headers.get(&REQUEST_CONTEXT_HEADER).unwrap(),
            &format!("appId={}", OWN_ID)
        );
        assert_eq!(request.headers.get(&REQUEST_ID_HEADER).unwrap(), record.id.as_str());
        assert_eq!(request.headers.get(&PARENT_ID_HEADER).unwrap(), record.id.as_str());
        assert_eq!(
            request.headers.get(&ROOT_ID_HEADER).unwrap(),
            record.operation_id.as_str()
        );
        assert!(request.headers.get(&CORRELATION_CONTEXT_HEADER).is_none());
    }

    #[tokio::test]
    async fn test_source_identity_appended_to_existing_header() {
        let f = fixture();
        let mut request = HttpRequest::get("http://api.example.com/");
        request
            .headers
            .insert(REQUEST_CONTEXT_HEADER, HeaderValue::from_static("helloWorld"));
        f.tracker.on_begin(SourceKind::DiagnosticSource, &mut request, None);

        assert_eq!(
            request.headers.get(&REQUEST_CONTEXT_HEADER).unwrap(),
            &format!("helloWorld, appId={}", OWN_ID)
        );
    }

    #[tokio::test]
    async fn test_existing_source_identity_preserved() {
        let f = fixture();
        let mut request = HttpRequest::get("http://api.example.com/");
        request.headers.insert(
            REQUEST_CONTEXT_HEADER,
            HeaderValue::from_static("appId=cid-v1:caller-set"),
        );
        request
            .headers
            .insert(REQUEST_ID_HEADER, HeaderValue::from_static("|caller.1_"));
        f.tracker.on_begin(SourceKind::DiagnosticSource, &mut request, None);

        assert_eq!(
            request.headers.get(&REQUEST_CONTEXT_HEADER).unwrap(),
            "appId=cid-v1:caller-set"
        );
        assert_eq!(request.headers.get(&REQUEST_ID_HEADER).unwrap(), "|caller.1_");
    }

    #[tokio::test]
    async fn test_excluded_host_gets_no_headers() {
        let f = fixture();
        let mut request = HttpRequest::get("https://account.excluded.example.com/blob");
        assert_eq!(
            f.tracker.on_begin(SourceKind::DiagnosticSource, &mut request, None),
            BeginOutcome::Tracked
        );
        assert!(request.headers.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_injection_adds_no_headers() {
        let mut config = config();
        config.correlation.set_component_correlation_headers = false;
        let f = fixture_with(config, &[]);

        let mut request = HttpRequest::get("http://api.example.com/");
        f.tracker.on_begin(SourceKind::DiagnosticSource, &mut request, None);
        assert!(request.headers.is_empty());
        assert_eq!(f.tracker.cache().len(), 1);
    }

    #[tokio::test]
    async fn test_ambient_operation_links_ids() {
        let f = fixture();
        let ctx = OperationContext::new_root("GET /home").with_baggage("tenant", "contoso");
        let mut request = HttpRequest::get("http://api.example.com/");
        f.tracker
            .on_begin(SourceKind::DiagnosticSource, &mut request, Some(&ctx));

        let record = f.tracker.cache().get(request.key()).unwrap().record;
        assert_eq!(record.operation_id, ctx.operation_id);
        assert_eq!(record.parent_id.as_deref(), Some(ctx.id.as_str()));

        let request_id = request.headers.get(&REQUEST_ID_HEADER).unwrap().to_str().unwrap();
        assert!(request_id.starts_with(&ctx.id));
        assert_ne!(request_id, ctx.id);
        assert_eq!(request.headers.get(&PARENT_ID_HEADER).unwrap(), request_id);
        assert_eq!(
            request.headers.get(&CORRELATION_CONTEXT_HEADER).unwrap(),
            "tenant=contoso"
        );
    }

    #[tokio::test]
    async fn test_task_context_used_when_none_passed() {
        let f = fixture();
        let ctx = OperationContext::new_root("scoped");
        let expected = ctx.operation_id.clone();

        let key = ctx
            .scope(async {
                let mut request = HttpRequest::get("http://api.example.com/");
                f.tracker
                    .on_begin(SourceKind::DiagnosticSource, &mut request, None);
                request.key()
            })
            .await;

        let record = f.tracker.cache().get(key).unwrap().record;
        assert_eq!(record.operation_id, expected);
    }

    #[tokio::test]
    async fn test_legacy_id_without_operation() {
        let f = fixture();
        let mut request = HttpRequest::get("http://api.example.com/");
        f.tracker.on_begin(SourceKind::DiagnosticSource, &mut request, None);

        let parent = request.headers.get(&PARENT_ID_HEADER).unwrap().to_str().unwrap();
        assert!(!parent.contains('-'));
        assert!(!parent.contains('|'));
        assert!(!parent.contains('.'));
    }

    #[tokio::test]
    async fn test_ingestion_calls_are_ignored() {
        let f = fixture();
        let mut request = HttpRequest::new("POST", "https://ingest.example.com/v2/track");
        assert_eq!(
            f.tracker.on_begin(SourceKind::DiagnosticSource, &mut request, None),
            BeginOutcome::Ignored
        );
        assert!(f.tracker.cache().is_empty());
        assert!(request.headers.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_url_rejected() {
        let f = fixture();
        let mut call = ResourceCall {
            key: RequestKey::next(),
            resource_name: "not a url",
        };
        assert_eq!(
            f.tracker.on_begin(SourceKind::Framework, &mut call, None),
            BeginOutcome::Rejected
        );
        assert!(f.tracker.cache().is_empty());
    }

    #[tokio::test]
    async fn test_resource_call_name_is_path() {
        let f = fixture();
        let mut call = ResourceCall {
            key: RequestKey::next(),
            resource_name: "http://api.example.com/items",
        };
        f.tracker.on_begin(SourceKind::Framework, &mut call, None);
        let record = f.tracker.cache().get(call.key).unwrap().record;
        assert_eq!(record.name, "/items");
        assert!(record.sdk_version.starts_with("rddf:"));
    }

    #[tokio::test]
    async fn test_externally_owned_never_emitted_or_removed() {
        let f = fixture();
        let key = RequestKey::next();
        let mut record = CallRecord::begin(key, DependencyKind::Http);
        record.name = "custom".to_string();
        f.tracker.track_external(key, record);

        let mut call = ResourceCall {
            key,
            resource_name: "http://api.example.com/",
        };
        assert_eq!(
            f.tracker.on_begin(SourceKind::Framework, &mut call, None),
            BeginOutcome::Owned
        );
        assert_eq!(
            f.tracker.on_end(key, None, Some(200), None).await,
            EndOutcome::Owned
        );
        assert!(f.sink.is_empty());

        let record = f.tracker.complete_external(key).unwrap();
        assert_eq!(record.name, "custom");
        assert!(record.sdk_version.starts_with("rddm:"));
        assert!(f.tracker.complete_external(key).is_none());
    }

    #[test]
    fn test_racing_external_tracking_is_never_overwritten() {
        let f = Arc::new(fixture());

        for _ in 0..2_000 {
            let request = HttpRequest::get("http://api.example.com/owned-race");
            let key = request.key();

            let external = {
                let f = f.clone();
                std::thread::spawn(move || {
                    f.tracker
                        .track_external(key, CallRecord::begin(key, DependencyKind::Http));
                })
            };
            let begin = {
                let f = f.clone();
                let mut request = request;
                std::thread::spawn(move || {
                    f.tracker.on_begin(SourceKind::Profiler, &mut request, None)
                })
            };
            external.join().unwrap();
            let outcome = begin.join().unwrap();

            let pending = f.tracker.cache().get(key).unwrap();
            assert!(pending.externally_owned);
            assert!(matches!(outcome, BeginOutcome::Tracked | BeginOutcome::Owned));
            assert!(f.tracker.complete_external(key).is_some());
        }
        assert!(f.sink.is_empty());
    }

    #[tokio::test]
    async fn test_sql_begin_end_emits_sql_record() {
        let f = fixture();
        let key = RequestKey::next();

        let outcome = f.tracker.on_begin_sql(
            SourceKind::Framework,
            key,
            "db.example.com",
            "orders",
            "SELECT * FROM orders",
            None,
        );
        assert_eq!(outcome, BeginOutcome::Tracked);
        assert_eq!(f.tracker.on_end_sql(key, true, 0), EndOutcome::Emitted);
        assert_eq!(f.tracker.on_end_sql(key, true, 0), EndOutcome::Unmatched);

        let records = f.sink.records();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.kind, DependencyKind::Sql);
        assert_eq!(record.target, "db.example.com | orders");
        assert_eq!(record.name, "db.example.com | orders");
        assert_eq!(record.data, "SELECT * FROM orders");
        assert_eq!(record.success, Some(true));
        assert_eq!(record.result_code.as_deref(), Some("0"));
        assert!(record.sdk_version.starts_with("rddf:"));
    }

    #[tokio::test]
    async fn test_sql_failure_reports_error_number() {
        let f = fixture();
        let key = RequestKey::next();
        let ctx = OperationContext::new_root("GET /report");

        f.tracker
            .on_begin_sql(SourceKind::Profiler, key, "db.example.com", "", "exec report", Some(&ctx));
        f.tracker.on_end_sql(key, false, 1205);

        let records = f.sink.records();
        let record = &records[0];
        assert_eq!(record.target, "db.example.com");
        assert_eq!(record.success, Some(false));
        assert_eq!(record.result_code.as_deref(), Some("1205"));
        assert_eq!(record.operation_id, ctx.operation_id);
        assert_eq!(record.parent_id.as_deref(), Some(ctx.id.as_str()));
    }

    #[tokio::test]
    async fn test_sql_without_target_rejected() {
        let f = fixture();
        let key = RequestKey::next();

        assert_eq!(
            f.tracker
                .on_begin_sql(SourceKind::Framework, key, " ", "", "SELECT 1", None),
            BeginOutcome::Rejected
        );
        assert!(f.tracker.cache().is_empty());
    }

    #[tokio::test]
    async fn test_sql_respects_external_ownership() {
        let f = fixture();
        let key = RequestKey::next();
        f.tracker
            .track_external(key, CallRecord::begin(key, DependencyKind::Sql));

        assert_eq!(
            f.tracker
                .on_begin_sql(SourceKind::Profiler, key, "db", "orders", "SELECT 1", None),
            BeginOutcome::Owned
        );
        assert_eq!(f.tracker.on_end_sql(key, true, 0), EndOutcome::Owned);
        assert!(f.sink.is_empty());
        assert!(f.tracker.complete_external(key).is_some());
    }

    #[tokio::test]
    async fn test_sink_panic_is_contained() {
        let config = config();
        let metrics = create_metrics();
        let cache = Arc::new(CorrelationCache::new(config.cache.entry_ttl(), metrics.clone()));
        let resolver = CorrelationIdResolver::new(
            Arc::new(TableFetcher(HashMap::new())),
            config.resolver.failure_backoff(),
            config.resolver.fetch_timeout(),
            metrics.clone(),
        );
        let tracker =
            DependencyTracker::new(&config, cache, resolver, Arc::new(PanickingSink), metrics.clone());

        let mut request = HttpRequest::get("http://api.example.com/");
        tracker.on_begin(SourceKind::Profiler, &mut request, None);
        let outcome = tracker.on_end(request.key(), None, Some(200), None).await;

        assert_eq!(outcome, EndOutcome::Failed);
        assert_eq!(metrics.calls.hook_errors.load(Ordering::Relaxed), 1);
        assert!(tracker.cache().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_ends_emit_once() {
        let f = Arc::new(fixture());
        for _ in 0..20 {
            let mut request = HttpRequest::get("http://api.example.com/race");
            f.tracker.on_begin(SourceKind::Profiler, &mut request, None);

            let ends = (0..6).map(|_| {
                let f = f.clone();
                let key = request.key();
                tokio::spawn(async move { f.tracker.on_end(key, None, Some(200), None).await })
            });
            let outcomes = futures_util::future::join_all(ends).await;
            let emitted = outcomes
                .into_iter()
                .filter(|o| matches!(o, Ok(EndOutcome::Emitted)))
                .count();
            assert_eq!(emitted, 1);
        }
        assert_eq!(f.sink.len(), 20);
    }
}
