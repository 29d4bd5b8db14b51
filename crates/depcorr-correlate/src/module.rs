//! Dependency tracking module
//!
//! Owns one correlation state for the process: the pending-call cache, the
//! resolver, and the tracker, plus the background work that keeps them
//! healthy. Instrumentation sources get adapters from here; they never build
//! their own state.
//!
//! The runtime profiler and framework events see the same calls, so only one
//! of them is ever handed out. `initialize` picks it: the profiler when one is
//! attached and runtime instrumentation is not disabled, framework events
//! otherwise. The HTTP diagnostic source only runs alongside framework events.

use crate::cache::CorrelationCache;
use crate::resolver::{CorrelationIdFetcher, CorrelationIdResolver};
use crate::sources::{DiagnosticSourceHttp, FrameworkEventHttp, ProfilerHttp, SqlCommandEvents};
use crate::tracker::{DependencyTracker, SourceKind};
use depcorr_core::{create_metrics, SharedMetrics, TelemetrySink, TrackerConfig};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Which source reports HTTP and SQL calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstrumentationMode {
    /// Runtime profiler callbacks
    RuntimeProfiler,
    /// Framework event callbacks, optionally with the HTTP diagnostic source
    FrameworkEvents { diagnostic_source: bool },
}

impl InstrumentationMode {
    /// Choose between the profiler and framework events
    pub fn select(profiler_attached: bool, config: &TrackerConfig) -> Self {
        if profiler_attached && !config.module.disable_runtime_instrumentation {
            return InstrumentationMode::RuntimeProfiler;
        }
        InstrumentationMode::FrameworkEvents {
            diagnostic_source: config.module.enable_diagnostic_source_instrumentation,
        }
    }

    fn sql_source(self) -> SourceKind {
        match self {
            InstrumentationMode::RuntimeProfiler => SourceKind::Profiler,
            InstrumentationMode::FrameworkEvents { .. } => SourceKind::Framework,
        }
    }
}

pub struct DependencyTrackingModule {
    config: TrackerConfig,
    tracker: Arc<DependencyTracker>,
    metrics: SharedMetrics,
    profiler_attached: bool,
    mode: OnceLock<InstrumentationMode>,

    shutdown_tx: broadcast::Sender<()>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    initialized: AtomicBool,
}

impl DependencyTrackingModule {
    pub fn new(
        config: TrackerConfig,
        sink: Arc<dyn TelemetrySink>,
        fetcher: Arc<dyn CorrelationIdFetcher>,
    ) -> Self {
        let metrics = create_metrics();

        let cache = Arc::new(CorrelationCache::new(
            config.cache.entry_ttl(),
            metrics.clone(),
        ));

        let resolver = CorrelationIdResolver::new(
            fetcher,
            config.resolver.failure_backoff(),
            config.resolver.fetch_timeout(),
            metrics.clone(),
        );
        for (endpoint, id) in &config.resolver.known_ids {
            resolver.prime(endpoint, id.clone());
        }

        let tracker = Arc::new(DependencyTracker::new(
            &config,
            cache,
            resolver,
            sink,
            metrics.clone(),
        ));

        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            tracker,
            metrics,
            profiler_attached: false,
            mode: OnceLock::new(),
            shutdown_tx,
            sweeper: Mutex::new(None),
            initialized: AtomicBool::new(false),
        }
    }

    /// Whether the host has a runtime profiler attached
    pub fn with_profiler_attached(mut self, attached: bool) -> Self {
        self.profiler_attached = attached;
        self
    }

    /// Start background work and select the active sources; later calls are
    /// no-ops
    ///
    /// Must be called from within a Tokio runtime.
    pub fn initialize(&self) {
        if self.initialized.swap(true, Ordering::AcqRel) {
            debug!("Dependency tracking already initialized");
            return;
        }

        let mode = *self
            .mode
            .get_or_init(|| InstrumentationMode::select(self.profiler_attached, &self.config));
        match mode {
            InstrumentationMode::RuntimeProfiler => info!("Profiler is attached, using runtime instrumentation"),
            InstrumentationMode::FrameworkEvents { diagnostic_source } => {
                if !self.profiler_attached {
                    info!("Profiler is not attached, using framework events");
                } else {
                    info!("Runtime instrumentation is disabled, using framework events");
                }
                if diagnostic_source {
                    info!("HTTP diagnostic source instrumentation enabled");
                }
            }
        }

        let handle = self.tracker.cache().spawn_sweeper(
            self.config.cache.sweep_interval(),
            self.shutdown_tx.subscribe(),
        );
        *self.sweeper.lock() = Some(handle);

        match self.tracker.instrumentation_key() {
            // Warm up our own identity so the first requests can carry it
            Some(key) => {
                if self.tracker.resolver().try_resolve(key).is_none() {
                    debug!("Own correlation id for {} not yet known, resolving", key);
                }
            }
            None => warn!("No instrumentation key configured, outgoing requests carry no source identity"),
        }

        info!(
            "Dependency tracking initialized (header injection: {}, {} excluded domains)",
            self.config.correlation.set_component_correlation_headers,
            self.config.correlation.excluded_domains.len()
        );
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// The selected sources; `None` before [`initialize`](Self::initialize)
    pub fn mode(&self) -> Option<InstrumentationMode> {
        self.mode.get().copied()
    }

    pub fn tracker(&self) -> &Arc<DependencyTracker> {
        &self.tracker
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn diagnostic_source(&self) -> Option<DiagnosticSourceHttp> {
        match self.mode()? {
            InstrumentationMode::FrameworkEvents {
                diagnostic_source: true,
            } => Some(DiagnosticSourceHttp::new(self.tracker.clone())),
            _ => None,
        }
    }

    pub fn framework_events(&self) -> Option<FrameworkEventHttp> {
        match self.mode()? {
            InstrumentationMode::FrameworkEvents { .. } => {
                Some(FrameworkEventHttp::new(self.tracker.clone()))
            }
            InstrumentationMode::RuntimeProfiler => None,
        }
    }

    pub fn profiler(&self) -> Option<ProfilerHttp> {
        match self.mode()? {
            InstrumentationMode::RuntimeProfiler => Some(ProfilerHttp::new(self.tracker.clone())),
            InstrumentationMode::FrameworkEvents { .. } => None,
        }
    }

    /// SQL callbacks for whichever source is active
    pub fn sql_commands(&self) -> Option<SqlCommandEvents> {
        let mode = self.mode()?;
        Some(SqlCommandEvents::new(self.tracker.clone(), mode.sql_source()))
    }

    /// Stop background work and wait for it to finish
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());

        let handle = self.sweeper.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Sweeper task ended abnormally: {}", e);
            }
        }

        let pending = self.tracker.cache().len();
        if pending > 0 {
            debug!("{} pending calls dropped at shutdown", pending);
        }
        info!("Dependency tracking shut down");
    }
}
