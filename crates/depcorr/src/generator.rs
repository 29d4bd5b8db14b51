//! Synthetic dependency traffic
//!
//! Drives the tracking module the way instrumented applications do: several
//! sources reporting the same calls, duplicate and out-of-order callbacks,
//! calls that never get a response, SQL commands, and callees that report
//! their identity. Only the sources the module selected are used.
//! Useful for exercising the engine without real instrumentation.

use async_trait::async_trait;
use depcorr_core::{HttpRequest, HttpResponse, OperationContext, RequestKey};
use depcorr_correlate::{
    CorrelationIdFetcher, DependencyTrackingModule, DiagnosticSourceHttp, FetchError,
    FrameworkEventHttp, ProfilerHttp, SqlCommandEvents,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Instrumentation key used when the configuration names none
pub const DEMO_INSTRUMENTATION_KEY: &str = "00000000-0000-4000-8000-00000000d3e0";

/// Simulated downstream services: URL and the identity it reports (if any)
const SERVICES: &[(&str, Option<&str>)] = &[
    ("http://orders.internal.example.com/api/orders", Some("orders-svc")),
    ("https://inventory.internal.example.com:8443/stock/42", Some("inventory-svc")),
    ("https://shop.blob.core.windows.net/images/logo.png", None),
    ("http://legacy.internal.example.com/soap", None),
];

const STATUSES: &[i32] = &[200, 201, 302, 404, 500, 200, 204];

/// Simulated SQL servers: data source and database
const DATABASES: &[(&str, &str)] = &[
    ("sql-primary.internal.example.com", "inventory"),
    ("sql-replica.internal.example.com", "reporting"),
];

/// Answers identity lookups for the simulated services
pub struct DemoFetcher {
    ids: HashMap<String, String>,
}

impl DemoFetcher {
    pub fn new(instrumentation_key: &str) -> Self {
        let mut ids = HashMap::new();
        ids.insert(
            instrumentation_key.to_ascii_lowercase(),
            "cid-v1:demo-frontend".to_string(),
        );
        Self { ids }
    }
}

#[async_trait]
impl CorrelationIdFetcher for DemoFetcher {
    async fn fetch(&self, endpoint: &str) -> Result<String, FetchError> {
        // Simulated profile-query round trip
        tokio::time::sleep(Duration::from_millis(15)).await;
        self.ids
            .get(endpoint)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(endpoint.to_string()))
    }
}

/// Configuration for synthetic traffic
#[derive(Debug, Clone)]
pub struct TrafficGeneratorConfig {
    /// Number of logical calls to make
    pub calls: u64,

    /// Delay between starting calls in milliseconds
    pub interval_ms: u64,

    /// Simulated network latency in milliseconds
    pub latency_ms: u64,
}

impl Default for TrafficGeneratorConfig {
    fn default() -> Self {
        Self {
            calls: 20,
            interval_ms: 50,
            latency_ms: 20,
        }
    }
}

/// How a simulated call is reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scenario {
    /// Two End notifications for the same call race each other
    RacingEnds,
    /// Begin reported repeatedly and End more than once
    DuplicateCallbacks,
    /// A SQL command against the call's database
    SqlCommand,
    /// The call fails without a response
    NoResponse,
}

impl Scenario {
    fn for_call(n: u64) -> Self {
        match n % 4 {
            0 => Scenario::RacingEnds,
            1 => Scenario::DuplicateCallbacks,
            2 => Scenario::SqlCommand,
            _ => Scenario::NoResponse,
        }
    }
}

/// Adapters for the sources the module selected
#[derive(Clone)]
enum HttpSources {
    Profiler(ProfilerHttp),
    Framework {
        framework: FrameworkEventHttp,
        diagnostic: Option<DiagnosticSourceHttp>,
    },
}

impl HttpSources {
    fn from_module(module: &DependencyTrackingModule) -> Option<Self> {
        if let Some(profiler) = module.profiler() {
            return Some(HttpSources::Profiler(profiler));
        }
        Some(HttpSources::Framework {
            framework: module.framework_events()?,
            diagnostic: module.diagnostic_source(),
        })
    }
}

/// Generates racing instrumentation callbacks against a tracking module
pub struct TrafficGenerator {
    config: TrafficGeneratorConfig,
    module: Arc<DependencyTrackingModule>,
    calls_started: Arc<AtomicU64>,
}

impl TrafficGenerator {
    pub fn new(config: TrafficGeneratorConfig, module: Arc<DependencyTrackingModule>) -> Self {
        Self {
            config,
            module,
            calls_started: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn calls_started(&self) -> u64 {
        self.calls_started.load(Ordering::Relaxed)
    }

    /// Make every configured call and wait for all of them to finish
    ///
    /// Makes no calls when the module has not been initialized.
    pub async fn run(&self) {
        let (Some(http), Some(sql)) = (
            HttpSources::from_module(&self.module),
            self.module.sql_commands(),
        ) else {
            warn!("Tracking module not initialized, no traffic generated");
            return;
        };

        info!(
            "Generating {} calls every {}ms ({:?})",
            self.config.calls,
            self.config.interval_ms,
            self.module.mode()
        );

        let mut handles = Vec::with_capacity(self.config.calls as usize);
        for n in 0..self.config.calls {
            let http = http.clone();
            let sql = sql.clone();
            let latency = Duration::from_millis(self.config.latency_ms + (n % 3) * 5);
            let ctx = OperationContext::new_root(format!("GET /checkout/{}", n))
                .with_baggage("demo-call", n.to_string());

            handles.push(tokio::spawn(ctx.scope(simulate_call(http, sql, n, latency))));
            self.calls_started.fetch_add(1, Ordering::Relaxed);

            if self.config.interval_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.interval_ms)).await;
            }
        }

        for result in futures_util::future::join_all(handles).await {
            if let Err(e) = result {
                debug!("Simulated call task failed: {}", e);
            }
        }
    }
}

fn response_for(n: u64, identity: Option<&str>) -> HttpResponse {
    let status = STATUSES[(n as usize) % STATUSES.len()] as u16;
    let response = HttpResponse::new(status);
    match identity {
        Some(id) => response.with_header("request-context", &format!("appId=cid-v1:{}", id)),
        None => response,
    }
}

async fn simulate_call(http: HttpSources, sql: SqlCommandEvents, n: u64, latency: Duration) {
    let (url, identity) = SERVICES[(n as usize) % SERVICES.len()];
    let mut request = HttpRequest::get(url);
    let key: RequestKey = request.key();
    let scenario = Scenario::for_call(n);
    debug!("Call {} ({:?}) -> {}", n, scenario, url);

    if scenario == Scenario::SqlCommand {
        let (data_source, database) = DATABASES[(n as usize) % DATABASES.len()];
        sql.on_begin_execute(key, data_source, database, "SELECT * FROM stock WHERE sku = @sku", None);
        tokio::time::sleep(latency).await;
        // Every third command hits a deadlock
        match n % 3 {
            0 => sql.on_end_execute(key, false, 1205),
            _ => sql.on_end_execute(key, true, 0),
        };
        return;
    }

    match http {
        HttpSources::Profiler(profiler) => match scenario {
            Scenario::RacingEnds => {
                profiler.on_begin(&mut request, None);
                tokio::time::sleep(latency).await;

                let response = response_for(n, identity);
                tokio::join!(
                    profiler.on_end(&request, Some(&response)),
                    profiler.on_end(&request, Some(&response)),
                );
            }
            Scenario::DuplicateCallbacks => {
                for _ in 0..3 {
                    profiler.on_begin(&mut request, None);
                }
                tokio::time::sleep(latency).await;

                let response = response_for(n, identity);
                profiler.on_end(&request, Some(&response)).await;
                profiler.on_end(&request, Some(&response)).await;
            }
            _ => {
                profiler.on_begin(&mut request, None);
                tokio::time::sleep(latency).await;
                profiler.on_end(&request, None).await;
            }
        },
        HttpSources::Framework {
            framework,
            diagnostic,
        } => match (scenario, diagnostic) {
            (Scenario::RacingEnds, Some(diagnostic)) => {
                diagnostic.on_request_send(&mut request, None);
                // Skipped: the diagnostic source already reported this call
                framework.on_begin_http_callback(key, url, None);
                debug!("Outgoing headers for call {}: {:?}", n, request.headers);
                tokio::time::sleep(latency).await;

                let response = response_for(n, identity);
                let status = i32::from(response.status);
                tokio::join!(
                    diagnostic.on_response_receive(&request, &response),
                    framework.on_end_http_callback(key, Some(true), false, Some(status)),
                );
            }
            (Scenario::NoResponse, _) => {
                framework.on_begin_http_callback(key, url, None);
                tokio::time::sleep(latency).await;
                framework.on_end_http_callback(key, Some(false), false, None).await;
            }
            _ => {
                for _ in 0..3 {
                    framework.on_begin_http_callback(key, url, None);
                }
                tokio::time::sleep(latency).await;

                let status = i32::from(response_for(n, identity).status);
                tokio::join!(
                    framework.on_end_http_callback(key, Some(true), false, Some(status)),
                    framework.on_end_http_callback(key, Some(true), true, Some(status)),
                );
            }
        },
    }
}
