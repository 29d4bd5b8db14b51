//! depcorr - dependency call correlation
//!
//! Runs the correlation engine against synthetic traffic, inspects the
//! effective configuration, and queries correlation identities.

mod generator;

use clap::{Parser, Subcommand};
use depcorr_core::config::{ConfigLoader, TrackerConfig};
use depcorr_core::{ChannelSink, TelemetrySink};
use depcorr_correlate::DependencyTrackingModule;
use depcorr_profile::ProfileClient;
use generator::{DemoFetcher, TrafficGenerator, TrafficGeneratorConfig, DEMO_INSTRUMENTATION_KEY};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "depcorr")]
#[command(version)]
#[command(about = "Dependency call correlation engine", long_about = None)]
struct Cli {
    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log format (json, text)
    #[arg(short, long, default_value = "text")]
    format: String,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "DEPCORR_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive the engine with racing synthetic instrumentation sources
    Demo {
        /// Number of logical calls to generate
        #[arg(long, default_value = "20")]
        calls: u64,

        /// Delay between calls in milliseconds
        #[arg(long, default_value = "50")]
        interval: u64,

        /// Simulated network latency in milliseconds
        #[arg(long, default_value = "20")]
        latency: u64,

        /// Metrics output after the run (prometheus, json, none)
        #[arg(long, default_value = "prometheus")]
        metrics: String,

        /// Simulate a host without the runtime profiler attached
        #[arg(long)]
        no_profiler: bool,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Also write it to this path
        #[arg(long)]
        write: Option<PathBuf>,
    },

    /// Look up the correlation id for an instrumentation key
    Resolve {
        /// Instrumentation key to look up
        key: String,

        /// Profile query endpoint (defaults to the configured one)
        #[arg(long)]
        endpoint: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.clone());

    // CLI verbose flag takes precedence, then config
    let log_level = if cli.verbose > 0 {
        match cli.verbose {
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    } else {
        match config.module.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::WARN,
        }
    };

    // Logs go to stderr; stdout carries records
    let builder = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if cli.format == "json" {
        tracing::subscriber::set_global_default(builder.json().finish())?;
    } else {
        tracing::subscriber::set_global_default(builder.finish())?;
    }

    match cli.command {
        Commands::Demo {
            calls,
            interval,
            latency,
            metrics,
            no_profiler,
        } => {
            demo_command(
                config,
                TrafficGeneratorConfig {
                    calls,
                    interval_ms: interval,
                    latency_ms: latency,
                },
                !no_profiler,
                &metrics,
            )
            .await
        }
        Commands::Config { write } => config_command(&config, write),
        Commands::Resolve { key, endpoint } => resolve_command(&config, &key, endpoint).await,
    }
}

/// Load configuration from file/env, with fallback to defaults
fn load_config(cli_path: Option<PathBuf>) -> TrackerConfig {
    let loader = ConfigLoader::new().with_cli_path(cli_path);
    match loader.load() {
        Ok(config) => {
            info!("Configuration loaded successfully");
            config
        }
        Err(e) => {
            warn!("Failed to load configuration: {}, using defaults", e);
            TrackerConfig::default()
        }
    }
}

/// Demo mode - synthetic calls through every instrumentation source
async fn demo_command(
    mut config: TrackerConfig,
    traffic: TrafficGeneratorConfig,
    profiler_attached: bool,
    metrics_format: &str,
) -> anyhow::Result<()> {
    let instrumentation_key = config
        .module
        .instrumentation_key
        .get_or_insert_with(|| DEMO_INSTRUMENTATION_KEY.to_string())
        .clone();

    eprintln!();
    eprintln!("  depcorr v{} - DEMO MODE", env!("CARGO_PKG_VERSION"));
    eprintln!();
    eprintln!("  Generating {} calls every {}ms", traffic.calls, traffic.interval_ms);
    eprintln!();

    let (sink, mut rx) = ChannelSink::channel(1024);
    let sink = Arc::new(sink);

    let module = DependencyTrackingModule::new(
        config,
        Arc::clone(&sink) as Arc<dyn TelemetrySink>,
        Arc::new(DemoFetcher::new(&instrumentation_key)),
    )
    .with_profiler_attached(profiler_attached);
    module.initialize();
    let module = Arc::new(module);

    let printer = tokio::spawn(async move {
        let mut printed = 0u64;
        while let Some(record) = rx.recv().await {
            println!("{}", serde_json::to_string(&record)?);
            printed += 1;
        }
        Ok::<_, anyhow::Error>(printed)
    });

    let generator = TrafficGenerator::new(traffic, Arc::clone(&module));
    generator.run().await;
    module.shutdown().await;

    let calls = generator.calls_started();
    let metrics = Arc::clone(module.metrics());

    // Every sender must be gone before the printer can finish
    drop(generator);
    drop(module);
    let dropped = sink.dropped();
    drop(sink);

    let printed = printer.await??;
    info!(
        "Demo finished: {} calls, {} records, {} dropped",
        calls, printed, dropped
    );

    match metrics_format {
        "json" => eprintln!("{}", serde_json::to_string_pretty(&metrics.to_json())?),
        "none" => {}
        _ => eprintln!("{}", metrics.to_prometheus()),
    }

    Ok(())
}

fn config_command(config: &TrackerConfig, write: Option<PathBuf>) -> anyhow::Result<()> {
    print!("{}", toml::to_string_pretty(config)?);

    if let Some(path) = write {
        ConfigLoader::new().save(config, &path)?;
        eprintln!("Configuration written to {}", path.display());
    }
    Ok(())
}

async fn resolve_command(
    config: &TrackerConfig,
    key: &str,
    endpoint: Option<String>,
) -> anyhow::Result<()> {
    let endpoint = endpoint.unwrap_or_else(|| config.module.effective_profile_query_endpoint());
    let client = ProfileClient::new(&endpoint, config.resolver.fetch_timeout())?;

    info!("Querying {} for {}", endpoint, key);
    let app_id = client.fetch_app_id(key).await?;
    println!("{}", depcorr_core::headers::format_correlation_id(&app_id));
    Ok(())
}
