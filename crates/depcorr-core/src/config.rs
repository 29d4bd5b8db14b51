//! Configuration for the dependency tracker
//!
//! Provides:
//! - Config file discovery (CLI flag, env var, standard paths)
//! - TOML parsing with serde
//! - Environment variable overrides
//! - Validation

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Complete tracker configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Module settings
    pub module: ModuleSettings,

    /// Correlation header settings
    pub correlation: CorrelationSettings,

    /// Pending-call cache settings
    pub cache: CacheSettings,

    /// Correlation id resolution settings
    pub resolver: ResolverSettings,
}

/// Module settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleSettings {
    /// Log level: trace, debug, info, warn, error
    pub log_level: String,

    /// This component's instrumentation key; its resolved identity is sent
    /// on outgoing requests
    pub instrumentation_key: Option<String>,

    /// Telemetry ingestion endpoint; calls to it are never tracked
    pub ingestion_endpoint: String,

    /// Endpoint queried for correlation ids; defaults to the ingestion host
    pub profile_query_endpoint: Option<String>,

    /// Never use the runtime profiler, even when one is attached; framework
    /// events take over
    pub disable_runtime_instrumentation: bool,

    /// Also listen to the HTTP diagnostic source when running on framework
    /// events
    pub enable_diagnostic_source_instrumentation: bool,
}

impl Default for ModuleSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            instrumentation_key: None,
            ingestion_endpoint: "https://dc.services.visualstudio.com/v2/track".to_string(),
            profile_query_endpoint: None,
            disable_runtime_instrumentation: false,
            enable_diagnostic_source_instrumentation: false,
        }
    }
}

impl ModuleSettings {
    /// The profile query endpoint actually in use
    ///
    /// Falls back to the scheme and authority of the ingestion endpoint.
    pub fn effective_profile_query_endpoint(&self) -> String {
        if let Some(endpoint) = self.profile_query_endpoint.as_deref() {
            if !endpoint.trim().is_empty() {
                return endpoint.trim_end_matches('/').to_string();
            }
        }

        match url::Url::parse(&self.ingestion_endpoint) {
            Ok(url) => url.origin().ascii_serialization(),
            Err(_) => self.ingestion_endpoint.trim_end_matches('/').to_string(),
        }
    }
}

/// How to decide success when an End carries no status code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuccessPolicy {
    /// Only a status code in `1..400` counts as success
    #[default]
    StatusCode,

    /// Prefer the status code, fall back to the source's success flag
    StatusCodeThenSignal,
}

/// Correlation header settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationSettings {
    /// Inject correlation headers on outgoing requests
    pub set_component_correlation_headers: bool,

    /// Hosts (or host fragments) that never receive correlation headers
    pub excluded_domains: Vec<String>,

    /// Success computation when no status code is available
    pub success_policy: SuccessPolicy,

    /// Resolve the target host's identity when the response carries none
    pub resolve_unannotated_targets: bool,
}

impl Default for CorrelationSettings {
    fn default() -> Self {
        Self {
            set_component_correlation_headers: true,
            excluded_domains: vec![
                "core.windows.net".to_string(),
                "core.chinacloudapi.cn".to_string(),
                "core.cloudapi.de".to_string(),
                "core.usgovcloudapi.net".to_string(),
            ],
            success_policy: SuccessPolicy::default(),
            resolve_unannotated_targets: false,
        }
    }
}

/// Pending-call cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Lifetime of a pending call without an End (ms)
    pub entry_ttl_ms: u64,

    /// Interval of the background expiry sweep (ms)
    pub sweep_interval_ms: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            entry_ttl_ms: 100_000,
            sweep_interval_ms: 10_000,
        }
    }
}

impl CacheSettings {
    pub fn entry_ttl(&self) -> Duration {
        Duration::from_millis(self.entry_ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Correlation id resolution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverSettings {
    /// How long a failed lookup suppresses new fetches (ms)
    pub failure_backoff_ms: u64,

    /// Upper bound on a single fetch (ms)
    pub fetch_timeout_ms: u64,

    /// Identities known up front, keyed by endpoint
    pub known_ids: HashMap<String, String>,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            failure_backoff_ms: 30_000,
            fetch_timeout_ms: 5_000,
            known_ids: HashMap::new(),
        }
    }
}

impl ResolverSettings {
    pub fn failure_backoff(&self) -> Duration {
        Duration::from_millis(self.failure_backoff_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

/// Configuration loader
pub struct ConfigLoader {
    /// Path to config file (if specified via CLI)
    cli_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new config loader
    pub fn new() -> Self {
        Self { cli_path: None }
    }

    /// Set the config path from CLI argument
    pub fn with_cli_path(mut self, path: Option<PathBuf>) -> Self {
        self.cli_path = path;
        self
    }

    /// Load configuration with the following precedence:
    /// 1. CLI --config flag
    /// 2. DEPCORR_CONFIG environment variable
    /// 3. ~/.config/depcorr/config.toml
    /// 4. /etc/depcorr/config.toml
    /// 5. Default values
    pub fn load(&self) -> ConfigResult<TrackerConfig> {
        let config_path = self.find_config_file();

        let mut config = if let Some(path) = config_path {
            info!("Loading configuration from: {}", path.display());
            self.load_from_file(&path)?
        } else {
            debug!("No config file found, using defaults");
            TrackerConfig::default()
        };

        self.apply_env_overrides(&mut config);
        self.validate(&config)?;

        Ok(config)
    }

    /// Find the config file to use
    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.cli_path {
            if path.exists() {
                return Some(path.clone());
            }
            warn!("CLI config path does not exist: {}", path.display());
        }

        if let Ok(env_path) = std::env::var("DEPCORR_CONFIG") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
            warn!("DEPCORR_CONFIG path does not exist: {}", env_path);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let path = config_dir.join("depcorr").join("config.toml");
            if path.exists() {
                return Some(path);
            }
        }

        #[cfg(unix)]
        {
            let path = PathBuf::from("/etc/depcorr/config.toml");
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    /// Load configuration from a TOML file
    pub fn load_from_file(&self, path: &Path) -> ConfigResult<TrackerConfig> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        let config: TrackerConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&self, config: &mut TrackerConfig) {
        if let Ok(val) = std::env::var("DEPCORR_LOG_LEVEL") {
            config.module.log_level = val;
        }
        if let Ok(val) = std::env::var("DEPCORR_INSTRUMENTATION_KEY") {
            config.module.instrumentation_key = Some(val);
        }
        if let Ok(val) = std::env::var("DEPCORR_INGESTION_ENDPOINT") {
            config.module.ingestion_endpoint = val;
        }
        if let Ok(val) = std::env::var("DEPCORR_PROFILE_QUERY_ENDPOINT") {
            config.module.profile_query_endpoint = Some(val);
        }

        if let Ok(val) = std::env::var("DEPCORR_DISABLE_RUNTIME_INSTRUMENTATION") {
            config.module.disable_runtime_instrumentation = val
                .parse()
                .unwrap_or(config.module.disable_runtime_instrumentation);
        }
        if let Ok(val) = std::env::var("DEPCORR_ENABLE_DIAGNOSTIC_SOURCE") {
            config.module.enable_diagnostic_source_instrumentation = val
                .parse()
                .unwrap_or(config.module.enable_diagnostic_source_instrumentation);
        }

        if let Ok(val) = std::env::var("DEPCORR_SET_CORRELATION_HEADERS") {
            config.correlation.set_component_correlation_headers = val
                .parse()
                .unwrap_or(config.correlation.set_component_correlation_headers);
        }
        if let Ok(val) = std::env::var("DEPCORR_EXCLUDED_DOMAINS") {
            config.correlation.excluded_domains = val
                .split(',')
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty())
                .collect();
        }

        if let Ok(val) = std::env::var("DEPCORR_CACHE_TTL_MS") {
            if let Ok(ttl) = val.parse() {
                config.cache.entry_ttl_ms = ttl;
            }
        }
        if let Ok(val) = std::env::var("DEPCORR_RESOLVER_BACKOFF_MS") {
            if let Ok(backoff) = val.parse() {
                config.resolver.failure_backoff_ms = backoff;
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self, config: &TrackerConfig) -> ConfigResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.module.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                config.module.log_level, valid_levels
            )));
        }

        if url::Url::parse(&config.module.ingestion_endpoint).is_err() {
            return Err(ConfigError::ValidationError(format!(
                "Invalid ingestion endpoint: {}",
                config.module.ingestion_endpoint
            )));
        }

        if let Some(endpoint) = &config.module.profile_query_endpoint {
            if url::Url::parse(endpoint).is_err() {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid profile query endpoint: {}",
                    endpoint
                )));
            }
        }

        if config.cache.entry_ttl_ms == 0 {
            return Err(ConfigError::ValidationError(
                "Cache entry TTL cannot be 0".to_string(),
            ));
        }
        if config.cache.sweep_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "Cache sweep interval cannot be 0".to_string(),
            ));
        }
        if config.resolver.fetch_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "Resolver fetch timeout cannot be 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Save configuration to a file
    pub fn save(&self, config: &TrackerConfig, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(config).map_err(|e| {
            ConfigError::ValidationError(format!("Failed to serialize config: {}", e))
        })?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, content)?;
        info!("Configuration saved to: {}", path.display());
        Ok(())
    }

    /// Get the default config file path for the current platform
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("depcorr").join("config.toml"))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper module for platform-specific directories
mod dirs {
    use std::path::PathBuf;

    /// Get the user's config directory
    pub fn config_dir() -> Option<PathBuf> {
        #[cfg(target_os = "macos")]
        {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join(".config"))
        }

        #[cfg(target_os = "linux")]
        {
            std::env::var("XDG_CONFIG_HOME")
                .ok()
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|h| PathBuf::from(h).join(".config"))
                })
        }

        #[cfg(target_os = "windows")]
        {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        }

        #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
        {
            None
        }
    }
}
