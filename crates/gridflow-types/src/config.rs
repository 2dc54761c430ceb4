//! Configuration types for gridflow.
//!
//! `GridflowConfig` mirrors `{data_dir}/config.toml`. Every field has a
//! default, so an empty file (or no file) yields a working configuration.

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GridflowConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub export: OutputConfig,
    #[serde(default)]
    pub documents: DocumentsConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Execution policy shared by every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Fraction of failed work units above which an analysis step fails.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: f64,

    /// Treat an empty Filter result as a step failure.
    #[serde(default)]
    pub fail_on_empty: bool,

    /// Per-step worker bound. Unset means "one worker per analysis credential".
    #[serde(default)]
    pub max_concurrency: Option<usize>,

    /// Timeout applied to every external service call.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    /// Heartbeat age after which a run's lease counts as abandoned.
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,

    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_failure_threshold() -> f64 {
    0.5
}

fn default_call_timeout_secs() -> u64 {
    120
}

fn default_lease_ttl_secs() -> u64 {
    60
}

fn default_heartbeat_interval_secs() -> u64 {
    15
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            fail_on_empty: false,
            max_concurrency: None,
            call_timeout_secs: default_call_timeout_secs(),
            lease_ttl_secs: default_lease_ttl_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            retry: RetryConfig::default(),
        }
    }
}

/// Per-call retry with exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// Where export steps write files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Relative paths are resolved against the data directory.
    #[serde(default = "default_export_dir")]
    pub dir: String,
}

fn default_export_dir() -> String {
    "exports".to_string()
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_export_dir(),
        }
    }
}

/// Root of the filesystem document store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentsConfig {
    /// Relative paths are resolved against the data directory.
    #[serde(default = "default_documents_dir")]
    pub dir: String,
}

fn default_documents_dir() -> String {
    "documents".to_string()
}

impl Default for DocumentsConfig {
    fn default() -> Self {
        Self {
            dir: default_documents_dir(),
        }
    }
}

/// HTTP analysis service endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default = "default_analysis_endpoint")]
    pub endpoint: String,
    /// One entry per credential; the count bounds analysis concurrency.
    #[serde(default)]
    pub api_keys: Vec<String>,
}

fn default_analysis_endpoint() -> String {
    "http://127.0.0.1:8700".to_string()
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            endpoint: default_analysis_endpoint(),
            api_keys: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Tracing subscriber settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// Bridge spans to OpenTelemetry (stdout exporter).
    #[serde(default)]
    pub otel: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            otel: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = GridflowConfig::default();
        assert_eq!(config.engine.failure_threshold, 0.5);
        assert!(!config.engine.fail_on_empty);
        assert_eq!(config.engine.max_concurrency, None);
        assert_eq!(config.engine.retry.max_attempts, 3);
        assert_eq!(config.export.dir, "exports");
        assert_eq!(config.documents.dir, "documents");
        assert!(config.analysis.api_keys.is_empty());
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn test_deserialize_empty_uses_defaults() {
        let config: GridflowConfig = toml::from_str("").unwrap();
        assert_eq!(config, GridflowConfig::default());
    }

    #[test]
    fn test_deserialize_partial_sections() {
        let toml_str = r#"
[engine]
failure_threshold = 0.25
fail_on_empty = true
max_concurrency = 8

[engine.retry]
max_attempts = 5

[analysis]
endpoint = "https://analysis.internal"
api_keys = ["k1", "k2"]

[logging]
format = "json"
"#;
        let config: GridflowConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.engine.failure_threshold, 0.25);
        assert!(config.engine.fail_on_empty);
        assert_eq!(config.engine.max_concurrency, Some(8));
        assert_eq!(config.engine.retry.max_attempts, 5);
        assert_eq!(config.engine.retry.initial_backoff_ms, 500);
        assert_eq!(config.engine.call_timeout_secs, 120);
        assert_eq!(config.analysis.endpoint, "https://analysis.internal");
        assert_eq!(config.analysis.api_keys.len(), 2);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(!config.logging.otel);
    }
}
