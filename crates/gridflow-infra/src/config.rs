//! Configuration loader for gridflow.
//!
//! Reads `config.toml` from the data directory (`~/.gridflow/` in production)
//! and deserializes it into [`GridflowConfig`]. Falls back to defaults when
//! the file is missing or malformed.

use std::path::{Path, PathBuf};

use gridflow_types::config::GridflowConfig;

/// Resolve the data directory.
///
/// `GRIDFLOW_DATA_DIR` wins; otherwise `~/.gridflow`, and `./.gridflow` when
/// no home directory can be determined.
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("GRIDFLOW_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".gridflow");
    }

    PathBuf::from(".gridflow")
}

/// Load configuration from `{data_dir}/config.toml`.
///
/// - Missing file: defaults.
/// - Unreadable or unparsable file: a warning and defaults.
/// - `failure_threshold` outside `[0, 1]` is clamped with a warning.
pub async fn load_config(data_dir: &Path) -> GridflowConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return GridflowConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return GridflowConfig::default();
        }
    };

    match toml::from_str::<GridflowConfig>(&content) {
        Ok(config) => sanitize(config),
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            GridflowConfig::default()
        }
    }
}

fn sanitize(mut config: GridflowConfig) -> GridflowConfig {
    let threshold = config.engine.failure_threshold;
    if threshold.is_nan() || !(0.0..=1.0).contains(&threshold) {
        let clamped = if threshold.is_nan() { 0.5 } else { threshold.clamp(0.0, 1.0) };
        tracing::warn!(
            configured = threshold,
            clamped,
            "engine.failure_threshold out of range"
        );
        config.engine.failure_threshold = clamped;
    }
    if config.engine.max_concurrency == Some(0) {
        tracing::warn!("engine.max_concurrency = 0 ignored");
        config.engine.max_concurrency = None;
    }
    config
}

/// Resolve a configured directory; relative paths hang off `data_dir`.
pub fn resolve_dir(data_dir: &Path, configured: &str) -> PathBuf {
    let dir = Path::new(configured);
    if dir.is_absolute() {
        dir.to_path_buf()
    } else {
        data_dir.join(dir)
    }
}
