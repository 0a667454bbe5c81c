//! Shared config record & validation (C12).
//!
//! Every runtime parameter is resolved once at startup with precedence
//! command-line flag → environment variable → configuration file → built-in
//! default. Each layer is represented as a struct of `Option<T>` fields
//! ([`ServerConfigLayer`] / [`ClientConfigLayer`]); [`ServerConfigLayer::merge`]
//! folds layers together (later layer wins per-field, `None` defers to the
//! earlier layer), and `.validate()` turns the fully-merged layer into the
//! typed, non-optional [`ServerConfig`] / [`ClientConfig`] everything else
//! consumes. Unknown YAML keys are rejected at parse time.

use std::path::{Path, PathBuf};

use certdeploy_logging::{LogLevel, SinkConfig};
use certdeploy_types::CertDeployError;
use serde::Deserialize;

pub mod client;
pub mod server;

pub use client::{ClientConfig, ClientConfigLayer, SftpdConfig, SftpdConfigLayer};
pub use server::{PushMode, RenewUnit, ServerConfig, ServerConfigLayer};

type Result<T> = std::result::Result<T, CertDeployError>;

/// Load a YAML layer from `path`, rejecting unknown top-level keys. A
/// missing file yields an all-`None` layer (every field absent, so the
/// merge falls through to env/flag/default).
fn load_yaml_layer<T>(path: &Path) -> Result<T>
where
    T: for<'de> Deserialize<'de> + Default,
{
    if !path.exists() {
        return Ok(T::default());
    }
    let content = std::fs::read_to_string(path).map_err(|e| {
        CertDeployError::config(format!("cannot read config file {}: {e}", path.display()))
    })?;
    serde_yaml::from_str(&content).map_err(|e| {
        CertDeployError::config(format!("cannot parse config file {}: {e}", path.display()))
    })
}

fn log_sink(filename: &Option<PathBuf>, level: &Option<LogLevel>, default_level: LogLevel) -> SinkConfig {
    SinkConfig {
        path: filename
            .clone()
            .unwrap_or_else(|| PathBuf::from("/dev/stdout")),
        level: level.unwrap_or(default_level),
    }
}

fn require<T>(value: Option<T>, field: &str, type_phrase: &str) -> Result<T> {
    value.ok_or_else(|| {
        CertDeployError::config(format!("{field} must be {type_phrase}"))
    })
}

fn non_negative(value: Option<i64>, field: &str) -> Result<Option<u64>> {
    match value {
        None => Ok(None),
        Some(v) if v >= 0 => Ok(Some(v as u64)),
        Some(_) => Err(CertDeployError::config(format!(
            "{field} must be a non-negative integer"
        ))),
    }
}
