//! Logging/observability split (C11): two independently configured
//! sinks, application and SFTP, each with its own file path (or
//! `/dev/stdout`/`/dev/null`) and level.
//!
//! Error lines carry a stable prefix — `ERROR:certdeploy-server:` or
//! `ERROR:certdeploy-client:` — plus the error kind tag, which the
//! integration tests in §8 match against verbatim. [`error_prefix`]
//! centralizes that format so every call site produces it identically.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::Layer;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Target used for every `tracing` call in the application's own logic
/// (push engine, scheduler, promoter, drivers).
pub const APP_TARGET: &str = "certdeploy::app";

/// Target used for every `tracing` call inside the SFTP transport layer
/// (connect, auth, protocol handling).
pub const SFTP_TARGET: &str = "certdeploy::sftp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    /// Tracing has no level above `ERROR`; `Critical` filters the same as
    /// `Error` but exists so config files can use the full five-level
    /// vocabulary without a rejected value.
    Critical,
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARNING" => Ok(LogLevel::Warning),
            "ERROR" => Ok(LogLevel::Error),
            "CRITICAL" => Ok(LogLevel::Critical),
            other => Err(format!("unknown log level {other:?}, expected one of DEBUG/INFO/WARNING/ERROR/CRITICAL")),
        }
    }
}

impl LogLevel {
    fn to_tracing(self) -> Level {
        match self {
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warning => Level::WARN,
            LogLevel::Error | LogLevel::Critical => Level::ERROR,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub path: PathBuf,
    pub level: LogLevel,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/dev/stdout"),
            level: LogLevel::Info,
        }
    }
}

/// Which binary is logging, used only to render the stable error prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl Role {
    fn as_str(self) -> &'static str {
        match self {
            Role::Server => "certdeploy-server",
            Role::Client => "certdeploy-client",
        }
    }
}

/// Build the stable `ERROR:certdeploy-{server,client}:<Kind>: <message>`
/// line required by §4.11 and exercised by the integration tests.
pub fn error_prefix(role: Role, kind_tag: &str, message: &str) -> String {
    format!("ERROR:{}:{}: {}", role.as_str(), kind_tag, message)
}

/// Holds the worker guards that keep each sink's background flush thread
/// alive; drop this only at process shutdown.
pub struct LoggingHandle {
    _app_guard: WorkerGuard,
    _sftp_guard: WorkerGuard,
}

/// Initialize the global `tracing` subscriber with two independently
/// filtered layers, one per sink.
pub fn init(app: &SinkConfig, sftp: &SinkConfig) -> Result<LoggingHandle> {
    let (app_writer, app_guard) = non_blocking_writer_for(&app.path)?;
    let (sftp_writer, sftp_guard) = non_blocking_writer_for(&sftp.path)?;

    let app_layer = tracing_subscriber::fmt::layer()
        .with_writer(app_writer)
        .with_target(true)
        .with_filter(Targets::new().with_target(APP_TARGET, app.level.to_tracing()));

    let sftp_layer = tracing_subscriber::fmt::layer()
        .with_writer(sftp_writer)
        .with_target(true)
        .with_filter(Targets::new().with_target(SFTP_TARGET, sftp.level.to_tracing()));

    tracing_subscriber::registry()
        .with(app_layer)
        .with(sftp_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(LoggingHandle {
        _app_guard: app_guard,
        _sftp_guard: sftp_guard,
    })
}

fn non_blocking_writer_for(path: &Path) -> Result<(NonBlocking, WorkerGuard)> {
    if path == Path::new("/dev/null") {
        return Ok(tracing_appender::non_blocking(std::io::sink()));
    }
    if path == Path::new("/dev/stdout") {
        return Ok(tracing_appender::non_blocking(std::io::stdout()));
    }
    if path == Path::new("/dev/stderr") {
        return Ok(tracing_appender::non_blocking(std::io::stderr()));
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;
    Ok(tracing_appender::non_blocking(file))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_prefix_matches_spec_format() {
        let line = error_prefix(Role::Client, "ContainerNotFound", "no_such");
        assert_eq!(line, "ERROR:certdeploy-client:ContainerNotFound: no_such");
    }

    #[test]
    fn server_prefix_uses_server_name() {
        let line = error_prefix(Role::Server, "ConfigError", "push_interval must be an integer");
        assert!(line.starts_with("ERROR:certdeploy-server:ConfigError:"));
    }

    #[test]
    fn critical_and_error_filter_identically() {
        assert_eq!(LogLevel::Critical.to_tracing(), Level::ERROR);
        assert_eq!(LogLevel::Error.to_tracing(), Level::ERROR);
    }

    #[test]
    fn log_level_parses_case_insensitively() {
        assert_eq!("info".parse::<LogLevel>().unwrap(), LogLevel::Info);
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warning);
        assert!("bogus".parse::<LogLevel>().is_err());
    }

    #[test]
    fn sink_default_is_stdout_at_info() {
        let sink = SinkConfig::default();
        assert_eq!(sink.path, PathBuf::from("/dev/stdout"));
        assert_eq!(sink.level, LogLevel::Info);
    }
}
