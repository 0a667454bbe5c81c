//! Client daemon orchestrator (C10): watches the staging area for
//! completed lineage uploads and drives each one through promotion and
//! the configured service updates.
//!
//! `idle -> uploading -> promoting -> updating -> idle` (§4.10).
//! "Uploading" is implicit: the state machine only wakes up once C3's
//! completion marker lands, so there is nothing to model between idle and
//! the marker's arrival.

use std::path::{Path, PathBuf};
use std::time::Duration;

use certdeploy_config::ClientConfig;
use certdeploy_drivers::DriverDefaults;
use certdeploy_types::CertDeployError;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{error, info, warn};

use crate::promoter;

/// Run the watch loop for the lifetime of the process. Returns only on a
/// fatal error: the watcher itself failing to start, or a driver failure
/// while `fail_fast` is set.
pub async fn run(config: &ClientConfig) -> Result<(), CertDeployError> {
    std::fs::create_dir_all(&config.source_dir)
        .map_err(|e| CertDeployError::config(format!("cannot create source_dir: {e}")))?;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut watcher: RecommendedWatcher = notify::recommended_watcher(move |res| {
        let _ = tx.send(res);
    })
    .map_err(|e| CertDeployError::config(format!("cannot start filesystem watcher: {e}")))?;
    watcher
        .watch(&config.source_dir, RecursiveMode::Recursive)
        .map_err(|e| {
            CertDeployError::config(format!("cannot watch {}: {e}", config.source_dir.display()))
        })?;

    info!(source_dir = %config.source_dir.display(), "watching for completed lineage uploads");

    while let Some(event) = rx.recv().await {
        let event = match event {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "filesystem watch error");
                continue;
            }
        };
        for lineage in completed_lineages(&event, &config.source_dir) {
            if let Err(e) = handle_completed_lineage(config, &lineage).await {
                error!("{e}");
                if config.fail_fast {
                    return Err(e);
                }
            }
        }
    }

    // The watcher's sender half has dropped, meaning the watcher itself
    // was torn down (e.g. the inotify instance died) — that is fatal for
    // a daemon whose entire job is observing `source_dir`.
    Err(CertDeployError::config("filesystem watcher channel closed unexpectedly"))
}

/// Lineage names newly signaled complete by this event, relative to
/// `source_dir`.
fn completed_lineages(event: &notify::Event, source_dir: &Path) -> Vec<String> {
    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
        return Vec::new();
    }
    event
        .paths
        .iter()
        .filter(|p| p.file_name().is_some_and(|n| n == promoter::COMPLETION_MARKER))
        .filter_map(|p| p.parent())
        .filter_map(|p| p.strip_prefix(source_dir).ok())
        .filter_map(|p| p.to_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

async fn handle_completed_lineage(config: &ClientConfig, lineage: &str) -> Result<(), CertDeployError> {
    info!(lineage, "lineage upload complete, promoting");

    let source_dir = config.source_dir.clone();
    let destination = config.destination.clone();
    let permissions = config.file_permissions.clone();
    let lineage_owned = lineage.to_string();

    tokio::task::spawn_blocking(move || promoter::promote(&source_dir, &lineage_owned, &destination, &permissions))
        .await
        .map_err(|e| CertDeployError::Promotion(format!("promotion task panicked: {e}")))??;

    run_update_drivers(config).await
}

/// Iterate `update_services` in declaration order (§4.10: "ordering is
/// not otherwise guaranteed to be stable across restarts", so we never
/// re-sort).
async fn run_update_drivers(config: &ClientConfig) -> Result<(), CertDeployError> {
    let defaults = DriverDefaults {
        docker_timeout: config.docker_timeout.map(Duration::from_secs),
        init_timeout: config.init_timeout.map(Duration::from_secs),
        script_timeout: config.script_timeout.map(Duration::from_secs),
    };
    let script_cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));

    for descriptor in &config.update_services {
        let result = certdeploy_drivers::run(
            descriptor,
            &defaults,
            &config.docker_url,
            &config.systemd_exec,
            &config.rc_service_exec,
            &script_cwd,
        )
        .await;

        if let Err(e) = result {
            error!("{e}");
            if config.fail_fast {
                return Err(e);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn marker_event(path: PathBuf) -> notify::Event {
        notify::Event {
            kind: EventKind::Create(notify::event::CreateKind::File),
            paths: vec![path],
            attrs: Default::default(),
        }
    }

    #[test]
    fn completed_lineages_extracts_lineage_name_from_marker_path() {
        let source_dir = PathBuf::from("/var/lib/certdeploy/source");
        let event = marker_event(source_dir.join("example.com").join(promoter::COMPLETION_MARKER));
        let lineages = completed_lineages(&event, &source_dir);
        assert_eq!(lineages, vec!["example.com".to_string()]);
    }

    #[test]
    fn non_marker_events_are_ignored() {
        let source_dir = PathBuf::from("/var/lib/certdeploy/source");
        let event = marker_event(source_dir.join("example.com").join("fullchain.pem"));
        assert!(completed_lineages(&event, &source_dir).is_empty());
    }

    #[test]
    fn remove_events_are_ignored() {
        let source_dir = PathBuf::from("/var/lib/certdeploy/source");
        let mut event = marker_event(source_dir.join("example.com").join(promoter::COMPLETION_MARKER));
        event.kind = EventKind::Remove(notify::event::RemoveKind::File);
        assert!(completed_lineages(&event, &source_dir).is_empty());
    }
}
