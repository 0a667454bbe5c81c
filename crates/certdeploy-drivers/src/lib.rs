//! Update driver set (C9): a uniform `run(descriptor, env) -> Result<()>`
//! contract across containers, orchestrator services, init/rc units, and
//! scripts. Every driver is individually fail-fast — a single failure
//! raises the kind-tagged `CertDeployError` the caller decides whether to
//! abort on.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use bollard::container::RestartContainerOptions;
use bollard::service::UpdateServiceOptions;
use bollard::Docker;
use certdeploy_types::{CertDeployError, Selector, ServiceUpdateDescriptor, UnitAction};
use futures_util::stream::StreamExt;
use tracing::{info, warn};

type Result<T> = std::result::Result<T, CertDeployError>;

/// Category default timeout, applied when `descriptor.timeout()` is
/// `None` (§4.9's precedence: descriptor → category default → indefinite).
pub struct DriverDefaults {
    pub docker_timeout: Option<Duration>,
    pub init_timeout: Option<Duration>,
    pub script_timeout: Option<Duration>,
}

/// Run one update descriptor to completion.
pub async fn run(
    descriptor: &ServiceUpdateDescriptor,
    defaults: &DriverDefaults,
    docker_url: &str,
    systemd_exec: &str,
    rc_service_exec: &str,
    script_cwd: &Path,
) -> Result<()> {
    match descriptor {
        ServiceUpdateDescriptor::Container { selector, timeout } => {
            let timeout = timeout.map(Duration::from_secs).or(defaults.docker_timeout);
            run_container(selector, timeout, docker_url).await
        }
        ServiceUpdateDescriptor::OrchestratorService { selector, timeout } => {
            let timeout = timeout.map(Duration::from_secs).or(defaults.docker_timeout);
            run_orchestrator_service(selector, timeout, docker_url).await
        }
        ServiceUpdateDescriptor::InitUnit { name, action, timeout } => {
            let timeout = timeout.map(Duration::from_secs).or(defaults.init_timeout);
            run_unit(systemd_exec, name, *action, timeout).await
        }
        ServiceUpdateDescriptor::RcUnit { name, action, timeout } => {
            let timeout = timeout.map(Duration::from_secs).or(defaults.init_timeout);
            run_rc_unit(rc_service_exec, name, *action, timeout).await
        }
        ServiceUpdateDescriptor::Script { name, timeout } => {
            let timeout = timeout.map(Duration::from_secs).or(defaults.script_timeout);
            run_script(name, timeout, script_cwd).await
        }
    }
}

fn connect(docker_url: &str) -> Result<Docker> {
    Docker::connect_with_socket(docker_url, 120, bollard::API_DEFAULT_VERSION)
        .map_err(|e| CertDeployError::ContainerNotFound(format!("cannot connect to {docker_url}: {e}")))
}

/// List containers matching `selector.name` (exact) or `selector.filters`,
/// restart each. An empty match set is `ContainerNotFound`.
async fn run_container(selector: &Selector, timeout: Option<Duration>, docker_url: &str) -> Result<()> {
    let docker = connect(docker_url)?;
    let filters = container_filters(selector);

    let options = bollard::container::ListContainersOptions::<String> {
        all: false,
        filters,
        ..Default::default()
    };
    let containers = docker
        .list_containers(Some(options))
        .await
        .map_err(|e| CertDeployError::ContainerNotFound(format!("list failed: {e}")))?;

    if containers.is_empty() {
        return Err(CertDeployError::ContainerNotFound(
            selector.name.clone().unwrap_or_else(|| format!("{:?}", selector.filters)),
        ));
    }

    let restart_opts = timeout.map(|t| RestartContainerOptions { t: t.as_secs() as isize });
    for container in containers {
        let id = container.id.ok_or_else(|| CertDeployError::ContainerNotFound("container missing id".to_string()))?;
        docker
            .restart_container(&id, restart_opts.clone())
            .await
            .map_err(|e| CertDeployError::ContainerNotFound(format!("restart {id} failed: {e}")))?;
        info!(container = %id, "container restarted");
    }
    Ok(())
}

fn container_filters(selector: &Selector) -> HashMap<String, Vec<String>> {
    let mut filters = HashMap::new();
    if let Some(f) = &selector.filters {
        for (key, value) in f {
            filters.insert(key.clone(), vec![value.clone()]);
        }
    } else if let Some(name) = &selector.name {
        filters.insert("name".to_string(), vec![format!("^{name}$")]);
    }
    filters
}

/// Locate an orchestrator (Docker Swarm) service and force a rolling
/// update. Because of a known upstream bug with regex label filtering,
/// resolution by bare `name` bypasses filters entirely and goes through
/// the exact-match service-inspect API instead (§9).
async fn run_orchestrator_service(selector: &Selector, _timeout: Option<Duration>, docker_url: &str) -> Result<()> {
    let docker = connect(docker_url)?;

    let service_id = if let Some(name) = &selector.name {
        let inspected = docker
            .inspect_service(name, None)
            .await
            .map_err(|_| CertDeployError::ServiceNotFound(name.clone()))?;
        inspected.id.ok_or_else(|| CertDeployError::ServiceNotFound(name.clone()))?
    } else {
        let filters = selector
            .filters
            .clone()
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, vec![v]))
            .collect::<HashMap<_, _>>();
        let options = bollard::service::ListServicesOptions { filters, status: false };
        let services = docker
            .list_services(Some(options))
            .await
            .map_err(|e| CertDeployError::ServiceNotFound(format!("list failed: {e}")))?;
        let found = services
            .into_iter()
            .next()
            .ok_or_else(|| CertDeployError::ServiceNotFound(format!("{:?}", selector.filters)))?;
        found.id.ok_or_else(|| CertDeployError::ServiceNotFound("service missing id".to_string()))?
    };

    let spec = docker
        .inspect_service(&service_id, None)
        .await
        .map_err(|e| CertDeployError::ServiceNotFound(format!("{service_id}: {e}")))?
        .spec
        .ok_or_else(|| CertDeployError::ServiceNotFound(service_id.clone()))?;
    let version = docker
        .inspect_service(&service_id, None)
        .await
        .ok()
        .and_then(|s| s.version)
        .and_then(|v| v.index)
        .unwrap_or(0);

    docker
        .update_service(
            &service_id,
            spec,
            UpdateServiceOptions {
                version,
                ..Default::default()
            },
            None,
        )
        .await
        .map_err(|e| CertDeployError::ServiceNotFound(format!("rolling update of {service_id} failed: {e}")))?;

    info!(service = %service_id, "orchestrator service update forced");
    Ok(())
}

async fn run_unit(exec: &str, name: &str, action: UnitAction, timeout: Option<Duration>) -> Result<()> {
    let verb = action_verb(action);
    run_unit_command(exec, &[verb, name], timeout, |out| CertDeployError::Unit(out)).await
}

async fn run_rc_unit(exec: &str, name: &str, action: UnitAction, timeout: Option<Duration>) -> Result<()> {
    let verb = action_verb(action);
    run_unit_command(exec, &[name, verb], timeout, |out| CertDeployError::Unit(out)).await
}

fn action_verb(action: UnitAction) -> &'static str {
    match action {
        UnitAction::Restart => "restart",
        UnitAction::Reload => "reload",
    }
}

async fn run_unit_command(
    exec: &str,
    args: &[&str],
    timeout: Option<Duration>,
    to_error: impl FnOnce(String) -> CertDeployError + Send + 'static,
) -> Result<()> {
    let exec = exec.to_string();
    let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
    let cwd = std::env::temp_dir();
    let output = tokio::task::spawn_blocking(move || {
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        certdeploy_process::run_with_timeout(&exec, &arg_refs, &cwd, timeout)
    })
    .await
    .map_err(|e| CertDeployError::Unit(format!("driver task panicked: {e}")))?
    .map_err(|e| CertDeployError::Unit(e.to_string()))?;

    if !output.success() {
        return Err(to_error(format!(
            "{exec} exited with {} (stderr: {})",
            output.exit_code, output.stderr
        )));
    }
    Ok(())
}

async fn run_script(name: &Path, timeout: Option<Duration>, cwd: &Path) -> Result<()> {
    let resolved = certdeploy_process::resolve_script_path(name, cwd)
        .map_err(|e| CertDeployError::Script(e.to_string()))?;
    let path_str = resolved.to_string_lossy().into_owned();
    let cwd = cwd.to_path_buf();

    let output = tokio::task::spawn_blocking(move || {
        certdeploy_process::run_with_timeout(&path_str, &[], &cwd, timeout)
    })
    .await
    .map_err(|e| CertDeployError::Script(format!("driver task panicked: {e}")))?
    .map_err(|e| CertDeployError::Script(e.to_string()))?;

    if !output.success() {
        let reason = if output.timed_out { "timed out" } else { "non-zero exit" };
        return Err(CertDeployError::Script(format!(
            "{} ({reason}, exit {}, stderr: {})",
            resolved.display(),
            output.exit_code,
            output.stderr
        )));
    }
    warn_if_stderr(&resolved, &output.stderr);
    Ok(())
}

fn warn_if_stderr(script: &Path, stderr: &str) {
    if !stderr.trim().is_empty() {
        warn!(script = %script.display(), stderr, "script produced stderr output despite success");
    }
}

/// Drain a Docker event stream; used by tests and by a future `--watch`
/// mode to confirm a restart actually completed rather than merely being
/// accepted by the API.
pub async fn wait_for_container_running(docker: &Docker, id: &str) -> Result<()> {
    let options = bollard::system::EventsOptions::<String> {
        ..Default::default()
    };
    let mut stream = docker.events(Some(options));
    while let Some(event) = stream.next().await {
        let event = event.map_err(|e| CertDeployError::ContainerNotFound(e.to_string()))?;
        if event.actor.and_then(|a| a.id) == Some(id.to_string()) {
            return Ok(());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_verb_maps_restart_and_reload() {
        assert_eq!(action_verb(UnitAction::Restart), "restart");
        assert_eq!(action_verb(UnitAction::Reload), "reload");
    }

    #[test]
    fn container_filters_prefers_explicit_filters_over_name() {
        let mut explicit = std::collections::BTreeMap::new();
        explicit.insert("label".to_string(), "app=web".to_string());
        let selector = Selector {
            name: Some("web".to_string()),
            filters: Some(explicit),
        };
        let filters = container_filters(&selector);
        assert!(filters.contains_key("label"));
        assert!(!filters.contains_key("name"));
    }

    #[test]
    fn container_filters_falls_back_to_name_regex() {
        let selector = Selector {
            name: Some("web".to_string()),
            filters: None,
        };
        let filters = container_filters(&selector);
        assert_eq!(filters.get("name").unwrap(), &vec!["^web$".to_string()]);
    }

    #[tokio::test]
    async fn run_script_rejects_unknown_script() {
        let result = run_script(Path::new("no-such-driver-script"), None, Path::new("/tmp")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn run_unit_surfaces_nonzero_exit_as_unit_error() {
        let result = run_unit_command("false", &[], None, CertDeployError::Unit).await;
        match result {
            Err(CertDeployError::Unit(_)) => {}
            other => panic!("expected UnitError, got {other:?}"),
        }
    }
}
