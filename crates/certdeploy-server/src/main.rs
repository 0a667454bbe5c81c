mod cli;
mod engine;
mod hook;
mod scheduler;

use std::sync::Arc;

use anyhow::Context;
use certdeploy_config::ServerConfigLayer;
use certdeploy_logging::Role;
use certdeploy_queue::Queue;
use certdeploy_types::{CertDeployError, ExitCode};
use clap::Parser;
use tracing::{error, info};

fn main() {
    let cli = cli::Cli::parse();
    let exit_code = match run(cli) {
        Ok(()) => ExitCode::Success,
        Err(e) => {
            let role = Role::Server;
            eprintln!("{}", certdeploy_logging::error_prefix(role, e.kind_tag(), &e.to_string()));
            ExitCode::from_error(&e)
        }
    };
    std::process::exit(exit_code.into());
}

fn run(cli: cli::Cli) -> Result<(), CertDeployError> {
    let config_path = cli.config.clone();
    let cli_lineage = cli.lineage.clone();
    let cli_domains = cli.domains.clone();
    let do_renew = cli.renew;
    let do_push = cli.push;
    let daemon_mode = cli.daemon;

    let file_layer = ServerConfigLayer::from_file(&config_path)?;
    let flag_layer = cli.into_layer();
    let config = file_layer.merge(&flag_layer).validate()?;

    let _logging = certdeploy_logging::init(&config.app_log, &config.sftp_log)
        .map_err(|e| CertDeployError::config(e.to_string()))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build the tokio runtime")
        .map_err(|e| CertDeployError::config(e.to_string()))?;

    runtime.block_on(async_main(config, cli_lineage, cli_domains, do_renew, do_push, daemon_mode))
}

async fn async_main(
    config: certdeploy_config::ServerConfig,
    cli_lineage: Option<std::path::PathBuf>,
    cli_domains: Option<String>,
    do_renew: bool,
    do_push: bool,
    daemon_mode: bool,
) -> Result<(), CertDeployError> {
    let queue = Queue::new(config.queue_dir.clone());
    let local_key = Arc::new(
        certdeploy_trust::load_private_key(&config.private_key)
            .map_err(|e| CertDeployError::config(e.to_string()))?,
    );

    if let Some(job) = hook::resolve_seed_job(cli_lineage, cli_domains)? {
        hook::enqueue(&queue, job)?;
    }

    let run_renew = do_renew || (daemon_mode && !config.push_only);
    let run_push = do_push || (daemon_mode && !config.renew_only);

    if daemon_mode {
        return run_daemon(&config, &queue, local_key, run_renew, run_push).await;
    }

    if run_renew {
        scheduler::run_once(&config, std::env::temp_dir().as_path()).await?;
    }
    if run_push {
        let result = engine::drain(&config, &queue, local_key).await?;
        if result.fatal_abort {
            return Err(CertDeployError::config("push engine aborted: fail_fast tripped"));
        }
    }
    Ok(())
}

async fn run_daemon(
    config: &certdeploy_config::ServerConfig,
    queue: &Queue,
    local_key: Arc<certdeploy_trust::LocalKey>,
    run_renew: bool,
    run_push: bool,
) -> Result<(), CertDeployError> {
    let mut shutdown = Box::pin(shutdown_signal());

    let renew_task: std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> = if run_renew
        && let Some(unit) = config.renew_unit
    {
        let config = config.clone();
        Box::pin(async move {
            loop {
                let delay = scheduler::next_fire_delay(unit, config.renew_every, config.renew_at);
                tokio::time::sleep(delay).await;
                if let Err(e) = scheduler::run_once(&config, std::env::temp_dir().as_path()).await {
                    error!("{e}");
                    if config.fail_fast {
                        break;
                    }
                }
            }
        })
    } else {
        Box::pin(std::future::pending())
    };
    tokio::pin!(renew_task);

    let push_loop = async {
        loop {
            match engine::drain(config, queue, local_key.clone()).await {
                Ok(result) if result.fatal_abort => break,
                Ok(_) => {}
                Err(e) => {
                    error!("{e}");
                    if config.fail_fast {
                        break;
                    }
                }
            }
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        }
    };

    if !run_push {
        tokio::select! {
            _ = &mut renew_task => {},
            _ = &mut shutdown => { info!("shutdown signal received"); },
        }
        return Ok(());
    }

    tokio::select! {
        _ = &mut renew_task => {},
        _ = push_loop => {},
        _ = &mut shutdown => { info!("shutdown signal received, draining in-flight work"); },
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async { tokio::signal::ctrl_c().await.ok() };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
