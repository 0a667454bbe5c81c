mod cli;
mod orchestrator;
mod promoter;

use certdeploy_config::ClientConfigLayer;
use certdeploy_logging::Role;
use certdeploy_sftp::server::SftpServerConfig;
use certdeploy_trust::PinnedKey;
use certdeploy_types::{CertDeployError, ExitCode};
use clap::Parser;
use tracing::error;

fn main() {
    let cli = cli::Cli::parse();
    let exit_code = match run(cli) {
        Ok(()) => ExitCode::Success,
        Err(e) => {
            eprintln!("{}", certdeploy_logging::error_prefix(Role::Client, e.kind_tag(), &e.to_string()));
            ExitCode::from_error(&e)
        }
    };
    std::process::exit(exit_code.into());
}

fn run(cli: cli::Cli) -> Result<(), CertDeployError> {
    let config_path = cli.config.clone();
    let daemon_mode = cli.daemon;

    let file_layer = ClientConfigLayer::from_file(&config_path)?;
    let flag_layer = cli.into_layer();
    let config = file_layer.merge(&flag_layer).validate()?;

    let _logging = certdeploy_logging::init(&config.app_log, &config.sftp_log)
        .map_err(|e| CertDeployError::config(e.to_string()))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| CertDeployError::config(format!("failed to build the tokio runtime: {e}")))?;

    runtime.block_on(async_main(config, daemon_mode))
}

/// §6 gives the client CLI no one-shot mode — unlike the server, `--daemon`
/// here is informational only (left for a process supervisor to act on);
/// the receiver and orchestrator always run for the life of the process.
async fn async_main(config: certdeploy_config::ClientConfig, _daemon_flag: bool) -> Result<(), CertDeployError> {
    let host_key = certdeploy_trust::load_private_key(&config.sftpd.private_key)
        .map_err(|e| CertDeployError::config(e.to_string()))?;
    let pinned_peer_key = PinnedKey::from_raw(&config.sftpd.pubkey);

    let sftp_config = SftpServerConfig {
        listen_address: config.sftpd.listen_address.clone(),
        listen_port: config.sftpd.listen_port,
        username: config.sftpd.username.clone(),
        host_key,
        pinned_peer_key,
        source_dir: config.source_dir.clone(),
    };

    run_daemon(config, sftp_config).await
}

async fn run_daemon(
    config: certdeploy_config::ClientConfig,
    sftp_config: SftpServerConfig,
) -> Result<(), CertDeployError> {
    let fail_fast = config.fail_fast;

    let sftp_server = async {
        if let Err(e) = certdeploy_sftp::server::serve_forever(sftp_config).await {
            error!(error = %e, "sftp server exited");
        }
    };

    let orchestrator = orchestrator::run(&config);

    tokio::select! {
        _ = sftp_server => {
            Err(CertDeployError::config("sftp server exited unexpectedly"))
        }
        result = orchestrator => {
            match result {
                Ok(()) => Ok(()),
                Err(e) => {
                    error!("{e}");
                    if fail_fast {
                        Err(e)
                    } else {
                        Ok(())
                    }
                }
            }
        }
    }
}
