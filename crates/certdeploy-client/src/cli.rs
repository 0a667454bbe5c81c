//! Command-line and environment-variable front-end (§6). Thin glue: every
//! flag and env var populates a [`certdeploy_config::ClientConfigLayer`]
//! that precedence-merges over the file and default layers.

use std::path::PathBuf;

use certdeploy_config::ClientConfigLayer;
use certdeploy_logging::LogLevel;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "certdeploy-client", version)]
#[command(about = "Receives pushed TLS certificate material and triggers local service updates")]
pub struct Cli {
    /// Path to the client YAML config file.
    #[arg(long, env = "CERTDEPLOY_CLIENT_CONFIG", default_value = "/etc/certdeploy/client.yaml")]
    pub config: PathBuf,

    /// Run as a persistent daemon: embedded SFTP server plus promoter.
    #[arg(long, env = "CERTDEPLOY_CLIENT_DAEMON")]
    pub daemon: bool,

    #[arg(long, env = "CERTDEPLOY_CLIENT_LOG_FILENAME")]
    pub log_filename: Option<PathBuf>,

    #[arg(long, env = "CERTDEPLOY_CLIENT_LOG_LEVEL")]
    pub log_level: Option<LogLevel>,

    #[arg(long, env = "CERTDEPLOY_CLIENT_SFTP_LOG_FILENAME")]
    pub sftp_log_filename: Option<PathBuf>,

    #[arg(long, env = "CERTDEPLOY_CLIENT_SFTP_LOG_LEVEL")]
    pub sftp_log_level: Option<LogLevel>,
}

impl Cli {
    /// Translate parsed flags into a config layer. Flags that were not
    /// passed are `None` here, which defers to the file/default layers.
    pub fn into_layer(self) -> ClientConfigLayer {
        ClientConfigLayer {
            daemon: if self.daemon { Some(true) } else { None },
            log_filename: self.log_filename,
            log_level: self.log_level,
            sftp_log_filename: self.sftp_log_filename,
            sftp_log_level: self.sftp_log_level,
            ..Default::default()
        }
    }
}
