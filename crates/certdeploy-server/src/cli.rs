//! Command-line and environment-variable front-end (§6). Thin glue: every
//! flag and env var populates a [`certdeploy_config::ServerConfigLayer`]
//! that precedence-merges over the file and default layers.

use std::path::PathBuf;

use certdeploy_config::ServerConfigLayer;
use certdeploy_logging::LogLevel;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "certdeploy-server", version)]
#[command(about = "Pushes renewed TLS certificate material to a fleet of clients")]
pub struct Cli {
    /// Path to the server YAML config file.
    #[arg(long, env = "CERTDEPLOY_SERVER_CONFIG", default_value = "/etc/certdeploy/server.yaml")]
    pub config: PathBuf,

    /// Run as a persistent daemon: renewal scheduler plus push engine.
    #[arg(long, env = "CERTDEPLOY_SERVER_DAEMON")]
    pub daemon: bool,

    /// Fire the renewal executable once before draining.
    #[arg(long)]
    pub renew: bool,

    /// Drain the push queue once and exit.
    #[arg(long)]
    pub push: bool,

    /// Seed a push job from this lineage path (mutually exclusive with `--daemon`).
    #[arg(long, conflicts_with = "daemon")]
    pub lineage: Option<PathBuf>,

    /// Space-separated domain list for `--lineage` (mutually exclusive with `--daemon`).
    #[arg(long, conflicts_with = "daemon")]
    pub domains: Option<String>,

    #[arg(long, env = "CERTDEPLOY_SERVER_LOG_FILENAME")]
    pub log_filename: Option<PathBuf>,

    #[arg(long, env = "CERTDEPLOY_SERVER_LOG_LEVEL")]
    pub log_level: Option<LogLevel>,

    #[arg(long, env = "CERTDEPLOY_SERVER_SFTP_LOG_FILENAME")]
    pub sftp_log_filename: Option<PathBuf>,

    #[arg(long, env = "CERTDEPLOY_SERVER_SFTP_LOG_LEVEL")]
    pub sftp_log_level: Option<LogLevel>,

    /// Run only the renewal scheduler, never the push engine.
    #[arg(long, env = "CERTDEPLOY_SERVER_RENEW_ONLY")]
    pub renew_only: bool,

    /// Run only the push engine, never the renewal scheduler.
    #[arg(long, env = "CERTDEPLOY_SERVER_PUSH_ONLY")]
    pub push_only: bool,
}

impl Cli {
    /// Translate parsed flags into a config layer. Flags that were not
    /// passed are `None` here, which defers to the file/default layers.
    pub fn into_layer(self) -> ServerConfigLayer {
        ServerConfigLayer {
            daemon: if self.daemon { Some(true) } else { None },
            log_filename: self.log_filename,
            log_level: self.log_level,
            sftp_log_filename: self.sftp_log_filename,
            sftp_log_level: self.sftp_log_level,
            renew_only: if self.renew_only { Some(true) } else { None },
            push_only: if self.push_only { Some(true) } else { None },
            ..Default::default()
        }
    }
}
