//! Server-side config record (C12): push engine, renewal scheduler, and
//! queue parameters.

use std::path::{Path, PathBuf};

use certdeploy_duration::WallClockTime;
use certdeploy_logging::{LogLevel, SinkConfig};
use certdeploy_types::{CertDeployError, ClientDescriptor};
use serde::{Deserialize, Serialize};

use crate::{log_sink, load_yaml_layer, non_negative, require, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushMode {
    #[default]
    Serial,
    Parallel,
}

/// Recognized units for the cron-like renewal schedule (§4.5). Any other
/// string fails YAML deserialization, which `load_yaml_layer` surfaces as
/// a `ConfigError` — satisfying the "unknown `renew_unit` ⇒ `ConfigError`"
/// boundary behavior without extra validation code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenewUnit {
    Minute,
    Day,
    Week,
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

/// One configuration layer (file, env, or flags). Every field is
/// optional; `None` means "not set at this layer," deferring to the next
/// layer down in flag > env > file > default precedence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfigLayer {
    pub daemon: Option<bool>,
    pub clients: Option<Vec<ClientDescriptor>>,
    pub clients_dir: Option<PathBuf>,
    pub push_mode: Option<PushMode>,
    pub push_retries: Option<i64>,
    pub push_retry_interval: Option<i64>,
    pub push_interval: Option<i64>,
    pub join_timeout: Option<u64>,
    pub fail_fast: Option<bool>,
    pub queue_dir: Option<PathBuf>,
    pub private_key: Option<PathBuf>,
    pub renew_unit: Option<RenewUnit>,
    pub renew_every: Option<i64>,
    pub renew_at: Option<WallClockTime>,
    pub renew_exec: Option<String>,
    pub renew_args: Option<Vec<String>>,
    pub renew_only: Option<bool>,
    pub push_only: Option<bool>,
    pub log_filename: Option<PathBuf>,
    pub log_level: Option<LogLevel>,
    pub sftp_log_filename: Option<PathBuf>,
    pub sftp_log_level: Option<LogLevel>,
}

impl ServerConfigLayer {
    pub fn from_file(path: &Path) -> Result<Self> {
        load_yaml_layer(path)
    }

    /// Fold `other` over `self`: any field `other` sets wins, anything
    /// left `None` in `other` falls back to `self`.
    pub fn merge(&self, other: &Self) -> Self {
        Self {
            daemon: other.daemon.or(self.daemon),
            clients: other.clients.clone().or_else(|| self.clients.clone()),
            clients_dir: other.clients_dir.clone().or_else(|| self.clients_dir.clone()),
            push_mode: other.push_mode.or(self.push_mode),
            push_retries: other.push_retries.or(self.push_retries),
            push_retry_interval: other.push_retry_interval.or(self.push_retry_interval),
            push_interval: other.push_interval.or(self.push_interval),
            join_timeout: other.join_timeout.or(self.join_timeout),
            fail_fast: other.fail_fast.or(self.fail_fast),
            queue_dir: other.queue_dir.clone().or_else(|| self.queue_dir.clone()),
            private_key: other.private_key.clone().or_else(|| self.private_key.clone()),
            renew_unit: other.renew_unit.or(self.renew_unit),
            renew_every: other.renew_every.or(self.renew_every),
            renew_at: other.renew_at.or(self.renew_at),
            renew_exec: other.renew_exec.clone().or_else(|| self.renew_exec.clone()),
            renew_args: other.renew_args.clone().or_else(|| self.renew_args.clone()),
            renew_only: other.renew_only.or(self.renew_only),
            push_only: other.push_only.or(self.push_only),
            log_filename: other.log_filename.clone().or_else(|| self.log_filename.clone()),
            log_level: other.log_level.or(self.log_level),
            sftp_log_filename: other
                .sftp_log_filename
                .clone()
                .or_else(|| self.sftp_log_filename.clone()),
            sftp_log_level: other.sftp_log_level.or(self.sftp_log_level),
        }
    }

    /// Turn the fully-merged layer into a typed, validated config.
    pub fn validate(self) -> Result<ServerConfig> {
        let push_retries = non_negative(self.push_retries, "push_retries")?.unwrap_or(1) as u32;
        let push_retry_interval =
            non_negative(self.push_retry_interval, "push_retry_interval")?.unwrap_or(30);
        let push_interval = non_negative(self.push_interval, "push_interval")?.unwrap_or(0);

        if let Some(every) = self.renew_every
            && every <= 0
        {
            return Err(CertDeployError::config("renew_every must be a positive integer"));
        }
        let renew_every = self.renew_every.unwrap_or(1) as u32;

        let private_key = require(self.private_key, "private_key", "a file path")?;

        let clients = self.clients.unwrap_or_default();
        validate_client_descriptors(&clients)?;

        Ok(ServerConfig {
            daemon: self.daemon.unwrap_or(false),
            clients,
            clients_dir: self.clients_dir,
            push_mode: self.push_mode.unwrap_or_default(),
            push_retries,
            push_retry_interval,
            push_interval,
            join_timeout: self.join_timeout,
            fail_fast: self.fail_fast.unwrap_or(false),
            queue_dir: self.queue_dir.unwrap_or_else(|| PathBuf::from("/var/run/certdeploy")),
            private_key,
            renew_unit: self.renew_unit,
            renew_every,
            renew_at: self.renew_at,
            renew_exec: self.renew_exec,
            renew_args: self.renew_args.unwrap_or_else(|| vec!["renew".to_string()]),
            renew_only: self.renew_only.unwrap_or(false),
            push_only: self.push_only.unwrap_or(false),
            app_log: log_sink(&self.log_filename, &self.log_level, LogLevel::Info),
            sftp_log: log_sink(&self.sftp_log_filename, &self.sftp_log_level, LogLevel::Info),
        })
    }
}

/// Reject descriptors with empty pubkeys/domains; allow duplicate
/// address+port pairs sourced from inline vs. directory entries (§3).
fn validate_client_descriptors(clients: &[ClientDescriptor]) -> Result<()> {
    for client in clients {
        if client.pubkey.trim().is_empty() {
            return Err(CertDeployError::config(format!(
                "client {} pubkey must be a non-empty ed25519 public key",
                client.address
            )));
        }
        if !client.pubkey.trim_start().starts_with("ssh-ed25519") {
            return Err(CertDeployError::config(format!(
                "client {} pubkey must be ed25519",
                client.address
            )));
        }
        if client.domains.is_empty() {
            return Err(CertDeployError::config(format!(
                "client {} domains must be a non-empty list",
                client.address
            )));
        }
    }
    Ok(())
}

/// Fully resolved, validated server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub daemon: bool,
    pub clients: Vec<ClientDescriptor>,
    pub clients_dir: Option<PathBuf>,
    pub push_mode: PushMode,
    pub push_retries: u32,
    pub push_retry_interval: u64,
    pub push_interval: u64,
    pub join_timeout: Option<u64>,
    pub fail_fast: bool,
    pub queue_dir: PathBuf,
    pub private_key: PathBuf,
    pub renew_unit: Option<RenewUnit>,
    pub renew_every: u32,
    pub renew_at: Option<WallClockTime>,
    pub renew_exec: Option<String>,
    pub renew_args: Vec<String>,
    pub renew_only: bool,
    pub push_only: bool,
    pub app_log: SinkConfig,
    pub sftp_log: SinkConfig,
}

impl ServerConfig {
    /// All configured clients, inline plus those discovered in
    /// `clients_dir` (one descriptor per file), in declaration order with
    /// inline entries first.
    pub fn all_clients(&self) -> Result<Vec<ClientDescriptor>> {
        let mut clients = self.clients.clone();
        if let Some(dir) = &self.clients_dir {
            let mut entries: Vec<_> = std::fs::read_dir(dir)
                .map_err(|e| {
                    CertDeployError::config(format!(
                        "cannot read clients_dir {}: {e}",
                        dir.display()
                    ))
                })?
                .filter_map(|e| e.ok())
                .collect();
            entries.sort_by_key(|e| e.path());
            for entry in entries {
                let content = std::fs::read_to_string(entry.path()).map_err(|e| {
                    CertDeployError::config(format!(
                        "cannot read client descriptor {}: {e}",
                        entry.path().display()
                    ))
                })?;
                let descriptor: ClientDescriptor = serde_yaml::from_str(&content).map_err(|e| {
                    CertDeployError::config(format!(
                        "cannot parse client descriptor {}: {e}",
                        entry.path().display()
                    ))
                })?;
                clients.push(descriptor);
            }
        }
        validate_client_descriptors(&clients)?;
        Ok(clients)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> ClientDescriptor {
        ClientDescriptor {
            address: "10.0.0.1".to_string(),
            port: 22,
            username: "certdeploy".to_string(),
            pubkey: "ssh-ed25519 AAAA".to_string(),
            domains: vec!["example.com".to_string()],
            remote_path: "/var/cache/certdeploy".into(),
            needs_chain: false,
            needs_fullchain: true,
            needs_privkey: true,
            push_retries: None,
            push_retry_interval: None,
        }
    }

    #[test]
    fn validate_requires_private_key() {
        let layer = ServerConfigLayer::default();
        let err = layer.validate().unwrap_err();
        assert!(err.to_string().contains("private_key must be"));
    }

    #[test]
    fn validate_applies_spec_defaults() {
        let layer = ServerConfigLayer {
            private_key: Some(PathBuf::from("/etc/certdeploy/server.key")),
            ..Default::default()
        };
        let config = layer.validate().unwrap();
        assert_eq!(config.push_retries, 1);
        assert_eq!(config.push_retry_interval, 30);
        assert_eq!(config.push_interval, 0);
        assert_eq!(config.push_mode, PushMode::Serial);
        assert_eq!(config.queue_dir, PathBuf::from("/var/run/certdeploy"));
    }

    #[test]
    fn flag_layer_overrides_file_layer() {
        let file_layer = ServerConfigLayer {
            private_key: Some(PathBuf::from("/etc/certdeploy/server.key")),
            push_retries: Some(5),
            ..Default::default()
        };
        let flag_layer = ServerConfigLayer {
            push_retries: Some(0),
            ..Default::default()
        };
        let merged = file_layer.merge(&flag_layer);
        let config = merged.validate().unwrap();
        assert_eq!(config.push_retries, 0);
    }

    #[test]
    fn rejects_negative_push_interval() {
        let layer = ServerConfigLayer {
            private_key: Some(PathBuf::from("/etc/certdeploy/server.key")),
            push_interval: Some(-1),
            ..Default::default()
        };
        let err = layer.validate().unwrap_err();
        assert!(err.to_string().contains("push_interval must be"));
    }

    #[test]
    fn rejects_empty_client_domains() {
        let mut bad = descriptor();
        bad.domains.clear();
        let layer = ServerConfigLayer {
            private_key: Some(PathBuf::from("/etc/certdeploy/server.key")),
            clients: Some(vec![bad]),
            ..Default::default()
        };
        assert!(layer.validate().is_err());
    }

    #[test]
    fn unknown_renew_unit_fails_at_parse_time() {
        let yaml = "renew_unit: fortnight\n";
        let result: std::result::Result<ServerConfigLayer, _> = serde_yaml::from_str(yaml);
        assert!(result.is_err());
    }

    #[test]
    fn zero_push_retries_means_one_attempt() {
        let layer = ServerConfigLayer {
            private_key: Some(PathBuf::from("/etc/certdeploy/server.key")),
            push_retries: Some(0),
            ..Default::default()
        };
        let config = layer.validate().unwrap();
        assert_eq!(config.push_retries, 0);
    }
}
