//! Client-side config record (C12): SFTP receiver, staging→destination
//! promotion, and post-promotion service updates.

use std::path::PathBuf;

use certdeploy_logging::{LogLevel, SinkConfig};
use certdeploy_types::{CertDeployError, FilePermissions, ServiceUpdateDescriptor};
use serde::{Deserialize, Serialize};

use crate::{load_yaml_layer, log_sink, non_negative, require, Result};

/// The embedded SFTP server's own listen/auth parameters (§4.7), distinct
/// from the outer client config's log and promotion settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SftpdConfigLayer {
    pub listen_address: Option<String>,
    pub listen_port: Option<i64>,
    pub username: Option<String>,
    pub pubkey: Option<String>,
    pub private_key: Option<PathBuf>,
}

impl SftpdConfigLayer {
    pub fn merge(&self, other: &Self) -> Self {
        Self {
            listen_address: other.listen_address.clone().or_else(|| self.listen_address.clone()),
            listen_port: other.listen_port.or(self.listen_port),
            username: other.username.clone().or_else(|| self.username.clone()),
            pubkey: other.pubkey.clone().or_else(|| self.pubkey.clone()),
            private_key: other.private_key.clone().or_else(|| self.private_key.clone()),
        }
    }

    pub fn validate(self) -> Result<SftpdConfig> {
        let listen_port = non_negative(self.listen_port, "sftpd.listen_port")?.unwrap_or(2022);
        if listen_port > u16::MAX as u64 {
            return Err(CertDeployError::config("sftpd.listen_port must fit in a u16"));
        }
        Ok(SftpdConfig {
            listen_address: self.listen_address.unwrap_or_else(|| "0.0.0.0".to_string()),
            listen_port: listen_port as u16,
            username: self.username.unwrap_or_else(|| "certdeploy".to_string()),
            pubkey: require(self.pubkey, "sftpd.pubkey", "a non-empty ed25519 public key")?,
            private_key: require(self.private_key, "sftpd.private_key", "a file path")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SftpdConfig {
    pub listen_address: String,
    pub listen_port: u16,
    pub username: String,
    pub pubkey: String,
    pub private_key: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfigLayer {
    pub daemon: Option<bool>,
    pub source_dir: Option<PathBuf>,
    pub destination: Option<PathBuf>,
    pub update_services: Option<Vec<ServiceUpdateDescriptor>>,
    pub file_permissions: Option<FilePermissions>,
    pub script_timeout: Option<i64>,
    pub init_timeout: Option<i64>,
    pub docker_timeout: Option<i64>,
    pub systemd_exec: Option<String>,
    pub rc_service_exec: Option<String>,
    pub docker_url: Option<String>,
    pub fail_fast: Option<bool>,
    pub sftpd: Option<SftpdConfigLayer>,
    pub log_filename: Option<PathBuf>,
    pub log_level: Option<LogLevel>,
    pub sftp_log_filename: Option<PathBuf>,
    pub sftp_log_level: Option<LogLevel>,
}

impl ClientConfigLayer {
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        load_yaml_layer(path)
    }

    pub fn merge(&self, other: &Self) -> Self {
        Self {
            daemon: other.daemon.or(self.daemon),
            source_dir: other.source_dir.clone().or_else(|| self.source_dir.clone()),
            destination: other.destination.clone().or_else(|| self.destination.clone()),
            update_services: other
                .update_services
                .clone()
                .or_else(|| self.update_services.clone()),
            file_permissions: other
                .file_permissions
                .clone()
                .or_else(|| self.file_permissions.clone()),
            script_timeout: other.script_timeout.or(self.script_timeout),
            init_timeout: other.init_timeout.or(self.init_timeout),
            docker_timeout: other.docker_timeout.or(self.docker_timeout),
            systemd_exec: other.systemd_exec.clone().or_else(|| self.systemd_exec.clone()),
            rc_service_exec: other
                .rc_service_exec
                .clone()
                .or_else(|| self.rc_service_exec.clone()),
            docker_url: other.docker_url.clone().or_else(|| self.docker_url.clone()),
            fail_fast: other.fail_fast.or(self.fail_fast),
            sftpd: match (&self.sftpd, &other.sftpd) {
                (Some(a), Some(b)) => Some(a.merge(b)),
                (None, Some(b)) => Some(b.clone()),
                (a, None) => a.clone(),
            },
            log_filename: other.log_filename.clone().or_else(|| self.log_filename.clone()),
            log_level: other.log_level.or(self.log_level),
            sftp_log_filename: other
                .sftp_log_filename
                .clone()
                .or_else(|| self.sftp_log_filename.clone()),
            sftp_log_level: other.sftp_log_level.or(self.sftp_log_level),
        }
    }

    pub fn validate(self) -> Result<ClientConfig> {
        let script_timeout = non_negative(self.script_timeout, "script_timeout")?;
        let init_timeout = non_negative(self.init_timeout, "init_timeout")?;
        let docker_timeout = non_negative(self.docker_timeout, "docker_timeout")?;

        let sftpd = require(self.sftpd, "sftpd", "a configured sftpd section")?.validate()?;

        let update_services = self
            .update_services
            .unwrap_or_default()
            .into_iter()
            .map(ServiceUpdateDescriptor::normalize)
            .collect();

        Ok(ClientConfig {
            daemon: self.daemon.unwrap_or(false),
            source_dir: self.source_dir.unwrap_or_else(|| PathBuf::from("/var/lib/certdeploy/source")),
            destination: require(self.destination, "destination", "a directory path")?,
            update_services,
            file_permissions: self.file_permissions.unwrap_or_default(),
            script_timeout,
            init_timeout,
            docker_timeout,
            systemd_exec: self.systemd_exec.unwrap_or_else(|| "systemctl".to_string()),
            rc_service_exec: self.rc_service_exec.unwrap_or_else(|| "service".to_string()),
            docker_url: self.docker_url.unwrap_or_else(|| "unix:///var/run/docker.sock".to_string()),
            fail_fast: self.fail_fast.unwrap_or(false),
            sftpd,
            app_log: log_sink(&self.log_filename, &self.log_level, LogLevel::Info),
            sftp_log: log_sink(&self.sftp_log_filename, &self.sftp_log_level, LogLevel::Info),
        })
    }
}

/// Fully resolved, validated client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub daemon: bool,
    pub source_dir: PathBuf,
    pub destination: PathBuf,
    pub update_services: Vec<ServiceUpdateDescriptor>,
    pub file_permissions: FilePermissions,
    pub script_timeout: Option<u64>,
    pub init_timeout: Option<u64>,
    pub docker_timeout: Option<u64>,
    pub systemd_exec: String,
    pub rc_service_exec: String,
    pub docker_url: String,
    pub fail_fast: bool,
    pub sftpd: SftpdConfig,
    pub app_log: SinkConfig,
    pub sftp_log: SinkConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_sftpd_layer() -> SftpdConfigLayer {
        SftpdConfigLayer {
            listen_address: None,
            listen_port: None,
            username: None,
            pubkey: Some("ssh-ed25519 AAAA".to_string()),
            private_key: Some(PathBuf::from("/etc/certdeploy/client.key")),
        }
    }

    #[test]
    fn validate_requires_destination() {
        let layer = ClientConfigLayer {
            sftpd: Some(valid_sftpd_layer()),
            ..Default::default()
        };
        let err = layer.validate().unwrap_err();
        assert!(err.to_string().contains("destination must be"));
    }

    #[test]
    fn validate_requires_sftpd_section() {
        let layer = ClientConfigLayer {
            destination: Some(PathBuf::from("/etc/nginx/certs")),
            ..Default::default()
        };
        assert!(layer.validate().is_err());
    }

    #[test]
    fn source_dir_defaults_when_unset() {
        let layer = ClientConfigLayer {
            destination: Some(PathBuf::from("/etc/nginx/certs")),
            sftpd: Some(valid_sftpd_layer()),
            ..Default::default()
        };
        let config = layer.validate().unwrap();
        assert_eq!(config.source_dir, PathBuf::from("/var/lib/certdeploy/source"));
    }

    #[test]
    fn sftpd_listen_port_defaults_to_2022() {
        let config = valid_sftpd_layer().validate().unwrap();
        assert_eq!(config.listen_port, 2022);
        assert_eq!(config.listen_address, "0.0.0.0");
    }

    #[test]
    fn bare_container_service_is_normalized_on_validate() {
        let layer = ClientConfigLayer {
            destination: Some(PathBuf::from("/etc/nginx/certs")),
            sftpd: Some(valid_sftpd_layer()),
            update_services: Some(vec![ServiceUpdateDescriptor::Container {
                selector: certdeploy_types::Selector {
                    name: Some("web".to_string()),
                    filters: None,
                },
                timeout: None,
            }]),
            ..Default::default()
        };
        let config = layer.validate().unwrap();
        match &config.update_services[0] {
            ServiceUpdateDescriptor::Container { selector, .. } => {
                assert!(selector.filters.is_some());
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn merge_prefers_override_sftpd_fields() {
        let base = ClientConfigLayer {
            sftpd: Some(SftpdConfigLayer {
                listen_port: Some(2022),
                ..valid_sftpd_layer()
            }),
            ..Default::default()
        };
        let override_layer = ClientConfigLayer {
            sftpd: Some(SftpdConfigLayer {
                listen_port: Some(2222),
                pubkey: None,
                private_key: None,
                listen_address: None,
                username: None,
            }),
            ..Default::default()
        };
        let merged = base.merge(&override_layer);
        assert_eq!(merged.sftpd.unwrap().listen_port, Some(2222));
    }
}
