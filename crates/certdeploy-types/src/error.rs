//! Error kinds shared across certdeploy, matching the stable, log-visible
//! names in the error handling design: `ConfigError`, `QueueCorrupt`,
//! `HostKeyMismatch`, `SFTPTransientError`, `RenewError`,
//! `ContainerNotFound`/`ServiceNotFound`/`UnitError`/`ScriptError`,
//! `PromotionError`.

use thiserror::Error;

/// Process exit codes: `0` clean, `1` fatal error, `2` config error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success,
    Fatal,
    Config,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        match code {
            ExitCode::Success => 0,
            ExitCode::Fatal => 1,
            ExitCode::Config => 2,
        }
    }
}

impl ExitCode {
    pub fn from_error(err: &CertDeployError) -> Self {
        if matches!(err, CertDeployError::Config(_)) {
            ExitCode::Config
        } else {
            ExitCode::Fatal
        }
    }
}

/// Whether an error should be retried by the push engine or treated as
/// fatal for the `(job, client)` pair it occurred on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Transient,
    FatalPerClient,
    FatalProcess,
}

#[derive(Error, Debug)]
pub enum CertDeployError {
    #[error("ConfigError: {0}")]
    Config(String),

    #[error("QueueCorrupt: {0}")]
    QueueCorrupt(String),

    #[error("HostKeyMismatch: presented key for {address} does not match pinned value")]
    HostKeyMismatch { address: String },

    #[error("SFTPTransientError: {address}: {cause}")]
    SftpTransient { address: String, cause: String },

    /// Fatal SFTP failures that are not connection/auth/timeout related —
    /// permission denied on the remote path, an unreadable local lineage,
    /// or a malformed remote layout. Distinct from `SftpTransient`, which
    /// is the only kind eligible for retry.
    #[error("SFTPError: {address}: {cause}")]
    SftpFatal { address: String, cause: String },

    #[error("RenewError: renewal executable exited with {0}")]
    Renew(String),

    #[error("ContainerNotFound: {0}")]
    ContainerNotFound(String),

    #[error("ServiceNotFound: {0}")]
    ServiceNotFound(String),

    #[error("UnitError: {0}")]
    Unit(String),

    #[error("ScriptError: {0}")]
    Script(String),

    #[error("PromotionError: {0}")]
    Promotion(String),

    #[error("CertDeployError: {0}")]
    Wrapped(#[source] Box<CertDeployError>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CertDeployError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            CertDeployError::SftpTransient { .. } => ErrorCategory::Transient,
            CertDeployError::SftpFatal { .. } => ErrorCategory::FatalPerClient,
            CertDeployError::HostKeyMismatch { .. } => ErrorCategory::FatalPerClient,
            CertDeployError::ContainerNotFound(_)
            | CertDeployError::ServiceNotFound(_)
            | CertDeployError::Unit(_)
            | CertDeployError::Script(_) => ErrorCategory::FatalPerClient,
            CertDeployError::Config(_) | CertDeployError::QueueCorrupt(_) => {
                ErrorCategory::FatalProcess
            }
            CertDeployError::Renew(_) | CertDeployError::Promotion(_) => {
                ErrorCategory::FatalPerClient
            }
            CertDeployError::Wrapped(inner) => inner.category(),
            CertDeployError::Io(_) => ErrorCategory::Transient,
        }
    }

    /// The stable tag that appears after `ERROR:certdeploy-{server,client}:`
    /// in log output.
    pub fn kind_tag(&self) -> &'static str {
        match self {
            CertDeployError::Config(_) => "ConfigError",
            CertDeployError::QueueCorrupt(_) => "QueueCorrupt",
            CertDeployError::HostKeyMismatch { .. } => "HostKeyMismatch",
            CertDeployError::SftpTransient { .. } => "SFTPTransientError",
            CertDeployError::SftpFatal { .. } => "SFTPError",
            CertDeployError::Renew(_) => "RenewError",
            CertDeployError::ContainerNotFound(_) => "ContainerNotFound",
            CertDeployError::ServiceNotFound(_) => "ServiceNotFound",
            CertDeployError::Unit(_) => "UnitError",
            CertDeployError::Script(_) => "ScriptError",
            CertDeployError::Promotion(_) => "PromotionError",
            CertDeployError::Wrapped(inner) => inner.kind_tag(),
            CertDeployError::Io(_) => "IoError",
        }
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        CertDeployError::Config(msg.into())
    }

    pub fn queue_corrupt<S: Into<String>>(msg: S) -> Self {
        CertDeployError::QueueCorrupt(msg.into())
    }

    pub fn sftp_transient<S: Into<String>>(address: S, cause: S) -> Self {
        CertDeployError::SftpTransient {
            address: address.into(),
            cause: cause.into(),
        }
    }

    pub fn sftp_fatal<S: Into<String>>(address: S, cause: S) -> Self {
        CertDeployError::SftpFatal {
            address: address.into(),
            cause: cause.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_key_mismatch_is_fatal_per_client() {
        let err = CertDeployError::HostKeyMismatch {
            address: "10.0.0.1".to_string(),
        };
        assert_eq!(err.category(), ErrorCategory::FatalPerClient);
        assert_eq!(err.kind_tag(), "HostKeyMismatch");
    }

    #[test]
    fn sftp_transient_is_retryable() {
        let err = CertDeployError::sftp_transient("10.0.0.1", "connection refused");
        assert_eq!(err.category(), ErrorCategory::Transient);
        assert!(err.to_string().contains("10.0.0.1"));
    }

    #[test]
    fn sftp_fatal_is_not_retried() {
        let err = CertDeployError::sftp_fatal("10.0.0.1", "permission denied");
        assert_eq!(err.category(), ErrorCategory::FatalPerClient);
        assert_eq!(err.kind_tag(), "SFTPError");
    }

    #[test]
    fn config_error_maps_to_exit_code_2() {
        let err = CertDeployError::config("push_interval must be a non-negative integer");
        assert_eq!(i32::from(ExitCode::from_error(&err)), 2);
    }

    #[test]
    fn queue_corrupt_maps_to_exit_code_1() {
        let err = CertDeployError::queue_corrupt("unexpected EOF");
        assert_eq!(i32::from(ExitCode::from_error(&err)), 1);
    }

    #[test]
    fn wrapped_error_inherits_wrapped_category_and_tag() {
        let inner = CertDeployError::ContainerNotFound("no_such".to_string());
        let wrapped = CertDeployError::Wrapped(Box::new(inner));
        assert_eq!(wrapped.category(), ErrorCategory::FatalPerClient);
        assert_eq!(wrapped.kind_tag(), "ContainerNotFound");
    }
}
