//! SFTP uploader (C3): pushes one lineage to one client over an
//! authenticated SSH/SFTP session.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use certdeploy_trust::{LocalKey, PinnedKey};
use certdeploy_types::{CertDeployError, ClientDescriptor, PushJob};
use russh::client::{Config, Handle, Handler};
use russh_keys::key::PublicKey;
use russh_sftp::client::SftpSession;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::{russh_client_config, SSH_BANNER_TIMEOUT};

type Result<T> = std::result::Result<T, CertDeployError>;

/// Upload the subset of `{fullchain,chain,privkey,cert}.pem` that
/// `client.needed_files()` selects into `remote_path/<lineage_name>/` on
/// `client.address:client.port`, authenticated with `local_key` and with
/// the remote host key checked against `client.pubkey`.
pub async fn upload_lineage(
    client: &ClientDescriptor,
    local_key: &LocalKey,
    job: &PushJob,
) -> Result<()> {
    let address = format!("{}:{}", client.address, client.port);
    let pinned = PinnedKey::from_raw(&client.pubkey);
    let mismatch = Arc::new(AtomicBool::new(false));

    let handler = ClientKeyChecker {
        pinned: pinned.clone(),
        mismatch: mismatch.clone(),
    };

    let config: Arc<Config> = Arc::new(russh_client_config());
    let handle = timeout(SSH_BANNER_TIMEOUT, russh::client::connect(config, address.clone(), handler))
        .await
        .map_err(|_| CertDeployError::sftp_transient(client.address.clone(), "connection timed out".to_string()))?;

    let mut handle = match handle {
        Ok(h) => h,
        Err(e) => {
            if mismatch.load(Ordering::SeqCst) {
                return Err(CertDeployError::HostKeyMismatch {
                    address: client.address.clone(),
                });
            }
            return Err(CertDeployError::sftp_transient(
                client.address.clone(),
                e.to_string(),
            ));
        }
    };

    authenticate(&mut handle, client, local_key).await?;

    let channel = handle
        .channel_open_session()
        .await
        .map_err(|e| CertDeployError::sftp_transient(client.address.clone(), e.to_string()))?;
    channel
        .request_subsystem(true, "sftp")
        .await
        .map_err(|e| CertDeployError::sftp_transient(client.address.clone(), e.to_string()))?;

    let sftp = SftpSession::new(channel.into_stream())
        .await
        .map_err(|e| CertDeployError::sftp_transient(client.address.clone(), e.to_string()))?;

    let remote_lineage_dir = client.remote_path.join(&job.lineage_name);
    ensure_remote_dir(&sftp, &remote_lineage_dir, &client.address).await?;

    for filename in client.needed_files() {
        let local_path = job.lineage_path.join(filename);
        upload_file(&sftp, &local_path, &remote_lineage_dir.join(filename), &client.address).await?;
    }

    write_completion_marker(&sftp, &remote_lineage_dir, &client.address).await?;

    debug!(address = %client.address, lineage = %job.lineage_name, "lineage uploaded");
    let _ = handle.disconnect(russh::Disconnect::ByApplication, "", "en").await;
    Ok(())
}

async fn authenticate(handle: &mut Handle<ClientKeyChecker>, client: &ClientDescriptor, local_key: &LocalKey) -> Result<()> {
    let key = Arc::new(local_key.keypair.clone());
    let ok = handle
        .authenticate_publickey(client.username.clone(), key)
        .await
        .map_err(|e| CertDeployError::sftp_transient(client.address.clone(), e.to_string()))?;
    if !ok {
        return Err(CertDeployError::sftp_transient(
            client.address.clone(),
            "public key authentication rejected".to_string(),
        ));
    }
    Ok(())
}

/// Create `dir` with mode `0700` if it does not already exist. Any error
/// other than "already exists" is fatal for this client.
async fn ensure_remote_dir(sftp: &SftpSession, dir: &std::path::Path, address: &str) -> Result<()> {
    let dir_str = dir.to_string_lossy();
    match sftp.metadata(dir_str.as_ref()).await {
        Ok(_) => return Ok(()),
        Err(_) => {}
    }
    sftp.create_dir(dir_str.as_ref())
        .await
        .map_err(|e| CertDeployError::sftp_fatal(address.to_string(), format!("cannot create {dir_str}: {e}")))?;
    let mut attrs = russh_sftp::protocol::FileAttributes::default();
    attrs.permissions = Some(0o700);
    let _ = sftp.set_metadata(dir_str.as_ref(), attrs).await;
    Ok(())
}

/// Upload `local_path` to a temp name under the same remote directory,
/// then rename it into place — never visible half-written.
async fn upload_file(
    sftp: &SftpSession,
    local_path: &std::path::Path,
    remote_path: &std::path::Path,
    address: &str,
) -> Result<()> {
    let content = tokio::fs::read(local_path).await.map_err(|e| {
        CertDeployError::sftp_fatal(
            address.to_string(),
            format!("cannot read local lineage file {}: {e}", local_path.display()),
        )
    })?;
    let local_meta = tokio::fs::metadata(local_path).await.map_err(|e| {
        CertDeployError::sftp_fatal(address.to_string(), format!("cannot stat {}: {e}", local_path.display()))
    })?;

    let tmp_name = format!(
        "{}.tmp.{}",
        remote_path.file_name().and_then(|n| n.to_str()).unwrap_or("upload"),
        std::process::id()
    );
    let tmp_path: PathBuf = remote_path.with_file_name(tmp_name);
    let tmp_str = tmp_path.to_string_lossy().into_owned();
    let remote_str = remote_path.to_string_lossy().into_owned();

    {
        use tokio::io::AsyncWriteExt;
        let mut file = sftp
            .create(tmp_str.clone())
            .await
            .map_err(|e| CertDeployError::sftp_fatal(address.to_string(), format!("cannot create {tmp_str}: {e}")))?;
        file.write_all(&content)
            .await
            .map_err(|e| CertDeployError::sftp_fatal(address.to_string(), format!("write failed for {tmp_str}: {e}")))?;
        file.shutdown()
            .await
            .map_err(|e| CertDeployError::sftp_fatal(address.to_string(), format!("close failed for {tmp_str}: {e}")))?;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut attrs = russh_sftp::protocol::FileAttributes::default();
        attrs.permissions = Some(local_meta.permissions().mode());
        attrs.mtime = local_meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as u32);
        let _ = sftp.set_metadata(tmp_str.clone(), attrs).await;
    }

    // Best-effort overwrite of a previous attempt's leftover file.
    let _ = sftp.remove_file(remote_str.clone()).await;
    sftp.rename(tmp_str.clone(), remote_str.clone())
        .await
        .map_err(|e| {
            CertDeployError::sftp_fatal(address.to_string(), format!("cannot rename {tmp_str} to {remote_str}: {e}"))
        })?;

    verify_remote_size(sftp, &remote_str, local_meta.len(), address).await?;

    Ok(())
}

/// A rename landing without error doesn't rule out a truncated write on a
/// flaky transport; re-stat the renamed file and compare its size against
/// the local source before calling the transfer complete.
async fn verify_remote_size(sftp: &SftpSession, remote_str: &str, expected_len: u64, address: &str) -> Result<()> {
    let attrs = sftp
        .metadata(remote_str)
        .await
        .map_err(|e| CertDeployError::sftp_fatal(address.to_string(), format!("cannot stat {remote_str} after upload: {e}")))?;
    let actual_len = attrs.size.unwrap_or(0);
    if actual_len != expected_len {
        return Err(CertDeployError::sftp_fatal(
            address.to_string(),
            format!("{remote_str} truncated in transit: expected {expected_len} bytes, got {actual_len}"),
        ));
    }
    Ok(())
}

/// Close out a lineage upload with an empty `.certdeploy-complete` file,
/// the last write for that directory and the only signal C8's promoter
/// needs to treat the tree as ready — it knows nothing about `needs_*`,
/// so only the uploader is in a position to say "that was the last file".
async fn write_completion_marker(sftp: &SftpSession, remote_lineage_dir: &std::path::Path, address: &str) -> Result<()> {
    use tokio::io::AsyncWriteExt;
    let marker = remote_lineage_dir.join(".certdeploy-complete");
    let marker_str = marker.to_string_lossy().into_owned();
    let mut file = sftp
        .create(marker_str.clone())
        .await
        .map_err(|e| CertDeployError::sftp_fatal(address.to_string(), format!("cannot create {marker_str}: {e}")))?;
    file.shutdown()
        .await
        .map_err(|e| CertDeployError::sftp_fatal(address.to_string(), format!("close failed for {marker_str}: {e}")))?;
    Ok(())
}

/// SSH client handler whose only job is exact-match host key pinning; it
/// never falls back to trust-on-first-use.
#[derive(Clone)]
struct ClientKeyChecker {
    pinned: PinnedKey,
    mismatch: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl Handler for ClientKeyChecker {
    type Error = anyhow::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> std::result::Result<bool, Self::Error> {
        let ok = self.pinned.matches(server_public_key);
        if !ok {
            self.mismatch.store(true, Ordering::SeqCst);
            warn!("presented host key does not match pinned value");
        }
        Ok(ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mismatch_flag_starts_false() {
        let flag = Arc::new(AtomicBool::new(false));
        assert!(!flag.load(Ordering::SeqCst));
    }
}
