//! SFTP server (client side, C7): an embedded SSH server that accepts
//! exactly one pinned peer and exposes a sandboxed SFTP subsystem rooted
//! at `source_dir`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use certdeploy_trust::{LocalKey, PinnedKey};
use russh::server::{Auth, Config, Handler, Msg, Server as _, Session};
use russh::{Channel, ChannelId};
use russh_keys::key::PublicKey;
use russh_sftp::protocol::{Attrs, FileAttributes, Handle, Name, Status, StatusCode, Version};
use tracing::{info, warn};

/// Parameters for the embedded SFTP listener.
pub struct SftpServerConfig {
    pub listen_address: String,
    pub listen_port: u16,
    pub username: String,
    pub host_key: LocalKey,
    pub pinned_peer_key: PinnedKey,
    pub source_dir: PathBuf,
}

/// Bind and serve forever, one connection at a time (§4.7: "exactly one
/// pinned peer key is accepted," the wire contract does not ask for
/// concurrent client fan-in). Returns only on a listener error.
pub async fn serve_forever(config: SftpServerConfig) -> anyhow::Result<()> {
    let ssh_config = Arc::new(Config {
        keys: vec![config.host_key.keypair.clone()],
        ..Default::default()
    });

    let mut server = SshServer {
        username: Arc::new(config.username),
        pinned_peer_key: Arc::new(config.pinned_peer_key),
        source_dir: Arc::new(config.source_dir),
    };

    let bind_addr: SocketAddr = format!("{}:{}", config.listen_address, config.listen_port).parse()?;
    info!(address = %bind_addr, "sftp server listening");
    server.run_on_address(ssh_config, bind_addr).await?;
    Ok(())
}

#[derive(Clone)]
struct SshServer {
    username: Arc<String>,
    pinned_peer_key: Arc<PinnedKey>,
    source_dir: Arc<PathBuf>,
}

impl russh::server::Server for SshServer {
    type Handler = ClientSession;

    fn new_client(&mut self, peer: Option<SocketAddr>) -> ClientSession {
        if let Some(addr) = peer {
            info!(address = %addr, "sftp client connecting");
        }
        ClientSession {
            username: self.username.clone(),
            pinned_peer_key: self.pinned_peer_key.clone(),
            source_dir: self.source_dir.clone(),
        }
    }
}

struct ClientSession {
    username: Arc<String>,
    pinned_peer_key: Arc<PinnedKey>,
    source_dir: Arc<PathBuf>,
}

#[async_trait::async_trait]
impl Handler for ClientSession {
    type Error = anyhow::Error;

    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> std::result::Result<Auth, Self::Error> {
        if user == self.username.as_str() && self.pinned_peer_key.matches(key) {
            Ok(Auth::Accept)
        } else {
            warn!(%user, "rejected sftp auth attempt");
            Ok(Auth::reject())
        }
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        if name != "sftp" {
            session.channel_failure(channel_id)?;
            return Ok(());
        }
        session.channel_success(channel_id)?;
        let channel = session.channel(channel_id).ok_or_else(|| anyhow::anyhow!("unknown channel"))?;
        let handler = SandboxedSftp::new(self.source_dir.as_ref().clone());
        tokio::spawn(async move {
            if let Err(e) = russh_sftp::server::run(channel.into_stream(), handler).await {
                warn!(error = %e, "sftp subsystem session ended with an error");
            }
        });
        Ok(())
    }
}

/// Rejects any path that resolves outside `root` after normalizing `..`
/// components — `source_dir` is the only writable surface the remote
/// side ever sees.
fn sandbox(root: &Path, requested: &str) -> std::result::Result<PathBuf, StatusCode> {
    let requested = Path::new(requested.trim_start_matches('/'));
    let mut resolved = root.to_path_buf();
    for component in requested.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir => return Err(StatusCode::PermissionDenied),
            Component::RootDir | Component::Prefix(_) => {}
        }
    }
    if !resolved.starts_with(root) {
        return Err(StatusCode::PermissionDenied);
    }
    Ok(resolved)
}

/// Minimal read/write SFTP handler sandboxed to one directory. Implements
/// the subset of operations C3's uploader actually issues: `mkdir`,
/// `open`/`write`/`close`, `setstat`, `rename`, `remove`, `stat`, and
/// `realpath`.
struct SandboxedSftp {
    root: PathBuf,
    open_files: HashMap<String, tokio::fs::File>,
    next_handle: u64,
    version: Option<u32>,
}

impl SandboxedSftp {
    fn new(root: PathBuf) -> Self {
        Self {
            root,
            open_files: HashMap::new(),
            next_handle: 0,
            version: None,
        }
    }

    fn resolve(&self, path: &str) -> std::result::Result<PathBuf, StatusCode> {
        sandbox(&self.root, path)
    }

    fn allocate_handle(&mut self) -> String {
        self.next_handle += 1;
        self.next_handle.to_string()
    }
}

#[async_trait::async_trait]
impl russh_sftp::server::Handler for SandboxedSftp {
    type Error = StatusCode;

    fn unimplemented(&self) -> Self::Error {
        StatusCode::OpUnsupported
    }

    async fn init(&mut self, version: u32, _extensions: HashMap<String, String>) -> std::result::Result<Version, Self::Error> {
        self.version = Some(version);
        Ok(Version::new())
    }

    async fn open(
        &mut self,
        id: u32,
        filename: String,
        _pflags: russh_sftp::protocol::OpenFlags,
        _attrs: FileAttributes,
    ) -> std::result::Result<Handle, Self::Error> {
        let path = self.resolve(&filename)?;
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await
            .map_err(|_| StatusCode::Failure)?;
        let handle = self.allocate_handle();
        self.open_files.insert(handle.clone(), file);
        Ok(Handle { id, handle })
    }

    async fn close(&mut self, id: u32, handle: String) -> std::result::Result<Status, Self::Error> {
        self.open_files.remove(&handle);
        Ok(ok_status(id))
    }

    async fn write(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        data: Vec<u8>,
    ) -> std::result::Result<Status, Self::Error> {
        use tokio::io::{AsyncSeekExt, AsyncWriteExt};
        let file = self.open_files.get_mut(&handle).ok_or(StatusCode::Failure)?;
        file.seek(std::io::SeekFrom::Start(offset)).await.map_err(|_| StatusCode::Failure)?;
        file.write_all(&data).await.map_err(|_| StatusCode::Failure)?;
        Ok(ok_status(id))
    }

    async fn mkdir(&mut self, id: u32, path: String, _attrs: FileAttributes) -> std::result::Result<Status, Self::Error> {
        let resolved = self.resolve(&path)?;
        match tokio::fs::create_dir(&resolved).await {
            Ok(_) => Ok(ok_status(id)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(ok_status(id)),
            Err(_) => Err(StatusCode::Failure),
        }
    }

    async fn rename(&mut self, id: u32, oldpath: String, newpath: String) -> std::result::Result<Status, Self::Error> {
        let from = self.resolve(&oldpath)?;
        let to = self.resolve(&newpath)?;
        tokio::fs::rename(&from, &to).await.map_err(|_| StatusCode::Failure)?;
        Ok(ok_status(id))
    }

    async fn remove(&mut self, id: u32, filename: String) -> std::result::Result<Status, Self::Error> {
        let path = self.resolve(&filename)?;
        match tokio::fs::remove_file(&path).await {
            Ok(_) => Ok(ok_status(id)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StatusCode::NoSuchFile),
            Err(_) => Err(StatusCode::Failure),
        }
    }

    async fn setstat(&mut self, id: u32, path: String, attrs: FileAttributes) -> std::result::Result<Status, Self::Error> {
        let resolved = self.resolve(&path)?;
        #[cfg(unix)]
        if let Some(mode) = attrs.permissions {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(mode);
            tokio::fs::set_permissions(&resolved, perms).await.map_err(|_| StatusCode::Failure)?;
        }
        Ok(ok_status(id))
    }

    async fn stat(&mut self, id: u32, path: String) -> std::result::Result<Attrs, Self::Error> {
        let resolved = self.resolve(&path)?;
        let meta = tokio::fs::metadata(&resolved).await.map_err(|_| StatusCode::NoSuchFile)?;
        Ok(Attrs {
            id,
            attrs: attrs_from_metadata(&meta),
        })
    }

    async fn realpath(&mut self, id: u32, path: String) -> std::result::Result<Name, Self::Error> {
        let resolved = self.resolve(&path)?;
        let display = resolved
            .strip_prefix(&self.root)
            .unwrap_or(&resolved)
            .to_string_lossy()
            .into_owned();
        Ok(Name {
            id,
            files: vec![russh_sftp::protocol::File::new(format!("/{display}"), FileAttributes::default())],
        })
    }
}

fn ok_status(id: u32) -> Status {
    Status {
        id,
        status_code: StatusCode::Ok,
        error_message: "Ok".to_string(),
        language_tag: "en".to_string(),
    }
}

fn attrs_from_metadata(meta: &std::fs::Metadata) -> FileAttributes {
    let mut attrs = FileAttributes::default();
    attrs.size = Some(meta.len());
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        attrs.permissions = Some(meta.permissions().mode());
    }
    attrs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_accepts_nested_path() {
        let root = PathBuf::from("/var/lib/certdeploy/source");
        let resolved = sandbox(&root, "example.com/fullchain.pem").unwrap();
        assert_eq!(resolved, root.join("example.com/fullchain.pem"));
    }

    #[test]
    fn sandbox_rejects_parent_traversal() {
        let root = PathBuf::from("/var/lib/certdeploy/source");
        assert!(sandbox(&root, "../../etc/passwd").is_err());
    }

    #[test]
    fn sandbox_rejects_traversal_after_valid_prefix() {
        let root = PathBuf::from("/var/lib/certdeploy/source");
        assert!(sandbox(&root, "example.com/../../escape").is_err());
    }
}
