//! Staging -> destination promoter (C8): moves a completed lineage tree
//! out of the SFTP landing area into its final destination, applying
//! requested permissions and ownership.

use std::fs;
use std::path::{Path, PathBuf};

use certdeploy_types::{CertDeployError, FilePermissions, OwnerSpec};
use tracing::info;

/// Written by the uploader (C3) as the very last file for a lineage; its
/// presence is the only signal the promoter needs that a tree is ready.
pub const COMPLETION_MARKER: &str = ".certdeploy-complete";

/// Promote `source_dir/<lineage_name>` into `destination/<lineage_name>`.
/// Leaves `source_dir` on any failure so a retry can pick the tree back
/// up (§7: `PromotionError` is fatal for that lineage, staging stays put).
pub fn promote(
    source_dir: &Path,
    lineage_name: &str,
    destination: &Path,
    permissions: &FilePermissions,
) -> Result<PathBuf, CertDeployError> {
    let source_lineage = source_dir.join(lineage_name);
    let dest_lineage = destination.join(lineage_name);

    let _lock = PromotionLock::acquire(destination, lineage_name)?;

    fs::create_dir_all(&dest_lineage)
        .map_err(|e| CertDeployError::Promotion(format!("cannot create {}: {e}", dest_lineage.display())))?;

    let entries = fs::read_dir(&source_lineage)
        .map_err(|e| CertDeployError::Promotion(format!("cannot read {}: {e}", source_lineage.display())))?;

    for entry in entries {
        let entry = entry.map_err(|e| CertDeployError::Promotion(e.to_string()))?;
        let name = entry.file_name();
        if name == COMPLETION_MARKER {
            continue;
        }
        let from = entry.path();
        let to = dest_lineage.join(&name);
        move_file(&from, &to)?;
    }

    if let Some(mode) = permissions.directory_mode {
        set_mode(&dest_lineage, mode)?;
    }
    for entry in fs::read_dir(&dest_lineage).map_err(|e| CertDeployError::Promotion(e.to_string()))? {
        let entry = entry.map_err(|e| CertDeployError::Promotion(e.to_string()))?;
        let path = entry.path();
        if let Some(mode) = permissions.mode {
            set_mode(&path, mode)?;
        }
        chown(&path, permissions)?;
    }
    if permissions.owner.is_some() || permissions.group.is_some() {
        chown(&dest_lineage, permissions)?;
    }

    let _ = fs::remove_file(source_lineage.join(COMPLETION_MARKER));
    let _ = fs::remove_dir(&source_lineage);

    info!(lineage = lineage_name, destination = %dest_lineage.display(), "lineage promoted");
    Ok(dest_lineage)
}

/// Rename when possible; fall back to copy-then-remove across devices.
/// Never leaves a partial file at `to` — the copy target is the temp
/// name's sibling, so a failed copy simply leaves nothing behind.
fn move_file(from: &Path, to: &Path) -> Result<(), CertDeployError> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(nix::libc::EXDEV) => {
            fs::copy(from, to).map_err(|e| {
                CertDeployError::Promotion(format!(
                    "cross-device copy {} -> {}: {e}",
                    from.display(),
                    to.display()
                ))
            })?;
            fs::remove_file(from).map_err(|e| CertDeployError::Promotion(e.to_string()))?;
            Ok(())
        }
        Err(e) => Err(CertDeployError::Promotion(format!(
            "cannot move {} -> {}: {e}",
            from.display(),
            to.display()
        ))),
    }
}

fn set_mode(path: &Path, mode: u32) -> Result<(), CertDeployError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| CertDeployError::Promotion(format!("cannot chmod {}: {e}", path.display())))
}

fn chown(path: &Path, permissions: &FilePermissions) -> Result<(), CertDeployError> {
    if permissions.owner.is_none() && permissions.group.is_none() {
        return Ok(());
    }
    let uid = resolve_uid(permissions.owner.as_ref())?;
    let gid = resolve_gid(permissions.group.as_ref())?;
    nix::unistd::chown(path, uid, gid)
        .map_err(|e| CertDeployError::Promotion(format!("cannot chown {}: {e}", path.display())))
}

fn resolve_uid(owner: Option<&OwnerSpec>) -> Result<Option<nix::unistd::Uid>, CertDeployError> {
    match owner {
        None => Ok(None),
        Some(OwnerSpec::Id(id)) => Ok(Some(nix::unistd::Uid::from_raw(*id))),
        Some(OwnerSpec::Name(name)) => {
            let user = nix::unistd::User::from_name(name)
                .map_err(|e| CertDeployError::Promotion(format!("cannot resolve owner {name}: {e}")))?
                .ok_or_else(|| CertDeployError::Promotion(format!("no such user {name}")))?;
            Ok(Some(user.uid))
        }
    }
}

fn resolve_gid(group: Option<&OwnerSpec>) -> Result<Option<nix::unistd::Gid>, CertDeployError> {
    match group {
        None => Ok(None),
        Some(OwnerSpec::Id(id)) => Ok(Some(nix::unistd::Gid::from_raw(*id))),
        Some(OwnerSpec::Name(name)) => {
            let group = nix::unistd::Group::from_name(name)
                .map_err(|e| CertDeployError::Promotion(format!("cannot resolve group {name}: {e}")))?
                .ok_or_else(|| CertDeployError::Promotion(format!("no such group {name}")))?;
            Ok(Some(group.gid))
        }
    }
}

/// Exclusive, per-lineage lock on the destination side so two promotions
/// of the same lineage (e.g. a retried upload racing a slow one) never
/// interleave their file moves.
struct PromotionLock {
    path: PathBuf,
}

impl PromotionLock {
    fn acquire(destination: &Path, lineage_name: &str) -> Result<Self, CertDeployError> {
        fs::create_dir_all(destination).map_err(|e| CertDeployError::Promotion(e.to_string()))?;
        let path = destination.join(format!(".{lineage_name}.promote.lock"));
        fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| {
                CertDeployError::Promotion(format!(
                    "lineage {lineage_name} is already being promoted: {e}"
                ))
            })?;
        Ok(Self { path })
    }
}

impl Drop for PromotionLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_lineage(source: &Path, lineage: &str, files: &[&str]) {
        let dir = source.join(lineage);
        fs::create_dir_all(&dir).unwrap();
        for f in files {
            fs::write(dir.join(f), b"pem-bytes").unwrap();
        }
        fs::write(dir.join(COMPLETION_MARKER), b"").unwrap();
    }

    #[test]
    fn promote_moves_files_and_skips_marker() {
        let source = tempdir().unwrap();
        let dest = tempdir().unwrap();
        write_lineage(source.path(), "example.com", &["fullchain.pem", "privkey.pem"]);

        let dest_lineage = promote(
            source.path(),
            "example.com",
            dest.path(),
            &FilePermissions::default(),
        )
        .unwrap();

        assert!(dest_lineage.join("fullchain.pem").exists());
        assert!(dest_lineage.join("privkey.pem").exists());
        assert!(!dest_lineage.join(COMPLETION_MARKER).exists());
        assert!(!source.path().join("example.com").exists());
    }

    #[test]
    fn promote_applies_file_mode() {
        let source = tempdir().unwrap();
        let dest = tempdir().unwrap();
        write_lineage(source.path(), "example.com", &["privkey.pem"]);

        let permissions = FilePermissions {
            mode: Some(0o600),
            ..Default::default()
        };
        let dest_lineage = promote(source.path(), "example.com", dest.path(), &permissions).unwrap();

        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(dest_lineage.join("privkey.pem")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn concurrent_promotion_of_same_lineage_is_rejected() {
        let dest = tempdir().unwrap();
        let _lock = PromotionLock::acquire(dest.path(), "example.com").unwrap();
        assert!(PromotionLock::acquire(dest.path(), "example.com").is_err());
    }
}
