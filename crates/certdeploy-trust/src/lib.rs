//! Key & trust store (C1).
//!
//! Loads the local ed25519 private key used to authenticate outbound (as
//! the SFTP client) or inbound (as the SFTP host) connections, and pins
//! remote peer public keys by exact equality — no `known_hosts`-style
//! trust-on-first-use anywhere in this crate.

use std::path::Path;

use anyhow::{Context, Result, bail};
use russh_keys::key::{KeyPair, PublicKey};
use russh_keys::PublicKeyBase64;

/// A loaded private key, no passphrase accepted.
pub struct LocalKey {
    pub keypair: KeyPair,
}

pub fn load_private_key(path: &Path) -> Result<LocalKey> {
    let keypair = russh_keys::load_secret_key(path, None)
        .with_context(|| format!("failed to load private key from {}", path.display()))?;
    if !matches!(keypair, KeyPair::Ed25519(_)) {
        bail!(
            "private key at {} is not ed25519 (certdeploy accepts only ed25519 keys)",
            path.display()
        );
    }
    Ok(LocalKey { keypair })
}

/// A single pinned peer key, normalized (trailing `user@host` comment
/// stripped, matching standard `authorized_keys` formatting). Every peer
/// key certdeploy pins comes from an already-loaded config field
/// (`ClientDescriptor.pubkey` or `sftpd.pubkey`), so there is exactly one
/// constructor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinnedKey {
    normalized: String,
}

impl PinnedKey {
    pub fn from_raw(raw: &str) -> Self {
        Self {
            normalized: normalize(raw),
        }
    }

    /// Exact-match comparison against a presented public key's
    /// openssh-authorized-keys-format encoding. No fuzzy matching, no
    /// fingerprint comparison, no trust-on-first-use.
    pub fn matches(&self, presented: &PublicKey) -> bool {
        let presented_line = format!("{} {}", presented.name(), presented.public_key_base64());
        normalize(&presented_line) == self.normalized
    }

    pub fn matches_raw(&self, presented: &str) -> bool {
        normalize(presented) == self.normalized
    }
}

/// Strip a trailing `user@host`-style comment from an authorized-keys
/// line, keeping only `<type> <base64>`.
fn normalize(raw: &str) -> String {
    let trimmed = raw.trim();
    let mut parts = trimmed.split_whitespace();
    let key_type = parts.next().unwrap_or("");
    let key_data = parts.next().unwrap_or("");
    format!("{key_type} {key_data}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_trailing_comment() {
        let pinned = PinnedKey::from_raw("ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAI user@host");
        assert!(pinned.matches_raw("ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAI"));
    }

    #[test]
    fn normalize_is_idempotent_without_comment() {
        let pinned = PinnedKey::from_raw("ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAI");
        assert!(pinned.matches_raw("ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAI user@other-host"));
    }

    #[test]
    fn mismatched_key_data_does_not_match() {
        let pinned = PinnedKey::from_raw("ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAI");
        assert!(!pinned.matches_raw("ssh-ed25519 totallydifferentkeydata"));
    }
}
