//! Shared wire contract (C3 uploader, C7 server): SSH v2 transport, ed25519
//! host/user key pinning, and the `<remote_path>/<lineage_name>/*.pem`
//! directory layout that binds the server and client sides.
//!
//! No `known_hosts` trust-on-first-use anywhere in this crate — every
//! connection is checked against a [`certdeploy_trust::PinnedKey`] loaded
//! ahead of time, and a mismatch is always fatal for that peer.

use std::time::Duration;

pub mod client;
pub mod server;

pub use client::upload_lineage;
pub use server::{serve_forever, SftpServerConfig};

/// How long to wait for the SSH handshake and authentication to complete
/// before treating the attempt as a transient connect failure.
pub const SSH_BANNER_TIMEOUT: Duration = Duration::from_secs(15);

fn russh_client_config() -> russh::client::Config {
    russh::client::Config {
        inactivity_timeout: Some(SSH_BANNER_TIMEOUT),
        ..Default::default()
    }
}
