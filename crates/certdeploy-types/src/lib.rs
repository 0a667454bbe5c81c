//! Shared data model for certdeploy: push jobs, client descriptors, update
//! driver descriptors, and the error kinds both binaries raise.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod error;

pub use error::{CertDeployError, ExitCode};

/// Basename of a lineage directory, e.g. `example.com`.
pub type LineageName = String;

/// The four PEM files a lineage may carry. Not every lineage must have all
/// four present on disk, but `needs_*` flags only ever select among these.
pub const LINEAGE_FILES: [&str; 4] = ["fullchain.pem", "chain.pem", "privkey.pem", "cert.pem"];

/// A pending request to deliver one lineage to every client whose domain
/// set intersects the lineage's domains.
///
/// Two jobs with the same `lineage_name` are deduplicated by the queue;
/// the later one's `domains` supersede the earlier one's.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushJob {
    pub lineage_path: PathBuf,
    pub lineage_name: LineageName,
    pub domains: Vec<String>,
}

impl PushJob {
    pub fn new(lineage_path: PathBuf, domains: Vec<String>) -> Self {
        let lineage_name = lineage_path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            lineage_path,
            lineage_name,
            domains,
        }
    }
}

/// Per-client attempt state for a single queued job, tracked so a
/// restarted daemon can resume a partially-drained job without
/// re-attempting clients that already succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    Pending,
    Succeeded,
    Exhausted,
}

/// A queue entry: the job plus the attempt state of every client it has
/// been offered to so far. Clients not yet present in `per_client` are
/// implicitly `Pending`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub job: PushJob,
    #[serde(default)]
    pub per_client: BTreeMap<String, AttemptState>,
}

impl QueueEntry {
    pub fn new(job: PushJob) -> Self {
        Self {
            job,
            per_client: BTreeMap::new(),
        }
    }
}

/// A remote host the server pushes certificates to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientDescriptor {
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_username")]
    pub username: String,
    pub pubkey: String,
    pub domains: Vec<String>,
    #[serde(default = "default_remote_path")]
    pub remote_path: PathBuf,
    #[serde(default)]
    pub needs_chain: bool,
    #[serde(default = "default_true")]
    pub needs_fullchain: bool,
    #[serde(default = "default_true")]
    pub needs_privkey: bool,
    #[serde(default)]
    pub push_retries: Option<u32>,
    #[serde(default)]
    pub push_retry_interval: Option<u64>,
}

fn default_port() -> u16 {
    22
}

fn default_username() -> String {
    "certdeploy".to_string()
}

fn default_remote_path() -> PathBuf {
    PathBuf::from("/var/cache/certdeploy")
}

fn default_true() -> bool {
    true
}

impl ClientDescriptor {
    /// The subset of `LINEAGE_FILES` this client wants, in canonical order.
    pub fn needed_files(&self) -> Vec<&'static str> {
        let mut files = Vec::new();
        if self.needs_fullchain {
            files.push("fullchain.pem");
        }
        if self.needs_chain {
            files.push("chain.pem");
        }
        if self.needs_privkey {
            files.push("privkey.pem");
        }
        files
    }

    /// Stable identity for this target, used to key per-client attempt
    /// state. `address` alone is not unique: two descriptors can share a
    /// host with different ports (or be genuine duplicates), so every
    /// `per_client` map must key on `address:port`, not `address`.
    pub fn target_key(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Either a uid/gid or a symbolic owner/group name, used by
/// [`FilePermissions`]. Untagged: whichever parses first wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OwnerSpec {
    Id(u32),
    Name(String),
}

/// Permissions and ownership to apply to a promoted lineage. Fields left
/// unset preserve whatever attribute the uploader transferred.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePermissions {
    #[serde(default)]
    pub mode: Option<u32>,
    #[serde(default)]
    pub directory_mode: Option<u32>,
    #[serde(default)]
    pub owner: Option<OwnerSpec>,
    #[serde(default)]
    pub group: Option<OwnerSpec>,
}

/// Action taken against an init/rc managed unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitAction {
    #[default]
    Restart,
    Reload,
}

/// A name-or-filters selector for container/orchestrator-service drivers.
/// Exactly one of the two must be set; a bare `name` on a container
/// descriptor is normalized by the caller into `filters: {name: "^<name>$"}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selector {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub filters: Option<BTreeMap<String, String>>,
}

/// One configured post-promotion action. Declaration order is preserved
/// and iterated in that order by the client orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServiceUpdateDescriptor {
    Container {
        #[serde(flatten)]
        selector: Selector,
        #[serde(default)]
        timeout: Option<u64>,
    },
    OrchestratorService {
        #[serde(flatten)]
        selector: Selector,
        #[serde(default)]
        timeout: Option<u64>,
    },
    InitUnit {
        name: String,
        #[serde(default)]
        action: UnitAction,
        #[serde(default)]
        timeout: Option<u64>,
    },
    RcUnit {
        name: String,
        #[serde(default)]
        action: UnitAction,
        #[serde(default)]
        timeout: Option<u64>,
    },
    Script {
        name: PathBuf,
        #[serde(default)]
        timeout: Option<u64>,
    },
}

impl ServiceUpdateDescriptor {
    pub fn timeout(&self) -> Option<Duration> {
        let secs = match self {
            ServiceUpdateDescriptor::Container { timeout, .. }
            | ServiceUpdateDescriptor::OrchestratorService { timeout, .. }
            | ServiceUpdateDescriptor::InitUnit { timeout, .. }
            | ServiceUpdateDescriptor::RcUnit { timeout, .. }
            | ServiceUpdateDescriptor::Script { timeout, .. } => *timeout,
        };
        secs.map(Duration::from_secs)
    }

    /// Normalize a bare container `name` into the filter form required by
    /// the container-runtime list API (`^<name>$`), matching the upstream
    /// label-filtering workaround for orchestrator services (§9).
    pub fn normalize(self) -> Self {
        match self {
            ServiceUpdateDescriptor::Container {
                selector: Selector {
                    name: Some(name),
                    filters: None,
                },
                timeout,
            } => {
                let mut filters = BTreeMap::new();
                filters.insert("name".to_string(), format!("^{name}$"));
                ServiceUpdateDescriptor::Container {
                    selector: Selector {
                        name: Some(name),
                        filters: Some(filters),
                    },
                    timeout,
                }
            }
            other => other,
        }
    }
}
