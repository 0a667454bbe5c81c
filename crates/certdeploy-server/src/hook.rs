//! Deploy hook entry (C6): turn the certbot renewal environment, or the
//! CLI's `--lineage`/`--domains` pair, into one push job and enqueue it.

use std::path::PathBuf;

use certdeploy_queue::Queue;
use certdeploy_types::{CertDeployError, PushJob};

/// Resolve a seed job from explicit CLI flags first, falling back to the
/// `RENEWED_LINEAGE`/`RENEWED_DOMAINS` environment certbot's deploy-hook
/// sets. Returns `Ok(None)` when neither source is present — not every
/// invocation seeds a job (e.g. plain `--push` drains without seeding).
pub fn resolve_seed_job(
    cli_lineage: Option<PathBuf>,
    cli_domains: Option<String>,
) -> Result<Option<PushJob>, CertDeployError> {
    let lineage_path = cli_lineage.or_else(|| std::env::var("RENEWED_LINEAGE").ok().map(PathBuf::from));
    let domains_raw = cli_domains.or_else(|| std::env::var("RENEWED_DOMAINS").ok());

    match (lineage_path, domains_raw) {
        (None, None) => Ok(None),
        (Some(path), Some(domains)) => {
            let domains: Vec<String> = domains.split_whitespace().map(str::to_string).collect();
            if domains.is_empty() {
                return Err(CertDeployError::config(
                    "RENEWED_DOMAINS/--domains must list at least one domain",
                ));
            }
            Ok(Some(PushJob::new(path, domains)))
        }
        _ => Err(CertDeployError::config(
            "lineage and domains must be supplied together, from either flags or the renewal environment",
        )),
    }
}

pub fn enqueue(queue: &Queue, job: PushJob) -> Result<(), CertDeployError> {
    queue.enqueue(job).map_err(|e| CertDeployError::config(e.to_string()))
}
