//! Push engine (C4): expands the queue snapshot into `(job, client)`
//! pairs, drains them serially or in parallel with per-client retry and
//! inter-push pacing, and folds attempt outcomes back into the queue.

use std::sync::Arc;
use std::time::Duration;

use certdeploy_config::{PushMode, ServerConfig};
use certdeploy_queue::Queue;
use certdeploy_retry::RetryPolicy;
use certdeploy_trust::LocalKey;
use certdeploy_types::{AttemptState, CertDeployError, ClientDescriptor, ErrorCategory, PushJob, QueueEntry};
use tokio::task::JoinSet;
use tracing::{error, info};

/// One `(job, client)` unit of work the engine schedules.
#[derive(Clone)]
struct Pair {
    job: PushJob,
    client: ClientDescriptor,
}

pub struct EngineResult {
    pub fatal_abort: bool,
}

/// Drain one queue snapshot to completion.
///
/// Returns `fatal_abort = true` when `fail_fast` tripped and the caller
/// should stop scheduling further work (§4.4).
pub async fn drain(
    config: &ServerConfig,
    queue: &Queue,
    local_key: Arc<LocalKey>,
) -> Result<EngineResult, CertDeployError> {
    let clients = config.all_clients()?;
    let entries = {
        let queue = queue.clone();
        let result = tokio::task::spawn_blocking(move || queue.snapshot())
            .await
            .map_err(|e| CertDeployError::config(format!("engine task panicked: {e}")))?;
        result.map_err(|e| CertDeployError::config(e.to_string()))?
    };

    let pairs = expand(&entries, &clients);
    if pairs.is_empty() {
        return Ok(EngineResult { fatal_abort: false });
    }

    let fatal_abort = match config.push_mode {
        PushMode::Serial => run_serial(config, queue, local_key, pairs).await?,
        PushMode::Parallel => run_parallel(config, queue, local_key, pairs).await?,
    };

    reap_completed_jobs(queue, &entries)?;
    Ok(EngineResult { fatal_abort })
}

/// `(job, client)` for every client whose domains intersect the job's.
fn expand(entries: &[QueueEntry], clients: &[ClientDescriptor]) -> Vec<Pair> {
    let mut pairs = Vec::new();
    for entry in entries {
        for client in clients {
            let targeted = entry
                .per_client
                .get(&client.target_key())
                .map(|s| *s != AttemptState::Exhausted && *s != AttemptState::Succeeded)
                .unwrap_or(true);
            if !targeted {
                continue;
            }
            let intersects = client.domains.iter().any(|d| entry.job.domains.contains(d));
            if intersects {
                pairs.push(Pair {
                    job: entry.job.clone(),
                    client: client.clone(),
                });
            }
        }
    }
    pairs
}

async fn run_serial(
    config: &ServerConfig,
    queue: &Queue,
    local_key: Arc<LocalKey>,
    pairs: Vec<Pair>,
) -> Result<bool, CertDeployError> {
    for pair in pairs {
        let outcome = attempt_pair(config, &pair, local_key.clone()).await;
        record_outcome(queue, &pair, &outcome)?;
        if let Outcome::Fatal(_) = &outcome
            && config.fail_fast
        {
            return Ok(true);
        }
        if config.push_interval > 0 {
            tokio::time::sleep(Duration::from_secs(config.push_interval)).await;
        }
    }
    Ok(false)
}

async fn run_parallel(
    config: &ServerConfig,
    queue: &Queue,
    local_key: Arc<LocalKey>,
    pairs: Vec<Pair>,
) -> Result<bool, CertDeployError> {
    use std::collections::HashMap;
    let mut by_client: HashMap<String, Vec<Pair>> = HashMap::new();
    for pair in pairs {
        by_client.entry(pair.client.target_key()).or_default().push(pair);
    }

    let mut join_set = JoinSet::new();
    for (_address, worker_pairs) in by_client {
        let config = clone_worker_config(config);
        let key = local_key.clone();
        join_set.spawn(async move {
            let mut outcomes = Vec::new();
            for pair in worker_pairs {
                let outcome = attempt_pair(&config, &pair, key.clone()).await;
                let fatal = matches!(outcome, Outcome::Fatal(_)) && config.fail_fast;
                outcomes.push((pair, outcome));
                if fatal {
                    break;
                }
            }
            outcomes
        });
    }

    let join_timeout = config.join_timeout.map(Duration::from_secs);
    let mut fatal_abort = false;
    let joined = match join_timeout {
        Some(t) => tokio::time::timeout(t, join_all(join_set)).await.map_err(|_| {
            CertDeployError::config("push engine join_timeout elapsed before all workers finished")
        })?,
        None => join_all(join_set).await,
    };

    for outcomes in joined {
        for (pair, outcome) in outcomes {
            record_outcome(queue, &pair, &outcome)?;
            if matches!(outcome, Outcome::Fatal(_)) && config.fail_fast {
                fatal_abort = true;
            }
        }
    }

    Ok(fatal_abort)
}

async fn join_all(mut join_set: JoinSet<Vec<(Pair, Outcome)>>) -> Vec<Vec<(Pair, Outcome)>> {
    let mut results = Vec::new();
    while let Some(joined) = join_set.join_next().await {
        if let Ok(outcomes) = joined {
            results.push(outcomes);
        }
    }
    results
}

fn clone_worker_config(config: &ServerConfig) -> ServerConfig {
    config.clone()
}

enum Outcome {
    Success,
    Fatal(CertDeployError),
    Exhausted(CertDeployError),
}

async fn attempt_pair(config: &ServerConfig, pair: &Pair, local_key: Arc<LocalKey>) -> Outcome {
    let policy = RetryPolicy::resolve(&pair.client, config.push_retries, config.push_retry_interval);
    let mut attempt = 0;
    loop {
        let result = certdeploy_sftp::upload_lineage(&pair.client, &local_key, &pair.job).await;
        match result {
            Ok(()) => {
                info!(address = %pair.client.address, lineage = %pair.job.lineage_name, "push succeeded");
                return Outcome::Success;
            }
            Err(e) => {
                error!("Error syncing with {}: {e}", pair.client.address);
                if e.category() != ErrorCategory::Transient {
                    return Outcome::Fatal(e);
                }
                if attempt >= policy.retries {
                    return Outcome::Exhausted(e);
                }
                attempt += 1;
                tokio::time::sleep(policy.interval).await;
            }
        }
    }
}

fn record_outcome(queue: &Queue, pair: &Pair, outcome: &Outcome) -> Result<(), CertDeployError> {
    let state = match outcome {
        Outcome::Success => AttemptState::Succeeded,
        Outcome::Fatal(_) | Outcome::Exhausted(_) => AttemptState::Exhausted,
    };
    queue
        .set_attempt_state(&pair.job.lineage_name, &pair.client.target_key(), state)
        .map_err(|e| CertDeployError::config(e.to_string()))
}

/// Drop any entry for which every originally-snapshotted target now has a
/// terminal state (succeeded or exhausted).
fn reap_completed_jobs(queue: &Queue, entries: &[QueueEntry]) -> Result<(), CertDeployError> {
    for entry in entries {
        let fresh = queue
            .snapshot()
            .map_err(|e| CertDeployError::config(e.to_string()))?
            .into_iter()
            .find(|e| e.job.lineage_name == entry.job.lineage_name);
        let Some(fresh) = fresh else { continue };
        let all_terminal = fresh
            .per_client
            .values()
            .all(|s| matches!(s, AttemptState::Succeeded | AttemptState::Exhausted));
        if all_terminal && !fresh.per_client.is_empty() {
            queue
                .remove(&fresh.job.lineage_name)
                .map_err(|e| CertDeployError::config(e.to_string()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn client(address: &str, domains: &[&str]) -> ClientDescriptor {
        client_on_port(address, 22, domains)
    }

    fn client_on_port(address: &str, port: u16, domains: &[&str]) -> ClientDescriptor {
        ClientDescriptor {
            address: address.to_string(),
            port,
            username: "certdeploy".to_string(),
            pubkey: "ssh-ed25519 AAAA".to_string(),
            domains: domains.iter().map(|s| s.to_string()).collect(),
            remote_path: "/var/cache/certdeploy".into(),
            needs_chain: false,
            needs_fullchain: true,
            needs_privkey: true,
            push_retries: None,
            push_retry_interval: None,
        }
    }

    fn entry(domains: &[&str]) -> QueueEntry {
        QueueEntry::new(PushJob::new(
            PathBuf::from("/etc/letsencrypt/live/example.com"),
            domains.iter().map(|s| s.to_string()).collect(),
        ))
    }

    #[test]
    fn expand_only_includes_intersecting_clients() {
        let entries = vec![entry(&["example.com"])];
        let clients = vec![client("10.0.0.1", &["example.com"]), client("10.0.0.2", &["other.com"])];
        let pairs = expand(&entries, &clients);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].client.address, "10.0.0.1");
    }

    #[test]
    fn expand_skips_already_succeeded_clients() {
        let target = client("10.0.0.1", &["example.com"]);
        let mut e = entry(&["example.com"]);
        e.per_client.insert(target.target_key(), AttemptState::Succeeded);
        let pairs = expand(&[e], &[target]);
        assert!(pairs.is_empty());
    }

    #[test]
    fn expand_retargets_pending_clients() {
        let target = client("10.0.0.1", &["example.com"]);
        let mut e = entry(&["example.com"]);
        e.per_client.insert(target.target_key(), AttemptState::Pending);
        let pairs = expand(&[e], &[target]);
        assert_eq!(pairs.len(), 1);
    }

    #[test]
    fn expand_tracks_same_address_different_ports_independently() {
        let a = client_on_port("10.0.0.1", 22, &["example.com"]);
        let b = client_on_port("10.0.0.1", 2222, &["example.com"]);
        let mut e = entry(&["example.com"]);
        e.per_client.insert(a.target_key(), AttemptState::Succeeded);
        let pairs = expand(&[e], &[a, b]);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].client.port, 2222);
    }
}
