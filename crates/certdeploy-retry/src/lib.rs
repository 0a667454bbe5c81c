//! Retry policy resolution for the push engine (C4).
//!
//! Unlike the exponential/linear/jittered backoff families a general
//! publish pipeline needs, the push engine's retry model is the simple
//! one spec'd for certificate pushes: a fixed attempt count and a fixed
//! wait between attempts, with the client descriptor allowed to override
//! the server default. §9 asks that this merge be evaluated once per
//! `(job, client)` pair rather than recomputed per attempt, which is what
//! [`RetryPolicy::resolve`] is for.

use std::time::Duration;

use certdeploy_types::ClientDescriptor;

pub const DEFAULT_PUSH_RETRIES: u32 = 1;
pub const DEFAULT_PUSH_RETRY_INTERVAL_SECS: u64 = 30;

/// The resolved retry behavior for one `(job, client)` pair: `retries` is
/// the number of attempts *beyond* the first, and `interval` is the sleep
/// between consecutive attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    /// Resolve client-override-of-server-default precedence once.
    pub fn resolve(client: &ClientDescriptor, server_push_retries: u32, server_push_retry_interval: u64) -> Self {
        let retries = client.push_retries.unwrap_or(server_push_retries);
        let interval_secs = client
            .push_retry_interval
            .unwrap_or(server_push_retry_interval);
        Self {
            retries,
            interval: Duration::from_secs(interval_secs),
        }
    }

    /// Total number of attempts (first try plus retries).
    pub fn total_attempts(&self) -> u32 {
        self.retries + 1
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: DEFAULT_PUSH_RETRIES,
            interval: Duration::from_secs(DEFAULT_PUSH_RETRY_INTERVAL_SECS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(push_retries: Option<u32>, push_retry_interval: Option<u64>) -> ClientDescriptor {
        ClientDescriptor {
            address: "10.0.0.1".to_string(),
            port: 22,
            username: "certdeploy".to_string(),
            pubkey: "ssh-ed25519 AAAA".to_string(),
            domains: vec!["example.com".to_string()],
            remote_path: "/var/cache/certdeploy".into(),
            needs_chain: false,
            needs_fullchain: true,
            needs_privkey: true,
            push_retries,
            push_retry_interval,
        }
    }

    #[test]
    fn client_override_wins_over_server_default() {
        let policy = RetryPolicy::resolve(&client(Some(0), Some(0)), 10, 30);
        assert_eq!(policy.retries, 0);
        assert_eq!(policy.interval, Duration::from_secs(0));
    }

    #[test]
    fn server_default_applies_when_client_unset() {
        let policy = RetryPolicy::resolve(&client(None, None), 10, 45);
        assert_eq!(policy.retries, 10);
        assert_eq!(policy.interval, Duration::from_secs(45));
    }

    #[test]
    fn zero_retries_means_exactly_one_attempt() {
        let policy = RetryPolicy::resolve(&client(Some(0), None), 10, 30);
        assert_eq!(policy.total_attempts(), 1);
    }

    #[test]
    fn default_matches_spec_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.retries, 1);
        assert_eq!(policy.interval, Duration::from_secs(30));
    }

    proptest::proptest! {
        #[test]
        fn total_attempts_is_always_retries_plus_one(retries in 0u32..1000) {
            let policy = RetryPolicy::resolve(&client(Some(retries), Some(0)), 0, 0);
            proptest::prop_assert_eq!(policy.total_attempts(), retries + 1);
        }
    }
}
