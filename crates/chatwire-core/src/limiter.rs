use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct AdmissionRecord {
    count: u32,
    window_reset_at: DateTime<Utc>,
}

/// Rate gate consulted before a session is opened.
///
/// The in-memory implementation only limits within one process. Deployments
/// running several instances can plug in a shared counter behind this trait.
#[async_trait]
pub trait AdmissionLimiter: Send + Sync {
    async fn check(&self, key: &str, limit: u32, window: Duration) -> AdmissionDecision;

    /// Drop expired records. Returns how many were removed.
    fn sweep(&self) -> usize;
}

#[derive(Default)]
pub struct InMemoryAdmissionLimiter {
    records: DashMap<String, AdmissionRecord>,
}

impl InMemoryAdmissionLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tracked_keys(&self) -> usize {
        self.records.len()
    }

    /// Count one request for `key` at `now`.
    ///
    /// The record is updated under the map's shard lock, so concurrent checks
    /// for the same key never lose an increment.
    pub fn check_at(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> AdmissionDecision {
        let window = TimeDelta::from_std(window).unwrap_or(TimeDelta::MAX);
        let reset_at = now.checked_add_signed(window).unwrap_or(DateTime::<Utc>::MAX_UTC);

        let record = {
            let mut entry = self
                .records
                .entry(key.to_string())
                .or_insert(AdmissionRecord {
                    count: 0,
                    window_reset_at: reset_at,
                });
            if entry.count == 0 || now >= entry.window_reset_at {
                entry.count = 1;
                entry.window_reset_at = reset_at;
            } else {
                entry.count = entry.count.saturating_add(1);
            }
            *entry
        };

        let allowed = record.count <= limit;
        if !allowed {
            debug!(
                target: "chatwire::limiter",
                key = %key,
                count = record.count,
                limit = limit,
                "Admission denied"
            );
        }

        AdmissionDecision {
            allowed,
            limit,
            remaining: limit.saturating_sub(record.count),
            reset_at: record.window_reset_at,
        }
    }

    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| now < record.window_reset_at);
        let removed = before.saturating_sub(self.records.len());
        if removed > 0 {
            debug!(target: "chatwire::limiter", removed, "Swept expired admission records");
        }
        removed
    }
}

#[async_trait]
impl AdmissionLimiter for InMemoryAdmissionLimiter {
    async fn check(&self, key: &str, limit: u32, window: Duration) -> AdmissionDecision {
        self.check_at(key, limit, window, Utc::now())
    }

    fn sweep(&self) -> usize {
        self.sweep_at(Utc::now())
    }
}

/// Key a client is limited under: the authenticated user when known, else
/// the network address.
pub fn admission_key(user_id: Option<&str>, client_addr: Option<IpAddr>) -> String {
    match (user_id.filter(|id| !id.is_empty()), client_addr) {
        (Some(user_id), _) => format!("user:{user_id}"),
        (None, Some(addr)) => format!("ip:{addr}"),
        (None, None) => "anonymous".to_string(),
    }
}

/// Periodically sweep `limiter` until `token` is cancelled.
pub fn spawn_sweeper(
    limiter: Arc<dyn AdmissionLimiter>,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                () = token.cancelled() => break,
                _ = ticker.tick() => {
                    limiter.sweep();
                }
            }
        }
        debug!(target: "chatwire::limiter", "Admission sweeper stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const MINUTE: Duration = Duration::from_secs(60);

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + seconds, 0).unwrap()
    }

    #[test]
    fn test_eleventh_request_in_window_is_denied() {
        let limiter = InMemoryAdmissionLimiter::new();

        for n in 1..=10 {
            let decision = limiter.check_at("user:a", 10, MINUTE, at(n));
            assert!(decision.allowed, "request {n} should be admitted");
            assert_eq!(decision.remaining, 10 - n as u32);
            assert_eq!(decision.reset_at, at(61));
        }

        let denied = limiter.check_at("user:a", 10, MINUTE, at(30));
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.limit, 10);
        assert_eq!(denied.reset_at, at(61));
    }

    #[test]
    fn test_window_resets_after_expiry() {
        let limiter = InMemoryAdmissionLimiter::new();
        for n in 0..11 {
            limiter.check_at("ip:10.0.0.1", 10, MINUTE, at(n));
        }

        let decision = limiter.check_at("ip:10.0.0.1", 10, MINUTE, at(60));
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 9);
        assert_eq!(decision.reset_at, at(120));
    }

    #[test]
    fn test_keys_do_not_interfere() {
        let limiter = InMemoryAdmissionLimiter::new();
        for _ in 0..3 {
            limiter.check_at("user:a", 2, MINUTE, at(0));
        }

        let other = limiter.check_at("user:b", 2, MINUTE, at(0));
        assert!(other.allowed);
        assert_eq!(other.remaining, 1);
    }

    #[test]
    fn test_sweep_removes_only_expired_records() {
        let limiter = InMemoryAdmissionLimiter::new();
        limiter.check_at("old", 10, MINUTE, at(0));
        limiter.check_at("fresh", 10, MINUTE, at(50));

        assert_eq!(limiter.sweep_at(at(70)), 1);
        assert_eq!(limiter.tracked_keys(), 1);

        // A stale record that was never swept resets itself on access.
        let decision = limiter.check_at("fresh", 10, MINUTE, at(500));
        assert_eq!(decision.remaining, 9);
    }

    #[test]
    fn test_zero_limit_denies_everything() {
        let limiter = InMemoryAdmissionLimiter::new();
        let decision = limiter.check_at("user:a", 0, MINUTE, at(0));
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[rstest]
    #[case(Some("42"), Some("127.0.0.1"), "user:42")]
    #[case(None, Some("127.0.0.1"), "ip:127.0.0.1")]
    #[case(Some(""), Some("::1"), "ip:::1")]
    #[case(None, None, "anonymous")]
    fn test_admission_key(
        #[case] user_id: Option<&str>,
        #[case] addr: Option<&str>,
        #[case] expected: &str,
    ) {
        let addr = addr.map(|a| a.parse::<IpAddr>().unwrap());
        assert_eq!(admission_key(user_id, addr), expected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checks_admit_exactly_limit() {
        let limiter = Arc::new(InMemoryAdmissionLimiter::new());
        let mut tasks = Vec::new();
        for _ in 0..64 {
            let limiter = limiter.clone();
            tasks.push(tokio::spawn(async move {
                limiter.check("user:burst", 10, MINUTE).await.allowed
            }));
        }

        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_reclaims_expired_records() {
        let limiter = Arc::new(InMemoryAdmissionLimiter::new());
        limiter.check_at("gone", 10, MINUTE, Utc::now() - TimeDelta::minutes(5));
        limiter.check("live", 10, MINUTE).await;

        let token = CancellationToken::new();
        let sweeper = spawn_sweeper(limiter.clone(), Duration::from_secs(1), token.clone());
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(limiter.tracked_keys(), 1);
        token.cancel();
        sweeper.await.unwrap();
    }
}
