//! Partitioned rate limiting built atop `governor`.
//!
//! Each partition key (`route|tenant|vN`) owns one direct (non-keyed) governor
//! limiter sized from the limits resolved at creation time. Because the key
//! embeds the configuration version, an `apply` on the rate limit runtime makes
//! every existing partition unreachable; the next request creates a fresh one
//! with the new limits. Partitions from older versions are pruned lazily the
//! first time a newer version is observed.
//!
//! Partition keys carry client-chosen tenant names, so the registry is also
//! swept periodically: a partition untouched for a full window has a full
//! bucket again and is dropped unless requests are still waiting on it.
use std::{
    num::NonZeroU32,
    sync::{
        Arc,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use governor::{
    Quota, RateLimiter,
    clock::{Clock, DefaultClock},
    state::{InMemoryState, NotKeyed},
};
use scc::HashMap;
use serde::Serialize;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::core::rate_limit::runtime::ResolvedLimits;

pub type DirectRateLimiterImpl = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Tenant label used in partition keys when no tenant was resolved.
pub const ANONYMOUS_TENANT: &str = "anonymous";

/// Outcome of a partition admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "outcome")]
pub enum RateLimitDecision {
    Permitted {
        partition_key: String,
        queued: bool,
    },
    Rejected {
        partition_key: String,
        #[serde(serialize_with = "serialize_retry_after")]
        retry_after: Duration,
    },
}

impl RateLimitDecision {
    pub fn is_permitted(&self) -> bool {
        matches!(self, RateLimitDecision::Permitted { .. })
    }

    pub fn partition_key(&self) -> &str {
        match self {
            RateLimitDecision::Permitted { partition_key, .. }
            | RateLimitDecision::Rejected { partition_key, .. } => partition_key,
        }
    }
}

fn serialize_retry_after<S: serde::Serializer>(
    value: &Duration,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(value.as_secs().max(1))
}

/// One partition's limiter plus its bounded wait queue.
pub struct PartitionLimiter {
    /// `None` when the permit limit is zero: every request is rejected.
    limiter: Option<DirectRateLimiterImpl>,
    queue_limit: u32,
    queued: AtomicU32,
    window: Duration,
    version: u64,
    created: Instant,
    /// Nanoseconds after `created` of the latest acquire.
    last_used: AtomicU64,
}

impl PartitionLimiter {
    pub fn new(limits: ResolvedLimits) -> Self {
        let window = Duration::from_secs(u64::from(limits.window_seconds.max(1)));
        let limiter = NonZeroU32::new(limits.permit_limit).and_then(|permits| {
            let period = (window / permits.get()).max(Duration::from_nanos(1));
            Quota::with_period(period)
                .map(|quota| RateLimiter::direct(quota.allow_burst(permits)))
        });
        Self {
            limiter,
            queue_limit: limits.queue_limit,
            queued: AtomicU32::new(0),
            window,
            version: limits.version,
            created: Instant::now(),
            last_used: AtomicU64::new(0),
        }
    }

    /// Try to take a permit, waiting in the partition queue when allowed.
    pub async fn acquire(&self) -> Result<bool, Duration> {
        self.touch();
        let Some(limiter) = &self.limiter else {
            return Err(self.window);
        };

        let retry_after = match limiter.check() {
            Ok(()) => return Ok(false),
            Err(not_until) => not_until.wait_time_from(DefaultClock::default().now()),
        };

        let Some(_slot) = QueueSlot::reserve(&self.queued, self.queue_limit) else {
            return Err(retry_after);
        };
        match tokio::time::timeout(self.window, limiter.until_ready()).await {
            Ok(()) => Ok(true),
            Err(_) => Err(retry_after),
        }
    }

    pub fn queued(&self) -> u32 {
        self.queued.load(Ordering::Acquire)
    }

    fn touch(&self) {
        let elapsed = u64::try_from(self.created.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.last_used.fetch_max(elapsed, Ordering::AcqRel);
    }

    /// No waiters and no acquire within the last window as of `now`.
    fn is_idle(&self, now: Instant) -> bool {
        let last_used = self.created + Duration::from_nanos(self.last_used.load(Ordering::Acquire));
        self.queued() == 0 && now.saturating_duration_since(last_used) >= self.window
    }
}

/// Queue occupancy released on drop, including when the waiting future is cancelled.
struct QueueSlot<'a>(&'a AtomicU32);

impl<'a> QueueSlot<'a> {
    fn reserve(counter: &'a AtomicU32, limit: u32) -> Option<Self> {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |queued| {
                (queued < limit).then_some(queued + 1)
            })
            .ok()
            .map(|_| QueueSlot(counter))
    }
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Concurrent registry of partition limiters.
#[derive(Default)]
pub struct PartitionedRateLimiter {
    partitions: HashMap<String, Arc<PartitionLimiter>>,
    newest_version: AtomicU64,
}

impl PartitionedRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bucket key for a route/tenant pair under a configuration version.
    pub fn partition_key(route_base: &str, tenant: Option<&str>, version: u64) -> String {
        format!(
            "{route_base}|{}|v{version}",
            tenant.unwrap_or(ANONYMOUS_TENANT)
        )
    }

    /// Admit or reject one request against the partition for `key`.
    pub async fn acquire(&self, key: &str, limits: ResolvedLimits) -> RateLimitDecision {
        self.prune_if_newer(limits.version).await;

        let partition = self.partition(key, limits).await;
        match partition.acquire().await {
            Ok(queued) => RateLimitDecision::Permitted {
                partition_key: key.to_string(),
                queued,
            },
            Err(retry_after) => RateLimitDecision::Rejected {
                partition_key: key.to_string(),
                retry_after,
            },
        }
    }

    async fn partition(&self, key: &str, limits: ResolvedLimits) -> Arc<PartitionLimiter> {
        if let Some(existing) = self.partitions.read_async(key, |_, p| p.clone()).await {
            return existing;
        }
        let fresh = Arc::new(PartitionLimiter::new(limits));
        match self.partitions.insert_async(key.to_string(), fresh.clone()).await {
            Ok(()) => fresh,
            // Lost the race against a concurrent request for the same partition.
            Err(_) => self
                .partitions
                .read_async(key, |_, p| p.clone())
                .await
                .unwrap_or(fresh),
        }
    }

    async fn prune_if_newer(&self, version: u64) {
        let previous = self.newest_version.fetch_max(version, Ordering::AcqRel);
        if version <= previous {
            return;
        }
        self.partitions
            .retain_async(|_, partition| partition.version >= version)
            .await;
        tracing::debug!(
            version,
            remaining = self.partitions.len(),
            "Pruned rate limit partitions from older configuration versions"
        );
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Drop idle partitions. Returns how many were removed.
    pub async fn evict_idle(&self) -> usize {
        self.evict_idle_at(Instant::now()).await
    }

    pub(crate) async fn evict_idle_at(&self, now: Instant) -> usize {
        let before = self.partitions.len();
        self.partitions
            .retain_async(|_, partition| !partition.is_idle(now))
            .await;
        let evicted = before.saturating_sub(self.partitions.len());
        if evicted > 0 {
            tracing::debug!(
                evicted,
                remaining = self.partitions.len(),
                "Evicted idle rate limit partitions"
            );
        }
        evicted
    }

    /// Sweep idle partitions every `interval` until `shutdown` is cancelled.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                self.evict_idle().await;
            }
            tracing::info!("Rate limit partition sweeper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(permit_limit: u32, queue_limit: u32, version: u64) -> ResolvedLimits {
        ResolvedLimits {
            permit_limit,
            queue_limit,
            window_seconds: 60,
            version,
        }
    }

    #[test]
    fn test_partition_key_format() {
        assert_eq!(
            PartitionedRateLimiter::partition_key("storage", Some("acme"), 3),
            "storage|acme|v3"
        );
        assert_eq!(
            PartitionedRateLimiter::partition_key("root", None, 1),
            "root|anonymous|v1"
        );
    }

    #[tokio::test]
    async fn test_permits_up_to_limit_then_rejects() {
        let limiter = PartitionedRateLimiter::new();
        let key = "storage|acme|v1";
        for _ in 0..3 {
            assert!(limiter.acquire(key, limits(3, 0, 1)).await.is_permitted());
        }
        let decision = limiter.acquire(key, limits(3, 0, 1)).await;
        assert!(matches!(decision, RateLimitDecision::Rejected { .. }));
        assert_eq!(decision.partition_key(), key);
    }

    #[tokio::test]
    async fn test_zero_permit_limit_rejects_everything() {
        let limiter = PartitionedRateLimiter::new();
        let decision = limiter.acquire("identity|acme|v1", limits(0, 10, 1)).await;
        assert!(!decision.is_permitted());
    }

    #[tokio::test]
    async fn test_partitions_are_independent() {
        let limiter = PartitionedRateLimiter::new();
        assert!(limiter.acquire("storage|acme|v1", limits(1, 0, 1)).await.is_permitted());
        assert!(limiter.acquire("storage|globex|v1", limits(1, 0, 1)).await.is_permitted());
        assert!(!limiter.acquire("storage|acme|v1", limits(1, 0, 1)).await.is_permitted());
    }

    #[tokio::test]
    async fn test_newer_version_recreates_and_prunes_partitions() {
        let limiter = PartitionedRateLimiter::new();
        assert!(limiter.acquire("storage|acme|v1", limits(1, 0, 1)).await.is_permitted());
        assert!(!limiter.acquire("storage|acme|v1", limits(1, 0, 1)).await.is_permitted());

        assert!(limiter.acquire("storage|acme|v2", limits(1, 0, 2)).await.is_permitted());
        assert_eq!(limiter.partition_count(), 1);
    }

    #[tokio::test]
    async fn test_idle_partitions_are_evicted() {
        let limiter = PartitionedRateLimiter::new();
        for i in 0..5000 {
            let key = PartitionedRateLimiter::partition_key("storage", Some(&format!("x{i}")), 1);
            assert!(limiter.acquire(&key, limits(10, 0, 1)).await.is_permitted());
        }
        assert_eq!(limiter.partition_count(), 5000);

        // Still inside the window: nothing is idle yet.
        assert_eq!(limiter.evict_idle().await, 0);
        assert_eq!(limiter.partition_count(), 5000);

        let later = Instant::now() + Duration::from_secs(61);
        assert_eq!(limiter.evict_idle_at(later).await, 5000);
        assert_eq!(limiter.partition_count(), 0);
    }

    #[tokio::test]
    async fn test_partition_with_waiters_survives_sweep() {
        let limiter = Arc::new(PartitionedRateLimiter::new());
        let key = "storage|acme|v1";
        assert!(limiter.acquire(key, limits(1, 1, 1)).await.is_permitted());

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire(key, limits(1, 1, 1)).await })
        };
        loop {
            let queued = limiter
                .partitions
                .read_async(key, |_, p| p.queued())
                .await
                .unwrap();
            if queued == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }

        let later = Instant::now() + Duration::from_secs(120);
        assert_eq!(limiter.evict_idle_at(later).await, 0);
        assert_eq!(limiter.partition_count(), 1);
        waiter.abort();
    }

    #[tokio::test]
    async fn test_queued_request_waits_for_capacity() {
        let partition = PartitionLimiter::new(ResolvedLimits {
            permit_limit: 2,
            queue_limit: 1,
            window_seconds: 1,
            version: 1,
        });
        assert_eq!(partition.acquire().await, Ok(false));
        assert_eq!(partition.acquire().await, Ok(false));
        // The third request queues until the limiter replenishes one permit.
        assert_eq!(partition.acquire().await, Ok(true));
        assert_eq!(partition.queued(), 0);
    }

    #[tokio::test]
    async fn test_full_queue_rejects_immediately() {
        let partition = PartitionLimiter::new(limits(1, 0, 1));
        assert_eq!(partition.acquire().await, Ok(false));
        assert!(partition.acquire().await.is_err());
    }
}
