//! Windowed aggregation of rate limit rejections.
//!
//! Rejections are counted per `(route base, tenant)` between flushes. Each
//! flush drains the counters, publishes a summary with the top partitions and
//! logs one line, so memory is bounded by the partitions seen in a single
//! window. Per-rejection debug lines are opt-in through a log-level override.
use std::{sync::Arc, time::Duration};

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use scc::HashMap;
use serde::Serialize;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;

use crate::{core::rate_limit::limiter::ANONYMOUS_TENANT, ports::log_levels::LogLevelSource};

/// Log category of this component, first in the override fallback chain.
pub const REJECTION_LOG_CATEGORY: &str = module_path!();

/// Remaining override categories, consulted in order after the exact one.
pub const REJECTION_LOG_FALLBACKS: [&str; 4] = ["tenant_gateway", "governor", "RateLimits", "*"];

const TOP_PARTITIONS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionCount {
    /// `"{routeBase}|{tenant}"`
    pub partition: String,
    pub count: u64,
}

/// Summary published by the most recent non-empty flush.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionSnapshot {
    pub window_seconds: u64,
    pub total: u64,
    pub emitted_at: DateTime<Utc>,
    pub top_partitions: Vec<PartitionCount>,
}

pub struct RateLimitRejectionAggregator {
    counts: HashMap<(String, String), u64>,
    last_snapshot: ArcSwapOption<RejectionSnapshot>,
    log_levels: Arc<dyn LogLevelSource>,
    window: Duration,
}

impl RateLimitRejectionAggregator {
    pub fn new(window: Duration, log_levels: Arc<dyn LogLevelSource>) -> Self {
        Self {
            counts: HashMap::new(),
            last_snapshot: ArcSwapOption::empty(),
            log_levels,
            window: window.max(Duration::from_secs(1)),
        }
    }

    /// Record one rejected request.
    pub async fn report(&self, route_base: &str, tenant: Option<&str>, partition_key: &str) {
        let tenant = tenant.unwrap_or(ANONYMOUS_TENANT);
        self.counts
            .entry_async((route_base.to_string(), tenant.to_string()))
            .await
            .and_modify(|count| *count += 1)
            .or_insert(1);

        if self.verbose_enabled() {
            tracing::debug!(
                route_base,
                tenant,
                partition_key,
                "Rate limit rejected request"
            );
        }
    }

    /// Whether a Debug-or-more-verbose override applies to this component.
    fn verbose_enabled(&self) -> bool {
        std::iter::once(REJECTION_LOG_CATEGORY)
            .chain(REJECTION_LOG_FALLBACKS)
            .find_map(|category| self.log_levels.get(category))
            .is_some_and(|level| level >= LevelFilter::DEBUG)
    }

    /// Drain the current window and publish its summary.
    ///
    /// Returns `None` without touching the last snapshot when nothing was
    /// rejected since the previous flush.
    pub async fn flush(&self) -> Option<Arc<RejectionSnapshot>> {
        if self.counts.is_empty() {
            return None;
        }

        let mut drained = Vec::new();
        self.counts
            .retain_async(|(route_base, tenant), count| {
                drained.push(PartitionCount {
                    partition: format!("{route_base}|{tenant}"),
                    count: *count,
                });
                false
            })
            .await;
        // Rejections reported while draining land in the next window.
        let total: u64 = drained.iter().map(|p| p.count).sum();
        if total == 0 {
            return None;
        }

        drained.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| a.partition.cmp(&b.partition))
        });
        drained.truncate(TOP_PARTITIONS);

        let snapshot = Arc::new(RejectionSnapshot {
            window_seconds: self.window.as_secs(),
            total,
            emitted_at: Utc::now(),
            top_partitions: drained,
        });
        self.last_snapshot.store(Some(snapshot.clone()));

        let top = snapshot
            .top_partitions
            .iter()
            .map(|p| format!("{}={}", p.partition, p.count))
            .collect::<Vec<_>>()
            .join(", ");
        tracing::info!(
            total,
            window_seconds = snapshot.window_seconds,
            top = %top,
            "Rate limit rejections in last window"
        );
        Some(snapshot)
    }

    pub fn last_snapshot(&self) -> Option<RejectionSnapshot> {
        self.last_snapshot.load_full().map(|s| (*s).clone())
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Run the flush loop until `shutdown` is cancelled.
    ///
    /// Each flush runs in its own task and is awaited before the next tick, so
    /// flushes never overlap and a panicking flush does not stop the loop.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.window);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let aggregator = self.clone();
                if let Err(e) = tokio::spawn(async move { aggregator.flush().await }).await {
                    tracing::warn!(error = %e, "Rate limit rejection flush failed");
                }
            }

            // Publish whatever accumulated in the final partial window.
            self.flush().await;
            tracing::info!("Rate limit rejection aggregator stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::log_levels::LogLevelOverrides;

    fn aggregator() -> RateLimitRejectionAggregator {
        RateLimitRejectionAggregator::new(
            Duration::from_secs(10),
            Arc::new(LogLevelOverrides::new()),
        )
    }

    #[tokio::test]
    async fn test_flush_reports_total_and_partition() {
        let agg = aggregator();
        for _ in 0..5 {
            agg.report("storage", Some("acme"), "storage|acme|v1").await;
        }

        let snapshot = agg.flush().await.expect("non-empty window");
        assert_eq!(snapshot.total, 5);
        assert_eq!(snapshot.window_seconds, 10);
        assert_eq!(
            snapshot.top_partitions,
            vec![PartitionCount {
                partition: "storage|acme".to_string(),
                count: 5,
            }]
        );
    }

    #[tokio::test]
    async fn test_empty_flush_keeps_last_snapshot() {
        let agg = aggregator();
        assert!(agg.flush().await.is_none());
        assert!(agg.last_snapshot().is_none());

        agg.report("identity", None, "identity|anonymous|v1").await;
        agg.flush().await;
        let first = agg.last_snapshot().expect("snapshot published");

        assert!(agg.flush().await.is_none());
        assert_eq!(agg.last_snapshot(), Some(first));
    }

    #[tokio::test]
    async fn test_top_three_with_deterministic_ties() {
        let agg = aggregator();
        let reports = [
            ("storage", "acme", 4),
            ("storage", "globex", 2),
            ("identity", "acme", 2),
            ("database", "initech", 1),
            ("dashboard", "acme", 7),
        ];
        for (route, tenant, n) in reports {
            for _ in 0..n {
                agg.report(route, Some(tenant), "key").await;
            }
        }

        let snapshot = agg.flush().await.unwrap();
        assert_eq!(snapshot.total, 16);
        let top: Vec<_> = snapshot
            .top_partitions
            .iter()
            .map(|p| (p.partition.as_str(), p.count))
            .collect();
        assert_eq!(
            top,
            vec![
                ("dashboard|acme", 7),
                ("storage|acme", 4),
                ("identity|acme", 2),
            ]
        );
    }

    #[tokio::test]
    async fn test_counters_reset_between_windows() {
        let agg = aggregator();
        agg.report("storage", Some("acme"), "k").await;
        agg.flush().await;
        agg.report("storage", Some("acme"), "k").await;
        agg.report("storage", Some("acme"), "k").await;

        let snapshot = agg.flush().await.unwrap();
        assert_eq!(snapshot.total, 2);
        assert_eq!(snapshot.top_partitions[0].count, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_flush_totals_match_counts_under_concurrent_reports() {
        let agg = Arc::new(aggregator());
        let reporters: Vec<_> = (0..4)
            .map(|n| {
                let agg = agg.clone();
                tokio::spawn(async move {
                    let tenant = format!("tenant{n}");
                    for _ in 0..500 {
                        agg.report("storage", Some(&tenant), "k").await;
                    }
                })
            })
            .collect();

        let mut flushed = 0;
        for _ in 0..20 {
            if let Some(snapshot) = agg.flush().await {
                assert!(snapshot.total >= snapshot.top_partitions.iter().map(|p| p.count).sum::<u64>());
                flushed += snapshot.total;
            }
            tokio::task::yield_now().await;
        }
        for reporter in reporters {
            reporter.await.unwrap();
        }
        if let Some(snapshot) = agg.flush().await {
            flushed += snapshot.total;
        }
        assert_eq!(flushed, 2000);
    }

    #[tokio::test]
    async fn test_verbose_logging_fallback_chain() {
        let overrides = Arc::new(LogLevelOverrides::new());
        let agg = RateLimitRejectionAggregator::new(Duration::from_secs(5), overrides.clone());
        assert!(!agg.verbose_enabled());

        overrides.set("*", LevelFilter::TRACE).await;
        assert!(agg.verbose_enabled());

        // A more specific category shadows the wildcard.
        overrides.set("RateLimits", LevelFilter::INFO).await;
        assert!(!agg.verbose_enabled());

        overrides.set(REJECTION_LOG_CATEGORY, LevelFilter::DEBUG).await;
        assert!(agg.verbose_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_loop_flushes_each_window() {
        let agg = Arc::new(aggregator());
        let shutdown = CancellationToken::new();
        let handle = agg.clone().spawn(shutdown.clone());

        agg.report("storage", Some("acme"), "k").await;
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(agg.last_snapshot().map(|s| s.total), Some(1));

        shutdown.cancel();
        handle.await.unwrap();
    }
}
