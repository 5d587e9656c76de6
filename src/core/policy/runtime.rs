//! Write-through policy cache.
//!
//! Mutations go to the store first and touch the cache only after the store
//! call succeeded, so a failed write leaves both sides as they were. Reads
//! never reach the store.
use std::{net::IpAddr, sync::Arc};

use chrono::Utc;
use scc::HashMap;
use thiserror::Error;

use crate::{
    core::policy::{
        evaluate::{IpVerdict, evaluate_ip},
        ip::IpNetwork,
        model::{PolicyConfig, PolicyEntry, PolicyMode, PolicyType},
    },
    ports::policy_store::PolicyStore,
};

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("invalid policy '{id}': {reason}")]
    Invalid { id: String, reason: String },

    #[error("policy store failure: {0}")]
    Store(eyre::Report),
}

impl PolicyError {
    fn invalid(id: &str, reason: impl Into<String>) -> Self {
        PolicyError::Invalid {
            id: id.to_string(),
            reason: reason.into(),
        }
    }
}

pub struct PolicyRuntime {
    store: Arc<dyn PolicyStore>,
    cache: HashMap<String, PolicyEntry>,
}

impl PolicyRuntime {
    pub fn new(store: Arc<dyn PolicyStore>) -> Self {
        Self {
            store,
            cache: HashMap::new(),
        }
    }

    /// All cached policies, ordered by id.
    pub async fn get_all(&self) -> Vec<PolicyEntry> {
        let mut out = Vec::with_capacity(self.cache.len());
        self.cache
            .retain_async(|_, entry| {
                out.push(entry.clone());
                true
            })
            .await;
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub async fn get_by_id(&self, id: &str) -> Option<PolicyEntry> {
        self.cache.read_async(id, |_, entry| entry.clone()).await
    }

    pub async fn get_by_type(&self, policy_type: PolicyType) -> Vec<PolicyEntry> {
        let mut all = self.get_all().await;
        all.retain(|entry| entry.policy_type == policy_type);
        all
    }

    /// Validate, persist and cache `entry`.
    ///
    /// `updated_at` is stamped with the current time; an existing entry keeps
    /// its original `created_at`.
    pub async fn upsert(&self, mut entry: PolicyEntry) -> Result<PolicyEntry, PolicyError> {
        entry.id = entry.id.trim().to_string();
        validate(&entry)?;

        if let Some(created_at) = self.cache.read_async(&entry.id, |_, e| e.created_at).await {
            entry.created_at = created_at;
        }
        entry.updated_at = Utc::now().max(entry.created_at);

        self.store.upsert(&entry).await.map_err(PolicyError::Store)?;
        self.cache.upsert_sync(entry.id.clone(), entry.clone());

        tracing::info!(
            policy_id = %entry.id,
            policy_type = %entry.policy_type,
            mode = ?entry.mode,
            enabled = entry.enabled,
            "Upserted policy"
        );
        Ok(entry)
    }

    /// Delete from store then cache. Returns whether the store held the id.
    pub async fn delete(&self, id: &str) -> Result<bool, PolicyError> {
        let id = id.trim();
        let existed = self.store.delete(id).await.map_err(PolicyError::Store)?;
        if existed {
            self.cache.remove_sync(id);
            tracing::info!(policy_id = %id, "Deleted policy");
        }
        Ok(existed)
    }

    /// Replace every policy. The whole set is validated before anything is
    /// written.
    pub async fn replace_all(&self, entries: Vec<PolicyEntry>) -> Result<usize, PolicyError> {
        let now = Utc::now();
        let mut entries = entries;
        let mut seen = std::collections::HashSet::new();
        for entry in &mut entries {
            entry.id = entry.id.trim().to_string();
            validate(entry)?;
            if !seen.insert(entry.id.clone()) {
                return Err(PolicyError::invalid(&entry.id, "duplicate id in replacement set"));
            }
            entry.updated_at = now.max(entry.created_at);
        }

        self.store
            .replace_all(&entries)
            .await
            .map_err(PolicyError::Store)?;
        let count = entries.len();
        self.repopulate(entries);
        tracing::info!(count, "Replaced all policies");
        Ok(count)
    }

    /// Fill the cache from the store, discarding what it held.
    pub async fn load_from_store(&self) -> Result<usize, PolicyError> {
        let entries = self.store.get_all().await.map_err(PolicyError::Store)?;
        let count = entries.len();
        self.repopulate(entries);
        tracing::info!(count, "Loaded policies from store");
        Ok(count)
    }

    fn repopulate(&self, entries: Vec<PolicyEntry>) {
        self.cache.retain_sync(|_, _| false);
        for entry in entries {
            self.cache.upsert_sync(entry.id.clone(), entry);
        }
    }

    /// Evaluate the cached IP policies for a client address.
    pub async fn evaluate_ip(&self, ip: IpAddr) -> IpVerdict {
        let mut policies = self.get_by_type(PolicyType::IpDeny).await;
        policies.extend(self.get_by_type(PolicyType::IpAllow).await);
        let verdict = evaluate_ip(&policies, ip);

        match verdict.mode() {
            Some(PolicyMode::Shadow) => {
                tracing::debug!(%ip, violations = ?verdict.violations, "Shadow IP policy match");
            }
            Some(PolicyMode::AuditOnly) => {
                tracing::warn!(%ip, violations = ?verdict.violations, "Audit-only IP policy match");
            }
            Some(PolicyMode::Enforce) => {
                tracing::info!(%ip, violations = ?verdict.violations, "Blocked by IP policy");
            }
            None => {}
        }
        verdict
    }
}

fn validate(entry: &PolicyEntry) -> Result<(), PolicyError> {
    if entry.id.is_empty() {
        return Err(PolicyError::invalid("", "id must not be empty"));
    }
    if !entry.config.fits(entry.policy_type) {
        return Err(PolicyError::invalid(
            &entry.id,
            format!("config does not match policy type {}", entry.policy_type),
        ));
    }
    match &entry.config {
        PolicyConfig::Cors(cors) if cors.allowed_origins.iter().all(|o| o.trim().is_empty()) => {
            Err(PolicyError::invalid(&entry.id, "CORS policy needs at least one origin"))
        }
        PolicyConfig::Ip(ip) => ip.cidrs.iter().try_for_each(|cidr| {
            IpNetwork::parse(cidr)
                .map(|_| ())
                .map_err(|e| PolicyError::invalid(&entry.id, e.to_string()))
        }),
        PolicyConfig::RateLimit(limits) if limits.window_seconds < 1 => Err(PolicyError::invalid(
            &entry.id,
            "rate limit window must be at least one second",
        )),
        PolicyConfig::RateLimit(limits) if limits.permit_limit < 0 || limits.queue_limit < 0 => {
            Err(PolicyError::invalid(&entry.id, "rate limits must not be negative"))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::{
        adapters::policy_store::InMemoryPolicyStore,
        core::policy::model::{CorsConfig, IpConfig, RateLimitPolicyConfig},
    };

    /// Store that fails every call once `failing` is set.
    #[derive(Default)]
    struct FlakyStore {
        inner: InMemoryPolicyStore,
        failing: AtomicBool,
    }

    impl FlakyStore {
        fn check(&self) -> eyre::Result<()> {
            if self.failing.load(Ordering::Acquire) {
                eyre::bail!("database unavailable");
            }
            Ok(())
        }
    }

    #[async_trait]
    impl PolicyStore for FlakyStore {
        async fn get_all(&self) -> eyre::Result<Vec<PolicyEntry>> {
            self.check()?;
            self.inner.get_all().await
        }

        async fn upsert(&self, entry: &PolicyEntry) -> eyre::Result<()> {
            self.check()?;
            self.inner.upsert(entry).await
        }

        async fn delete(&self, id: &str) -> eyre::Result<bool> {
            self.check()?;
            self.inner.delete(id).await
        }

        async fn replace_all(&self, entries: &[PolicyEntry]) -> eyre::Result<()> {
            self.check()?;
            self.inner.replace_all(entries).await
        }
    }

    fn deny(id: &str, cidrs: &[&str]) -> PolicyEntry {
        PolicyEntry::new(
            id,
            PolicyType::IpDeny,
            PolicyConfig::Ip(IpConfig {
                cidrs: cidrs.iter().map(|c| c.to_string()).collect(),
            }),
        )
    }

    fn cors(id: &str, origins: &[&str]) -> PolicyEntry {
        PolicyEntry::new(
            id,
            PolicyType::Cors,
            PolicyConfig::Cors(CorsConfig {
                allowed_origins: origins.iter().map(|o| o.to_string()).collect(),
                ..Default::default()
            }),
        )
    }

    #[tokio::test]
    async fn test_upsert_then_get_returns_advanced_entry() {
        let runtime = PolicyRuntime::new(Arc::new(InMemoryPolicyStore::new()));
        let mut entry = deny("scanners", &["203.0.113.0/24"]);
        entry.updated_at = entry.created_at - chrono::Duration::hours(1);
        let submitted_at = entry.updated_at;

        let stored = runtime.upsert(entry).await.unwrap();
        assert!(stored.updated_at > submitted_at);
        assert_eq!(runtime.get_by_id("scanners").await, Some(stored.clone()));

        let again = runtime.upsert(stored.clone().with_description("updated")).await.unwrap();
        assert_eq!(again.created_at, stored.created_at);
        assert!(again.updated_at >= stored.updated_at);
    }

    #[tokio::test]
    async fn test_delete_missing_returns_false() {
        let runtime = PolicyRuntime::new(Arc::new(InMemoryPolicyStore::new()));
        runtime.upsert(deny("a", &["10.0.0.1"])).await.unwrap();

        assert!(!runtime.delete("missing").await.unwrap());
        assert_eq!(runtime.get_all().await.len(), 1);
        assert!(runtime.delete("a").await.unwrap());
        assert!(runtime.get_all().await.is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_leaves_cache_untouched() {
        let store = Arc::new(FlakyStore::default());
        let runtime = PolicyRuntime::new(store.clone());
        let original = runtime.upsert(deny("a", &["10.0.0.1"])).await.unwrap();

        store.failing.store(true, Ordering::Release);
        let err = runtime
            .upsert(deny("a", &["10.0.0.2"]))
            .await
            .unwrap_err();
        assert!(matches!(err, PolicyError::Store(_)));
        assert!(runtime.upsert(deny("b", &["10.0.0.3"])).await.is_err());
        assert!(runtime.delete("a").await.is_err());
        assert!(runtime.replace_all(vec![]).await.is_err());

        assert_eq!(runtime.get_all().await, vec![original]);
    }

    #[tokio::test]
    async fn test_replace_all_and_reload() {
        let store = Arc::new(InMemoryPolicyStore::new());
        let runtime = PolicyRuntime::new(store.clone());
        runtime.upsert(deny("old", &["10.0.0.1"])).await.unwrap();

        let count = runtime
            .replace_all(vec![cors("web", &["https://app.example.com"]), deny("new", &["10.0.0.0/8"])])
            .await
            .unwrap();
        assert_eq!(count, 2);
        assert!(runtime.get_by_id("old").await.is_none());
        assert_eq!(runtime.get_by_type(PolicyType::Cors).await.len(), 1);

        let fresh = PolicyRuntime::new(store);
        assert_eq!(fresh.load_from_store().await.unwrap(), 2);
        assert_eq!(fresh.get_all().await, runtime.get_all().await);
    }

    #[tokio::test]
    async fn test_validation_rejects_bad_entries() {
        let runtime = PolicyRuntime::new(Arc::new(InMemoryPolicyStore::new()));

        let cases = vec![
            deny("  ", &["10.0.0.1"]),
            deny("bad-cidr", &["10.0.0.0/40"]),
            cors("no-origins", &[]),
            PolicyEntry::new(
                "window",
                PolicyType::RateLimitPolicy,
                PolicyConfig::RateLimit(RateLimitPolicyConfig {
                    permit_limit: 5,
                    window_seconds: 0,
                    queue_limit: 0,
                }),
            ),
            PolicyEntry::new("mismatch", PolicyType::Cors, PolicyConfig::Ip(IpConfig::default())),
        ];
        for entry in cases {
            assert!(matches!(
                runtime.upsert(entry).await,
                Err(PolicyError::Invalid { .. })
            ));
        }
        assert!(runtime.get_all().await.is_empty());

        let duplicate = runtime
            .replace_all(vec![deny("x", &["10.0.0.1"]), deny("x", &["10.0.0.2"])])
            .await;
        assert!(matches!(duplicate, Err(PolicyError::Invalid { .. })));
    }

    #[tokio::test]
    async fn test_evaluate_ip_uses_cache() {
        let runtime = PolicyRuntime::new(Arc::new(InMemoryPolicyStore::new()));
        runtime.upsert(deny("block", &["198.51.100.0/24"])).await.unwrap();

        assert!(runtime.evaluate_ip("198.51.100.7".parse().unwrap()).await.is_blocked());
        assert!(!runtime.evaluate_ip("192.0.2.1".parse().unwrap()).await.is_blocked());
    }
}
