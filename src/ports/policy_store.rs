use async_trait::async_trait;
use eyre::Result;

use crate::core::policy::PolicyEntry;

/// Durable storage for policy entries, keyed by policy id.
///
/// Only the policy runtime writes through this port; reads on the request
/// path are served from the runtime's cache.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn get_all(&self) -> Result<Vec<PolicyEntry>>;

    /// Insert or replace the entry with the same id.
    async fn upsert(&self, entry: &PolicyEntry) -> Result<()>;

    /// Remove an entry; returns whether it existed.
    async fn delete(&self, id: &str) -> Result<bool>;

    /// Replace the entire stored set in one step.
    async fn replace_all(&self, entries: &[PolicyEntry]) -> Result<()>;
}
