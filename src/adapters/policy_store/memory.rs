use std::collections::BTreeMap;

use async_trait::async_trait;
use eyre::Result;
use tokio::sync::RwLock;

use crate::{core::policy::PolicyEntry, ports::policy_store::PolicyStore};

/// Volatile policy store used when no file is configured, and in tests.
#[derive(Default)]
pub struct InMemoryPolicyStore {
    entries: RwLock<BTreeMap<String, PolicyEntry>>,
}

impl InMemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: impl IntoIterator<Item = PolicyEntry>) -> Self {
        Self {
            entries: RwLock::new(entries.into_iter().map(|e| (e.id.clone(), e)).collect()),
        }
    }
}

#[async_trait]
impl PolicyStore for InMemoryPolicyStore {
    async fn get_all(&self) -> Result<Vec<PolicyEntry>> {
        Ok(self.entries.read().await.values().cloned().collect())
    }

    async fn upsert(&self, entry: &PolicyEntry) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(entry.id.clone(), entry.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.entries.write().await.remove(id).is_some())
    }

    async fn replace_all(&self, entries: &[PolicyEntry]) -> Result<()> {
        let replacement = entries.iter().map(|e| (e.id.clone(), e.clone())).collect();
        *self.entries.write().await = replacement;
        Ok(())
    }
}
