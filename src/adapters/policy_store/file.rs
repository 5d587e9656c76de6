use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use eyre::{Context, Result};
use tokio::sync::Mutex;

use crate::{core::policy::PolicyEntry, ports::policy_store::PolicyStore};

/// Policy store persisted as a JSON array in a single file.
///
/// Every write rewrites the whole file through a temporary sibling and a
/// rename, so readers of the file never see a partial document. Writes are
/// serialized by an async mutex.
pub struct JsonFilePolicyStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFilePolicyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<BTreeMap<String, PolicyEntry>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => {
                return Err(e).wrap_err_with(|| {
                    format!("Failed to read policy file {}", self.path.display())
                });
            }
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(BTreeMap::new());
        }
        let entries: Vec<PolicyEntry> = serde_json::from_slice(&bytes)
            .wrap_err_with(|| format!("Failed to parse policy file {}", self.path.display()))?;
        Ok(entries.into_iter().map(|e| (e.id.clone(), e)).collect())
    }

    async fn write(&self, entries: &BTreeMap<String, PolicyEntry>) -> Result<()> {
        let list: Vec<&PolicyEntry> = entries.values().collect();
        let json = serde_json::to_vec_pretty(&list).wrap_err("Failed to serialize policies")?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .wrap_err_with(|| format!("Failed to create {}", parent.display()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json)
            .await
            .wrap_err_with(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .wrap_err_with(|| format!("Failed to replace {}", self.path.display()))?;
        tracing::debug!(path = %self.path.display(), count = list.len(), "Persisted policies");
        Ok(())
    }
}

#[async_trait]
impl PolicyStore for JsonFilePolicyStore {
    async fn get_all(&self) -> Result<Vec<PolicyEntry>> {
        let _guard = self.lock.lock().await;
        Ok(self.read().await?.into_values().collect())
    }

    async fn upsert(&self, entry: &PolicyEntry) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut entries = self.read().await?;
        entries.insert(entry.id.clone(), entry.clone());
        self.write(&entries).await
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let mut entries = self.read().await?;
        if entries.remove(id).is_none() {
            return Ok(false);
        }
        self.write(&entries).await?;
        Ok(true)
    }

    async fn replace_all(&self, entries: &[PolicyEntry]) -> Result<()> {
        let _guard = self.lock.lock().await;
        let replacement = entries.iter().map(|e| (e.id.clone(), e.clone())).collect();
        self.write(&replacement).await
    }
}
