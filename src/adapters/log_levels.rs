//! In-process store of dynamic log-level overrides.
use std::collections::BTreeMap;

use scc::HashMap;
use tracing::level_filters::LevelFilter;

use crate::ports::log_levels::LogLevelSource;

/// Concurrent `category -> level` map, settable through the admin surface.
///
/// Category lookups are case-insensitive.
#[derive(Default)]
pub struct LogLevelOverrides {
    levels: HashMap<String, LevelFilter>,
}

impl LogLevelOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, category: &str, level: LevelFilter) {
        let key = category.trim().to_ascii_lowercase();
        tracing::info!(category = %key, %level, "Log level override set");
        self.levels.upsert_async(key, level).await;
    }

    /// Remove an override; returns whether one existed.
    pub async fn clear(&self, category: &str) -> bool {
        let key = category.trim().to_ascii_lowercase();
        self.levels.remove_async(&key).await.is_some()
    }

    /// All overrides, sorted by category.
    pub async fn list(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        self.levels
            .retain_async(|category, level| {
                out.insert(category.clone(), level.to_string());
                true
            })
            .await;
        out
    }
}

impl LogLevelSource for LogLevelOverrides {
    fn get(&self, category: &str) -> Option<LevelFilter> {
        self.levels
            .read_sync(category.to_ascii_lowercase().as_str(), |_, level| *level)
    }
}
