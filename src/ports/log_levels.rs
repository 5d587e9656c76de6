use tracing::level_filters::LevelFilter;

/// Source of runtime log-level overrides keyed by category name.
///
/// Categories are free-form strings (module paths, component aliases or `*`);
/// callers query them in their own fallback order.
pub trait LogLevelSource: Send + Sync {
    /// The override for `category`, if one is set.
    fn get(&self, category: &str) -> Option<LevelFilter>;
}
