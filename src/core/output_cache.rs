//! Output cache settings and the policy that consults them.
use std::sync::Arc;

use arc_swap::ArcSwap;
use http::Method;
use serde::{Deserialize, Serialize};

/// File extensions served with the static TTL.
const STATIC_EXTENSIONS: [&str; 12] = [
    "css", "js", "mjs", "png", "jpg", "jpeg", "gif", "svg", "ico", "woff", "woff2", "webp",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OutputCacheConfig {
    #[serde(alias = "default_ttl_seconds")]
    pub default_ttl_seconds: i64,
    #[serde(alias = "static_ttl_seconds")]
    pub static_ttl_seconds: i64,
}

impl Default for OutputCacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: 30,
            static_ttl_seconds: 3600,
        }
    }
}

/// Holder for the current output cache configuration.
///
/// Values are swapped as a whole; readers always see a complete config.
#[derive(Debug)]
pub struct OutputCacheRuntime {
    current: ArcSwap<OutputCacheConfig>,
}

impl OutputCacheRuntime {
    pub fn new(initial: OutputCacheConfig) -> Self {
        Self {
            current: ArcSwap::from_pointee(sanitize(initial)),
        }
    }

    pub fn get(&self) -> OutputCacheConfig {
        **self.current.load()
    }

    /// Whether applying `config` would leave the active TTLs unchanged.
    pub fn is_current(&self, config: OutputCacheConfig) -> bool {
        self.get() == sanitize(config)
    }

    /// Replace the configuration; negative TTLs are clamped to zero.
    pub fn apply(&self, config: OutputCacheConfig) -> OutputCacheConfig {
        let config = sanitize(config);
        self.current.store(Arc::new(config));
        tracing::info!(
            default_ttl_seconds = config.default_ttl_seconds,
            static_ttl_seconds = config.static_ttl_seconds,
            "Applied output cache configuration"
        );
        config
    }
}

fn sanitize(config: OutputCacheConfig) -> OutputCacheConfig {
    OutputCacheConfig {
        default_ttl_seconds: config.default_ttl_seconds.max(0),
        static_ttl_seconds: config.static_ttl_seconds.max(0),
    }
}

/// Decides whether and for how long a response may be cached.
#[derive(Debug, Clone)]
pub struct OutputCachePolicy {
    runtime: Arc<OutputCacheRuntime>,
}

impl OutputCachePolicy {
    pub fn new(runtime: Arc<OutputCacheRuntime>) -> Self {
        Self { runtime }
    }

    /// TTL in seconds for a request, or `None` when it must not be cached.
    pub fn ttl_for(&self, method: &Method, path: &str, has_authorization: bool) -> Option<u64> {
        if has_authorization || (*method != Method::GET && *method != Method::HEAD) {
            return None;
        }
        let config = self.runtime.get();
        let ttl = if is_static_asset(path) {
            config.static_ttl_seconds
        } else {
            config.default_ttl_seconds
        };
        u64::try_from(ttl).ok().filter(|ttl| *ttl > 0)
    }
}

fn is_static_asset(path: &str) -> bool {
    let file = path
        .split(['?', '#'])
        .next()
        .unwrap_or(path)
        .rsplit('/')
        .next()
        .unwrap_or_default();
    file.rsplit_once('.').is_some_and(|(_, ext)| {
        STATIC_EXTENSIONS
            .iter()
            .any(|known| ext.eq_ignore_ascii_case(known))
    })
}
