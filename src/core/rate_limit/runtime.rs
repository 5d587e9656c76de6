//! Versioned, hot-swappable rate limit configuration.
//!
//! A single mutex guards the window, defaults, per-route overrides and the
//! version counter. Readers copy out what they need and release the lock
//! immediately; `apply` copies the sanitized payload in and bumps the version.
//! Limiter partitions embed the version in their key, so a bump is enough to
//! make every existing partition stale without enumerating them.
use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use serde::{Deserialize, Serialize};

/// Default permit/queue limits applied to routes without an override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitDefaults {
    #[serde(alias = "permit_limit")]
    pub permit_limit: i64,
    #[serde(alias = "queue_limit")]
    pub queue_limit: i64,
}

/// Per-route override; unset fields fall back to the defaults individually.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitRouteOverride {
    #[serde(default, alias = "permit_limit")]
    pub permit_limit: Option<i64>,
    #[serde(default, alias = "queue_limit")]
    pub queue_limit: Option<i64>,
}

/// Wire/config shape of the whole rate limit configuration.
///
/// Field names are camelCase on the admin surface; snake_case aliases are
/// accepted for configuration files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitConfigDto {
    #[serde(alias = "window_seconds")]
    pub window_seconds: i64,
    pub defaults: RateLimitDefaults,
    pub routes: HashMap<String, RateLimitRouteOverride>,
    /// Populated by [`RateLimitRuntime::snapshot`]; ignored by `apply`.
    pub version: u64,
}

impl Default for RateLimitConfigDto {
    fn default() -> Self {
        Self {
            window_seconds: 10,
            defaults: RateLimitDefaults {
                permit_limit: 100,
                queue_limit: 0,
            },
            routes: HashMap::new(),
            version: 0,
        }
    }
}

/// Effective limits for one route prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedLimits {
    pub permit_limit: u32,
    pub queue_limit: u32,
    pub window_seconds: u32,
    pub version: u64,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum RateLimitApplyError {
    #[error("rate limit configuration payload is missing")]
    MissingPayload,
}

#[derive(Debug)]
struct RateLimitState {
    window_seconds: i64,
    defaults: RateLimitDefaults,
    routes: HashMap<String, RateLimitRouteOverride>,
    version: u64,
}

/// Runtime holder for rate limit settings shared by the request path and the
/// admin surface.
#[derive(Debug)]
pub struct RateLimitRuntime {
    state: Mutex<RateLimitState>,
}

impl RateLimitRuntime {
    /// Build the runtime from static configuration. The version starts at 1.
    pub fn new(initial: &RateLimitConfigDto) -> Self {
        let (window_seconds, defaults, routes) = sanitize(initial);
        Self {
            state: Mutex::new(RateLimitState {
                window_seconds,
                defaults,
                routes,
                version: 1,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RateLimitState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn window_seconds(&self) -> i64 {
        self.lock().window_seconds
    }

    pub fn defaults(&self) -> RateLimitDefaults {
        self.lock().defaults
    }

    /// Copy of the per-route overrides.
    pub fn routes(&self) -> HashMap<String, RateLimitRouteOverride> {
        self.lock().routes.clone()
    }

    pub fn version(&self) -> u64 {
        self.lock().version
    }

    /// Effective limits for `route_prefix` (case-insensitive, slashes ignored).
    pub fn resolve(&self, route_prefix: &str) -> ResolvedLimits {
        let key = normalize_route_key(route_prefix);
        let state = self.lock();
        let (permit, queue) = match key.and_then(|k| state.routes.get(&k)) {
            Some(route) => (
                route.permit_limit.unwrap_or(state.defaults.permit_limit),
                route.queue_limit.unwrap_or(state.defaults.queue_limit),
            ),
            None => (state.defaults.permit_limit, state.defaults.queue_limit),
        };
        ResolvedLimits {
            permit_limit: clamp_u32(permit),
            queue_limit: clamp_u32(queue),
            window_seconds: clamp_u32(state.window_seconds),
            version: state.version,
        }
    }

    /// Current configuration, including the version, as an owned DTO.
    pub fn snapshot(&self) -> RateLimitConfigDto {
        let state = self.lock();
        RateLimitConfigDto {
            window_seconds: state.window_seconds,
            defaults: state.defaults,
            routes: state.routes.clone(),
            version: state.version,
        }
    }

    /// Whether applying `dto` would leave the active settings unchanged.
    /// The DTO's version is ignored.
    pub fn is_current(&self, dto: &RateLimitConfigDto) -> bool {
        let (window_seconds, defaults, routes) = sanitize(dto);
        let state = self.lock();
        state.window_seconds == window_seconds
            && state.defaults == defaults
            && state.routes == routes
    }

    /// Replace the configuration wholesale and bump the version.
    ///
    /// Numeric fields are clamped rather than rejected; blank route keys are
    /// dropped. Only a missing payload is an error.
    pub fn apply(&self, dto: Option<&RateLimitConfigDto>) -> Result<u64, RateLimitApplyError> {
        let dto = dto.ok_or(RateLimitApplyError::MissingPayload)?;
        let (window_seconds, defaults, routes) = sanitize(dto);

        let mut state = self.lock();
        state.window_seconds = window_seconds;
        state.defaults = defaults;
        state.routes = routes;
        state.version = state.version.wrapping_add(1);
        let version = state.version;
        drop(state);

        tracing::info!(
            window_seconds,
            permit_limit = defaults.permit_limit,
            queue_limit = defaults.queue_limit,
            version,
            "Applied rate limit configuration"
        );
        Ok(version)
    }
}

/// Normalized override key: trimmed of whitespace and slashes, lowercased.
pub fn normalize_route_key(prefix: &str) -> Option<String> {
    let key = prefix.trim().trim_matches('/').trim();
    if key.is_empty() {
        None
    } else {
        Some(key.to_ascii_lowercase())
    }
}

fn sanitize(
    dto: &RateLimitConfigDto,
) -> (
    i64,
    RateLimitDefaults,
    HashMap<String, RateLimitRouteOverride>,
) {
    let window_seconds = dto.window_seconds.max(1);
    let defaults = RateLimitDefaults {
        permit_limit: dto.defaults.permit_limit.max(0),
        queue_limit: dto.defaults.queue_limit.max(0),
    };
    let routes = dto
        .routes
        .iter()
        .filter_map(|(prefix, route)| {
            normalize_route_key(prefix).map(|key| {
                (
                    key,
                    RateLimitRouteOverride {
                        permit_limit: route.permit_limit.map(|v| v.max(0)),
                        queue_limit: route.queue_limit.map(|v| v.max(0)),
                    },
                )
            })
        })
        .collect();
    (window_seconds, defaults, routes)
}

fn clamp_u32(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}
