//! Proxy routing table snapshots, change notification and one-step rollback.
//!
//! [`DynamicProxyConfigProvider`] publishes immutable [`ProxyConfig`] values
//! through an `ArcSwap`. Each published config carries its own cancellation
//! token; publishing a new one cancels the previous token so that consumers
//! holding it know to re-fetch. This is a single-slot publish/subscribe: a
//! consumer that misses a notification simply sees the latest config on its
//! next read.
//!
//! [`RoutesRuntime`] is the separate, mutex-guarded slot holding exactly one
//! previous snapshot for rollback.
use std::{
    collections::{BTreeMap, HashSet},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::core::tls::host_matches;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteMatch {
    /// Path template, e.g. `/storage/{**catch-all}`; matched as a prefix.
    pub path: String,
    /// Allowed hosts (exact or `*.` wildcard); empty matches any host.
    #[serde(default)]
    pub hosts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteConfig {
    #[serde(alias = "route_id")]
    pub route_id: String,
    #[serde(alias = "cluster_id")]
    pub cluster_id: String,
    #[serde(rename = "match")]
    pub route_match: RouteMatch,
    /// Lower values win among routes with equally long prefixes.
    #[serde(default)]
    pub order: i32,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationConfig {
    pub address: String,
    #[serde(default)]
    pub health: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    #[serde(alias = "cluster_id")]
    pub cluster_id: String,
    #[serde(default, alias = "load_balancing_policy")]
    pub load_balancing_policy: Option<String>,
    #[serde(default)]
    pub destinations: BTreeMap<String, DestinationConfig>,
}

/// The proxy's full routing table at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteSnapshot {
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
}

impl RouteSnapshot {
    pub fn new(routes: Vec<RouteConfig>, clusters: Vec<ClusterConfig>) -> Self {
        Self { routes, clusters }
    }

    /// Reject snapshots the proxy could not serve.
    pub fn validate(&self) -> Result<(), RouteConfigError> {
        let mut cluster_ids = HashSet::new();
        for cluster in &self.clusters {
            if cluster.cluster_id.trim().is_empty() {
                return Err(RouteConfigError::EmptyClusterId);
            }
            if !cluster_ids.insert(cluster.cluster_id.as_str()) {
                return Err(RouteConfigError::DuplicateClusterId(
                    cluster.cluster_id.clone(),
                ));
            }
            if cluster.destinations.is_empty() {
                return Err(RouteConfigError::NoDestinations(cluster.cluster_id.clone()));
            }
        }

        let mut route_ids = HashSet::new();
        for route in &self.routes {
            if route.route_id.trim().is_empty() {
                return Err(RouteConfigError::EmptyRouteId);
            }
            if !route_ids.insert(route.route_id.as_str()) {
                return Err(RouteConfigError::DuplicateRouteId(route.route_id.clone()));
            }
            if !route.route_match.path.starts_with('/') {
                return Err(RouteConfigError::InvalidPath {
                    route: route.route_id.clone(),
                    path: route.route_match.path.clone(),
                });
            }
            if !cluster_ids.contains(route.cluster_id.as_str()) {
                return Err(RouteConfigError::UnknownCluster {
                    route: route.route_id.clone(),
                    cluster: route.cluster_id.clone(),
                });
            }
        }
        Ok(())
    }

    /// Longest-prefix match of `path`, honoring per-route host constraints.
    pub fn find_matching_route(&self, path: &str, host: Option<&str>) -> Option<&RouteConfig> {
        self.routes
            .iter()
            .filter(|route| route_accepts_host(route, host))
            .filter_map(|route| {
                let prefix = route_prefix(&route.route_match.path);
                path_has_prefix(path, prefix).then_some((prefix.len(), route))
            })
            .max_by(|(len_a, a), (len_b, b)| len_a.cmp(len_b).then(b.order.cmp(&a.order)))
            .map(|(_, route)| route)
    }

    pub fn cluster(&self, cluster_id: &str) -> Option<&ClusterConfig> {
        self.clusters.iter().find(|c| c.cluster_id == cluster_id)
    }
}

fn route_prefix(template: &str) -> &str {
    let literal = template.split('{').next().unwrap_or(template);
    literal.trim_end_matches('/')
}

fn path_has_prefix(path: &str, prefix: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    let Some(rest) = path.get(..prefix.len()) else {
        return false;
    };
    rest.eq_ignore_ascii_case(prefix)
        && matches!(path.as_bytes().get(prefix.len()), None | Some(b'/') | Some(b'?'))
}

fn route_accepts_host(route: &RouteConfig, host: Option<&str>) -> bool {
    if route.route_match.hosts.is_empty() {
        return true;
    }
    let Some(host) = host else {
        return false;
    };
    route
        .route_match
        .hosts
        .iter()
        .any(|pattern| host_matches(pattern, host))
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouteConfigError {
    #[error("route id must not be empty")]
    EmptyRouteId,
    #[error("duplicate route id '{0}'")]
    DuplicateRouteId(String),
    #[error("cluster id must not be empty")]
    EmptyClusterId,
    #[error("duplicate cluster id '{0}'")]
    DuplicateClusterId(String),
    #[error("cluster '{0}' has no destinations")]
    NoDestinations(String),
    #[error("route '{route}' has invalid path '{path}': paths must start with '/'")]
    InvalidPath { route: String, path: String },
    #[error("route '{route}' references unknown cluster '{cluster}'")]
    UnknownCluster { route: String, cluster: String },
    #[error("no previous route configuration to roll back to")]
    NothingToRollBack,
}

/// One published routing table plus the token cancelled when it is replaced.
#[derive(Debug)]
pub struct ProxyConfig {
    snapshot: RouteSnapshot,
    revision: u64,
    change_token: CancellationToken,
}

impl ProxyConfig {
    fn new(snapshot: RouteSnapshot, revision: u64) -> Self {
        Self {
            snapshot,
            revision,
            change_token: CancellationToken::new(),
        }
    }

    pub fn routes(&self) -> &[RouteConfig] {
        &self.snapshot.routes
    }

    pub fn clusters(&self) -> &[ClusterConfig] {
        &self.snapshot.clusters
    }

    pub fn snapshot(&self) -> &RouteSnapshot {
        &self.snapshot
    }

    /// Monotonic publish counter, starting at 1 for the initial config.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn change_token(&self) -> &CancellationToken {
        &self.change_token
    }

    pub fn has_changed(&self) -> bool {
        self.change_token.is_cancelled()
    }

    /// Resolves once a newer config has been published.
    pub async fn changed(&self) {
        self.change_token.cancelled().await;
    }
}

/// Source of the reverse proxy's current routing table.
#[derive(Debug)]
pub struct DynamicProxyConfigProvider {
    current: ArcSwap<ProxyConfig>,
    revisions: AtomicU64,
}

impl DynamicProxyConfigProvider {
    pub fn new(initial: RouteSnapshot) -> Self {
        Self {
            current: ArcSwap::from_pointee(ProxyConfig::new(initial, 1)),
            revisions: AtomicU64::new(1),
        }
    }

    pub fn get_config(&self) -> Arc<ProxyConfig> {
        self.current.load_full()
    }

    /// Publish a new routing table and notify holders of the previous one.
    pub fn update(&self, routes: Vec<RouteConfig>, clusters: Vec<ClusterConfig>) -> u64 {
        let revision = self.revisions.fetch_add(1, Ordering::AcqRel) + 1;
        let next = Arc::new(ProxyConfig::new(
            RouteSnapshot::new(routes, clusters),
            revision,
        ));
        let route_count = next.routes().len();
        let cluster_count = next.clusters().len();

        let previous = self.current.swap(next);
        previous.change_token.cancel();

        tracing::info!(
            revision,
            routes = route_count,
            clusters = cluster_count,
            "Published proxy configuration"
        );
        revision
    }
}

/// Single-slot holder of the snapshot to restore on rollback.
#[derive(Debug, Default)]
pub struct RoutesRuntime {
    previous: Mutex<Option<RouteSnapshot>>,
}

impl RoutesRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Option<RouteSnapshot>> {
        self.previous.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get_previous(&self) -> Option<RouteSnapshot> {
        self.slot().clone()
    }

    pub fn set_previous(&self, routes: Vec<RouteConfig>, clusters: Vec<ClusterConfig>) {
        *self.slot() = Some(RouteSnapshot::new(routes, clusters));
    }

    pub fn clear_previous(&self) {
        *self.slot() = None;
    }
}
