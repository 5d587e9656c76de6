//! Per-request tenant resolution.
//!
//! A tenant can be addressed implicitly through the first label of the host
//! (`acme.example.com`) or explicitly through a `/t/{tenant}` path segment,
//! optionally preceded by one service segment (`/storage/t/acme/...`). When
//! both are present the path wins, which lets operators reach any tenant
//! through whatever domain they happen to hit.
//!
//! Resolution is a pure function over `(host, path)` with no shared mutable
//! state, so it is safe to call from every request task concurrently.
use std::{fmt, net::IpAddr};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Paths longer than this are not scanned for a tenant segment.
pub const MAX_SCANNED_PATH_LEN: usize = 2048;

static TENANT_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^/(?:[a-z0-9][a-z0-9_-]*/)?t/([a-z0-9][a-z0-9_-]*)(?:/|$)")
        .expect("tenant path pattern is valid")
});

const RESERVED_HOSTS: [&str; 3] = ["localhost", "127.0.0.1", "::1"];

/// Which part of the request produced the tenant id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TenantSource {
    None,
    Subdomain,
    Path,
    Both,
}

impl fmt::Display for TenantSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TenantSource::None => "none",
            TenantSource::Subdomain => "subdomain",
            TenantSource::Path => "path",
            TenantSource::Both => "both",
        };
        f.write_str(name)
    }
}

/// Outcome of [`TenantResolver::resolve`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantResolution {
    pub tenant_id: Option<String>,
    pub source: TenantSource,
}

impl TenantResolution {
    pub fn none() -> Self {
        Self {
            tenant_id: None,
            source: TenantSource::None,
        }
    }
}

/// Stateless tenant resolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct TenantResolver;

impl TenantResolver {
    pub fn new() -> Self {
        Self
    }

    /// Resolve the tenant for a request; the path segment takes precedence.
    pub fn resolve(&self, host: &str, path: &str) -> TenantResolution {
        let from_path = Self::try_from_path(path);
        let from_subdomain = Self::try_from_subdomain(host);

        match (from_path, from_subdomain) {
            (Some(tenant), Some(_)) => TenantResolution {
                tenant_id: Some(tenant),
                source: TenantSource::Both,
            },
            (Some(tenant), None) => TenantResolution {
                tenant_id: Some(tenant),
                source: TenantSource::Path,
            },
            (None, Some(tenant)) => TenantResolution {
                tenant_id: Some(tenant),
                source: TenantSource::Subdomain,
            },
            (None, None) => TenantResolution::none(),
        }
    }

    /// Extract the tenant from a `/t/{tenant}` or `/{segment}/t/{tenant}` path.
    pub fn try_from_path(path: &str) -> Option<String> {
        if path.is_empty() || path.len() > MAX_SCANNED_PATH_LEN {
            return None;
        }
        TENANT_PATH
            .captures(path)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_ascii_lowercase())
    }

    /// Extract the tenant from the first label of the host.
    ///
    /// Reserved loopback names, raw IP addresses, dotless hosts and the `www`
    /// label never yield a tenant.
    pub fn try_from_subdomain(host: &str) -> Option<String> {
        let host = strip_port(host.trim()).trim_end_matches('.');
        if host.is_empty() {
            return None;
        }
        if RESERVED_HOSTS
            .iter()
            .any(|reserved| host.eq_ignore_ascii_case(reserved))
        {
            return None;
        }
        if host.parse::<IpAddr>().is_ok() {
            return None;
        }

        let (label, _rest) = host.split_once('.')?;
        if label.is_empty() || label.eq_ignore_ascii_case("www") {
            return None;
        }
        Some(label.to_ascii_lowercase())
    }
}

/// Strip a trailing `:port` while leaving bare IPv6 literals intact.
pub(crate) fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split_once(']').map(|(addr, _)| addr).unwrap_or(rest);
    }
    match host.matches(':').count() {
        1 => host.split_once(':').map(|(name, _)| name).unwrap_or(host),
        _ => host,
    }
}
