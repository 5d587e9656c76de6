//! Configuration data structures for the gateway runtime.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files.
//! Every section has defaults so a minimal file stays short. Sections that are
//! also exchanged over the admin API reuse the runtime DTOs, which accept the
//! snake_case spelling used here.
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::{
    output_cache::OutputCacheConfig, rate_limit::RateLimitConfigDto, routes::RouteSnapshot,
};

fn default_admin_listen_addr() -> String {
    "127.0.0.1:9090".to_string()
}

fn default_service_name() -> String {
    env!("CARGO_PKG_NAME").to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

/// Root configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Socket address of the admin API, e.g. `127.0.0.1:9090`.
    pub admin_listen_addr: String,
    /// Stamped on audit events.
    pub service_name: String,
    pub environment: String,
    pub rate_limits: RateLimitConfigDto,
    pub output_cache: OutputCacheConfig,
    /// Initial routing table published at startup.
    pub proxy: RouteSnapshot,
    pub tls: TlsSettings,
    pub policy_store: PolicyStoreSettings,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            admin_listen_addr: default_admin_listen_addr(),
            service_name: default_service_name(),
            environment: default_environment(),
            rate_limits: RateLimitConfigDto::default(),
            output_cache: OutputCacheConfig::default(),
            proxy: RouteSnapshot::default(),
            tls: TlsSettings::default(),
            policy_store: PolicyStoreSettings::default(),
        }
    }
}

/// Certificates bound at startup.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    pub bindings: Vec<TlsBindingConfig>,
}

/// One host bound to PEM files on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsBindingConfig {
    pub host: String,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    #[serde(default)]
    pub chain_path: Option<PathBuf>,
}

/// Where policies are persisted. Without a path policies live in memory only.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyStoreSettings {
    pub path: Option<PathBuf>,
}
