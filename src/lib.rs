//! Tenant Gateway - runtime configuration and request classification for a
//! multi-tenant API gateway.
//!
//! The crate holds the state a reverse proxy consults on every request and
//! the operations an operator uses to change that state while the proxy keeps
//! serving. It follows a **hexagonal architecture**: business logic lives in
//! `core`, traits in `ports`, and concrete implementations in `adapters`.
//!
//! # Features
//! - Tenant resolution from `/t/{tenant}` path prefixes or subdomains
//! - Per-host TLS certificates (PFX or PEM) with validation, rotation and SNI lookup
//! - Versioned, hot-swappable rate limits with per route/tenant partitions
//! - Windowed aggregation of rate limit rejections
//! - Output cache TTL settings and caching policy
//! - Typed policies (CORS, IP allow/deny, cache, rate limit) with pluggable persistence
//! - Atomically swapped routing tables with one-step rollback
//! - Audit events for every administrative change
//! - An axum admin API and live configuration hot-reload
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use tenant_gateway::{
//!     GatewayService,
//!     adapters::{InMemoryPolicyStore, LogLevelOverrides, TracingAuditSink},
//!     config::GatewayConfig,
//! };
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let cfg: GatewayConfig = tenant_gateway::config::load_config("config.toml").await?;
//! let gateway = Arc::new(GatewayService::new(
//!     &cfg,
//!     Arc::new(InMemoryPolicyStore::new()),
//!     Arc::new(TracingAuditSink),
//!     Arc::new(LogLevelOverrides::new()),
//! ));
//! let admission = gateway.admit("acme.example.com", "/storage/files").await;
//! assert!(admission.is_permitted());
//! # Ok(()) }
//! ```
//!
//! # Error Handling
//! Core operations return domain error types built with `thiserror`. Adapters
//! and the binary use `eyre::Result<T>` with context attached via `WrapErr`.
//!
//! # Concurrency & Data Structures
//! Shared maps use `scc::HashMap`; whole-value swaps use `arc-swap`. No lock is
//! held across an await point on the request path.
pub mod config;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

// Re-export the specific types needed by the binary crate
pub use crate::{
    adapters::{FileConfigProvider, LogLevelOverrides, TracingAuditSink},
    core::{GatewayService, TenantResolver},
    utils::GracefulShutdown,
};
