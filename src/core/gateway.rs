//! Core gateway orchestration service.
//!
//! The `GatewayService` owns every runtime the proxy and the admin surface
//! share. It provides:
//! * Request admission (tenant resolution, partitioned rate limiting, route lookup)
//! * Administrative mutations with audit events
//! * Reversible route updates with a single rollback step
//!
//! This layer performs no network I/O; persistence and audit delivery go
//! through the injected ports.
use std::{fmt::Display, net::IpAddr, sync::Arc, time::Duration};

use serde::Serialize;
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    config::GatewayConfig,
    core::{
        audit::{AuditContext, AuditEvent},
        output_cache::{OutputCacheConfig, OutputCachePolicy, OutputCacheRuntime},
        policy::{IpVerdict, PolicyEntry, PolicyError, PolicyRuntime},
        rate_limit::{
            PartitionedRateLimiter, RateLimitApplyError, RateLimitConfigDto, RateLimitDecision,
            RateLimitRejectionAggregator, RateLimitRuntime, ResolvedLimits,
        },
        routes::{DynamicProxyConfigProvider, RouteConfigError, RouteSnapshot, RoutesRuntime},
        tenant::{TenantResolution, TenantResolver, strip_port},
        tls::{CertificateMaterial, DomainBinding, DomainTlsRuntime, RotateRequest, RotationOutcome, TlsError},
    },
    ports::{audit_sink::AuditSink, log_levels::LogLevelSource, policy_store::PolicyStore},
};

/// Route base used for requests without a first path segment.
pub const ROOT_ROUTE_BASE: &str = "root";

/// Result of admitting one request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Admission {
    pub tenant: TenantResolution,
    pub route_base: String,
    pub route_id: Option<String>,
    pub limits: ResolvedLimits,
    pub decision: RateLimitDecision,
}

impl Admission {
    pub fn is_permitted(&self) -> bool {
        self.decision.is_permitted()
    }
}

/// Sections changed by [`GatewayService::apply_config`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReloadSummary {
    pub rate_limit_version: Option<u64>,
    pub output_cache_applied: bool,
    pub route_revision: Option<u64>,
}

/// Central orchestrator for the gateway runtimes. Share it behind an `Arc`.
pub struct GatewayService {
    tenants: TenantResolver,
    tls: Arc<DomainTlsRuntime>,
    rate_limits: Arc<RateLimitRuntime>,
    limiter: Arc<PartitionedRateLimiter>,
    rejections: Arc<RateLimitRejectionAggregator>,
    output_cache: Arc<OutputCacheRuntime>,
    policies: Arc<PolicyRuntime>,
    proxy: Arc<DynamicProxyConfigProvider>,
    routes: RoutesRuntime,
    audit: Arc<dyn AuditSink>,
    audit_context: AuditContext,
    // Serializes the capture-then-publish and restore-then-clear sequences.
    route_changes: Mutex<()>,
}

impl GatewayService {
    /// Build every runtime from `config`. Certificates and stored policies are
    /// loaded separately since both involve I/O.
    pub fn new(
        config: &GatewayConfig,
        policy_store: Arc<dyn PolicyStore>,
        audit: Arc<dyn AuditSink>,
        log_levels: Arc<dyn LogLevelSource>,
    ) -> Self {
        let rate_limits = Arc::new(RateLimitRuntime::new(&config.rate_limits));
        let window = Duration::from_secs(rate_limits.window_seconds().max(1).unsigned_abs());
        Self {
            tenants: TenantResolver::new(),
            tls: Arc::new(DomainTlsRuntime::new()),
            rate_limits,
            limiter: Arc::new(PartitionedRateLimiter::new()),
            rejections: Arc::new(RateLimitRejectionAggregator::new(window, log_levels)),
            output_cache: Arc::new(OutputCacheRuntime::new(config.output_cache)),
            policies: Arc::new(PolicyRuntime::new(policy_store)),
            proxy: Arc::new(DynamicProxyConfigProvider::new(config.proxy.clone())),
            routes: RoutesRuntime::new(),
            audit,
            audit_context: AuditContext {
                service: config.service_name.clone(),
                environment: config.environment.clone(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            route_changes: Mutex::new(()),
        }
    }

    pub fn tenants(&self) -> &TenantResolver {
        &self.tenants
    }

    pub fn tls(&self) -> &Arc<DomainTlsRuntime> {
        &self.tls
    }

    pub fn rate_limits(&self) -> &Arc<RateLimitRuntime> {
        &self.rate_limits
    }

    pub fn rejections(&self) -> &Arc<RateLimitRejectionAggregator> {
        &self.rejections
    }

    pub fn output_cache(&self) -> &Arc<OutputCacheRuntime> {
        &self.output_cache
    }

    pub fn output_cache_policy(&self) -> OutputCachePolicy {
        OutputCachePolicy::new(self.output_cache.clone())
    }

    pub fn policies(&self) -> &Arc<PolicyRuntime> {
        &self.policies
    }

    pub fn proxy(&self) -> &Arc<DynamicProxyConfigProvider> {
        &self.proxy
    }

    pub fn routes(&self) -> &RoutesRuntime {
        &self.routes
    }

    /// Start background work: the rejection flush loop and the idle
    /// partition sweep, both on the rejection window.
    pub fn spawn_background(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let sweeper = self
            .limiter
            .clone()
            .spawn_sweeper(self.rejections.window(), shutdown.clone());
        let flusher = self.rejections.clone().spawn(shutdown);
        tokio::spawn(async move {
            let (flushed, swept) = tokio::join!(flusher, sweeper);
            for result in [flushed, swept] {
                if let Err(e) = result {
                    tracing::warn!(error = %e, "Gateway background task failed");
                }
            }
        })
    }

    /// Classify and rate limit one request.
    pub async fn admit(&self, host: &str, path: &str) -> Admission {
        let tenant = self.tenants.resolve(host, path);
        let route_base = route_base(path);
        let limits = self.rate_limits.resolve(&route_base);
        let key = PartitionedRateLimiter::partition_key(
            &route_base,
            tenant.tenant_id.as_deref(),
            limits.version,
        );
        let decision = self.limiter.acquire(&key, limits).await;
        if !decision.is_permitted() {
            self.rejections
                .report(&route_base, tenant.tenant_id.as_deref(), &key)
                .await;
        }

        let config = self.proxy.get_config();
        let route_id = config
            .snapshot()
            .find_matching_route(path, Some(strip_port(host.trim())))
            .map(|route| route.route_id.clone());

        Admission {
            tenant,
            route_base,
            route_id,
            limits,
            decision,
        }
    }

    /// Evaluate IP policies for a client address.
    pub async fn check_client_ip(&self, ip: IpAddr) -> IpVerdict {
        self.policies.evaluate_ip(ip).await
    }

    pub async fn bind_certificate(
        &self,
        host: &str,
        material: &CertificateMaterial,
    ) -> Result<DomainBinding, TlsError> {
        let result = self.tls.bind(host, material).await;
        let event = self.audit_context.event("tls", "bind").subject(host);
        self.record(
            match &result {
                Ok(binding) => event.detail("thumbprint", &binding.thumbprint),
                Err(_) => event,
            },
            &result,
        )
        .await;
        result
    }

    pub async fn rotate_certificate(
        &self,
        host: &str,
        request: RotateRequest,
    ) -> Result<RotationOutcome, TlsError> {
        let result = self.tls.rotate(host, request).await;
        let mut event = self.audit_context.event("tls", "rotate").subject(host);
        if let Ok(outcome) = &result {
            event = event.detail("thumbprint", &outcome.current.thumbprint);
            if let Some(previous) = &outcome.previous {
                event = event.detail("previousThumbprint", &previous.thumbprint);
            }
        }
        self.record(event, &result).await;
        result
    }

    pub async fn remove_certificate(&self, host: &str) -> bool {
        let removed = self.tls.remove(host).await;
        let event = self
            .audit_context
            .event("tls", "remove")
            .subject(host)
            .detail("existed", removed);
        self.audit.emit(event).await;
        removed
    }

    pub async fn apply_rate_limits(
        &self,
        dto: Option<&RateLimitConfigDto>,
    ) -> Result<u64, RateLimitApplyError> {
        let result = self.rate_limits.apply(dto);
        let mut event = self.audit_context.event("rateLimits", "apply");
        if let Ok(version) = &result {
            event = event.detail("version", version);
        }
        self.record(event, &result).await;
        result
    }

    pub async fn apply_output_cache(&self, config: OutputCacheConfig) -> OutputCacheConfig {
        let applied = self.output_cache.apply(config);
        let event = self
            .audit_context
            .event("outputCache", "apply")
            .detail("defaultTtlSeconds", applied.default_ttl_seconds)
            .detail("staticTtlSeconds", applied.static_ttl_seconds);
        self.audit.emit(event).await;
        applied
    }

    pub async fn upsert_policy(&self, entry: PolicyEntry) -> Result<PolicyEntry, PolicyError> {
        let id = entry.id.clone();
        let result = self.policies.upsert(entry).await;
        let event = self.audit_context.event("policy", "upsert").subject(id);
        self.record(event, &result).await;
        result
    }

    pub async fn delete_policy(&self, id: &str) -> Result<bool, PolicyError> {
        let result = self.policies.delete(id).await;
        let mut event = self.audit_context.event("policy", "delete").subject(id);
        if let Ok(existed) = &result {
            event = event.detail("existed", existed);
        }
        self.record(event, &result).await;
        result
    }

    pub async fn replace_policies(&self, entries: Vec<PolicyEntry>) -> Result<usize, PolicyError> {
        let result = self.policies.replace_all(entries).await;
        let mut event = self.audit_context.event("policy", "replaceAll");
        if let Ok(count) = &result {
            event = event.detail("count", count);
        }
        self.record(event, &result).await;
        result
    }

    /// Validate and publish a routing table, keeping the current one for rollback.
    pub async fn update_routes(&self, snapshot: RouteSnapshot) -> Result<u64, RouteConfigError> {
        let result = match snapshot.validate() {
            Ok(()) => {
                let _guard = self.route_changes.lock().await;
                let current = self.proxy.get_config();
                self.routes.set_previous(
                    current.routes().to_vec(),
                    current.clusters().to_vec(),
                );
                Ok(self.proxy.update(snapshot.routes, snapshot.clusters))
            }
            Err(e) => Err(e),
        };
        let mut event = self.audit_context.event("routes", "update");
        if let Ok(revision) = &result {
            event = event.detail("revision", revision);
        }
        self.record(event, &result).await;
        result
    }

    /// Re-publish the captured previous routing table and clear it.
    pub async fn rollback_routes(&self) -> Result<u64, RouteConfigError> {
        let result = {
            let _guard = self.route_changes.lock().await;
            match self.routes.get_previous() {
                Some(previous) => {
                    let revision = self.proxy.update(previous.routes, previous.clusters);
                    self.routes.clear_previous();
                    Ok(revision)
                }
                None => Err(RouteConfigError::NothingToRollBack),
            }
        };
        let mut event = self.audit_context.event("routes", "rollback");
        if let Ok(revision) = &result {
            event = event.detail("revision", revision);
        }
        self.record(event, &result).await;
        result
    }

    /// Re-apply the hot-reloadable sections of a reloaded configuration file.
    ///
    /// Sections equal to what is already active are skipped so an unrelated
    /// edit does not reset rate limit partitions or the route rollback slot.
    pub async fn apply_config(
        &self,
        config: &GatewayConfig,
    ) -> Result<ReloadSummary, RouteConfigError> {
        let mut summary = ReloadSummary::default();

        if !self.rate_limits.is_current(&config.rate_limits) {
            // A present payload never fails to apply.
            summary.rate_limit_version =
                self.apply_rate_limits(Some(&config.rate_limits)).await.ok();
        }

        if !self.output_cache.is_current(config.output_cache) {
            self.apply_output_cache(config.output_cache).await;
            summary.output_cache_applied = true;
        }

        if self.proxy.get_config().snapshot() != &config.proxy {
            summary.route_revision = Some(self.update_routes(config.proxy.clone()).await?);
        }
        Ok(summary)
    }

    async fn record<T, E: Display>(&self, event: AuditEvent, result: &Result<T, E>) {
        let event = match result {
            Ok(_) => event,
            Err(e) => event.failed(e),
        };
        self.audit.emit(event).await;
    }
}

/// First path segment after an optional `/t/{tenant}` prefix, lowercased.
pub fn route_base(path: &str) -> String {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    let mut segments = path.split('/').filter(|s| !s.is_empty());
    let first = match segments.next() {
        Some(t) if t.eq_ignore_ascii_case("t") => segments.nth(1),
        other => other,
    };
    first
        .map(str::to_ascii_lowercase)
        .unwrap_or_else(|| ROOT_ROUTE_BASE.to_string())
}
