use std::path::Path;

use config::{Config, File, FileFormat};
use eyre::{Context, Result};

use crate::config::models::GatewayConfig;

/// Annotated starting point written by `tenant-gateway init`.
pub const SAMPLE_CONFIG: &str = r#"# Tenant Gateway Configuration

# Address of the admin API
admin_listen_addr = "127.0.0.1:9090"
service_name = "tenant-gateway"
environment = "development"

[rate_limits]
window_seconds = 10

[rate_limits.defaults]
permit_limit = 100
queue_limit = 0

# Per-route overrides keyed by first path segment
[rate_limits.routes.identity]
permit_limit = 20

[output_cache]
default_ttl_seconds = 30
static_ttl_seconds = 3600

# Policies persist here; omit to keep them in memory
# [policy_store]
# path = "./data/policies.json"

# Certificates bound at startup
# [[tls.bindings]]
# host = "*.example.com"
# cert_path = "./certs/wildcard.pem"
# key_path = "./certs/wildcard.key"

[[proxy.routes]]
route_id = "storage"
cluster_id = "storage"
match = { path = "/storage/{**catch-all}" }

[[proxy.clusters]]
cluster_id = "storage"

[proxy.clusters.destinations.primary]
address = "http://127.0.0.1:7001"
"#;

/// Load configuration from a file using the config crate.
/// Supports YAML, JSON and TOML, chosen by extension.
pub async fn load_config(config_path: &str) -> Result<GatewayConfig> {
    let path = config_path.to_string();
    tokio::task::spawn_blocking(move || load_config_sync(&path))
        .await
        .wrap_err("Config loading task failed")?
}

/// Load configuration synchronously
pub fn load_config_sync(config_path: &str) -> Result<GatewayConfig> {
    let config_path = Path::new(config_path);

    let format = match config_path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        Some("toml") => FileFormat::Toml,
        _ => FileFormat::Yaml,
    };

    let settings = Config::builder()
        .add_source(File::new(
            config_path
                .to_str()
                .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", config_path.display()))?,
            format,
        ))
        .build()
        .with_context(|| format!("Failed to build config from {}", config_path.display()))?;

    settings.try_deserialize().with_context(|| {
        format!(
            "Failed to deserialize config from {}",
            config_path.display()
        )
    })
}
