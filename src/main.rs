use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use tenant_gateway::{
    adapters::{
        FileConfigProvider, InMemoryPolicyStore, JsonFilePolicyStore, LogLevelOverrides,
        TracingAuditSink,
        admin_api::{self, AdminState},
    },
    config::{GatewayConfig, GatewayConfigValidator, SAMPLE_CONFIG, TlsBindingConfig},
    core::{GatewayService, tls::CertificateMaterial},
    ports::{config_provider::ConfigProvider, policy_store::PolicyStore},
    tracing_setup::{self, LogFormat},
    utils::{GracefulShutdown, ShutdownReason},
};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "config.toml")]
    config: String,

    /// Log output format
    #[clap(long, value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Initialize a new configuration file
    Init {
        /// Output path for the new config file
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Start the gateway runtime and admin API (default)
    Serve {
        /// Configuration file to use
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    let config_path = match args.command {
        Some(Commands::Validate { config }) => return validate_config_command(&config).await,
        Some(Commands::Init { config }) => return init_config_command(&config).await,
        Some(Commands::Serve { config }) => config,
        None => args.config,
    };

    tracing_setup::init(args.log_format)?;

    let provider = rustls::crypto::aws_lc_rs::default_provider();
    if let Err(e) = rustls::crypto::CryptoProvider::install_default(provider) {
        tracing::warn!(
            "CryptoProvider::install_default for aws-lc-rs reported an error: {:?}. \
            A provider was probably installed already; continuing.",
            e
        );
    }

    serve(&config_path).await
}

async fn serve(config_path: &str) -> Result<()> {
    tracing::info!("Loading initial configuration from {config_path}");

    let config_provider: Arc<dyn ConfigProvider> = Arc::new(
        FileConfigProvider::new(config_path).context("Failed to create config provider")?,
    );
    let config: GatewayConfig = config_provider
        .load_config()
        .await
        .with_context(|| format!("Failed to load initial config from {config_path}"))?;
    GatewayConfigValidator::validate(&config)
        .map_err(|e| eyre!("Invalid configuration in {config_path}: {e}"))?;

    let policy_store: Arc<dyn PolicyStore> = match &config.policy_store.path {
        Some(path) => {
            tracing::info!(path = %path.display(), "Persisting policies to JSON file");
            Arc::new(JsonFilePolicyStore::new(path))
        }
        None => {
            tracing::info!("No policy store path configured; policies are kept in memory");
            Arc::new(InMemoryPolicyStore::new())
        }
    };
    let log_levels = Arc::new(LogLevelOverrides::new());
    let gateway = Arc::new(GatewayService::new(
        &config,
        policy_store,
        Arc::new(TracingAuditSink),
        log_levels.clone(),
    ));

    let loaded = gateway
        .policies()
        .load_from_store()
        .await
        .context("Failed to load policies from store")?;
    tracing::info!(count = loaded, "Loaded policies");

    for binding in &config.tls.bindings {
        if let Err(e) = bind_from_files(&gateway, binding).await {
            tracing::error!(host = %binding.host, error = ?e, "Failed to bind configured certificate");
        }
    }

    let graceful_shutdown = Arc::new(GracefulShutdown::new());
    let shutdown = graceful_shutdown.token();

    let signal_handler_shutdown = graceful_shutdown.clone();
    tokio::spawn(async move {
        let reason = signal_handler_shutdown.run_signal_handler().await;
        tracing::info!(?reason, "Shutdown signal received");
    });

    let background = gateway.spawn_background(shutdown.clone());
    let watcher = spawn_config_watcher(
        config_provider.clone(),
        gateway.clone(),
        config_path.to_string(),
        shutdown.clone(),
    );

    let addr: SocketAddr = config
        .admin_listen_addr
        .parse()
        .context("Failed to parse admin listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind admin API on {addr}"))?;

    tracing::info!(
        admin = %addr,
        service = %config.service_name,
        environment = %config.environment,
        certificates = gateway.tls().len(),
        routes = gateway.proxy().get_config().routes().len(),
        "Tenant gateway started"
    );

    let app = admin_api::router(AdminState {
        gateway: gateway.clone(),
        log_levels,
    });
    let server_shutdown = shutdown.clone();
    let server_result = axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await
        .context("Admin server error");

    // The server also stops on its own errors; make sure the tasks follow.
    graceful_shutdown.trigger_shutdown(ShutdownReason::Requested);
    graceful_shutdown.drain("rejection-aggregator", background).await;
    graceful_shutdown.drain("config-watcher", watcher).await;

    server_result?;
    tracing::info!("Graceful shutdown completed");
    Ok(())
}

async fn bind_from_files(gateway: &GatewayService, binding: &TlsBindingConfig) -> Result<()> {
    let cert_pem = tokio::fs::read_to_string(&binding.cert_path)
        .await
        .with_context(|| format!("Failed to read {}", binding.cert_path.display()))?;
    let key_pem = tokio::fs::read_to_string(&binding.key_path)
        .await
        .with_context(|| format!("Failed to read {}", binding.key_path.display()))?;
    let chain_pem = match &binding.chain_path {
        Some(path) => Some(
            tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?,
        ),
        None => None,
    };

    let material = CertificateMaterial::Pem {
        cert_pem,
        key_pem,
        chain_pem,
    };
    let bound = gateway.bind_certificate(&binding.host, &material).await?;
    tracing::info!(host = %bound.host, thumbprint = %bound.thumbprint, "Bound configured certificate");
    Ok(())
}

/// Re-apply rate limits, output cache and routes whenever the config file changes.
fn spawn_config_watcher(
    config_provider: Arc<dyn ConfigProvider>,
    gateway: Arc<GatewayService>,
    config_path: String,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let debounce_duration = Duration::from_secs(2);

    tokio::spawn(async move {
        let Some(mut notify_rx) = config_provider.watch() else {
            tracing::warn!("Config watch channel already taken; hot reload disabled");
            return;
        };
        tracing::info!("Config watcher task started.");
        let mut last_reload_attempt_time = tokio::time::Instant::now();
        last_reload_attempt_time = last_reload_attempt_time
            .checked_sub(debounce_duration)
            .unwrap_or(last_reload_attempt_time);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = notify_rx.recv() => {
                    if event.is_none() {
                        break;
                    }
                }
            }

            if last_reload_attempt_time.elapsed() < debounce_duration {
                tracing::debug!("Debouncing config reload event. Still within cooldown period.");
                while notify_rx.try_recv().is_ok() {}
                continue;
            }
            last_reload_attempt_time = tokio::time::Instant::now();

            tracing::info!("Attempting to reload configuration from {}", config_path);
            match config_provider.load_config().await {
                Ok(new_config) => match GatewayConfigValidator::validate(&new_config) {
                    Ok(()) => match gateway.apply_config(&new_config).await {
                        Ok(summary) => tracing::info!(?summary, "Configuration reloaded"),
                        Err(e) => tracing::error!(
                            "Reloaded routes were rejected: {}. Keeping current routes.",
                            e
                        ),
                    },
                    Err(e) => tracing::error!(
                        "Reloaded configuration is invalid: {}. Keeping old configuration.",
                        e
                    ),
                },
                Err(e) => {
                    tracing::error!(
                        "Failed to reload configuration: {:?}. Keeping old configuration.",
                        e
                    );
                }
            }
            while notify_rx.try_recv().is_ok() {}
        }
        tracing::info!("Config watcher task is shutting down.");
    })
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: &str) -> Result<()> {
    use tenant_gateway::config::load_config;

    println!("Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("Error: Configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config(config_path).await {
        Ok(config) => {
            println!("Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("Configuration parsing failed:");
            eprintln!("   {e:?}");
            std::process::exit(1);
        }
    };

    match GatewayConfigValidator::validate(&config) {
        Ok(()) => {
            println!("Configuration validation: OK");
            println!();
            println!("Configuration Summary:");
            println!("   Admin Listen Address: {}", config.admin_listen_addr);
            println!("   Service: {} ({})", config.service_name, config.environment);
            println!(
                "   Rate Limits: {} permits / {}s, {} route overrides",
                config.rate_limits.defaults.permit_limit,
                config.rate_limits.window_seconds,
                config.rate_limits.routes.len()
            );
            println!(
                "   Routes: {} ({} clusters)",
                config.proxy.routes.len(),
                config.proxy.clusters.len()
            );
            println!("   TLS Bindings: {}", config.tls.bindings.len());
            match &config.policy_store.path {
                Some(path) => println!("   Policy Store: {}", path.display()),
                None => println!("   Policy Store: in memory"),
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration validation failed:");
            eprintln!("{e}");
            println!();
            println!("Common fixes:");
            println!("   Verify listen address format (e.g., '127.0.0.1:9090')");
            println!("   Ensure every route references a cluster with destinations");
            println!("   Check that TLS hosts are unique and certificate paths are set");
            std::process::exit(1);
        }
    }
}

/// Initialize a new configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("Error: Configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    tokio::fs::write(path, SAMPLE_CONFIG)
        .await
        .context("Failed to write config file")?;
    println!("Created default configuration at: {config_path}");
    println!("   Run 'tenant-gateway serve --config {config_path}' to start the gateway");
    Ok(())
}
