//! fleetd - GPU fleet hibernation controller
//!
//! Watches rented GPU machines for idleness, pauses them through their
//! provider, keeps warm standbys for protected machines and runs the
//! fleet-wide cost optimizer.

use anyhow::{Context, Result};
use fleet_core::{
    checkpoint::FsObjectStore,
    health::{components, HealthRegistry},
    observability::{FleetMetrics, StructuredLogger},
    optimizer::{LogNotifier, Notifier, WebhookNotifier},
    provider::{create_provider, ProviderRegistry},
    warm_pool::WarmPoolManagerConfig,
    CheckpointPipeline, CostOptimizer, HibernationManager, WarmPoolManager,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const CONTROLLER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting fleetd");

    let config = config::FleetConfig::load()?;
    info!(
        controller = %config.controller_name,
        machines = config.machines.len(),
        warm_pools = config.warm_pool.pools.len(),
        optimizer = config.optimizer.enabled,
        "Controller configured"
    );

    let health_registry = HealthRegistry::new();
    for name in [
        components::PROVIDERS,
        components::HIBERNATION,
        components::CHECKPOINT,
        components::WARM_POOL,
        components::OPTIMIZER,
    ] {
        health_registry.register(name).await;
    }

    let metrics = FleetMetrics::new().context("Failed to register metrics")?;
    let logger = StructuredLogger::new(&config.controller_name);

    let providers = Arc::new(ProviderRegistry::new());
    for entry in &config.providers {
        let provider = create_provider(&entry.kind, &entry.name)
            .with_context(|| format!("Failed to create provider {}", entry.name))?;
        providers.register(provider);
    }
    if providers.is_empty() {
        health_registry
            .set_unhealthy(components::PROVIDERS, "no providers configured")
            .await;
    }
    logger.log_startup(CONTROLLER_VERSION, &providers.names());

    // Checkpoints
    let store = Arc::new(FsObjectStore::new(&config.checkpoint.store_root));
    let pipeline = Arc::new(
        CheckpointPipeline::new(store, config.checkpoint.to_config())
            .context("Invalid checkpoint configuration")?
            .with_metrics(metrics.clone())
            .with_logger(logger.clone()),
    );
    if let Err(e) = pipeline.load_catalog().await {
        warn!(error = %e, "Failed to load checkpoint catalog");
        health_registry
            .set_degraded(components::CHECKPOINT, format!("catalog unavailable: {e}"))
            .await;
    }

    // Hibernation
    let detector = Arc::new(config.hibernation.idle_detector());
    let hibernation = Arc::new(
        HibernationManager::new(
            providers.clone(),
            detector.clone(),
            config.hibernation.to_config(),
        )
        .with_checkpoints(pipeline.clone())
        .with_metrics(metrics.clone())
        .with_logger(logger.clone()),
    );
    for machine in &config.machines {
        hibernation
            .configure(machine.machine_ref(), machine.idle.clone())
            .await;
        hibernation.start_monitoring(&machine.machine_id)?;
    }

    // Warm pools
    let warm_pools = Arc::new(
        WarmPoolManager::new(
            providers.clone(),
            WarmPoolManagerConfig {
                check_interval: Duration::from_secs(config.warm_pool.check_interval_secs.max(1)),
                ..Default::default()
            },
        )
        .with_checkpoints(pipeline.clone())
        .with_metrics(metrics.clone())
        .with_logger(logger.clone()),
    );
    let mut pool_errors = 0;
    for pool in &config.warm_pool.pools {
        warm_pools.configure(pool.clone()).await;
        if let Err(e) = warm_pools.start(&pool.machine_id).await {
            warn!(machine_id = %pool.machine_id, error = %e, "Warm pool failed to start");
            pool_errors += 1;
        }
    }
    health_registry
        .report_cycle(components::WARM_POOL, pool_errors)
        .await;

    // Cost optimizer
    let shutdown = CancellationToken::new();
    let optimizer_handle = if config.optimizer.enabled {
        let notifier: Arc<dyn Notifier> = match &config.optimizer.webhook_url {
            Some(url) => Arc::new(
                WebhookNotifier::new(url, Duration::from_secs(10))
                    .context("Invalid optimizer webhook")?,
            ),
            None => Arc::new(LogNotifier),
        };
        let optimizer = Arc::new(
            CostOptimizer::new(providers.clone(), config.optimizer.policy.clone())
                .with_notifier(notifier)
                .with_metrics(metrics.clone())
                .with_health(health_registry.clone())
                .with_logger(logger.clone()),
        );
        Some(tokio::spawn(optimizer.run(shutdown.child_token())))
    } else {
        None
    };

    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        metrics.clone(),
        detector.clone(),
    ));

    // Mark controller as ready after initialization
    health_registry.set_ready(true).await;

    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    health_registry.set_ready(false).await;

    shutdown.cancel();
    hibernation.shutdown();
    warm_pools.shutdown();
    if let Some(handle) = optimizer_handle {
        let _ = handle.await;
    }
    api_handle.abort();

    info!("Shutting down");
    Ok(())
}
