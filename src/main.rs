use idempotency_guard::config::Settings;
use idempotency_guard::idempotency::{store, IdempotencyCleanupJob, IdempotencyEngine};
use idempotency_guard::observability::{init_logging, init_metrics, HealthChecker, LogConfig};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Load configuration
    let settings = Settings::new()?;

    init_logging(&LogConfig::from(&settings.logging));
    let _prometheus = init_metrics();
    info!(
        backend = %settings.idempotency.backend,
        ttl_seconds = settings.idempotency.ttl_seconds,
        fail_open = settings.idempotency.fail_open,
        "Configuration loaded"
    );

    let store = store::connect(&settings).await?;
    info!("Idempotency store connected");

    let health = HealthChecker::new(store.clone(), settings.idempotency.fail_open)
        .check_all()
        .await;
    for dependency in &health.dependencies {
        info!(
            dependency = %dependency.name,
            status = ?dependency.status,
            latency_ms = ?dependency.latency_ms,
            "Dependency health"
        );
    }
    if health.status.is_unhealthy() {
        error!("Idempotency store is unhealthy, refusing to start");
        anyhow::bail!("idempotency store is unhealthy");
    }

    let engine = IdempotencyEngine::new(store);
    let sweep = if settings.idempotency.sweep_interval_seconds > 0 {
        Some(
            IdempotencyCleanupJob::new(engine.clone(), settings.idempotency.sweep_interval_seconds)
                .start(),
        )
    } else {
        None
    };

    info!("Idempotency guard ready");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    if let Some(handle) = sweep {
        handle.abort();
    }

    let snapshot = engine.metrics().snapshot();
    info!(
        total = snapshot.total_requests,
        duplicates = snapshot.duplicate_requests,
        duplicate_rate = snapshot.duplicate_rate(),
        "Idempotency guard stopped"
    );

    Ok(())
}
