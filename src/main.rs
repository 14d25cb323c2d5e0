use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use trackdesk::AppState;
use trackdesk::api::create_router;
use trackdesk::config::{AppConfig, StorageDriver};
use trackdesk::db::{self, MemoryRepository, Repository, RepositoryTrait};
use trackdesk::geoip::{GeoLocator, NullGeoLocator, PrefixGeoLocator};
use trackdesk::observability::{AuditLogWriter, init_metrics, init_tracing};
use trackdesk::quota::TokenBucketQuota;
use trackdesk::service::TrafficService;

#[derive(Parser)]
#[command(name = "trackdesk", about = "Traffic control rule engine", version)]
struct Cli {
    /// Path to config directory
    #[arg(short, long, env = "TRACKDESK_CONFIG", default_value = "/etc/trackdesk")]
    config: PathBuf,

    /// Override listen address
    #[arg(long, env = "TRACKDESK_LISTEN")]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load(&cli.config)?;
    let settings = config.settings.clone();

    init_tracing(
        settings.observability.log_format,
        &settings.observability.log_level,
    );
    init_metrics();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        storage = settings.storage.driver.as_str(),
        fail_policy = settings.engine.fail_policy.as_str(),
        "starting trackdesk"
    );

    let (repo, pool): (Arc<dyn RepositoryTrait>, Option<sqlx::PgPool>) = match settings.storage.driver {
        StorageDriver::Memory => {
            tracing::info!("using in-memory storage");
            (Arc::new(MemoryRepository::new()), None)
        }
        StorageDriver::Postgres => {
            let connection_string = settings
                .storage
                .connection_string
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("postgres storage requires connection_string"))?;
            tracing::info!("initializing PostgreSQL database");
            let pool = db::init_postgres_pool(connection_string).await?;
            (Arc::new(Repository::new(pool.clone())), Some(pool))
        }
    };

    let geo: Arc<dyn GeoLocator> = if settings.geoip.prefixes.is_empty() {
        Arc::new(NullGeoLocator)
    } else {
        let locator = PrefixGeoLocator::new(&settings.geoip.prefixes)?;
        tracing::info!(prefixes = locator.len(), "loaded geoip prefix table");
        Arc::new(locator)
    };

    let quota = Arc::new(TokenBucketQuota::new(settings.engine.max_quota_keys));

    let mut service = TrafficService::new(repo, geo, quota, &settings);
    if let Some(path) = &settings.observability.audit_log_path {
        let writer = AuditLogWriter::new(path)
            .map_err(|e| anyhow::anyhow!("failed to open audit log {}: {}", path, e))?;
        service = service.with_audit_log(writer);
    }

    let seeded = service.seed_rules(&config.seed_rules).await?;
    if seeded > 0 {
        tracing::info!(count = seeded, "loaded seed rules from {}", trackdesk::config::RULES_FILE);
    }

    let state = AppState::new(settings.clone(), service, pool);
    let listen = cli.listen.unwrap_or_else(|| settings.http.listen.clone());
    let router = create_router(state.clone());

    let listener = tokio::net::TcpListener::bind(&listen).await?;
    tracing::info!(listen = %listen, "HTTP server starting");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;

    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal(state: Arc<AppState>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received, draining in-flight requests");
    state.trigger_shutdown();
}
