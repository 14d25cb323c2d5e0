use std::sync::Arc;
use testcontainers::{ContainerAsync, ImageExt, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;

use trackdesk::AppState;
use trackdesk::config::{
    GeoIpConfig, GeoPrefix, HttpConfig, LogFormat, ObservabilityConfig, RateLimitConfig,
    Settings, StorageConfig, StorageDriver,
};
use trackdesk::db::{Repository, RepositoryTrait, init_postgres_pool};
use trackdesk::geoip::PrefixGeoLocator;
use trackdesk::quota::TokenBucketQuota;
use trackdesk::service::TrafficService;

pub struct TestContext {
    pub state: Arc<AppState>,
    pub repo: Arc<dyn RepositoryTrait>,
    _container: ContainerAsync<Postgres>,
}

impl TestContext {
    pub async fn new() -> Self {
        let container = Postgres::default()
            .with_tag("16-alpine")
            .start()
            .await
            .expect("Failed to start Postgres container");

        let host = container.get_host().await.expect("Failed to get host");
        let port = container
            .get_host_port_ipv4(5432)
            .await
            .expect("Failed to get port");

        let connection_string = format!(
            "postgres://postgres:postgres@{}:{}/postgres",
            host, port
        );

        let pool = init_postgres_pool(&connection_string)
            .await
            .expect("Failed to init pool");

        let repo: Arc<dyn RepositoryTrait> = Arc::new(Repository::new(pool.clone()));

        let mut settings = test_settings();
        settings.storage.connection_string = Some(connection_string);

        let geo = PrefixGeoLocator::new(&settings.geoip.prefixes).expect("Failed to load prefixes");
        let service = TrafficService::new(
            repo.clone(),
            Arc::new(geo),
            Arc::new(TokenBucketQuota::new(settings.engine.max_quota_keys)),
            &settings,
        );

        let state = AppState::new(settings, service, Some(pool));

        Self {
            state,
            repo,
            _container: container,
        }
    }

    pub fn router(&self) -> axum::Router {
        trackdesk::api::create_router(self.state.clone())
    }
}

pub fn test_settings() -> Settings {
    Settings {
        http: HttpConfig {
            listen: "127.0.0.1:0".to_string(),
            rate_limit: RateLimitConfig::default(),
            cors_origin: None,
        },
        engine: Default::default(),
        validation: Default::default(),
        geoip: GeoIpConfig {
            prefixes: vec![
                GeoPrefix {
                    prefix: "203.0.113.0/24".to_string(),
                    country: "KP".to_string(),
                },
                GeoPrefix {
                    prefix: "198.51.100.0/24".to_string(),
                    country: "US".to_string(),
                },
            ],
        },
        storage: StorageConfig {
            driver: StorageDriver::Postgres,
            connection_string: None, // set by TestContext
        },
        observability: ObservabilityConfig {
            log_format: LogFormat::Pretty,
            log_level: "info".to_string(),
            audit_log_path: None,
        },
        notifications: Default::default(),
    }
}
