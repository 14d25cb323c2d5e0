use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::broadcast;

use crate::api::RateLimiter;
use crate::config::Settings;
use crate::service::TrafficService;

/// Shared application state
pub struct AppState {
    pub settings: Settings,
    pub service: TrafficService,
    pub traffic_limiter: Arc<RateLimiter>,
    pub db_pool: Option<sqlx::PgPool>,
    pub start_time: Instant,
    pub shutdown_tx: broadcast::Sender<()>,
    shutting_down: AtomicBool,
}

impl AppState {
    pub fn new(
        settings: Settings,
        service: TrafficService,
        db_pool: Option<sqlx::PgPool>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);

        Arc::new(Self {
            traffic_limiter: RateLimiter::new(settings.http.rate_limit.clone()),
            settings,
            service,
            db_pool,
            start_time: Instant::now(),
            shutdown_tx,
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub fn trigger_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}
