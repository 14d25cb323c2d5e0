use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use super::handlers::AppError;
use crate::AppState;
use crate::config::RateLimitConfig;
use crate::error::TrackdeskError;

/// Global token bucket guarding traffic ingestion
pub struct RateLimiter {
    config: RateLimitConfig,
    state: Mutex<RateLimiterState>,
}

struct RateLimiterState {
    tokens: f64,
    last_update: Instant,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RateLimiterState {
                tokens: config.burst as f64,
                last_update: Instant::now(),
            }),
            config,
        })
    }

    pub async fn check(&self) -> Result<(), Duration> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_update);

        let per_second = self.config.events_per_second.max(1) as f64;
        state.tokens = (state.tokens + elapsed.as_secs_f64() * per_second).min(self.config.burst as f64);
        state.last_update = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::from_secs_f64((1.0 - state.tokens) / per_second))
        }
    }
}

/// Rejects traffic submissions once the ingestion budget is spent
pub async fn rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    match state.traffic_limiter.check().await {
        Ok(()) => next.run(request).await,
        Err(wait_time) => {
            let retry_after_seconds = wait_time.as_secs().max(1) as u32;
            tracing::warn!(retry_after_seconds, "traffic ingestion rate limit exceeded");
            AppError(TrackdeskError::RateLimited { retry_after_seconds }).into_response()
        }
    }
}
