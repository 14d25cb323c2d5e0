use axum::{
    Router,
    http::{HeaderName, HeaderValue, Method, header},
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::set_header::SetResponseHeaderLayer;

use super::handlers::{self, GEO_COUNTRY_HEADER, OPERATOR_HEADER};
use super::ratelimit::rate_limit_middleware;
use crate::AppState;

const MAX_BODY_BYTES: usize = 256 * 1024;

fn public_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
}

fn traffic_routes(state: &Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/v1/traffic/process",
            post(handlers::process_traffic)
                .route_layer(from_fn_with_state(state.clone(), rate_limit_middleware)),
        )
        .route("/v1/traffic/test-rule", post(handlers::test_rule))
        .route("/v1/traffic/events", get(handlers::list_events))
        .route("/v1/traffic/events/{id}", get(handlers::get_event))
}

fn admin_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/v1/rules",
            get(handlers::list_rules).post(handlers::create_rule),
        )
        .route(
            "/v1/rules/{id}",
            get(handlers::get_rule)
                .put(handlers::update_rule)
                .delete(handlers::delete_rule),
        )
        .route("/v1/rules/{id}/status", post(handlers::set_rule_status))
        .route("/v1/audit", get(handlers::list_audit))
}

fn cors_layer(state: &AppState) -> CorsLayer {
    let Some(origin) = state.settings.http.cors_origin.as_deref() else {
        return CorsLayer::new();
    };

    match origin.parse::<HeaderValue>() {
        Ok(origin) => CorsLayer::new()
            .allow_origin(origin)
            .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
            .allow_headers([
                header::CONTENT_TYPE,
                HeaderName::from_static(GEO_COUNTRY_HEADER),
                HeaderName::from_static(OPERATOR_HEADER),
            ]),
        Err(_) => {
            tracing::warn!(origin = %origin, "invalid cors_origin, CORS disabled");
            CorsLayer::new()
        }
    }
}

/// Build the full API router
pub fn create_router(state: Arc<AppState>) -> Router {
    let router = public_routes()
        .merge(traffic_routes(&state))
        .merge(admin_routes())
        .with_state(state.clone());

    router
        .layer(from_fn(super::request_id::request_id))
        .layer(from_fn(super::metrics::http_metrics))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(cors_layer(&state))
}
