use axum::{
    Json,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::AppState;
use crate::db::EventFilter;
use crate::domain::{OutcomeKind, RuleInput, RuleStatus, TrafficEvent, TrafficEventInput, TrafficRule};
use crate::error::TrackdeskError;
use crate::observability::AuditEntry;
use crate::service::{ProcessedTraffic, RuleTestResult};

/// Edge-resolved client country, e.g. set by a CDN
pub const GEO_COUNTRY_HEADER: &str = "x-geo-country";
/// Free-form operator identity recorded in the audit log
pub const OPERATOR_HEADER: &str = "x-operator-id";

/// Maximum page size for list endpoints
const MAX_PAGE_LIMIT: u32 = 1000;
const MAX_STRING_LEN: usize = 1024;

// Response types

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    version: String,
    uptime_seconds: u64,
    active_rules: Option<u32>,
    storage: String,
    fail_policy: String,
}

#[derive(Serialize)]
pub struct EventsListResponse {
    events: Vec<TrafficEvent>,
    count: usize,
}

#[derive(Serialize)]
pub struct RulesListResponse {
    rules: Vec<TrafficRule>,
    count: usize,
    total: u32,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_seconds: Option<u32>,
}

// Request types

#[derive(Deserialize)]
pub struct PageQuery {
    limit: Option<u32>,
    offset: Option<u32>,
}

#[derive(Deserialize)]
pub struct ListEventsQuery {
    action: Option<String>,
    rule_id: Option<Uuid>,
    ip: Option<String>,
    limit: Option<u32>,
    offset: Option<u32>,
}

#[derive(Deserialize)]
pub struct ListRulesQuery {
    status: Option<String>,
    limit: Option<u32>,
    offset: Option<u32>,
}

#[derive(Deserialize)]
pub struct TestRuleRequest {
    rule: RuleInput,
    event: TrafficEventInput,
}

#[derive(Deserialize)]
pub struct SetStatusRequest {
    status: RuleStatus,
}

fn clamp_limit(limit: Option<u32>) -> u32 {
    limit.unwrap_or(100).min(MAX_PAGE_LIMIT)
}

fn validate_string_len(value: &str, field: &str, max: usize) -> Result<(), TrackdeskError> {
    if value.len() > max {
        Err(TrackdeskError::InvalidRequest(format!(
            "{} exceeds maximum length of {} characters",
            field, max
        )))
    } else {
        Ok(())
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

fn operator_id(headers: &HeaderMap) -> Result<Option<String>, TrackdeskError> {
    let operator = header_value(headers, OPERATOR_HEADER);
    if let Some(op) = &operator {
        validate_string_len(op, OPERATOR_HEADER, 64)?;
    }
    Ok(operator)
}

fn parse_status(status: Option<&str>) -> Result<Option<RuleStatus>, TrackdeskError> {
    status
        .map(str::parse::<RuleStatus>)
        .transpose()
        .map_err(TrackdeskError::InvalidRequest)
}

// Handlers

/// Liveness plus a cheap rule count
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let active_rules = state.service.count_rules(Some(RuleStatus::Active)).await.ok();
    let status = if active_rules.is_some() && !state.is_shutting_down() {
        "ok"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        active_rules,
        storage: state.settings.storage.driver.as_str().to_string(),
        fail_policy: state.service.fail_policy().as_str().to_string(),
    })
}

pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if let Some(pool) = &state.db_pool {
        crate::observability::update_db_pool_metrics(pool);
    }
    crate::observability::gather_metrics()
}

/// Decide one inbound request
pub async fn process_traffic(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(input): Json<TrafficEventInput>,
) -> Result<Json<ProcessedTraffic>, AppError> {
    if state.is_shutting_down() {
        return Err(AppError(TrackdeskError::ShuttingDown));
    }

    if input.ip_address.trim().is_empty() {
        return Err(AppError(TrackdeskError::InvalidRequest(
            "ipAddress is required".into(),
        )));
    }
    validate_string_len(&input.ip_address, "ipAddress", 45)?;
    validate_string_len(&input.user_agent, "userAgent", MAX_STRING_LEN)?;

    let edge_country = header_value(&headers, GEO_COUNTRY_HEADER);
    if let Some(country) = &edge_country {
        validate_string_len(country, GEO_COUNTRY_HEADER, 8)?;
    }

    let processed = state.service.process(input, edge_country).await?;
    Ok(Json(processed))
}

/// Preview a candidate rule against a sample event
pub async fn test_rule(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<TestRuleRequest>,
) -> Result<Json<RuleTestResult>, AppError> {
    let edge_country = header_value(&headers, GEO_COUNTRY_HEADER);
    let result = state
        .service
        .test_rule(request.rule, request.event, edge_country)?;
    Ok(Json(result))
}

pub async fn list_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListEventsQuery>,
) -> Result<Json<EventsListResponse>, AppError> {
    let action = query
        .action
        .as_deref()
        .map(|a| a.to_ascii_uppercase().parse::<OutcomeKind>())
        .transpose()
        .map_err(TrackdeskError::InvalidRequest)?;

    let filter = EventFilter {
        action,
        rule_id: query.rule_id,
        ip: query.ip,
    };

    let events = state
        .service
        .list_events(&filter, clamp_limit(query.limit), query.offset.unwrap_or(0))
        .await?;

    let count = events.len();
    Ok(Json(EventsListResponse { events, count }))
}

pub async fn get_event(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<TrafficEvent>, AppError> {
    Ok(Json(state.service.get_event(id).await?))
}

pub async fn list_rules(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListRulesQuery>,
) -> Result<Json<RulesListResponse>, AppError> {
    let status = parse_status(query.status.as_deref())?;

    let rules = state
        .service
        .list_rules(status, clamp_limit(query.limit), query.offset.unwrap_or(0))
        .await?;
    let total = state.service.count_rules(status).await?;

    let count = rules.len();
    Ok(Json(RulesListResponse { rules, count, total }))
}

pub async fn create_rule(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(input): Json<RuleInput>,
) -> Result<(StatusCode, Json<TrafficRule>), AppError> {
    let operator = operator_id(&headers)?;
    let rule = state.service.create_rule(input, operator.as_deref()).await?;
    Ok((StatusCode::CREATED, Json(rule)))
}

pub async fn get_rule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<TrafficRule>, AppError> {
    Ok(Json(state.service.get_rule(id).await?))
}

pub async fn update_rule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(input): Json<RuleInput>,
) -> Result<Json<TrafficRule>, AppError> {
    let operator = operator_id(&headers)?;
    let rule = state
        .service
        .update_rule(id, input, operator.as_deref())
        .await?;
    Ok(Json(rule))
}

pub async fn set_rule_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<SetStatusRequest>,
) -> Result<Json<TrafficRule>, AppError> {
    let operator = operator_id(&headers)?;
    let rule = state
        .service
        .set_rule_status(id, request.status, operator.as_deref())
        .await?;
    Ok(Json(rule))
}

pub async fn delete_rule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<StatusCode, AppError> {
    let operator = operator_id(&headers)?;
    state.service.delete_rule(id, operator.as_deref()).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_audit(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Vec<AuditEntry>>, AppError> {
    let entries = state
        .service
        .list_audit(clamp_limit(query.limit), query.offset.unwrap_or(0))
        .await?;
    Ok(Json(entries))
}

// Error handling

pub struct AppError(pub TrackdeskError);

impl From<TrackdeskError> for AppError {
    fn from(err: TrackdeskError) -> Self {
        Self(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = self.0.status_code();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self.0, "request failed");
        }

        let body = Json(ErrorResponse {
            error: self.0.to_string(),
            retry_after_seconds: match &self.0 {
                TrackdeskError::RateLimited {
                    retry_after_seconds,
                } => Some(*retry_after_seconds),
                _ => None,
            },
        });
        (status, body).into_response()
    }
}
