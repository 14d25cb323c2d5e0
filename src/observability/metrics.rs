use once_cell::sync::Lazy;
use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramVec, TextEncoder, register_counter_vec,
    register_gauge, register_gauge_vec, register_histogram, register_histogram_vec,
};

// Engine metrics
pub static TRAFFIC_EVALUATIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "trackdesk_traffic_evaluations_total",
        "Total number of traffic events evaluated, by final outcome",
        &["action"]
    )
    .unwrap()
});

pub static RULE_MATCHES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "trackdesk_rule_matches_total",
        "Total number of deciding rule matches",
        &["rule_type"]
    )
    .unwrap()
});

pub static EVALUATION_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "trackdesk_evaluation_latency_seconds",
        "Time spent deciding and executing one traffic event",
        vec![0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25]
    )
    .unwrap()
});

pub static CONFIG_ERRORS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "trackdesk_config_errors_total",
        "Malformed rule configuration encountered during evaluation",
        &["reason"]
    )
    .unwrap()
});

pub static COLLABORATOR_FAILURES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "trackdesk_collaborator_failures_total",
        "Rule store or geo lookup failures while processing traffic",
        &["collaborator", "policy"]
    )
    .unwrap()
});

pub static EVENTS_RECORDED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "trackdesk_events_recorded_total",
        "Traffic event records written",
        &["status"]
    )
    .unwrap()
});

// Notification metrics
pub static NOTIFICATIONS_SENT: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "trackdesk_notifications_sent_total",
        "Total webhook notifications sent",
        &["destination", "status"]
    )
    .unwrap()
});

// Rule administration metrics
pub static RULE_CHANGES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "trackdesk_rule_changes_total",
        "Rule store writes",
        &["operation"]
    )
    .unwrap()
});

pub static RULES_STORED: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "trackdesk_rules_stored",
        "Number of stored rules",
        &["status"]
    )
    .unwrap()
});

pub static QUOTA_KEYS: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "trackdesk_quota_tracked_keys",
        "Throttle buckets currently tracked"
    )
    .unwrap()
});

// Database metrics
pub static ROW_PARSE_ERRORS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "trackdesk_db_row_parse_errors_total",
        "Count of database rows that failed to parse",
        &["table"]
    )
    .unwrap()
});

pub static DB_POOL_SIZE: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "trackdesk_db_pool_connections",
        "Database connection pool size",
        &["state"]
    )
    .unwrap()
});

// HTTP metrics
pub static HTTP_REQUESTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "trackdesk_http_requests_total",
        "Total HTTP requests",
        &["method", "route", "status_class"]
    )
    .unwrap()
});

pub static HTTP_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "trackdesk_http_request_duration_seconds",
        "HTTP request duration in seconds",
        &["method", "route", "status_class"],
        vec![
            0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0
        ]
    )
    .unwrap()
});

pub static HTTP_IN_FLIGHT: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "trackdesk_http_in_flight_requests",
        "In-flight HTTP requests",
        &["method", "route"]
    )
    .unwrap()
});

/// Generate Prometheus metrics output
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Initialize all metrics (forces lazy statics to be created)
pub fn init_metrics() {
    Lazy::force(&TRAFFIC_EVALUATIONS);
    Lazy::force(&RULE_MATCHES);
    Lazy::force(&EVALUATION_LATENCY);
    Lazy::force(&CONFIG_ERRORS);
    Lazy::force(&COLLABORATOR_FAILURES);
    Lazy::force(&EVENTS_RECORDED);
    Lazy::force(&NOTIFICATIONS_SENT);
    Lazy::force(&RULE_CHANGES);
    Lazy::force(&RULES_STORED);
    Lazy::force(&QUOTA_KEYS);
    Lazy::force(&ROW_PARSE_ERRORS);
    Lazy::force(&DB_POOL_SIZE);
    Lazy::force(&HTTP_REQUESTS_TOTAL);
    Lazy::force(&HTTP_REQUEST_DURATION);
    Lazy::force(&HTTP_IN_FLIGHT);
}

/// Update database pool metrics from sqlx pool stats
pub fn update_db_pool_metrics(pool: &sqlx::PgPool) {
    let size = pool.size() as f64;
    let idle = pool.num_idle() as f64;
    let active = size - idle;
    DB_POOL_SIZE.with_label_values(&["active"]).set(active);
    DB_POOL_SIZE.with_label_values(&["idle"]).set(idle);
    DB_POOL_SIZE.with_label_values(&["total"]).set(size);
}
