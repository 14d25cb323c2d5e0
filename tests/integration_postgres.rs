//! Storage tests against a real Postgres. Requires Docker.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;

use common::TestContext;
use trackdesk::db::{AuditStore, EventFilter, EventRecorder, RuleStore};
use trackdesk::domain::{
    ActionType, ConditionOperator, OutcomeKind, RuleStatus, RuleType, TrafficAction,
    TrafficCondition, TrafficRule,
};

async fn body_json(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header("x-operator-id", "integration")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn rule(name: &str, priority: i32) -> TrafficRule {
    let mut rule = TrafficRule::from_input(serde_json::from_value(json!({
        "name": name,
        "type": "TRAFFIC_SOURCE",
        "priority": priority,
        "conditions": [
            {"field": "referrer", "operator": "CONTAINS", "value": "spam"},
            {"field": "campaign.id", "operator": "IN", "value": ["a", "b"], "weight": 2.5, "isActive": false}
        ],
        "actions": [{"type": "REDIRECT", "parameters": {"redirectUrl": "https://example.com/lp"}}]
    }))
    .unwrap());
    rule.description = Some("integration".into());
    rule
}

#[tokio::test]
async fn test_rule_round_trip_keeps_children_in_order() {
    let ctx = TestContext::new().await;

    let stored = rule("spam-referrers", 7);
    ctx.repo.insert_rule(&stored).await.expect("insert rule");

    let loaded = ctx
        .repo
        .get_rule(stored.id)
        .await
        .expect("get rule")
        .expect("rule exists");

    assert_eq!(loaded.name, "spam-referrers");
    assert_eq!(loaded.description.as_deref(), Some("integration"));
    assert_eq!(loaded.rule_type, RuleType::TrafficSource);
    assert_eq!(loaded.priority, 7);
    assert_eq!(loaded.status, RuleStatus::Active);
    assert_eq!(loaded.conditions, stored.conditions);
    assert_eq!(loaded.actions, stored.actions);
    assert!(!loaded.conditions[1].is_active);
    assert_eq!(loaded.conditions[1].weight, 2.5);
}

#[tokio::test]
async fn test_active_rules_are_ordered_by_priority() {
    let ctx = TestContext::new().await;

    let low = rule("low", 50);
    let high = rule("high", 1);
    let mut disabled = rule("disabled", 0);
    disabled.status = RuleStatus::Inactive;

    for r in [&low, &high, &disabled] {
        ctx.repo.insert_rule(r).await.expect("insert rule");
    }

    let active = ctx.repo.list_active_rules().await.expect("list active");
    let names: Vec<&str> = active.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["high", "low"]);

    assert_eq!(ctx.repo.count_rules(None).await.unwrap(), 3);
    assert_eq!(ctx.repo.count_rules(Some(RuleStatus::Inactive)).await.unwrap(), 1);
}

#[tokio::test]
async fn test_update_replaces_children_and_delete_cascades() {
    let ctx = TestContext::new().await;

    let mut stored = rule("replace-me", 3);
    ctx.repo.insert_rule(&stored).await.expect("insert rule");

    stored.conditions = vec![TrafficCondition::new(
        "os",
        ConditionOperator::Equals,
        json!("Linux"),
    )];
    stored.actions = vec![TrafficAction::new(ActionType::Block)];
    assert!(ctx.repo.update_rule(&stored).await.expect("update rule"));

    let loaded = ctx.repo.get_rule(stored.id).await.unwrap().unwrap();
    assert_eq!(loaded.conditions.len(), 1);
    assert_eq!(loaded.conditions[0].field, "os");
    assert_eq!(loaded.actions[0].action_type, ActionType::Block);

    assert!(ctx.repo.delete_rule(stored.id).await.unwrap());
    assert!(ctx.repo.get_rule(stored.id).await.unwrap().is_none());
    assert!(!ctx.repo.delete_rule(stored.id).await.unwrap());

    let mut missing = rule("missing", 1);
    missing.id = Uuid::new_v4();
    assert!(!ctx.repo.update_rule(&missing).await.unwrap());
}

#[tokio::test]
async fn test_process_over_http_persists_event() {
    let ctx = TestContext::new().await;
    let app = ctx.router();

    let response = app
        .clone()
        .oneshot(post_json(
            "/v1/rules",
            json!({
                "name": "block-kp",
                "type": "GEO_BLOCKING",
                "priority": 0,
                "conditions": [{"field": "country", "operator": "EQUALS", "value": "KP"}],
                "actions": [{"type": "BLOCK"}]
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = body_json(response).await;
    let rule_id: Uuid = created["id"].as_str().unwrap().parse().unwrap();

    let response = app
        .clone()
        .oneshot(post_json(
            "/v1/traffic/process",
            json!({
                "ipAddress": "203.0.113.9",
                "userAgent": "Mozilla/5.0 (X11; Linux x86_64) Firefox/125",
                "data": {"campaign": {"id": "spring"}},
                "clickId": "clk-1"
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let processed = body_json(response).await;
    assert_eq!(processed["outcome"]["action"], "GEO_BLOCK");

    let events = ctx
        .repo
        .list_events(
            &EventFilter {
                rule_id: Some(rule_id),
                ..Default::default()
            },
            10,
            0,
        )
        .await
        .expect("list events");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].action, OutcomeKind::GeoBlock);
    assert_eq!(events[0].country.as_deref(), Some("KP"));
    assert_eq!(events[0].browser, "Firefox");
    assert_eq!(events[0].os, "Linux");
    assert_eq!(events[0].click_id.as_deref(), Some("clk-1"));
    assert_eq!(events[0].data["campaign"]["id"], "spring");

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/v1/traffic/events/{}", events[0].id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let audit = ctx.repo.list_audit(10, 0).await.expect("list audit");
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].action, "rule_create");
    assert_eq!(audit[0].actor_id.as_deref(), Some("integration"));
}

#[tokio::test]
async fn test_unmatched_traffic_is_recorded_as_allow() {
    let ctx = TestContext::new().await;
    let app = ctx.router();

    let response = app
        .oneshot(post_json(
            "/v1/traffic/process",
            json!({"ipAddress": "198.51.100.20"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let events = ctx
        .repo
        .list_events(
            &EventFilter {
                ip: Some("198.51.100.20".into()),
                ..Default::default()
            },
            10,
            0,
        )
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].action, OutcomeKind::Allow);
    assert_eq!(events[0].rule_id, None);
    assert_eq!(events[0].country.as_deref(), Some("US"));
}

#[tokio::test]
async fn test_health_reports_postgres() {
    let ctx = TestContext::new().await;

    let response = ctx
        .router()
        .oneshot(
            Request::builder()
                .uri("/v1/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["storage"], "postgres");
}
