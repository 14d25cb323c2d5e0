use serde_json::{Value, json};
use std::sync::Arc;

use trackdesk::config::{GeoPrefix, RuleSet, Settings};
use trackdesk::db::{EventFilter, MemoryRepository};
use trackdesk::domain::{
    ActionType, ConditionOperator, EventContext, OutcomeKind, RuleInput, RuleStatus, RuleType,
    TrafficAction, TrafficCondition, TrafficEventInput, TrafficRule,
};
use trackdesk::geoip::PrefixGeoLocator;
use trackdesk::policy::RuleEngine;
use trackdesk::quota::TokenBucketQuota;
use trackdesk::service::TrafficService;

const CN_IP: &str = "1.0.1.20";
const US_IP: &str = "8.8.8.8";

fn geo() -> Arc<PrefixGeoLocator> {
    let prefixes = vec![
        GeoPrefix {
            prefix: "1.0.1.0/24".into(),
            country: "CN".into(),
        },
        GeoPrefix {
            prefix: "8.8.8.0/24".into(),
            country: "us".into(),
        },
    ];
    Arc::new(PrefixGeoLocator::new(&prefixes).unwrap())
}

fn settings() -> Settings {
    serde_yaml::from_str(
        r#"
http:
  listen: "127.0.0.1:0"
storage:
  driver: memory
engine:
  throttle:
    requests_per_window: 2
    window_seconds: 60
"#,
    )
    .unwrap()
}

fn service() -> TrafficService {
    TrafficService::new(
        Arc::new(MemoryRepository::new()),
        geo(),
        Arc::new(TokenBucketQuota::new(1000)),
        &settings(),
    )
}

fn rule_input(
    name: &str,
    rule_type: RuleType,
    priority: i32,
    conditions: Vec<TrafficCondition>,
    action: TrafficAction,
) -> RuleInput {
    RuleInput {
        name: name.into(),
        description: None,
        rule_type,
        conditions,
        actions: vec![action],
        priority,
        status: RuleStatus::Active,
    }
}

fn event(ip: &str) -> TrafficEventInput {
    TrafficEventInput {
        ip_address: ip.into(),
        ..Default::default()
    }
}

fn context(ip: &str) -> EventContext {
    EventContext::from_input(event(ip))
}

#[test]
fn test_country_rule_blocks_only_matching_country() {
    let engine = RuleEngine::new(geo());
    let rule = TrafficRule::from_input(rule_input(
        "block-cn",
        RuleType::GeoBlocking,
        0,
        vec![TrafficCondition::new("country", ConditionOperator::Equals, json!("CN"))],
        TrafficAction::new(ActionType::Block),
    ));
    let rules = vec![rule.clone()];

    let decision = engine.decide(&rules, &context(CN_IP)).unwrap();
    assert_eq!(decision.action, ActionType::Block);
    assert_eq!(decision.matched_rule_id, Some(rule.id));
    assert_eq!(decision.rule_trace[0].condition_trace[0].actual_value, json!("CN"));

    let decision = engine.decide(&rules, &context(US_IP)).unwrap();
    assert_eq!(decision.action, ActionType::Allow);
    assert_eq!(decision.matched_rule_id, None);
    assert_eq!(decision.rule_trace[0].condition_trace[0].actual_value, json!("US"));
    assert!(!decision.rule_trace[0].matched);
}

#[test]
fn test_specific_block_wins_over_catch_all_allow() {
    let engine = RuleEngine::new(geo());
    let block = TrafficRule::from_input(rule_input(
        "block-ip",
        RuleType::IpBlocking,
        5,
        vec![TrafficCondition::new("ip_address", ConditionOperator::Equals, json!("1.2.3.4"))],
        TrafficAction::new(ActionType::Block),
    ));
    let allow_all = TrafficRule::from_input(rule_input(
        "allow-all",
        RuleType::TrafficSource,
        10,
        vec![],
        TrafficAction::allow(),
    ));
    // store order deliberately reversed
    let rules = vec![allow_all.clone(), block.clone()];

    let decision = engine.decide(&rules, &context("1.2.3.4")).unwrap();
    assert_eq!(decision.action, ActionType::Block);
    assert_eq!(decision.matched_rule_id, Some(block.id));
    assert_eq!(decision.rule_trace.len(), 2);
    assert!(decision.rule_trace[1].skipped);

    let decision = engine.decide(&rules, &context("5.6.7.8")).unwrap();
    assert_eq!(decision.action, ActionType::Allow);
    assert_eq!(decision.matched_rule_id, Some(allow_all.id));
    assert!(decision.rule_trace[1].matched);
    assert!(decision.rule_trace[1].condition_trace.is_empty());
}

#[test]
fn test_decide_is_deterministic() {
    let engine = RuleEngine::new(geo());
    let rules: Vec<TrafficRule> = (0..4)
        .map(|i| {
            TrafficRule::from_input(rule_input(
                &format!("rule-{}", i),
                RuleType::TrafficSource,
                i % 2,
                vec![TrafficCondition::new(
                    "campaign.id",
                    ConditionOperator::Equals,
                    json!(format!("c{}", i)),
                )],
                TrafficAction::new(ActionType::Block),
            ))
        })
        .collect();

    let input = TrafficEventInput {
        ip_address: US_IP.into(),
        data: json!({"campaign": {"id": "c3"}}),
        ..Default::default()
    };
    let ctx = EventContext::from_input(input);

    let first = engine.decide(&rules, &ctx).unwrap();
    for _ in 0..10 {
        assert_eq!(engine.decide(&rules, &ctx).unwrap(), first);
    }
    assert_eq!(first.matched_rule_id, Some(rules[3].id));
}

#[test]
fn test_inactive_conditions_are_absent_from_trace() {
    let engine = RuleEngine::new(geo());
    let rule = TrafficRule::from_input(rule_input(
        "cn-desktop",
        RuleType::GeoBlocking,
        0,
        vec![
            TrafficCondition::new("country", ConditionOperator::Equals, json!("CN")),
            TrafficCondition::new("device_type", ConditionOperator::Equals, json!("MOBILE")).inactive(),
        ],
        TrafficAction::new(ActionType::Block),
    ));

    let decision = engine.decide(&[rule], &context(CN_IP)).unwrap();
    assert_eq!(decision.action, ActionType::Block);
    let trace = &decision.rule_trace[0].condition_trace;
    assert_eq!(trace.len(), 1);
    assert_eq!(trace[0].field, "country");
}

#[test]
fn test_malformed_rule_does_not_stop_evaluation() {
    let engine = RuleEngine::new(geo());
    let broken = TrafficRule::from_input(rule_input(
        "broken",
        RuleType::TrafficSource,
        0,
        vec![TrafficCondition::new("referrer", ConditionOperator::Regex, json!("(unclosed"))],
        TrafficAction::new(ActionType::Block),
    ));
    let unsupported = TrafficRule::from_input(rule_input(
        "unsupported",
        RuleType::TrafficSource,
        1,
        vec![TrafficCondition::new("ip_address", ConditionOperator::Unsupported, json!(US_IP))],
        TrafficAction::new(ActionType::Block),
    ));
    let catch_all = TrafficRule::from_input(rule_input(
        "flag",
        RuleType::TrafficSource,
        2,
        vec![],
        TrafficAction::new(ActionType::Notify),
    ));

    let input = TrafficEventInput {
        ip_address: US_IP.into(),
        referrer: Some("https://ads.example.com".into()),
        ..Default::default()
    };
    let decision = engine
        .decide(&[broken, unsupported, catch_all.clone()], &EventContext::from_input(input))
        .unwrap();

    assert_eq!(decision.action, ActionType::Notify);
    assert_eq!(decision.matched_rule_id, Some(catch_all.id));
    assert!(!decision.rule_trace[0].matched);
    assert!(!decision.rule_trace[1].matched);
}

#[tokio::test]
async fn test_process_records_refined_outcome() {
    let service = service();
    let rule = service
        .create_rule(
            rule_input(
                "block-cn",
                RuleType::GeoBlocking,
                0,
                vec![TrafficCondition::new("country", ConditionOperator::Equals, json!("CN"))],
                TrafficAction::new(ActionType::Block),
            ),
            Some("ops"),
        )
        .await
        .unwrap();

    let processed = service.process(event(CN_IP), None).await.unwrap();
    assert_eq!(processed.decision.action, ActionType::Block);
    assert_eq!(processed.outcome.action, OutcomeKind::GeoBlock);
    assert_eq!(processed.event.rule_id, Some(rule.id));
    assert_eq!(processed.event.country.as_deref(), Some("CN"));

    let allowed = service.process(event(US_IP), None).await.unwrap();
    assert_eq!(allowed.outcome.action, OutcomeKind::Allow);
    assert_eq!(allowed.event.rule_id, None);

    let blocked = service
        .list_events(
            &EventFilter {
                action: Some(OutcomeKind::GeoBlock),
                ..Default::default()
            },
            100,
            0,
        )
        .await
        .unwrap();
    assert_eq!(blocked.len(), 1);
    assert_eq!(blocked[0].id, processed.event.id);

    let all = service
        .list_events(&EventFilter::default(), 100, 0)
        .await
        .unwrap();
    assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn test_edge_country_does_not_override_payload_country() {
    let service = service();
    service
        .create_rule(
            rule_input(
                "block-de",
                RuleType::GeoBlocking,
                0,
                vec![TrafficCondition::new("country", ConditionOperator::Equals, json!("DE"))],
                TrafficAction::new(ActionType::Block),
            ),
            None,
        )
        .await
        .unwrap();

    let processed = service
        .process(event(US_IP), Some("DE".into()))
        .await
        .unwrap();
    assert_eq!(processed.outcome.action, OutcomeKind::GeoBlock);

    let input = TrafficEventInput {
        ip_address: US_IP.into(),
        country: Some("FR".into()),
        ..Default::default()
    };
    let processed = service.process(input, Some("DE".into())).await.unwrap();
    assert_eq!(processed.outcome.action, OutcomeKind::Allow);
    assert_eq!(processed.event.country.as_deref(), Some("FR"));
}

#[tokio::test]
async fn test_throttle_escalates_to_rate_limit() {
    let service = service();
    service
        .create_rule(
            rule_input(
                "throttle-affiliates",
                RuleType::RateLimiting,
                0,
                vec![TrafficCondition::new("affiliate_id", ConditionOperator::IsNotEmpty, Value::Null)],
                TrafficAction::new(ActionType::Throttle).with_parameter("key", json!("affiliate")),
            ),
            None,
        )
        .await
        .unwrap();

    let input = |ip: &str| TrafficEventInput {
        ip_address: ip.into(),
        affiliate_id: Some("aff-9".into()),
        ..Default::default()
    };

    let first = service.process(input("10.0.0.1"), None).await.unwrap();
    assert_eq!(first.outcome.action, OutcomeKind::Throttle);
    assert_eq!(first.outcome.extra.as_ref().unwrap()["remaining"], 1);

    let second = service.process(input("10.0.0.2"), None).await.unwrap();
    assert_eq!(second.outcome.action, OutcomeKind::Throttle);

    // quota is keyed by affiliate, so a third IP still hits the same bucket
    let third = service.process(input("10.0.0.3"), None).await.unwrap();
    assert_eq!(third.outcome.action, OutcomeKind::RateLimit);
    assert!(third.outcome.extra.unwrap()["retryAfterSeconds"].as_u64().unwrap() >= 1);

    let other = TrafficEventInput {
        ip_address: "10.0.0.4".into(),
        ..Default::default()
    };
    let unaffiliated = service.process(other, None).await.unwrap();
    assert_eq!(unaffiliated.outcome.action, OutcomeKind::Allow);
}

#[tokio::test]
async fn test_device_rules_use_user_agent_heuristics() {
    let service = service();
    service
        .create_rule(
            rule_input(
                "no-tablets",
                RuleType::DeviceBlocking,
                0,
                vec![TrafficCondition::new("device_type", ConditionOperator::Equals, json!("TABLET"))],
                TrafficAction::new(ActionType::Block),
            ),
            None,
        )
        .await
        .unwrap();

    let ipad = TrafficEventInput {
        ip_address: US_IP.into(),
        user_agent: "Mozilla/5.0 (iPad; CPU OS 14_0)".into(),
        ..Default::default()
    };
    let processed = service.process(ipad, None).await.unwrap();
    assert_eq!(processed.outcome.action, OutcomeKind::DeviceBlock);
    assert_eq!(processed.event.device, "TABLET");

    let iphone = TrafficEventInput {
        ip_address: US_IP.into(),
        user_agent: "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0) Mobile/15E148 Safari/604.1".into(),
        ..Default::default()
    };
    let processed = service.process(iphone, None).await.unwrap();
    assert_eq!(processed.outcome.action, OutcomeKind::Allow);
    assert_eq!(processed.event.device, "MOBILE");
    assert_eq!(processed.event.browser, "Safari");
}

#[tokio::test]
async fn test_seed_rules_respect_priority_order() {
    let service = service();
    let seed: RuleSet = serde_yaml::from_str(
        r#"
rules:
  - name: allow-partners
    type: TRAFFIC_SOURCE
    priority: 1
    conditions:
      - field: affiliate_id
        operator: IN
        value: ["partner-1", "partner-2"]
    actions:
      - type: ALLOW
  - name: captcha-unknown-sources
    type: TRAFFIC_SOURCE
    priority: 50
    conditions:
      - field: referrer
        operator: IS_EMPTY
    actions:
      - type: CAPTCHA
        parameters:
          provider: turnstile
"#,
    )
    .unwrap();
    assert_eq!(service.seed_rules(&seed).await.unwrap(), 2);

    let partner = TrafficEventInput {
        ip_address: US_IP.into(),
        affiliate_id: Some("partner-2".into()),
        ..Default::default()
    };
    let processed = service.process(partner, None).await.unwrap();
    assert_eq!(processed.outcome.action, OutcomeKind::Allow);
    assert_eq!(processed.decision.rule_trace.len(), 2);
    assert!(processed.decision.rule_trace[1].skipped);

    let anonymous = event(US_IP);
    let processed = service.process(anonymous, None).await.unwrap();
    assert_eq!(processed.outcome.action, OutcomeKind::Captcha);
    assert_eq!(processed.outcome.extra.unwrap()["provider"], "turnstile");
}
