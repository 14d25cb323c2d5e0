use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

use super::resolver::{FIELD_AFFILIATE_ID, FIELD_BROWSER, FIELD_OS};
use crate::config::ThrottleConfig;
use crate::domain::{ActionOutcome, ActionType, EventContext, OutcomeKind, RuleType, TrafficAction, TrafficRule};
use crate::quota::QuotaTracker;

pub const PARAM_REDIRECT_URL: &str = "redirectUrl";
pub const PARAM_REQUESTS_PER_WINDOW: &str = "requestsPerWindow";
pub const PARAM_WINDOW_SECONDS: &str = "windowSeconds";
pub const PARAM_KEY: &str = "key";
pub const PARAM_PROVIDER: &str = "provider";
pub const PARAM_CHANNEL: &str = "channel";

/// Turns a decided action into the outcome reported to the caller.
///
/// Only THROTTLE has side effects (it consumes quota). Everything that cannot
/// be carried out fails open to ALLOW.
pub struct ActionExecutor {
    quota: Arc<dyn QuotaTracker>,
    throttle: ThrottleConfig,
}

impl ActionExecutor {
    pub fn new(quota: Arc<dyn QuotaTracker>, throttle: ThrottleConfig) -> Self {
        Self { quota, throttle }
    }

    pub fn tracked_quota_keys(&self) -> usize {
        self.quota.tracked_keys()
    }

    pub fn execute(
        &self,
        action: &TrafficAction,
        rule: Option<&TrafficRule>,
        event: &EventContext,
    ) -> ActionOutcome {
        let rule_name = rule.map(|r| r.name.as_str()).unwrap_or("default");

        match action.action_type {
            ActionType::Allow => ActionOutcome::allow(match rule {
                Some(r) => format!("allowed by rule {}", r.name),
                None => "no rule matched".to_string(),
            }),
            ActionType::Block => {
                let kind = rule.map(refine_block).unwrap_or(OutcomeKind::Block);
                ActionOutcome::new(kind, format!("blocked by rule {}", rule_name))
            }
            ActionType::Redirect => match action.str_parameter(PARAM_REDIRECT_URL) {
                Some(url) if !url.is_empty() => {
                    ActionOutcome::new(OutcomeKind::Redirect, format!("redirected by rule {}", rule_name))
                        .with_extra(PARAM_REDIRECT_URL, Value::String(url.to_string()))
                }
                _ => {
                    tracing::warn!(rule = %rule_name, "redirect action without redirectUrl, allowing");
                    ActionOutcome::allow(format!("rule {} has no redirect target", rule_name))
                }
            },
            ActionType::Throttle => self.throttle(action, rule_name, event),
            ActionType::Captcha => {
                let outcome =
                    ActionOutcome::new(OutcomeKind::Captcha, format!("captcha required by rule {}", rule_name));
                match action.parameters.get(PARAM_PROVIDER) {
                    Some(provider) => outcome.with_extra(PARAM_PROVIDER, provider.clone()),
                    None => outcome,
                }
            }
            ActionType::Notify => {
                let outcome = ActionOutcome::new(OutcomeKind::Notify, format!("flagged by rule {}", rule_name));
                match action.parameters.get(PARAM_CHANNEL) {
                    Some(channel) => outcome.with_extra(PARAM_CHANNEL, channel.clone()),
                    None => outcome,
                }
            }
            ActionType::Unknown => {
                tracing::warn!(rule = %rule_name, "unknown action type, allowing");
                ActionOutcome::allow(format!("rule {} has an unknown action", rule_name))
            }
        }
    }

    fn throttle(&self, action: &TrafficAction, rule_name: &str, event: &EventContext) -> ActionOutcome {
        let limit = action
            .u64_parameter(PARAM_REQUESTS_PER_WINDOW)
            .map(|n| n.min(u32::MAX as u64) as u32)
            .unwrap_or(self.throttle.requests_per_window);
        let window_seconds = action
            .u64_parameter(PARAM_WINDOW_SECONDS)
            .unwrap_or(self.throttle.window_seconds)
            .max(1);

        let key = match action.str_parameter(PARAM_KEY) {
            Some("affiliate") => match &event.affiliate_id {
                Some(affiliate) => format!("affiliate:{}", affiliate),
                None => format!("ip:{}", event.ip_address),
            },
            _ => format!("ip:{}", event.ip_address),
        };

        let status = self
            .quota
            .check(&key, limit, Duration::from_secs(window_seconds));

        if status.limited {
            let retry_after = status.retry_after.as_secs_f64().ceil() as u64;
            tracing::debug!(key = %key, limit, retry_after, "throttle quota exhausted");
            ActionOutcome::new(OutcomeKind::RateLimit, format!("rate limit exceeded for rule {}", rule_name))
                .with_extra("limit", json!(status.limit))
                .with_extra("remaining", json!(0))
                .with_extra("retryAfterSeconds", json!(retry_after))
        } else {
            ActionOutcome::new(OutcomeKind::Throttle, format!("throttled by rule {}", rule_name))
                .with_extra("limit", json!(status.limit))
                .with_extra("remaining", json!(status.remaining))
                .with_extra(PARAM_WINDOW_SECONDS, json!(window_seconds))
        }
    }
}

/// Block outcome for a rule, derived from its type and primary field.
pub fn refine_block(rule: &TrafficRule) -> OutcomeKind {
    match (rule.rule_type, rule.primary_field()) {
        (RuleType::GeoBlocking, _) => OutcomeKind::GeoBlock,
        (RuleType::IpBlocking, _) => OutcomeKind::IpBlock,
        (RuleType::DeviceBlocking, Some(FIELD_BROWSER)) => OutcomeKind::BrowserBlock,
        (RuleType::DeviceBlocking, Some(FIELD_OS)) => OutcomeKind::OsBlock,
        (RuleType::DeviceBlocking, _) => OutcomeKind::DeviceBlock,
        (RuleType::TrafficSource, Some(FIELD_AFFILIATE_ID)) => OutcomeKind::AffiliateBlock,
        _ => OutcomeKind::Block,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ConditionOperator, RuleInput, RuleStatus, TrafficCondition, TrafficEventInput};
    use crate::quota::TokenBucketQuota;

    fn executor() -> ActionExecutor {
        ActionExecutor::new(
            Arc::new(TokenBucketQuota::new(1000)),
            ThrottleConfig {
                requests_per_window: 2,
                window_seconds: 60,
            },
        )
    }

    fn rule(rule_type: RuleType, field: &str, action: TrafficAction) -> TrafficRule {
        TrafficRule::from_input(RuleInput {
            name: "r".into(),
            description: None,
            rule_type,
            conditions: vec![TrafficCondition::new(field, ConditionOperator::IsNotEmpty, Value::Null)],
            actions: vec![action],
            priority: 0,
            status: RuleStatus::Active,
        })
    }

    fn event() -> EventContext {
        EventContext::from_input(TrafficEventInput {
            ip_address: "192.0.2.1".into(),
            affiliate_id: Some("aff_1".into()),
            ..Default::default()
        })
    }

    #[test]
    fn test_block_refinement() {
        let cases = [
            (RuleType::GeoBlocking, "country", OutcomeKind::GeoBlock),
            (RuleType::IpBlocking, "ip_address", OutcomeKind::IpBlock),
            (RuleType::DeviceBlocking, "browser", OutcomeKind::BrowserBlock),
            (RuleType::DeviceBlocking, "os", OutcomeKind::OsBlock),
            (RuleType::DeviceBlocking, "device_type", OutcomeKind::DeviceBlock),
            (RuleType::TrafficSource, "affiliate_id", OutcomeKind::AffiliateBlock),
            (RuleType::TrafficSource, "referrer", OutcomeKind::Block),
            (RuleType::TimeBased, "hour_of_day", OutcomeKind::Block),
        ];
        let executor = executor();
        for (rule_type, field, expected) in cases {
            let block = TrafficAction::new(ActionType::Block);
            let rule = rule(rule_type, field, block.clone());
            let outcome = executor.execute(&block, Some(&rule), &event());
            assert_eq!(outcome.action, expected, "{} / {}", rule_type, field);
        }
    }

    #[test]
    fn test_redirect_requires_url() {
        let executor = executor();
        let with_url = TrafficAction::new(ActionType::Redirect)
            .with_parameter(PARAM_REDIRECT_URL, json!("https://example.com/lp"));
        let outcome = executor.execute(&with_url, None, &event());
        assert_eq!(outcome.action, OutcomeKind::Redirect);
        assert_eq!(outcome.extra.unwrap()["redirectUrl"], "https://example.com/lp");

        let without = TrafficAction::new(ActionType::Redirect);
        assert_eq!(executor.execute(&without, None, &event()).action, OutcomeKind::Allow);
    }

    #[test]
    fn test_throttle_turns_into_rate_limit_when_exhausted() {
        let executor = executor();
        let throttle = TrafficAction::new(ActionType::Throttle);

        let first = executor.execute(&throttle, None, &event());
        assert_eq!(first.action, OutcomeKind::Throttle);
        assert_eq!(first.extra.as_ref().unwrap()["limit"], 2);
        assert_eq!(first.extra.as_ref().unwrap()["remaining"], 1);

        assert_eq!(executor.execute(&throttle, None, &event()).action, OutcomeKind::Throttle);

        let limited = executor.execute(&throttle, None, &event());
        assert_eq!(limited.action, OutcomeKind::RateLimit);
        let extra = limited.extra.unwrap();
        assert_eq!(extra["remaining"], 0);
        assert!(extra["retryAfterSeconds"].as_u64().unwrap() >= 1);
    }

    #[test]
    fn test_throttle_parameters_and_affiliate_key() {
        let executor = executor();
        let throttle = TrafficAction::new(ActionType::Throttle)
            .with_parameter(PARAM_REQUESTS_PER_WINDOW, json!(1))
            .with_parameter(PARAM_WINDOW_SECONDS, json!(30))
            .with_parameter(PARAM_KEY, json!("affiliate"));

        let first = executor.execute(&throttle, None, &event());
        assert_eq!(first.extra.unwrap()["windowSeconds"], 30);

        // same affiliate from another IP shares the budget
        let mut other_ip = event();
        other_ip.ip_address = "192.0.2.99".into();
        assert_eq!(executor.execute(&throttle, None, &other_ip).action, OutcomeKind::RateLimit);
    }

    #[test]
    fn test_passthrough_parameters() {
        let executor = executor();
        let captcha = TrafficAction::new(ActionType::Captcha).with_parameter(PARAM_PROVIDER, json!("hcaptcha"));
        let outcome = executor.execute(&captcha, None, &event());
        assert_eq!(outcome.action, OutcomeKind::Captcha);
        assert_eq!(outcome.extra.unwrap()["provider"], "hcaptcha");

        let notify = TrafficAction::new(ActionType::Notify).with_parameter(PARAM_CHANNEL, json!("fraud-team"));
        let outcome = executor.execute(&notify, None, &event());
        assert_eq!(outcome.action, OutcomeKind::Notify);
        assert!(outcome.permits_request());
    }

    #[test]
    fn test_unknown_action_fails_open() {
        let outcome = executor().execute(&TrafficAction::new(ActionType::Unknown), None, &event());
        assert_eq!(outcome.action, OutcomeKind::Allow);
    }
}
