mod condition;
mod evaluator;
mod executor;
pub mod resolver;
pub mod user_agent;

pub use condition::*;
pub use evaluator::*;
pub use executor::*;
pub use resolver::{FieldResolver, lookup_path};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::{ActionType, EventContext, TrafficRule};
use crate::error::Result;
use crate::geoip::GeoLocator;

/// What the engine decided for one event, with the full evaluation trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub action: ActionType,
    pub matched_rule_id: Option<Uuid>,
    pub rule_trace: Vec<RuleTrace>,
}

/// Stateless first-match rule engine.
///
/// Rules are supplied per call as a snapshot, so concurrent evaluations never
/// share mutable state. The only collaborator is the read-only geo port.
pub struct RuleEngine {
    geo: Arc<dyn GeoLocator>,
}

impl RuleEngine {
    pub fn new(geo: Arc<dyn GeoLocator>) -> Self {
        Self { geo }
    }

    pub fn resolver<'a>(&'a self, event: &'a EventContext) -> FieldResolver<'a> {
        FieldResolver::new(event, self.geo.as_ref())
    }

    pub fn evaluate_rule(&self, rule: &TrafficRule, event: &EventContext) -> Result<RuleTrace> {
        evaluate_rule(rule, &self.resolver(event))
    }

    pub fn decide(&self, rules: &[TrafficRule], event: &EventContext) -> Result<Decision> {
        self.decide_with(rules, &self.resolver(event))
    }

    /// Like [`decide`](Self::decide) but reuses a caller-owned resolver, so
    /// derived attributes computed during evaluation can be read afterwards.
    pub fn decide_with(
        &self,
        rules: &[TrafficRule],
        resolver: &FieldResolver<'_>,
    ) -> Result<Decision> {
        let mut active: Vec<&TrafficRule> = rules.iter().filter(|r| r.is_active()).collect();
        // stable: equal priorities keep store order
        active.sort_by_key(|r| r.priority);

        let mut rule_trace = Vec::with_capacity(active.len());
        let mut decided: Option<&TrafficRule> = None;

        for rule in active {
            if decided.is_some() {
                rule_trace.push(RuleTrace::skipped(rule));
                continue;
            }

            let trace = evaluate_rule(rule, resolver)?;
            if trace.matched {
                decided = Some(rule);
            }
            rule_trace.push(trace);
        }

        let decision = match decided {
            Some(rule) => {
                let action = rule
                    .resolved_action()
                    .map(|a| a.action_type)
                    .unwrap_or(ActionType::Allow);
                tracing::debug!(rule_id = %rule.id, rule = %rule.name, action = %action, "rule matched");
                Decision {
                    action,
                    matched_rule_id: Some(rule.id),
                    rule_trace,
                }
            }
            None => Decision {
                action: ActionType::Allow,
                matched_rule_id: None,
                rule_trace,
            },
        };

        Ok(decision)
    }
}
