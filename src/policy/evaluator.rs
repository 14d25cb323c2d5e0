use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::condition::evaluate_condition;
use super::resolver::FieldResolver;
use crate::domain::{ConditionOperator, TrafficRule};
use crate::error::Result;

/// Outcome of one active condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionTrace {
    pub field: String,
    pub operator: ConditionOperator,
    pub expected_value: Value,
    /// `null` when the field did not resolve
    pub actual_value: Value,
    pub met: bool,
}

/// Outcome of one rule. Rules after the deciding match carry `skipped` and an
/// empty condition trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleTrace {
    pub rule_id: Uuid,
    pub rule_name: String,
    pub priority: i32,
    pub matched: bool,
    #[serde(default)]
    pub skipped: bool,
    pub condition_trace: Vec<ConditionTrace>,
}

impl RuleTrace {
    pub fn skipped(rule: &TrafficRule) -> Self {
        Self {
            rule_id: rule.id,
            rule_name: rule.name.clone(),
            priority: rule.priority,
            matched: false,
            skipped: true,
            condition_trace: Vec::new(),
        }
    }
}

/// AND over the rule's active conditions. Every active condition is traced
/// even after one fails; a rule with none matches vacuously.
pub fn evaluate_rule(rule: &TrafficRule, resolver: &FieldResolver<'_>) -> Result<RuleTrace> {
    let mut condition_trace = Vec::with_capacity(rule.conditions.len());
    let mut matched = true;

    for condition in rule.active_conditions() {
        let actual = resolver.resolve(&condition.field)?;
        let met = evaluate_condition(condition, actual.as_ref());
        matched &= met;

        condition_trace.push(ConditionTrace {
            field: condition.field.clone(),
            operator: condition.operator,
            expected_value: condition.value.clone(),
            actual_value: actual.unwrap_or(Value::Null),
            met,
        });
    }

    Ok(RuleTrace {
        rule_id: rule.id,
        rule_name: rule.name.clone(),
        priority: rule.priority,
        matched,
        skipped: false,
        condition_trace,
    })
}
