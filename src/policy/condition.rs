use regex::Regex;
use serde_json::Value;

use crate::domain::{ConditionOperator, TrafficCondition};
use crate::observability::CONFIG_ERRORS;

/// Evaluate one condition against a resolved field value.
///
/// Never fails: malformed operands and unsupported operators evaluate to
/// `false` and are logged, so one bad condition cannot abort evaluation.
pub fn evaluate_condition(condition: &TrafficCondition, actual: Option<&Value>) -> bool {
    let expected = &condition.value;

    match condition.operator {
        ConditionOperator::Equals => actual.is_some_and(|a| values_equal(a, expected)),
        ConditionOperator::NotEquals => !actual.is_some_and(|a| values_equal(a, expected)),
        ConditionOperator::GreaterThan => match (to_number(actual), to_number(Some(expected))) {
            (Some(a), Some(e)) => a > e,
            _ => false,
        },
        ConditionOperator::LessThan => match (to_number(actual), to_number(Some(expected))) {
            (Some(a), Some(e)) => a < e,
            _ => false,
        },
        ConditionOperator::Contains => contains(actual, expected),
        ConditionOperator::NotContains => !contains(actual, expected),
        ConditionOperator::In => match expected {
            Value::Array(items) => actual.is_some_and(|a| items.iter().any(|i| values_equal(a, i))),
            _ => malformed(condition, "IN requires an array value"),
        },
        ConditionOperator::NotIn => match expected {
            Value::Array(items) => !actual.is_some_and(|a| items.iter().any(|i| values_equal(a, i))),
            _ => malformed(condition, "NOT_IN requires an array value"),
        },
        ConditionOperator::Between => between(condition, actual),
        ConditionOperator::Regex => regex_match(condition, actual),
        ConditionOperator::IsEmpty => is_empty(actual),
        ConditionOperator::IsNotEmpty => !is_empty(actual),
        ConditionOperator::Unsupported => {
            tracing::warn!(field = %condition.field, "unsupported condition operator");
            CONFIG_ERRORS.with_label_values(&["unsupported_operator"]).inc();
            false
        }
    }
}

fn malformed(condition: &TrafficCondition, reason: &str) -> bool {
    tracing::warn!(
        field = %condition.field,
        operator = %condition.operator,
        reason,
        "malformed condition value"
    );
    CONFIG_ERRORS.with_label_values(&["malformed_value"]).inc();
    false
}

fn contains(actual: Option<&Value>, expected: &Value) -> bool {
    actual.is_some_and(|a| coerce_string(a).contains(coerce_string(expected).as_str()))
}

fn between(condition: &TrafficCondition, actual: Option<&Value>) -> bool {
    let bounds = match &condition.value {
        Value::Array(items) if items.len() == 2 => {
            (to_number(items.first()), to_number(items.get(1)))
        }
        _ => return malformed(condition, "BETWEEN requires a two-element array"),
    };

    match (to_number(actual), bounds) {
        (Some(a), (Some(lo), Some(hi))) => lo <= a && a <= hi,
        (_, (None, _)) | (_, (_, None)) => {
            malformed(condition, "BETWEEN bounds must be numeric")
        }
        _ => false,
    }
}

fn regex_match(condition: &TrafficCondition, actual: Option<&Value>) -> bool {
    let Some(pattern) = condition.value.as_str() else {
        return malformed(condition, "REGEX requires a string pattern");
    };

    let re = match Regex::new(pattern) {
        Ok(re) => re,
        Err(e) => {
            tracing::warn!(field = %condition.field, pattern, error = %e, "invalid regex in condition");
            CONFIG_ERRORS.with_label_values(&["invalid_regex"]).inc();
            return false;
        }
    };

    actual.is_some_and(|a| re.is_match(&coerce_string(a)))
}

fn is_empty(actual: Option<&Value>) -> bool {
    match actual {
        None | Some(Value::Null) => true,
        Some(Value::Bool(b)) => !b,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Number(n)) => n.as_f64().is_none_or(|f| f == 0.0 || f.is_nan()),
        Some(Value::Array(_)) | Some(Value::Object(_)) => false,
    }
}

/// Strict equality; numbers compare by value so `1` equals `1.0`.
pub fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(lhs), Value::Number(rhs)) => match (lhs.as_f64(), rhs.as_f64()) {
            (Some(l), Some(r)) => l == r,
            _ => lhs == rhs,
        },
        _ => left == right,
    }
}

/// Numeric coercion. `None` means not-a-number.
pub fn to_number(value: Option<&Value>) -> Option<f64> {
    let n = match value? {
        Value::Null => 0.0,
        Value::Bool(b) => f64::from(u8::from(*b)),
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                0.0
            } else {
                trimmed.parse::<f64>().ok()?
            }
        }
        Value::Array(_) | Value::Object(_) => return None,
    };
    (!n.is_nan()).then_some(n)
}

pub fn coerce_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::Null => String::new(),
                other => coerce_string(other),
            })
            .collect::<Vec<_>>()
            .join(","),
        other => other.to_string(),
    }
}
