use regex::Regex;
use serde_json::Value;

use crate::config::ValidationConfig;
use crate::domain::{ActionType, ConditionOperator, RuleInput};
use crate::error::RuleValidationError;
use crate::policy::PARAM_REDIRECT_URL;

/// Write-time checks for rules entering the store.
///
/// The engine tolerates malformed rules at evaluation time; this is where they
/// get rejected instead.
pub struct RuleValidator {
    config: ValidationConfig,
}

impl RuleValidator {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    pub fn validate(&self, rule: &RuleInput) -> Result<(), RuleValidationError> {
        self.validate_name(&rule.name)?;
        self.validate_priority(rule.priority)?;
        self.validate_conditions(rule)?;
        validate_actions(rule)?;
        Ok(())
    }

    fn validate_name(&self, name: &str) -> Result<(), RuleValidationError> {
        if name.trim().is_empty() {
            return Err(RuleValidationError::EmptyName);
        }
        if name.chars().count() > self.config.max_name_len {
            return Err(RuleValidationError::NameTooLong {
                max: self.config.max_name_len,
            });
        }
        Ok(())
    }

    fn validate_priority(&self, priority: i32) -> Result<(), RuleValidationError> {
        if priority < self.config.min_priority || priority > self.config.max_priority {
            return Err(RuleValidationError::PriorityOutOfBounds {
                priority,
                min: self.config.min_priority,
                max: self.config.max_priority,
            });
        }
        Ok(())
    }

    fn validate_conditions(&self, rule: &RuleInput) -> Result<(), RuleValidationError> {
        if rule.conditions.len() > self.config.max_conditions {
            return Err(RuleValidationError::TooManyConditions {
                count: rule.conditions.len(),
                max: self.config.max_conditions,
            });
        }

        for (index, condition) in rule.conditions.iter().enumerate() {
            if condition.field.trim().is_empty() {
                return Err(RuleValidationError::EmptyConditionField { index });
            }

            let invalid = |expected: &str| RuleValidationError::InvalidConditionValue {
                index,
                operator: condition.operator.to_string(),
                expected: expected.to_string(),
            };

            match (condition.operator, &condition.value) {
                (ConditionOperator::Unsupported, _) => {
                    return Err(RuleValidationError::UnsupportedOperator { index });
                }
                (ConditionOperator::In | ConditionOperator::NotIn, value) if !value.is_array() => {
                    return Err(invalid("an array value"));
                }
                (ConditionOperator::Between, Value::Array(bounds))
                    if bounds.len() == 2 && bounds.iter().all(Value::is_number) => {}
                (ConditionOperator::Between, _) => {
                    return Err(invalid("a two-element numeric array"));
                }
                (ConditionOperator::Regex, Value::String(pattern)) => {
                    Regex::new(pattern).map_err(|e| RuleValidationError::InvalidRegex {
                        index,
                        message: e.to_string(),
                    })?;
                }
                (ConditionOperator::Regex, _) => return Err(invalid("a string pattern")),
                _ => {}
            }
        }
        Ok(())
    }
}

fn validate_actions(rule: &RuleInput) -> Result<(), RuleValidationError> {
    let [action] = rule.actions.as_slice() else {
        return Err(RuleValidationError::ActionCount {
            count: rule.actions.len(),
        });
    };

    match action.action_type {
        ActionType::Unknown => Err(RuleValidationError::UnknownAction),
        ActionType::Redirect
            if action
                .str_parameter(PARAM_REDIRECT_URL)
                .is_none_or(|url| url.trim().is_empty()) =>
        {
            Err(RuleValidationError::MissingRedirectUrl)
        }
        _ => Ok(()),
    }
}
