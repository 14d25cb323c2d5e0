use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use super::ValidationConfig;
use crate::domain::RuleInput;
use crate::validation::RuleValidator;

/// Rules seeded into an empty store at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub rules: Vec<RuleInput>,
}

impl RuleSet {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let rules: RuleSet = serde_yaml::from_str(&content)?;
        Ok(rules)
    }

    /// Validate every seed rule, returning a list of errors (empty = valid).
    pub fn validate(&self, config: &ValidationConfig) -> Vec<String> {
        let validator = RuleValidator::new(config.clone());
        let mut errors = Vec::new();
        let mut names = HashSet::new();

        for (i, rule) in self.rules.iter().enumerate() {
            let ctx = format!("rule[{}] ({:?})", i, rule.name);

            if let Err(e) = validator.validate(rule) {
                errors.push(format!("{}: {}", ctx, e));
            }
            if !rule.name.is_empty() && !names.insert(rule.name.as_str()) {
                errors.push(format!("{}: duplicate name", ctx));
            }
        }

        errors
    }
}
