mod rules;
mod settings;

pub use rules::*;
pub use settings::*;

use anyhow::Result;
use std::path::Path;

pub const SETTINGS_FILE: &str = "trackdesk.yaml";
pub const RULES_FILE: &str = "rules.yaml";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub settings: Settings,
    pub seed_rules: RuleSet,
}

impl AppConfig {
    pub fn load(config_dir: &Path) -> Result<Self> {
        let settings = Settings::load(config_dir.join(SETTINGS_FILE))?;

        let errors = settings.validate();
        if !errors.is_empty() {
            anyhow::bail!("invalid {}: {}", SETTINGS_FILE, errors.join("; "));
        }

        let rules_path = config_dir.join(RULES_FILE);
        let seed_rules = if rules_path.exists() {
            let rules = RuleSet::load(&rules_path)?;
            let errors = rules.validate(&settings.validation);
            if !errors.is_empty() {
                anyhow::bail!("invalid {}: {}", RULES_FILE, errors.join("; "));
            }
            rules
        } else {
            RuleSet::default()
        };

        Ok(Self {
            settings,
            seed_rules,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_without_rules_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(SETTINGS_FILE),
            "http:\n  listen: \"127.0.0.1:0\"\nstorage:\n  driver: memory\n",
        )
        .unwrap();

        let config = AppConfig::load(dir.path()).unwrap();
        assert!(config.seed_rules.rules.is_empty());
        assert_eq!(config.settings.storage.driver, StorageDriver::Memory);
    }

    #[test]
    fn test_invalid_seed_rules_fail_load() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(SETTINGS_FILE),
            "http:\n  listen: \"127.0.0.1:0\"\nstorage:\n  driver: memory\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join(RULES_FILE),
            "rules:\n  - name: no-action\n    type: IP_BLOCKING\n",
        )
        .unwrap();

        let err = AppConfig::load(dir.path()).unwrap_err();
        assert!(err.to_string().contains("rules.yaml"));
    }
}
