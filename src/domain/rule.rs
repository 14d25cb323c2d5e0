use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleType {
    GeoBlocking,
    IpBlocking,
    DeviceBlocking,
    RateLimiting,
    TrafficSource,
    TimeBased,
}

impl RuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GeoBlocking => "GEO_BLOCKING",
            Self::IpBlocking => "IP_BLOCKING",
            Self::DeviceBlocking => "DEVICE_BLOCKING",
            Self::RateLimiting => "RATE_LIMITING",
            Self::TrafficSource => "TRAFFIC_SOURCE",
            Self::TimeBased => "TIME_BASED",
        }
    }
}

impl std::fmt::Display for RuleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RuleType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GEO_BLOCKING" => Ok(Self::GeoBlocking),
            "IP_BLOCKING" => Ok(Self::IpBlocking),
            "DEVICE_BLOCKING" => Ok(Self::DeviceBlocking),
            "RATE_LIMITING" => Ok(Self::RateLimiting),
            "TRAFFIC_SOURCE" => Ok(Self::TrafficSource),
            "TIME_BASED" => Ok(Self::TimeBased),
            _ => Err(format!("unknown rule type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleStatus {
    #[default]
    Active,
    Inactive,
}

impl RuleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Inactive => "INACTIVE",
        }
    }
}

impl std::fmt::Display for RuleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RuleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ACTIVE" => Ok(Self::Active),
            "INACTIVE" => Ok(Self::Inactive),
            _ => Err(format!("unknown rule status: {}", s)),
        }
    }
}

/// Comparison applied between a resolved field value and a condition's operand.
///
/// Operator strings this build does not know deserialize to `Unsupported`, so a
/// single stale rule degrades to "condition not met" instead of failing the load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    GreaterThan,
    LessThan,
    In,
    NotIn,
    Between,
    Regex,
    IsEmpty,
    IsNotEmpty,
    #[serde(other)]
    Unsupported,
}

impl ConditionOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Equals => "EQUALS",
            Self::NotEquals => "NOT_EQUALS",
            Self::Contains => "CONTAINS",
            Self::NotContains => "NOT_CONTAINS",
            Self::GreaterThan => "GREATER_THAN",
            Self::LessThan => "LESS_THAN",
            Self::In => "IN",
            Self::NotIn => "NOT_IN",
            Self::Between => "BETWEEN",
            Self::Regex => "REGEX",
            Self::IsEmpty => "IS_EMPTY",
            Self::IsNotEmpty => "IS_NOT_EMPTY",
            Self::Unsupported => "UNSUPPORTED",
        }
    }

    /// Parse a stored operator, mapping anything unknown to `Unsupported`.
    pub fn parse_lenient(s: &str) -> Self {
        match s {
            "EQUALS" => Self::Equals,
            "NOT_EQUALS" => Self::NotEquals,
            "CONTAINS" => Self::Contains,
            "NOT_CONTAINS" => Self::NotContains,
            "GREATER_THAN" => Self::GreaterThan,
            "LESS_THAN" => Self::LessThan,
            "IN" => Self::In,
            "NOT_IN" => Self::NotIn,
            "BETWEEN" => Self::Between,
            "REGEX" => Self::Regex,
            "IS_EMPTY" => Self::IsEmpty,
            "IS_NOT_EMPTY" => Self::IsNotEmpty,
            _ => Self::Unsupported,
        }
    }
}

impl std::fmt::Display for ConditionOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One field/operator/value predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficCondition {
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: Value,
    /// Carried for scoring; matching ignores it.
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_weight() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

impl TrafficCondition {
    pub fn new(field: impl Into<String>, operator: ConditionOperator, value: Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
            weight: default_weight(),
            is_active: true,
        }
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    Allow,
    Block,
    Redirect,
    Throttle,
    Captcha,
    Notify,
    #[serde(other)]
    Unknown,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "ALLOW",
            Self::Block => "BLOCK",
            Self::Redirect => "REDIRECT",
            Self::Throttle => "THROTTLE",
            Self::Captcha => "CAPTCHA",
            Self::Notify => "NOTIFY",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn parse_lenient(s: &str) -> Self {
        match s {
            "ALLOW" => Self::Allow,
            "BLOCK" => Self::Block,
            "REDIRECT" => Self::Redirect,
            "THROTTLE" => Self::Throttle,
            "CAPTCHA" => Self::Captcha,
            "NOTIFY" => Self::Notify,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Effect applied when a rule matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficAction {
    #[serde(rename = "type")]
    pub action_type: ActionType,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl TrafficAction {
    pub fn new(action_type: ActionType) -> Self {
        Self {
            action_type,
            parameters: Map::new(),
        }
    }

    pub fn allow() -> Self {
        Self::new(ActionType::Allow)
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn str_parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }

    pub fn u64_parameter(&self, key: &str) -> Option<u64> {
        self.parameters.get(key).and_then(Value::as_u64)
    }
}

/// API and seed-file input for a rule. The store assigns id and timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleInput {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    #[serde(default)]
    pub conditions: Vec<TrafficCondition>,
    #[serde(default)]
    pub actions: Vec<TrafficAction>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub status: RuleStatus,
}

/// A named, prioritized bundle of AND-combined conditions and one resolved action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficRule {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    #[serde(default)]
    pub conditions: Vec<TrafficCondition>,
    #[serde(default)]
    pub actions: Vec<TrafficAction>,
    pub priority: i32,
    pub status: RuleStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TrafficRule {
    pub fn from_input(input: RuleInput) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: input.name,
            description: input.description,
            rule_type: input.rule_type,
            conditions: input.conditions,
            actions: input.actions,
            priority: input.priority,
            status: input.status,
            created_at: now,
            updated_at: now,
        }
    }

    /// Replace the mutable parts of the rule, keeping identity and creation time.
    pub fn apply_input(&mut self, input: RuleInput) {
        self.name = input.name;
        self.description = input.description;
        self.rule_type = input.rule_type;
        self.conditions = input.conditions;
        self.actions = input.actions;
        self.priority = input.priority;
        self.status = input.status;
        self.updated_at = Utc::now();
    }

    pub fn is_active(&self) -> bool {
        self.status == RuleStatus::Active
    }

    pub fn active_conditions(&self) -> impl Iterator<Item = &TrafficCondition> {
        self.conditions.iter().filter(|c| c.is_active)
    }

    /// The action that decides a match. Rules carry exactly one action once
    /// validated; anything after the first is ignored.
    pub fn resolved_action(&self) -> Option<&TrafficAction> {
        self.actions.first()
    }

    /// Field of the first active condition, used to refine block outcomes.
    pub fn primary_field(&self) -> Option<&str> {
        self.active_conditions().next().map(|c| c.field.as_str())
    }
}
