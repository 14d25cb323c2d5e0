use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Final effect reported to the caller. Block variants are refined by the
/// action executor from the deciding rule's type and primary field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeKind {
    Allow,
    Block,
    Redirect,
    Throttle,
    Captcha,
    Notify,
    GeoBlock,
    DeviceBlock,
    BrowserBlock,
    OsBlock,
    AffiliateBlock,
    IpBlock,
    RateLimit,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "ALLOW",
            Self::Block => "BLOCK",
            Self::Redirect => "REDIRECT",
            Self::Throttle => "THROTTLE",
            Self::Captcha => "CAPTCHA",
            Self::Notify => "NOTIFY",
            Self::GeoBlock => "GEO_BLOCK",
            Self::DeviceBlock => "DEVICE_BLOCK",
            Self::BrowserBlock => "BROWSER_BLOCK",
            Self::OsBlock => "OS_BLOCK",
            Self::AffiliateBlock => "AFFILIATE_BLOCK",
            Self::IpBlock => "IP_BLOCK",
            Self::RateLimit => "RATE_LIMIT",
        }
    }

    pub fn is_block(&self) -> bool {
        matches!(
            self,
            Self::Block
                | Self::GeoBlock
                | Self::DeviceBlock
                | Self::BrowserBlock
                | Self::OsBlock
                | Self::AffiliateBlock
                | Self::IpBlock
        )
    }

    /// Whether the HTTP layer should let the underlying request through.
    pub fn permits_request(&self) -> bool {
        matches!(self, Self::Allow | Self::Throttle | Self::Notify)
    }
}

impl std::fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for OutcomeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ALLOW" => Ok(Self::Allow),
            "BLOCK" => Ok(Self::Block),
            "REDIRECT" => Ok(Self::Redirect),
            "THROTTLE" => Ok(Self::Throttle),
            "CAPTCHA" => Ok(Self::Captcha),
            "NOTIFY" => Ok(Self::Notify),
            "GEO_BLOCK" => Ok(Self::GeoBlock),
            "DEVICE_BLOCK" => Ok(Self::DeviceBlock),
            "BROWSER_BLOCK" => Ok(Self::BrowserBlock),
            "OS_BLOCK" => Ok(Self::OsBlock),
            "AFFILIATE_BLOCK" => Ok(Self::AffiliateBlock),
            "IP_BLOCK" => Ok(Self::IpBlock),
            "RATE_LIMIT" => Ok(Self::RateLimit),
            _ => Err(format!("unknown outcome: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub action: OutcomeKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Map<String, Value>>,
}

impl ActionOutcome {
    pub fn new(action: OutcomeKind, message: impl Into<String>) -> Self {
        Self {
            action,
            message: message.into(),
            extra: None,
        }
    }

    pub fn allow(message: impl Into<String>) -> Self {
        Self::new(OutcomeKind::Allow, message)
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }

    pub fn permits_request(&self) -> bool {
        self.action.permits_request()
    }
}
