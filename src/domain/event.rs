use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::OutcomeKind;

pub const DEFAULT_EVENT_TYPE: &str = "request";

/// API input for one inbound request presented to the rule engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficEventInput {
    #[serde(default)]
    pub data: Value,
    pub ip_address: String,
    #[serde(default)]
    pub user_agent: String,
    #[serde(default)]
    pub affiliate_id: Option<String>,
    #[serde(default)]
    pub click_id: Option<String>,
    #[serde(default)]
    pub referrer: Option<String>,
    /// Country already resolved at the edge, e.g. from a CDN geo header.
    #[serde(default)]
    pub country: Option<String>,
    #[serde(rename = "type", default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Fully materialized event the engine evaluates against.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventContext {
    pub data: Value,
    pub ip_address: String,
    pub user_agent: String,
    pub affiliate_id: Option<String>,
    pub click_id: Option<String>,
    pub referrer: Option<String>,
    pub country: Option<String>,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
}

impl EventContext {
    pub fn from_input(input: TrafficEventInput) -> Self {
        let data = match input.data {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };

        Self {
            data,
            ip_address: input.ip_address,
            user_agent: input.user_agent,
            affiliate_id: input.affiliate_id.filter(|s| !s.is_empty()),
            click_id: input.click_id.filter(|s| !s.is_empty()),
            referrer: input.referrer,
            country: input.country.filter(|s| !s.is_empty()),
            event_type: input
                .event_type
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| DEFAULT_EVENT_TYPE.to_string()),
            timestamp: input.timestamp.unwrap_or_else(Utc::now),
        }
    }

    /// Attach a country supplied by the edge unless the payload already has one.
    pub fn with_edge_country(mut self, country: Option<String>) -> Self {
        if self.country.is_none() {
            self.country = country.filter(|c| !c.is_empty());
        }
        self
    }
}

/// Immutable record of one evaluated request, persisted by the event recorder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficEvent {
    pub id: Uuid,
    pub rule_id: Option<Uuid>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
    pub action: OutcomeKind,
    pub message: String,
    pub ip_address: String,
    pub user_agent: String,
    pub country: Option<String>,
    pub device: String,
    pub browser: String,
    pub os: String,
    pub affiliate_id: Option<String>,
    pub click_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Attributes derived from the request while it was evaluated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DerivedAttributes {
    pub country: Option<String>,
    pub device: String,
    pub browser: String,
    pub os: String,
}

impl TrafficEvent {
    pub fn record(
        context: &EventContext,
        rule_id: Option<Uuid>,
        action: OutcomeKind,
        message: impl Into<String>,
        derived: DerivedAttributes,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            rule_id,
            event_type: context.event_type.clone(),
            data: context.data.clone(),
            action,
            message: message.into(),
            ip_address: context.ip_address.clone(),
            user_agent: context.user_agent.clone(),
            country: derived.country,
            device: derived.device,
            browser: derived.browser,
            os: derived.os,
            affiliate_id: context.affiliate_id.clone(),
            click_id: context.click_id.clone(),
            timestamp: context.timestamp,
        }
    }
}
