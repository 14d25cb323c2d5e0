mod webhook;

pub use webhook::*;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::config::NotificationsConfig;
use crate::domain::{OutcomeKind, TrafficEvent, TrafficRule};
use crate::observability::NOTIFICATIONS_SENT;

pub const NOTIFICATION_EVENT_TYPE: &str = "traffic.flagged";

/// Payload delivered when a NOTIFY rule decides a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub event_type: String,
    pub event_id: Uuid,
    pub rule_id: Uuid,
    pub rule_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    pub action: OutcomeKind,
    pub message: String,
    pub ip_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affiliate_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    pub fn flagged(rule: &TrafficRule, event: &TrafficEvent, channel: Option<String>) -> Self {
        Self {
            event_type: NOTIFICATION_EVENT_TYPE.to_string(),
            event_id: event.id,
            rule_id: rule.id,
            rule_name: rule.name.clone(),
            channel,
            action: event.action,
            message: event.message.clone(),
            ip_address: event.ip_address.clone(),
            country: event.country.clone(),
            affiliate_id: event.affiliate_id.clone(),
            timestamp: event.timestamp,
        }
    }
}

/// A notification destination.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;
    /// Whether this destination wants notifications for `channel`.
    fn accepts(&self, channel: Option<&str>) -> bool;
    async fn send(&self, notification: &Notification) -> Result<(), String>;
}

/// Fans notifications out to every destination in background tasks.
///
/// In-flight deliveries are bounded; when saturated, new notifications are
/// dropped with a warning instead of queueing behind slow webhooks.
pub struct NotifyDispatcher {
    notifiers: Vec<Arc<dyn Notifier>>,
    in_flight: Arc<Semaphore>,
    max_attempts: u32,
}

impl NotifyDispatcher {
    pub fn new(notifiers: Vec<Arc<dyn Notifier>>, max_in_flight: usize) -> Self {
        Self {
            notifiers,
            in_flight: Arc::new(Semaphore::new(max_in_flight.max(1))),
            max_attempts: 3,
        }
    }

    pub fn from_config(config: &NotificationsConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .unwrap_or_default();

        let notifiers = config
            .webhooks
            .iter()
            .map(|w| Arc::new(WebhookNotifier::from_config(w, client.clone())) as Arc<dyn Notifier>)
            .collect();

        Self::new(notifiers, config.max_in_flight)
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }

    /// Fire a notification without waiting for delivery
    pub fn notify(self: &Arc<Self>, notification: Notification) {
        if self.notifiers.is_empty() {
            return;
        }

        let permit = match Arc::clone(&self.in_flight).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                tracing::warn!(
                    rule_id = %notification.rule_id,
                    "dropping notification because the delivery queue is saturated"
                );
                NOTIFICATIONS_SENT.with_label_values(&["all", "dropped"]).inc();
                return;
            }
        };

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = permit;
            this.dispatch(&notification).await;
        });
    }

    /// Send to all accepting destinations, collecting results
    pub async fn dispatch(&self, notification: &Notification) -> Vec<(String, Result<(), String>)> {
        let mut results = Vec::new();
        for notifier in &self.notifiers {
            if !notifier.accepts(notification.channel.as_deref()) {
                continue;
            }

            let name = notifier.name().to_string();
            let result = self.send_with_retry(notifier.as_ref(), notification).await;
            let status = if result.is_ok() { "success" } else { "error" };
            NOTIFICATIONS_SENT.with_label_values(&[name.as_str(), status]).inc();
            if let Err(ref e) = result {
                tracing::warn!(destination = %name, error = %e, "notification delivery failed");
            }
            results.push((name, result));
        }
        results
    }

    async fn send_with_retry(
        &self,
        notifier: &dyn Notifier,
        notification: &Notification,
    ) -> Result<(), String> {
        let mut last_err = String::new();
        for attempt in 0..self.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
            }
            match notifier.send(notification).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::debug!(
                        destination = %notifier.name(),
                        attempt = attempt + 1,
                        error = %e,
                        "notification attempt failed"
                    );
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DerivedAttributes, EventContext, RuleInput, RuleStatus, RuleType, TrafficEventInput};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        channels: Vec<String>,
        sent: Mutex<Vec<Notification>>,
        fail: bool,
    }

    #[async_trait]
    impl Notifier for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        fn accepts(&self, channel: Option<&str>) -> bool {
            self.channels.is_empty() || channel.is_some_and(|c| self.channels.iter().any(|x| x == c))
        }

        async fn send(&self, notification: &Notification) -> Result<(), String> {
            if self.fail {
                return Err("boom".into());
            }
            self.sent.lock().unwrap().push(notification.clone());
            Ok(())
        }
    }

    fn notification(channel: Option<&str>) -> Notification {
        let rule = TrafficRule::from_input(RuleInput {
            name: "watch".into(),
            description: None,
            rule_type: RuleType::TrafficSource,
            conditions: vec![],
            actions: vec![],
            priority: 0,
            status: RuleStatus::Active,
        });
        let context = EventContext::from_input(TrafficEventInput {
            ip_address: "198.51.100.1".into(),
            ..Default::default()
        });
        let event = TrafficEvent::record(
            &context,
            Some(rule.id),
            OutcomeKind::Notify,
            "flagged",
            DerivedAttributes::default(),
        );
        Notification::flagged(&rule, &event, channel.map(String::from))
    }

    #[tokio::test]
    async fn test_dispatch_respects_channels() {
        let all = Arc::new(Recording::default());
        let fraud_only = Arc::new(Recording {
            channels: vec!["fraud".into()],
            ..Default::default()
        });
        let dispatcher = NotifyDispatcher::new(vec![all.clone(), fraud_only.clone()], 4);

        let results = dispatcher.dispatch(&notification(Some("ops"))).await;
        assert_eq!(results.len(), 1);
        assert_eq!(all.sent.lock().unwrap().len(), 1);
        assert!(fraud_only.sent.lock().unwrap().is_empty());

        dispatcher.dispatch(&notification(Some("fraud"))).await;
        assert_eq!(fraud_only.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_delivery_is_reported() {
        let failing = Arc::new(Recording {
            fail: true,
            ..Default::default()
        });
        let dispatcher = NotifyDispatcher::new(vec![failing], 4).with_max_attempts(1);
        let results = dispatcher.dispatch(&notification(None)).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].1, Err("boom".to_string()));
    }

    #[test]
    fn test_notification_wire_format() {
        let value = serde_json::to_value(notification(Some("fraud"))).unwrap();
        assert_eq!(value["eventType"], "traffic.flagged");
        assert_eq!(value["action"], "NOTIFY");
        assert_eq!(value["channel"], "fraud");
        assert!(value.get("country").is_none());
    }
}
