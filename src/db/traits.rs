use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{OutcomeKind, RuleStatus, TrafficEvent, TrafficRule};
use crate::error::Result;
use crate::observability::AuditEntry;

/// Source of rule snapshots and target of rule administration.
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Active rules ordered by priority, then creation order.
    async fn list_active_rules(&self) -> Result<Vec<TrafficRule>>;
    async fn list_rules(
        &self,
        status: Option<RuleStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<TrafficRule>>;
    async fn get_rule(&self, id: Uuid) -> Result<Option<TrafficRule>>;
    async fn count_rules(&self, status: Option<RuleStatus>) -> Result<u32>;
    async fn insert_rule(&self, rule: &TrafficRule) -> Result<()>;
    /// Replace a stored rule, including its conditions and actions.
    async fn update_rule(&self, rule: &TrafficRule) -> Result<bool>;
    async fn delete_rule(&self, id: Uuid) -> Result<bool>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    #[serde(default)]
    pub action: Option<OutcomeKind>,
    #[serde(default)]
    pub rule_id: Option<Uuid>,
    #[serde(default)]
    pub ip: Option<String>,
}

impl EventFilter {
    pub fn matches(&self, event: &TrafficEvent) -> bool {
        self.action.is_none_or(|a| a == event.action)
            && self.rule_id.is_none_or(|id| event.rule_id == Some(id))
            && self.ip.as_deref().is_none_or(|ip| event.ip_address == ip)
    }
}

/// Append-only record of evaluated requests.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn record_event(&self, event: &TrafficEvent) -> Result<()>;
    /// Newest first.
    async fn list_events(
        &self,
        filter: &EventFilter,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<TrafficEvent>>;
    async fn get_event(&self, id: Uuid) -> Result<Option<TrafficEvent>>;
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn insert_audit(&self, entry: &AuditEntry) -> Result<()>;
    /// Newest first.
    async fn list_audit(&self, limit: u32, offset: u32) -> Result<Vec<AuditEntry>>;
}

/// Everything a storage backend provides.
pub trait RepositoryTrait: RuleStore + EventRecorder + AuditStore {}

impl<T: RuleStore + EventRecorder + AuditStore> RepositoryTrait for T {}
