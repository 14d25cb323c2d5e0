use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use uuid::Uuid;

use crate::domain::{RuleStatus, TrafficRule};

/// Actor types for audit log entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    System,
    Operator,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Operator => "operator",
        }
    }
}

impl std::str::FromStr for ActorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Self::System),
            "operator" => Ok(Self::Operator),
            _ => Err(format!("unknown actor type: {}", s)),
        }
    }
}

/// Audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub audit_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub schema_version: u32,
    pub actor_type: ActorType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    pub details: serde_json::Value,
}

impl AuditEntry {
    pub fn new(
        actor_type: ActorType,
        actor_id: Option<String>,
        action: &str,
        target_type: Option<&str>,
        target_id: Option<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            audit_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            schema_version: 1,
            actor_type,
            actor_id,
            action: action.to_string(),
            target_type: target_type.map(String::from),
            target_id,
            details,
        }
    }

    fn actor(operator_id: Option<&str>) -> (ActorType, Option<String>) {
        match operator_id {
            Some(id) => (ActorType::Operator, Some(id.to_string())),
            None => (ActorType::System, None),
        }
    }

    pub fn rule_created(rule: &TrafficRule, operator_id: Option<&str>) -> Self {
        let (actor_type, actor_id) = Self::actor(operator_id);
        Self::new(
            actor_type,
            actor_id,
            "rule_create",
            Some("rule"),
            Some(rule.id.to_string()),
            serde_json::json!({
                "name": rule.name,
                "type": rule.rule_type.as_str(),
                "priority": rule.priority,
                "status": rule.status.as_str(),
            }),
        )
    }

    pub fn rule_updated(rule: &TrafficRule, operator_id: Option<&str>) -> Self {
        let (actor_type, actor_id) = Self::actor(operator_id);
        Self::new(
            actor_type,
            actor_id,
            "rule_update",
            Some("rule"),
            Some(rule.id.to_string()),
            serde_json::json!({
                "name": rule.name,
                "priority": rule.priority,
                "conditions": rule.conditions.len(),
            }),
        )
    }

    pub fn rule_status_changed(rule_id: Uuid, status: RuleStatus, operator_id: Option<&str>) -> Self {
        let (actor_type, actor_id) = Self::actor(operator_id);
        Self::new(
            actor_type,
            actor_id,
            "rule_status",
            Some("rule"),
            Some(rule_id.to_string()),
            serde_json::json!({ "status": status.as_str() }),
        )
    }

    pub fn rule_deleted(rule_id: Uuid, operator_id: Option<&str>) -> Self {
        let (actor_type, actor_id) = Self::actor(operator_id);
        Self::new(
            actor_type,
            actor_id,
            "rule_delete",
            Some("rule"),
            Some(rule_id.to_string()),
            serde_json::json!({}),
        )
    }
}

/// Audit log writer (JSON Lines format)
pub struct AuditLogWriter {
    writer: Mutex<BufWriter<File>>,
}

impl AuditLogWriter {
    pub fn new<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn write(&self, entry: &AuditEntry) -> std::io::Result<()> {
        let json = serde_json::to_string(entry)?;
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(writer, "{}", json)?;
        writer.flush()?;
        Ok(())
    }
}
