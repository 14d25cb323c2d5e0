use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use std::collections::HashMap;
use uuid::Uuid;

use super::{AuditStore, EventFilter, EventRecorder, RuleStore};
use crate::domain::{
    ActionType, ConditionOperator, OutcomeKind, RuleStatus, RuleType, TrafficAction,
    TrafficCondition, TrafficEvent, TrafficRule,
};
use crate::error::Result;
use crate::observability::{ActorType, AuditEntry, ROW_PARSE_ERRORS};

/// Postgres storage backend. Conditions, actions and payloads are stored as
/// JSON text next to their typed columns.
#[derive(Clone)]
pub struct Repository {
    pool: PgPool,
}

impl Repository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn load_rules(&self, rows: Vec<RuleRow>) -> Result<Vec<TrafficRule>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();

        let conditions = sqlx::query_as::<_, ConditionRow>(
            r#"
            SELECT rule_id, field, operator, value_json, weight, is_active
            FROM traffic_conditions WHERE rule_id = ANY($1)
            ORDER BY rule_id, position
            "#,
        )
        .bind(ids.as_slice())
        .fetch_all(&self.pool)
        .await?;

        let actions = sqlx::query_as::<_, ActionRow>(
            r#"
            SELECT rule_id, action_type, parameters_json
            FROM traffic_actions WHERE rule_id = ANY($1)
            ORDER BY rule_id, position
            "#,
        )
        .bind(ids.as_slice())
        .fetch_all(&self.pool)
        .await?;

        let mut conditions_by_rule: HashMap<Uuid, Vec<TrafficCondition>> = HashMap::new();
        for row in conditions {
            conditions_by_rule
                .entry(row.rule_id)
                .or_default()
                .push(row.into_condition());
        }

        let mut actions_by_rule: HashMap<Uuid, Vec<TrafficAction>> = HashMap::new();
        for row in actions {
            actions_by_rule
                .entry(row.rule_id)
                .or_default()
                .push(row.into_action());
        }

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let conditions = conditions_by_rule.remove(&row.id).unwrap_or_default();
                let actions = actions_by_rule.remove(&row.id).unwrap_or_default();
                row.into_rule(conditions, actions)
            })
            .collect())
    }
}

#[async_trait]
impl RuleStore for Repository {
    async fn list_active_rules(&self) -> Result<Vec<TrafficRule>> {
        let rows = sqlx::query_as::<_, RuleRow>(
            r#"
            SELECT id, name, description, rule_type, priority, status, created_at, updated_at
            FROM traffic_rules WHERE status = $1
            ORDER BY priority ASC, created_at ASC, seq ASC
            "#,
        )
        .bind(RuleStatus::Active.as_str())
        .fetch_all(&self.pool)
        .await?;
        self.load_rules(rows).await
    }

    async fn list_rules(
        &self,
        status: Option<RuleStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<TrafficRule>> {
        let rows = sqlx::query_as::<_, RuleRow>(
            r#"
            SELECT id, name, description, rule_type, priority, status, created_at, updated_at
            FROM traffic_rules WHERE ($1::TEXT IS NULL OR status = $1)
            ORDER BY priority ASC, created_at ASC, seq ASC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(status.map(|s| s.as_str()))
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;
        self.load_rules(rows).await
    }

    async fn get_rule(&self, id: Uuid) -> Result<Option<TrafficRule>> {
        let row = sqlx::query_as::<_, RuleRow>(
            r#"
            SELECT id, name, description, rule_type, priority, status, created_at, updated_at
            FROM traffic_rules WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(self.load_rules(vec![row]).await?.pop()),
            None => Ok(None),
        }
    }

    async fn count_rules(&self, status: Option<RuleStatus>) -> Result<u32> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM traffic_rules WHERE ($1::TEXT IS NULL OR status = $1)",
        )
        .bind(status.map(|s| s.as_str()))
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0 as u32)
    }

    async fn insert_rule(&self, rule: &TrafficRule) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO traffic_rules (
                id, name, description, rule_type, priority, status, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(rule.id)
        .bind(&rule.name)
        .bind(&rule.description)
        .bind(rule.rule_type.as_str())
        .bind(rule.priority)
        .bind(rule.status.as_str())
        .bind(rule.created_at)
        .bind(rule.updated_at)
        .execute(&mut *tx)
        .await?;

        insert_children(&mut tx, rule).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_rule(&self, rule: &TrafficRule) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE traffic_rules SET
                name = $2, description = $3, rule_type = $4, priority = $5,
                status = $6, updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(rule.id)
        .bind(&rule.name)
        .bind(&rule.description)
        .bind(rule.rule_type.as_str())
        .bind(rule.priority)
        .bind(rule.status.as_str())
        .bind(rule.updated_at)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query("DELETE FROM traffic_conditions WHERE rule_id = $1")
            .bind(rule.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM traffic_actions WHERE rule_id = $1")
            .bind(rule.id)
            .execute(&mut *tx)
            .await?;

        insert_children(&mut tx, rule).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn delete_rule(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM traffic_rules WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

async fn insert_children(tx: &mut Transaction<'_, Postgres>, rule: &TrafficRule) -> Result<()> {
    for (position, condition) in rule.conditions.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO traffic_conditions (
                rule_id, position, field, operator, value_json, weight, is_active
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(rule.id)
        .bind(position as i32)
        .bind(&condition.field)
        .bind(condition.operator.as_str())
        .bind(serde_json::to_string(&condition.value)?)
        .bind(condition.weight)
        .bind(condition.is_active)
        .execute(&mut **tx)
        .await?;
    }

    for (position, action) in rule.actions.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO traffic_actions (rule_id, position, action_type, parameters_json)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(rule.id)
        .bind(position as i32)
        .bind(action.action_type.as_str())
        .bind(serde_json::to_string(&action.parameters)?)
        .execute(&mut **tx)
        .await?;
    }

    Ok(())
}

#[async_trait]
impl EventRecorder for Repository {
    async fn record_event(&self, event: &TrafficEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO traffic_events (
                id, rule_id, event_type, data_json, action, message, ip_address, user_agent,
                country, device, browser, os, affiliate_id, click_id, timestamp
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(event.id)
        .bind(event.rule_id)
        .bind(&event.event_type)
        .bind(serde_json::to_string(&event.data)?)
        .bind(event.action.as_str())
        .bind(&event.message)
        .bind(&event.ip_address)
        .bind(&event.user_agent)
        .bind(&event.country)
        .bind(&event.device)
        .bind(&event.browser)
        .bind(&event.os)
        .bind(&event.affiliate_id)
        .bind(&event.click_id)
        .bind(event.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_events(
        &self,
        filter: &EventFilter,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<TrafficEvent>> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT id, rule_id, event_type, data_json, action, message, ip_address, user_agent,
                   country, device, browser, os, affiliate_id, click_id, timestamp
            FROM traffic_events
            WHERE ($1::TEXT IS NULL OR action = $1)
              AND ($2::UUID IS NULL OR rule_id = $2)
              AND ($3::TEXT IS NULL OR ip_address = $3)
            ORDER BY timestamp DESC
            LIMIT $4 OFFSET $5
            "#,
        )
        .bind(filter.action.map(|a| a.as_str()))
        .bind(filter.rule_id)
        .bind(filter.ip.as_deref())
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().filter_map(EventRow::into_event).collect())
    }

    async fn get_event(&self, id: Uuid) -> Result<Option<TrafficEvent>> {
        let row = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT id, rule_id, event_type, data_json, action, message, ip_address, user_agent,
                   country, device, browser, os, affiliate_id, click_id, timestamp
            FROM traffic_events WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(EventRow::into_event))
    }
}

#[async_trait]
impl AuditStore for Repository {
    async fn insert_audit(&self, entry: &AuditEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (
                audit_id, timestamp, schema_version, actor_type, actor_id, action,
                target_type, target_id, details_json
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(entry.audit_id)
        .bind(entry.timestamp)
        .bind(entry.schema_version as i32)
        .bind(entry.actor_type.as_str())
        .bind(&entry.actor_id)
        .bind(&entry.action)
        .bind(&entry.target_type)
        .bind(&entry.target_id)
        .bind(serde_json::to_string(&entry.details)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_audit(&self, limit: u32, offset: u32) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query_as::<_, AuditRow>(
            r#"
            SELECT audit_id, timestamp, schema_version, actor_type, actor_id, action,
                   target_type, target_id, details_json
            FROM audit_log ORDER BY timestamp DESC LIMIT $1 OFFSET $2
            "#,
        )
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().filter_map(AuditRow::into_entry).collect())
    }
}

// ============================================================================
// Row mapping
// ============================================================================

fn parse_failed(table: &str, id: impl std::fmt::Display, column: &str, value: &str) {
    tracing::error!(
        table,
        id = %id,
        column,
        value,
        "failed to parse column - possible data corruption"
    );
    ROW_PARSE_ERRORS.with_label_values(&[table]).inc();
}

#[derive(Debug, FromRow)]
struct RuleRow {
    id: Uuid,
    name: String,
    description: Option<String>,
    rule_type: String,
    priority: i32,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl RuleRow {
    fn into_rule(
        self,
        conditions: Vec<TrafficCondition>,
        actions: Vec<TrafficAction>,
    ) -> Option<TrafficRule> {
        let Ok(rule_type) = self.rule_type.parse::<RuleType>() else {
            parse_failed("traffic_rules", self.id, "rule_type", &self.rule_type);
            return None;
        };
        let Ok(status) = self.status.parse::<RuleStatus>() else {
            parse_failed("traffic_rules", self.id, "status", &self.status);
            return None;
        };

        Some(TrafficRule {
            id: self.id,
            name: self.name,
            description: self.description,
            rule_type,
            conditions,
            actions,
            priority: self.priority,
            status,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct ConditionRow {
    rule_id: Uuid,
    field: String,
    operator: String,
    value_json: String,
    weight: f64,
    is_active: bool,
}

impl ConditionRow {
    /// Unknown operators and unreadable values are kept so the rule still
    /// loads; the condition then never matches.
    fn into_condition(self) -> TrafficCondition {
        let operator = ConditionOperator::parse_lenient(&self.operator);
        if operator == ConditionOperator::Unsupported {
            parse_failed("traffic_conditions", self.rule_id, "operator", &self.operator);
        }

        let value = serde_json::from_str(&self.value_json).unwrap_or_else(|_| {
            parse_failed("traffic_conditions", self.rule_id, "value_json", &self.value_json);
            Value::Null
        });

        TrafficCondition {
            field: self.field,
            operator,
            value,
            weight: self.weight,
            is_active: self.is_active,
        }
    }
}

#[derive(Debug, FromRow)]
struct ActionRow {
    rule_id: Uuid,
    action_type: String,
    parameters_json: String,
}

impl ActionRow {
    fn into_action(self) -> TrafficAction {
        let action_type = ActionType::parse_lenient(&self.action_type);
        if action_type == ActionType::Unknown {
            parse_failed("traffic_actions", self.rule_id, "action_type", &self.action_type);
        }

        let parameters: Map<String, Value> = serde_json::from_str(&self.parameters_json)
            .unwrap_or_else(|_| {
                parse_failed("traffic_actions", self.rule_id, "parameters_json", &self.parameters_json);
                Map::new()
            });

        TrafficAction {
            action_type,
            parameters,
        }
    }
}

#[derive(Debug, FromRow)]
struct EventRow {
    id: Uuid,
    rule_id: Option<Uuid>,
    event_type: String,
    data_json: String,
    action: String,
    message: String,
    ip_address: String,
    user_agent: String,
    country: Option<String>,
    device: String,
    browser: String,
    os: String,
    affiliate_id: Option<String>,
    click_id: Option<String>,
    timestamp: DateTime<Utc>,
}

impl EventRow {
    fn into_event(self) -> Option<TrafficEvent> {
        let Ok(action) = self.action.parse::<OutcomeKind>() else {
            parse_failed("traffic_events", self.id, "action", &self.action);
            return None;
        };
        let data = serde_json::from_str(&self.data_json).unwrap_or_else(|_| {
            parse_failed("traffic_events", self.id, "data_json", &self.data_json);
            Value::Null
        });

        Some(TrafficEvent {
            id: self.id,
            rule_id: self.rule_id,
            event_type: self.event_type,
            data,
            action,
            message: self.message,
            ip_address: self.ip_address,
            user_agent: self.user_agent,
            country: self.country,
            device: self.device,
            browser: self.browser,
            os: self.os,
            affiliate_id: self.affiliate_id,
            click_id: self.click_id,
            timestamp: self.timestamp,
        })
    }
}

#[derive(Debug, FromRow)]
struct AuditRow {
    audit_id: Uuid,
    timestamp: DateTime<Utc>,
    schema_version: i32,
    actor_type: String,
    actor_id: Option<String>,
    action: String,
    target_type: Option<String>,
    target_id: Option<String>,
    details_json: String,
}

impl AuditRow {
    fn into_entry(self) -> Option<AuditEntry> {
        let Ok(actor_type) = self.actor_type.parse::<ActorType>() else {
            parse_failed("audit_log", self.audit_id, "actor_type", &self.actor_type);
            return None;
        };
        let details = serde_json::from_str(&self.details_json).unwrap_or_else(|_| {
            parse_failed("audit_log", self.audit_id, "details_json", &self.details_json);
            Value::Null
        });

        Some(AuditEntry {
            audit_id: self.audit_id,
            timestamp: self.timestamp,
            schema_version: self.schema_version as u32,
            actor_type,
            actor_id: self.actor_id,
            action: self.action,
            target_type: self.target_type,
            target_id: self.target_id,
            details,
        })
    }
}
