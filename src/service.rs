use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::config::{FailPolicy, RuleSet, Settings, ThrottleConfig};
use crate::db::{EventFilter, RepositoryTrait};
use crate::domain::{
    ActionOutcome, ActionType, DerivedAttributes, EventContext, OutcomeKind, RuleInput, RuleStatus,
    TrafficAction, TrafficEvent, TrafficEventInput, TrafficRule,
};
use crate::error::{Result, TrackdeskError};
use crate::geoip::{GeoLocator, NullGeoLocator};
use crate::notify::{Notification, NotifyDispatcher};
use crate::observability::{
    AuditEntry, AuditLogWriter, COLLABORATOR_FAILURES, EVALUATION_LATENCY, EVENTS_RECORDED,
    QUOTA_KEYS, RULE_CHANGES, RULE_MATCHES, RULES_STORED, TRAFFIC_EVALUATIONS,
};
use crate::policy::{
    ActionExecutor, Decision, FieldResolver, PARAM_CHANNEL, RuleEngine, RuleTrace,
};
use crate::quota::{QuotaTracker, TokenBucketQuota};
use crate::validation::RuleValidator;

/// Result of processing one inbound request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedTraffic {
    pub decision: Decision,
    pub outcome: ActionOutcome,
    pub event: TrafficEvent,
}

/// Preview of a candidate rule against a sample event. Nothing is persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleTestResult {
    pub trace: RuleTrace,
    pub action: ActionType,
    pub outcome: ActionOutcome,
}

/// Request processing and rule administration on top of a storage backend.
pub struct TrafficService {
    repo: Arc<dyn RepositoryTrait>,
    engine: RuleEngine,
    executor: ActionExecutor,
    validator: RuleValidator,
    dispatcher: Arc<NotifyDispatcher>,
    fail_policy: FailPolicy,
    throttle: ThrottleConfig,
    audit_log: Option<AuditLogWriter>,
}

/// Decision, executed outcome, event attributes and the deciding rule.
type Evaluated = (Decision, ActionOutcome, DerivedAttributes, Option<TrafficRule>);

fn store_unavailable(err: TrackdeskError) -> TrackdeskError {
    match err {
        TrackdeskError::RuleStoreUnavailable(_) => err,
        other => TrackdeskError::RuleStoreUnavailable(other.to_string()),
    }
}

impl TrafficService {
    pub fn new(
        repo: Arc<dyn RepositoryTrait>,
        geo: Arc<dyn GeoLocator>,
        quota: Arc<dyn QuotaTracker>,
        settings: &Settings,
    ) -> Self {
        Self {
            repo,
            engine: RuleEngine::new(geo),
            executor: ActionExecutor::new(quota, settings.engine.throttle.clone()),
            validator: RuleValidator::new(settings.validation.clone()),
            dispatcher: Arc::new(NotifyDispatcher::from_config(&settings.notifications)),
            fail_policy: settings.engine.fail_policy,
            throttle: settings.engine.throttle.clone(),
            audit_log: None,
        }
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<NotifyDispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn with_audit_log(mut self, writer: AuditLogWriter) -> Self {
        self.audit_log = Some(writer);
        self
    }

    pub fn fail_policy(&self) -> FailPolicy {
        self.fail_policy
    }

    /// Evaluate one request against the current active rule snapshot,
    /// carry out the decided action and record the event.
    pub async fn process(
        &self,
        input: TrafficEventInput,
        edge_country: Option<String>,
    ) -> Result<ProcessedTraffic> {
        let started = Instant::now();
        let context = EventContext::from_input(input).with_edge_country(edge_country);

        let evaluated = match self.repo.list_active_rules().await.map_err(store_unavailable) {
            Ok(rules) => self.evaluate(&rules, &context),
            Err(e) => Err(e),
        };

        let (decision, outcome, derived, deciding_rule) = match evaluated {
            Ok(evaluated) => evaluated,
            Err(e) => self.fail_open(e, &context)?,
        };

        let event = TrafficEvent::record(
            &context,
            decision.matched_rule_id,
            outcome.action,
            outcome.message.clone(),
            derived,
        );

        match self.repo.record_event(&event).await {
            Ok(()) => EVENTS_RECORDED.with_label_values(&["success"]).inc(),
            Err(e) => {
                tracing::warn!(event_id = %event.id, error = %e, "failed to record traffic event");
                EVENTS_RECORDED.with_label_values(&["error"]).inc();
            }
        }

        if let Some(rule) = &deciding_rule {
            RULE_MATCHES.with_label_values(&[rule.rule_type.as_str()]).inc();

            if outcome.action == OutcomeKind::Notify {
                let channel = rule
                    .resolved_action()
                    .and_then(|a| a.str_parameter(PARAM_CHANNEL))
                    .map(String::from);
                self.dispatcher
                    .notify(Notification::flagged(rule, &event, channel));
            }
        }

        TRAFFIC_EVALUATIONS
            .with_label_values(&[outcome.action.as_str()])
            .inc();
        EVALUATION_LATENCY.observe(started.elapsed().as_secs_f64());
        QUOTA_KEYS.set(self.executor.tracked_quota_keys() as f64);

        if outcome.permits_request() {
            tracing::debug!(
                ip = %event.ip_address,
                action = %outcome.action,
                rule_id = ?event.rule_id,
                "traffic processed"
            );
        } else {
            tracing::info!(
                ip = %event.ip_address,
                action = %outcome.action,
                rule_id = ?event.rule_id,
                "traffic stopped"
            );
        }

        Ok(ProcessedTraffic {
            decision,
            outcome,
            event,
        })
    }

    /// Synchronous part of `process`. The resolver is not `Sync`, so it must
    /// not live across an await point.
    fn evaluate(
        &self,
        rules: &[TrafficRule],
        context: &EventContext,
    ) -> Result<Evaluated> {
        let resolver = self.engine.resolver(context);
        let decision = self.engine.decide_with(rules, &resolver)?;

        let rule = decision
            .matched_rule_id
            .and_then(|id| rules.iter().find(|r| r.id == id));
        let action = rule
            .and_then(TrafficRule::resolved_action)
            .cloned()
            .unwrap_or_else(TrafficAction::allow);

        let outcome = self.executor.execute(&action, rule, context);
        Ok((decision, outcome, resolver.derived_attributes(), rule.cloned()))
    }

    fn fail_open(
        &self,
        err: TrackdeskError,
        context: &EventContext,
    ) -> Result<Evaluated> {
        if !err.is_collaborator_failure() {
            return Err(err);
        }

        let collaborator = match err {
            TrackdeskError::FieldResolutionFailed { .. } => "geoip",
            _ => "rule_store",
        };
        COLLABORATOR_FAILURES
            .with_label_values(&[collaborator, self.fail_policy.as_str()])
            .inc();

        if self.fail_policy == FailPolicy::Closed {
            tracing::error!(ip = %context.ip_address, collaborator, error = %err, "traffic evaluation failed");
            return Err(err);
        }

        tracing::warn!(
            ip = %context.ip_address,
            collaborator,
            error = %err,
            "traffic evaluation failed, allowing"
        );

        let decision = Decision {
            action: ActionType::Allow,
            matched_rule_id: None,
            rule_trace: Vec::new(),
        };
        let outcome = ActionOutcome::allow(format!("{} unavailable, allowing", collaborator));
        // A failed lookup is not retried for the event record.
        let derived = if collaborator == "geoip" {
            FieldResolver::new(context, &NullGeoLocator).derived_attributes()
        } else {
            self.engine.resolver(context).derived_attributes()
        };
        Ok((decision, outcome, derived, None))
    }

    /// Evaluate a candidate rule regardless of its status. THROTTLE previews
    /// use a throwaway quota so real clients are not charged.
    pub fn test_rule(
        &self,
        candidate: RuleInput,
        input: TrafficEventInput,
        edge_country: Option<String>,
    ) -> Result<RuleTestResult> {
        let rule = TrafficRule::from_input(candidate);
        let context = EventContext::from_input(input).with_edge_country(edge_country);
        let trace = self.engine.evaluate_rule(&rule, &context)?;

        let action = if trace.matched {
            rule.resolved_action()
                .cloned()
                .unwrap_or_else(TrafficAction::allow)
        } else {
            TrafficAction::allow()
        };

        let preview = ActionExecutor::new(Arc::new(TokenBucketQuota::new(1)), self.throttle.clone());
        let outcome = if trace.matched {
            preview.execute(&action, Some(&rule), &context)
        } else {
            preview.execute(&action, None, &context)
        };

        Ok(RuleTestResult {
            trace,
            action: action.action_type,
            outcome,
        })
    }

    pub async fn create_rule(&self, input: RuleInput, operator: Option<&str>) -> Result<TrafficRule> {
        self.validator.validate(&input)?;

        let rule = TrafficRule::from_input(input);
        self.repo.insert_rule(&rule).await.map_err(store_unavailable)?;

        tracing::info!(rule_id = %rule.id, rule = %rule.name, priority = rule.priority, "rule created");
        RULE_CHANGES.with_label_values(&["create"]).inc();
        self.audit(AuditEntry::rule_created(&rule, operator)).await;
        self.refresh_rule_gauges().await;

        Ok(rule)
    }

    pub async fn update_rule(
        &self,
        id: Uuid,
        input: RuleInput,
        operator: Option<&str>,
    ) -> Result<TrafficRule> {
        self.validator.validate(&input)?;

        let mut rule = self.get_rule(id).await?;
        rule.apply_input(input);
        if !self.repo.update_rule(&rule).await.map_err(store_unavailable)? {
            return Err(TrackdeskError::RuleNotFound(id));
        }

        tracing::info!(rule_id = %rule.id, rule = %rule.name, "rule updated");
        RULE_CHANGES.with_label_values(&["update"]).inc();
        self.audit(AuditEntry::rule_updated(&rule, operator)).await;
        self.refresh_rule_gauges().await;

        Ok(rule)
    }

    pub async fn set_rule_status(
        &self,
        id: Uuid,
        status: RuleStatus,
        operator: Option<&str>,
    ) -> Result<TrafficRule> {
        let mut rule = self.get_rule(id).await?;
        if rule.status == status {
            return Ok(rule);
        }

        rule.status = status;
        rule.updated_at = chrono::Utc::now();
        if !self.repo.update_rule(&rule).await.map_err(store_unavailable)? {
            return Err(TrackdeskError::RuleNotFound(id));
        }

        tracing::info!(rule_id = %rule.id, status = %status, "rule status changed");
        RULE_CHANGES.with_label_values(&["status"]).inc();
        self.audit(AuditEntry::rule_status_changed(id, status, operator))
            .await;
        self.refresh_rule_gauges().await;

        Ok(rule)
    }

    pub async fn delete_rule(&self, id: Uuid, operator: Option<&str>) -> Result<()> {
        if !self.repo.delete_rule(id).await.map_err(store_unavailable)? {
            return Err(TrackdeskError::RuleNotFound(id));
        }

        tracing::info!(rule_id = %id, "rule deleted");
        RULE_CHANGES.with_label_values(&["delete"]).inc();
        self.audit(AuditEntry::rule_deleted(id, operator)).await;
        self.refresh_rule_gauges().await;

        Ok(())
    }

    pub async fn get_rule(&self, id: Uuid) -> Result<TrafficRule> {
        self.repo
            .get_rule(id)
            .await
            .map_err(store_unavailable)?
            .ok_or(TrackdeskError::RuleNotFound(id))
    }

    pub async fn list_rules(
        &self,
        status: Option<RuleStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<TrafficRule>> {
        self.repo
            .list_rules(status, limit, offset)
            .await
            .map_err(store_unavailable)
    }

    pub async fn count_rules(&self, status: Option<RuleStatus>) -> Result<u32> {
        self.repo.count_rules(status).await.map_err(store_unavailable)
    }

    pub async fn list_events(
        &self,
        filter: &EventFilter,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<TrafficEvent>> {
        self.repo
            .list_events(filter, limit, offset)
            .await
            .map_err(|e| TrackdeskError::RecorderFailed(e.to_string()))
    }

    pub async fn get_event(&self, id: Uuid) -> Result<TrafficEvent> {
        self.repo
            .get_event(id)
            .await
            .map_err(|e| TrackdeskError::RecorderFailed(e.to_string()))?
            .ok_or_else(|| TrackdeskError::NotFound(format!("event {}", id)))
    }

    pub async fn list_audit(&self, limit: u32, offset: u32) -> Result<Vec<AuditEntry>> {
        self.repo.list_audit(limit, offset).await
    }

    /// Load seed rules into an empty store. A store that already holds rules
    /// is left alone so restarts do not duplicate them.
    pub async fn seed_rules(&self, seed: &RuleSet) -> Result<usize> {
        if seed.rules.is_empty() {
            return Ok(0);
        }

        let existing = self.count_rules(None).await?;
        if existing > 0 {
            tracing::info!(existing, "rule store not empty, skipping seed rules");
            return Ok(0);
        }

        for input in &seed.rules {
            self.create_rule(input.clone(), None).await?;
        }
        tracing::info!(count = seed.rules.len(), "seeded rules");
        Ok(seed.rules.len())
    }

    async fn audit(&self, entry: AuditEntry) {
        if let Err(e) = self.repo.insert_audit(&entry).await {
            tracing::warn!(action = %entry.action, error = %e, "failed to store audit entry");
        }
        if let Some(writer) = &self.audit_log {
            if let Err(e) = writer.write(&entry) {
                tracing::warn!(action = %entry.action, error = %e, "failed to write audit log");
            }
        }
    }

    async fn refresh_rule_gauges(&self) {
        for status in [RuleStatus::Active, RuleStatus::Inactive] {
            match self.repo.count_rules(Some(status)).await {
                Ok(count) => RULES_STORED
                    .with_label_values(&[status.as_str()])
                    .set(count as f64),
                Err(e) => tracing::debug!(error = %e, "failed to count rules"),
            }
        }
    }
}
