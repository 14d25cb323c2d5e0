use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use super::{AuditStore, EventFilter, EventRecorder, RuleStore};
use crate::domain::{RuleStatus, TrafficEvent, TrafficRule};
use crate::error::Result;
use crate::observability::AuditEntry;

const DEFAULT_EVENT_CAPACITY: usize = 100_000;
const DEFAULT_AUDIT_CAPACITY: usize = 10_000;

/// In-process storage backend.
///
/// Rules keep insertion order, which is the tie-break for equal priorities.
/// Events and audit entries are bounded rings; the oldest entries fall off.
pub struct MemoryRepository {
    rules: Mutex<Vec<TrafficRule>>,
    events: Mutex<VecDeque<TrafficEvent>>,
    audit: Mutex<VecDeque<AuditEntry>>,
    event_capacity: usize,
    audit_capacity: usize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn page<'a, T: Clone + 'a>(items: impl Iterator<Item = &'a T>, limit: u32, offset: u32) -> Vec<T> {
    items
        .skip(offset as usize)
        .take(limit as usize)
        .cloned()
        .collect()
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY, DEFAULT_AUDIT_CAPACITY)
    }

    pub fn with_capacity(event_capacity: usize, audit_capacity: usize) -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
            events: Mutex::new(VecDeque::new()),
            audit: Mutex::new(VecDeque::new()),
            event_capacity: event_capacity.max(1),
            audit_capacity: audit_capacity.max(1),
        }
    }
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RuleStore for MemoryRepository {
    async fn list_active_rules(&self) -> Result<Vec<TrafficRule>> {
        let mut active: Vec<TrafficRule> = lock(&self.rules)
            .iter()
            .filter(|r| r.is_active())
            .cloned()
            .collect();
        active.sort_by_key(|r| r.priority);
        Ok(active)
    }

    async fn list_rules(
        &self,
        status: Option<RuleStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<TrafficRule>> {
        let rules = lock(&self.rules);
        let mut matching: Vec<&TrafficRule> = rules
            .iter()
            .filter(|r| status.is_none_or(|s| r.status == s))
            .collect();
        matching.sort_by_key(|r| r.priority);
        Ok(page(matching.into_iter(), limit, offset))
    }

    async fn get_rule(&self, id: Uuid) -> Result<Option<TrafficRule>> {
        Ok(lock(&self.rules).iter().find(|r| r.id == id).cloned())
    }

    async fn count_rules(&self, status: Option<RuleStatus>) -> Result<u32> {
        let rules = lock(&self.rules);
        Ok(rules
            .iter()
            .filter(|r| status.is_none_or(|s| r.status == s))
            .count() as u32)
    }

    async fn insert_rule(&self, rule: &TrafficRule) -> Result<()> {
        lock(&self.rules).push(rule.clone());
        Ok(())
    }

    async fn update_rule(&self, rule: &TrafficRule) -> Result<bool> {
        let mut rules = lock(&self.rules);
        match rules.iter_mut().find(|r| r.id == rule.id) {
            Some(existing) => {
                *existing = rule.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_rule(&self, id: Uuid) -> Result<bool> {
        let mut rules = lock(&self.rules);
        let before = rules.len();
        rules.retain(|r| r.id != id);
        Ok(rules.len() != before)
    }
}

#[async_trait]
impl EventRecorder for MemoryRepository {
    async fn record_event(&self, event: &TrafficEvent) -> Result<()> {
        let mut events = lock(&self.events);
        if events.len() >= self.event_capacity {
            events.pop_front();
        }
        events.push_back(event.clone());
        Ok(())
    }

    async fn list_events(
        &self,
        filter: &EventFilter,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<TrafficEvent>> {
        let events = lock(&self.events);
        Ok(page(
            events.iter().rev().filter(|e| filter.matches(e)),
            limit,
            offset,
        ))
    }

    async fn get_event(&self, id: Uuid) -> Result<Option<TrafficEvent>> {
        Ok(lock(&self.events).iter().find(|e| e.id == id).cloned())
    }
}

#[async_trait]
impl AuditStore for MemoryRepository {
    async fn insert_audit(&self, entry: &AuditEntry) -> Result<()> {
        let mut audit = lock(&self.audit);
        if audit.len() >= self.audit_capacity {
            audit.pop_front();
        }
        audit.push_back(entry.clone());
        Ok(())
    }

    async fn list_audit(&self, limit: u32, offset: u32) -> Result<Vec<AuditEntry>> {
        let audit = lock(&self.audit);
        Ok(page(audit.iter().rev(), limit, offset))
    }
}
