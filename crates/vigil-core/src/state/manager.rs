//! Alert instance store with per-key serialization

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::StateConfig;
use crate::error::{Error, Result};
use crate::models::{
    AlertInstance, AlertNotification, AlertRule, EvaluationResult, InstanceKey, Labels,
    NotificationKind, State, StateReason, Verdict,
};

use super::machine::{self, Transition};

/// Label carrying the rule title on every instance
pub const ALERTNAME_LABEL: &str = "alertname";
/// Label carrying the rule uid on every instance
pub const RULE_UID_LABEL: &str = "__alert_rule_uid__";

type InstanceCell = Arc<Mutex<AlertInstance>>;

/// Owns every alert instance.
///
/// Each instance sits behind its own mutex so a scheduled evaluation and an
/// administrative reset of the same key never interleave.
pub struct StateManager {
    instances: DashMap<InstanceKey, InstanceCell>,
    /// Newest completed evaluation instant per rule
    watermarks: DashMap<String, DateTime<Utc>>,
    config: StateConfig,
}

impl StateManager {
    /// Create an empty state manager
    pub fn new(config: StateConfig) -> Self {
        Self {
            instances: DashMap::new(),
            watermarks: DashMap::new(),
            config,
        }
    }

    /// Apply one evaluation result and return the notifications it produces.
    ///
    /// Results older than the rule's newest processed evaluation are rejected
    /// with [`Error::StaleResult`].
    pub fn process(&self, rule: &AlertRule, result: &EvaluationResult) -> Result<Vec<AlertNotification>> {
        let at = result.evaluated_at;
        {
            let mut watermark = self.watermarks.entry(rule.uid.clone()).or_insert(at);
            if at < *watermark {
                return Err(Error::StaleResult {
                    rule_uid: rule.uid.clone(),
                });
            }
            *watermark = at;
        }

        let mut notifications = Vec::new();

        // A lone NoData / Error entry describes the whole rule: it applies to
        // every instance the rule already has.
        let rule_wide = match result.entries.as_slice() {
            [entry] if matches!(entry.verdict, Verdict::NoData | Verdict::Error) => Some(entry),
            _ => None,
        };

        if let Some(entry) = rule_wide {
            let cells = self.cells_for_rule(&rule.uid);
            if cells.is_empty() {
                if machine::outcome(rule, entry.verdict).creates_instance() {
                    let cell = self.cell_or_insert(rule, &entry.labels, at);
                    self.advance(&cell, rule, at, &mut notifications, |inst| {
                        machine::apply(inst, rule, entry, at)
                    });
                }
            } else {
                for cell in cells {
                    self.advance(&cell, rule, at, &mut notifications, |inst| {
                        machine::apply(inst, rule, entry, at)
                    });
                }
            }
            return Ok(notifications);
        }

        let mut seen = HashSet::new();
        for entry in &result.entries {
            let labels = instance_labels(rule, &entry.labels);
            let key = InstanceKey {
                rule_uid: rule.uid.clone(),
                fingerprint: labels.fingerprint(),
            };
            seen.insert(key.clone());

            let existing = self.instances.get(&key).map(|e| e.value().clone());
            let cell = match existing {
                Some(cell) => cell,
                None if machine::outcome(rule, entry.verdict).creates_instance() => {
                    self.cell_or_insert(rule, &entry.labels, at)
                }
                None => continue,
            };

            self.advance(&cell, rule, at, &mut notifications, |inst| {
                machine::apply(inst, rule, entry, at)
            });
        }

        for cell in self.cells_for_rule(&rule.uid) {
            if seen.contains(&cell.lock().key) {
                continue;
            }
            self.advance(&cell, rule, at, &mut notifications, |inst| {
                machine::apply_missing(inst, rule, at)
            });
        }

        Ok(notifications)
    }

    fn advance(
        &self,
        cell: &InstanceCell,
        rule: &AlertRule,
        at: DateTime<Utc>,
        out: &mut Vec<AlertNotification>,
        step: impl FnOnce(&mut AlertInstance) -> Option<Transition>,
    ) {
        let mut inst = cell.lock();
        if at < inst.last_evaluated_at {
            debug!(key = %inst.key, "Discarding out-of-order evaluation");
            return;
        }

        let episode_start = inst.last_transition_at;
        match step(&mut *inst) {
            Some(transition) => {
                info!(
                    key = %inst.key,
                    from = %transition.from,
                    to = %transition.to,
                    kind = ?transition.kind,
                    "Alert state changed"
                );
                metrics::counter!("vigil_state_transitions_total", "to" => transition.to.to_string())
                    .increment(1);
                let starts_at = match transition.kind {
                    NotificationKind::Resolved => episode_start,
                    _ => inst.last_transition_at,
                };
                out.push(notification(rule, &inst, transition.kind, transition.from, starts_at, at));
            }
            None if inst.state.is_firing() && self.resend_due(&inst, at) => {
                let from = inst.state;
                let starts_at = inst.last_transition_at;
                out.push(notification(rule, &inst, NotificationKind::Refresh, from, starts_at, at));
            }
            None => {}
        }
    }

    fn resend_due(&self, inst: &AlertInstance, at: DateTime<Utc>) -> bool {
        match inst.last_sent_at {
            None => true,
            Some(sent) => (at - sent).to_std().unwrap_or_default() >= self.config.resend_delay,
        }
    }

    fn cell_or_insert(&self, rule: &AlertRule, series: &Labels, at: DateTime<Utc>) -> InstanceCell {
        let labels = instance_labels(rule, series);
        let key = InstanceKey {
            rule_uid: rule.uid.clone(),
            fingerprint: labels.fingerprint(),
        };
        self.instances
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(AlertInstance::new(key, labels, at))))
            .value()
            .clone()
    }

    fn cells_for_rule(&self, rule_uid: &str) -> Vec<InstanceCell> {
        self.instances
            .iter()
            .filter(|e| e.key().rule_uid == rule_uid)
            .map(|e| e.value().clone())
            .collect()
    }

    /// Record that notifications were handed to delivery
    pub fn mark_sent(&self, notifications: &[AlertNotification], at: DateTime<Utc>) {
        for n in notifications {
            if let Some(cell) = self.instances.get(&n.key).map(|e| e.value().clone()) {
                cell.lock().last_sent_at = Some(at);
            }
        }
    }

    /// Clear the `for` timers of a rule's pending instances
    pub fn invalidate_for_timers(&self, rule_uid: &str) {
        for cell in self.cells_for_rule(rule_uid) {
            let mut inst = cell.lock();
            if inst.state == State::Pending {
                inst.first_breach_at = None;
                inst.state_reason = StateReason::RuleUpdated;
            }
        }
        debug!(rule_uid, "Invalidated pending timers");
    }

    /// Administrative reset: forget every instance of a rule without notifying
    pub fn reset(&self, rule_uid: &str) -> usize {
        let removed = self.remove_rule_instances(rule_uid).len();
        self.watermarks.remove(rule_uid);
        info!(rule_uid, removed, "Alert state reset");
        removed
    }

    /// Forget a deleted rule; firing instances produce resolved notifications
    pub fn delete_rule(&self, rule: &AlertRule, at: DateTime<Utc>) -> Vec<AlertNotification> {
        let removed = self.remove_rule_instances(&rule.uid);
        self.watermarks.remove(&rule.uid);

        removed
            .into_iter()
            .filter(|inst| inst.state.is_firing())
            .map(|mut inst| {
                let from = inst.state;
                let starts_at = inst.last_transition_at;
                inst.state = State::Normal;
                inst.state_reason = StateReason::RuleUpdated;
                notification(rule, &inst, NotificationKind::Resolved, from, starts_at, at)
            })
            .collect()
    }

    fn remove_rule_instances(&self, rule_uid: &str) -> Vec<AlertInstance> {
        let keys: Vec<InstanceKey> = self
            .instances
            .iter()
            .filter(|e| e.key().rule_uid == rule_uid)
            .map(|e| e.key().clone())
            .collect();

        keys.iter()
            .filter_map(|key| self.instances.remove(key))
            .map(|(_, cell)| cell.lock().clone())
            .collect()
    }

    /// Delete instances that resolved longer than the retention window ago
    pub fn gc(&self, now: DateTime<Utc>) -> usize {
        let retention = self.config.retention;
        let before = self.instances.len();

        self.instances.retain(|_, cell| {
            let inst = cell.lock();
            if inst.state != State::Normal {
                return true;
            }
            let since = inst.resolved_at.unwrap_or(inst.last_transition_at);
            (now - since).to_std().unwrap_or_default() < retention
        });

        let removed = before.saturating_sub(self.instances.len());
        if removed > 0 {
            debug!(removed, "Garbage-collected resolved instances");
        }
        removed
    }

    /// Snapshot of one instance
    pub fn get(&self, key: &InstanceKey) -> Option<AlertInstance> {
        self.instances.get(key).map(|e| e.value().lock().clone())
    }

    /// Snapshot of all instances, optionally restricted to one rule
    pub fn list(&self, rule_uid: Option<&str>) -> Vec<AlertInstance> {
        let mut out: Vec<AlertInstance> = self
            .instances
            .iter()
            .filter(|e| rule_uid.map_or(true, |uid| e.key().rule_uid == uid))
            .map(|e| e.value().lock().clone())
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }
}

/// Rule labels over series labels, plus the identifying labels
fn instance_labels(rule: &AlertRule, series: &Labels) -> Labels {
    let mut labels = series.merged(&rule.labels);
    labels.insert(ALERTNAME_LABEL, rule.title.clone());
    labels.insert(RULE_UID_LABEL, rule.uid.clone());
    labels
}

fn notification(
    rule: &AlertRule,
    inst: &AlertInstance,
    kind: NotificationKind,
    previous_state: State,
    starts_at: DateTime<Utc>,
    at: DateTime<Utc>,
) -> AlertNotification {
    AlertNotification {
        key: inst.key.clone(),
        rule_title: rule.title.clone(),
        labels: inst.labels.clone(),
        annotations: rule.annotations.clone(),
        kind,
        state: inst.state,
        previous_state,
        starts_at,
        ends_at: (kind == NotificationKind::Resolved).then_some(at),
        emitted_at: at,
        value: inst.last_value,
        error: inst.last_error.clone(),
    }
}
