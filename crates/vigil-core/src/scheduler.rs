//! Rule group scheduler
//!
//! One worker task per rule group. Ticks are aligned to multiples of the group
//! interval since the Unix epoch, so replicas started at different times still
//! evaluate at the same logical instants.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::evaluation::Evaluator;
use crate::models::{AlertNotification, GroupKey, RuleGroup};
use crate::state::StateManager;

/// Receives the notifications produced by one scheduler tick
#[async_trait]
pub trait AlertSender: Send + Sync {
    /// Hand a batch of notifications to delivery. Called once per tick, also
    /// with an empty batch, so layers holding back work can retry.
    async fn send_alerts(&self, alerts: Vec<AlertNotification>) -> Result<()>;
}

struct GroupEntry {
    group: ArcSwap<RuleGroup>,
    cancel: CancellationToken,
}

/// Rule evaluation scheduler
pub struct Scheduler {
    evaluator: Evaluator,
    state: Arc<StateManager>,
    sender: Arc<dyn AlertSender>,
    config: SchedulerConfig,
    groups: DashMap<GroupKey, Arc<GroupEntry>>,
    running: Mutex<Option<CancellationToken>>,
    tracker: TaskTracker,
}

impl Scheduler {
    /// Create a new scheduler
    pub fn new(
        evaluator: Evaluator,
        state: Arc<StateManager>,
        sender: Arc<dyn AlertSender>,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            evaluator,
            state,
            sender,
            config,
            groups: DashMap::new(),
            running: Mutex::new(None),
            tracker: TaskTracker::new(),
        })
    }

    /// Add or replace a rule group.
    ///
    /// Rules whose definition changed have their pending timers restarted;
    /// rules no longer present are deleted, resolving anything they had firing.
    pub async fn upsert_group(self: &Arc<Self>, group: RuleGroup) -> Result<()> {
        if let Some(interval) = group.interval {
            if interval < self.config.min_interval {
                return Err(Error::validation(format!(
                    "interval {} of group {} is below the minimum {}",
                    humantime::format_duration(interval),
                    group.key,
                    humantime::format_duration(self.config.min_interval)
                )));
            }
        }

        let key = group.key.clone();
        let existing = self.groups.get(&key).map(|e| e.value().clone());

        let Some(entry) = existing else {
            info!(group = %key, rules = group.rules.len(), "Rule group added");
            let entry = Arc::new(GroupEntry {
                group: ArcSwap::from_pointee(group),
                cancel: CancellationToken::new(),
            });
            self.groups.insert(key.clone(), entry.clone());
            if let Some(cancel) = self.running.lock().clone() {
                self.spawn_worker(key, entry, cancel);
            }
            return Ok(());
        };

        let previous = entry.group.load_full();
        let identities: HashMap<&str, u64> = previous
            .rules
            .iter()
            .map(|r| (r.uid.as_str(), r.identity()))
            .collect();

        for rule in &group.rules {
            if let Some(old) = identities.get(rule.uid.as_str()) {
                if *old != rule.identity() {
                    debug!(group = %key, rule_uid = %rule.uid, "Rule definition changed");
                    self.state.invalidate_for_timers(&rule.uid);
                }
            }
        }

        let at = self.deletion_tick(&previous);
        let mut resolved = Vec::new();
        for rule in &previous.rules {
            if !group.rules.iter().any(|r| r.uid == rule.uid) {
                resolved.extend(self.state.delete_rule(rule, at));
            }
        }

        entry.group.store(Arc::new(group));
        info!(group = %key, "Rule group updated");

        self.forward(resolved, at).await;
        Ok(())
    }

    /// Stop and forget a rule group, resolving its firing instances
    pub async fn remove_group(&self, key: &GroupKey) -> Result<()> {
        let (_, entry) = self
            .groups
            .remove(key)
            .ok_or_else(|| Error::not_found("Rule group", key.to_string()))?;
        entry.cancel.cancel();

        let group = entry.group.load_full();
        let at = self.deletion_tick(&group);
        let resolved: Vec<AlertNotification> = group
            .rules
            .iter()
            .flat_map(|rule| self.state.delete_rule(rule, at))
            .collect();

        info!(group = %key, "Rule group removed");
        self.forward(resolved, at).await;
        Ok(())
    }

    /// Instant stamped on the resolutions of deleted rules.
    ///
    /// Replicas deleting the same rule within one interval agree on it, and it
    /// is later than the tick of any notification the rule already produced.
    fn deletion_tick(&self, group: &RuleGroup) -> DateTime<Utc> {
        next_tick(Utc::now(), self.interval_of(group))
    }

    /// Keys of the scheduled groups
    pub fn groups(&self) -> Vec<GroupKey> {
        let mut keys: Vec<GroupKey> = self.groups.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Start one worker per group. Groups added later get a worker as well.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) {
        info!(groups = self.groups.len(), "Starting scheduler");
        *self.running.lock() = Some(cancel.clone());

        let entries: Vec<(GroupKey, Arc<GroupEntry>)> = self
            .groups
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for (key, entry) in entries {
            self.spawn_worker(key, entry, cancel.clone());
        }
    }

    /// Wait for every worker to exit after cancellation
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    fn spawn_worker(self: &Arc<Self>, key: GroupKey, entry: Arc<GroupEntry>, cancel: CancellationToken) {
        let scheduler = Arc::clone(self);
        self.tracker.spawn(async move {
            scheduler.run_group(key, entry, cancel).await;
        });
    }

    async fn run_group(&self, key: GroupKey, entry: Arc<GroupEntry>, cancel: CancellationToken) {
        debug!(group = %key, "Group worker started");
        let mut last: Option<DateTime<Utc>> = None;

        loop {
            let interval = self.interval_of(&entry.group.load());
            let mut at = next_tick(Utc::now(), interval);
            if let Some(last) = last {
                if at <= last {
                    at = last + chrono::Duration::from_std(interval).unwrap_or(chrono::Duration::zero());
                }
            }
            let wait = (at - Utc::now()).to_std().unwrap_or_default();

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = entry.cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            self.tick(&key, at).await;
            last = Some(at);
        }

        debug!(group = %key, "Group worker stopped");
    }

    fn interval_of(&self, group: &RuleGroup) -> Duration {
        group
            .interval
            .unwrap_or(self.config.default_interval)
            .max(self.config.min_interval)
    }

    /// Evaluate every rule of a group at `at` and forward the resulting
    /// notifications. Returns the number of notifications forwarded.
    pub async fn tick(&self, key: &GroupKey, at: DateTime<Utc>) -> usize {
        let Some(entry) = self.groups.get(key).map(|e| e.value().clone()) else {
            return 0;
        };
        let group = entry.group.load_full();

        let mut notifications = Vec::new();
        for rule in &group.rules {
            let result = self.evaluator.evaluate(rule, at).await;
            match self.state.process(rule, &result) {
                Ok(produced) => notifications.extend(produced),
                Err(e) if e.is_expected() => {
                    debug!(group = %key, rule_uid = %rule.uid, error = %e, "Skipped evaluation result")
                }
                Err(e) => warn!(group = %key, rule_uid = %rule.uid, error = %e, "Failed to process evaluation result"),
            }
        }

        let count = notifications.len();
        self.forward(notifications, at).await;
        self.state.gc(at);
        count
    }

    async fn forward(&self, notifications: Vec<AlertNotification>, at: DateTime<Utc>) {
        let batch = notifications.clone();
        match self.sender.send_alerts(batch).await {
            Ok(()) => self.state.mark_sent(&notifications, at),
            Err(e) => error!(error = %e, count = notifications.len(), "Failed to send alerts"),
        }
    }
}

/// First multiple of `interval` since the Unix epoch strictly after `now`
pub fn next_tick(now: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    let step = (interval.as_millis() as i64).max(1);
    let next = (now.timestamp_millis().div_euclid(step) + 1) * step;
    Utc.timestamp_millis_opt(next).single().unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StateConfig;
    use crate::evaluation::tests::{rule, StaticExecutor};
    use crate::models::{Labels, NotificationKind, State};

    #[derive(Default)]
    struct RecordingSender {
        batches: Mutex<Vec<Vec<AlertNotification>>>,
    }

    #[async_trait]
    impl AlertSender for RecordingSender {
        async fn send_alerts(&self, alerts: Vec<AlertNotification>) -> Result<()> {
            self.batches.lock().push(alerts);
            Ok(())
        }
    }

    fn scheduler(executor: StaticExecutor) -> (Arc<Scheduler>, Arc<StateManager>, Arc<RecordingSender>) {
        let state = Arc::new(StateManager::new(StateConfig::default()));
        let sender = Arc::new(RecordingSender::default());
        let scheduler = Scheduler::new(
            Evaluator::new(Arc::new(executor), Duration::from_secs(5)),
            state.clone(),
            sender.clone(),
            SchedulerConfig {
                min_interval: Duration::from_secs(1),
                ..Default::default()
            },
        );
        (scheduler, state, sender)
    }

    fn group(rules: Vec<crate::models::AlertRule>) -> RuleGroup {
        RuleGroup {
            key: GroupKey::new("ns", "g"),
            interval: Some(Duration::from_secs(10)),
            rules,
        }
    }

    #[test]
    fn test_next_tick_is_aligned() {
        let now = Utc.timestamp_millis_opt(1_700_000_012_345).unwrap();
        let tick = next_tick(now, Duration::from_secs(10));
        assert_eq!(tick.timestamp_millis(), 1_700_000_020_000);

        let on_boundary = Utc.timestamp_millis_opt(1_700_000_020_000).unwrap();
        assert_eq!(
            next_tick(on_boundary, Duration::from_secs(10)).timestamp_millis(),
            1_700_000_030_000
        );
    }

    #[tokio::test]
    async fn test_tick_forwards_notifications_and_empty_batches() {
        let executor = StaticExecutor::default().series("A", &[(Labels::from([("host", "a")]), 10.0)]);
        let (scheduler, state, sender) = scheduler(executor);
        scheduler.upsert_group(group(vec![rule("r1", 5.0)])).await.unwrap();

        let t0 = Utc::now();
        assert_eq!(scheduler.tick(&GroupKey::new("ns", "g"), t0).await, 1);
        assert_eq!(
            scheduler
                .tick(&GroupKey::new("ns", "g"), t0 + chrono::Duration::seconds(10))
                .await,
            0
        );

        let batches = sender.batches.lock();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0][0].kind, NotificationKind::Firing);
        assert!(batches[1].is_empty());

        let instances = state.list(Some("r1"));
        assert_eq!(instances[0].last_sent_at, Some(t0));
    }

    #[tokio::test]
    async fn test_interval_below_minimum_is_rejected() {
        let (scheduler, _, _) = scheduler(StaticExecutor::default());
        let mut g = group(vec![rule("r1", 5.0)]);
        g.interval = Some(Duration::from_millis(100));

        assert!(matches!(
            scheduler.upsert_group(g).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_removed_rule_resolves_its_instances() {
        let executor = StaticExecutor::default().series("A", &[(Labels::new(), 10.0)]);
        let (scheduler, state, sender) = scheduler(executor);
        scheduler
            .upsert_group(group(vec![rule("r1", 5.0), rule("r2", 5.0)]))
            .await
            .unwrap();
        scheduler.tick(&GroupKey::new("ns", "g"), Utc::now()).await;

        scheduler.upsert_group(group(vec![rule("r1", 5.0)])).await.unwrap();

        let batches = sender.batches.lock();
        let last = batches.last().unwrap();
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].kind, NotificationKind::Resolved);
        assert_eq!(last[0].key.rule_uid, "r2");
        assert!(state.list(Some("r2")).is_empty());
        assert_eq!(state.list(Some("r1"))[0].state, State::Alerting);
    }

    #[tokio::test]
    async fn test_changed_rule_restarts_pending_timer() {
        let executor = StaticExecutor::default().series("A", &[(Labels::new(), 10.0)]);
        let (scheduler, state, _) = scheduler(executor);
        let key = GroupKey::new("ns", "g");

        let mut r = rule("r1", 5.0);
        r.for_duration = Duration::from_secs(30);
        scheduler.upsert_group(group(vec![r.clone()])).await.unwrap();

        let t0 = Utc::now();
        scheduler.tick(&key, t0).await;
        assert!(state.list(Some("r1"))[0].first_breach_at.is_some());

        r.condition.threshold = 1.0;
        scheduler.upsert_group(group(vec![r])).await.unwrap();
        assert_eq!(state.list(Some("r1"))[0].first_breach_at, None);

        scheduler.tick(&key, t0 + chrono::Duration::seconds(20)).await;
        // 30s after the first breach but only 10s after the restart
        scheduler.tick(&key, t0 + chrono::Duration::seconds(30)).await;
        assert_eq!(state.list(Some("r1"))[0].state, State::Pending);
    }

    #[tokio::test]
    async fn test_remove_group_stops_and_resolves() {
        let executor = StaticExecutor::default().series("A", &[(Labels::new(), 10.0)]);
        let (scheduler, state, sender) = scheduler(executor);
        let key = GroupKey::new("ns", "g");
        scheduler.upsert_group(group(vec![rule("r1", 5.0)])).await.unwrap();
        scheduler.tick(&key, Utc::now()).await;

        scheduler.remove_group(&key).await.unwrap();

        assert!(scheduler.groups().is_empty());
        assert!(state.list(None).is_empty());
        assert!(sender.batches.lock().last().unwrap()[0].is_resolved());
        assert!(matches!(
            scheduler.remove_group(&key).await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_replicas_removing_a_group_resolve_once() {
        use crate::config::DedupConfig;
        use crate::dedup::{DedupLayer, InMemoryCoordinator};

        let coordinator = Arc::new(InMemoryCoordinator::new());
        let replica = |id: &str, peer: &str| {
            let sender = Arc::new(RecordingSender::default());
            let layer = Arc::new(DedupLayer::new(
                sender.clone(),
                coordinator.clone(),
                DedupConfig {
                    enabled: true,
                    replica_id: id.to_string(),
                    peers: vec![peer.to_string()],
                    ..Default::default()
                },
            ));
            let executor = StaticExecutor::default().series("A", &[(Labels::new(), 10.0)]);
            let scheduler = Scheduler::new(
                Evaluator::new(Arc::new(executor), Duration::from_secs(5)),
                Arc::new(StateManager::new(StateConfig::default())),
                layer.clone(),
                SchedulerConfig::default(),
            );
            (scheduler, layer, sender)
        };
        let (a, a_layer, a_sent) = replica("a", "b");
        let (b, b_layer, b_sent) = replica("b", "a");

        let key = GroupKey::new("ns", "g");
        let mut g = group(vec![rule("r1", 5.0)]);
        g.interval = Some(Duration::from_secs(86_400));
        a.upsert_group(g.clone()).await.unwrap();
        b.upsert_group(g).await.unwrap();

        let t0 = Utc::now();
        a.tick(&key, t0).await;
        b.tick(&key, t0).await;

        a.remove_group(&key).await.unwrap();
        b.remove_group(&key).await.unwrap();

        a_layer.dispatch(Vec::new(), t0 + chrono::Duration::days(2)).await.unwrap();
        b_layer.dispatch(Vec::new(), t0 + chrono::Duration::days(3)).await.unwrap();
        assert_eq!(b_layer.pending_count().await, 0);

        let delivered: Vec<NotificationKind> = a_sent
            .batches
            .lock()
            .iter()
            .chain(b_sent.batches.lock().iter())
            .flatten()
            .map(|n| n.kind)
            .collect();
        assert_eq!(delivered, vec![NotificationKind::Firing, NotificationKind::Resolved]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_workers_evaluate_on_aligned_instants() {
        let executor = StaticExecutor::default().series("A", &[(Labels::new(), 10.0)]);
        let (scheduler, state, _) = scheduler(executor);
        scheduler.upsert_group(group(vec![rule("r1", 5.0)])).await.unwrap();

        let cancel = CancellationToken::new();
        scheduler.start(cancel.clone());
        tokio::time::sleep(Duration::from_secs(25)).await;
        cancel.cancel();
        scheduler.wait().await;

        let instances = state.list(Some("r1"));
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].last_evaluated_at.timestamp_millis() % 10_000, 0);
    }
}
