//! Aggregation groups and timed flushing

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::configstore::ConfigStore;
use crate::error::Result;
use crate::models::{AlertNotification, InstanceKey, Labels};
use crate::notify::{Notification, Notifier};
use crate::scheduler::AlertSender;

use super::route::RouteNode;

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::weeks(5200))
}

/// Whether `alert` ends a firing episode, as opposed to a pending one
fn resolves_firing(alert: &AlertNotification) -> bool {
    alert.is_resolved() && alert.previous_state.is_firing()
}

/// Alerts of one route sharing the same group-by values
#[derive(Debug)]
struct AggregationGroup {
    key: String,
    receiver: String,
    labels: Labels,
    group_interval: Duration,
    repeat_interval: Duration,
    alerts: BTreeMap<InstanceKey, AlertNotification>,
    next_flush: DateTime<Utc>,
    last_flush: Option<DateTime<Utc>>,
    dirty: bool,
}

impl AggregationGroup {
    fn new(key: String, route: &RouteNode, labels: Labels, now: DateTime<Utc>) -> Self {
        Self {
            key,
            receiver: route.receiver.clone(),
            labels,
            group_interval: route.group_interval,
            repeat_interval: route.repeat_interval,
            alerts: BTreeMap::new(),
            next_flush: now + chrono_duration(route.group_wait),
            last_flush: None,
            dirty: true,
        }
    }

    fn insert(&mut self, alert: AlertNotification) {
        let changed = match self.alerts.get(&alert.key) {
            None if alert.is_resolved() && !resolves_firing(&alert) => return,
            None => true,
            Some(prev) => prev.is_resolved() != alert.is_resolved(),
        };

        self.alerts.insert(alert.key.clone(), alert);

        if changed && !self.dirty {
            self.dirty = true;
            if let Some(last) = self.last_flush {
                self.next_flush = last + chrono_duration(self.group_interval);
            }
        }
    }

    fn has_firing(&self) -> bool {
        self.alerts.values().any(|a| !a.is_resolved())
    }

    fn is_due(&self, now: DateTime<Utc>) -> bool {
        if self.dirty {
            return now >= self.next_flush;
        }
        match self.last_flush {
            Some(last) => self.has_firing() && now >= last + chrono_duration(self.repeat_interval),
            None => false,
        }
    }

    fn flush(&mut self, now: DateTime<Utc>) -> Notification {
        let notification = Notification {
            receiver: self.receiver.clone(),
            group_key: self.key.clone(),
            group_labels: self.labels.clone(),
            alerts: self.alerts.values().cloned().collect(),
        };

        self.alerts.retain(|_, a| !a.is_resolved());
        self.dirty = false;
        self.last_flush = Some(now);
        notification
    }
}

/// Routes alerts into aggregation groups and flushes them to receivers
pub struct Dispatcher {
    store: Arc<ConfigStore>,
    notifier: Arc<dyn Notifier>,
    groups: Mutex<HashMap<String, AggregationGroup>>,
    flush_tick: Duration,
}

impl Dispatcher {
    /// Create a new dispatcher
    pub fn new(store: Arc<ConfigStore>, notifier: Arc<dyn Notifier>, flush_tick: Duration) -> Self {
        Self {
            store,
            notifier,
            groups: Mutex::new(HashMap::new()),
            flush_tick,
        }
    }

    /// Place alerts into the aggregation groups of every route they match
    pub fn ingest(&self, alerts: &[AlertNotification], now: DateTime<Utc>) {
        let active = self.store.active();
        let mut groups = self.groups.lock();

        for alert in alerts {
            for route in active.tree.match_labels(&alert.labels) {
                let labels = route.group_by.group_labels(&alert.labels);
                let key = format!("{}:{}", route.id, labels);

                // A resolution of a firing alert may reach a replica that never
                // grouped the firing copy, so it still opens a group
                if alert.is_resolved() && !resolves_firing(alert) && !groups.contains_key(&key) {
                    debug!(group = %key, alert = %alert.key, "Dropping resolved alert without a group");
                    continue;
                }

                groups
                    .entry(key.clone())
                    .or_insert_with(|| AggregationGroup::new(key, route, labels, now))
                    .insert(alert.clone());
            }
        }
    }

    /// Number of live aggregation groups
    pub fn group_count(&self) -> usize {
        self.groups.lock().len()
    }

    /// Flush every group that is due at `now`; returns the number of groups flushed
    pub async fn flush_due(&self, now: DateTime<Utc>) -> usize {
        let due: Vec<Notification> = {
            let mut groups = self.groups.lock();
            let due = groups
                .values_mut()
                .filter(|g| g.is_due(now))
                .map(|g| g.flush(now))
                .collect();
            groups.retain(|_, g| !g.alerts.is_empty());
            due
        };

        for notification in &due {
            self.deliver(notification).await;
        }
        due.len()
    }

    async fn deliver(&self, notification: &Notification) {
        let active = self.store.active();
        let integrations = active.integrations(&notification.receiver);
        if integrations.is_empty() {
            warn!(receiver = %notification.receiver, "Receiver has no integrations");
            return;
        }

        for integration in integrations {
            match self.notifier.notify(integration, notification).await {
                Ok(()) => {
                    metrics::counter!("vigil_notifications_sent_total", "type" => integration.kind.as_str())
                        .increment(1);
                }
                Err(e) => {
                    metrics::counter!("vigil_notifications_failed_total", "type" => integration.kind.as_str())
                        .increment(1);
                    warn!(
                        receiver = %notification.receiver,
                        integration = %integration.name,
                        error = %e,
                        "Failed to deliver notification"
                    );
                }
            }
        }
    }

    /// Flush due groups every tick until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        info!(tick = ?self.flush_tick, "Starting dispatcher");
        let mut ticker = tokio::time::interval(self.flush_tick);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.flush_due(Utc::now()).await;
                }
            }
        }

        info!("Dispatcher stopped");
    }
}

#[async_trait]
impl AlertSender for Dispatcher {
    async fn send_alerts(&self, alerts: Vec<AlertNotification>) -> Result<()> {
        self.ingest(&alerts, Utc::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configstore::{InMemoryPersister, PostableUserConfig};
    use crate::models::{NotificationKind, State};
    use crate::notify::Integration;
    use chrono::Duration as ChronoDuration;

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<(String, Notification)>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, integration: &Integration, notification: &Notification) -> Result<()> {
            self.sent
                .lock()
                .push((integration.name.clone(), notification.clone()));
            Ok(())
        }
    }

    async fn dispatcher() -> (Dispatcher, Arc<RecordingNotifier>) {
        let store = ConfigStore::open(Arc::new(InMemoryPersister::default()))
            .await
            .unwrap();
        let config: PostableUserConfig = serde_json::from_value(serde_json::json!({
            "alertmanager_config": {
                "route": {
                    "receiver": "default",
                    "group_by": ["alertname"],
                    "routes": [{"receiver": "ops", "match": {"team": "ops"}, "group_by": ["..."]}]
                },
                "receivers": [
                    {"name": "default", "grafana_managed_receiver_configs": [
                        {"name": "hook", "type": "webhook", "settings": {"url": "http://localhost/hook"}}
                    ]},
                    {"name": "ops", "grafana_managed_receiver_configs": [
                        {"name": "ops-hook", "type": "webhook", "settings": {"url": "http://localhost/ops"}}
                    ]}
                ]
            }
        }))
        .unwrap();
        store.save(config).await.unwrap();

        let notifier = Arc::new(RecordingNotifier::default());
        let dispatcher = Dispatcher::new(Arc::new(store), notifier.clone(), Duration::from_secs(1));
        (dispatcher, notifier)
    }

    fn alert(host: &str, kind: NotificationKind) -> AlertNotification {
        let labels = Labels::from([("alertname", "HighCPU"), ("host", host)]);
        AlertNotification {
            key: InstanceKey {
                rule_uid: "r1".to_string(),
                fingerprint: labels.fingerprint(),
            },
            rule_title: "HighCPU".to_string(),
            labels,
            annotations: Labels::new(),
            kind,
            state: if kind == NotificationKind::Resolved { State::Normal } else { State::Alerting },
            previous_state: State::Normal,
            starts_at: Utc::now(),
            ends_at: None,
            emitted_at: Utc::now(),
            value: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn test_new_group_waits_for_group_wait() {
        let (dispatcher, notifier) = dispatcher().await;
        let t0 = Utc::now();

        dispatcher.ingest(&[alert("a", NotificationKind::Firing), alert("b", NotificationKind::Firing)], t0);
        assert_eq!(dispatcher.group_count(), 1);

        assert_eq!(dispatcher.flush_due(t0 + ChronoDuration::seconds(10)).await, 0);
        assert_eq!(dispatcher.flush_due(t0 + ChronoDuration::seconds(30)).await, 1);

        let sent = notifier.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "hook");
        assert_eq!(sent[0].1.alerts.len(), 2);
        assert_eq!(sent[0].1.group_labels.get("alertname"), Some("HighCPU"));
    }

    #[tokio::test]
    async fn test_unchanged_group_repeats_after_repeat_interval() {
        let (dispatcher, notifier) = dispatcher().await;
        let t0 = Utc::now();
        dispatcher.ingest(&[alert("a", NotificationKind::Firing)], t0);
        dispatcher.flush_due(t0 + ChronoDuration::seconds(30)).await;

        // A refresh of the same firing alert is not a change
        dispatcher.ingest(&[alert("a", NotificationKind::Refresh)], t0 + ChronoDuration::seconds(60));
        assert_eq!(dispatcher.flush_due(t0 + ChronoDuration::minutes(10)).await, 0);
        assert_eq!(
            dispatcher
                .flush_due(t0 + ChronoDuration::seconds(30) + ChronoDuration::hours(4))
                .await,
            1
        );
        assert_eq!(notifier.sent.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_changes_flush_at_group_interval_and_resolved_are_dropped() {
        let (dispatcher, notifier) = dispatcher().await;
        let t0 = Utc::now();
        dispatcher.ingest(&[alert("a", NotificationKind::Firing)], t0);
        dispatcher.flush_due(t0 + ChronoDuration::seconds(30)).await;

        dispatcher.ingest(&[alert("a", NotificationKind::Resolved)], t0 + ChronoDuration::seconds(40));
        assert_eq!(dispatcher.flush_due(t0 + ChronoDuration::seconds(60)).await, 0);
        assert_eq!(
            dispatcher
                .flush_due(t0 + ChronoDuration::seconds(30) + ChronoDuration::minutes(5))
                .await,
            1
        );

        let sent = notifier.sent.lock();
        assert!(sent[1].1.is_resolved());
        drop(sent);
        assert_eq!(dispatcher.group_count(), 0);
    }

    #[tokio::test]
    async fn test_resolved_without_group_is_ignored() {
        let (dispatcher, _) = dispatcher().await;
        dispatcher.ingest(&[alert("a", NotificationKind::Resolved)], Utc::now());
        assert_eq!(dispatcher.group_count(), 0);
    }

    #[tokio::test]
    async fn test_resolved_firing_alert_opens_group() {
        let (dispatcher, notifier) = dispatcher().await;
        let t0 = Utc::now();

        let mut resolved = alert("a", NotificationKind::Resolved);
        resolved.previous_state = State::Alerting;
        dispatcher.ingest(&[resolved], t0);
        assert_eq!(dispatcher.group_count(), 1);

        assert_eq!(dispatcher.flush_due(t0 + ChronoDuration::seconds(30)).await, 1);
        let sent = notifier.sent.lock();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.is_resolved());
        drop(sent);
        assert_eq!(dispatcher.group_count(), 0);
    }

    #[tokio::test]
    async fn test_group_by_all_splits_per_label_set() {
        let (dispatcher, notifier) = dispatcher().await;
        let t0 = Utc::now();

        let mut a = alert("a", NotificationKind::Firing);
        a.labels.insert("team", "ops");
        let mut b = alert("b", NotificationKind::Firing);
        b.labels.insert("team", "ops");
        dispatcher.ingest(&[a, b], t0);

        assert_eq!(dispatcher.group_count(), 2);
        assert_eq!(dispatcher.flush_due(t0 + ChronoDuration::seconds(30)).await, 2);
        assert!(notifier.sent.lock().iter().all(|(name, _)| name == "ops-hook"));
    }
}
