//! Lease-based notification dedup across replicas

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::DedupConfig;
use crate::error::{Error, Result};
use crate::models::AlertNotification;
use crate::scheduler::AlertSender;

use super::coordinator::Coordinator;

/// Rank of `replica` among itself and its peers; lowest id ranks first
pub fn peer_position(replica: &str, peers: &[String]) -> usize {
    peers
        .iter()
        .filter(|p| p.as_str() < replica)
        .count()
}

/// Wraps an [`AlertSender`] so that only one replica delivers each notification.
///
/// Every replica evaluates the same rules at the same aligned instants, so
/// they produce the same notifications with the same emission instant. That
/// instant is the dedup token. Replica `n` in id order waits
/// `n * peer_timeout` past the emission instant before competing for the
/// lease, giving lower-ranked replicas the first chance to deliver.
pub struct DedupLayer<S> {
    inner: Arc<S>,
    coordinator: Arc<dyn Coordinator>,
    config: DedupConfig,
    position: u32,
    pending: Mutex<BTreeMap<(String, i64), AlertNotification>>,
}

impl<S: AlertSender> DedupLayer<S> {
    /// Create a new dedup layer
    pub fn new(inner: Arc<S>, coordinator: Arc<dyn Coordinator>, config: DedupConfig) -> Self {
        let position = peer_position(&config.replica_id, &config.peers);
        info!(
            replica = %config.replica_id,
            position,
            peers = config.peers.len(),
            "Dedup layer enabled"
        );

        Self {
            inner,
            coordinator,
            position: u32::try_from(position).unwrap_or(u32::MAX),
            config,
            pending: Mutex::new(BTreeMap::new()),
        }
    }

    /// Number of notifications waiting for their turn
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Queue `alerts` and dispatch everything whose turn has come at `now`
    pub async fn dispatch(&self, alerts: Vec<AlertNotification>, now: DateTime<Utc>) -> Result<usize> {
        let mut pending = self.pending.lock().await;
        for alert in alerts {
            let token = alert.emitted_at.timestamp_millis();
            pending.insert((alert.key.to_string(), token), alert);
        }

        let head_start = self.config.peer_timeout.saturating_mul(self.position);
        let head_start = chrono::Duration::from_std(head_start).unwrap_or_else(|_| chrono::Duration::weeks(52));

        let mut granted = Vec::new();
        let mut delivered_elsewhere = Vec::new();
        for ((key, token), alert) in pending.iter() {
            if let Some(watermark) = self.coordinator.delivered_watermark(key).await? {
                if watermark >= *token {
                    delivered_elsewhere.push((key.clone(), *token));
                    continue;
                }
            }

            if now < alert.emitted_at + head_start {
                continue;
            }

            match self
                .coordinator
                .try_acquire(key, &self.config.replica_id, *token, self.config.lease_ttl)
                .await
            {
                Ok(()) => granted.push((key.clone(), *token)),
                Err(e @ Error::LeaseConflict { .. }) => {
                    debug!(alert = %key, token, error = %e, "Lease held elsewhere, retrying next cycle");
                    metrics::counter!("vigil_dedup_lease_conflicts_total").increment(1);
                }
                Err(e) => {
                    warn!(alert = %key, error = %e, "Failed to acquire dispatch lease");
                }
            }
        }

        for id in &delivered_elsewhere {
            pending.remove(id);
        }
        if !delivered_elsewhere.is_empty() {
            metrics::counter!("vigil_dedup_suppressed_total").increment(delivered_elsewhere.len() as u64);
        }

        let batch: Vec<AlertNotification> = granted
            .iter()
            .filter_map(|id| pending.get(id).cloned())
            .collect();
        let count = batch.len();

        self.inner.send_alerts(batch).await?;

        for (key, token) in granted {
            self.coordinator.mark_delivered(&key, token).await?;
            pending.remove(&(key, token));
        }

        Ok(count)
    }
}

#[async_trait]
impl<S: AlertSender> AlertSender for DedupLayer<S> {
    async fn send_alerts(&self, alerts: Vec<AlertNotification>) -> Result<()> {
        self.dispatch(alerts, Utc::now()).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::InMemoryCoordinator;
    use crate::models::{InstanceKey, Labels, NotificationKind, State};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSender {
        sent: parking_lot::Mutex<Vec<AlertNotification>>,
    }

    #[async_trait]
    impl AlertSender for RecordingSender {
        async fn send_alerts(&self, alerts: Vec<AlertNotification>) -> Result<()> {
            self.sent.lock().extend(alerts);
            Ok(())
        }
    }

    fn config(replica: &str, peers: &[&str]) -> DedupConfig {
        DedupConfig {
            enabled: true,
            replica_id: replica.to_string(),
            peers: peers.iter().map(|p| p.to_string()).collect(),
            lease_ttl: Duration::from_secs(30),
            peer_timeout: Duration::from_secs(15),
        }
    }

    fn firing(at: DateTime<Utc>) -> AlertNotification {
        let labels = Labels::from([("alertname", "HighCPU")]);
        AlertNotification {
            key: InstanceKey {
                rule_uid: "r1".to_string(),
                fingerprint: labels.fingerprint(),
            },
            rule_title: "HighCPU".to_string(),
            labels,
            annotations: Labels::new(),
            kind: NotificationKind::Firing,
            state: State::Alerting,
            previous_state: State::Pending,
            starts_at: at,
            ends_at: None,
            emitted_at: at,
            value: Some(1.0),
            error: None,
        }
    }

    fn replica(
        coordinator: &Arc<InMemoryCoordinator>,
        id: &str,
        peers: &[&str],
    ) -> (DedupLayer<RecordingSender>, Arc<RecordingSender>) {
        let sender = Arc::new(RecordingSender::default());
        let layer = DedupLayer::new(sender.clone(), coordinator.clone(), config(id, peers));
        (layer, sender)
    }

    #[test]
    fn test_peer_position_orders_by_id() {
        let peers = vec!["c".to_string(), "a".to_string(), "b".to_string()];
        assert_eq!(peer_position("a", &peers), 0);
        assert_eq!(peer_position("b", &peers), 1);
        assert_eq!(peer_position("c", &peers), 2);
        assert_eq!(peer_position("solo", &[]), 0);
    }

    #[tokio::test]
    async fn test_two_replicas_deliver_once() {
        let coordinator = Arc::new(InMemoryCoordinator::new());
        let (a, sent_a) = replica(&coordinator, "a", &["b"]);
        let (b, sent_b) = replica(&coordinator, "b", &["a"]);
        let t0 = Utc::now();

        assert_eq!(b.dispatch(vec![firing(t0)], t0).await.unwrap(), 0);
        assert_eq!(a.dispatch(vec![firing(t0)], t0).await.unwrap(), 1);

        let later = t0 + chrono::Duration::seconds(20);
        assert_eq!(b.dispatch(Vec::new(), later).await.unwrap(), 0);
        assert_eq!(b.pending_count().await, 0);

        assert_eq!(sent_a.lock_len(), 1);
        assert_eq!(sent_b.lock_len(), 0);
    }

    #[tokio::test]
    async fn test_higher_ranked_replica_takes_over_when_first_is_silent() {
        let coordinator = Arc::new(InMemoryCoordinator::new());
        let (b, sent_b) = replica(&coordinator, "b", &["a"]);
        let t0 = Utc::now();

        assert_eq!(b.dispatch(vec![firing(t0)], t0 + chrono::Duration::seconds(5)).await.unwrap(), 0);
        assert_eq!(b.dispatch(Vec::new(), t0 + chrono::Duration::seconds(15)).await.unwrap(), 1);
        assert_eq!(sent_b.lock_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_is_redispatched() {
        let coordinator = Arc::new(InMemoryCoordinator::new());
        let (b, sent_b) = replica(&coordinator, "b", &["a"]);
        let t0 = Utc::now();
        let alert = firing(t0);

        // Replica a takes the lease and dies before delivering
        coordinator
            .try_acquire(&alert.key.to_string(), "a", t0.timestamp_millis(), Duration::from_secs(30))
            .await
            .unwrap();

        let later = t0 + chrono::Duration::seconds(20);
        assert_eq!(b.dispatch(vec![alert], later).await.unwrap(), 0);
        assert_eq!(b.pending_count().await, 1);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(b.dispatch(Vec::new(), later).await.unwrap(), 1);
        assert_eq!(sent_b.lock_len(), 1);
        assert_eq!(b.pending_count().await, 0);
    }

    impl RecordingSender {
        fn lock_len(&self) -> usize {
            self.sent.lock().len()
        }
    }
}
