//! High-availability notification dedup

mod coordinator;
mod layer;

pub use coordinator::{Coordinator, InMemoryCoordinator, RedisCoordinator};
pub use layer::{peer_position, DedupLayer};

use std::sync::Arc;

use crate::config::DedupConfig;
use crate::scheduler::AlertSender;

/// Put `inner` behind a [`DedupLayer`] when dedup is enabled; otherwise hand
/// it back unchanged
pub fn with_dedup<S: AlertSender + 'static>(
    inner: Arc<S>,
    coordinator: Arc<dyn Coordinator>,
    config: &DedupConfig,
) -> Arc<dyn AlertSender> {
    if !config.enabled {
        return inner;
    }
    Arc::new(DedupLayer::new(inner, coordinator, config.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::models::{AlertNotification, InstanceKey, Labels, NotificationKind, State};
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct CountingSender {
        delivered: Mutex<usize>,
    }

    #[async_trait]
    impl AlertSender for CountingSender {
        async fn send_alerts(&self, alerts: Vec<AlertNotification>) -> Result<()> {
            *self.delivered.lock() += alerts.len();
            Ok(())
        }
    }

    fn firing() -> AlertNotification {
        let labels = Labels::from([("alertname", "DiskFull")]);
        let now = Utc::now();
        AlertNotification {
            key: InstanceKey {
                rule_uid: "r1".to_string(),
                fingerprint: labels.fingerprint(),
            },
            rule_title: "DiskFull".to_string(),
            labels,
            annotations: Labels::new(),
            kind: NotificationKind::Firing,
            state: State::Alerting,
            previous_state: State::Pending,
            starts_at: now,
            ends_at: None,
            emitted_at: now,
            value: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn test_with_dedup_follows_enabled_flag() {
        // Ranked behind "a", so a dedup layer holds notifications back
        let mut config = DedupConfig {
            replica_id: "z".to_string(),
            peers: vec!["a".to_string()],
            ..Default::default()
        };

        let direct = Arc::new(CountingSender::default());
        let sender = with_dedup(direct.clone(), Arc::new(InMemoryCoordinator::new()), &config);
        sender.send_alerts(vec![firing()]).await.unwrap();
        assert_eq!(*direct.delivered.lock(), 1);

        config.enabled = true;
        let held = Arc::new(CountingSender::default());
        let sender = with_dedup(held.clone(), Arc::new(InMemoryCoordinator::new()), &config);
        sender.send_alerts(vec![firing()]).await.unwrap();
        assert_eq!(*held.delivered.lock(), 0);
    }
}
