//! Notification delivery

mod schema;
mod sender;

pub use schema::{setting, split_addresses, validate_settings, FieldKind, NotifierType, SettingField};
pub use sender::HttpNotifier;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::Result;
use crate::models::{AlertNotification, Labels};

/// A receiver integration ready for delivery, secrets included
#[derive(Debug, Clone, PartialEq)]
pub struct Integration {
    /// Stable identifier, empty when the receiver config left it unset
    pub uid: String,
    /// Display name
    pub name: String,
    /// Notifier type
    pub kind: NotifierType,
    /// Skip notifications whose alerts have all resolved
    pub disable_resolve_message: bool,
    /// Plain settings
    pub settings: Map<String, Value>,
    /// Secure settings in clear
    pub secure_settings: BTreeMap<String, String>,
}

impl Integration {
    /// Setting value, secure values first; empty values read as absent
    pub fn get(&self, name: &str) -> Option<&str> {
        setting(name, &self.settings, &self.secure_settings)
    }
}

/// A flushed aggregation group
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    /// Receiver the group routes to
    pub receiver: String,
    /// Stable identifier of the aggregation group
    pub group_key: String,
    /// Labels shared by the group
    pub group_labels: Labels,
    /// Current alerts of the group
    pub alerts: Vec<AlertNotification>,
}

impl Notification {
    /// Whether every alert in the group has resolved
    pub fn is_resolved(&self) -> bool {
        self.alerts.iter().all(AlertNotification::is_resolved)
    }

    /// `firing` or `resolved`
    pub fn status(&self) -> &'static str {
        if self.is_resolved() {
            "resolved"
        } else {
            "firing"
        }
    }

    /// Number of firing alerts
    pub fn firing_count(&self) -> usize {
        self.alerts.iter().filter(|a| !a.is_resolved()).count()
    }

    /// Labels every alert of the group has in common
    pub fn common_labels(&self) -> Labels {
        let Some(first) = self.alerts.first() else {
            return Labels::new();
        };
        first
            .labels
            .iter()
            .filter(|(k, v)| self.alerts.iter().all(|a| a.labels.get(k) == Some(*v)))
            .collect()
    }
}

/// Delivers a notification through one integration
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send `notification` using `integration`'s settings
    async fn notify(&self, integration: &Integration, notification: &Notification) -> Result<()>;
}
