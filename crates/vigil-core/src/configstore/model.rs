//! Wire shapes of the Alertmanager configuration API

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Name of the receiver the default configuration routes to
pub const DEFAULT_RECEIVER: &str = "grafana-default-email";

/// A routing tree node as exchanged over the API
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Route {
    /// Receiver of alerts matching this node; inherited when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<String>,

    /// Labels to group by; `...` groups by every label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_by: Option<Vec<String>>,

    /// Keep matching sibling routes after this one matched
    #[serde(rename = "continue", default, skip_serializing_if = "std::ops::Not::not")]
    pub continue_matching: bool,

    /// Matchers in string form, e.g. `team="a"`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matchers: Vec<String>,

    /// Matchers as `[name, op, value]` triples
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub object_matchers: Vec<[String; 3]>,

    /// Legacy equality matchers
    #[serde(rename = "match", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_eq: BTreeMap<String, String>,

    /// Legacy regex matchers
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_re: BTreeMap<String, String>,

    /// Delay before a new group first flushes, e.g. `30s`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_wait: Option<String>,

    /// Delay between flushes of a changed group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_interval: Option<String>,

    /// Delay before an unchanged firing group is sent again
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_interval: Option<String>,

    /// Child routes, tried in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,
}

impl Route {
    /// A route that only names a receiver
    pub fn to_receiver(receiver: impl Into<String>) -> Self {
        Self {
            receiver: Some(receiver.into()),
            ..Default::default()
        }
    }
}

/// Configuration accepted by `POST .../config/api/v1/alerts`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostableUserConfig {
    /// Notification templates by file name
    #[serde(default)]
    pub template_files: Option<BTreeMap<String, String>>,
    /// Routing tree and receivers
    pub alertmanager_config: PostableApiAlertingConfig,
}

/// Routing tree and receivers of a posted configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostableApiAlertingConfig {
    /// Root of the routing tree
    #[serde(default)]
    pub route: Option<Route>,
    /// Template file names
    #[serde(default)]
    pub templates: Option<Vec<String>>,
    /// Named receivers
    #[serde(default)]
    pub receivers: Vec<PostableApiReceiver>,
}

/// A named receiver and its integrations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostableApiReceiver {
    /// Name routes refer to
    pub name: String,
    /// Integrations notified together
    #[serde(default)]
    pub grafana_managed_receiver_configs: Vec<PostableGrafanaReceiver>,
}

/// One integration of a receiver, secrets in clear
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostableGrafanaReceiver {
    /// Stable identifier; secrets of a saved integration merge by it
    #[serde(default)]
    pub uid: String,
    /// Display name
    pub name: String,
    /// Notifier type, e.g. `slack`
    #[serde(rename = "type")]
    pub kind: String,
    /// Part of the configuration served before anything was saved
    #[serde(default)]
    pub is_default: bool,
    /// Legacy reminder flag, stored as given
    #[serde(default)]
    pub send_reminder: bool,
    /// Skip notifications whose alerts have all resolved
    #[serde(default)]
    pub disable_resolve_message: bool,
    /// Legacy reminder frequency, stored as given
    #[serde(default)]
    pub frequency: String,
    /// Plain settings
    #[serde(default)]
    pub settings: Map<String, Value>,
    /// Secret settings; never returned by the API
    #[serde(default)]
    pub secure_settings: BTreeMap<String, String>,
}

/// Configuration returned by `GET .../config/api/v1/alerts`; secrets redacted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GettableUserConfig {
    /// Notification templates by file name
    pub template_files: Option<BTreeMap<String, String>>,
    /// Routing tree and redacted receivers
    pub alertmanager_config: GettableApiAlertingConfig,
}

/// Routing tree and redacted receivers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GettableApiAlertingConfig {
    /// Root of the routing tree
    pub route: Option<Route>,
    /// Template file names
    pub templates: Option<Vec<String>>,
    /// Named receivers
    pub receivers: Vec<GettableApiReceiver>,
}

/// A named receiver with redacted integrations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GettableApiReceiver {
    /// Name routes refer to
    pub name: String,
    /// Integrations notified together
    pub grafana_managed_receiver_configs: Vec<GettableGrafanaReceiver>,
}

/// One integration of a receiver as served by the API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GettableGrafanaReceiver {
    /// Numeric id; always zero
    pub id: i64,
    /// Stable identifier
    pub uid: String,
    /// Display name
    pub name: String,
    /// Notifier type
    #[serde(rename = "type")]
    pub kind: String,
    /// Part of the default configuration
    pub is_default: bool,
    /// Legacy reminder flag
    pub send_reminder: bool,
    /// Skip notifications whose alerts have all resolved
    pub disable_resolve_message: bool,
    /// Legacy reminder frequency
    pub frequency: String,
    /// Creation time
    pub created: DateTime<Utc>,
    /// Last update time
    pub updated: DateTime<Utc>,
    /// Plain settings
    pub settings: Map<String, Value>,
    /// Which secure settings hold a value
    pub secure_fields: BTreeMap<String, bool>,
}

/// `0001-01-01T00:00:00Z`, reported for integrations without timestamps
pub fn zero_time() -> DateTime<Utc> {
    DateTime::from_timestamp(-62_135_596_800, 0).unwrap_or_default()
}

impl From<&PostableGrafanaReceiver> for GettableGrafanaReceiver {
    fn from(r: &PostableGrafanaReceiver) -> Self {
        Self {
            id: 0,
            uid: r.uid.clone(),
            name: r.name.clone(),
            kind: r.kind.clone(),
            is_default: r.is_default,
            send_reminder: r.send_reminder,
            disable_resolve_message: r.disable_resolve_message,
            frequency: r.frequency.clone(),
            created: zero_time(),
            updated: zero_time(),
            settings: r.settings.clone(),
            secure_fields: r.secure_settings.keys().map(|k| (k.clone(), true)).collect(),
        }
    }
}

impl From<&PostableApiReceiver> for GettableApiReceiver {
    fn from(r: &PostableApiReceiver) -> Self {
        Self {
            name: r.name.clone(),
            grafana_managed_receiver_configs: r
                .grafana_managed_receiver_configs
                .iter()
                .map(Into::into)
                .collect(),
        }
    }
}

impl PostableUserConfig {
    /// The configuration served before anything was saved
    pub fn default_config() -> Self {
        let mut settings = Map::new();
        settings.insert("addresses".to_string(), Value::from("<example@email.com>"));

        Self {
            template_files: None,
            alertmanager_config: PostableApiAlertingConfig {
                route: Some(Route::to_receiver(DEFAULT_RECEIVER)),
                templates: None,
                receivers: vec![PostableApiReceiver {
                    name: DEFAULT_RECEIVER.to_string(),
                    grafana_managed_receiver_configs: vec![PostableGrafanaReceiver {
                        uid: String::new(),
                        name: "email receiver".to_string(),
                        kind: "email".to_string(),
                        is_default: true,
                        send_reminder: false,
                        disable_resolve_message: false,
                        frequency: String::new(),
                        settings,
                        secure_settings: BTreeMap::new(),
                    }],
                }],
            },
        }
    }

    /// Secret-free view of this configuration
    pub fn redacted(&self) -> GettableUserConfig {
        GettableUserConfig {
            template_files: self.template_files.clone(),
            alertmanager_config: GettableApiAlertingConfig {
                route: self.alertmanager_config.route.clone(),
                templates: self.alertmanager_config.templates.clone(),
                receivers: self
                    .alertmanager_config
                    .receivers
                    .iter()
                    .map(Into::into)
                    .collect(),
            },
        }
    }

    /// Look up a receiver by name
    pub fn receiver(&self, name: &str) -> Option<&PostableApiReceiver> {
        self.alertmanager_config
            .receivers
            .iter()
            .find(|r| r.name == name)
    }
}
