//! Declared settings of each notifier type

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Supported integration types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifierType {
    /// Email (delivery is logged)
    Email,
    /// Slack webhook or bot token
    Slack,
    /// Generic webhook
    Webhook,
    /// PagerDuty Events API v2
    PagerDuty,
}

impl NotifierType {
    /// Every supported type
    pub const ALL: [NotifierType; 4] = [Self::Email, Self::Slack, Self::Webhook, Self::PagerDuty];

    /// Wire name of the type
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Slack => "slack",
            Self::Webhook => "webhook",
            Self::PagerDuty => "pagerduty",
        }
    }

    /// Settings this type understands
    pub fn schema(self) -> &'static [SettingField] {
        match self {
            Self::Email => EMAIL,
            Self::Slack => SLACK,
            Self::Webhook => WEBHOOK,
            Self::PagerDuty => PAGERDUTY,
        }
    }
}

impl fmt::Display for NotifierType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotifierType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::config_validation(format!("notifier type {s:?} is not supported")))
    }
}

/// Value kind of a setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    /// Free text
    Text,
    /// Absolute URL
    Url,
    /// `true` / `false`
    Bool,
    /// Separated list of email addresses
    Addresses,
}

/// One declared setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SettingField {
    /// Key in `settings` or `secureSettings`
    pub name: &'static str,
    /// Value type
    pub kind: FieldKind,
    /// Must hold a non-empty value
    pub required: bool,
    /// Stored write-only and reported through `secureFields`
    pub secure: bool,
}

const fn field(name: &'static str, kind: FieldKind, required: bool, secure: bool) -> SettingField {
    SettingField {
        name,
        kind,
        required,
        secure,
    }
}

const EMAIL: &[SettingField] = &[
    field("addresses", FieldKind::Addresses, true, false),
    field("singleEmail", FieldKind::Bool, false, false),
    field("message", FieldKind::Text, false, false),
    field("subject", FieldKind::Text, false, false),
];

const SLACK: &[SettingField] = &[
    field("url", FieldKind::Url, false, true),
    field("token", FieldKind::Text, false, true),
    field("recipient", FieldKind::Text, false, false),
    field("username", FieldKind::Text, false, false),
    field("iconEmoji", FieldKind::Text, false, false),
    field("iconUrl", FieldKind::Url, false, false),
    field("mentionUsers", FieldKind::Text, false, false),
    field("mentionGroups", FieldKind::Text, false, false),
    field("mentionChannel", FieldKind::Text, false, false),
    field("title", FieldKind::Text, false, false),
    field("text", FieldKind::Text, false, false),
];

const WEBHOOK: &[SettingField] = &[
    field("url", FieldKind::Url, true, false),
    field("httpMethod", FieldKind::Text, false, false),
    field("username", FieldKind::Text, false, false),
    field("password", FieldKind::Text, false, true),
    field("maxAlerts", FieldKind::Text, false, false),
];

const PAGERDUTY: &[SettingField] = &[
    field("integrationKey", FieldKind::Text, true, true),
    field("severity", FieldKind::Text, false, false),
    field("class", FieldKind::Text, false, false),
    field("component", FieldKind::Text, false, false),
    field("group", FieldKind::Text, false, false),
    field("summary", FieldKind::Text, false, false),
];

/// Non-empty value of a setting, looked up in the secure map first
pub fn setting<'a>(
    name: &str,
    settings: &'a Map<String, Value>,
    secure: &'a BTreeMap<String, String>,
) -> Option<&'a str> {
    secure
        .get(name)
        .map(String::as_str)
        .or_else(|| settings.get(name).and_then(Value::as_str))
        .filter(|v| !v.is_empty())
}

/// Check an integration's settings against its type's schema
pub fn validate_settings(
    kind: NotifierType,
    settings: &Map<String, Value>,
    secure: &BTreeMap<String, String>,
) -> Result<()> {
    for field in kind.schema() {
        let value = setting(field.name, settings, secure);

        match (value, field.required) {
            (None, true) => {
                return Err(Error::validation(format!("could not find {} property in settings", field.name)))
            }
            (None, false) => continue,
            (Some(v), _) => check_kind(field, v)?,
        }
    }

    if kind == NotifierType::Slack {
        let url = setting("url", settings, secure);
        let token = setting("token", settings, secure);
        if url.is_none() && token.is_none() {
            return Err(Error::validation("token must be specified when url is not"));
        }
        if url.is_none() && setting("recipient", settings, secure).is_none() {
            return Err(Error::validation("recipient must be specified when using the Slack chat API"));
        }
    }

    Ok(())
}

fn check_kind(field: &SettingField, value: &str) -> Result<()> {
    match field.kind {
        FieldKind::Text => Ok(()),
        FieldKind::Url => url::Url::parse(value)
            .map(|_| ())
            .map_err(|e| Error::validation(format!("invalid URL in {}: {e}", field.name))),
        FieldKind::Bool => value
            .parse::<bool>()
            .map(|_| ())
            .map_err(|_| Error::validation(format!("{} must be true or false", field.name))),
        FieldKind::Addresses => {
            if split_addresses(value).is_empty() {
                Err(Error::validation("could not find addresses in settings"))
            } else {
                Ok(())
            }
        }
    }
}

/// Addresses separated by `;`, `,` or newlines
pub fn split_addresses(value: &str) -> Vec<&str> {
    value
        .split(|c| c == ';' || c == ',' || c == '\n')
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn map(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap_or_default()
    }

    fn secure(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_type_names_round_trip() {
        for t in NotifierType::ALL {
            assert_eq!(t.as_str().parse::<NotifierType>().unwrap(), t);
        }
        assert!("opsgenie".parse::<NotifierType>().is_err());
    }

    #[rstest]
    #[case(NotifierType::Email, json!({"addresses": "<example@email.com>"}), &[], true)]
    #[case(NotifierType::Email, json!({}), &[], false)]
    #[case(NotifierType::Email, json!({"addresses": " ; "}), &[], false)]
    #[case(NotifierType::Slack, json!({"recipient": "#alerts"}), &[("url", "https://hooks.slack.com/x")], true)]
    #[case(NotifierType::Slack, json!({"recipient": "#alerts"}), &[("token", ""), ("url", "https://hooks.slack.com/x")], true)]
    #[case(NotifierType::Slack, json!({"recipient": "#alerts"}), &[("token", "xoxb-1")], true)]
    #[case(NotifierType::Slack, json!({}), &[("token", "xoxb-1")], false)]
    #[case(NotifierType::Slack, json!({"recipient": "#alerts"}), &[], false)]
    #[case(NotifierType::Slack, json!({}), &[("url", "not a url")], false)]
    #[case(NotifierType::Webhook, json!({"url": "http://example.com/hook"}), &[], true)]
    #[case(NotifierType::Webhook, json!({}), &[], false)]
    #[case(NotifierType::PagerDuty, json!({}), &[("integrationKey", "abc")], true)]
    #[case(NotifierType::PagerDuty, json!({"severity": "critical"}), &[], false)]
    fn test_validate_settings(
        #[case] kind: NotifierType,
        #[case] settings: Value,
        #[case] secrets: &[(&str, &str)],
        #[case] ok: bool,
    ) {
        let result = validate_settings(kind, &map(settings), &secure(secrets));
        assert_eq!(result.is_ok(), ok, "{result:?}");
    }

    #[test]
    fn test_secure_value_wins_over_plain() {
        let settings = map(json!({"url": "http://plain"}));
        let secrets = secure(&[("url", "http://secret")]);
        assert_eq!(setting("url", &settings, &secrets), Some("http://secret"));
    }
}
