//! HTTP notification delivery

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::NotifierConfig;
use crate::error::{Error, Result};
use crate::models::{AlertNotification, Labels};

use super::schema::split_addresses;
use super::{Integration, Notification, Notifier, NotifierType};

/// Slack chat API used when an integration has a token instead of a webhook URL
const SLACK_CHAT_API: &str = "https://slack.com/api/chat.postMessage";

/// Sends notifications over HTTP
pub struct HttpNotifier {
    client: Client,
    pagerduty_url: String,
    slack_api_url: String,
}

impl HttpNotifier {
    /// Create a new HTTP notifier
    pub fn new(config: &NotifierConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.http_timeout).build()?;

        Ok(Self {
            client,
            pagerduty_url: config.pagerduty_url.clone(),
            slack_api_url: SLACK_CHAT_API.to_string(),
        })
    }

    /// Send Slack notification
    async fn send_slack(&self, integration: &Integration, n: &Notification) -> Result<()> {
        let color = if n.is_resolved() { "#36a64f" } else { "#d63232" };
        let title = integration
            .get("title")
            .map(String::from)
            .unwrap_or_else(|| default_title(n));

        let mut text = integration
            .get("text")
            .map(String::from)
            .unwrap_or_else(|| alert_lines(n));
        if !n.is_resolved() {
            if let Some(mention) = mentions(integration) {
                text = format!("{mention}\n{text}");
            }
        }

        let payload = SlackPayload {
            channel: integration.get("recipient").map(String::from),
            username: integration.get("username").map(String::from),
            icon_emoji: integration.get("iconEmoji").map(String::from),
            icon_url: integration.get("iconUrl").map(String::from),
            attachments: vec![SlackAttachment {
                color: color.to_string(),
                title,
                text,
                fields: vec![
                    SlackField {
                        title: "Firing".to_string(),
                        value: n.firing_count().to_string(),
                        short: true,
                    },
                    SlackField {
                        title: "Resolved".to_string(),
                        value: (n.alerts.len() - n.firing_count()).to_string(),
                        short: true,
                    },
                ],
                footer: Some("Vigil".to_string()),
                ts: Some(Utc::now().timestamp()),
            }],
        };

        let request = match integration.get("url") {
            Some(url) => self.client.post(url),
            None => {
                let token = integration
                    .get("token")
                    .ok_or_else(|| Error::validation("slack integration has neither url nor token"))?;
                self.client.post(&self.slack_api_url).bearer_auth(token)
            }
        };

        let response = request.json(&payload).send().await?;
        check_status("Slack", response).await?;

        info!(receiver = %n.receiver, integration = %integration.name, "Slack notification sent");
        Ok(())
    }

    /// Send generic webhook notification
    async fn send_webhook(&self, integration: &Integration, n: &Notification) -> Result<()> {
        let url = integration
            .get("url")
            .ok_or_else(|| Error::validation("webhook integration has no url"))?;

        let max_alerts = integration
            .get("maxAlerts")
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|m| *m > 0);
        let alerts: Vec<&AlertNotification> = match max_alerts {
            Some(max) => n.alerts.iter().take(max).collect(),
            None => n.alerts.iter().collect(),
        };
        let truncated = n.alerts.len() - alerts.len();

        let payload = WebhookPayload {
            version: "1",
            group_key: n.group_key.clone(),
            truncated_alerts: truncated,
            status: n.status(),
            receiver: n.receiver.clone(),
            group_labels: n.group_labels.clone(),
            common_labels: n.common_labels(),
            alerts: alerts.into_iter().map(WebhookAlert::from).collect(),
        };

        let mut request = match integration.get("httpMethod") {
            Some(m) if m.eq_ignore_ascii_case("PUT") => self.client.put(url),
            _ => self.client.post(url),
        };
        if let Some(user) = integration.get("username") {
            request = request.basic_auth(user, integration.get("password"));
        }

        let response = request.json(&payload).send().await?;
        check_status("Webhook", response).await?;

        info!(receiver = %n.receiver, url = %url, "Webhook notification sent");
        Ok(())
    }

    /// Send PagerDuty notification
    async fn send_pagerduty(&self, integration: &Integration, n: &Notification) -> Result<()> {
        let routing_key = integration
            .get("integrationKey")
            .ok_or_else(|| Error::validation("pagerduty integration has no integrationKey"))?;
        let severity = integration.get("severity").unwrap_or("critical");

        let payload = PagerDutyPayload {
            routing_key: routing_key.to_string(),
            event_action: if n.is_resolved() { "resolve" } else { "trigger" }.to_string(),
            dedup_key: Some(n.group_key.clone()),
            payload: PagerDutyEventPayload {
                summary: integration
                    .get("summary")
                    .map(String::from)
                    .unwrap_or_else(|| default_title(n)),
                source: "Vigil".to_string(),
                severity: severity.to_string(),
                timestamp: Some(Utc::now().to_rfc3339()),
                class: integration.get("class").map(String::from),
                component: integration.get("component").map(String::from),
                group: integration.get("group").map(String::from),
                custom_details: Some(serde_json::json!({
                    "firing": alert_lines(n),
                    "num_firing": n.firing_count(),
                    "num_resolved": n.alerts.len() - n.firing_count(),
                })),
            },
        };

        let response = self.client.post(&self.pagerduty_url).json(&payload).send().await?;
        check_status("PagerDuty", response).await?;

        info!(receiver = %n.receiver, "PagerDuty notification sent");
        Ok(())
    }

    /// Email is not delivered, only recorded
    fn send_email(&self, integration: &Integration, n: &Notification) -> Result<()> {
        let addresses = integration.get("addresses").map(split_addresses).unwrap_or_default();
        info!(
            receiver = %n.receiver,
            recipients = ?addresses,
            subject = %default_title(n),
            "Email notification recorded"
        );
        Ok(())
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn notify(&self, integration: &Integration, notification: &Notification) -> Result<()> {
        if integration.disable_resolve_message && notification.is_resolved() {
            debug!(
                receiver = %notification.receiver,
                integration = %integration.name,
                "Resolve message disabled, skipping"
            );
            return Ok(());
        }

        match integration.kind {
            NotifierType::Slack => self.send_slack(integration, notification).await,
            NotifierType::Webhook => self.send_webhook(integration, notification).await,
            NotifierType::PagerDuty => self.send_pagerduty(integration, notification).await,
            NotifierType::Email => self.send_email(integration, notification),
        }
    }
}

async fn check_status(target: &str, response: reqwest::Response) -> Result<()> {
    if response.status().is_success() {
        return Ok(());
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Err(Error::internal(format!("{target} returned {status}: {body}")))
}

fn default_title(n: &Notification) -> String {
    let name = n
        .group_labels
        .get("alertname")
        .or_else(|| n.alerts.first().and_then(|a| a.labels.get("alertname")))
        .unwrap_or("alerts");
    if n.is_resolved() {
        format!("[RESOLVED] {name}")
    } else {
        format!("[FIRING:{}] {name}", n.firing_count())
    }
}

fn alert_lines(n: &Notification) -> String {
    n.alerts
        .iter()
        .map(|a| {
            let status = if a.is_resolved() { "resolved" } else { "firing" };
            match a.value {
                Some(v) => format!("{} [{status}] {} value={v}", a.rule_title, a.labels),
                None => format!("{} [{status}] {}", a.rule_title, a.labels),
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn mentions(integration: &Integration) -> Option<String> {
    let mut parts = Vec::new();
    if let Some(channel) = integration.get("mentionChannel") {
        parts.push(format!("<!{channel}>"));
    }
    if let Some(users) = integration.get("mentionUsers") {
        parts.extend(split_addresses(users).into_iter().map(|u| format!("<@{u}>")));
    }
    if let Some(groups) = integration.get("mentionGroups") {
        parts.extend(split_addresses(groups).into_iter().map(|g| format!("<!subteam^{g}>")));
    }
    (!parts.is_empty()).then(|| parts.join(" "))
}

// Slack payload types
#[derive(Debug, Serialize)]
struct SlackPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    icon_emoji: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    icon_url: Option<String>,
    attachments: Vec<SlackAttachment>,
}

#[derive(Debug, Serialize)]
struct SlackAttachment {
    color: String,
    title: String,
    text: String,
    fields: Vec<SlackField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    footer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ts: Option<i64>,
}

#[derive(Debug, Serialize)]
struct SlackField {
    title: String,
    value: String,
    short: bool,
}

// Alertmanager-compatible webhook payload
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookPayload {
    version: &'static str,
    group_key: String,
    truncated_alerts: usize,
    status: &'static str,
    receiver: String,
    group_labels: Labels,
    common_labels: Labels,
    alerts: Vec<WebhookAlert>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookAlert {
    status: &'static str,
    labels: Labels,
    annotations: Labels,
    starts_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ends_at: Option<DateTime<Utc>>,
    fingerprint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<f64>,
}

impl From<&AlertNotification> for WebhookAlert {
    fn from(a: &AlertNotification) -> Self {
        Self {
            status: if a.is_resolved() { "resolved" } else { "firing" },
            labels: a.labels.clone(),
            annotations: a.annotations.clone(),
            starts_at: a.starts_at,
            ends_at: a.ends_at,
            fingerprint: a.key.fingerprint.to_string(),
            value: a.value,
        }
    }
}

// PagerDuty payload types
#[derive(Debug, Serialize)]
struct PagerDutyPayload {
    routing_key: String,
    event_action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    dedup_key: Option<String>,
    payload: PagerDutyEventPayload,
}

#[derive(Debug, Serialize)]
struct PagerDutyEventPayload {
    summary: String,
    source: String,
    severity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    component: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    custom_details: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{InstanceKey, NotificationKind, State};
    use std::collections::BTreeMap;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn alert(kind: NotificationKind) -> AlertNotification {
        let labels = Labels::from([("alertname", "HighCPU"), ("host", "a")]);
        AlertNotification {
            key: InstanceKey {
                rule_uid: "r1".to_string(),
                fingerprint: labels.fingerprint(),
            },
            rule_title: "HighCPU".to_string(),
            labels,
            annotations: Labels::new(),
            kind,
            state: State::Alerting,
            previous_state: State::Normal,
            starts_at: Utc::now(),
            ends_at: None,
            emitted_at: Utc::now(),
            value: Some(95.0),
            error: None,
        }
    }

    fn notification(kind: NotificationKind) -> Notification {
        Notification {
            receiver: "team".to_string(),
            group_key: "0:{alertname=\"HighCPU\"}".to_string(),
            group_labels: Labels::from([("alertname", "HighCPU")]),
            alerts: vec![alert(kind)],
        }
    }

    fn integration(kind: NotifierType, settings: serde_json::Value, secure: &[(&str, &str)]) -> Integration {
        Integration {
            uid: "u1".to_string(),
            name: "test".to_string(),
            kind,
            disable_resolve_message: false,
            settings: settings.as_object().cloned().unwrap_or_default(),
            secure_settings: secure
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    fn notifier(server: &MockServer) -> HttpNotifier {
        HttpNotifier::new(&NotifierConfig {
            pagerduty_url: format!("{}/v2/enqueue", server.uri()),
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_webhook_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(body_partial_json(serde_json::json!({
                "status": "firing",
                "receiver": "team",
                "groupLabels": {"alertname": "HighCPU"},
                "commonLabels": {"alertname": "HighCPU", "host": "a"},
                "alerts": [{"status": "firing", "labels": {"host": "a", "alertname": "HighCPU"}}]
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let integ = integration(
            NotifierType::Webhook,
            serde_json::json!({"url": format!("{}/hook", server.uri())}),
            &[],
        );
        notifier(&server)
            .notify(&integ, &notification(NotificationKind::Firing))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_slack_webhook_uses_secure_url() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/slack"))
            .and(body_partial_json(serde_json::json!({"channel": "#alerts"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let url = format!("{}/slack", server.uri());
        let integ = integration(
            NotifierType::Slack,
            serde_json::json!({"recipient": "#alerts"}),
            &[("url", url.as_str()), ("token", "")],
        );
        notifier(&server)
            .notify(&integ, &notification(NotificationKind::Firing))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_pagerduty_resolve_event() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/enqueue"))
            .and(body_partial_json(serde_json::json!({
                "routing_key": "key-1",
                "event_action": "resolve"
            })))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let integ = integration(NotifierType::PagerDuty, serde_json::json!({}), &[("integrationKey", "key-1")]);
        notifier(&server)
            .notify(&integ, &notification(NotificationKind::Resolved))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_disable_resolve_message_skips_delivery() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let mut integ = integration(
            NotifierType::Webhook,
            serde_json::json!({"url": format!("{}/hook", server.uri())}),
            &[],
        );
        integ.disable_resolve_message = true;

        notifier(&server)
            .notify(&integ, &notification(NotificationKind::Resolved))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("authorization", "Basic dXNlcjpwYXNz"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let integ = integration(
            NotifierType::Webhook,
            serde_json::json!({"url": format!("{}/hook", server.uri()), "username": "user"}),
            &[("password", "pass")],
        );
        let err = notifier(&server)
            .notify(&integ, &notification(NotificationKind::Firing))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("500"));
        assert!(err.to_string().contains("boom"));
    }
}
