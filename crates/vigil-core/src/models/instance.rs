//! Alert instances, evaluation results and the notifications derived from them

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::labels::{Fingerprint, Labels};

/// State of one alert instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum State {
    /// Not breaching
    #[default]
    Normal,
    /// Breaching, waiting for the `for` duration to elapse
    Pending,
    /// Firing
    Alerting,
    /// The rule returned no data
    NoData,
    /// The rule could not be evaluated
    Error,
}

impl State {
    /// States that are delivered to receivers as firing alerts
    pub fn is_firing(self) -> bool {
        matches!(self, Self::Alerting | Self::NoData | Self::Error)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Normal => "Normal",
            Self::Pending => "Pending",
            Self::Alerting => "Alerting",
            Self::NoData => "NoData",
            Self::Error => "Error",
        };
        f.write_str(s)
    }
}

/// Why an instance is in its current state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StateReason {
    /// Decided by the rule condition
    #[default]
    Condition,
    /// The series disappeared from the query result
    MissingSeries,
    /// No data, mapped through the rule's no-data policy
    NoData,
    /// Query failure, mapped through the rule's error policy
    Error,
    /// Rule definition changed or was deleted
    RuleUpdated,
}

/// Verdict for one label set in one evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    /// Condition breached
    Alerting,
    /// Condition not breached
    Normal,
    /// Nothing to evaluate
    NoData,
    /// Evaluation failed
    Error,
}

/// One series of an evaluation result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationEntry {
    /// Series labels
    pub labels: Labels,
    /// Reduced value, if any
    pub value: Option<f64>,
    /// Error message for `Error` verdicts
    pub error: Option<String>,
    /// Outcome
    pub verdict: Verdict,
}

impl EvaluationEntry {
    /// Error entry with empty labels
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            labels: Labels::new(),
            value: None,
            error: Some(message.into()),
            verdict: Verdict::Error,
        }
    }

    /// NoData entry with empty labels
    pub fn no_data() -> Self {
        Self {
            labels: Labels::new(),
            value: None,
            error: None,
            verdict: Verdict::NoData,
        }
    }
}

/// Outcome of evaluating one rule at one instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    /// Rule that was evaluated
    pub rule_uid: String,
    /// Logical evaluation instant shared by the whole group
    pub evaluated_at: DateTime<Utc>,
    /// Per-series outcomes
    pub entries: Vec<EvaluationEntry>,
}

/// Identity of an alert instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceKey {
    /// Owning rule
    pub rule_uid: String,
    /// Fingerprint of the instance labels
    pub fingerprint: Fingerprint,
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.rule_uid, self.fingerprint)
    }
}

/// Tracked state of one (rule, label set)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertInstance {
    /// Identity
    pub key: InstanceKey,
    /// Full label set (rule labels merged over series labels)
    pub labels: Labels,
    /// Current state
    pub state: State,
    /// Why the instance is in `state`
    pub state_reason: StateReason,
    /// Start of the current breach episode
    pub first_breach_at: Option<DateTime<Utc>>,
    /// Most recent evaluation that touched this instance
    pub last_evaluated_at: DateTime<Utc>,
    /// When the instance last moved to Normal from a firing/pending state
    pub resolved_at: Option<DateTime<Utc>>,
    /// Last time a notification for this instance was handed to delivery
    pub last_sent_at: Option<DateTime<Utc>>,
    /// Instant of the last state change
    pub last_transition_at: DateTime<Utc>,
    /// Last reduced value
    pub last_value: Option<f64>,
    /// Last evaluation error, kept until the next successful evaluation
    pub last_error: Option<String>,
}

impl AlertInstance {
    /// New instance in the Normal state
    pub fn new(key: InstanceKey, labels: Labels, at: DateTime<Utc>) -> Self {
        Self {
            key,
            labels,
            state: State::Normal,
            state_reason: StateReason::Condition,
            first_breach_at: None,
            last_evaluated_at: at,
            resolved_at: None,
            last_sent_at: None,
            last_transition_at: at,
            last_value: None,
            last_error: None,
        }
    }
}

/// Kind of outbound notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    /// The instance started firing
    Firing,
    /// The instance stopped firing
    Resolved,
    /// The instance is still firing; re-offered after the resend delay
    Refresh,
}

/// An alert handed from the state machine to delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertNotification {
    /// Instance identity
    pub key: InstanceKey,
    /// Rule title
    pub rule_title: String,
    /// Instance labels, including `alertname`
    pub labels: Labels,
    /// Rule annotations
    pub annotations: Labels,
    /// What happened
    pub kind: NotificationKind,
    /// State after the transition
    pub state: State,
    /// State before the transition
    pub previous_state: State,
    /// Start of the firing episode
    pub starts_at: DateTime<Utc>,
    /// When the alert resolved, for `Resolved`
    pub ends_at: Option<DateTime<Utc>>,
    /// Instant this notification was produced; used as the dedup token
    pub emitted_at: DateTime<Utc>,
    /// Last reduced value
    pub value: Option<f64>,
    /// Last evaluation error
    pub error: Option<String>,
}

impl AlertNotification {
    /// Whether receivers should treat this alert as resolved
    pub fn is_resolved(&self) -> bool {
        self.kind == NotificationKind::Resolved
    }
}
