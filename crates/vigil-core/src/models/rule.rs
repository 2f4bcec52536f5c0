//! Alert rule data models

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::labels::Labels;

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    /// Greater than
    Gt,
    /// Less than
    Lt,
    /// Equal to
    Eq,
    /// Greater than or equal to
    Gte,
    /// Less than or equal to
    Lte,
    /// Not equal to
    Ne,
}

/// How a series is reduced to one number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Reducer {
    /// Most recent non-NaN value
    #[default]
    Last,
    /// Arithmetic mean
    Mean,
    /// Minimum
    Min,
    /// Maximum
    Max,
    /// Sum
    Sum,
    /// Number of non-NaN values
    Count,
}

impl Reducer {
    /// Reduce a series; `None` when there is nothing to reduce
    pub fn reduce(self, values: &[f64]) -> Option<f64> {
        let mut finite = values.iter().copied().filter(|v| !v.is_nan()).peekable();
        finite.peek()?;

        let result = match self {
            Self::Last => finite.last()?,
            Self::Mean => {
                let (sum, n) = finite.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
                sum / n as f64
            }
            Self::Min => finite.fold(f64::INFINITY, f64::min),
            Self::Max => finite.fold(f64::NEG_INFINITY, f64::max),
            Self::Sum => finite.sum(),
            Self::Count => finite.count() as f64,
        };

        Some(result)
    }
}

/// Rule condition: reduce the series of one query and compare against a threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Query whose frames are evaluated
    pub ref_id: String,
    /// Series reducer
    #[serde(default)]
    pub reducer: Reducer,
    /// Comparison operator
    pub operator: Operator,
    /// Threshold value
    pub threshold: f64,
}

impl Condition {
    /// Check if a value breaches this condition
    pub fn check(&self, value: f64) -> bool {
        let threshold = self.threshold;

        match self.operator {
            Operator::Gt => value > threshold,
            Operator::Lt => value < threshold,
            Operator::Eq => (value - threshold).abs() < f64::EPSILON,
            Operator::Gte => value >= threshold,
            Operator::Lte => value <= threshold,
            Operator::Ne => (value - threshold).abs() >= f64::EPSILON,
        }
    }
}

/// Time range relative to the evaluation instant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelativeTimeRange {
    /// How far before the evaluation instant the range starts
    #[serde(with = "humantime_serde")]
    pub from: Duration,
    /// How far before the evaluation instant the range ends
    #[serde(with = "humantime_serde", default)]
    pub to: Duration,
}

impl Default for RelativeTimeRange {
    fn default() -> Self {
        Self {
            from: Duration::from_secs(600),
            to: Duration::ZERO,
        }
    }
}

/// One query of a rule, opaque to everything but the query executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDefinition {
    /// Reference id, unique within a rule
    pub ref_id: String,
    /// Data source the query runs against
    #[serde(default)]
    pub datasource_uid: String,
    /// Data-source specific query model
    #[serde(default)]
    pub model: serde_json::Value,
    /// Range of data to query
    #[serde(default)]
    pub relative_time_range: RelativeTimeRange,
}

/// What to do when a rule's queries return no data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NoDataPolicy {
    /// Treat as a breach
    Alerting,
    /// Treat as healthy
    Ok,
    /// Keep whatever state the instance had
    KeepLast,
    /// Move to the dedicated NoData state
    #[default]
    NoData,
}

/// What to do when a rule's queries fail or time out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Treat as a breach
    Alerting,
    /// Treat as healthy
    Ok,
    /// Keep whatever state the instance had
    KeepLast,
    /// Move to the dedicated Error state
    #[default]
    Error,
}

/// An alert rule definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    /// Unique identifier
    pub uid: String,

    /// Human-readable name
    pub title: String,

    /// Queries executed on every evaluation
    pub queries: Vec<QueryDefinition>,

    /// Condition deciding whether a series breaches
    pub condition: Condition,

    /// Minimum time a breach must persist before firing
    #[serde(rename = "for", with = "humantime_serde", default)]
    pub for_duration: Duration,

    /// Labels attached to every instance
    #[serde(default)]
    pub labels: Labels,

    /// Annotations attached to every notification
    #[serde(default)]
    pub annotations: Labels,

    /// No-data handling
    #[serde(default)]
    pub no_data_state: NoDataPolicy,

    /// Error handling
    #[serde(default)]
    pub exec_err_state: ErrorPolicy,
}

impl AlertRule {
    /// Hash of everything that defines what the rule measures.
    ///
    /// A change invalidates the `for` timers of pending instances.
    pub fn identity(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.uid.hash(&mut hasher);
        for query in &self.queries {
            query.ref_id.hash(&mut hasher);
            query.datasource_uid.hash(&mut hasher);
            query.model.to_string().hash(&mut hasher);
            query.relative_time_range.hash(&mut hasher);
        }
        self.condition.ref_id.hash(&mut hasher);
        self.condition.reducer.hash(&mut hasher);
        self.condition.operator.hash(&mut hasher);
        self.condition.threshold.to_bits().hash(&mut hasher);
        hasher.finish()
    }
}

/// Identifies a rule group
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKey {
    /// Folder / namespace owning the group
    pub namespace: String,
    /// Group name, unique within the namespace
    pub name: String,
}

impl GroupKey {
    /// Create a group key
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A set of rules evaluated together on one schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleGroup {
    /// Group identity
    #[serde(flatten)]
    pub key: GroupKey,
    /// Evaluation interval; the scheduler default applies when absent
    #[serde(with = "humantime_serde", default)]
    pub interval: Option<Duration>,
    /// Rules, evaluated in order
    pub rules: Vec<AlertRule>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn condition(operator: Operator, threshold: f64) -> Condition {
        Condition {
            ref_id: "A".to_string(),
            reducer: Reducer::Last,
            operator,
            threshold,
        }
    }

    #[test]
    fn test_condition_operators() {
        assert!(condition(Operator::Gt, 10.0).check(11.0));
        assert!(!condition(Operator::Gt, 10.0).check(10.0));
        assert!(condition(Operator::Gte, 10.0).check(10.0));
        assert!(condition(Operator::Lt, 10.0).check(9.5));
        assert!(condition(Operator::Lte, 10.0).check(10.0));
        assert!(condition(Operator::Eq, 10.0).check(10.0));
        assert!(condition(Operator::Ne, 10.0).check(10.1));
    }

    #[test]
    fn test_reducers_skip_nan() {
        let values = [1.0, f64::NAN, 3.0, 2.0];
        assert_eq!(Reducer::Last.reduce(&values), Some(2.0));
        assert_eq!(Reducer::Mean.reduce(&values), Some(2.0));
        assert_eq!(Reducer::Min.reduce(&values), Some(1.0));
        assert_eq!(Reducer::Max.reduce(&values), Some(3.0));
        assert_eq!(Reducer::Sum.reduce(&values), Some(6.0));
        assert_eq!(Reducer::Count.reduce(&values), Some(3.0));
        assert_eq!(Reducer::Last.reduce(&[f64::NAN]), None);
        assert_eq!(Reducer::Count.reduce(&[]), None);
    }

    #[test]
    fn test_rule_deserializes_for_duration() {
        let rule: AlertRule = serde_json::from_value(serde_json::json!({
            "uid": "r1",
            "title": "High CPU",
            "queries": [{"refId": "A", "datasourceUid": "prom", "model": {"expr": "up"}, "relativeTimeRange": {"from": "10m"}}],
            "condition": {"ref_id": "A", "operator": "gt", "threshold": 80.0},
            "for": "5m",
            "labels": {"team": "a"}
        }))
        .unwrap();

        assert_eq!(rule.for_duration, Duration::from_secs(300));
        assert_eq!(rule.no_data_state, NoDataPolicy::NoData);
        assert_eq!(rule.exec_err_state, ErrorPolicy::Error);
        assert_eq!(rule.queries[0].relative_time_range.from, Duration::from_secs(600));
    }

    #[test]
    fn test_identity_ignores_labels_but_not_threshold() {
        let rule: AlertRule = serde_json::from_value(serde_json::json!({
            "uid": "r1",
            "title": "t",
            "queries": [],
            "condition": {"ref_id": "A", "operator": "gt", "threshold": 1.0}
        }))
        .unwrap();

        let mut relabeled = rule.clone();
        relabeled.labels.insert("team", "b");
        assert_eq!(rule.identity(), relabeled.identity());

        let mut rethresholded = rule.clone();
        rethresholded.condition.threshold = 2.0;
        assert_ne!(rule.identity(), rethresholded.identity());
    }
}
