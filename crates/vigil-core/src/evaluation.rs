//! Rule evaluation primitive
//!
//! Executes a rule's queries through the [`QueryExecutor`] collaborator under a
//! bounded timeout and reduces the condition query's series to verdicts. Query
//! failures never escape: they become `Error` entries of the result.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::models::{
    AlertRule, DataFrame, EvaluationEntry, EvaluationResult, FieldType, QueryDefinition, Verdict,
};

/// Absolute time range handed to the query executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Inclusive start
    pub from: DateTime<Utc>,
    /// Inclusive end
    pub to: DateTime<Utc>,
}

impl TimeRange {
    /// Resolve a query's relative range against an evaluation instant
    pub fn for_query(query: &QueryDefinition, at: DateTime<Utc>) -> Self {
        let range = query.relative_time_range;
        Self {
            from: at - to_chrono(range.from),
            to: at - to_chrono(range.to),
        }
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::zero())
}

/// Executes data-source queries. Implementations must be safe to call
/// concurrently for different rules.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Run one query over a time range
    async fn execute(&self, query: &QueryDefinition, range: TimeRange) -> Result<Vec<DataFrame>>;
}

/// Frames or error for one query of a batch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Returned frames
    #[serde(default)]
    pub frames: Vec<DataFrame>,
    /// Error message when the query failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Evaluates rules and ad-hoc query batches
#[derive(Clone)]
pub struct Evaluator {
    executor: Arc<dyn QueryExecutor>,
    query_timeout: Duration,
}

impl Evaluator {
    /// Create a new evaluator
    pub fn new(executor: Arc<dyn QueryExecutor>, query_timeout: Duration) -> Self {
        Self {
            executor,
            query_timeout,
        }
    }

    /// Evaluate a rule at a logical instant. Never fails; query problems are
    /// reported as an `Error` entry.
    pub async fn evaluate(&self, rule: &AlertRule, at: DateTime<Utc>) -> EvaluationResult {
        let entries = match self.run_rule_queries(rule, at).await {
            Ok(frames) => evaluate_condition(rule, &frames),
            Err(e) => {
                warn!(rule_uid = %rule.uid, error = %e, "Rule evaluation failed");
                metrics::counter!("vigil_rule_evaluation_failures_total").increment(1);
                vec![EvaluationEntry::error(e.to_string())]
            }
        };

        metrics::counter!("vigil_rule_evaluations_total").increment(1);

        EvaluationResult {
            rule_uid: rule.uid.clone(),
            evaluated_at: at,
            entries,
        }
    }

    async fn run_rule_queries(
        &self,
        rule: &AlertRule,
        at: DateTime<Utc>,
    ) -> Result<BTreeMap<String, Vec<DataFrame>>> {
        let run = async {
            let mut frames = BTreeMap::new();
            for query in &rule.queries {
                let range = TimeRange::for_query(query, at);
                let result = self.executor.execute(query, range).await.map_err(|e| match e {
                    Error::QueryExecution(_) | Error::QueryTimeout(_) => e,
                    other => Error::query(other.to_string()),
                })?;
                frames.insert(query.ref_id.clone(), result);
            }
            Ok::<_, Error>(frames)
        };

        tokio::time::timeout(self.query_timeout, run)
            .await
            .map_err(|_| Error::QueryTimeout(self.query_timeout))?
    }

    /// Run a batch of queries independently, each under the query timeout.
    /// Used by the evaluation API and the live query runner.
    pub async fn evaluate_queries(
        &self,
        queries: &[QueryDefinition],
        at: DateTime<Utc>,
    ) -> BTreeMap<String, QueryResult> {
        let runs = queries.iter().map(|query| async move {
            let range = TimeRange::for_query(query, at);
            let outcome =
                tokio::time::timeout(self.query_timeout, self.executor.execute(query, range)).await;

            let result = match outcome {
                Ok(Ok(frames)) => QueryResult {
                    frames,
                    error: None,
                },
                Ok(Err(e)) => QueryResult {
                    frames: Vec::new(),
                    error: Some(e.to_string()),
                },
                Err(_) => QueryResult {
                    frames: Vec::new(),
                    error: Some(Error::QueryTimeout(self.query_timeout).to_string()),
                },
            };
            (query.ref_id.clone(), result)
        });

        futures::future::join_all(runs).await.into_iter().collect()
    }
}

/// Reduce the condition query's series to one entry per label set
pub fn evaluate_condition(
    rule: &AlertRule,
    frames: &BTreeMap<String, Vec<DataFrame>>,
) -> Vec<EvaluationEntry> {
    let condition = &rule.condition;

    let Some(frames) = frames.get(&condition.ref_id) else {
        return vec![EvaluationEntry::error(format!(
            "condition refers to unknown query {}",
            condition.ref_id
        ))];
    };

    let mut entries = Vec::new();
    for field in frames
        .iter()
        .flat_map(|f| f.fields.iter())
        .filter(|f| f.field_type == FieldType::Number)
    {
        let Some(value) = condition.reducer.reduce(&field.as_f64()) else {
            continue;
        };

        let verdict = if condition.check(value) {
            Verdict::Alerting
        } else {
            Verdict::Normal
        };

        entries.push(EvaluationEntry {
            labels: field.labels.clone(),
            value: Some(value),
            error: None,
            verdict,
        });
    }

    if entries.is_empty() {
        debug!(rule_uid = %rule.uid, "No data for condition");
        entries.push(EvaluationEntry::no_data());
    }

    entries
}
