//! Transports that carry an ad-hoc evaluation batch to an evaluator

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::LiveQueryConfig;
use crate::error::{Error, Result};
use crate::evaluation::{Evaluator, QueryResult};
use crate::models::QueryDefinition;

/// Path of the evaluation endpoint
pub const EVAL_PATH: &str = "/api/v1/eval";

/// Body of an evaluation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalRequest {
    /// Queries to evaluate
    pub data: Vec<QueryDefinition>,
}

/// Per-query results of an evaluation request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalResponse {
    /// Results keyed by ref id
    #[serde(default)]
    pub results: BTreeMap<String, QueryResult>,
}

/// Runs a query batch; must stop the underlying work when `cancel` fires
#[async_trait]
pub trait EvalTransport: Send + Sync {
    /// Evaluate `queries`, failing with [`Error::Cancelled`] once `cancel` fires
    async fn evaluate(&self, queries: &[QueryDefinition], cancel: CancellationToken) -> Result<EvalResponse>;
}

/// Evaluates through the HTTP evaluation API
#[derive(Clone)]
pub struct HttpEvalTransport {
    client: Client,
    url: String,
}

impl HttpEvalTransport {
    /// Create a new HTTP transport
    pub fn new(config: &LiveQueryConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.request_timeout).build()?;

        Ok(Self {
            client,
            url: format!("{}{EVAL_PATH}", config.base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl EvalTransport for HttpEvalTransport {
    async fn evaluate(&self, queries: &[QueryDefinition], cancel: CancellationToken) -> Result<EvalResponse> {
        let body = EvalRequest {
            data: queries.to_vec(),
        };

        // Dropping the request future on cancel closes the connection
        let request = async {
            let response = self.client.post(&self.url).json(&body).send().await?;
            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(Error::query(format!("evaluation failed with {status}: {text}")));
            }
            Ok(response.json::<EvalResponse>().await?)
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(url = %self.url, "Evaluation request cancelled");
                Err(Error::Cancelled)
            }
            result = request => result,
        }
    }
}

/// Evaluates in process with an [`Evaluator`]
#[derive(Clone)]
pub struct LocalEvalTransport {
    evaluator: Evaluator,
}

impl LocalEvalTransport {
    /// Create a new local transport
    pub fn new(evaluator: Evaluator) -> Self {
        Self { evaluator }
    }
}

#[async_trait]
impl EvalTransport for LocalEvalTransport {
    async fn evaluate(&self, queries: &[QueryDefinition], cancel: CancellationToken) -> Result<EvalResponse> {
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            results = self.evaluator.evaluate_queries(queries, Utc::now()) => Ok(EvalResponse { results }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn query(ref_id: &str) -> QueryDefinition {
        QueryDefinition {
            ref_id: ref_id.to_string(),
            datasource_uid: "prom".to_string(),
            model: serde_json::json!({"expr": "up"}),
            relative_time_range: Default::default(),
        }
    }

    fn transport(server: &MockServer) -> HttpEvalTransport {
        HttpEvalTransport::new(&LiveQueryConfig {
            base_url: server.uri(),
            request_timeout: Duration::from_secs(10),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_http_transport_posts_batch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(EVAL_PATH))
            .and(body_partial_json(serde_json::json!({"data": [{"refId": "A"}]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "results": {"A": {"frames": [{
                    "schema": {"refId": "A", "fields": [{"name": "value", "type": "number"}]},
                    "data": {"values": [[1.0]]}
                }]}}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let response = transport(&server)
            .evaluate(&[query("A")], CancellationToken::new())
            .await
            .unwrap();

        let result = &response.results["A"];
        assert_eq!(result.frames.len(), 1);
        assert_eq!(result.frames[0].fields[0].name, "value");
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_http_transport_reports_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(EVAL_PATH))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let err = transport(&server)
            .evaluate(&[query("A")], CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_http_transport_cancel_drops_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(EVAL_PATH))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = transport(&server).evaluate(&[query("A")], cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
