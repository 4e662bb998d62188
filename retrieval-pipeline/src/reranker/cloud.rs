use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    Retry,
};
use tracing::debug;

use common::{error::AppError, utils::config::RerankerConfig};

/// External reranker endpoint: POST `{query, documents}` → per-document
/// relevance scores. Calls are bounded by the configured timeout and retried
/// with backoff; persistent failure degrades the query to fused ordering.
#[derive(Clone)]
pub struct CloudReranker {
    client: reqwest::Client,
    endpoint: String,
    model: Option<String>,
    api_key: Option<String>,
    timeout: Duration,
    retry_max: usize,
}

#[derive(Serialize)]
struct RerankRequest<'a> {
    query: &'a str,
    documents: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
}

#[derive(Deserialize)]
struct RerankResponse {
    results: Vec<RerankResultRow>,
}

#[derive(Deserialize)]
struct RerankResultRow {
    index: usize,
    relevance_score: f32,
}

impl CloudReranker {
    pub fn from_config(config: &RerankerConfig) -> Result<Self, AppError> {
        let endpoint = config
            .cloud_endpoint
            .clone()
            .ok_or_else(|| AppError::Config("reranker.cloud_endpoint is required".into()))?;
        let timeout = Duration::from_millis(config.timeout_ms.max(1));

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(AppError::Reqwest)?;

        Ok(Self {
            client,
            endpoint,
            model: config.cloud_model.clone(),
            api_key: config.cloud_api_key.clone(),
            timeout,
            retry_max: config.retry_max,
        })
    }

    /// Scores aligned with `documents` order; a document the endpoint did not
    /// score keeps 0.
    pub async fn rerank(&self, query: &str, documents: &[String]) -> Result<Vec<f32>, AppError> {
        let retry_strategy = ExponentialBackoff::from_millis(100)
            .map(jitter)
            .take(self.retry_max);

        let response = Retry::spawn(retry_strategy, || self.call_once(query, documents)).await?;

        let mut scores = vec![0.0f32; documents.len()];
        for row in response.results {
            if let Some(slot) = scores.get_mut(row.index) {
                *slot = row.relevance_score;
            }
        }
        Ok(scores)
    }

    async fn call_once(
        &self,
        query: &str,
        documents: &[String],
    ) -> Result<RerankResponse, AppError> {
        debug!(
            endpoint = %self.endpoint,
            documents = documents.len(),
            "calling cloud reranker"
        );
        let mut request = self.client.post(&self.endpoint).json(&RerankRequest {
            query,
            documents,
            model: self.model.as_deref(),
        });
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| {
                AppError::UpstreamTimeout(format!("cloud reranker after {:?}", self.timeout))
            })??;

        let response = response
            .error_for_status()
            .map_err(|err| AppError::Upstream(format!("cloud reranker: {err}")))?;

        response
            .json::<RerankResponse>()
            .await
            .map_err(|err| AppError::Upstream(format!("cloud reranker payload: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_payload_shape_is_stable() {
        let documents = vec!["fn a() {}".to_owned(), "fn b() {}".to_owned()];
        let request = RerankRequest {
            query: "login",
            documents: &documents,
            model: Some("rerank-v1"),
        };
        let value = serde_json::to_value(&request).expect("serialize");
        assert_eq!(value["query"], "login");
        assert_eq!(value["documents"].as_array().map(Vec::len), Some(2));
        assert_eq!(value["model"], "rerank-v1");
    }

    #[test]
    fn response_scores_align_by_index() {
        let payload = r#"{"results":[
            {"index": 1, "relevance_score": 0.9},
            {"index": 0, "relevance_score": 0.2}
        ]}"#;
        let response: RerankResponse = serde_json::from_str(payload).expect("parse");

        let mut scores = vec![0.0f32; 3];
        for row in response.results {
            scores[row.index] = row.relevance_score;
        }
        assert_eq!(scores, vec![0.2, 0.9, 0.0]);
    }
}
