use async_trait::async_trait;
use infoguard_analysis::{
    clean_topic_label, ClusterError, OracleError, SimilarityOracle, TopicClusterer,
    TOPIC_MAX_KEYWORDS,
};
use infoguard_core::TopicCluster;
use infoguard_storage::HttpFetcher;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::info;

const OUTLIER_TOPIC_ID: i64 = -1;

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    inputs: [&'a str; 2],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    embeddings: Vec<Vec<f64>>,
}

/// Similarity from an embedding service: cosine of the two L2-normalized vectors.
pub struct EmbeddingServiceOracle {
    http: HttpFetcher,
    endpoint: String,
}

impl EmbeddingServiceOracle {
    pub fn new(http: HttpFetcher, endpoint: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl SimilarityOracle for EmbeddingServiceOracle {
    async fn similarity(&self, text_a: &str, text_b: &str) -> Result<f64, OracleError> {
        let request = EmbeddingRequest {
            inputs: [text_a, text_b],
        };
        let payload = self
            .http
            .post_json(&self.endpoint, &request)
            .await
            .map_err(|e| OracleError::Unavailable(e.to_string()))?;
        similarity_from_embeddings(&payload)
    }
}

pub fn similarity_from_embeddings(payload: &JsonValue) -> Result<f64, OracleError> {
    let response = EmbeddingResponse::deserialize(payload)
        .map_err(|e| OracleError::Malformed(e.to_string()))?;
    match response.embeddings.as_slice() {
        [a, b] => cosine_similarity(a, b)
            .ok_or_else(|| OracleError::Malformed("embedding vectors are empty, zero or mismatched".into())),
        other => Err(OracleError::Malformed(format!(
            "expected 2 embeddings, got {}",
            other.len()
        ))),
    }
}

/// Cosine similarity of two vectors; `None` for mismatched, empty or zero-length input.
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> Option<f64> {
    if a.is_empty() || a.len() != b.len() {
        return None;
    }
    let norm_a = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 || !norm_a.is_finite() || !norm_b.is_finite() {
        return None;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| (x / norm_a) * (y / norm_b)).sum();
    Some(dot)
}

#[derive(Debug, Serialize)]
struct ClusterRequest<'a> {
    texts: &'a [String],
}

#[derive(Debug, Deserialize)]
struct ClusterResponse {
    topics: Vec<ClusterTopic>,
}

#[derive(Debug, Deserialize)]
struct ClusterTopic {
    id: i64,
    count: u32,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    keywords: Vec<String>,
}

/// Topic clustering over HTTP.
pub struct ClusteringServiceClient {
    http: HttpFetcher,
    endpoint: String,
}

impl ClusteringServiceClient {
    pub fn new(http: HttpFetcher, endpoint: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl TopicClusterer for ClusteringServiceClient {
    async fn cluster(&self, texts: &[String]) -> Result<Option<Vec<TopicCluster>>, ClusterError> {
        let payload = self
            .http
            .post_json(&self.endpoint, &ClusterRequest { texts })
            .await
            .map_err(|e| ClusterError::Unavailable(e.to_string()))?;
        let topics = topics_from_response(&payload)?;
        info!(documents = texts.len(), topics = topics.len(), "clustering service responded");
        Ok(Some(topics))
    }
}

/// Decode clustering output, dropping the outlier topic and trimming keywords.
pub fn topics_from_response(payload: &JsonValue) -> Result<Vec<TopicCluster>, ClusterError> {
    let response =
        ClusterResponse::deserialize(payload).map_err(|e| ClusterError::Malformed(e.to_string()))?;
    Ok(response
        .topics
        .into_iter()
        .filter(|topic| topic.id != OUTLIER_TOPIC_ID)
        .map(|topic| {
            let label = topic
                .label
                .filter(|l| !l.trim().is_empty())
                .unwrap_or_else(|| clean_topic_label(&topic.keywords));
            let mut keywords = topic.keywords;
            keywords.truncate(TOPIC_MAX_KEYWORDS);
            TopicCluster {
                topic_id: topic.id,
                count: topic.count,
                label,
                keywords,
            }
        })
        .collect())
}
