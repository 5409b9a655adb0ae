//! HTTP embedding providers.
//!
//! Two wire flavors: Google Generative Language `batchEmbedContents` and the
//! OpenAI-compatible `/embeddings` endpoint. Only Gemini takes a task type;
//! the OpenAI endpoint ignores it.

use std::time::Duration;

use async_trait::async_trait;
use rag_types::{EmbeddingSettings, ProviderKind, TaskType};
use reqwest::{Client, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::EmbeddingError;
use crate::provider::{check_vectors, EmbeddingProvider};

/// Default Gemini API base
pub const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Default OpenAI API base
pub const OPENAI_API_BASE: &str = "https://api.openai.com/v1";

/// Retry hints below this are raised to it.
const MIN_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Used when a 429 carries no readable hint.
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(10);

const RETRY_INFO_TYPE: &str = "type.googleapis.com/google.rpc.RetryInfo";

/// Wire format spoken by the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiFlavor {
    Gemini,
    OpenAi,
}

/// Configuration for an HTTP embedding provider.
#[derive(Debug, Clone)]
pub struct HttpProviderConfig {
    pub flavor: ApiFlavor,

    /// API base URL (e.g., "https://api.openai.com/v1")
    pub base_url: String,

    /// Model name (e.g., "models/gemini-embedding-001")
    pub model: String,

    /// API key
    pub api_key: SecretString,

    /// Requested output dimension
    pub dimension: usize,

    /// Request timeout
    pub timeout: Duration,
}

impl HttpProviderConfig {
    /// Create config for the Gemini API.
    pub fn gemini(api_key: impl Into<String>, model: impl Into<String>, dimension: usize) -> Self {
        Self {
            flavor: ApiFlavor::Gemini,
            base_url: GEMINI_API_BASE.to_string(),
            model: model.into(),
            api_key: SecretString::from(api_key.into()),
            dimension,
            timeout: Duration::from_secs(60),
        }
    }

    /// Create config for the OpenAI API.
    pub fn openai(api_key: impl Into<String>, model: impl Into<String>, dimension: usize) -> Self {
        Self {
            flavor: ApiFlavor::OpenAi,
            base_url: OPENAI_API_BASE.to_string(),
            model: model.into(),
            api_key: SecretString::from(api_key.into()),
            dimension,
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

/// HTTP-backed embedding provider.
pub struct HttpEmbeddingProvider {
    client: Client,
    config: HttpProviderConfig,
    model_version: String,
}

impl HttpEmbeddingProvider {
    pub fn new(config: HttpProviderConfig) -> Result<Self, EmbeddingError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| EmbeddingError::InvalidInput(format!("HTTP client: {e}")))?;

        let model_version = format!("{}@{}", config.model, config.dimension);
        Ok(Self {
            client,
            config,
            model_version,
        })
    }

    /// Build from the `[embedding]` settings section.
    pub fn from_settings(settings: &EmbeddingSettings) -> Result<Self, EmbeddingError> {
        let api_key = settings.api_key.clone().ok_or_else(|| {
            EmbeddingError::InvalidInput(
                "embedding.api_key is required (set RAG_EMBEDDING__API_KEY)".to_string(),
            )
        })?;

        let mut config = match settings.provider {
            ProviderKind::Openai => {
                HttpProviderConfig::openai(api_key, &settings.model, settings.dimension)
            }
            _ => HttpProviderConfig::gemini(api_key, &settings.model, settings.dimension),
        };
        if let Some(base_url) = &settings.base_url {
            config.base_url = base_url.trim_end_matches('/').to_string();
        }
        config.timeout = settings.timeout();
        Self::new(config)
    }

    async fn embed_gemini(
        &self,
        texts: &[String],
        task: TaskType,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let requests = texts
            .iter()
            .map(|text| GeminiEmbedRequest {
                model: &self.config.model,
                content: GeminiContent {
                    parts: vec![GeminiPart { text }],
                },
                task_type: task.as_str(),
                output_dimensionality: self.config.dimension,
            })
            .collect();
        let url = format!(
            "{}/{}:batchEmbedContents",
            self.config.base_url, self.config.model
        );

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", self.config.api_key.expose_secret())
            .json(&GeminiBatchRequest { requests })
            .send()
            .await
            .map_err(classify_send_error)?;

        let body: GeminiBatchResponse = read_success(response).await?;
        Ok(body.embeddings.into_iter().map(|e| e.values).collect())
    }

    async fn embed_openai(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let request = OpenAiRequest {
            model: &self.config.model,
            input: texts,
            dimensions: self.config.dimension,
        };

        let response = self
            .client
            .post(format!("{}/embeddings", self.config.base_url))
            .header(
                "Authorization",
                format!("Bearer {}", self.config.api_key.expose_secret()),
            )
            .json(&request)
            .send()
            .await
            .map_err(classify_send_error)?;

        let mut body: OpenAiResponse = read_success(response).await?;
        body.data.sort_by_key(|d| d.index);
        Ok(body.data.into_iter().map(|d| d.embedding).collect())
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    fn model_version(&self) -> &str {
        &self.model_version
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }

    async fn embed(
        &self,
        texts: &[String],
        task: TaskType,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        debug!(
            count = texts.len(),
            model = %self.config.model,
            task = task.as_str(),
            "Calling embedding API"
        );

        let vectors = match self.config.flavor {
            ApiFlavor::Gemini => self.embed_gemini(texts, task).await?,
            ApiFlavor::OpenAi => self.embed_openai(texts).await?,
        };
        check_vectors(&vectors, texts.len(), self.config.dimension)?;
        Ok(vectors)
    }
}

fn classify_send_error(err: reqwest::Error) -> EmbeddingError {
    if err.is_timeout() {
        EmbeddingError::transient(format!("request timed out: {err}"))
    } else {
        // Connection resets, DNS failures and the like
        EmbeddingError::transient(format!("request failed: {err}"))
    }
}

/// Turn a response into its decoded body or a classified error.
async fn read_success<T: for<'de> Deserialize<'de>>(
    response: Response,
) -> Result<T, EmbeddingError> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|e| EmbeddingError::InvalidInput(format!("malformed response: {e}")));
    }

    let header_hint = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response.text().await.unwrap_or_default();

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = header_hint
            .or_else(|| parse_retry_delay(&body))
            .unwrap_or(DEFAULT_RETRY_DELAY)
            .max(MIN_RETRY_DELAY);
        warn!(retry_after_secs = retry_after.as_secs(), "Embedding API rate limited");
        return Err(EmbeddingError::Transient {
            message: format!("rate limited ({status})"),
            retry_after: Some(retry_after),
        });
    }

    if status.is_server_error() {
        return Err(EmbeddingError::transient(format!("{status}: {}", snippet(&body))));
    }

    Err(EmbeddingError::InvalidInput(format!(
        "{status}: {}",
        snippet(&body)
    )))
}

/// Read `RetryInfo.retryDelay` (e.g. "12s") from a Google error body.
fn parse_retry_delay(body: &str) -> Option<Duration> {
    let parsed: GoogleErrorBody = serde_json::from_str(body).ok()?;
    parsed
        .error
        .details
        .iter()
        .filter(|d| d.type_url.as_deref() == Some(RETRY_INFO_TYPE))
        .filter_map(|d| d.retry_delay.as_deref())
        .find_map(|delay| delay.trim().strip_suffix('s')?.parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

fn snippet(body: &str) -> String {
    body.chars().take(200).collect()
}

#[derive(Serialize)]
struct GeminiBatchRequest<'a> {
    requests: Vec<GeminiEmbedRequest<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiEmbedRequest<'a> {
    model: &'a str,
    content: GeminiContent<'a>,
    task_type: &'static str,
    output_dimensionality: usize,
}

#[derive(Serialize)]
struct GeminiContent<'a> {
    parts: Vec<GeminiPart<'a>>,
}

#[derive(Serialize)]
struct GeminiPart<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct GeminiBatchResponse {
    #[serde(default)]
    embeddings: Vec<GeminiEmbedding>,
}

#[derive(Deserialize)]
struct GeminiEmbedding {
    values: Vec<f32>,
}

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    input: &'a [String],
    dimensions: usize,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    data: Vec<OpenAiEmbedding>,
}

#[derive(Deserialize)]
struct OpenAiEmbedding {
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct GoogleErrorBody {
    error: GoogleError,
}

#[derive(Deserialize)]
struct GoogleError {
    #[serde(default)]
    details: Vec<GoogleErrorDetail>,
}

#[derive(Deserialize)]
struct GoogleErrorDetail {
    #[serde(rename = "@type")]
    type_url: Option<String>,
    #[serde(rename = "retryDelay")]
    retry_delay: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const MODEL: &str = "models/test-embed";

    fn gemini(server: &MockServer, dimension: usize) -> HttpEmbeddingProvider {
        let config =
            HttpProviderConfig::gemini("test-key", MODEL, dimension).with_base_url(server.uri());
        HttpEmbeddingProvider::new(config).unwrap()
    }

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    const DOC: TaskType = TaskType::RetrievalDocument;

    #[test]
    fn test_parse_retry_delay() {
        let body = json!({
            "error": {
                "code": 429,
                "details": [
                    {"@type": "type.googleapis.com/google.rpc.QuotaFailure"},
                    {"@type": RETRY_INFO_TYPE, "retryDelay": "17s"}
                ]
            }
        })
        .to_string();
        assert_eq!(parse_retry_delay(&body), Some(Duration::from_secs(17)));
        assert_eq!(parse_retry_delay("not json"), None);
    }

    #[tokio::test]
    async fn test_gemini_batch_embed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("/{MODEL}:batchEmbedContents")))
            .and(header("x-goog-api-key", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "embeddings": [{"values": [0.1, 0.2]}, {"values": [0.3, 0.4]}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = gemini(&server, 2);
        let vectors = provider.embed(&texts(&["a", "b"]), DOC).await.unwrap();
        assert_eq!(vectors, vec![vec![0.1, 0.2], vec![0.3, 0.4]]);
        assert_eq!(provider.model_version(), "models/test-embed@2");
    }

    #[tokio::test]
    async fn test_gemini_sends_task_type() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "requests": [{
                    "model": MODEL,
                    "taskType": "RETRIEVAL_QUERY",
                    "outputDimensionality": 2
                }]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "embeddings": [{"values": [0.6, 0.8]}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let vectors = gemini(&server, 2)
            .embed(&texts(&["what did we say about rust?"]), TaskType::RetrievalQuery)
            .await
            .unwrap();
        assert_eq!(vectors, vec![vec![0.6, 0.8]]);
    }

    #[tokio::test]
    async fn test_openai_orders_by_index() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .and(header("Authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    {"index": 1, "embedding": [0.0, 1.0]},
                    {"index": 0, "embedding": [1.0, 0.0]}
                ]
            })))
            .mount(&server)
            .await;

        let config = HttpProviderConfig::openai("sk-test", "text-embedding-3-small", 2)
            .with_base_url(server.uri());
        let provider = HttpEmbeddingProvider::new(config).unwrap();
        let vectors = provider.embed(&texts(&["first", "second"]), DOC).await.unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[tokio::test]
    async fn test_rate_limit_is_transient_with_hint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "2"))
            .mount(&server)
            .await;

        let err = gemini(&server, 2).embed(&texts(&["a"]), DOC).await.unwrap_err();
        assert!(err.is_transient());
        // Raised to the minimum delay
        assert_eq!(err.retry_after(), Some(MIN_RETRY_DELAY));
    }

    #[tokio::test]
    async fn test_rate_limit_reads_retry_info() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_json(json!({
                "error": {"details": [{"@type": RETRY_INFO_TYPE, "retryDelay": "30s"}]}
            })))
            .mount(&server)
            .await;

        let err = gemini(&server, 2).embed(&texts(&["a"]), DOC).await.unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
            .mount(&server)
            .await;

        let err = gemini(&server, 2).embed(&texts(&["a"]), DOC).await.unwrap_err();
        assert!(matches!(err, EmbeddingError::Transient { retry_after: None, .. }));
    }

    #[tokio::test]
    async fn test_client_error_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
            .mount(&server)
            .await;

        let err = gemini(&server, 2).embed(&texts(&["a"]), DOC).await.unwrap_err();
        assert!(matches!(err, EmbeddingError::InvalidInput(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_wrong_dimension_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "embeddings": [{"values": [0.1, 0.2, 0.3]}]
            })))
            .mount(&server)
            .await;

        let err = gemini(&server, 2).embed(&texts(&["a"]), DOC).await.unwrap_err();
        assert_eq!(
            err,
            EmbeddingError::DimensionMismatch {
                expected: 2,
                actual: 3
            }
        );
    }

    #[tokio::test]
    async fn test_empty_batch_skips_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let vectors = gemini(&server, 2).embed(&[], DOC).await.unwrap();
        assert!(vectors.is_empty());
    }
}
