use async_trait::async_trait;
use reqwest::{header, Client};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use super::{Embedder, Generator};
use crate::errors::{ProviderFailure, Result, ServiceError};

/// Shared HTTP client for the OpenAI API (authorization baked into the
/// default headers).
#[derive(Clone)]
pub struct OpenAiClient {
    client: Client,
    url_chat: String,
    url_embeddings: String,
}

impl OpenAiClient {
    pub fn new(api_key: &str, endpoint: &str) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        let auth = header::HeaderValue::from_str(&format!("Bearer {}", api_key))
            .map_err(|e| ServiceError::Configuration(format!("Invalid OpenAI API key header: {}", e)))?;
        headers.insert(header::AUTHORIZATION, auth);
        headers.insert(header::CONTENT_TYPE, header::HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .default_headers(headers)
            .build()
            .map_err(|e| ServiceError::Configuration(format!("Failed to create HTTP client: {}", e)))?;

        let base = endpoint.trim_end_matches('/');
        Ok(Self {
            client,
            url_chat: format!("{}/v1/chat/completions", base),
            url_embeddings: format!("{}/v1/embeddings", base),
        })
    }

    async fn post<B: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        body: &B,
    ) -> std::result::Result<R, ProviderFailure> {
        let started = Instant::now();
        let response = self.client.post(url).json(body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            log::error!(
                "OpenAI {} returned {} after {}ms",
                url,
                status,
                started.elapsed().as_millis()
            );
            return Err(ProviderFailure::from_status(status, &text));
        }

        let parsed = response
            .json::<R>()
            .await
            .map_err(|e| ProviderFailure::Fatal(format!("Failed to decode OpenAI response: {}", e)))?;
        log::debug!("OpenAI {} completed in {}ms", url, started.elapsed().as_millis());
        Ok(parsed)
    }
}

pub struct OpenAiGenerator {
    client: OpenAiClient,
    model: String,
}

impl OpenAiGenerator {
    pub fn new(client: OpenAiClient, model: &str) -> Self {
        Self {
            client,
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl Generator for OpenAiGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> std::result::Result<String, ProviderFailure> {
        let body = ChatCompletionRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: 0.1,
        };

        let out: ChatCompletionResponse = self.client.post(&self.client.url_chat, &body).await?;
        out.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| ProviderFailure::Fatal("OpenAI returned no completion".to_string()))
    }
}

pub struct OpenAiEmbedder {
    client: OpenAiClient,
    model: String,
}

impl OpenAiEmbedder {
    pub fn new(client: OpenAiClient, model: &str) -> Self {
        Self {
            client,
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, ProviderFailure> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = EmbeddingsRequest {
            model: &self.model,
            input: texts,
        };

        let mut out: EmbeddingsResponse = self.client.post(&self.client.url_embeddings, &body).await?;
        if out.data.len() != texts.len() {
            return Err(ProviderFailure::Fatal(format!(
                "OpenAI returned {} embeddings for {} inputs",
                out.data.len(),
                texts.len()
            )));
        }
        out.data.sort_by_key(|item| item.index);
        Ok(out.data.into_iter().map(|item| item.embedding).collect())
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessageOut,
}

#[derive(Debug, Deserialize)]
struct ChatMessageOut {
    content: Option<String>,
}

#[derive(Debug, Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingItem {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_chat_completion() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "Use a list comprehension."}}]
            })))
            .mount(&server)
            .await;

        let client = OpenAiClient::new("sk-test", &server.uri()).unwrap();
        let generator = OpenAiGenerator::new(client, "gpt-3.5-turbo");
        let answer = generator.generate("How?").await.unwrap();
        assert_eq!(answer, "Use a list comprehension.");
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let client = OpenAiClient::new("sk-test", &server.uri()).unwrap();
        let generator = OpenAiGenerator::new(client, "gpt-3.5-turbo");
        let err = generator.generate("How?").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_bad_request_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad model"))
            .mount(&server)
            .await;

        let client = OpenAiClient::new("sk-test", &server.uri()).unwrap();
        let embedder = OpenAiEmbedder::new(client, "text-embedding-3-small");
        let err = embedder.embed(&["x".to_string()]).await.unwrap_err();
        assert!(matches!(err, ProviderFailure::Fatal(_)));
    }

    #[tokio::test]
    async fn test_embeddings_are_ordered_by_index() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [
                    {"index": 1, "embedding": [0.0, 1.0]},
                    {"index": 0, "embedding": [1.0, 0.0]}
                ]
            })))
            .mount(&server)
            .await;

        let client = OpenAiClient::new("sk-test", &server.uri()).unwrap();
        let embedder = OpenAiEmbedder::new(client, "text-embedding-3-small");
        let vectors = embedder.embed(&["a".to_string(), "b".to_string()]).await.unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }
}
