use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use super::google_auth::AccessTokens;
use super::{Embedder, Generator};
use crate::config::Settings;
use crate::errors::{ProviderFailure, Result, ServiceError};

/// Vertex AI REST client scoped to one project and region. Every call
/// carries a bearer token from the shared [`AccessTokens`] source.
#[derive(Clone)]
pub struct VertexClient {
    client: Client,
    tokens: Arc<AccessTokens>,
    models_url: String,
}

impl VertexClient {
    pub fn new(settings: &Settings) -> Result<Self> {
        let project = settings
            .google_cloud_project
            .as_deref()
            .ok_or_else(|| ServiceError::Configuration("GOOGLE_CLOUD_PROJECT is not set".to_string()))?;
        let tokens = AccessTokens::from_settings(settings)?;
        let region = &settings.google_cloud_region;

        let endpoint = format!("https://{}-aiplatform.googleapis.com", region);
        Self::with_endpoint(&endpoint, project, region, tokens)
    }

    pub fn with_endpoint(endpoint: &str, project: &str, region: &str, tokens: AccessTokens) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| ServiceError::Configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            tokens: Arc::new(tokens),
            models_url: format!(
                "{}/v1/projects/{}/locations/{}/publishers/google/models",
                endpoint.trim_end_matches('/'),
                project,
                region
            ),
        })
    }

    async fn call(
        &self,
        model: &str,
        method: &str,
        body: serde_json::Value,
    ) -> std::result::Result<serde_json::Value, ProviderFailure> {
        let url = format!("{}/{}:{}", self.models_url, model, method);
        let token = self.tokens.token().await?;
        let response = self
            .client
            .post(&url)
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            log::error!("Vertex AI {}:{} returned {}", model, method, status);
            return Err(ProviderFailure::from_status(status, &text));
        }

        response
            .json()
            .await
            .map_err(|e| ProviderFailure::Fatal(format!("Failed to decode Vertex AI response: {}", e)))
    }
}

pub struct VertexGenerator {
    client: VertexClient,
    model: String,
}

impl VertexGenerator {
    pub fn new(client: VertexClient, model: &str) -> Self {
        Self {
            client,
            model: model.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

#[async_trait]
impl Generator for VertexGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> std::result::Result<String, ProviderFailure> {
        log::info!("Generating text with Vertex AI: prompt length={}", prompt.len());
        let body = json!({
            "contents": [{"role": "user", "parts": [{"text": prompt}]}],
            "generationConfig": {
                "temperature": 0.1,
                "maxOutputTokens": 1024,
                "topP": 0.95,
                "topK": 40
            }
        });

        let value = self.client.call(&self.model, "generateContent", body).await?;
        let response: GenerateContentResponse = serde_json::from_value(value)
            .map_err(|e| ProviderFailure::Fatal(format!("Unexpected Vertex AI response: {}", e)))?;

        let text: String = response
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();

        if text.trim().is_empty() {
            return Err(ProviderFailure::Fatal("Vertex AI returned no text".to_string()));
        }
        log::info!("Generated {} characters", text.len());
        Ok(text)
    }
}

pub struct VertexEmbedder {
    client: VertexClient,
    model: String,
}

impl VertexEmbedder {
    pub fn new(client: VertexClient, model: &str) -> Self {
        Self {
            client,
            model: model.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PredictResponse {
    #[serde(default)]
    predictions: Vec<Prediction>,
}

#[derive(Debug, Deserialize)]
struct Prediction {
    embeddings: PredictionEmbeddings,
}

#[derive(Debug, Deserialize)]
struct PredictionEmbeddings {
    values: Vec<f32>,
}

#[async_trait]
impl Embedder for VertexEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, ProviderFailure> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let instances: Vec<_> = texts.iter().map(|t| json!({ "content": t })).collect();
        let value = self
            .client
            .call(&self.model, "predict", json!({ "instances": instances }))
            .await?;
        let response: PredictResponse = serde_json::from_value(value)
            .map_err(|e| ProviderFailure::Fatal(format!("Unexpected Vertex AI response: {}", e)))?;

        if response.predictions.len() != texts.len() {
            return Err(ProviderFailure::Fatal(format!(
                "Vertex AI returned {} embeddings for {} inputs",
                response.predictions.len(),
                texts.len()
            )));
        }
        Ok(response.predictions.into_iter().map(|p| p.embeddings.values).collect())
    }
}
