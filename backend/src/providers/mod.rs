//! Text generation and embedding providers.
//!
//! Both capabilities sit behind object-safe async traits so the orchestrator
//! never knows which backend it is talking to:
//! - [`vertex`]: Vertex AI REST (`generateContent` / `predict`), authenticated
//!   through [`google_auth`]
//! - [`openai`]: OpenAI `/v1/chat/completions` and `/v1/embeddings`
//! - [`local`]: a deterministic hashing embedder that needs no network
//!
//! Providers make exactly one HTTP call per invocation. Rate limiting and
//! retries are layered on top by the caller.

pub mod google_auth;
pub mod local;
pub mod openai;
pub mod vertex;

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::Settings;
use crate::errors::{ProviderFailure, Result};

#[async_trait]
pub trait Generator: Send + Sync {
    fn model_name(&self) -> &str;

    async fn generate(&self, prompt: &str) -> std::result::Result<String, ProviderFailure>;
}

#[async_trait]
pub trait Embedder: Send + Sync {
    fn model_name(&self) -> &str;

    /// Embed every text, returning vectors in input order.
    async fn embed(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, ProviderFailure>;
}

/// The provider pair selected for this process.
#[derive(Clone)]
pub struct Providers {
    pub generator: Option<Arc<dyn Generator>>,
    pub embedder: Arc<dyn Embedder>,
}

impl Providers {
    pub fn describe(&self) -> String {
        format!(
            "generator={}, embedder={}",
            self.generator.as_ref().map(|g| g.model_name()).unwrap_or("none"),
            self.embedder.model_name()
        )
    }
}

/// Pick providers from settings: Vertex AI when it is enabled and
/// configured, else OpenAI when a key is present, else no generator and the
/// local embedder.
pub fn build_providers(settings: &Settings) -> Result<Providers> {
    if settings.vertex_ready() {
        let client = vertex::VertexClient::new(settings)?;
        log::info!(
            "Using Vertex AI providers: {} / {}",
            settings.vertex_model,
            settings.vertex_embedding_model
        );
        return Ok(Providers {
            generator: Some(Arc::new(vertex::VertexGenerator::new(client.clone(), &settings.vertex_model))),
            embedder: Arc::new(vertex::VertexEmbedder::new(client, &settings.vertex_embedding_model)),
        });
    }

    if settings.use_vertex_ai {
        log::warn!("USE_VERTEX_AI is set but GOOGLE_CLOUD_PROJECT or GOOGLE_APPLICATION_CREDENTIALS is missing");
    }

    if let Some(api_key) = &settings.openai_api_key {
        let client = openai::OpenAiClient::new(api_key, &settings.openai_api_base)?;
        log::info!(
            "Using OpenAI providers: {} / {}",
            settings.completion_model,
            settings.embedding_model
        );
        return Ok(Providers {
            generator: Some(Arc::new(openai::OpenAiGenerator::new(client.clone(), &settings.completion_model))),
            embedder: Arc::new(openai::OpenAiEmbedder::new(client, &settings.embedding_model)),
        });
    }

    log::warn!("No generation provider configured; answers will be unavailable");
    Ok(Providers {
        generator: None,
        embedder: Arc::new(local::HashingEmbedder::default()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_without_credentials() {
        let settings = Settings::default();
        let providers = build_providers(&settings).unwrap();
        assert!(providers.generator.is_none());
        assert_eq!(providers.embedder.model_name(), local::HashingEmbedder::MODEL_NAME);
    }

    #[test]
    fn test_openai_selected_when_vertex_not_ready() {
        let settings = Settings {
            openai_api_key: Some("sk-test".to_string()),
            ..Settings::default()
        };
        let providers = build_providers(&settings).unwrap();
        assert_eq!(providers.generator.unwrap().model_name(), "gpt-3.5-turbo");
        assert_eq!(providers.embedder.model_name(), "text-embedding-3-small");
    }

    #[test]
    fn test_vertex_preferred_when_ready() {
        let settings = Settings {
            openai_api_key: Some("sk-test".to_string()),
            google_cloud_project: Some("demo".to_string()),
            vertex_access_token: Some("ya29.token".to_string()),
            ..Settings::default()
        };
        let providers = build_providers(&settings).unwrap();
        assert_eq!(providers.generator.unwrap().model_name(), "gemini-2.0-flash");
        assert_eq!(providers.embedder.model_name(), "text-embedding-005");
    }

    #[test]
    fn test_vertex_selected_from_service_account() {
        // The key file is only read when the first token is needed
        let settings = Settings {
            use_vertex_ai: true,
            google_cloud_project: Some("demo".to_string()),
            google_application_credentials: Some("/etc/sa.json".to_string()),
            ..Settings::default()
        };
        let providers = build_providers(&settings).unwrap();
        assert_eq!(providers.generator.unwrap().model_name(), "gemini-2.0-flash");
        assert_eq!(providers.embedder.model_name(), "text-embedding-005");
    }

    #[test]
    fn test_vertex_needs_project() {
        let settings = Settings {
            google_application_credentials: Some("/etc/sa.json".to_string()),
            ..Settings::default()
        };
        assert!(build_providers(&settings).unwrap().generator.is_none());
    }
}
