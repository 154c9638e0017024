//! OAuth access tokens for Google Cloud.
//!
//! A static `VERTEX_ACCESS_TOKEN` is used as-is. Otherwise the service
//! account key named by `GOOGLE_APPLICATION_CREDENTIALS` signs an RS256 JWT
//! assertion that is exchanged at the key's `token_uri` for a short-lived
//! access token. Minted tokens are cached until shortly before they expire.
//! The key file is read on first use, not at startup.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::config::Settings;
use crate::errors::{ProviderFailure, Result, ServiceError};

pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
const REFRESH_MARGIN_SECS: i64 = 60;

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

/// The fields of a service account key file that token minting needs.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub private_key_id: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    iss: String,
    scope: String,
    aud: String,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    ASSERTION_LIFETIME_SECS
}

struct CachedToken {
    value: String,
    refresh_at: DateTime<Utc>,
}

/// Sign the JWT bearer assertion for `key`, valid for one hour from `now`.
pub fn sign_assertion(key: &ServiceAccountKey, now: DateTime<Utc>) -> std::result::Result<String, ProviderFailure> {
    let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
        .map_err(|e| ProviderFailure::Fatal(format!("Invalid service account private key: {}", e)))?;

    let mut header = Header::new(Algorithm::RS256);
    header.kid = key.private_key_id.clone();

    let iat = now.timestamp();
    let claims = Claims {
        iss: key.client_email.clone(),
        scope: CLOUD_PLATFORM_SCOPE.to_string(),
        aud: key.token_uri.clone(),
        iat,
        exp: iat + ASSERTION_LIFETIME_SECS,
    };

    encode(&header, &claims, &encoding_key)
        .map_err(|e| ProviderFailure::Fatal(format!("Failed to sign token assertion: {}", e)))
}

/// Mints and caches tokens from a service account key file.
pub struct ServiceAccountTokens {
    client: Client,
    key_path: PathBuf,
    cached: Mutex<Option<CachedToken>>,
}

impl ServiceAccountTokens {
    pub fn new(key_path: impl Into<PathBuf>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ServiceError::Configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            key_path: key_path.into(),
            cached: Mutex::new(None),
        })
    }

    async fn load_key(&self) -> std::result::Result<ServiceAccountKey, ProviderFailure> {
        let raw = tokio::fs::read_to_string(&self.key_path).await.map_err(|e| {
            ProviderFailure::Fatal(format!(
                "Cannot read service account key {}: {}",
                self.key_path.display(),
                e
            ))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            ProviderFailure::Fatal(format!(
                "Malformed service account key {}: {}",
                self.key_path.display(),
                e
            ))
        })
    }

    async fn mint(&self) -> std::result::Result<CachedToken, ProviderFailure> {
        let key = self.load_key().await?;
        let now = Utc::now();
        let assertion = sign_assertion(&key, now)?;

        let response = self
            .client
            .post(&key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            log::error!("Token exchange for {} returned {}", key.client_email, status);
            return Err(ProviderFailure::from_status(status, &text));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| ProviderFailure::Fatal(format!("Failed to decode token response: {}", e)))?;
        log::info!(
            "Minted access token for {} (expires in {}s)",
            key.client_email,
            token.expires_in
        );

        Ok(CachedToken {
            value: token.access_token,
            refresh_at: now + ChronoDuration::seconds((token.expires_in - REFRESH_MARGIN_SECS).max(0)),
        })
    }

    pub async fn token(&self) -> std::result::Result<String, ProviderFailure> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if Utc::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }

        let fresh = self.mint().await?;
        let value = fresh.value.clone();
        *cached = Some(fresh);
        Ok(value)
    }
}

/// Where Vertex AI bearer tokens come from.
pub enum AccessTokens {
    Static(String),
    ServiceAccount(ServiceAccountTokens),
}

impl AccessTokens {
    /// A configured `VERTEX_ACCESS_TOKEN` wins over the credentials file.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        if let Some(token) = &settings.vertex_access_token {
            return Ok(Self::Static(token.clone()));
        }
        match &settings.google_application_credentials {
            Some(path) => Ok(Self::ServiceAccount(ServiceAccountTokens::new(path)?)),
            None => Err(ServiceError::Configuration(
                "Neither GOOGLE_APPLICATION_CREDENTIALS nor VERTEX_ACCESS_TOKEN is set".to_string(),
            )),
        }
    }

    pub async fn token(&self) -> std::result::Result<String, ProviderFailure> {
        match self {
            Self::Static(token) => Ok(token.clone()),
            Self::ServiceAccount(tokens) => tokens.token().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{decode, DecodingKey, Validation};
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PRIVATE_KEY: &str = include_str!("../../tests/fixtures/service_account_key.pem");
    const PUBLIC_KEY: &str = include_str!("../../tests/fixtures/service_account_key.pub.pem");

    fn key(token_uri: &str) -> ServiceAccountKey {
        ServiceAccountKey {
            client_email: "devsolver@demo.iam.gserviceaccount.com".to_string(),
            private_key: PRIVATE_KEY.to_string(),
            private_key_id: Some("key-1".to_string()),
            token_uri: token_uri.to_string(),
        }
    }

    fn write_key_file(dir: &tempfile::TempDir, token_uri: &str) -> PathBuf {
        let file = dir.path().join("sa.json");
        let body = serde_json::json!({
            "type": "service_account",
            "project_id": "demo",
            "private_key_id": "key-1",
            "private_key": PRIVATE_KEY,
            "client_email": "devsolver@demo.iam.gserviceaccount.com",
            "token_uri": token_uri,
        });
        std::fs::write(&file, body.to_string()).unwrap();
        file
    }

    #[test]
    fn test_assertion_claims() {
        let key = key("https://oauth2.example.com/token");
        let jwt = sign_assertion(&key, Utc::now()).unwrap();

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&["https://oauth2.example.com/token"]);
        let decoded = decode::<Claims>(&jwt, &DecodingKey::from_rsa_pem(PUBLIC_KEY.as_bytes()).unwrap(), &validation)
            .unwrap();

        assert_eq!(decoded.header.kid.as_deref(), Some("key-1"));
        assert_eq!(decoded.claims.iss, "devsolver@demo.iam.gserviceaccount.com");
        assert_eq!(decoded.claims.scope, CLOUD_PLATFORM_SCOPE);
        assert_eq!(decoded.claims.exp - decoded.claims.iat, ASSERTION_LIFETIME_SECS);
    }

    #[test]
    fn test_bad_private_key_is_fatal() {
        let mut key = key(DEFAULT_TOKEN_URI);
        key.private_key = "not a key".to_string();
        assert!(!sign_assertion(&key, Utc::now()).unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn test_token_is_minted_once_and_cached() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=urn%3Aietf%3Aparams%3Aoauth%3Agrant-type%3Ajwt-bearer"))
            .and(body_string_contains("assertion="))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "ya29.minted",
                "expires_in": 3599,
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let tokens = ServiceAccountTokens::new(write_key_file(&dir, &format!("{}/token", server.uri()))).unwrap();
        assert_eq!(tokens.token().await.unwrap(), "ya29.minted");
        assert_eq!(tokens.token().await.unwrap(), "ya29.minted");
    }

    #[tokio::test]
    async fn test_rejected_grant_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({"error": "invalid_grant"})))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let tokens = ServiceAccountTokens::new(write_key_file(&dir, &format!("{}/token", server.uri()))).unwrap();
        assert!(!tokens.token().await.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn test_missing_key_file_fails_on_use() {
        let tokens = ServiceAccountTokens::new("/nonexistent/sa.json").unwrap();
        let err = tokens.token().await.unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("/nonexistent/sa.json"));
    }

    #[tokio::test]
    async fn test_static_token_wins() {
        let settings = Settings {
            google_application_credentials: Some("/nonexistent/sa.json".to_string()),
            vertex_access_token: Some("ya29.static".to_string()),
            ..Settings::default()
        };
        let tokens = AccessTokens::from_settings(&settings).unwrap();
        assert_eq!(tokens.token().await.unwrap(), "ya29.static");
        assert!(AccessTokens::from_settings(&Settings::default()).is_err());
    }
}
