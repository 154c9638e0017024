use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ServiceError>;

/// Every failure the orchestrator and the HTTP layer can report.
///
/// A missing pool answer is not an error: the pool is simply absent from
/// the response.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "ValidationError",
            Self::SourceUnavailable(_) => "SourceUnavailable",
            Self::Provider(_) => "ProviderError",
            Self::RateLimitExceeded(_) => "RateLimitExceeded",
            Self::Configuration(_) => "ConfigurationError",
            Self::Internal(_) => "InternalError",
        }
    }
}

/// Failure of a single provider call. Only `Fatal` (bad key, bad request)
/// is not retried.
#[derive(Debug, Error)]
pub enum ProviderFailure {
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    RateLimited(String),
    #[error("{0}")]
    Fatal(String),
}

impl ProviderFailure {
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Fatal(_))
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let snippet: String = body.chars().take(200).collect();
        let message = format!("HTTP {}: {}", status, snippet);
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            Self::Transient(message)
        } else {
            Self::Fatal(message)
        }
    }
}

impl From<reqwest::Error> for ProviderFailure {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            Self::Fatal(format!("Failed to decode provider response: {}", error))
        } else {
            Self::Transient(format!("Failed to reach provider: {}", error))
        }
    }
}

impl From<ProviderFailure> for ServiceError {
    fn from(failure: ProviderFailure) -> Self {
        match failure {
            ProviderFailure::RateLimited(msg) => ServiceError::RateLimitExceeded(msg),
            other => ServiceError::Provider(other.to_string()),
        }
    }
}

impl From<std::io::Error> for ServiceError {
    fn from(error: std::io::Error) -> Self {
        ServiceError::Internal(error.to_string())
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(error: serde_json::Error) -> Self {
        ServiceError::Internal(error.to_string())
    }
}

impl From<sqlx::Error> for ServiceError {
    fn from(error: sqlx::Error) -> Self {
        ServiceError::Internal(format!("Index storage error: {}", error))
    }
}

impl ResponseError for ServiceError {
    fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            ServiceError::SourceUnavailable(_) | ServiceError::Provider(_) => StatusCode::BAD_GATEWAY,
            ServiceError::RateLimitExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            ServiceError::Configuration(_) | ServiceError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(serde_json::json!({
            "error": self.kind(),
            "message": self.to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ServiceError::Validation("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ServiceError::SourceUnavailable("x".into()).status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            ServiceError::RateLimitExceeded("x".into()).status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[test]
    fn test_is_transient() {
        assert!(ProviderFailure::Transient("timeout".into()).is_transient());
        assert!(ProviderFailure::RateLimited("busy".into()).is_transient());
        assert!(!ProviderFailure::Fatal("bad request".into()).is_transient());
    }

    #[test]
    fn test_rate_limited_maps_to_rate_limit_exceeded() {
        let err: ServiceError = ProviderFailure::RateLimited("budget".into()).into();
        assert!(matches!(err, ServiceError::RateLimitExceeded(_)));
    }

    #[test]
    fn test_provider_failure_from_status() {
        let busy = ProviderFailure::from_status(reqwest::StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert!(matches!(busy, ProviderFailure::Transient(_)));

        let bad_key = ProviderFailure::from_status(reqwest::StatusCode::UNAUTHORIZED, "bad key");
        assert!(matches!(bad_key, ProviderFailure::Fatal(_)));
    }
}
