use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::{Result, ServiceError};

/// Runtime settings, read once at startup from the environment (after
/// `dotenv` has loaded `.env`).
#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub port: u16,

    // Credentials
    pub openai_api_key: Option<String>,
    pub github_access_token: Option<String>,

    // Provider targeting
    pub use_vertex_ai: bool,
    pub embedding_model: String,
    pub completion_model: String,
    pub google_application_credentials: Option<String>,
    pub google_cloud_project: Option<String>,
    pub google_cloud_region: String,
    pub vertex_model: String,
    pub vertex_embedding_model: String,
    pub vertex_access_token: Option<String>,

    // Endpoints
    pub github_api_url: String,
    pub openai_api_base: String,
    pub stackexchange_api_url: String,

    // Generation budget
    pub rate_limit_calls: usize,
    pub rate_limit_batch_size: usize,
    pub rate_limit_cooldown: Duration,
    pub rate_limit_max_wait: Duration,
    pub generation_max_retries: u32,
    pub retry_base_delay: Duration,

    // Retrieval tuning
    pub top_k_retrieval: usize,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub use_web_grounding: bool,
    pub semantic_weight: f64,

    // Source resolution limits
    pub github_max_files: usize,
    pub max_code_bytes: usize,

    pub data_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            openai_api_key: None,
            github_access_token: None,
            use_vertex_ai: true,
            embedding_model: "text-embedding-3-small".to_string(),
            completion_model: "gpt-3.5-turbo".to_string(),
            google_application_credentials: None,
            google_cloud_project: None,
            google_cloud_region: "us-central1".to_string(),
            vertex_model: "gemini-2.0-flash".to_string(),
            vertex_embedding_model: "text-embedding-005".to_string(),
            vertex_access_token: None,
            github_api_url: "https://api.github.com".to_string(),
            openai_api_base: "https://api.openai.com".to_string(),
            stackexchange_api_url: "https://api.stackexchange.com".to_string(),
            rate_limit_calls: 60,
            rate_limit_batch_size: 3,
            rate_limit_cooldown: Duration::from_secs(1),
            rate_limit_max_wait: Duration::from_secs(30),
            generation_max_retries: 3,
            retry_base_delay: Duration::from_millis(1000),
            top_k_retrieval: 5,
            chunk_size: 1000,
            chunk_overlap: 200,
            use_web_grounding: true,
            semantic_weight: 0.7,
            github_max_files: 10,
            max_code_bytes: 100_000,
            data_dir: PathBuf::from("data"),
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let defaults = Settings::default();

        let settings = Settings {
            host: env_string("HOST").unwrap_or(defaults.host),
            port: env_parse("PORT", defaults.port)?,
            openai_api_key: env_string("OPENAI_API_KEY"),
            github_access_token: env_string("GITHUB_ACCESS_TOKEN").or_else(|| env_string("GITHUB_TOKEN")),
            use_vertex_ai: env_bool("USE_VERTEX_AI", defaults.use_vertex_ai),
            embedding_model: env_string("EMBEDDING_MODEL").unwrap_or(defaults.embedding_model),
            completion_model: env_string("COMPLETION_MODEL").unwrap_or(defaults.completion_model),
            google_application_credentials: env_string("GOOGLE_APPLICATION_CREDENTIALS"),
            google_cloud_project: env_string("GOOGLE_CLOUD_PROJECT"),
            google_cloud_region: env_string("GOOGLE_CLOUD_REGION").unwrap_or(defaults.google_cloud_region),
            vertex_model: env_string("VERTEX_MODEL").unwrap_or(defaults.vertex_model),
            vertex_embedding_model: env_string("VERTEX_EMBEDDING_MODEL")
                .unwrap_or(defaults.vertex_embedding_model),
            vertex_access_token: env_string("VERTEX_ACCESS_TOKEN"),
            github_api_url: env_string("GITHUB_API_URL").unwrap_or(defaults.github_api_url),
            openai_api_base: env_string("OPENAI_API_BASE").unwrap_or(defaults.openai_api_base),
            stackexchange_api_url: env_string("STACKEXCHANGE_API_URL")
                .unwrap_or(defaults.stackexchange_api_url),
            rate_limit_calls: env_parse("RATE_LIMIT_CALLS", defaults.rate_limit_calls)?,
            rate_limit_batch_size: env_parse("RATE_LIMIT_BATCH_SIZE", defaults.rate_limit_batch_size)?,
            rate_limit_cooldown: env_seconds("RATE_LIMIT_COOLDOWN", defaults.rate_limit_cooldown)?,
            rate_limit_max_wait: env_seconds("RATE_LIMIT_MAX_WAIT", defaults.rate_limit_max_wait)?,
            generation_max_retries: env_parse("GENERATION_MAX_RETRIES", defaults.generation_max_retries)?,
            retry_base_delay: Duration::from_millis(env_parse(
                "RETRY_BASE_DELAY_MS",
                defaults.retry_base_delay.as_millis() as u64,
            )?),
            top_k_retrieval: env_parse("TOP_K_RETRIEVAL", defaults.top_k_retrieval)?,
            chunk_size: env_parse("CHUNK_SIZE", defaults.chunk_size)?,
            chunk_overlap: env_parse("CHUNK_OVERLAP", defaults.chunk_overlap)?,
            use_web_grounding: env_bool("USE_WEB_GROUNDING", defaults.use_web_grounding),
            semantic_weight: env_parse("SEMANTIC_WEIGHT", defaults.semantic_weight)?.clamp(0.0, 1.0),
            github_max_files: env_parse("GITHUB_MAX_FILES", defaults.github_max_files)?,
            max_code_bytes: env_parse("MAX_CODE_BYTES", defaults.max_code_bytes)?,
            data_dir: env_string("DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
        };

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(ServiceError::Configuration("CHUNK_SIZE must be greater than 0".to_string()));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(ServiceError::Configuration(format!(
                "CHUNK_OVERLAP ({}) must be smaller than CHUNK_SIZE ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        if self.rate_limit_calls == 0 {
            return Err(ServiceError::Configuration("RATE_LIMIT_CALLS must be greater than 0".to_string()));
        }
        if self.rate_limit_batch_size == 0 {
            return Err(ServiceError::Configuration(
                "RATE_LIMIT_BATCH_SIZE must be greater than 0".to_string(),
            ));
        }
        if self.top_k_retrieval == 0 {
            return Err(ServiceError::Configuration("TOP_K_RETRIEVAL must be greater than 0".to_string()));
        }
        Ok(())
    }

    /// Vertex AI needs a project and credentials: a service account key
    /// file, or a pre-minted `VERTEX_ACCESS_TOKEN`.
    pub fn vertex_ready(&self) -> bool {
        self.use_vertex_ai
            && self.google_cloud_project.is_some()
            && (self.google_application_credentials.is_some() || self.vertex_access_token.is_some())
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    match env_string(key) {
        Some(value) => parse_bool(&value).unwrap_or(default),
        None => default,
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env_string(key) {
        Some(value) => value
            .parse::<T>()
            .map_err(|_| ServiceError::Configuration(format!("Invalid value for {}: {}", key, value))),
        None => Ok(default),
    }
}

fn env_seconds(key: &str, default: Duration) -> Result<Duration> {
    let secs: f64 = env_parse(key, default.as_secs_f64())?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(ServiceError::Configuration(format!("{} must be a non-negative number", key)));
    }
    Ok(Duration::from_secs_f64(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.top_k_retrieval, 5);
        assert_eq!(settings.chunk_size, 1000);
        assert_eq!(settings.chunk_overlap, 200);
        assert!((settings.semantic_weight - 0.7).abs() < f64::EPSILON);
    }

    #[test]
    fn test_overlap_must_be_smaller_than_chunk_size() {
        let settings = Settings {
            chunk_size: 100,
            chunk_overlap: 100,
            ..Settings::default()
        };
        assert!(matches!(settings.validate(), Err(ServiceError::Configuration(_))));
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("True"), Some(true));
        assert_eq!(parse_bool("false"), Some(false));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn test_vertex_requires_project_and_credentials() {
        let mut settings = Settings::default();
        assert!(!settings.vertex_ready());
        settings.google_cloud_project = Some("demo".to_string());
        assert!(!settings.vertex_ready());
        settings.google_application_credentials = Some("/etc/sa.json".to_string());
        assert!(settings.vertex_ready());

        settings.google_application_credentials = None;
        settings.vertex_access_token = Some("token".to_string());
        assert!(settings.vertex_ready());
        settings.use_vertex_ai = false;
        assert!(!settings.vertex_ready());
    }
}
