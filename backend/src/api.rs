use actix_multipart::Multipart;
use actix_web::{get, post, web, HttpResponse, Responder};
use futures_util::TryStreamExt;
use serde_json::json;
use std::sync::Arc;

use crate::config::Settings;
use crate::errors::{Result, ServiceError};
use crate::models::{
    CodeSource, FetchDocumentationRequest, FetchDocumentationResponse, QueryRequest, ResponseSourcePreference,
    TechnologiesResponse, Technology, UploadAck,
};
use crate::orchestrator::QueryOrchestrator;

pub const API_PREFIX: &str = "/api/v1";
const MAX_UPLOAD_BYTES: usize = 1024 * 1024;

/// Shared by every worker through `web::Data`.
pub struct AppState {
    pub orchestrator: Arc<QueryOrchestrator>,
    pub settings: Arc<Settings>,
}

impl AppState {
    pub fn new(orchestrator: QueryOrchestrator, settings: Settings) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
            settings: Arc::new(settings),
        }
    }
}

/// Register the root route and the `/api/v1` scope.
pub fn configure(cfg: &mut web::ServiceConfig) {
    let json_config = web::JsonConfig::default()
        .error_handler(|err, _req| ServiceError::Validation(format!("Invalid request body: {}", err)).into());

    cfg.app_data(json_config).service(root).service(
        web::scope(API_PREFIX)
            .service(query)
            .service(upload_file)
            .service(technologies)
            .service(health)
            .service(fetch_documentation),
    );
}

#[get("/")]
async fn root() -> impl Responder {
    HttpResponse::Ok().json(json!({
        "message": "DevSolver API",
        "version": env!("CARGO_PKG_VERSION"),
        "api_url": API_PREFIX,
    }))
}

#[post("/query")]
async fn query(state: web::Data<AppState>, request: web::Json<QueryRequest>) -> Result<HttpResponse> {
    let response = state.orchestrator.handle(request.into_inner()).await?;
    Ok(HttpResponse::Ok().json(response))
}

#[derive(Default)]
struct UploadForm {
    filename: Option<String>,
    content: Vec<u8>,
    technology: Option<String>,
    query: Option<String>,
}

async fn read_upload(mut payload: Multipart) -> Result<UploadForm> {
    let mut form = UploadForm::default();

    while let Some(mut field) = payload
        .try_next()
        .await
        .map_err(|e| ServiceError::Validation(format!("Malformed multipart body: {}", e)))?
    {
        let name = field.name().to_string();
        if name == "file" {
            form.filename = field.content_disposition().get_filename().map(str::to_string);
        }

        let mut data = Vec::new();
        while let Some(bytes) = field
            .try_next()
            .await
            .map_err(|e| ServiceError::Validation(format!("Failed to read field '{}': {}", name, e)))?
        {
            if data.len() + bytes.len() > MAX_UPLOAD_BYTES {
                return Err(ServiceError::Validation(format!(
                    "Field '{}' exceeds {} bytes",
                    name, MAX_UPLOAD_BYTES
                )));
            }
            data.extend_from_slice(&bytes);
        }

        match name.as_str() {
            "file" => form.content = data,
            "technology" => form.technology = Some(String::from_utf8_lossy(&data).into_owned()),
            "query" => form.query = Some(String::from_utf8_lossy(&data).into_owned()),
            other => log::debug!("Ignoring upload field '{}'", other),
        }
    }

    Ok(form)
}

/// Multipart upload of one code file. With a `query` the file goes through
/// the full query pipeline; without one it is only analyzed.
#[post("/upload-file")]
async fn upload_file(state: web::Data<AppState>, payload: Multipart) -> Result<HttpResponse> {
    let form = read_upload(payload).await?;

    let technology = match form.technology.as_deref() {
        Some(value) => Technology::parse(value)
            .ok_or_else(|| ServiceError::Validation(format!("Unsupported technology: {}", value.trim())))?,
        None => return Err(ServiceError::Validation("technology is required".to_string())),
    };
    let filename = form.filename.unwrap_or_else(|| "upload".to_string());
    let code = String::from_utf8(form.content)
        .map_err(|_| ServiceError::Validation(format!("{} is not valid UTF-8 text", filename)))?;
    if code.trim().is_empty() {
        return Err(ServiceError::Validation("Uploaded file is empty".to_string()));
    }
    log::info!("Received upload {} ({} bytes, {})", filename, code.len(), technology);

    match form.query.filter(|q| !q.trim().is_empty()) {
        Some(question) => {
            let request = QueryRequest {
                source: CodeSource::File,
                technology,
                code_snippet: Some(code),
                github_repo: None,
                github_url: None,
                file_name: Some(filename),
                context: None,
                query: question,
                response_source_preference: ResponseSourcePreference::Both,
            };
            let response = state.orchestrator.handle(request).await?;
            Ok(HttpResponse::Ok().json(response))
        }
        None => {
            let size = code.len();
            let analysis = state.orchestrator.analyze(&code, technology).await?;
            Ok(HttpResponse::Ok().json(UploadAck {
                filename,
                size,
                technology,
                analysis,
            }))
        }
    }
}

#[get("/technologies")]
async fn technologies() -> impl Responder {
    HttpResponse::Ok().json(TechnologiesResponse {
        technologies: Technology::ALL.iter().map(|t| t.as_str().to_string()).collect(),
    })
}

#[get("/health")]
async fn health(state: web::Data<AppState>) -> impl Responder {
    let orchestrator = &state.orchestrator;
    let (status, chunks) = match orchestrator.index().total_chunks().await {
        Ok(chunks) => ("healthy", Some(chunks)),
        Err(e) => {
            log::warn!("Health check could not read the index: {}", e);
            ("degraded", None)
        }
    };

    HttpResponse::Ok().json(json!({
        "status": status,
        "services": {
            "generator": orchestrator.generator_model().unwrap_or("unavailable"),
            "embedder": orchestrator.embedder_model(),
            "github": if state.settings.github_access_token.is_some() { "authenticated" } else { "anonymous" },
            "web_grounding": state.settings.use_web_grounding,
        },
        "index": { "chunks": chunks },
    }))
}

/// Queue a documentation page for ingestion and return at once.
#[post("/fetch-documentation")]
async fn fetch_documentation(
    state: web::Data<AppState>,
    request: web::Json<FetchDocumentationRequest>,
) -> Result<HttpResponse> {
    let request = request.into_inner();
    let url = request.source_url.trim().to_string();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(ServiceError::Validation(format!("source_url must be an http(s) URL: {}", url)));
    }

    let ingestor = state.orchestrator.ingestor();
    let (technology, pool) = (request.technology, request.pool);
    let message = format!("Fetching {} documentation for {} from {}", pool, technology, url);

    tokio::spawn(async move {
        match ingestor.fetch_documentation(technology, &url, pool).await {
            Ok(count) => log::info!("Indexed {} chunks from {}", count, url),
            Err(e) => log::error!("Documentation fetch from {} failed: {}", url, e),
        }
    });

    Ok(HttpResponse::Accepted().json(FetchDocumentationResponse {
        message,
        status: "processing".to_string(),
    }))
}
