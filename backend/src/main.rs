use actix_cors::Cors;
use actix_web::dev::Service;
use actix_web::http::header::{HeaderName, HeaderValue};
use actix_web::middleware::Logger;
use actix_web::{web, App, HttpServer};
use anyhow::Context;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use devsolver_backend::api::{self, AppState};
use devsolver_backend::config::Settings;
use devsolver_backend::orchestrator::QueryOrchestrator;
use devsolver_backend::providers::build_providers;
use devsolver_backend::retrieval::KnowledgeIndex;

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_request_id() -> String {
    let n = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{:x}-{:06x}", chrono::Utc::now().timestamp_millis(), n)
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let settings = Settings::from_env().context("Failed to load settings")?;
    let index = KnowledgeIndex::open(settings.data_dir.join("index"))
        .await
        .context("Failed to open knowledge index")?;
    let providers = build_providers(&settings).context("Failed to configure model providers")?;
    log::info!("Providers: {}", providers.describe());

    let index = Arc::new(index);
    let orchestrator = QueryOrchestrator::new(&settings, providers, index.clone())
        .context("Failed to build query orchestrator")?;

    let (host, port) = (settings.host.clone(), settings.port);
    let state = web::Data::new(AppState::new(orchestrator, settings));

    log::info!("Starting DevSolver backend at http://{}:{}{}", host, port, api::API_PREFIX);
    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(state.clone())
            .wrap(cors)
            .wrap(Logger::default())
            .wrap_fn(|req, srv| {
                let started = Instant::now();
                let request_id = next_request_id();
                let fut = srv.call(req);
                async move {
                    let mut res = fut.await?;
                    let headers = res.headers_mut();
                    if let Ok(value) = HeaderValue::from_str(&request_id) {
                        headers.insert(HeaderName::from_static("x-request-id"), value);
                    }
                    let elapsed = format!("{:.4}", started.elapsed().as_secs_f64());
                    if let Ok(value) = HeaderValue::from_str(&elapsed) {
                        headers.insert(HeaderName::from_static("x-process-time"), value);
                    }
                    Ok(res)
                }
            })
            .configure(api::configure)
    })
    .bind((host.as_str(), port))?
    .run()
    .await?;

    index.close().await;
    Ok(())
}
