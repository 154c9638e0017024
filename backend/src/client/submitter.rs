use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

use super::notifications::{NotificationCenter, NotificationKind};
use crate::errors::ServiceError;
use crate::models::{QueryRequest, QueryResponse, TechnologiesResponse, Technology, UploadAck};

const FAILURE_MESSAGE: &str = "Something went wrong while processing your query. Please try again.";
const SUCCESS_MESSAGE: &str = "Query processed successfully";
const NOTIFICATION_DURATION: Duration = Duration::from_millis(5000);

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("Invalid request: {0}")]
    Invalid(String),

    #[error("A query is already in progress")]
    Busy,

    #[error("Request failed: {0}")]
    Transport(String),

    #[error("Server returned {status}: {message}")]
    Server { status: u16, message: String },
}

/// What `/upload-file` answered with.
#[derive(Debug, Clone)]
pub enum UploadOutcome {
    Answered(QueryResponse),
    Analyzed(UploadAck),
}

struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlight(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// HTTP client for the query API. At most one query is in flight; the last
/// successful response is kept as the displayed one.
pub struct QuerySubmitter {
    client: Client,
    base_url: String,
    in_flight: AtomicBool,
    displayed: Mutex<Option<QueryResponse>>,
    notifications: NotificationCenter,
}

impl QuerySubmitter {
    pub fn new(base_url: &str, notifications: NotificationCenter) -> Result<Self, SubmitError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(300))
            .user_agent("DevSolver-Client")
            .build()
            .map_err(|e| SubmitError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            in_flight: AtomicBool::new(false),
            displayed: Mutex::new(None),
            notifications,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base_url, path)
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn notifications(&self) -> &NotificationCenter {
        &self.notifications
    }

    /// The response currently on display, if any.
    pub fn displayed(&self) -> Option<QueryResponse> {
        self.displayed.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn display(&self, response: &QueryResponse) {
        *self.displayed.lock().unwrap_or_else(|p| p.into_inner()) = Some(response.clone());
    }

    pub async fn submit(&self, request: QueryRequest) -> Result<QueryResponse, SubmitError> {
        let _guard = InFlight::acquire(&self.in_flight).ok_or(SubmitError::Busy)?;

        if let Err(e) = request.validate() {
            let message = match e {
                ServiceError::Validation(message) => message,
                other => other.to_string(),
            };
            self.notifications
                .push(NotificationKind::Warning, message.clone(), NOTIFICATION_DURATION);
            return Err(SubmitError::Invalid(message));
        }

        let sent = self.client.post(self.url("/query")).json(&request).send().await;
        let response = self.finish::<QueryResponse>(sent).await?;

        self.display(&response);
        self.notifications
            .push(NotificationKind::Success, SUCCESS_MESSAGE, NOTIFICATION_DURATION);
        Ok(response)
    }

    /// Upload a code file. With a query this counts as a submission and
    /// replaces the displayed response.
    pub async fn upload_file(
        &self,
        path: &Path,
        technology: Technology,
        query: Option<&str>,
    ) -> Result<UploadOutcome, SubmitError> {
        let _guard = InFlight::acquire(&self.in_flight).ok_or(SubmitError::Busy)?;

        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                let message = format!("Cannot read {}: {}", path.display(), e);
                self.notifications
                    .push(NotificationKind::Warning, message.clone(), NOTIFICATION_DURATION);
                return Err(SubmitError::Invalid(message));
            }
        };
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());

        let mut form = Form::new()
            .part("file", Part::bytes(bytes).file_name(filename))
            .text("technology", technology.as_str().to_string());
        if let Some(query) = query.filter(|q| !q.trim().is_empty()) {
            form = form.text("query", query.to_string());
        }

        let sent = self.client.post(self.url("/upload-file")).multipart(form).send().await;
        if query.map_or(false, |q| !q.trim().is_empty()) {
            let response = self.finish::<QueryResponse>(sent).await?;
            self.display(&response);
            self.notifications
                .push(NotificationKind::Success, SUCCESS_MESSAGE, NOTIFICATION_DURATION);
            Ok(UploadOutcome::Answered(response))
        } else {
            let ack = self.finish::<UploadAck>(sent).await?;
            self.notifications.push(
                NotificationKind::Success,
                format!("Analyzed {}", ack.filename),
                NOTIFICATION_DURATION,
            );
            Ok(UploadOutcome::Analyzed(ack))
        }
    }

    pub async fn technologies(&self) -> Result<Vec<String>, SubmitError> {
        let sent = self.client.get(self.url("/technologies")).send().await;
        Ok(decode::<TechnologiesResponse>(sent).await?.technologies)
    }

    pub async fn health(&self) -> Result<serde_json::Value, SubmitError> {
        let sent = self.client.get(self.url("/health")).send().await;
        decode(sent).await
    }

    // Decode a query-style response; failures get the generic notification
    async fn finish<T: DeserializeOwned>(
        &self,
        sent: reqwest::Result<reqwest::Response>,
    ) -> Result<T, SubmitError> {
        match decode(sent).await {
            Ok(value) => Ok(value),
            Err(e) => {
                log::error!("Query failed: {}", e);
                self.notifications
                    .push(NotificationKind::Error, FAILURE_MESSAGE, NOTIFICATION_DURATION);
                Err(e)
            }
        }
    }
}

async fn decode<T: DeserializeOwned>(sent: reqwest::Result<reqwest::Response>) -> Result<T, SubmitError> {
    let response = sent.map_err(|e| SubmitError::Transport(e.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
            .unwrap_or(body);
        return Err(SubmitError::Server {
            status: status.as_u16(),
            message,
        });
    }
    response
        .json::<T>()
        .await
        .map_err(|e| SubmitError::Transport(format!("Unexpected response: {}", e)))
}
