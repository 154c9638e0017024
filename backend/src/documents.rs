use reqwest::Client;
use scraper::{Html, Selector};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use crate::chunker::Chunker;
use crate::config::Settings;
use crate::errors::{ProviderFailure, Result, ServiceError};
use crate::models::{DocumentSource, Pool, Technology};
use crate::providers::Embedder;
use crate::rate_limiter::{with_retry, RateLimiter};
use crate::retrieval::{IndexedChunk, KnowledgeIndex};

const SKIPPED_ELEMENTS: &[&str] = &["script", "style", "header", "footer", "nav", "aside", "noscript"];
const CONTENT_SELECTORS: &[&str] = &["main", "article", "[role=main]", "#content", ".content", "body"];
const COMMUNITY_QUESTIONS: usize = 5;

/// Turns documentation pages and community posts into indexed chunks:
/// fetch, extract text, chunk, embed in batches under the embedding budget,
/// then hand the chunks to the knowledge index.
pub struct DocumentIngestor {
    client: Client,
    index: Arc<KnowledgeIndex>,
    embedder: Arc<dyn Embedder>,
    limiter: Arc<RateLimiter>,
    chunker: Chunker,
    batch_size: usize,
    max_retries: u32,
    retry_base_delay: Duration,
    stackexchange_api_url: String,
}

impl DocumentIngestor {
    pub fn new(
        settings: &Settings,
        index: Arc<KnowledgeIndex>,
        embedder: Arc<dyn Embedder>,
        limiter: Arc<RateLimiter>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("DevSolver-App")
            .build()
            .map_err(|e| ServiceError::Configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            index,
            embedder,
            limiter,
            chunker: Chunker::from_settings(settings),
            batch_size: settings.rate_limit_batch_size.max(1),
            max_retries: settings.generation_max_retries,
            retry_base_delay: settings.retry_base_delay,
            stackexchange_api_url: settings.stackexchange_api_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn embedder(&self) -> &dyn Embedder {
        self.embedder.as_ref()
    }

    /// Embed texts in `RATE_LIMIT_BATCH_SIZE` batches, one budgeted call per
    /// batch.
    pub async fn embed_texts(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, ProviderFailure> {
        let mut vectors = Vec::with_capacity(texts.len());
        for (i, batch) in texts.chunks(self.batch_size).enumerate() {
            log::debug!("Embedding batch {}: {} texts", i + 1, batch.len());
            let embedded = with_retry("embedding", self.max_retries, self.retry_base_delay, || async {
                self.limiter.acquire().await?;
                self.embedder.embed(batch).await
            })
            .await?;
            vectors.extend(embedded);
        }
        Ok(vectors)
    }

    pub async fn embed_query(&self, text: &str) -> Option<Vec<f32>> {
        match self.embed_texts(&[text.to_string()]).await {
            Ok(mut vectors) if !vectors.is_empty() => Some(vectors.remove(0)),
            Ok(_) => None,
            Err(e) => {
                log::warn!("Query embedding failed, falling back to lexical search: {}", e);
                None
            }
        }
    }

    /// Fetch a documentation page and index it into `pool`.
    pub async fn fetch_documentation(&self, technology: Technology, source_url: &str, pool: Pool) -> Result<usize> {
        log::info!("Fetching documentation from {}", source_url);

        let response = self.client.get(source_url).send().await.map_err(|e| {
            ServiceError::SourceUnavailable(format!("Failed to fetch {}: {}", source_url, e))
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(ServiceError::SourceUnavailable(format!(
                "Fetching {} returned {}",
                source_url, status
            )));
        }
        let html = response.text().await.map_err(|e| {
            ServiceError::SourceUnavailable(format!("Failed to read {}: {}", source_url, e))
        })?;

        let text = extract_text(&html);
        if text.is_empty() {
            log::warn!("No content extracted from {}", source_url);
            return Ok(0);
        }
        log::info!("Extracted {} characters from {}", text.len(), source_url);

        let label = match pool {
            Pool::Official => "Official documentation",
            Pool::Community => "Community content",
        };
        let source = DocumentSource {
            title: page_title(&html).unwrap_or_else(|| format!("{} documentation", technology)),
            description: Some(format!("{} for {}", label, technology)),
            url: Some(source_url.to_string()),
            source_type: pool,
        };
        self.ingest_text(technology, pool, &document_id(technology, source_url), &text, source)
            .await
    }

    /// Pull the most relevant Stack Overflow questions (with their top
    /// answers) for `query` and index them into the community pool.
    pub async fn fetch_community(&self, technology: Technology, query: &str) -> Result<usize> {
        let url = format!("{}/2.3/search/advanced", self.stackexchange_api_url);
        let page_size = COMMUNITY_QUESTIONS.to_string();
        log::info!("Fetching community content for {} - {}", technology, query);

        let questions: StackExchangeResponse<Question> = self
            .stackexchange_get(
                &url,
                &[
                    ("order", "desc"),
                    ("sort", "relevance"),
                    ("q", query),
                    ("tagged", stackoverflow_tag(technology)),
                    ("site", "stackoverflow"),
                    ("filter", "withbody"),
                    ("pagesize", page_size.as_str()),
                ],
            )
            .await?;

        if questions.items.is_empty() {
            log::info!("No community posts found for {} - {}", technology, query);
            return Ok(0);
        }

        let answers = self.fetch_answers(&questions.items).await.unwrap_or_else(|e| {
            log::warn!("Could not fetch answers, indexing questions only: {}", e);
            Vec::new()
        });

        let mut indexed = 0;
        for question in &questions.items {
            let mut text = format!("{}\n\n{}", question.title, extract_text(&question.body));
            let mut question_answers: Vec<&Answer> =
                answers.iter().filter(|a| a.question_id == question.question_id).collect();
            question_answers.sort_by(|a, b| b.is_accepted.cmp(&a.is_accepted).then(b.score.cmp(&a.score)));
            for answer in question_answers.into_iter().take(2) {
                text.push_str("\n\nAnswer:\n");
                text.push_str(&extract_text(&answer.body));
            }

            let source = DocumentSource {
                title: question.title.clone(),
                description: Some(format!("Stack Overflow question (score {})", question.score)),
                url: Some(question.link.clone()),
                source_type: Pool::Community,
            };
            indexed += self
                .ingest_text(
                    technology,
                    Pool::Community,
                    &document_id(technology, &question.link),
                    &text,
                    source,
                )
                .await?;
        }
        Ok(indexed)
    }

    async fn fetch_answers(&self, questions: &[Question]) -> Result<Vec<Answer>> {
        let ids: Vec<String> = questions.iter().map(|q| q.question_id.to_string()).collect();
        let url = format!("{}/2.3/questions/{}/answers", self.stackexchange_api_url, ids.join(";"));
        let response: StackExchangeResponse<Answer> = self
            .stackexchange_get(
                &url,
                &[
                    ("order", "desc"),
                    ("sort", "votes"),
                    ("site", "stackoverflow"),
                    ("filter", "withbody"),
                ],
            )
            .await?;
        Ok(response.items)
    }

    async fn stackexchange_get<T: for<'de> Deserialize<'de>>(&self, url: &str, params: &[(&str, &str)]) -> Result<T> {
        let response = self.client.get(url).query(params).send().await.map_err(|e| {
            ServiceError::SourceUnavailable(format!("Failed to reach Stack Exchange: {}", e))
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(ServiceError::SourceUnavailable(format!("Stack Exchange returned {}", status)));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| ServiceError::SourceUnavailable(format!("Unexpected Stack Exchange response: {}", e)))
    }

    /// Chunk, embed and index one document. Chunks are still indexed (for
    /// lexical search) when embedding fails.
    pub async fn ingest_text(
        &self,
        technology: Technology,
        pool: Pool,
        document_id: &str,
        text: &str,
        source: DocumentSource,
    ) -> Result<usize> {
        let pieces = self.chunker.chunk(text);
        if pieces.is_empty() {
            log::warn!("Empty content for document {}, no chunks created", document_id);
            return Ok(0);
        }

        let (embeddings, model): (Vec<Option<Vec<f32>>>, Option<&str>) = match self.embed_texts(&pieces).await {
            Ok(vectors) if vectors.len() == pieces.len() => {
                (vectors.into_iter().map(Some).collect(), Some(self.embedder.model_name()))
            }
            Ok(_) | Err(_) => {
                log::warn!("Embedding failed for {}; indexing for lexical search only", document_id);
                (vec![None; pieces.len()], None)
            }
        };

        let chunks: Vec<IndexedChunk> = pieces
            .into_iter()
            .zip(embeddings)
            .enumerate()
            .map(|(i, (content, embedding))| IndexedChunk {
                id: format!("{}-chunk-{}", document_id, i),
                document_id: document_id.to_string(),
                content,
                embedding,
                source: source.clone(),
            })
            .collect();

        self.index.add_chunks(technology, pool, model, chunks).await
    }
}

#[derive(Debug, Deserialize)]
struct StackExchangeResponse<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct Question {
    question_id: u64,
    title: String,
    link: String,
    #[serde(default)]
    body: String,
    #[serde(default)]
    score: i64,
}

#[derive(Debug, Deserialize)]
struct Answer {
    question_id: u64,
    #[serde(default)]
    body: String,
    #[serde(default)]
    score: i64,
    #[serde(default)]
    is_accepted: bool,
}

fn stackoverflow_tag(technology: Technology) -> &'static str {
    match technology {
        Technology::Node => "node.js",
        Technology::React => "reactjs",
        other => other.as_str(),
    }
}

/// Stable id for a document: technology plus a hash of its URL.
pub fn document_id(technology: Technology, url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    let hex: String = digest.iter().take(8).map(|b| format!("{:02x}", b)).collect();
    format!("{}-{}", technology, hex)
}

fn page_title(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("title").ok()?;
    let title = document.select(&selector).next()?.text().collect::<String>();
    let title = title.split_whitespace().collect::<Vec<_>>().join(" ");
    if title.is_empty() {
        None
    } else {
        Some(title)
    }
}

/// Visible text of an HTML page (or fragment), one line per text node,
/// skipping scripts, styles and page chrome.
pub fn extract_text(html: &str) -> String {
    let document = Html::parse_document(html);

    let root = CONTENT_SELECTORS
        .iter()
        .filter_map(|s| Selector::parse(s).ok())
        .find_map(|selector| document.select(&selector).next());

    let root = match root {
        Some(root) => root,
        None => document.root_element(),
    };

    let mut lines = Vec::new();
    for node in root.descendants() {
        let text = match node.value().as_text() {
            Some(text) => text,
            None => continue,
        };
        let skipped = node.ancestors().any(|a| {
            a.value()
                .as_element()
                .map_or(false, |e| SKIPPED_ELEMENTS.contains(&e.name()))
        });
        if skipped {
            continue;
        }
        let line = text.split_whitespace().collect::<Vec<_>>().join(" ");
        if !line.is_empty() {
            lines.push(line);
        }
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::local::HashingEmbedder;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ingestor(settings: &Settings, index: Arc<KnowledgeIndex>) -> DocumentIngestor {
        let limiter = Arc::new(RateLimiter::new("embedding", 1000, Duration::ZERO, Duration::from_secs(5)));
        DocumentIngestor::new(settings, index, Arc::new(HashingEmbedder::default()), limiter).unwrap()
    }

    #[test]
    fn test_extract_text_skips_scripts_and_chrome() {
        let html = r#"<html><head><title>T</title><script>var x = 1;</script></head>
            <body><nav>Menu</nav><main><h1>List   comprehensions</h1><p>Build lists.</p>
            <script>track()</script></main><footer>(c)</footer></body></html>"#;
        let text = extract_text(html);
        assert_eq!(text, "List comprehensions\nBuild lists.");
    }

    #[test]
    fn test_document_id_is_stable() {
        let a = document_id(Technology::Python, "https://docs.python.org/3/");
        let b = document_id(Technology::Python, "https://docs.python.org/3/");
        assert_eq!(a, b);
        assert!(a.starts_with("python-"));
        assert_ne!(a, document_id(Technology::Python, "https://docs.python.org/2/"));
    }

    #[tokio::test]
    async fn test_ingest_text_indexes_chunks() {
        let settings = Settings {
            chunk_size: 50,
            chunk_overlap: 10,
            ..Settings::default()
        };
        let index = Arc::new(KnowledgeIndex::in_memory().await.unwrap());
        let ingestor = ingestor(&settings, index.clone());
        let source = DocumentSource {
            title: "Docs".to_string(),
            description: None,
            url: None,
            source_type: Pool::Official,
        };

        let text = "Generators yield values lazily. ".repeat(10);
        let count = ingestor
            .ingest_text(Technology::Python, Pool::Official, "doc", &text, source)
            .await
            .unwrap();
        assert!(count > 1);
        assert_eq!(index.chunk_count(Technology::Python, Pool::Official).await.unwrap(), count);
    }

    #[tokio::test]
    async fn test_fetch_documentation() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/docs"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<html><head><title>CSS Grid</title></head><body><p>Grid layout places items in rows and columns.</p></body></html>",
            ))
            .mount(&server)
            .await;

        let index = Arc::new(KnowledgeIndex::in_memory().await.unwrap());
        let ingestor = ingestor(&Settings::default(), index.clone());
        let count = ingestor
            .fetch_documentation(Technology::Css, &format!("{}/docs", server.uri()), Pool::Official)
            .await
            .unwrap();
        assert_eq!(count, 1);

        let hits = index.search(Technology::Css, Pool::Official, "grid layout", None, 0.7, 5).await.unwrap();
        assert_eq!(hits[0].chunk.source.title, "CSS Grid");
    }

    #[tokio::test]
    async fn test_fetch_documentation_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let ingestor = ingestor(&Settings::default(), Arc::new(KnowledgeIndex::in_memory().await.unwrap()));
        let result = ingestor
            .fetch_documentation(Technology::Css, &format!("{}/missing", server.uri()), Pool::Official)
            .await;
        assert!(matches!(result, Err(ServiceError::SourceUnavailable(_))));
    }

    #[tokio::test]
    async fn test_fetch_community() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/2.3/search/advanced"))
            .and(query_param("tagged", "reactjs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [{
                    "question_id": 42,
                    "title": "useEffect runs twice",
                    "link": "https://stackoverflow.com/q/42",
                    "body": "<p>Why does my effect run twice?</p>",
                    "score": 10
                }]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/2.3/questions/42/answers"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [{"question_id": 42, "body": "<p>StrictMode mounts twice.</p>", "score": 5, "is_accepted": true}]
            })))
            .mount(&server)
            .await;

        let settings = Settings {
            stackexchange_api_url: server.uri(),
            ..Settings::default()
        };
        let index = Arc::new(KnowledgeIndex::in_memory().await.unwrap());
        let ingestor = ingestor(&settings, index.clone());
        let count = ingestor.fetch_community(Technology::React, "effect twice").await.unwrap();
        assert_eq!(count, 1);

        let hits = index.search(Technology::React, Pool::Community, "StrictMode", None, 0.7, 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.source.url.as_deref(), Some("https://stackoverflow.com/q/42"));
    }
}
