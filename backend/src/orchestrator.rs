use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::analyzer::CodeAnalyzer;
use crate::config::Settings;
use crate::documents::DocumentIngestor;
use crate::errors::{ProviderFailure, Result, ServiceError};
use crate::github::{parse_github_url, truncate_to, GitHubClient};
use crate::models::{CodeAnalysis, CodeSource, Pool, QueryRequest, QueryResponse, SolutionResult, Technology};
use crate::providers::{Generator, Providers};
use crate::rate_limiter::{with_retry, RateLimiter};
use crate::retrieval::{KnowledgeIndex, QueryVector, SearchHit};

const SEARCH_CODE_CHARS: usize = 500;
const PROMPT_CODE_CHARS: usize = 6000;
const REVIEW_CODE_CHARS: usize = 4000;

/// Turns one `QueryRequest` into one `QueryResponse`: resolve the code,
/// answer from each requested pool and analyze the code concurrently, then
/// assemble whatever succeeded.
pub struct QueryOrchestrator {
    github: GitHubClient,
    analyzer: Arc<CodeAnalyzer>,
    generator: Option<Arc<dyn Generator>>,
    index: Arc<KnowledgeIndex>,
    ingestor: Arc<DocumentIngestor>,
    generation_budget: Arc<RateLimiter>,
    top_k: usize,
    semantic_weight: f64,
    use_web_grounding: bool,
    max_code_bytes: usize,
    max_retries: u32,
    retry_base_delay: Duration,
}

impl QueryOrchestrator {
    pub fn new(settings: &Settings, providers: Providers, index: Arc<KnowledgeIndex>) -> Result<Self> {
        let embedding_budget = Arc::new(RateLimiter::from_settings("embedding", settings));
        let ingestor = DocumentIngestor::new(settings, index.clone(), providers.embedder.clone(), embedding_budget)?;

        Ok(Self {
            github: GitHubClient::new(settings)?,
            analyzer: Arc::new(CodeAnalyzer::new()?),
            generator: providers.generator,
            index,
            ingestor: Arc::new(ingestor),
            generation_budget: Arc::new(RateLimiter::from_settings("generation", settings)),
            top_k: settings.top_k_retrieval,
            semantic_weight: settings.semantic_weight,
            use_web_grounding: settings.use_web_grounding,
            max_code_bytes: settings.max_code_bytes,
            max_retries: settings.generation_max_retries,
            retry_base_delay: settings.retry_base_delay,
        })
    }

    pub fn ingestor(&self) -> Arc<DocumentIngestor> {
        self.ingestor.clone()
    }

    pub fn index(&self) -> &KnowledgeIndex {
        &self.index
    }

    pub fn generator_model(&self) -> Option<&str> {
        self.generator.as_ref().map(|g| g.model_name())
    }

    pub fn embedder_model(&self) -> &str {
        self.ingestor.embedder().model_name()
    }

    pub async fn handle(&self, request: QueryRequest) -> Result<QueryResponse> {
        let started = Instant::now();
        request.validate()?;
        log::info!(
            "Processing {} query for {} ({:?})",
            request.source.as_str(),
            request.technology,
            request.response_source_preference
        );

        let code = self.resolve_source(&request).await?;
        let search_text = format!(
            "{}\n{}",
            request.query,
            code.chars().take(SEARCH_CODE_CHARS).collect::<String>()
        );
        let query_vec = self.ingestor.embed_query(&search_text).await;
        let query_vec = query_vec.as_deref();

        let official = async {
            if request.response_source_preference.includes(Pool::Official) {
                Some(self.answer_from_pool(Pool::Official, &request, &code, &search_text, query_vec).await)
            } else {
                None
            }
        };
        let community = async {
            if request.response_source_preference.includes(Pool::Community) {
                Some(self.answer_from_pool(Pool::Community, &request, &code, &search_text, query_vec).await)
            } else {
                None
            }
        };
        let analysis = self.analyze(&code, request.technology);

        let (official, community, analysis) = tokio::join!(official, community, analysis);

        let mut failures = Vec::new();
        let mut requested = 0;
        let mut settle = |outcome: Option<Result<Option<SolutionResult>>>| match outcome {
            None => None,
            Some(Ok(solution)) => {
                requested += 1;
                solution
            }
            Some(Err(e)) => {
                requested += 1;
                failures.push(e);
                None
            }
        };
        let official_solution = settle(official);
        let community_solution = settle(community);

        let code_analysis = match analysis {
            Ok(analysis) => Some(analysis),
            Err(e) => {
                log::error!("Code analysis failed: {}", e);
                failures.push(e);
                None
            }
        };

        // Everything that was attempted failed
        if code_analysis.is_none() && failures.len() == requested + 1 {
            return Err(pick_error(failures));
        }

        let execution_time = started.elapsed().as_secs_f64();
        log::info!(
            "Query processed in {:.2}s (official: {}, community: {}, analysis: {})",
            execution_time,
            official_solution.is_some(),
            community_solution.is_some(),
            code_analysis.is_some()
        );

        Ok(QueryResponse {
            query: request.query,
            official_solution,
            community_solution,
            code_analysis,
            technology: request.technology,
            execution_time,
            timestamp: Utc::now(),
        })
    }

    async fn resolve_source(&self, request: &QueryRequest) -> Result<String> {
        let code = match request.source {
            CodeSource::Github => {
                let repo = match (&request.github_repo, &request.github_url) {
                    (Some(repo), _) => repo.clone(),
                    (None, Some(url)) => parse_github_url(url)?,
                    (None, None) => {
                        return Err(ServiceError::Validation(
                            "github_repo or github_url is required when source is 'github'".to_string(),
                        ))
                    }
                };
                let resolved = self.github.fetch_source(&repo).await?;
                log::info!("Resolved {} file(s) from {}", resolved.files.len(), resolved.label);
                resolved.code
            }
            CodeSource::Snippet | CodeSource::File => request.code_snippet.clone().unwrap_or_default(),
        };

        if code.len() > self.max_code_bytes {
            log::warn!("Code is {} bytes; truncating to {}", code.len(), self.max_code_bytes);
        }
        Ok(truncate_to(&code, self.max_code_bytes))
    }

    /// `Ok(None)` when the pool has nothing to answer from or no generator is
    /// configured; `Err` when generation itself failed.
    async fn answer_from_pool(
        &self,
        pool: Pool,
        request: &QueryRequest,
        code: &str,
        search_text: &str,
        query_vec: Option<&[f32]>,
    ) -> Result<Option<SolutionResult>> {
        let technology = request.technology;

        if pool == Pool::Community && self.use_web_grounding && self.index.chunk_count(technology, pool).await? == 0 {
            match self.ingestor.fetch_community(technology, &request.query).await {
                Ok(count) => log::info!("Web grounding added {} community chunks for {}", count, technology),
                Err(e) => log::warn!("Web grounding failed for {}: {}", technology, e),
            }
        }

        let query_vec = query_vec.map(|values| QueryVector {
            model: self.embedder_model(),
            values,
        });
        let hits = self
            .index
            .search(technology, pool, search_text, query_vec, self.semantic_weight, self.top_k)
            .await?;
        if hits.is_empty() {
            log::info!("No {} context for {}; skipping generation", pool, technology);
            return Ok(None);
        }

        let generator = match &self.generator {
            Some(generator) => generator,
            None => {
                log::warn!("No generator configured; {} answer unavailable", pool);
                return Ok(None);
            }
        };

        let prompt = solution_prompt(pool, request, code, &hits);
        let label = format!("{} answer", pool);
        let answer = self.generate(&label, generator.as_ref(), &prompt).await.map_err(|e| {
            log::error!("Generating the {} answer failed: {}", pool, e);
            ServiceError::from(e)
        })?;

        let confidence_score = hits.iter().map(|h| h.score).sum::<f64>() / hits.len() as f64;
        Ok(Some(SolutionResult {
            source_type: pool,
            code_changes: extract_code_blocks(&answer),
            references: hits.iter().map(SearchHit::to_reference).collect(),
            confidence_score,
            answer,
        }))
    }

    /// Heuristic analysis on a blocking worker, plus a short model review
    /// when a generator is available. The review never fails the analysis.
    pub async fn analyze(&self, code: &str, technology: Technology) -> Result<CodeAnalysis> {
        let analyzer = self.analyzer.clone();
        let owned = code.to_string();
        let mut analysis = tokio::task::spawn_blocking(move || analyzer.analyze(&owned, technology))
            .await
            .map_err(|e| ServiceError::Internal(format!("Analysis worker failed: {}", e)))??;

        if let Some(generator) = &self.generator {
            let prompt = review_prompt(code, technology, &analysis);
            match self.generate("code review", generator.as_ref(), &prompt).await {
                Ok(note) => {
                    let details = analysis.analysis_details.get_or_insert_with(Default::default);
                    details.additional_notes = Some(note.trim().to_string());
                }
                Err(e) => log::warn!("Model review skipped: {}", e),
            }
        }

        Ok(analysis)
    }

    // One budgeted, retried generation call
    async fn generate(
        &self,
        label: &str,
        generator: &dyn Generator,
        prompt: &str,
    ) -> std::result::Result<String, ProviderFailure> {
        with_retry(label, self.max_retries, self.retry_base_delay, || async {
            self.generation_budget.acquire().await?;
            generator.generate(prompt).await
        })
        .await
    }
}

fn pick_error(failures: Vec<ServiceError>) -> ServiceError {
    let mut failures = failures.into_iter();
    let first = failures.next();
    let mut chosen = first.unwrap_or_else(|| ServiceError::Internal("Query failed".to_string()));
    for e in failures {
        if matches!(e, ServiceError::RateLimitExceeded(_)) {
            chosen = e;
        }
    }
    chosen
}

fn pool_heading(pool: Pool) -> &'static str {
    match pool {
        Pool::Official => "OFFICIAL DOCUMENTATION",
        Pool::Community => "COMMUNITY SOLUTIONS",
    }
}

/// Context block grouped by source, in rank order of first appearance.
fn context_block(hits: &[SearchHit]) -> String {
    let mut titles: Vec<&str> = Vec::new();
    for hit in hits {
        if !titles.contains(&hit.chunk.source.title.as_str()) {
            titles.push(&hit.chunk.source.title);
        }
    }

    let mut context = String::new();
    for title in titles {
        context.push_str(&format!("# Source: {}\n\n", title));
        for hit in hits.iter().filter(|h| h.chunk.source.title == title) {
            context.push_str(hit.chunk.content.trim());
            context.push_str("\n\n---\n\n");
        }
    }
    context
}

fn solution_prompt(pool: Pool, request: &QueryRequest, code: &str, hits: &[SearchHit]) -> String {
    let heading = pool_heading(pool);
    let mut prompt = format!(
        "You are a programming assistant answering a question about {tech} code.\n\
         Answer using ONLY the {heading} below. If it does not contain the answer, say so.\n\
         Cite the sources you rely on. Put code changes in fenced code blocks.\n\n\
         CODE:\n```{tech}\n{code}\n```\n\n",
        tech = request.technology,
        heading = heading,
        code = code.chars().take(PROMPT_CODE_CHARS).collect::<String>(),
    );
    if let Some(context) = request.context.as_deref().filter(|c| !c.trim().is_empty()) {
        prompt.push_str(&format!("ADDITIONAL CONTEXT:\n{}\n\n", context.trim()));
    }
    prompt.push_str(&format!("{}:\n{}\n", heading, context_block(hits)));
    prompt.push_str(&format!("QUESTION: {}\n", request.query.trim()));
    prompt
}

fn review_prompt(code: &str, technology: Technology, analysis: &CodeAnalysis) -> String {
    let findings: Vec<String> = analysis
        .issues
        .iter()
        .map(|i| match i.line_number {
            Some(line) => format!("- [{}] line {}: {}", i.severity, line, i.description),
            None => format!("- [{}] {}", i.severity, i.description),
        })
        .collect();
    format!(
        "Review the following {tech} code in at most five sentences. \
         Mention problems the automated findings missed.\n\n\
         Automated findings:\n{findings}\n\n```{tech}\n{code}\n```\n",
        tech = technology,
        findings = if findings.is_empty() { "- none".to_string() } else { findings.join("\n") },
        code = code.chars().take(REVIEW_CODE_CHARS).collect::<String>(),
    )
}

/// Bodies of all complete fenced code blocks, joined by blank lines.
pub fn extract_code_blocks(answer: &str) -> Option<String> {
    let segments: Vec<&str> = answer.split("```").collect();
    // An even segment count means an unterminated fence; drop the tail
    let complete = if segments.len() % 2 == 0 { segments.len() - 1 } else { segments.len() };

    let blocks: Vec<&str> = segments[..complete]
        .iter()
        .skip(1)
        .step_by(2)
        .map(|block| match block.find('\n') {
            // First line is the language tag
            Some(newline) => &block[newline + 1..],
            None => block,
        })
        .map(|block| block.trim_end())
        .filter(|block| !block.trim().is_empty())
        .collect();

    if blocks.is_empty() {
        None
    } else {
        Some(blocks.join("\n\n"))
    }
}
