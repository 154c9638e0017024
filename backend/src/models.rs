use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::ServiceError;

// Request Models
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodeSource {
    Snippet,
    Github,
    File,
}

impl CodeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CodeSource::Snippet => "snippet",
            CodeSource::Github => "github",
            CodeSource::File => "file",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Technology {
    Python,
    Javascript,
    Typescript,
    React,
    Node,
    Html,
    Css,
    Sql,
}

impl Technology {
    pub const ALL: [Technology; 8] = [
        Technology::Python,
        Technology::Javascript,
        Technology::Typescript,
        Technology::React,
        Technology::Node,
        Technology::Html,
        Technology::Css,
        Technology::Sql,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Technology::Python => "python",
            Technology::Javascript => "javascript",
            Technology::Typescript => "typescript",
            Technology::React => "react",
            Technology::Node => "node",
            Technology::Html => "html",
            Technology::Css => "css",
            Technology::Sql => "sql",
        }
    }

    pub fn parse(value: &str) -> Option<Technology> {
        let value = value.trim().to_ascii_lowercase();
        Technology::ALL.iter().copied().find(|t| t.as_str() == value)
    }

    /// True for the JavaScript family, which shares one structural parser.
    pub fn is_javascript_like(&self) -> bool {
        matches!(
            self,
            Technology::Javascript | Technology::Typescript | Technology::React | Technology::Node
        )
    }
}

impl fmt::Display for Technology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pool {
    Official,
    Community,
}

impl Pool {
    pub fn as_str(&self) -> &'static str {
        match self {
            Pool::Official => "official",
            Pool::Community => "community",
        }
    }
}

impl fmt::Display for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseSourcePreference {
    Official,
    Community,
    #[default]
    Both,
}

impl ResponseSourcePreference {
    pub fn includes(&self, pool: Pool) -> bool {
        match self {
            ResponseSourcePreference::Both => true,
            ResponseSourcePreference::Official => pool == Pool::Official,
            ResponseSourcePreference::Community => pool == Pool::Community,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GithubRepoRef {
    pub owner: String,
    pub repo: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

pub fn default_branch() -> String {
    "main".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub source: CodeSource,
    pub technology: Technology,
    #[serde(default)]
    pub code_snippet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_repo: Option<GithubRepoRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub query: String,
    #[serde(default)]
    pub response_source_preference: ResponseSourcePreference,
}

impl QueryRequest {
    pub fn snippet(technology: Technology, code: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            source: CodeSource::Snippet,
            technology,
            code_snippet: Some(code.into()),
            github_repo: None,
            github_url: None,
            file_name: None,
            context: None,
            query: query.into(),
            response_source_preference: ResponseSourcePreference::Both,
        }
    }

    pub fn has_code(&self) -> bool {
        self.code_snippet.as_deref().map_or(false, |c| !c.trim().is_empty())
    }

    /// Checks that need no network: a question, and code for the sources
    /// that carry it inline.
    pub fn validate(&self) -> Result<(), ServiceError> {
        if self.query.trim().is_empty() {
            return Err(ServiceError::Validation("Query must not be empty".to_string()));
        }
        match self.source {
            CodeSource::Snippet | CodeSource::File if !self.has_code() => Err(ServiceError::Validation(
                format!("code_snippet is required when source is '{}'", self.source.as_str()),
            )),
            CodeSource::Github if self.github_repo.is_none() && self.github_url.is_none() => Err(
                ServiceError::Validation("github_repo or github_url is required when source is 'github'".to_string()),
            ),
            CodeSource::Snippet | CodeSource::File if self.github_repo.is_some() => Err(ServiceError::Validation(
                "github_repo is only allowed when source is 'github'".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

// Response Models
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSource {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub source_type: Pool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reference {
    pub source: DocumentSource,
    #[serde(default)]
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excerpt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolutionResult {
    pub source_type: Pool,
    pub answer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_changes: Option<String>,
    #[serde(default)]
    pub references: Vec<Reference>,
    #[serde(default)]
    pub confidence_score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Level {
    #[serde(rename = "low")]
    Low,
    #[serde(rename = "medium")]
    Medium,
    #[serde(rename = "high")]
    High,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Low => f.write_str("low"),
            Level::Medium => f.write_str("medium"),
            Level::High => f.write_str("high"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeIssue {
    pub description: String,
    pub severity: Level,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_number: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeSuggestion {
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub benefit: Option<String>,
    pub effort: Level,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_structure: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_practices: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeAnalysis {
    pub issues: Vec<CodeIssue>,
    pub suggestions: Vec<CodeSuggestion>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub complexity_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_details: Option<AnalysisDetails>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub query: String,
    pub official_solution: Option<SolutionResult>,
    pub community_solution: Option<SolutionResult>,
    pub code_analysis: Option<CodeAnalysis>,
    pub technology: Technology,
    pub execution_time: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadAck {
    pub filename: String,
    pub size: usize,
    pub technology: Technology,
    pub analysis: CodeAnalysis,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TechnologiesResponse {
    pub technologies: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FetchDocumentationRequest {
    pub technology: Technology,
    pub source_url: String,
    #[serde(default = "default_pool")]
    pub pool: Pool,
}

fn default_pool() -> Pool {
    Pool::Official
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FetchDocumentationResponse {
    pub message: String,
    pub status: String,
}

// GitHub API Models
#[derive(Debug, Serialize, Deserialize)]
pub struct GitHubContent {
    pub name: String,
    pub path: String,
    pub sha: String,
    pub size: Option<u64>,
    #[serde(rename = "type")]
    pub content_type: String,  // "file", "dir", "symlink", etc.
    pub download_url: Option<String>,
    pub content: Option<String>,
    pub encoding: Option<String>,
}
