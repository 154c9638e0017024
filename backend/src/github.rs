use reqwest::{Client, StatusCode};
use std::time::Duration;

use crate::config::Settings;
use crate::errors::{Result, ServiceError};
use crate::models::{default_branch, GitHubContent, GithubRepoRef};

const CODE_EXTENSIONS: &[&str] = &[
    ".py", ".js", ".jsx", ".ts", ".tsx", ".html", ".css", ".java", ".c", ".cpp", ".h", ".cs",
    ".php", ".rb", ".go", ".rs", ".swift", ".kt", ".scala", ".sh", ".sql", ".json", ".yml", ".yaml",
];

/// Code pulled from a repository, ready for analysis.
#[derive(Debug, Clone)]
pub struct ResolvedSource {
    pub code: String,
    pub label: String,
    pub files: Vec<String>,
}

pub struct GitHubClient {
    client: Client,
    token: Option<String>,
    api_url: String,
    max_files: usize,
    max_bytes: usize,
}

impl GitHubClient {
    pub fn new(settings: &Settings) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ServiceError::Configuration(format!("Failed to create HTTP client: {}", e)))?;

        let token = settings.github_access_token.clone();
        if token.is_some() {
            log::info!("Using GitHub token for authentication");
        } else {
            log::warn!("No GitHub token found, using unauthenticated requests (rate limited)");
        }

        Ok(Self {
            client,
            token,
            api_url: settings.github_api_url.trim_end_matches('/').to_string(),
            max_files: settings.github_max_files,
            max_bytes: settings.max_code_bytes,
        })
    }

    /// Fetch the code a reference points at. A file yields its content; a
    /// directory (or the repository root) yields its code files concatenated.
    pub async fn fetch_source(&self, repo: &GithubRepoRef) -> Result<ResolvedSource> {
        let path = repo.path.as_deref().unwrap_or("");
        log::info!(
            "Resolving GitHub source: {}/{}@{} path='{}'",
            repo.owner, repo.repo, repo.branch, path
        );

        let entries = self.get_contents(repo, path).await?;

        // A single entry carrying content is a file
        if let [entry] = entries.as_slice() {
            if entry.content_type == "file" && entry.content.is_some() {
                let code = decode_content(entry)?;
                return Ok(ResolvedSource {
                    code: truncate_to(&code, self.max_bytes),
                    label: entry.path.clone(),
                    files: vec![entry.path.clone()],
                });
            }
        }

        let mut code = String::new();
        let mut files = Vec::new();

        for entry in entries.iter().filter(|e| e.content_type == "file" && is_code_file(&e.path)) {
            if files.len() >= self.max_files || code.len() >= self.max_bytes {
                break;
            }

            let file = match self.get_contents(repo, &entry.path).await {
                Ok(mut found) if found.len() == 1 => found.remove(0),
                Ok(_) => continue,
                Err(e) => {
                    log::warn!("Skipping {}: {}", entry.path, e);
                    continue;
                }
            };

            match decode_content(&file) {
                Ok(text) => {
                    code.push_str(&format!("// File: {}\n\n{}\n\n", file.path, text));
                    files.push(file.path.clone());
                }
                Err(e) => log::warn!("Error decoding file {}: {}", file.path, e),
            }
        }

        if files.is_empty() {
            return Err(ServiceError::SourceUnavailable(format!(
                "No code files found at {}/{}/{}",
                repo.owner, repo.repo, path
            )));
        }

        Ok(ResolvedSource {
            code: truncate_to(&code, self.max_bytes),
            label: if path.is_empty() { "Repository root".to_string() } else { path.to_string() },
            files,
        })
    }

    pub async fn get_contents(&self, repo: &GithubRepoRef, path: &str) -> Result<Vec<GitHubContent>> {
        let url = format!(
            "{}/repos/{}/{}/contents/{}",
            self.api_url,
            repo.owner,
            repo.repo,
            path.trim_matches('/')
        );
        log::debug!("Fetching repo contents: {} (ref {})", url, repo.branch);

        let mut request = self
            .client
            .get(&url)
            .query(&[("ref", repo.branch.as_str())])
            .header("User-Agent", "DevSolver-App")
            .header("Accept", "application/vnd.github.v3+json");

        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("token {}", token));
        }

        let response = request.send().await.map_err(|e| {
            ServiceError::SourceUnavailable(format!("Failed to connect to GitHub API: {}", e))
        })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ServiceError::SourceUnavailable(format!(
                "Not found: {}/{}@{} path '{}'",
                repo.owner, repo.repo, repo.branch, path
            )));
        } else if status == StatusCode::FORBIDDEN || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ServiceError::SourceUnavailable(
                "GitHub API rate limit exceeded or access denied".to_string(),
            ));
        } else if status == StatusCode::UNAUTHORIZED {
            return Err(ServiceError::SourceUnavailable("GitHub rejected the access token".to_string()));
        } else if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Could not read error response".to_string());
            log::warn!("GitHub API error: {} - {}", status, error_text);
            return Err(ServiceError::SourceUnavailable(format!("GitHub API error: {}", status)));
        }

        let text = response.text().await.map_err(|e| {
            ServiceError::SourceUnavailable(format!("Failed to read GitHub response: {}", e))
        })?;

        // GitHub API returns either an array (for directories) or a single object (for files)
        if let Ok(contents) = serde_json::from_str::<Vec<GitHubContent>>(&text) {
            return Ok(contents);
        }
        serde_json::from_str::<GitHubContent>(&text)
            .map(|file| vec![file])
            .map_err(|e| ServiceError::SourceUnavailable(format!("Failed to parse GitHub content: {}", e)))
    }
}

/// Parse `https://github.com/<owner>/<repo>[/tree/<branch>[/<path...>]]`.
pub fn parse_github_url(repo_url: &str) -> Result<GithubRepoRef> {
    let invalid = || ServiceError::Validation(format!("Invalid GitHub repository URL: {}", repo_url));

    let trimmed = repo_url.trim().trim_end_matches('/');
    let without_scheme = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed);

    let mut parts = without_scheme.split('/');
    let host = parts.next().ok_or_else(invalid)?.to_ascii_lowercase();
    if host != "github.com" && host != "www.github.com" {
        return Err(invalid());
    }

    let owner = parts.next().filter(|s| !s.is_empty()).ok_or_else(invalid)?;
    let repo = parts
        .next()
        .map(|s| s.trim_end_matches(".git"))
        .filter(|s| !s.is_empty())
        .ok_or_else(invalid)?;

    let rest: Vec<&str> = parts.filter(|s| !s.is_empty()).collect();
    let (branch, path) = match rest.as_slice() {
        [] => (default_branch(), None),
        ["tree", branch, path @ ..] => {
            let path = if path.is_empty() { None } else { Some(path.join("/")) };
            (branch.to_string(), path)
        }
        _ => return Err(invalid()),
    };

    Ok(GithubRepoRef {
        owner: owner.to_string(),
        repo: repo.to_string(),
        branch,
        path,
    })
}

pub fn is_code_file(file_path: &str) -> bool {
    let lower = file_path.to_ascii_lowercase();
    CODE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

fn decode_content(file: &GitHubContent) -> Result<String> {
    let content = file
        .content
        .as_deref()
        .ok_or_else(|| ServiceError::SourceUnavailable(format!("No content returned for {}", file.path)))?;

    match file.encoding.as_deref() {
        Some("base64") => {
            // Remove whitespace and newlines from base64 content
            let clean_content: String = content.chars().filter(|c| !c.is_whitespace()).collect();
            let decoded = base64::decode(&clean_content).map_err(|e| {
                ServiceError::SourceUnavailable(format!("Failed to decode base64 for {}: {}", file.path, e))
            })?;
            String::from_utf8(decoded)
                .map_err(|_| ServiceError::SourceUnavailable(format!("{} is not valid UTF-8", file.path)))
        }
        _ => Ok(content.to_string()),
    }
}

/// Cut `text` down to at most `max_bytes`, never splitting a character.
pub fn truncate_to(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}
