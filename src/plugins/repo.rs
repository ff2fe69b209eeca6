//! Repository sources the personas scan.
//!
//! [`LocalRepo`] walks a working tree; [`GitHubRepo`] is a thin wrapper over
//! the GitHub REST API. Both return repository-relative `/`-separated paths.

use crate::core::config::Config;
use crate::core::error::CustodesError;
use crate::plugins::analysis;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitSummary {
    pub sha: String,
    pub message: String,
    pub author: String,
    pub timestamp: Option<String>,
}

#[async_trait]
pub trait RepoSource: Send + Sync {
    fn describe(&self) -> String;

    /// Source files, sorted.
    async fn list_files(&self) -> Result<Vec<String>, CustodesError>;

    async fn file_content(&self, path: &str) -> Result<String, CustodesError>;

    /// Newest first.
    async fn recent_commits(&self, limit: usize) -> Result<Vec<CommitSummary>, CustodesError>;
}

/// Reject absolute paths and any `..` component.
pub fn safe_relative_path(path: &str) -> Result<PathBuf, CustodesError> {
    let p = Path::new(path);
    if path.is_empty() || p.is_absolute() {
        return Err(CustodesError::PathError(format!(
            "path must be relative: '{}'",
            path
        )));
    }
    for c in p.components() {
        match c {
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(CustodesError::PathError(format!(
                    "path escapes the repository: '{}'",
                    path
                )));
            }
        }
    }
    Ok(p.to_path_buf())
}

const SKIP_DIRS: &[&str] = &["target", "build", "node_modules", "vendor"];

pub struct LocalRepo {
    root: PathBuf,
}

impl LocalRepo {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn walk(root: &Path) -> Result<Vec<String>, CustodesError> {
        let mut out = Vec::new();
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().to_string();
                if name.starts_with('.') {
                    continue;
                }
                let path = entry.path();
                let ft = entry.file_type()?;
                if ft.is_dir() {
                    if !SKIP_DIRS.contains(&name.as_str()) {
                        stack.push(path);
                    }
                } else if ft.is_file() {
                    let rel = path
                        .strip_prefix(root)
                        .map_err(|e| CustodesError::PathError(e.to_string()))?;
                    let rel = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().to_string())
                        .collect::<Vec<_>>()
                        .join("/");
                    if analysis::is_source_file(&rel) {
                        out.push(rel);
                    }
                }
            }
        }
        out.sort();
        Ok(out)
    }

    /// Parse `.git/logs/HEAD` reflog lines:
    /// `<old> <new> <name> <<email>> <epoch> <tz>\t<message>`.
    pub fn parse_reflog(content: &str) -> Vec<CommitSummary> {
        content
            .lines()
            .filter_map(|line| {
                let (head, message) = line.split_once('\t')?;
                let mut parts = head.splitn(3, ' ');
                let _old = parts.next()?;
                let new = parts.next()?;
                let rest = parts.next()?;
                let (author, tail) = rest.split_once(" <")?;
                let (_, when) = tail.split_once("> ")?;
                let epoch = when.split_whitespace().next().map(|s| format!("{}Z", s));
                Some(CommitSummary {
                    sha: new.to_string(),
                    message: message.to_string(),
                    author: author.to_string(),
                    timestamp: epoch,
                })
            })
            .collect()
    }
}

#[async_trait]
impl RepoSource for LocalRepo {
    fn describe(&self) -> String {
        format!("local:{}", self.root.display())
    }

    async fn list_files(&self) -> Result<Vec<String>, CustodesError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || Self::walk(&root)).await?
    }

    async fn file_content(&self, path: &str) -> Result<String, CustodesError> {
        let rel = safe_relative_path(path)?;
        Ok(tokio::fs::read_to_string(self.root.join(rel)).await?)
    }

    async fn recent_commits(&self, limit: usize) -> Result<Vec<CommitSummary>, CustodesError> {
        let log = self.root.join(".git").join("logs").join("HEAD");
        let content = match tokio::fs::read_to_string(&log).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut commits = Self::parse_reflog(&content);
        commits.reverse();
        commits.truncate(limit);
        Ok(commits)
    }
}

pub struct GitHubRepo {
    client: reqwest::Client,
    api_base: String,
    owner: String,
    repo: String,
    branch: String,
    token: Option<String>,
}

#[derive(Deserialize)]
struct TreeResponse {
    tree: Vec<TreeEntry>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Deserialize)]
struct TreeEntry {
    path: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Deserialize)]
struct CommitEntry {
    sha: String,
    commit: CommitDetail,
}

#[derive(Deserialize)]
struct CommitDetail {
    message: String,
    author: Option<CommitAuthor>,
}

#[derive(Deserialize)]
struct CommitAuthor {
    name: String,
    date: Option<String>,
}

impl GitHubRepo {
    pub fn new(
        api_base: &str,
        owner: &str,
        repo: &str,
        branch: &str,
        token: Option<String>,
    ) -> Result<Self, CustodesError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .user_agent(concat!("custodes/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            owner: owner.to_string(),
            repo: repo.to_string(),
            branch: branch.to_string(),
            token,
        })
    }

    /// Contents URL with every path segment and the ref percent-encoded.
    fn contents_url(&self, path: &str) -> Result<reqwest::Url, CustodesError> {
        let base = format!("{}/repos/{}/{}/contents", self.api_base, self.owner, self.repo);
        let mut url = reqwest::Url::parse(&base)
            .map_err(|e| CustodesError::ConfigError(format!("invalid GitHub API base '{}': {}", base, e)))?;
        url.path_segments_mut()
            .map_err(|_| CustodesError::ConfigError(format!("GitHub API base '{}' cannot take a path", base)))?
            .extend(path.split('/').filter(|seg| !seg.is_empty() && *seg != "."));
        url.query_pairs_mut().append_pair("ref", &self.branch);
        Ok(url)
    }

    fn request<U: reqwest::IntoUrl>(&self, url: U) -> reqwest::RequestBuilder {
        let req = self
            .client
            .get(url)
            .header("X-GitHub-Api-Version", "2022-11-28");
        match &self.token {
            Some(t) => req.bearer_auth(t),
            None => req,
        }
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, CustodesError> {
        let response = req.send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(CustodesError::NotFound(format!(
                "GitHub resource in {}/{}",
                self.owner, self.repo
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = %status, repo = %self.describe(), "GitHub API request failed");
            return Err(CustodesError::ValidationError(format!(
                "GitHub API returned {}: {}",
                status,
                crate::core::output::compact_line(&body, 200)
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl RepoSource for GitHubRepo {
    fn describe(&self) -> String {
        format!("github:{}/{}@{}", self.owner, self.repo, self.branch)
    }

    async fn list_files(&self) -> Result<Vec<String>, CustodesError> {
        let url = format!(
            "{}/repos/{}/{}/git/trees/{}?recursive=1",
            self.api_base, self.owner, self.repo, self.branch
        );
        let tree: TreeResponse = self
            .send(self.request(url).header("Accept", "application/vnd.github+json"))
            .await?
            .json()
            .await?;
        if tree.truncated {
            tracing::warn!(repo = %self.describe(), "GitHub tree listing truncated");
        }
        let mut files: Vec<String> = tree
            .tree
            .into_iter()
            .filter(|e| e.kind == "blob" && analysis::is_source_file(&e.path))
            .map(|e| e.path)
            .collect();
        files.sort();
        Ok(files)
    }

    async fn file_content(&self, path: &str) -> Result<String, CustodesError> {
        safe_relative_path(path)?;
        let url = self.contents_url(path)?;
        Ok(self
            .send(self.request(url).header("Accept", "application/vnd.github.raw"))
            .await?
            .text()
            .await?)
    }

    async fn recent_commits(&self, limit: usize) -> Result<Vec<CommitSummary>, CustodesError> {
        let url = format!(
            "{}/repos/{}/{}/commits?sha={}&per_page={}",
            self.api_base,
            self.owner,
            self.repo,
            self.branch,
            limit.clamp(1, 100)
        );
        let entries: Vec<CommitEntry> = self
            .send(self.request(url).header("Accept", "application/vnd.github+json"))
            .await?
            .json()
            .await?;
        Ok(entries
            .into_iter()
            .map(|e| CommitSummary {
                sha: e.sha,
                message: e.commit.message,
                author: e
                    .commit
                    .author
                    .as_ref()
                    .map(|a| a.name.clone())
                    .unwrap_or_default(),
                timestamp: e.commit.author.and_then(|a| a.date),
            })
            .collect())
    }
}

/// GitHub when configured, otherwise the local working tree.
pub fn build_source(config: &Config) -> Result<Arc<dyn RepoSource>, CustodesError> {
    let gh = &config.github;
    if gh.is_configured() {
        let token = std::env::var(&gh.token_env)
            .ok()
            .filter(|t| !t.trim().is_empty());
        if token.is_none() {
            tracing::warn!(env = %gh.token_env, "GitHub token not set; using unauthenticated requests");
        }
        return Ok(Arc::new(GitHubRepo::new(
            &gh.api_base,
            &gh.owner,
            &gh.repo,
            &gh.branch,
            token,
        )?));
    }
    Ok(Arc::new(LocalRepo::new(config.repo.local_path.clone())))
}
