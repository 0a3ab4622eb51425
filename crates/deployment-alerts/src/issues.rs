//! Issue tracker collaborator for novel aggregate rows.
//!
//! Each tracker deduplicates on its own: an issue is only opened when no open
//! issue title already contains the uppercased `"{protocol} - {type}"` key.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub const GITHUB_API_URL: &str = "https://api.github.com";

/// Structured issue title.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueTitle {
    pub protocol: String,
    pub issue_type: String,
    pub chains: Vec<String>,
}

impl IssueTitle {
    /// Key matched against open issue titles.
    pub fn dedup_key(&self) -> String {
        format!("{} - {}", self.protocol, self.issue_type).to_uppercase()
    }

    pub fn render(&self) -> String {
        if self.chains.is_empty() {
            return self.dedup_key();
        }
        format!("{} ({})", self.dedup_key(), self.chains.join(", "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueReport {
    pub title: IssueTitle,
    pub body: String,
}

/// What the tracker did with a report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssueOutcome {
    Created { number: u64 },
    Duplicate,
}

#[async_trait]
pub trait IssueTracker: Send + Sync {
    async fn report(&self, issue: &IssueReport) -> Result<IssueOutcome>;
}

#[derive(Debug, Deserialize)]
struct Issue {
    number: u64,
    title: String,
    /// Present when the entry is a pull request.
    #[serde(default)]
    pull_request: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct CreateIssueRequest<'a> {
    title: String,
    body: &'a str,
}

/// Files alert issues in a GitHub repository.
#[derive(Debug, Clone)]
pub struct GitHubIssueTracker {
    client: reqwest::Client,
    token: String,
    repo: String,
    api_base: String,
}

impl GitHubIssueTracker {
    /// `repo` is `owner/name`.
    pub fn new(token: &str, repo: &str) -> Result<Self> {
        Self::with_api_base(token, repo, GITHUB_API_URL)
    }

    pub fn with_api_base(token: &str, repo: &str, api_base: &str) -> Result<Self> {
        if repo.split('/').filter(|p| !p.is_empty()).count() != 2 {
            return Err(anyhow!("Invalid repository '{repo}', expected owner/name"));
        }

        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );
        headers.insert(
            "X-GitHub-Api-Version",
            HeaderValue::from_static("2022-11-28"),
        );
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("deployment-alerts/", env!("CARGO_PKG_VERSION"))),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            token: token.to_string(),
            repo: repo.to_string(),
            api_base: api_base.trim_end_matches('/').to_string(),
        })
    }

    async fn open_issue_titles(&self) -> Result<Vec<String>> {
        let url = format!("{}/repos/{}/issues", self.api_base, self.repo);

        let response = self
            .client
            .get(&url)
            .query(&[("state", "open"), ("per_page", "100")])
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .send()
            .await
            .context("Failed to send list issues request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("GitHub API error listing issues: {status} - {body}"));
        }

        let issues: Vec<Issue> = response
            .json()
            .await
            .context("Failed to parse issue list response")?;

        Ok(issues
            .into_iter()
            .filter(|i| i.pull_request.is_none())
            .map(|i| {
                debug!(number = i.number, title = %i.title, "Open issue");
                i.title
            })
            .collect())
    }
}

#[async_trait]
impl IssueTracker for GitHubIssueTracker {
    async fn report(&self, issue: &IssueReport) -> Result<IssueOutcome> {
        let key = issue.title.dedup_key();
        let open = self.open_issue_titles().await?;
        if open.iter().any(|title| title.to_uppercase().contains(&key)) {
            debug!(key = %key, "Matching issue already open");
            return Ok(IssueOutcome::Duplicate);
        }

        let url = format!("{}/repos/{}/issues", self.api_base, self.repo);
        let request = CreateIssueRequest {
            title: issue.title.render(),
            body: &issue.body,
        };

        let response = self
            .client
            .post(&url)
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .json(&request)
            .send()
            .await
            .context("Failed to send create issue request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("GitHub API error creating issue: {status} - {body}"));
        }

        #[derive(Deserialize)]
        struct Created {
            number: u64,
        }
        let created: Created = response
            .json()
            .await
            .context("Failed to parse create issue response")?;

        info!(number = created.number, title = %request.title, "Created alert issue");
        Ok(IssueOutcome::Created {
            number: created.number,
        })
    }
}
