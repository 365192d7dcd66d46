//! Pull request provider clients
//!
//! One thin REST client per provider family, all implementing
//! [`PullRequestService`](super::PullRequestService). Only the fields the
//! generator emits are deserialised.

use async_trait::async_trait;
use reqwest::header::USER_AGENT;
use serde::Deserialize;

use appset_common::utils::normalize_bitbucket_base_path;
use appset_common::{Error, Result};

use super::{PullRequest, PullRequestService};

const GITHUB_DEFAULT_API: &str = "https://api.github.com";
const GITLAB_DEFAULT_API: &str = "https://gitlab.com";

// ---------------------------------------------------------------------------
// GitHub
// ---------------------------------------------------------------------------

/// GitHub pull request source
pub struct GithubPullRequests {
    client: reqwest::Client,
    api_base: String,
    owner: String,
    repo: String,
    token: Option<String>,
    required_labels: Vec<String>,
}

#[derive(Deserialize)]
struct GithubPull {
    number: u64,
    title: String,
    head: GithubHead,
    base: GithubBase,
    user: GithubUser,
    #[serde(default)]
    labels: Vec<GithubLabel>,
}

#[derive(Deserialize)]
struct GithubHead {
    #[serde(rename = "ref")]
    ref_: String,
    sha: String,
}

#[derive(Deserialize)]
struct GithubBase {
    #[serde(rename = "ref")]
    ref_: String,
}

#[derive(Deserialize)]
struct GithubUser {
    login: String,
}

#[derive(Deserialize)]
struct GithubLabel {
    name: String,
}

impl GithubPullRequests {
    /// Create a source for one repository.
    pub fn new(
        client: reqwest::Client,
        api_base: Option<&str>,
        owner: &str,
        repo: &str,
        token: Option<String>,
        required_labels: Vec<String>,
    ) -> Self {
        Self {
            client,
            api_base: api_base
                .unwrap_or(GITHUB_DEFAULT_API)
                .trim_end_matches('/')
                .to_string(),
            owner: owner.to_string(),
            repo: repo.to_string(),
            token,
            required_labels,
        }
    }
}

#[async_trait]
impl PullRequestService for GithubPullRequests {
    async fn list(&self) -> Result<Vec<PullRequest>> {
        let url = format!(
            "{}/repos/{}/{}/pulls?state=open&per_page=100",
            self.api_base, self.owner, self.repo
        );
        let mut builder = self.client.get(&url).header(USER_AGENT, "appset-controller");
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| Error::remote("github", e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::remote(
                "github",
                format!("{url} returned {}", response.status()),
            ));
        }
        let pulls: Vec<GithubPull> = response
            .json()
            .await
            .map_err(|e| Error::remote("github", format!("decoding {url}: {e}")))?;

        Ok(pulls
            .into_iter()
            .filter(|pull| {
                self.required_labels.iter().all(|wanted| {
                    pull.labels.iter().any(|label| &label.name == wanted)
                })
            })
            .map(|pull| PullRequest {
                number: pull.number,
                title: pull.title,
                branch: pull.head.ref_,
                target_branch: pull.base.ref_,
                head_sha: pull.head.sha,
                author: pull.user.login,
                labels: pull.labels.into_iter().map(|l| l.name).collect(),
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// GitLab
// ---------------------------------------------------------------------------

/// GitLab merge request source
pub struct GitlabPullRequests {
    client: reqwest::Client,
    api_base: String,
    project: String,
    token: Option<String>,
    required_labels: Vec<String>,
}

#[derive(Deserialize)]
struct GitlabMergeRequest {
    iid: u64,
    title: String,
    source_branch: String,
    target_branch: String,
    sha: String,
    author: GitlabAuthor,
    #[serde(default)]
    labels: Vec<String>,
}

#[derive(Deserialize)]
struct GitlabAuthor {
    username: String,
}

impl GitlabPullRequests {
    /// Create a source for one project.
    pub fn new(
        client: reqwest::Client,
        api_base: Option<&str>,
        project: &str,
        token: Option<String>,
        required_labels: Vec<String>,
    ) -> Self {
        Self {
            client,
            api_base: api_base
                .unwrap_or(GITLAB_DEFAULT_API)
                .trim_end_matches('/')
                .to_string(),
            project: project.replace('/', "%2F"),
            token,
            required_labels,
        }
    }
}

#[async_trait]
impl PullRequestService for GitlabPullRequests {
    async fn list(&self) -> Result<Vec<PullRequest>> {
        let url = format!(
            "{}/api/v4/projects/{}/merge_requests?state=opened&per_page=100",
            self.api_base, self.project
        );
        let mut builder = self.client.get(&url);
        if let Some(token) = &self.token {
            builder = builder.header("PRIVATE-TOKEN", token);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| Error::remote("gitlab", e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::remote(
                "gitlab",
                format!("{url} returned {}", response.status()),
            ));
        }
        let merge_requests: Vec<GitlabMergeRequest> = response
            .json()
            .await
            .map_err(|e| Error::remote("gitlab", format!("decoding {url}: {e}")))?;

        Ok(merge_requests
            .into_iter()
            .filter(|mr| {
                self.required_labels
                    .iter()
                    .all(|wanted| mr.labels.contains(wanted))
            })
            .map(|mr| PullRequest {
                number: mr.iid,
                title: mr.title,
                branch: mr.source_branch,
                target_branch: mr.target_branch,
                head_sha: mr.sha,
                author: mr.author.username,
                labels: mr.labels,
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Gitea
// ---------------------------------------------------------------------------

/// Gitea pull request source
pub struct GiteaPullRequests {
    client: reqwest::Client,
    api_base: String,
    owner: String,
    repo: String,
    token: Option<String>,
}

#[derive(Deserialize)]
struct GiteaPull {
    number: u64,
    title: String,
    head: GiteaRef,
    base: GiteaRef,
    user: GiteaUser,
    #[serde(default)]
    labels: Vec<GiteaLabel>,
}

#[derive(Deserialize)]
struct GiteaRef {
    #[serde(rename = "ref")]
    ref_: String,
    #[serde(default)]
    sha: String,
}

#[derive(Deserialize)]
struct GiteaUser {
    login: String,
}

#[derive(Deserialize)]
struct GiteaLabel {
    name: String,
}

impl GiteaPullRequests {
    /// Create a source for one repository.
    pub fn new(
        client: reqwest::Client,
        api_base: &str,
        owner: &str,
        repo: &str,
        token: Option<String>,
    ) -> Self {
        Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            owner: owner.to_string(),
            repo: repo.to_string(),
            token,
        }
    }
}

#[async_trait]
impl PullRequestService for GiteaPullRequests {
    async fn list(&self) -> Result<Vec<PullRequest>> {
        let url = format!(
            "{}/api/v1/repos/{}/{}/pulls?state=open",
            self.api_base, self.owner, self.repo
        );
        let mut builder = self.client.get(&url);
        if let Some(token) = &self.token {
            builder = builder.header("Authorization", format!("token {token}"));
        }
        let response = builder
            .send()
            .await
            .map_err(|e| Error::remote("gitea", e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::remote(
                "gitea",
                format!("{url} returned {}", response.status()),
            ));
        }
        let pulls: Vec<GiteaPull> = response
            .json()
            .await
            .map_err(|e| Error::remote("gitea", format!("decoding {url}: {e}")))?;

        Ok(pulls
            .into_iter()
            .map(|pull| PullRequest {
                number: pull.number,
                title: pull.title,
                branch: pull.head.ref_,
                target_branch: pull.base.ref_,
                head_sha: pull.head.sha,
                author: pull.user.login,
                labels: pull.labels.into_iter().map(|l| l.name).collect(),
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Bitbucket Server
// ---------------------------------------------------------------------------

/// Bitbucket Server pull request source
pub struct BitbucketServerPullRequests {
    client: reqwest::Client,
    api_base: String,
    project: String,
    repo: String,
    token: Option<String>,
}

#[derive(Deserialize)]
struct BitbucketPage {
    values: Vec<BitbucketPull>,
}

#[derive(Deserialize)]
struct BitbucketPull {
    id: u64,
    title: String,
    #[serde(rename = "fromRef")]
    from_ref: BitbucketRef,
    #[serde(rename = "toRef")]
    to_ref: BitbucketRef,
    author: BitbucketAuthor,
}

#[derive(Deserialize)]
struct BitbucketRef {
    #[serde(rename = "displayId")]
    display_id: String,
    #[serde(rename = "latestCommit", default)]
    latest_commit: String,
}

#[derive(Deserialize)]
struct BitbucketAuthor {
    user: BitbucketUser,
}

#[derive(Deserialize)]
struct BitbucketUser {
    name: String,
}

impl BitbucketServerPullRequests {
    /// Create a source for one repository.
    pub fn new(
        client: reqwest::Client,
        api_base: &str,
        project: &str,
        repo: &str,
        token: Option<String>,
    ) -> Self {
        Self {
            client,
            api_base: normalize_bitbucket_base_path(api_base),
            project: project.to_string(),
            repo: repo.to_string(),
            token,
        }
    }
}

#[async_trait]
impl PullRequestService for BitbucketServerPullRequests {
    async fn list(&self) -> Result<Vec<PullRequest>> {
        let url = format!(
            "{}/api/1.0/projects/{}/repos/{}/pull-requests?state=OPEN&limit=100",
            self.api_base, self.project, self.repo
        );
        let mut builder = self.client.get(&url);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| Error::remote("bitbucket", e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::remote(
                "bitbucket",
                format!("{url} returned {}", response.status()),
            ));
        }
        let page: BitbucketPage = response
            .json()
            .await
            .map_err(|e| Error::remote("bitbucket", format!("decoding {url}: {e}")))?;

        Ok(page
            .values
            .into_iter()
            .map(|pull| PullRequest {
                number: pull.id,
                title: pull.title,
                branch: pull.from_ref.display_id,
                target_branch: pull.to_ref.display_id,
                head_sha: pull.from_ref.latest_commit,
                author: pull.author.user.name,
                labels: Vec::new(),
            })
            .collect())
    }
}
