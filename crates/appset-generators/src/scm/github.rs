//! GitHub SCM provider client

use async_trait::async_trait;
use reqwest::header::USER_AGENT;
use serde::Deserialize;

use appset_common::{Error, Result};

use super::{Repository, ScmProviderService};

const DEFAULT_API: &str = "https://api.github.com";
const PAGE_SIZE: usize = 100;

/// GitHub organization scanner
pub struct GithubScmProvider {
    client: reqwest::Client,
    api_base: String,
    organization: String,
    token: Option<String>,
    all_branches: bool,
    use_ssh: bool,
}

#[derive(Deserialize)]
struct GithubRepo {
    name: String,
    clone_url: String,
    ssh_url: String,
    default_branch: String,
    #[serde(default)]
    topics: Vec<String>,
}

#[derive(Deserialize)]
struct GithubBranch {
    name: String,
    commit: GithubCommit,
}

#[derive(Deserialize)]
struct GithubCommit {
    sha: String,
}

impl GithubScmProvider {
    /// Create a scanner for one organization.
    pub fn new(
        client: reqwest::Client,
        api_base: Option<&str>,
        organization: &str,
        token: Option<String>,
        all_branches: bool,
        use_ssh: bool,
    ) -> Self {
        Self {
            client,
            api_base: api_base
                .unwrap_or(DEFAULT_API)
                .trim_end_matches('/')
                .to_string(),
            organization: organization.to_string(),
            token,
            all_branches,
            use_ssh,
        }
    }

    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .get(url)
            .header(USER_AGENT, "appset-controller");
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self
            .request(url)
            .send()
            .await
            .map_err(|e| Error::remote("github", e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::remote(
                "github",
                format!("{url} returned {}", response.status()),
            ));
        }
        response
            .json()
            .await
            .map_err(|e| Error::remote("github", format!("decoding {url}: {e}")))
    }

    async fn list_org_repos(&self) -> Result<Vec<GithubRepo>> {
        let mut repos = Vec::new();
        let mut page = 1;
        loop {
            let url = format!(
                "{}/orgs/{}/repos?per_page={PAGE_SIZE}&page={page}",
                self.api_base, self.organization
            );
            let batch: Vec<GithubRepo> = self.get_json(&url).await?;
            let len = batch.len();
            repos.extend(batch);
            if len < PAGE_SIZE {
                return Ok(repos);
            }
            page += 1;
        }
    }

    async fn branches(&self, repo: &GithubRepo) -> Result<Vec<GithubBranch>> {
        if self.all_branches {
            let url = format!(
                "{}/repos/{}/{}/branches?per_page={PAGE_SIZE}",
                self.api_base, self.organization, repo.name
            );
            self.get_json(&url).await
        } else {
            let url = format!(
                "{}/repos/{}/{}/branches/{}",
                self.api_base, self.organization, repo.name, repo.default_branch
            );
            Ok(vec![self.get_json(&url).await?])
        }
    }
}

#[async_trait]
impl ScmProviderService for GithubScmProvider {
    async fn list_repos(&self) -> Result<Vec<Repository>> {
        let mut result = Vec::new();
        for repo in self.list_org_repos().await? {
            let url = if self.use_ssh {
                repo.ssh_url.clone()
            } else {
                repo.clone_url.clone()
            };
            for branch in self.branches(&repo).await? {
                result.push(Repository {
                    organization: self.organization.clone(),
                    repository: repo.name.clone(),
                    url: url.clone(),
                    branch: branch.name,
                    sha: branch.commit.sha,
                    labels: repo.topics.clone(),
                });
            }
        }
        Ok(result)
    }

    async fn repo_has_path(&self, repo: &Repository, path: &str) -> Result<bool> {
        let url = format!(
            "{}/repos/{}/{}/contents/{}?ref={}",
            self.api_base, repo.organization, repo.repository, path, repo.branch
        );
        let response = self
            .request(&url)
            .send()
            .await
            .map_err(|e| Error::remote("github", e.to_string()))?;
        match response.status().as_u16() {
            200 => Ok(true),
            404 => Ok(false),
            code => Err(Error::remote("github", format!("{url} returned {code}"))),
        }
    }
}
