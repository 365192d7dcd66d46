//! Gitea SCM provider client

use async_trait::async_trait;
use serde::Deserialize;

use appset_common::{Error, Result};

use super::{Repository, ScmProviderService};

const PAGE_SIZE: usize = 50;

/// Gitea owner scanner
pub struct GiteaScmProvider {
    client: reqwest::Client,
    api_base: String,
    owner: String,
    token: Option<String>,
    all_branches: bool,
    use_ssh: bool,
}

#[derive(Deserialize)]
struct GiteaRepo {
    name: String,
    clone_url: String,
    ssh_url: String,
    default_branch: String,
}

#[derive(Deserialize)]
struct GiteaBranch {
    name: String,
    commit: GiteaCommit,
}

#[derive(Deserialize)]
struct GiteaCommit {
    id: String,
}

impl GiteaScmProvider {
    /// Create a scanner for one owner.
    pub fn new(
        client: reqwest::Client,
        api_base: &str,
        owner: &str,
        token: Option<String>,
        all_branches: bool,
        use_ssh: bool,
    ) -> Self {
        Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            owner: owner.to_string(),
            token,
            all_branches,
            use_ssh,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let mut builder = self.client.get(url);
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
        response
            .json()
            .await
            .map_err(|e| Error::remote("gitea", format!("decoding {url}: {e}")))
    }

    async fn list_owner_repos(&self) -> Result<Vec<GiteaRepo>> {
        let mut repos = Vec::new();
        let mut page = 1;
        loop {
            let url = format!(
                "{}/api/v1/orgs/{}/repos?limit={PAGE_SIZE}&page={page}",
                self.api_base, self.owner
            );
            let batch: Vec<GiteaRepo> = self.get_json(&url).await?;
            let len = batch.len();
            repos.extend(batch);
            if len < PAGE_SIZE {
                return Ok(repos);
            }
            page += 1;
        }
    }

    async fn branches(&self, repo: &GiteaRepo) -> Result<Vec<GiteaBranch>> {
        if self.all_branches {
            let url = format!(
                "{}/api/v1/repos/{}/{}/branches",
                self.api_base, self.owner, repo.name
            );
            self.get_json(&url).await
        } else {
            let url = format!(
                "{}/api/v1/repos/{}/{}/branches/{}",
                self.api_base, self.owner, repo.name, repo.default_branch
            );
            Ok(vec![self.get_json(&url).await?])
        }
    }
}

#[async_trait]
impl ScmProviderService for GiteaScmProvider {
    async fn list_repos(&self) -> Result<Vec<Repository>> {
        let mut result = Vec::new();
        for repo in self.list_owner_repos().await? {
            let url = if self.use_ssh {
                repo.ssh_url.clone()
            } else {
                repo.clone_url.clone()
            };
            for branch in self.branches(&repo).await? {
                result.push(Repository {
                    organization: self.owner.clone(),
                    repository: repo.name.clone(),
                    url: url.clone(),
                    branch: branch.name,
                    sha: branch.commit.id,
                    labels: Vec::new(),
                });
            }
        }
        Ok(result)
    }

    async fn repo_has_path(&self, repo: &Repository, path: &str) -> Result<bool> {
        let url = format!(
            "{}/api/v1/repos/{}/{}/contents/{}?ref={}",
            self.api_base, repo.organization, repo.repository, path, repo.branch
        );
        let mut builder = self.client.get(&url);
        if let Some(token) = &self.token {
            builder = builder.header("Authorization", format!("token {token}"));
        }
        let response = builder
            .send()
            .await
            .map_err(|e| Error::remote("gitea", e.to_string()))?;
        match response.status().as_u16() {
            200 => Ok(true),
            404 => Ok(false),
            code => Err(Error::remote("gitea", format!("{url} returned {code}"))),
        }
    }
}
