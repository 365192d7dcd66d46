//! GitLab SCM provider client

use async_trait::async_trait;
use serde::Deserialize;

use appset_common::{Error, Result};

use super::{Repository, ScmProviderService};

const DEFAULT_API: &str = "https://gitlab.com";
const PAGE_SIZE: usize = 100;

/// GitLab group scanner
pub struct GitlabScmProvider {
    client: reqwest::Client,
    api_base: String,
    group: String,
    token: Option<String>,
    include_subgroups: bool,
    all_branches: bool,
    use_ssh: bool,
}

#[derive(Deserialize)]
struct GitlabProject {
    id: u64,
    path: String,
    http_url_to_repo: String,
    ssh_url_to_repo: String,
    #[serde(default)]
    default_branch: Option<String>,
    #[serde(default)]
    topics: Vec<String>,
}

#[derive(Deserialize)]
struct GitlabBranch {
    name: String,
    commit: GitlabCommit,
}

#[derive(Deserialize)]
struct GitlabCommit {
    id: String,
}

impl GitlabScmProvider {
    /// Create a scanner for one group.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: reqwest::Client,
        api_base: Option<&str>,
        group: &str,
        token: Option<String>,
        include_subgroups: bool,
        all_branches: bool,
        use_ssh: bool,
    ) -> Self {
        Self {
            client,
            api_base: api_base
                .unwrap_or(DEFAULT_API)
                .trim_end_matches('/')
                .to_string(),
            group: group.to_string(),
            token,
            include_subgroups,
            all_branches,
            use_ssh,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let mut builder = self.client.get(url);
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
        response
            .json()
            .await
            .map_err(|e| Error::remote("gitlab", format!("decoding {url}: {e}")))
    }

    async fn list_projects(&self) -> Result<Vec<GitlabProject>> {
        let mut projects = Vec::new();
        let mut page = 1;
        loop {
            let url = format!(
                "{}/api/v4/groups/{}/projects?include_subgroups={}&per_page={PAGE_SIZE}&page={page}",
                self.api_base, self.group, self.include_subgroups
            );
            let batch: Vec<GitlabProject> = self.get_json(&url).await?;
            let len = batch.len();
            projects.extend(batch);
            if len < PAGE_SIZE {
                return Ok(projects);
            }
            page += 1;
        }
    }

    async fn branches(&self, project: &GitlabProject) -> Result<Vec<GitlabBranch>> {
        if self.all_branches {
            let url = format!(
                "{}/api/v4/projects/{}/repository/branches?per_page={PAGE_SIZE}",
                self.api_base, project.id
            );
            self.get_json(&url).await
        } else {
            let Some(default_branch) = &project.default_branch else {
                return Ok(Vec::new());
            };
            let url = format!(
                "{}/api/v4/projects/{}/repository/branches/{}",
                self.api_base, project.id, default_branch
            );
            Ok(vec![self.get_json(&url).await?])
        }
    }
}

#[async_trait]
impl ScmProviderService for GitlabScmProvider {
    async fn list_repos(&self) -> Result<Vec<Repository>> {
        let mut result = Vec::new();
        for project in self.list_projects().await? {
            let url = if self.use_ssh {
                project.ssh_url_to_repo.clone()
            } else {
                project.http_url_to_repo.clone()
            };
            for branch in self.branches(&project).await? {
                result.push(Repository {
                    organization: self.group.clone(),
                    repository: project.path.clone(),
                    url: url.clone(),
                    branch: branch.name,
                    sha: branch.commit.id,
                    labels: project.topics.clone(),
                });
            }
        }
        Ok(result)
    }

    async fn repo_has_path(&self, repo: &Repository, path: &str) -> Result<bool> {
        let project_path = format!("{}/{}", repo.organization, repo.repository);
        let encoded: String = project_path.replace('/', "%2F");
        let url = format!(
            "{}/api/v4/projects/{}/repository/files/{}?ref={}",
            self.api_base,
            encoded,
            path.replace('/', "%2F"),
            repo.branch
        );
        let mut builder = self.client.head(&url);
        if let Some(token) = &self.token {
            builder = builder.header("PRIVATE-TOKEN", token);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| Error::remote("gitlab", e.to_string()))?;
        match response.status().as_u16() {
            200 => Ok(true),
            404 => Ok(false),
            code => Err(Error::remote("gitlab", format!("{url} returned {code}"))),
        }
    }
}
