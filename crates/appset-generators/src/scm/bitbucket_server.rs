//! Bitbucket Server SCM provider client
//!
//! Bitbucket Server's REST root lives under `/rest`; the configured base
//! path is normalised so both `https://host` and `https://host/rest/` work.

use async_trait::async_trait;
use serde::Deserialize;

use appset_common::utils::normalize_bitbucket_base_path;
use appset_common::{Error, Result};

use super::{Repository, ScmProviderService};

const PAGE_SIZE: usize = 100;

/// Bitbucket Server project scanner
pub struct BitbucketServerScmProvider {
    client: reqwest::Client,
    api_base: String,
    project: String,
    token: Option<String>,
    all_branches: bool,
    use_ssh: bool,
}

#[derive(Deserialize)]
struct PagedResponse<T> {
    values: Vec<T>,
    #[serde(rename = "isLastPage", default)]
    is_last_page: bool,
    #[serde(rename = "nextPageStart", default)]
    next_page_start: Option<usize>,
}

#[derive(Deserialize)]
struct BitbucketRepo {
    slug: String,
    links: BitbucketLinks,
}

#[derive(Deserialize)]
struct BitbucketLinks {
    clone: Vec<BitbucketCloneLink>,
}

#[derive(Deserialize)]
struct BitbucketCloneLink {
    name: String,
    href: String,
}

#[derive(Deserialize)]
struct BitbucketBranch {
    #[serde(rename = "displayId")]
    display_id: String,
    #[serde(rename = "latestCommit", default)]
    latest_commit: String,
    #[serde(rename = "isDefault", default)]
    is_default: bool,
}

impl BitbucketServerScmProvider {
    /// Create a scanner for one project key.
    pub fn new(
        client: reqwest::Client,
        api_base: &str,
        project: &str,
        token: Option<String>,
        all_branches: bool,
        use_ssh: bool,
    ) -> Self {
        Self {
            client,
            api_base: normalize_bitbucket_base_path(api_base),
            project: project.to_string(),
            token,
            all_branches,
            use_ssh,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let mut builder = self.client.get(url);
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
        response
            .json()
            .await
            .map_err(|e| Error::remote("bitbucket", format!("decoding {url}: {e}")))
    }

    async fn paged<T: serde::de::DeserializeOwned>(&self, base_url: &str) -> Result<Vec<T>> {
        let mut values = Vec::new();
        let mut start = 0usize;
        loop {
            let url = format!("{base_url}?limit={PAGE_SIZE}&start={start}");
            let page: PagedResponse<T> = self.get_json(&url).await?;
            values.extend(page.values);
            if page.is_last_page {
                return Ok(values);
            }
            match page.next_page_start {
                Some(next) => start = next,
                None => return Ok(values),
            }
        }
    }

    fn clone_url(&self, repo: &BitbucketRepo) -> Option<String> {
        let wanted = if self.use_ssh { "ssh" } else { "http" };
        repo.links
            .clone
            .iter()
            .find(|link| link.name == wanted)
            .map(|link| link.href.clone())
    }
}

#[async_trait]
impl ScmProviderService for BitbucketServerScmProvider {
    async fn list_repos(&self) -> Result<Vec<Repository>> {
        let repos: Vec<BitbucketRepo> = self
            .paged(&format!(
                "{}/api/1.0/projects/{}/repos",
                self.api_base, self.project
            ))
            .await?;

        let mut result = Vec::new();
        for repo in &repos {
            let Some(url) = self.clone_url(repo) else {
                continue;
            };
            let branches: Vec<BitbucketBranch> = self
                .paged(&format!(
                    "{}/api/1.0/projects/{}/repos/{}/branches",
                    self.api_base, self.project, repo.slug
                ))
                .await?;
            for branch in branches {
                if !self.all_branches && !branch.is_default {
                    continue;
                }
                result.push(Repository {
                    organization: self.project.clone(),
                    repository: repo.slug.clone(),
                    url: url.clone(),
                    branch: branch.display_id,
                    sha: branch.latest_commit,
                    labels: Vec::new(),
                });
            }
        }
        Ok(result)
    }

    async fn repo_has_path(&self, repo: &Repository, path: &str) -> Result<bool> {
        let url = format!(
            "{}/api/1.0/projects/{}/repos/{}/browse/{}?at={}&limit=1",
            self.api_base, repo.organization, repo.repository, path, repo.branch
        );
        let mut builder = self.client.get(&url);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| Error::remote("bitbucket", e.to_string()))?;
        match response.status().as_u16() {
            200 => Ok(true),
            404 => Ok(false),
            code => Err(Error::remote("bitbucket", format!("{url} returned {code}"))),
        }
    }
}
