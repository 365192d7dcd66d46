//! Production implementations of the collaborator traits
//!
//! The reconciler and the generators only know traits; everything that
//! actually talks to the control plane or to remote services lives here.
//! All control-plane writes go through optimistic concurrency: updates
//! re-read on conflict and retry a small, bounded number of times.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::{Client, ResourceExt};
use serde::Deserialize;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use appset_common::crd::{Application, ApplicationSet, ApplicationSetStatus, Selector};
use appset_common::{
    Error, Result, CLUSTER_SECRET_TYPE_CLUSTER, CLUSTER_SECRET_TYPE_LABEL, FIELD_MANAGER,
};
use appset_generators::cluster::SecretStore;
use appset_generators::cluster_decision::DecisionResourceStore;
use appset_generators::git::RepoService;
use appset_generators::plugin::{PluginConfig, PluginConfigStore};
use appset_generators::pull_request::{self, PullRequestFactory, PullRequestService};
use appset_generators::scm::{self, ScmProviderFactory, ScmProviderService};

/// How many times an update is retried after an optimistic-concurrency
/// conflict before giving up and requeueing
const CONFLICT_RETRIES: usize = 3;

/// Control-plane operations the reconciler performs on Applications and on
/// the ApplicationSet status.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AppsClient: Send + Sync {
    /// Applications in `namespace` owned by the ApplicationSet with `uid`.
    async fn list_owned(&self, namespace: &str, owner_uid: &str) -> Result<Vec<Application>>;

    /// Create a new application.
    async fn create(&self, app: &Application) -> Result<()>;

    /// Update an application's spec and managed metadata. Retries on
    /// conflict with a fresh read.
    async fn update(&self, app: &Application) -> Result<()>;

    /// Delete an application.
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;

    /// Remove this ApplicationSet's owner reference, orphaning the
    /// application instead of deleting it.
    async fn remove_owner_reference(&self, app: &Application, owner_uid: &str) -> Result<()>;

    /// Patch the ApplicationSet's status subresource.
    async fn update_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ApplicationSetStatus,
    ) -> Result<()>;
}

/// Real control-plane client
pub struct KubeAppsClient {
    client: Client,
}

impl KubeAppsClient {
    /// Wrap a kube client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn apps(&self, namespace: &str) -> Api<Application> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl AppsClient for KubeAppsClient {
    async fn list_owned(&self, namespace: &str, owner_uid: &str) -> Result<Vec<Application>> {
        let apps = self.apps(namespace).list(&ListParams::default()).await?;
        Ok(apps
            .items
            .into_iter()
            .filter(|app| {
                app.metadata
                    .owner_references
                    .as_ref()
                    .map(|refs| refs.iter().any(|r| r.uid == owner_uid))
                    .unwrap_or(false)
            })
            .collect())
    }

    async fn create(&self, app: &Application) -> Result<()> {
        let namespace = app.namespace().unwrap_or_default();
        self.apps(&namespace)
            .create(&PostParams::default(), app)
            .await?;
        Ok(())
    }

    async fn update(&self, app: &Application) -> Result<()> {
        let namespace = app.namespace().unwrap_or_default();
        let name = app.name_any();
        let api = self.apps(&namespace);

        let mut attempt = 0;
        loop {
            // Re-read so the write carries the current resource version;
            // the server rejects stale writes with a 409
            let mut live = api.get(&name).await?;
            live.metadata.labels = app.metadata.labels.clone();
            live.metadata.annotations = app.metadata.annotations.clone();
            live.metadata.finalizers = app.metadata.finalizers.clone();
            live.spec = app.spec.clone();

            match api.replace(&name, &PostParams::default(), &live).await {
                Ok(_) => return Ok(()),
                Err(kube::Error::Api(ae)) if ae.code == 409 => {
                    attempt += 1;
                    if attempt > CONFLICT_RETRIES {
                        return Err(Error::Conflict { name });
                    }
                    debug!(app = %name, attempt, "conflict updating application, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .apps(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            // Already gone: deletion is idempotent
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_owner_reference(&self, app: &Application, owner_uid: &str) -> Result<()> {
        let namespace = app.namespace().unwrap_or_default();
        let name = app.name_any();
        let api = self.apps(&namespace);

        let mut attempt = 0;
        loop {
            let mut live = api.get(&name).await?;
            let Some(refs) = live.metadata.owner_references.as_mut() else {
                return Ok(());
            };
            refs.retain(|r| r.uid != owner_uid);
            if refs.is_empty() {
                live.metadata.owner_references = None;
            }

            match api.replace(&name, &PostParams::default(), &live).await {
                Ok(_) => return Ok(()),
                Err(kube::Error::Api(ae)) if ae.code == 409 => {
                    attempt += 1;
                    if attempt > CONFLICT_RETRIES {
                        return Err(Error::Conflict { name });
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn update_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ApplicationSetStatus,
    ) -> Result<()> {
        let api: Api<ApplicationSet> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }
}

/// Cluster-secret catalog backed by the control plane
pub struct KubeSecretStore {
    client: Client,
    namespace: String,
}

impl KubeSecretStore {
    /// Read cluster secrets from `namespace`.
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
        }
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn list_cluster_secrets(&self) -> Result<Vec<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        let params = ListParams::default().labels(&format!(
            "{CLUSTER_SECRET_TYPE_LABEL}={CLUSTER_SECRET_TYPE_CLUSTER}"
        ));
        Ok(api.list(&params).await?.items)
    }
}

/// Plugin configuration resolved from a ConfigMap
pub struct KubePluginConfigStore {
    client: Client,
    namespace: String,
}

impl KubePluginConfigStore {
    /// Read plugin ConfigMaps from `namespace`.
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
        }
    }
}

#[async_trait]
impl PluginConfigStore for KubePluginConfigStore {
    async fn get(&self, name: &str) -> Result<PluginConfig> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        let config_map = api.get(name).await?;
        let data = config_map.data.unwrap_or_default();

        let base_url = data
            .get("baseUrl")
            .cloned()
            .ok_or_else(|| Error::configuration(format!("ConfigMap {name} has no baseUrl")))?;
        let token = data
            .get("token")
            .cloned()
            .ok_or_else(|| Error::configuration(format!("ConfigMap {name} has no token")))?;

        Ok(PluginConfig { base_url, token })
    }
}

/// Duck-typed decision resource lookup through the dynamic client
pub struct KubeDecisionResourceStore {
    client: Client,
    namespace: String,
}

impl KubeDecisionResourceStore {
    /// Read decision resources from `namespace`.
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
        }
    }
}

#[async_trait]
impl DecisionResourceStore for KubeDecisionResourceStore {
    async fn list_decisions<'a>(
        &self,
        config_map: &str,
        name: Option<&'a str>,
        selector: Option<&'a Selector>,
    ) -> Result<Vec<serde_json::Value>> {
        // The ConfigMap names the duck-typed GVK to query
        let config_maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        let duck_config = config_maps.get(config_map).await?;
        let data = duck_config.data.unwrap_or_default();

        let api_version = data.get("apiVersion").ok_or_else(|| {
            Error::configuration(format!("ConfigMap {config_map} has no apiVersion"))
        })?;
        let kind = data
            .get("kind")
            .ok_or_else(|| Error::configuration(format!("ConfigMap {config_map} has no kind")))?;

        let (group, version) = match api_version.split_once('/') {
            Some((group, version)) => (group.to_string(), version.to_string()),
            None => (String::new(), api_version.clone()),
        };
        let gvk = GroupVersionKind {
            group,
            version,
            kind: kind.clone(),
        };
        let resource = ApiResource::from_gvk(&gvk);
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), &self.namespace, &resource);

        let objects = match name {
            Some(name) => vec![api.get(name).await?],
            None => api.list(&ListParams::default()).await?.items,
        };

        let mut decisions = Vec::new();
        for object in objects {
            if let Some(selector) = selector {
                let labels: BTreeMap<String, String> =
                    object.metadata.labels.clone().unwrap_or_default();
                if !selector.matches(&labels) {
                    continue;
                }
            }
            match serde_json::to_value(&object) {
                Ok(value) => decisions.push(value),
                Err(e) => warn!(error = %e, "could not serialize decision resource, skipped"),
            }
        }
        Ok(decisions)
    }
}

/// Repository access over the repository service's REST API.
///
/// The repository service (clone cache, credentials, refs) is an external
/// collaborator; this client only speaks its read endpoints.
pub struct HttpRepoService {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct DirectoriesResponse {
    #[serde(default)]
    paths: Vec<String>,
}

#[derive(Deserialize)]
struct FilesResponse {
    /// File path to base64-encoded content
    #[serde(default)]
    files: BTreeMap<String, String>,
}

impl HttpRepoService {
    /// Create a client for the repository service at `base_url`.
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::remote("git", e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::remote(
                "git",
                format!("{url} returned {}", response.status()),
            ));
        }
        response
            .json()
            .await
            .map_err(|e| Error::remote("git", format!("decoding {url}: {e}")))
    }
}

#[async_trait]
impl RepoService for HttpRepoService {
    async fn get_directories(&self, repo_url: &str, revision: &str) -> Result<Vec<String>> {
        let url = format!(
            "{}/api/v1/git/directories?repo={}&revision={}",
            self.base_url,
            urlencode(repo_url),
            urlencode(revision)
        );
        let response: DirectoriesResponse = self.get_json(&url).await?;
        Ok(response.paths)
    }

    async fn get_files(
        &self,
        repo_url: &str,
        revision: &str,
        pattern: &str,
    ) -> Result<BTreeMap<String, Vec<u8>>> {
        let url = format!(
            "{}/api/v1/git/files?repo={}&revision={}&pattern={}",
            self.base_url,
            urlencode(repo_url),
            urlencode(revision),
            urlencode(pattern)
        );
        let response: FilesResponse = self.get_json(&url).await?;

        let mut files = BTreeMap::new();
        for (path, encoded) in response.files {
            let content = STANDARD
                .decode(&encoded)
                .map_err(|e| Error::remote("git", format!("decoding content of {path}: {e}")))?;
            files.insert(path, content);
        }
        Ok(files)
    }
}

/// Minimal percent-encoding for query parameters
fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

/// SCM provider factory building REST clients from generator specs.
///
/// Tokens come from the operator's environment, one variable per provider
/// family; provider authentication itself is out of scope here.
pub struct EnvScmProviderFactory {
    client: reqwest::Client,
}

impl EnvScmProviderFactory {
    /// Create a factory reusing the given HTTP connection pool.
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl ScmProviderFactory for EnvScmProviderFactory {
    fn create(
        &self,
        spec: &appset_common::crd::ScmProviderGenerator,
    ) -> Result<Arc<dyn ScmProviderService>> {
        let use_ssh = spec.clone_protocol.as_deref() == Some("ssh");

        if let Some(github) = &spec.github {
            return Ok(Arc::new(scm::github::GithubScmProvider::new(
                self.client.clone(),
                github.api.as_deref(),
                &github.organization,
                std::env::var("GITHUB_TOKEN").ok(),
                github.all_branches,
                use_ssh,
            )));
        }
        if let Some(gitlab) = &spec.gitlab {
            return Ok(Arc::new(scm::gitlab::GitlabScmProvider::new(
                self.client.clone(),
                gitlab.api.as_deref(),
                &gitlab.group,
                std::env::var("GITLAB_TOKEN").ok(),
                gitlab.include_subgroups,
                gitlab.all_branches,
                use_ssh,
            )));
        }
        if let Some(gitea) = &spec.gitea {
            return Ok(Arc::new(scm::gitea::GiteaScmProvider::new(
                self.client.clone(),
                &gitea.api,
                &gitea.owner,
                std::env::var("GITEA_TOKEN").ok(),
                gitea.all_branches,
                use_ssh,
            )));
        }
        if let Some(bitbucket) = &spec.bitbucket_server {
            return Ok(Arc::new(
                scm::bitbucket_server::BitbucketServerScmProvider::new(
                    self.client.clone(),
                    &bitbucket.api,
                    &bitbucket.project,
                    std::env::var("BITBUCKET_TOKEN").ok(),
                    bitbucket.all_branches,
                    use_ssh,
                ),
            ));
        }

        Err(Error::configuration(
            "scmProvider generator has no provider configured",
        ))
    }
}

/// Pull request factory building REST clients from generator specs.
pub struct EnvPullRequestFactory {
    client: reqwest::Client,
}

impl EnvPullRequestFactory {
    /// Create a factory reusing the given HTTP connection pool.
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl PullRequestFactory for EnvPullRequestFactory {
    fn create(
        &self,
        spec: &appset_common::crd::PullRequestGenerator,
    ) -> Result<Arc<dyn PullRequestService>> {
        if let Some(github) = &spec.github {
            return Ok(Arc::new(pull_request::providers::GithubPullRequests::new(
                self.client.clone(),
                github.api.as_deref(),
                &github.owner,
                &github.repo,
                std::env::var("GITHUB_TOKEN").ok(),
                github.labels.clone(),
            )));
        }
        if let Some(gitlab) = &spec.gitlab {
            return Ok(Arc::new(pull_request::providers::GitlabPullRequests::new(
                self.client.clone(),
                gitlab.api.as_deref(),
                &gitlab.project,
                std::env::var("GITLAB_TOKEN").ok(),
                gitlab.labels.clone(),
            )));
        }
        if let Some(gitea) = &spec.gitea {
            return Ok(Arc::new(pull_request::providers::GiteaPullRequests::new(
                self.client.clone(),
                &gitea.api,
                &gitea.owner,
                &gitea.repo,
                std::env::var("GITEA_TOKEN").ok(),
            )));
        }
        if let Some(bitbucket) = &spec.bitbucket_server {
            return Ok(Arc::new(
                pull_request::providers::BitbucketServerPullRequests::new(
                    self.client.clone(),
                    &bitbucket.api,
                    &bitbucket.project,
                    &bitbucket.repo,
                    std::env::var("BITBUCKET_TOKEN").ok(),
                ),
            ));
        }

        Err(Error::configuration(
            "pullRequest generator has no provider configured",
        ))
    }
}
