//! SCMProvider generator: parameters from repository discovery
//!
//! Queries a configured SCM provider (GitHub, GitLab, Gitea, Bitbucket
//! Server) for repositories matching filter criteria and emits one
//! parameter map per repository/branch. Provider REST details live in the
//! per-provider submodules behind the [`ScmProviderService`] trait; this
//! module owns filter evaluation and parameter shaping.

pub mod bitbucket_server;
pub mod gitea;
pub mod github;
pub mod gitlab;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::json;

#[cfg(test)]
use mockall::automock;

use appset_common::crd::{
    ApplicationSet, ApplicationSetTemplate, GeneratorSpec, ParamMap, ScmFilter,
    ScmProviderGenerator,
};
use appset_common::utils::short_sha;
use appset_common::{Error, Result};

use crate::Generator;

/// Default recheck cadence for SCM discovery
pub const DEFAULT_REQUEUE: Duration = Duration::from_secs(30 * 60);

/// One discovered repository at one branch.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Repository {
    /// Organization / group / project key owning the repository
    pub organization: String,
    /// Repository name
    pub repository: String,
    /// Clone URL in the requested protocol
    pub url: String,
    /// Branch this entry refers to
    pub branch: String,
    /// Commit SHA at the branch head
    pub sha: String,
    /// Repository labels (topics)
    pub labels: Vec<String>,
}

/// A configured SCM provider connection.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ScmProviderService: Send + Sync {
    /// All repositories visible to the configuration, one entry per
    /// scanned branch.
    async fn list_repos(&self) -> Result<Vec<Repository>>;

    /// Whether `path` exists in the repository at the entry's branch.
    async fn repo_has_path(&self, repo: &Repository, path: &str) -> Result<bool>;
}

/// Builds a provider connection from a generator spec.
///
/// The factory indirection keeps credentials and HTTP plumbing out of the
/// generator and lets tests substitute a canned provider.
#[cfg_attr(test, automock)]
pub trait ScmProviderFactory: Send + Sync {
    /// Create the provider described by the spec.
    fn create(&self, spec: &ScmProviderGenerator) -> Result<Arc<dyn ScmProviderService>>;
}

/// SCM repository discovery generator
pub struct ScmProviderGeneratorImpl {
    factory: Arc<dyn ScmProviderFactory>,
}

impl ScmProviderGeneratorImpl {
    /// Create a generator backed by the given provider factory.
    pub fn new(factory: Arc<dyn ScmProviderFactory>) -> Self {
        Self { factory }
    }
}

#[async_trait]
impl Generator for ScmProviderGeneratorImpl {
    async fn generate_params(
        &self,
        spec: &GeneratorSpec,
        _app_set: &ApplicationSet,
    ) -> Result<Vec<ParamMap>> {
        let config = spec.scm_provider.as_ref().ok_or(Error::EmptyGenerator)?;
        let provider = self.factory.create(config)?;
        let filters = compile_filters(&config.filters)?;

        let repos = provider.list_repos().await?;
        let mut params = Vec::new();
        for repo in &repos {
            if matches_filters(&filters, repo, provider.as_ref()).await? {
                params.push(repo_params(repo));
            }
        }
        Ok(params)
    }

    fn get_template(&self, spec: &GeneratorSpec) -> Option<ApplicationSetTemplate> {
        spec.scm_provider.as_ref().map(|c| c.template.clone())
    }

    fn get_requeue_after(&self, spec: &GeneratorSpec) -> Duration {
        spec.scm_provider
            .as_ref()
            .and_then(|c| c.requeue_after_seconds)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_REQUEUE)
    }
}

/// A filter with its regexes compiled once per generate call.
pub(crate) struct CompiledFilter {
    repository: Option<Regex>,
    label: Option<Regex>,
    branch: Option<Regex>,
    paths_exist: Vec<String>,
}

pub(crate) fn compile_filters(filters: &[ScmFilter]) -> Result<Vec<CompiledFilter>> {
    filters
        .iter()
        .map(|f| {
            Ok(CompiledFilter {
                repository: compile_regex(f.repository_match.as_deref())?,
                label: compile_regex(f.label_match.as_deref())?,
                branch: compile_regex(f.branch_match.as_deref())?,
                paths_exist: f.paths_exist.clone(),
            })
        })
        .collect()
}

fn compile_regex(pattern: Option<&str>) -> Result<Option<Regex>> {
    pattern
        .map(|p| Regex::new(p).map_err(|e| Error::configuration(format!("invalid filter regex {p:?}: {e}"))))
        .transpose()
}

/// A repository passes when it satisfies every criterion of at least one
/// filter; an empty filter list passes everything.
async fn matches_filters(
    filters: &[CompiledFilter],
    repo: &Repository,
    provider: &dyn ScmProviderService,
) -> Result<bool> {
    if filters.is_empty() {
        return Ok(true);
    }

    'filters: for filter in filters {
        if let Some(re) = &filter.repository {
            if !re.is_match(&repo.repository) {
                continue;
            }
        }
        if let Some(re) = &filter.branch {
            if !re.is_match(&repo.branch) {
                continue;
            }
        }
        if let Some(re) = &filter.label {
            if !repo.labels.iter().any(|l| re.is_match(l)) {
                continue;
            }
        }
        for path in &filter.paths_exist {
            if !provider.repo_has_path(repo, path).await? {
                continue 'filters;
            }
        }
        return Ok(true);
    }
    Ok(false)
}

fn repo_params(repo: &Repository) -> ParamMap {
    let mut params = ParamMap::new();
    params.insert("organization".to_string(), json!(repo.organization));
    params.insert("repository".to_string(), json!(repo.repository));
    params.insert("url".to_string(), json!(repo.url));
    params.insert("branch".to_string(), json!(repo.branch));
    params.insert("sha".to_string(), json!(repo.sha));
    params.insert("short_sha".to_string(), json!(short_sha(&repo.sha)));
    params.insert("labels".to_string(), json!(repo.labels));
    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use appset_common::crd::ScmProviderGithub;

    fn repo(name: &str, branch: &str, labels: Vec<&str>) -> Repository {
        Repository {
            organization: "example".to_string(),
            repository: name.to_string(),
            url: format!("https://github.com/example/{name}.git"),
            branch: branch.to_string(),
            sha: "0123456789abcdef0123456789abcdef01234567".to_string(),
            labels: labels.into_iter().map(String::from).collect(),
        }
    }

    fn generator_with(repos: Vec<Repository>, has_path: bool) -> ScmProviderGeneratorImpl {
        let mut factory = MockScmProviderFactory::new();
        factory.expect_create().returning(move |_| {
            let repos = repos.clone();
            let mut service = MockScmProviderService::new();
            service
                .expect_list_repos()
                .returning(move || Ok(repos.clone()));
            service
                .expect_repo_has_path()
                .returning(move |_, _| Ok(has_path));
            Ok(Arc::new(service))
        });
        ScmProviderGeneratorImpl::new(Arc::new(factory))
    }

    fn spec(filters: Vec<ScmFilter>) -> GeneratorSpec {
        GeneratorSpec {
            scm_provider: Some(ScmProviderGenerator {
                github: Some(ScmProviderGithub {
                    organization: "example".to_string(),
                    ..Default::default()
                }),
                filters,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn app_set() -> ApplicationSet {
        ApplicationSet::new("test", Default::default())
    }

    #[tokio::test]
    async fn repositories_become_parameter_maps() {
        let generator = generator_with(vec![repo("web", "main", vec![])], true);
        let params = generator
            .generate_params(&spec(vec![]), &app_set())
            .await
            .unwrap();

        assert_eq!(params.len(), 1);
        assert_eq!(params[0]["organization"], "example");
        assert_eq!(params[0]["repository"], "web");
        assert_eq!(params[0]["branch"], "main");
        assert_eq!(params[0]["short_sha"], "01234567");
    }

    #[tokio::test]
    async fn repository_match_filters_by_name() {
        let generator = generator_with(
            vec![repo("web", "main", vec![]), repo("infra", "main", vec![])],
            true,
        );
        let filters = vec![ScmFilter {
            repository_match: Some("^web$".to_string()),
            ..Default::default()
        }];
        let params = generator
            .generate_params(&spec(filters), &app_set())
            .await
            .unwrap();
        assert_eq!(params.len(), 1);
        assert_eq!(params[0]["repository"], "web");
    }

    #[tokio::test]
    async fn label_match_requires_one_matching_label() {
        let generator = generator_with(
            vec![
                repo("web", "main", vec!["deploy"]),
                repo("docs", "main", vec!["internal"]),
            ],
            true,
        );
        let filters = vec![ScmFilter {
            label_match: Some("^deploy$".to_string()),
            ..Default::default()
        }];
        let params = generator
            .generate_params(&spec(filters), &app_set())
            .await
            .unwrap();
        assert_eq!(params.len(), 1);
        assert_eq!(params[0]["repository"], "web");
    }

    #[tokio::test]
    async fn filters_are_or_combined() {
        let generator = generator_with(
            vec![repo("web", "main", vec![]), repo("infra", "main", vec![])],
            true,
        );
        let filters = vec![
            ScmFilter {
                repository_match: Some("^web$".to_string()),
                ..Default::default()
            },
            ScmFilter {
                repository_match: Some("^infra$".to_string()),
                ..Default::default()
            },
        ];
        let params = generator
            .generate_params(&spec(filters), &app_set())
            .await
            .unwrap();
        assert_eq!(params.len(), 2);
    }

    #[tokio::test]
    async fn paths_exist_consults_the_provider() {
        let generator = generator_with(vec![repo("web", "main", vec![])], false);
        let filters = vec![ScmFilter {
            paths_exist: vec!["kustomization.yaml".to_string()],
            ..Default::default()
        }];
        let params = generator
            .generate_params(&spec(filters), &app_set())
            .await
            .unwrap();
        assert!(params.is_empty());
    }

    #[tokio::test]
    async fn invalid_filter_regex_is_a_configuration_error() {
        let generator = generator_with(vec![], true);
        let filters = vec![ScmFilter {
            repository_match: Some("([".to_string()),
            ..Default::default()
        }];
        let err = generator
            .generate_params(&spec(filters), &app_set())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[test]
    fn requeue_defaults_to_thirty_minutes() {
        let generator = generator_with(vec![], true);
        assert_eq!(generator.get_requeue_after(&spec(vec![])), DEFAULT_REQUEUE);
    }
}
