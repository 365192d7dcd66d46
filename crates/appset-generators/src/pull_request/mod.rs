//! PullRequest generator: parameters from open pull requests
//!
//! Queries a configured provider for open pull requests matching filter
//! criteria and emits one parameter map per PR. Provider REST details live
//! in [`providers`] behind the [`PullRequestService`] trait.

pub mod providers;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::json;

#[cfg(test)]
use mockall::automock;

use appset_common::crd::{
    ApplicationSet, ApplicationSetTemplate, GeneratorSpec, ParamMap, PullRequestFilter,
    PullRequestGenerator,
};
use appset_common::utils::{sanitize_dns_label, short_sha};
use appset_common::{Error, Result};

use crate::Generator;

/// Default recheck cadence for pull request discovery
pub const DEFAULT_REQUEUE: Duration = Duration::from_secs(30 * 60);

/// One open pull request.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PullRequest {
    /// PR / MR number
    pub number: u64,
    /// Title
    pub title: String,
    /// Source branch
    pub branch: String,
    /// Target branch
    pub target_branch: String,
    /// SHA at the source branch head
    pub head_sha: String,
    /// Author login
    pub author: String,
    /// Labels on the pull request
    pub labels: Vec<String>,
}

/// A configured pull request source.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PullRequestService: Send + Sync {
    /// All open pull requests visible to the configuration.
    async fn list(&self) -> Result<Vec<PullRequest>>;
}

/// Builds a pull request source from a generator spec.
#[cfg_attr(test, automock)]
pub trait PullRequestFactory: Send + Sync {
    /// Create the source described by the spec.
    fn create(&self, spec: &PullRequestGenerator) -> Result<Arc<dyn PullRequestService>>;
}

/// Pull request discovery generator
pub struct PullRequestGeneratorImpl {
    factory: Arc<dyn PullRequestFactory>,
}

impl PullRequestGeneratorImpl {
    /// Create a generator backed by the given factory.
    pub fn new(factory: Arc<dyn PullRequestFactory>) -> Self {
        Self { factory }
    }
}

#[async_trait]
impl Generator for PullRequestGeneratorImpl {
    async fn generate_params(
        &self,
        spec: &GeneratorSpec,
        _app_set: &ApplicationSet,
    ) -> Result<Vec<ParamMap>> {
        let config = spec.pull_request.as_ref().ok_or(Error::EmptyGenerator)?;
        let service = self.factory.create(config)?;
        let filters = compile_filters(&config.filters)?;

        let pull_requests = service.list().await?;
        Ok(pull_requests
            .iter()
            .filter(|pr| matches_filters(&filters, pr))
            .map(pull_request_params)
            .collect())
    }

    fn get_template(&self, spec: &GeneratorSpec) -> Option<ApplicationSetTemplate> {
        spec.pull_request.as_ref().map(|c| c.template.clone())
    }

    fn get_requeue_after(&self, spec: &GeneratorSpec) -> Duration {
        spec.pull_request
            .as_ref()
            .and_then(|c| c.requeue_after_seconds)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_REQUEUE)
    }
}

struct CompiledFilter {
    branch: Option<Regex>,
    target_branch: Option<Regex>,
}

fn compile_filters(filters: &[PullRequestFilter]) -> Result<Vec<CompiledFilter>> {
    filters
        .iter()
        .map(|f| {
            Ok(CompiledFilter {
                branch: compile_regex(f.branch_match.as_deref())?,
                target_branch: compile_regex(f.target_branch_match.as_deref())?,
            })
        })
        .collect()
}

fn compile_regex(pattern: Option<&str>) -> Result<Option<Regex>> {
    pattern
        .map(|p| {
            Regex::new(p)
                .map_err(|e| Error::configuration(format!("invalid filter regex {p:?}: {e}")))
        })
        .transpose()
}

/// A pull request passes when it satisfies every criterion of at least one
/// filter; an empty filter list passes everything.
fn matches_filters(filters: &[CompiledFilter], pr: &PullRequest) -> bool {
    if filters.is_empty() {
        return true;
    }
    filters.iter().any(|filter| {
        filter
            .branch
            .as_ref()
            .map(|re| re.is_match(&pr.branch))
            .unwrap_or(true)
            && filter
                .target_branch
                .as_ref()
                .map(|re| re.is_match(&pr.target_branch))
                .unwrap_or(true)
    })
}

fn pull_request_params(pr: &PullRequest) -> ParamMap {
    let mut params = ParamMap::new();
    params.insert("number".to_string(), json!(pr.number));
    params.insert("title".to_string(), json!(pr.title));
    params.insert("branch".to_string(), json!(pr.branch));
    params.insert(
        "branch_slug".to_string(),
        json!(sanitize_dns_label(&pr.branch)),
    );
    params.insert("target_branch".to_string(), json!(pr.target_branch));
    params.insert("head_sha".to_string(), json!(pr.head_sha));
    params.insert("head_short_sha".to_string(), json!(short_sha(&pr.head_sha)));
    params.insert("author".to_string(), json!(pr.author));
    params.insert("labels".to_string(), json!(pr.labels));
    params
}
