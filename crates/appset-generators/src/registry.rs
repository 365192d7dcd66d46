//! Generator registry assembly
//!
//! The registry is built once at start-up from the external collaborators
//! each leaf generator needs, then shared with the reconciler and with the
//! composite generators (which dispatch their children through the leaf
//! set, so a matrix can never nest another matrix).

use std::collections::HashMap;
use std::sync::Arc;

use appset_common::template::Renderer;

use crate::cluster::{ClusterGeneratorImpl, SecretStore};
use crate::cluster_decision::{ClusterDecisionResourceGeneratorImpl, DecisionResourceStore};
use crate::git::{GitGeneratorImpl, RepoService};
use crate::list::ListGeneratorImpl;
use crate::matrix::MatrixGeneratorImpl;
use crate::merge::MergeGeneratorImpl;
use crate::plugin::{PluginConfigStore, PluginGeneratorImpl, PluginService};
use crate::pull_request::{PullRequestFactory, PullRequestGeneratorImpl};
use crate::scm::{ScmProviderFactory, ScmProviderGeneratorImpl};
use crate::{Generator, GeneratorRegistry};

/// External collaborators the leaf generators depend on.
pub struct GeneratorDeps {
    /// Repository access for the Git generator
    pub repos: Arc<dyn RepoService>,
    /// Cluster-secret access for the Clusters generator
    pub secrets: Arc<dyn SecretStore>,
    /// SCM provider connections
    pub scm_factory: Arc<dyn ScmProviderFactory>,
    /// Pull request sources
    pub pull_request_factory: Arc<dyn PullRequestFactory>,
    /// Plugin ConfigMap resolution
    pub plugin_configs: Arc<dyn PluginConfigStore>,
    /// Plugin endpoint client
    pub plugin_service: Arc<dyn PluginService>,
    /// Duck-typed decision resource lookup
    pub decisions: Arc<dyn DecisionResourceStore>,
    /// Template renderer, shared with the reconciler
    pub renderer: Arc<dyn Renderer>,
}

/// Build the full dispatch table: every leaf generator plus Matrix and
/// Merge wired to recurse into the leaves.
pub fn build_registry(deps: GeneratorDeps) -> Arc<GeneratorRegistry> {
    let mut leaves: GeneratorRegistry = HashMap::new();
    leaves.insert("List", Arc::new(ListGeneratorImpl::new()) as Arc<dyn Generator>);
    leaves.insert("Git", Arc::new(GitGeneratorImpl::new(deps.repos)));
    leaves.insert(
        "Clusters",
        Arc::new(ClusterGeneratorImpl::new(
            deps.secrets,
            deps.renderer.clone(),
        )),
    );
    leaves.insert(
        "SCMProvider",
        Arc::new(ScmProviderGeneratorImpl::new(deps.scm_factory)),
    );
    leaves.insert(
        "PullRequest",
        Arc::new(PullRequestGeneratorImpl::new(deps.pull_request_factory)),
    );
    leaves.insert(
        "ClusterDecisionResource",
        Arc::new(ClusterDecisionResourceGeneratorImpl::new(deps.decisions)),
    );
    leaves.insert(
        "Plugin",
        Arc::new(PluginGeneratorImpl::new(
            deps.plugin_configs,
            deps.plugin_service,
        )),
    );

    let leaves = Arc::new(leaves);

    let mut registry: GeneratorRegistry = leaves.as_ref().clone();
    registry.insert(
        "Matrix",
        Arc::new(MatrixGeneratorImpl::new(leaves.clone(), deps.renderer)),
    );
    registry.insert("Merge", Arc::new(MergeGeneratorImpl::new(leaves)));

    Arc::new(registry)
}
