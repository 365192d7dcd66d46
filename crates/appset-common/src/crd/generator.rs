//! Generator spec types
//!
//! On the wire a generator is "one of N nullable fields". Internally every
//! consumer goes through [`GeneratorSpec::variant`], which collapses the
//! nullable fields into a tagged enum so dispatch can match exhaustively.
//! A spec with zero populated variants is "unrecognised" and surfaces as a
//! validation warning; more than one populated variant is malformed.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::application_set::{ApplicationSetTemplate, Selector};

/// A tagged view over the populated variant of a [`GeneratorSpec`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GeneratorVariant {
    /// Literal parameter list
    List,
    /// Repository directory/file scan
    Git,
    /// Cluster catalog query
    Clusters,
    /// SCM provider repository discovery
    ScmProvider,
    /// Open pull requests from an SCM provider
    PullRequest,
    /// Duck-typed placement decision resource
    ClusterDecisionResource,
    /// External HTTP parameter plugin
    Plugin,
    /// Cartesian product of two generators
    Matrix,
    /// Keyed join of two generators
    Merge,
}

impl GeneratorVariant {
    /// Registry key for this variant.
    pub fn name(&self) -> &'static str {
        match self {
            GeneratorVariant::List => "List",
            GeneratorVariant::Git => "Git",
            GeneratorVariant::Clusters => "Clusters",
            GeneratorVariant::ScmProvider => "SCMProvider",
            GeneratorVariant::PullRequest => "PullRequest",
            GeneratorVariant::ClusterDecisionResource => "ClusterDecisionResource",
            GeneratorVariant::Plugin => "Plugin",
            GeneratorVariant::Matrix => "Matrix",
            GeneratorVariant::Merge => "Merge",
        }
    }
}

/// One generator entry in an ApplicationSet spec
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GeneratorSpec {
    /// Literal parameter list
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list: Option<ListGenerator>,

    /// Repository directory/file scan
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitGenerator>,

    /// Cluster catalog query
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clusters: Option<ClusterGenerator>,

    /// SCM provider repository discovery
    #[serde(default, rename = "scmProvider", skip_serializing_if = "Option::is_none")]
    pub scm_provider: Option<ScmProviderGenerator>,

    /// Open pull requests from an SCM provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_request: Option<PullRequestGenerator>,

    /// Duck-typed placement decision resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_decision_resource: Option<ClusterDecisionResourceGenerator>,

    /// External HTTP parameter plugin
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<PluginGenerator>,

    /// Cartesian product of two generators
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matrix: Option<MatrixGenerator>,

    /// Keyed join of two generators
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge: Option<MergeGenerator>,
}

impl GeneratorSpec {
    /// Which variants are populated, in declaration order.
    fn populated(&self) -> Vec<GeneratorVariant> {
        let mut variants = Vec::new();
        if self.list.is_some() {
            variants.push(GeneratorVariant::List);
        }
        if self.git.is_some() {
            variants.push(GeneratorVariant::Git);
        }
        if self.clusters.is_some() {
            variants.push(GeneratorVariant::Clusters);
        }
        if self.scm_provider.is_some() {
            variants.push(GeneratorVariant::ScmProvider);
        }
        if self.pull_request.is_some() {
            variants.push(GeneratorVariant::PullRequest);
        }
        if self.cluster_decision_resource.is_some() {
            variants.push(GeneratorVariant::ClusterDecisionResource);
        }
        if self.plugin.is_some() {
            variants.push(GeneratorVariant::Plugin);
        }
        if self.matrix.is_some() {
            variants.push(GeneratorVariant::Matrix);
        }
        if self.merge.is_some() {
            variants.push(GeneratorVariant::Merge);
        }
        variants
    }

    /// Number of populated variant fields.
    pub fn populated_count(&self) -> usize {
        self.populated().len()
    }

    /// The single populated variant, or `None` when the spec has zero
    /// populated fields (an "unrecognised" generator). Callers that require
    /// exactly one variant check [`populated_count`](Self::populated_count)
    /// at ingress.
    pub fn variant(&self) -> Option<GeneratorVariant> {
        self.populated().into_iter().next()
    }
}

/// A generator nested inside a composite (Matrix / Merge).
///
/// Composites only nest leaves: there is no recursive matrix-of-matrix.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NestedGeneratorSpec {
    /// Literal parameter list
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list: Option<ListGenerator>,

    /// Repository directory/file scan
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitGenerator>,

    /// Cluster catalog query
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clusters: Option<ClusterGenerator>,

    /// SCM provider repository discovery
    #[serde(default, rename = "scmProvider", skip_serializing_if = "Option::is_none")]
    pub scm_provider: Option<ScmProviderGenerator>,

    /// Open pull requests from an SCM provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_request: Option<PullRequestGenerator>,

    /// Duck-typed placement decision resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_decision_resource: Option<ClusterDecisionResourceGenerator>,

    /// External HTTP parameter plugin
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<PluginGenerator>,
}

impl NestedGeneratorSpec {
    /// Widen to a full [`GeneratorSpec`] for registry dispatch.
    pub fn to_generator_spec(&self) -> GeneratorSpec {
        GeneratorSpec {
            list: self.list.clone(),
            git: self.git.clone(),
            clusters: self.clusters.clone(),
            scm_provider: self.scm_provider.clone(),
            pull_request: self.pull_request.clone(),
            cluster_decision_resource: self.cluster_decision_resource.clone(),
            plugin: self.plugin.clone(),
            matrix: None,
            merge: None,
        }
    }
}

/// Literal parameter list generator
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ListGenerator {
    /// JSON objects, each becoming one parameter map
    #[serde(default)]
    pub elements: Vec<serde_json::Value>,

    /// Per-generator template fragment
    #[serde(default, skip_serializing_if = "ApplicationSetTemplate::is_empty")]
    pub template: ApplicationSetTemplate,
}

/// Repository scan generator (directories or files)
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GitGenerator {
    /// Repository URL
    #[serde(rename = "repoURL")]
    pub repo_url: String,

    /// Revision (branch, tag, commit) to scan
    #[serde(default)]
    pub revision: String,

    /// Directory globs; a path is emitted when it matches at least one
    /// non-exclude entry and no exclude entry
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub directories: Vec<GitDirectoryItem>,

    /// File globs; each matched file's records become parameter maps
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<GitFileItem>,

    /// Recheck cadence in seconds (default 3 minutes)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requeue_after_seconds: Option<u64>,

    /// Per-generator template fragment
    #[serde(default, skip_serializing_if = "ApplicationSetTemplate::is_empty")]
    pub template: ApplicationSetTemplate,
}

/// One directory glob entry
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GitDirectoryItem {
    /// Glob pattern matched against repository paths
    pub path: String,

    /// When true, paths matching this entry are removed from the result
    #[serde(default)]
    pub exclude: bool,
}

/// One file glob entry
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GitFileItem {
    /// Glob pattern matched against repository file paths
    pub path: String,
}

/// Cluster catalog generator
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterGenerator {
    /// Additional label selector over cluster secrets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<Selector>,

    /// Extra values rendered with each cluster's parameters and exposed
    /// under the `values` sub-map
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub values: BTreeMap<String, String>,

    /// Per-generator template fragment
    #[serde(default, skip_serializing_if = "ApplicationSetTemplate::is_empty")]
    pub template: ApplicationSetTemplate,
}

/// SCM provider repository discovery generator
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScmProviderGenerator {
    /// GitHub configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github: Option<ScmProviderGithub>,

    /// GitLab configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gitlab: Option<ScmProviderGitlab>,

    /// Gitea configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gitea: Option<ScmProviderGitea>,

    /// Bitbucket Server configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitbucket_server: Option<ScmProviderBitbucketServer>,

    /// Result filters, applied in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<ScmFilter>,

    /// Protocol for the emitted clone URL ("https" or "ssh")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clone_protocol: Option<String>,

    /// Recheck cadence in seconds (default 30 minutes)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requeue_after_seconds: Option<u64>,

    /// Per-generator template fragment
    #[serde(default, skip_serializing_if = "ApplicationSetTemplate::is_empty")]
    pub template: ApplicationSetTemplate,
}

/// GitHub SCM provider configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScmProviderGithub {
    /// Organization to scan
    pub organization: String,

    /// API base URL (defaults to https://api.github.com)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api: Option<String>,

    /// Scan every branch instead of only the default branch
    #[serde(default)]
    pub all_branches: bool,
}

/// GitLab SCM provider configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScmProviderGitlab {
    /// Group to scan
    pub group: String,

    /// API base URL (defaults to https://gitlab.com)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api: Option<String>,

    /// Include subgroup projects
    #[serde(default)]
    pub include_subgroups: bool,

    /// Scan every branch instead of only the default branch
    #[serde(default)]
    pub all_branches: bool,
}

/// Gitea SCM provider configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScmProviderGitea {
    /// Owner (user or organization) to scan
    pub owner: String,

    /// API base URL
    pub api: String,

    /// Scan every branch instead of only the default branch
    #[serde(default)]
    pub all_branches: bool,
}

/// Bitbucket Server SCM provider configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScmProviderBitbucketServer {
    /// Project key to scan
    pub project: String,

    /// API base URL; normalised to end in `/rest`
    pub api: String,

    /// Scan every branch instead of only the default branch
    #[serde(default)]
    pub all_branches: bool,
}

/// One SCM result filter
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScmFilter {
    /// Regex the repository name must match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_match: Option<String>,

    /// Regex at least one repository label must match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_match: Option<String>,

    /// Regex the branch name must match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_match: Option<String>,

    /// Paths that must exist in the repository at the scanned branch
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths_exist: Vec<String>,
}

/// Pull request discovery generator
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestGenerator {
    /// GitHub configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github: Option<PullRequestGithub>,

    /// GitLab configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gitlab: Option<PullRequestGitlab>,

    /// Gitea configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gitea: Option<PullRequestGitea>,

    /// Bitbucket Server configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitbucket_server: Option<PullRequestBitbucketServer>,

    /// Result filters, applied in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<PullRequestFilter>,

    /// Recheck cadence in seconds (default 30 minutes)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requeue_after_seconds: Option<u64>,

    /// Per-generator template fragment
    #[serde(default, skip_serializing_if = "ApplicationSetTemplate::is_empty")]
    pub template: ApplicationSetTemplate,
}

/// GitHub pull request configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestGithub {
    /// Repository owner
    pub owner: String,

    /// Repository name
    pub repo: String,

    /// API base URL (defaults to https://api.github.com)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api: Option<String>,

    /// Only PRs carrying all of these labels
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
}

/// GitLab merge request configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestGitlab {
    /// Project path or numeric id
    pub project: String,

    /// API base URL (defaults to https://gitlab.com)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api: Option<String>,

    /// Only MRs carrying all of these labels
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
}

/// Gitea pull request configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestGitea {
    /// Repository owner
    pub owner: String,

    /// Repository name
    pub repo: String,

    /// API base URL
    pub api: String,
}

/// Bitbucket Server pull request configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestBitbucketServer {
    /// Project key
    pub project: String,

    /// Repository slug
    pub repo: String,

    /// API base URL; normalised to end in `/rest`
    pub api: String,
}

/// One pull request filter
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestFilter {
    /// Regex the source branch must match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_match: Option<String>,

    /// Regex the target branch must match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_branch_match: Option<String>,
}

/// Duck-typed placement decision generator
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDecisionResourceGenerator {
    /// Name of the ConfigMap describing the duck-typed resource
    /// (apiVersion, kind, statusListKey, matchKey)
    pub config_map_ref: String,

    /// Name of one specific decision resource to read
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Label selector over decision resources (alternative to `name`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<Selector>,

    /// Key within the resource's `status` holding the decision list
    /// (default `clusters`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_list_key: Option<String>,

    /// Recheck cadence in seconds (default 3 minutes)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requeue_after_seconds: Option<u64>,

    /// Extra values exposed under the `values` sub-map
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub values: BTreeMap<String, String>,

    /// Per-generator template fragment
    #[serde(default, skip_serializing_if = "ApplicationSetTemplate::is_empty")]
    pub template: ApplicationSetTemplate,
}

/// External HTTP plugin generator
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PluginGenerator {
    /// Reference to the ConfigMap resolving the plugin endpoint and token
    pub config_map_ref: PluginConfigMapRef,

    /// Input forwarded to the plugin
    #[serde(default)]
    pub input: PluginInput,

    /// Recheck cadence in seconds (default 30 minutes)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requeue_after_seconds: Option<u64>,

    /// Extra values exposed under the `values` sub-map
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub values: BTreeMap<String, String>,

    /// Per-generator template fragment
    #[serde(default, skip_serializing_if = "ApplicationSetTemplate::is_empty")]
    pub template: ApplicationSetTemplate,
}

/// Name reference to a plugin ConfigMap
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PluginConfigMapRef {
    /// ConfigMap name
    pub name: String,
}

/// Parameters passed through to the plugin endpoint
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PluginInput {
    /// Opaque parameter object forwarded verbatim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

/// Cartesian-product composite generator
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MatrixGenerator {
    /// Exactly two child generators
    #[serde(default)]
    pub generators: Vec<NestedGeneratorSpec>,

    /// Per-generator template fragment
    #[serde(default, skip_serializing_if = "ApplicationSetTemplate::is_empty")]
    pub template: ApplicationSetTemplate,
}

/// Keyed-join composite generator
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MergeGenerator {
    /// Exactly two child generators
    #[serde(default)]
    pub generators: Vec<NestedGeneratorSpec>,

    /// Field names forming the join key
    #[serde(default)]
    pub merge_keys: Vec<String>,

    /// Per-generator template fragment
    #[serde(default, skip_serializing_if = "ApplicationSetTemplate::is_empty")]
    pub template: ApplicationSetTemplate,
}
