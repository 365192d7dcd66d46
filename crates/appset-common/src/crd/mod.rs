//! Custom Resource Definitions for the appset controller
//!
//! Two resources make up the public surface:
//! - [`ApplicationSet`] - the templated specification this controller reconciles
//! - [`Application`] - the concrete deployment descriptor it materialises

mod application;
mod application_set;
mod generator;

pub use application::{
    Application, ApplicationDestination, ApplicationSource, ApplicationSpec, ApplicationStatus,
    HealthStatus, SyncStatus,
};
pub use application_set::{
    ApplicationSet, ApplicationSetApplicationStatus, ApplicationSetCondition,
    ApplicationSetConditionType, ApplicationSetSpec, ApplicationSetStatus, ApplicationSetStrategy,
    ApplicationSetSyncPolicy, ApplicationSetTemplate, ApplicationSetTemplateMeta, ConditionStatus,
    MatchExpression, RolloutPhase, RolloutStep, RollingSyncStrategy, Selector, StrategyType,
    TemplateDialect,
};
pub use generator::{
    ClusterDecisionResourceGenerator, ClusterGenerator, GeneratorSpec, GeneratorVariant,
    GitDirectoryItem, GitFileItem, GitGenerator, ListGenerator, MatrixGenerator, MergeGenerator,
    NestedGeneratorSpec, PluginConfigMapRef, PluginGenerator, PluginInput,
    PullRequestBitbucketServer, PullRequestFilter, PullRequestGenerator, PullRequestGitea,
    PullRequestGithub, PullRequestGitlab, ScmFilter, ScmProviderBitbucketServer, ScmProviderGenerator,
    ScmProviderGitea, ScmProviderGithub, ScmProviderGitlab,
};

/// An unordered mapping from parameter name to arbitrary JSON value,
/// produced by generators and consumed by the template renderer.
pub type ParamMap = serde_json::Map<String, serde_json::Value>;
