//! ApplicationSet Custom Resource Definition
//!
//! An ApplicationSet says: "generate applications parameterised by these
//! generators, instantiated through this template". The controller never
//! mutates `.spec`; everything it records lands in `.status`.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::application::ApplicationSpec;
use super::generator::GeneratorSpec;

/// Specification for an ApplicationSet
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "argoproj.io",
    version = "v1alpha1",
    kind = "ApplicationSet",
    plural = "applicationsets",
    shortname = "appset",
    status = "ApplicationSetStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSetSpec {
    /// Ordered sequence of parameter producers
    #[serde(default)]
    pub generators: Vec<GeneratorSpec>,

    /// The application template every parameter map is rendered through
    #[serde(default)]
    pub template: ApplicationSetTemplate,

    /// Sync policy; only `preserveResourcesOnDeletion` is consumed here
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_policy: Option<ApplicationSetSyncPolicy>,

    /// Rollout strategy for propagating changes across the generated set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<ApplicationSetStrategy>,

    /// Which template dialect the renderer uses
    #[serde(default)]
    pub dialect: TemplateDialect,
}

/// Renderer dialect selection
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TemplateDialect {
    /// Legacy `{{ key }}` string substitution
    #[default]
    Flat,
    /// Expression language with dotted paths, conditionals, ranges, helpers
    Structured,
}

/// Sync policy of an ApplicationSet
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSetSyncPolicy {
    /// When true, deleting the ApplicationSet (or dropping an application
    /// from the desired set) leaves the application's resources in place
    #[serde(default)]
    pub preserve_resources_on_deletion: bool,
}

/// Template for generated applications: metadata plus the application spec
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSetTemplate {
    /// Metadata for the generated application
    #[serde(default)]
    pub metadata: ApplicationSetTemplateMeta,

    /// Spec payload for the generated application
    #[serde(default)]
    pub spec: ApplicationSpec,
}

impl ApplicationSetTemplate {
    /// True if no field of the template has been set.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Metadata fragment of an application template
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSetTemplateMeta {
    /// Name of the generated application (after parameter substitution)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    /// Namespace of the generated application
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,

    /// Labels for the generated application
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Annotations for the generated application
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// Finalizers for the generated application
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
}

/// Rollout strategy
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSetStrategy {
    /// Strategy variant
    #[serde(default, rename = "type")]
    pub type_: StrategyType,

    /// Step configuration for the RollingSync strategy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolling_sync: Option<RollingSyncStrategy>,
}

/// Strategy variant selector
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum StrategyType {
    /// Apply every action immediately
    #[default]
    AllAtOnce,
    /// Apply step N only after step N-1 is healthy for a dwell time
    RollingSync,
}

/// Step list for RollingSync
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RollingSyncStrategy {
    /// Steps in literal order; each step selects applications by label
    #[serde(default)]
    pub steps: Vec<RolloutStep>,
}

/// One RollingSync step
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RolloutStep {
    /// Label expressions an application must satisfy to belong to this step
    #[serde(default)]
    pub match_expressions: Vec<MatchExpression>,
}

/// A single label match expression (In / NotIn / Exists / DoesNotExist)
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MatchExpression {
    /// Label key
    pub key: String,

    /// Operator: "In", "NotIn", "Exists", "DoesNotExist"
    pub operator: String,

    /// Values for In / NotIn
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

impl MatchExpression {
    /// Evaluate this expression against a label map.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self.operator.as_str() {
            "In" => labels
                .get(&self.key)
                .map(|v| self.values.iter().any(|candidate| candidate == v))
                .unwrap_or(false),
            "NotIn" => labels
                .get(&self.key)
                .map(|v| !self.values.iter().any(|candidate| candidate == v))
                .unwrap_or(true),
            "Exists" => labels.contains_key(&self.key),
            "DoesNotExist" => !labels.contains_key(&self.key),
            _ => false,
        }
    }
}

/// Label selector used by the cluster and cluster-decision generators
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Selector {
    /// Exact-match label requirements
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,

    /// Expression-match label requirements
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<MatchExpression>,
}

impl Selector {
    /// Evaluate the whole selector against a label map.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
            && self.match_expressions.iter().all(|e| e.matches(labels))
    }

    /// True if the selector places no constraints at all.
    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty() && self.match_expressions.is_empty()
    }
}

/// Status of an ApplicationSet
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSetStatus {
    /// Conditions describing the last reconcile outcome
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ApplicationSetCondition>,

    /// Per-application rollout progress, maintained for RollingSync
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub application_status: Vec<ApplicationSetApplicationStatus>,
}

impl ApplicationSetStatus {
    /// Replace (or insert) the condition of the same type.
    ///
    /// The transition timestamp is only refreshed when the status value
    /// actually changes, so repeated reconciles don't churn the object.
    pub fn set_condition(&mut self, condition: ApplicationSetCondition) {
        if let Some(existing) = self
            .conditions
            .iter_mut()
            .find(|c| c.type_ == condition.type_)
        {
            let transition = if existing.status == condition.status {
                existing.last_transition_time
            } else {
                condition.last_transition_time
            };
            *existing = ApplicationSetCondition {
                last_transition_time: transition,
                ..condition
            };
        } else {
            self.conditions.push(condition);
        }
    }
}

/// Condition types surfaced on an ApplicationSet
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ApplicationSetConditionType {
    /// Something went wrong during the reconcile
    ErrorOccurred,
    /// The generator layer produced a candidate parameter set
    ParametersGenerated,
    /// Live applications match the desired set
    ResourcesUpToDate,
    /// A RollingSync rollout is in flight
    RolloutProgressing,
    /// A RollingSync step failed to stabilise within its budget
    RolloutStalled,
    /// The reconcile deadline elapsed before completion
    Cancelled,
}

/// Condition truth value, serialised the Kubernetes way
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition holds
    True,
    /// Condition does not hold
    False,
    /// Condition state cannot be determined
    Unknown,
}

/// One condition on an ApplicationSet
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSetCondition {
    /// Condition type
    #[serde(rename = "type")]
    pub type_: ApplicationSetConditionType,

    /// Truth value
    pub status: ConditionStatus,

    /// Machine-readable reason
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the status value changed
    pub last_transition_time: DateTime<Utc>,
}

impl ApplicationSetCondition {
    /// Create a condition stamped with the current time.
    pub fn new(
        type_: ApplicationSetConditionType,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_,
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}

/// Rollout phase of one generated application
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum RolloutPhase {
    /// The application's step has not been reached yet
    #[default]
    Waiting,
    /// The application's step is active but the update has not been applied
    Pending,
    /// The update was applied and the application has not settled
    Progressing,
    /// The application is Healthy and Synced
    Healthy,
}

/// Per-application rollout progress entry
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSetApplicationStatus {
    /// Application name
    pub application: String,

    /// Step index (1-based, matching user-facing step numbering)
    pub step: String,

    /// Current phase
    pub status: RolloutPhase,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// Last time the phase changed
    pub last_transition_time: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dialect_defaults_to_flat() {
        let spec: ApplicationSetSpec = serde_json::from_str("{}").unwrap();
        assert_eq!(spec.dialect, TemplateDialect::Flat);

        let spec: ApplicationSetSpec =
            serde_json::from_str(r#"{"dialect": "structured"}"#).unwrap();
        assert_eq!(spec.dialect, TemplateDialect::Structured);
    }

    #[test]
    fn match_expression_in_and_not_in() {
        let labels = BTreeMap::from([("env".to_string(), "prod".to_string())]);

        let expr = MatchExpression {
            key: "env".to_string(),
            operator: "In".to_string(),
            values: vec!["prod".to_string(), "staging".to_string()],
        };
        assert!(expr.matches(&labels));

        let expr = MatchExpression {
            key: "env".to_string(),
            operator: "NotIn".to_string(),
            values: vec!["prod".to_string()],
        };
        assert!(!expr.matches(&labels));

        // NotIn on an absent key matches
        let expr = MatchExpression {
            key: "region".to_string(),
            operator: "NotIn".to_string(),
            values: vec!["us-east-1".to_string()],
        };
        assert!(expr.matches(&labels));
    }

    #[test]
    fn match_expression_exists() {
        let labels = BTreeMap::from([("env".to_string(), "prod".to_string())]);
        let exists = MatchExpression {
            key: "env".to_string(),
            operator: "Exists".to_string(),
            values: vec![],
        };
        assert!(exists.matches(&labels));

        let missing = MatchExpression {
            key: "region".to_string(),
            operator: "DoesNotExist".to_string(),
            values: vec![],
        };
        assert!(missing.matches(&labels));
    }

    #[test]
    fn selector_combines_labels_and_expressions() {
        let labels = BTreeMap::from([
            ("env".to_string(), "prod".to_string()),
            ("tier".to_string(), "frontend".to_string()),
        ]);
        let selector = Selector {
            match_labels: BTreeMap::from([("env".to_string(), "prod".to_string())]),
            match_expressions: vec![MatchExpression {
                key: "tier".to_string(),
                operator: "In".to_string(),
                values: vec!["frontend".to_string()],
            }],
        };
        assert!(selector.matches(&labels));

        let selector = Selector {
            match_labels: BTreeMap::from([("env".to_string(), "staging".to_string())]),
            ..Default::default()
        };
        assert!(!selector.matches(&labels));
    }

    #[test]
    fn set_condition_replaces_same_type_and_keeps_transition_time() {
        let mut status = ApplicationSetStatus::default();
        let first = ApplicationSetCondition::new(
            ApplicationSetConditionType::ParametersGenerated,
            ConditionStatus::True,
            "ParametersGenerated",
            "generated 4 parameter maps",
        );
        let first_time = first.last_transition_time;
        status.set_condition(first);

        // Same status value: message updates, transition time is preserved
        status.set_condition(ApplicationSetCondition::new(
            ApplicationSetConditionType::ParametersGenerated,
            ConditionStatus::True,
            "ParametersGenerated",
            "generated 6 parameter maps",
        ));
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].message, "generated 6 parameter maps");
        assert_eq!(status.conditions[0].last_transition_time, first_time);

        // Different status value: transition time moves
        status.set_condition(ApplicationSetCondition::new(
            ApplicationSetConditionType::ParametersGenerated,
            ConditionStatus::False,
            "ErrorOccurred",
            "no generator produced parameters",
        ));
        assert_eq!(status.conditions.len(), 1);
        assert!(status.conditions[0].last_transition_time >= first_time);
    }

    #[test]
    fn template_is_empty_detects_defaults() {
        assert!(ApplicationSetTemplate::default().is_empty());

        let t = ApplicationSetTemplate {
            metadata: ApplicationSetTemplateMeta {
                name: "{{name}}".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(!t.is_empty());
    }
}
