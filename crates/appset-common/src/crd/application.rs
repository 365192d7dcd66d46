//! Application Custom Resource Definition
//!
//! An Application is the concrete deployment descriptor one parameter map
//! renders into: a source, a destination, a project, and a sync policy.
//! The controller owns every Application it materialises; the application
//! controller itself (an external collaborator) fills in `.status`, which
//! this controller only ever reads.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Specification for an Application
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "argoproj.io",
    version = "v1alpha1",
    kind = "Application",
    plural = "applications",
    shortname = "app",
    status = "ApplicationStatus",
    namespaced,
    printcolumn = r#"{"name":"Sync","type":"string","jsonPath":".status.sync.status"}"#,
    printcolumn = r#"{"name":"Health","type":"string","jsonPath":".status.health.status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSpec {
    /// Project the application belongs to
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub project: String,

    /// Where the application's manifests come from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ApplicationSource>,

    /// Which cluster and namespace the application deploys into
    #[serde(default)]
    pub destination: ApplicationDestination,

    /// Sync behaviour, passed through opaquely to the application controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_policy: Option<serde_json::Value>,
}

/// Source of an application's manifests
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSource {
    /// Repository URL
    #[serde(default, rename = "repoURL")]
    pub repo_url: String,

    /// Path within the repository
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,

    /// Revision (branch, tag, or commit) to deploy
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_revision: String,

    /// Helm chart name, for chart repositories
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart: Option<String>,

    /// Tool-specific configuration (helm values, kustomize patches, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm: Option<serde_json::Value>,
}

/// Deployment target of an application
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationDestination {
    /// API server URL of the target cluster
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub server: String,

    /// Symbolic name of the target cluster (alternative to `server`)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    /// Target namespace
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

/// Status of an Application, written by the application controller
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationStatus {
    /// Aggregated health of the application's resources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthStatus>,

    /// Sync state relative to the target revision
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync: Option<SyncStatus>,

    /// Free-form status fields this controller does not interpret
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Health of an application ("Healthy", "Progressing", "Degraded", ...)
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    /// Health status code
    #[serde(default)]
    pub status: String,

    /// Human-readable detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Sync state of an application ("Synced", "OutOfSync", ...)
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    /// Sync status code
    #[serde(default)]
    pub status: String,

    /// Revision the live state was compared against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
}

impl Application {
    /// True if the application reports Healthy and Synced.
    ///
    /// Used by the RollingSync strategy to decide when a step has settled.
    pub fn is_healthy_and_synced(&self) -> bool {
        let Some(status) = self.status.as_ref() else {
            return false;
        };
        let healthy = status
            .health
            .as_ref()
            .map(|h| h.status == "Healthy")
            .unwrap_or(false);
        let synced = status
            .sync
            .as_ref()
            .map(|s| s.status == "Synced")
            .unwrap_or(false);
        healthy && synced
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app_with_status(health: Option<&str>, sync: Option<&str>) -> Application {
        let mut app = Application::new("guestbook", ApplicationSpec::default());
        app.status = Some(ApplicationStatus {
            health: health.map(|h| HealthStatus {
                status: h.to_string(),
                message: None,
            }),
            sync: sync.map(|s| SyncStatus {
                status: s.to_string(),
                revision: None,
            }),
            extra: BTreeMap::new(),
        });
        app
    }

    #[test]
    fn healthy_and_synced_requires_both() {
        assert!(app_with_status(Some("Healthy"), Some("Synced")).is_healthy_and_synced());
        assert!(!app_with_status(Some("Healthy"), Some("OutOfSync")).is_healthy_and_synced());
        assert!(!app_with_status(Some("Progressing"), Some("Synced")).is_healthy_and_synced());
        assert!(!app_with_status(None, Some("Synced")).is_healthy_and_synced());
    }

    #[test]
    fn missing_status_is_not_healthy() {
        let app = Application::new("guestbook", ApplicationSpec::default());
        assert!(!app.is_healthy_and_synced());
    }

    #[test]
    fn spec_round_trips_through_json() {
        let spec = ApplicationSpec {
            project: "default".to_string(),
            source: Some(ApplicationSource {
                repo_url: "https://github.com/example/apps.git".to_string(),
                path: "guestbook".to_string(),
                target_revision: "HEAD".to_string(),
                ..Default::default()
            }),
            destination: ApplicationDestination {
                server: "https://kubernetes.default.svc".to_string(),
                namespace: "guestbook".to_string(),
                ..Default::default()
            },
            sync_policy: None,
        };

        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["source"]["repoURL"], "https://github.com/example/apps.git");
        let back: ApplicationSpec = serde_json::from_value(json).unwrap();
        assert_eq!(back, spec);
    }
}
