//! ClusterDecisionResource generator: parameters from duck-typed placement
//! decisions
//!
//! A ConfigMap reference names the GVK of a resource whose status carries a
//! list of placement decisions (`statusListKey`, default `clusters`). Each
//! decision entry becomes one parameter map. The resource lookup is behind
//! [`DecisionResourceStore`]; the production implementation in the operator
//! crate uses the dynamic client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;

#[cfg(test)]
use mockall::automock;

use appset_common::crd::{
    ApplicationSet, ApplicationSetTemplate, ClusterDecisionResourceGenerator, GeneratorSpec,
    ParamMap, Selector,
};
use appset_common::{Error, Result};

use crate::Generator;

/// Default recheck cadence for decision resources
pub const DEFAULT_REQUEUE: Duration = Duration::from_secs(3 * 60);

/// Default status key holding the decision list
pub const DEFAULT_STATUS_LIST_KEY: &str = "clusters";

/// Lookup of duck-typed decision resources.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DecisionResourceStore: Send + Sync {
    /// Fetch decision resources as raw JSON objects. The GVK is resolved
    /// from the named ConfigMap; `name` and `selector` narrow the result.
    async fn list_decisions<'a>(
        &self,
        config_map: &str,
        name: Option<&'a str>,
        selector: Option<&'a Selector>,
    ) -> Result<Vec<Value>>;
}

/// Duck-typed placement decision generator
pub struct ClusterDecisionResourceGeneratorImpl {
    store: Arc<dyn DecisionResourceStore>,
}

impl ClusterDecisionResourceGeneratorImpl {
    /// Create a generator backed by the given store.
    pub fn new(store: Arc<dyn DecisionResourceStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Generator for ClusterDecisionResourceGeneratorImpl {
    async fn generate_params(
        &self,
        spec: &GeneratorSpec,
        _app_set: &ApplicationSet,
    ) -> Result<Vec<ParamMap>> {
        let config = spec
            .cluster_decision_resource
            .as_ref()
            .ok_or(Error::EmptyGenerator)?;

        let resources = self
            .store
            .list_decisions(
                &config.config_map_ref,
                config.name.as_deref(),
                config.label_selector.as_ref(),
            )
            .await?;

        let list_key = config
            .status_list_key
            .as_deref()
            .unwrap_or(DEFAULT_STATUS_LIST_KEY);

        let mut params = Vec::new();
        for resource in &resources {
            params.extend(decision_params(resource, list_key, config));
        }
        Ok(params)
    }

    fn get_template(&self, spec: &GeneratorSpec) -> Option<ApplicationSetTemplate> {
        spec.cluster_decision_resource
            .as_ref()
            .map(|c| c.template.clone())
    }

    fn get_requeue_after(&self, spec: &GeneratorSpec) -> Duration {
        spec.cluster_decision_resource
            .as_ref()
            .and_then(|c| c.requeue_after_seconds)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_REQUEUE)
    }
}

/// Extract the decision entries of one resource.
fn decision_params(
    resource: &Value,
    list_key: &str,
    config: &ClusterDecisionResourceGenerator,
) -> Vec<ParamMap> {
    let Some(entries) = resource
        .get("status")
        .and_then(|status| status.get(list_key))
        .and_then(|list| list.as_array())
    else {
        warn!(
            list_key,
            "decision resource has no status list, producing no parameters"
        );
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| match entry.as_object() {
            Some(map) => {
                let mut params = map.clone();
                if !config.values.is_empty() {
                    params.insert("values".to_string(), json!(config.values));
                }
                Some(params)
            }
            None => {
                warn!("decision list entry is not an object, skipped");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn spec(status_list_key: Option<&str>) -> GeneratorSpec {
        GeneratorSpec {
            cluster_decision_resource: Some(ClusterDecisionResourceGenerator {
                config_map_ref: "placement-ducktype".to_string(),
                name: Some("guestbook-placement".to_string()),
                status_list_key: status_list_key.map(String::from),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn generator_with(resources: Vec<Value>) -> ClusterDecisionResourceGeneratorImpl {
        let mut store = MockDecisionResourceStore::new();
        store
            .expect_list_decisions()
            .returning(move |_, _, _| Ok(resources.clone()));
        ClusterDecisionResourceGeneratorImpl::new(Arc::new(store))
    }

    fn app_set() -> ApplicationSet {
        ApplicationSet::new("test", Default::default())
    }

    #[tokio::test]
    async fn status_list_entries_become_parameter_maps() {
        let generator = generator_with(vec![json!({
            "status": {
                "clusters": [
                    {"clusterName": "cluster-a"},
                    {"clusterName": "cluster-b", "reason": "capacity"},
                ]
            }
        })]);

        let params = generator
            .generate_params(&spec(None), &app_set())
            .await
            .unwrap();
        assert_eq!(params.len(), 2);
        assert_eq!(params[0]["clusterName"], "cluster-a");
        assert_eq!(params[1]["reason"], "capacity");
    }

    #[tokio::test]
    async fn custom_status_list_key_is_honoured() {
        let generator = generator_with(vec![json!({
            "status": {"decisions": [{"clusterName": "cluster-a"}]}
        })]);

        let params = generator
            .generate_params(&spec(Some("decisions")), &app_set())
            .await
            .unwrap();
        assert_eq!(params.len(), 1);
    }

    #[tokio::test]
    async fn resource_without_status_list_yields_nothing() {
        let generator = generator_with(vec![json!({"status": {}})]);
        let params = generator
            .generate_params(&spec(None), &app_set())
            .await
            .unwrap();
        assert!(params.is_empty());
    }

    #[tokio::test]
    async fn values_are_attached_to_every_entry() {
        let mut store = MockDecisionResourceStore::new();
        store.expect_list_decisions().returning(|_, _, _| {
            Ok(vec![json!({
                "status": {"clusters": [{"clusterName": "cluster-a"}]}
            })])
        });
        let generator = ClusterDecisionResourceGeneratorImpl::new(Arc::new(store));

        let mut generator_spec = spec(None);
        generator_spec
            .cluster_decision_resource
            .as_mut()
            .unwrap()
            .values = BTreeMap::from([("team".to_string(), "platform".to_string())]);

        let params = generator
            .generate_params(&generator_spec, &app_set())
            .await
            .unwrap();
        assert_eq!(params[0]["values"]["team"], "platform");
    }

    #[test]
    fn requeue_defaults_to_three_minutes() {
        let generator = generator_with(vec![]);
        assert_eq!(generator.get_requeue_after(&spec(None)), DEFAULT_REQUEUE);
    }
}
