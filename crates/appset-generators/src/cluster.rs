//! Cluster generator: parameters from cluster-connection secrets
//!
//! The control plane stores one Secret per known cluster, labelled
//! `argocd.argoproj.io/secret-type=cluster`, with `name` and `server` in
//! its data. Each secret matching the generator's selector becomes one
//! parameter map. Discovery is driven by the secret watch, so this
//! generator never asks for a timed requeue.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use serde_json::{json, Value};
use tracing::warn;

#[cfg(test)]
use mockall::automock;

use appset_common::crd::{
    ApplicationSet, ApplicationSetTemplate, ClusterGenerator, GeneratorSpec, ParamMap,
};
use appset_common::template::Renderer;
use appset_common::utils::sanitize_dns_label;
use appset_common::{Error, Result};

use crate::{Generator, NO_REQUEUE_AFTER};

/// Access to the cluster-secret catalog.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Every Secret labelled as a cluster secret.
    async fn list_cluster_secrets(&self) -> Result<Vec<Secret>>;
}

/// Cluster catalog generator
pub struct ClusterGeneratorImpl {
    store: Arc<dyn SecretStore>,
    renderer: Arc<dyn Renderer>,
}

impl ClusterGeneratorImpl {
    /// Create a generator backed by the given secret store.
    pub fn new(store: Arc<dyn SecretStore>, renderer: Arc<dyn Renderer>) -> Self {
        Self { store, renderer }
    }
}

#[async_trait]
impl Generator for ClusterGeneratorImpl {
    async fn generate_params(
        &self,
        spec: &GeneratorSpec,
        app_set: &ApplicationSet,
    ) -> Result<Vec<ParamMap>> {
        let clusters = spec.clusters.as_ref().ok_or(Error::EmptyGenerator)?;

        let secrets = self.store.list_cluster_secrets().await?;
        let mut params = Vec::new();
        for secret in &secrets {
            let labels = secret.metadata.labels.clone().unwrap_or_default();
            if let Some(selector) = &clusters.selector {
                if !selector.matches(&labels) {
                    continue;
                }
            }
            match cluster_params(secret, clusters, app_set, self.renderer.as_ref())? {
                Some(map) => params.push(map),
                None => {
                    warn!(
                        secret = secret.metadata.name.as_deref().unwrap_or_default(),
                        "cluster secret is missing name or server data, skipping"
                    );
                }
            }
        }
        Ok(params)
    }

    fn get_template(&self, spec: &GeneratorSpec) -> Option<ApplicationSetTemplate> {
        spec.clusters.as_ref().map(|c| c.template.clone())
    }

    fn get_requeue_after(&self, _spec: &GeneratorSpec) -> Duration {
        NO_REQUEUE_AFTER
    }
}

/// Build the parameter map for one cluster secret, or `None` when the
/// secret lacks the mandatory `name` / `server` entries.
fn cluster_params(
    secret: &Secret,
    clusters: &ClusterGenerator,
    app_set: &ApplicationSet,
    renderer: &dyn Renderer,
) -> Result<Option<ParamMap>> {
    let data = secret.data.clone().unwrap_or_default();
    let Some(name) = data.get("name").and_then(|v| String::from_utf8(v.0.clone()).ok()) else {
        return Ok(None);
    };
    let Some(server) = data.get("server").and_then(|v| String::from_utf8(v.0.clone()).ok())
    else {
        return Ok(None);
    };

    let labels = secret.metadata.labels.clone().unwrap_or_default();
    let annotations = secret.metadata.annotations.clone().unwrap_or_default();

    let mut params = ParamMap::new();
    params.insert("name".to_string(), json!(name));
    params.insert("nameNormalized".to_string(), json!(sanitize_dns_label(&name)));
    params.insert("server".to_string(), json!(server));

    let mut metadata = serde_json::Map::new();
    metadata.insert("labels".to_string(), json!(labels));
    if !annotations.is_empty() {
        metadata.insert("annotations".to_string(), json!(annotations));
    }
    params.insert("metadata".to_string(), Value::Object(metadata));

    if !clusters.values.is_empty() {
        let mut values = serde_json::Map::new();
        for (key, raw) in &clusters.values {
            let rendered = renderer.replace(raw, &params, app_set.spec.dialect)?;
            values.insert(key.clone(), json!(rendered));
        }
        params.insert("values".to_string(), Value::Object(values));
    }

    Ok(Some(params))
}
