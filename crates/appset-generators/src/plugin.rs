//! Plugin generator: parameters from an external HTTP endpoint
//!
//! The plugin name resolves through a ConfigMap to a base URL and a bearer
//! token; the endpoint receives the ApplicationSet name plus the spec's
//! input parameters and returns parameter maps. Both the configuration
//! lookup and the HTTP exchange sit behind traits so the generator logic
//! is testable without a live endpoint.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[cfg(test)]
use mockall::automock;

use appset_common::crd::{
    ApplicationSet, ApplicationSetTemplate, GeneratorSpec, ParamMap, PluginGenerator,
};
use appset_common::{Error, Result};

use crate::Generator;

/// Default recheck cadence for plugin calls
pub const DEFAULT_REQUEUE: Duration = Duration::from_secs(30 * 60);

/// Resolved plugin connection details
#[derive(Clone, Debug, PartialEq)]
pub struct PluginConfig {
    /// Endpoint base URL
    pub base_url: String,
    /// Bearer token presented to the endpoint
    pub token: String,
}

/// Resolves a plugin ConfigMap reference to connection details.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PluginConfigStore: Send + Sync {
    /// Read the named ConfigMap and extract `baseUrl` and `token`.
    async fn get(&self, name: &str) -> Result<PluginConfig>;
}

/// Executes the parameter request against a plugin endpoint.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PluginService: Send + Sync {
    /// Call the plugin and return its parameter maps.
    async fn get_params<'a>(
        &self,
        config: &PluginConfig,
        app_set_name: &str,
        input: Option<&'a Value>,
    ) -> Result<Vec<ParamMap>>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PluginRequest<'a> {
    application_set_name: &'a str,
    input: PluginRequestInput<'a>,
}

#[derive(Serialize)]
struct PluginRequestInput<'a> {
    parameters: Option<&'a Value>,
}

#[derive(Deserialize)]
struct PluginResponse {
    output: PluginOutput,
}

#[derive(Deserialize)]
struct PluginOutput {
    #[serde(default)]
    parameters: Vec<ParamMap>,
}

/// Production plugin client over HTTP
pub struct HttpPluginService {
    client: reqwest::Client,
}

impl HttpPluginService {
    /// Create a client reusing the given HTTP connection pool.
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PluginService for HttpPluginService {
    async fn get_params<'a>(
        &self,
        config: &PluginConfig,
        app_set_name: &str,
        input: Option<&'a Value>,
    ) -> Result<Vec<ParamMap>> {
        let url = format!(
            "{}/api/v1/getparams.execute",
            config.base_url.trim_end_matches('/')
        );
        let request = PluginRequest {
            application_set_name: app_set_name,
            input: PluginRequestInput { parameters: input },
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&config.token)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::remote("plugin", e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::remote(
                "plugin",
                format!("{url} returned {}", response.status()),
            ));
        }

        let body: PluginResponse = response
            .json()
            .await
            .map_err(|e| Error::remote("plugin", format!("decoding {url}: {e}")))?;
        Ok(body.output.parameters)
    }
}

/// Plugin-delegated generator
pub struct PluginGeneratorImpl {
    config_store: Arc<dyn PluginConfigStore>,
    service: Arc<dyn PluginService>,
}

impl PluginGeneratorImpl {
    /// Create a generator from a config store and a plugin client.
    pub fn new(config_store: Arc<dyn PluginConfigStore>, service: Arc<dyn PluginService>) -> Self {
        Self {
            config_store,
            service,
        }
    }
}

#[async_trait]
impl Generator for PluginGeneratorImpl {
    async fn generate_params(
        &self,
        spec: &GeneratorSpec,
        app_set: &ApplicationSet,
    ) -> Result<Vec<ParamMap>> {
        let plugin = spec.plugin.as_ref().ok_or(Error::EmptyGenerator)?;
        let config = self.config_store.get(&plugin.config_map_ref.name).await?;

        let input = plugin.input.parameters.as_ref();
        let mut params = self
            .service
            .get_params(&config, &app_set.name_any(), input)
            .await?;

        for map in &mut params {
            augment(map, plugin);
        }
        Ok(params)
    }

    fn get_template(&self, spec: &GeneratorSpec) -> Option<ApplicationSetTemplate> {
        spec.plugin.as_ref().map(|p| p.template.clone())
    }

    fn get_requeue_after(&self, spec: &GeneratorSpec) -> Duration {
        spec.plugin
            .as_ref()
            .and_then(|p| p.requeue_after_seconds)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_REQUEUE)
    }
}

/// Expose the request input under `generator.input.parameters` and the
/// spec's extra values under `values`, so templates can reference both.
fn augment(map: &mut ParamMap, plugin: &PluginGenerator) {
    if let Some(input) = &plugin.input.parameters {
        map.insert(
            "generator".to_string(),
            json!({"input": {"parameters": input}}),
        );
    }
    if !plugin.values.is_empty() {
        map.insert("values".to_string(), json!(plugin.values));
    }
}
