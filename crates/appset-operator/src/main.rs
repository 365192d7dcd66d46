//! appset-operator - ApplicationSet controller

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::StreamExt;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Controller;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Client, CustomResourceExt};

use appset_common::crd::{Application, ApplicationSet};
use appset_common::events::KubeEventPublisher;
use appset_common::telemetry::init_telemetry;
use appset_common::template::Render;
use appset_common::FIELD_MANAGER;
use appset_generators::plugin::HttpPluginService;
use appset_generators::registry::{build_registry, GeneratorDeps};
use appset_operator::clients::{
    EnvPullRequestFactory, EnvScmProviderFactory, HttpRepoService, KubeAppsClient,
    KubeDecisionResourceStore, KubePluginConfigStore, KubeSecretStore,
};
use appset_operator::controller::{error_policy, reconcile, Context};
use appset_operator::ControllerConfig;

/// ApplicationSet controller: expands templated specifications into
/// concrete applications and reconciles their lifecycle
#[derive(Parser, Debug)]
#[command(name = "appset-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Concurrent reconcile workers
    #[arg(long, env = "APPSET_WORKERS", default_value_t = 4)]
    workers: u16,

    /// Namespace to watch (empty watches all namespaces)
    #[arg(long, env = "APPSET_NAMESPACE", default_value = "")]
    namespace: String,

    /// Per-generator I/O timeout in seconds
    #[arg(long, env = "APPSET_GENERATOR_TIMEOUT_SECONDS", default_value_t = 30)]
    generator_timeout_seconds: u64,

    /// Overall reconcile deadline in seconds
    #[arg(long, env = "APPSET_RECONCILE_DEADLINE_SECONDS", default_value_t = 300)]
    reconcile_deadline_seconds: u64,

    /// RollingSync dwell per step in seconds
    #[arg(long, env = "APPSET_ROLLOUT_DWELL_SECONDS", default_value_t = 10)]
    rollout_dwell_seconds: u64,

    /// RollingSync stabilisation budget per step in seconds
    #[arg(long, env = "APPSET_ROLLOUT_BUDGET_SECONDS", default_value_t = 300)]
    rollout_budget_seconds: u64,

    /// Base URL of the repository service used by the Git generator
    #[arg(
        long,
        env = "APPSET_REPO_SERVER_URL",
        default_value = "http://repo-server:8081"
    )]
    repo_server_url: String,
}

impl Cli {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            workers: self.workers,
            generator_timeout: Duration::from_secs(self.generator_timeout_seconds),
            reconcile_deadline: Duration::from_secs(self.reconcile_deadline_seconds),
            rollout_dwell: Duration::from_secs(self.rollout_dwell_seconds),
            rollout_budget: Duration::from_secs(self.rollout_budget_seconds),
            namespace: (!self.namespace.is_empty()).then(|| self.namespace.clone()),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        // Generate CRD YAML for both resources
        let app_set_crd = serde_yaml::to_string(&ApplicationSet::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize ApplicationSet CRD: {e}"))?;
        let app_crd = serde_yaml::to_string(&Application::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize Application CRD: {e}"))?;
        println!("{app_set_crd}---\n{app_crd}");
        return Ok(());
    }

    init_telemetry().map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {e}"))?;

    run_controller(cli).await
}

/// Ensure the CRDs are installed
///
/// The operator installs its own CRDs on startup using server-side apply,
/// so the CRD versions always match the operator version.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    tracing::info!("Installing ApplicationSet CRD...");
    crds.patch(
        "applicationsets.argoproj.io",
        &params,
        &Patch::Apply(&ApplicationSet::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install ApplicationSet CRD: {e}"))?;

    tracing::info!("Installing Application CRD...");
    crds.patch(
        "applications.argoproj.io",
        &params,
        &Patch::Apply(&Application::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install Application CRD: {e}"))?;

    tracing::info!("All CRDs installed/updated");
    Ok(())
}

/// Run the controller until shutdown
async fn run_controller(cli: Cli) -> anyhow::Result<()> {
    tracing::info!("appset controller starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {e}"))?;

    ensure_crds_installed(&client).await?;

    let config = cli.controller_config();
    let http = reqwest::Client::builder()
        .timeout(config.generator_timeout)
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {e}"))?;

    // Collaborator namespace: where cluster secrets and plugin ConfigMaps
    // live; falls back to the client's default namespace
    let home_namespace = config
        .namespace
        .clone()
        .unwrap_or_else(|| client.default_namespace().to_string());

    let renderer = Arc::new(Render::new());
    let registry = build_registry(GeneratorDeps {
        repos: Arc::new(HttpRepoService::new(http.clone(), &cli.repo_server_url)),
        secrets: Arc::new(KubeSecretStore::new(client.clone(), &home_namespace)),
        scm_factory: Arc::new(EnvScmProviderFactory::new(http.clone())),
        pull_request_factory: Arc::new(EnvPullRequestFactory::new(http.clone())),
        plugin_configs: Arc::new(KubePluginConfigStore::new(client.clone(), &home_namespace)),
        plugin_service: Arc::new(HttpPluginService::new(http)),
        decisions: Arc::new(KubeDecisionResourceStore::new(
            client.clone(),
            &home_namespace,
        )),
        renderer: renderer.clone(),
    });

    let ctx = Arc::new(Context {
        client: Arc::new(KubeAppsClient::new(client.clone())),
        registry,
        renderer,
        events: Arc::new(KubeEventPublisher::new(client.clone(), FIELD_MANAGER)),
        config: config.clone(),
    });

    let (app_sets, apps): (Api<ApplicationSet>, Api<Application>) = match &config.namespace {
        Some(ns) => (
            Api::namespaced(client.clone(), ns),
            Api::namespaced(client.clone(), ns),
        ),
        None => (Api::all(client.clone()), Api::all(client.clone())),
    };

    tracing::info!(workers = config.workers, "Starting ApplicationSet controller");

    Controller::new(app_sets, WatcherConfig::default())
        // Owned applications trigger their ApplicationSet's reconcile, so
        // health changes drive RollingSync without polling
        .owns(apps, WatcherConfig::default())
        .with_config(
            kube::runtime::controller::Config::default().concurrency(config.workers),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "ApplicationSet reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "ApplicationSet reconciliation error");
                }
            }
        })
        .await;

    tracing::info!("appset controller shutting down");
    Ok(())
}
