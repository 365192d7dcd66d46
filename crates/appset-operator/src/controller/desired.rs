//! Desired-set computation
//!
//! For each top-level generator: produce parameter maps, merge the
//! per-generator template fragment over the ApplicationSet's global
//! template (field-level override), render one application per map, then
//! enforce name uniqueness and a deterministic order. One failing
//! parameter map never aborts the set; a generator layer that produces no
//! candidate set at all does.

use std::collections::HashSet;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;
use tracing::{debug, warn};

use appset_common::crd::{Application, ApplicationSet, ApplicationSetTemplate};
use appset_common::template::Renderer;
use appset_common::utils::deep_merge;
use appset_common::{Error, Result};
use appset_generators::{generator_for, GeneratorRegistry, NO_REQUEUE_AFTER};

/// Everything the reconciler needs to know about the desired set.
#[derive(Debug)]
pub struct DesiredOutcome {
    /// Rendered applications in deterministic order
    pub apps: Vec<Application>,
    /// Per-generator and per-parameter errors that did not abort the set
    pub errors: Vec<Error>,
    /// Names dropped by the duplicate-name rule (first wins)
    pub duplicates: Vec<String>,
    /// Minimum requeue duration over all generators
    pub requeue_after: Duration,
}

/// Expand every generator of the ApplicationSet into rendered applications.
pub async fn generate_desired(
    app_set: &ApplicationSet,
    registry: &GeneratorRegistry,
    renderer: &dyn Renderer,
    generator_timeout: Duration,
) -> Result<DesiredOutcome> {
    let mut apps = Vec::new();
    let mut errors = Vec::new();
    let mut requeue_after = NO_REQUEUE_AFTER;
    let mut any_generator_succeeded = app_set.spec.generators.is_empty();

    for (index, generator_spec) in app_set.spec.generators.iter().enumerate() {
        let generator = match generator_for(registry, generator_spec) {
            Ok(generator) => generator,
            Err(e) => {
                warn!(generator = index, error = %e, "skipping generator");
                errors.push(e);
                continue;
            }
        };

        requeue_after = requeue_after.min(generator.get_requeue_after(generator_spec));

        let generated =
            tokio::time::timeout(generator_timeout, generator.generate_params(generator_spec, app_set))
                .await
                .unwrap_or_else(|_| {
                    Err(Error::remote(
                        "generator",
                        format!("generator {index} timed out after {generator_timeout:?}"),
                    ))
                });

        let params_list = match generated {
            Ok(params_list) => params_list,
            Err(e) => {
                warn!(generator = index, error = %e, "generator failed");
                errors.push(e);
                continue;
            }
        };
        any_generator_succeeded = true;

        let template = match generator.get_template(generator_spec) {
            Some(fragment) => merge_templates(&app_set.spec.template, &fragment)?,
            None => app_set.spec.template.clone(),
        };

        debug!(
            generator = index,
            count = params_list.len(),
            "generator produced parameter maps"
        );

        for params in &params_list {
            match renderer.render_template_params(
                &template,
                app_set.spec.sync_policy.as_ref(),
                params,
                app_set.spec.dialect,
            ) {
                Ok(mut app) => {
                    finalize_metadata(&mut app, app_set);
                    apps.push(app);
                }
                Err(e) => {
                    warn!(generator = index, error = %e, "skipping unrenderable parameter map");
                    errors.push(e);
                }
            }
        }
    }

    // The reconciler tolerates partial failure, but aborts when the
    // generator layer produced no candidate set at all
    if !any_generator_succeeded {
        return Err(errors
            .pop()
            .unwrap_or_else(|| Error::configuration("no generator produced parameters")));
    }

    let duplicates = drop_duplicate_names(&mut apps);
    // Stable by-name order on top of generation order
    apps.sort_by(|a, b| {
        (a.namespace().unwrap_or_default(), a.name_any())
            .cmp(&(b.namespace().unwrap_or_default(), b.name_any()))
    });

    Ok(DesiredOutcome {
        apps,
        errors,
        duplicates,
        requeue_after,
    })
}

/// Merge a per-generator template fragment over the global template.
/// Fragment fields win; empty fragment fields never erase the base.
fn merge_templates(
    base: &ApplicationSetTemplate,
    fragment: &ApplicationSetTemplate,
) -> Result<ApplicationSetTemplate> {
    if fragment.is_empty() {
        return Ok(base.clone());
    }
    let mut merged = serde_json::to_value(base)
        .map_err(|e| Error::template_execute(format!("serializing template: {e}")))?;
    let overlay = serde_json::to_value(fragment)
        .map_err(|e| Error::template_execute(format!("serializing template fragment: {e}")))?;
    deep_merge(&mut merged, &overlay);
    serde_json::from_value(merged)
        .map_err(|e| Error::template_execute(format!("merged template is invalid: {e}")))
}

/// Default the namespace to the ApplicationSet's and stamp ownership.
fn finalize_metadata(app: &mut Application, app_set: &ApplicationSet) {
    if app.metadata.namespace.is_none() {
        app.metadata.namespace = app_set.namespace();
    }
    app.metadata.owner_references = Some(vec![owner_reference(app_set)]);
}

/// The controller owner reference every generated application carries.
pub fn owner_reference(app_set: &ApplicationSet) -> OwnerReference {
    OwnerReference {
        api_version: "argoproj.io/v1alpha1".to_string(),
        kind: "ApplicationSet".to_string(),
        name: app_set.name_any(),
        uid: app_set.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Drop later applications colliding on `(namespace, name)`; report the
/// dropped names.
fn drop_duplicate_names(apps: &mut Vec<Application>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut duplicates = Vec::new();
    apps.retain(|app| {
        let key = (app.namespace().unwrap_or_default(), app.name_any());
        if seen.contains(&key) {
            warn!(app = %key.1, "duplicate application name, dropping later occurrence");
            duplicates.push(key.1.clone());
            false
        } else {
            seen.insert(key);
            true
        }
    });
    duplicates
}

#[cfg(test)]
mod tests {
    use super::*;
    use appset_common::crd::{
        ApplicationSetSpec, ApplicationSetTemplateMeta, ApplicationSource, ApplicationSpec,
        GeneratorSpec, ListGenerator,
    };
    use appset_common::template::Render;
    use appset_generators::list::ListGeneratorImpl;
    use kube::core::ObjectMeta;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn registry() -> GeneratorRegistry {
        let mut registry: GeneratorRegistry = HashMap::new();
        registry.insert("List", Arc::new(ListGeneratorImpl::new()));
        registry
    }

    fn template(name: &str) -> ApplicationSetTemplate {
        ApplicationSetTemplate {
            metadata: ApplicationSetTemplateMeta {
                name: name.to_string(),
                ..Default::default()
            },
            spec: ApplicationSpec {
                project: "default".to_string(),
                source: Some(ApplicationSource {
                    repo_url: "https://github.com/example/apps.git".to_string(),
                    path: "{{cluster}}".to_string(),
                    target_revision: "HEAD".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            },
        }
    }

    fn app_set_with(
        elements: Vec<serde_json::Value>,
        template: ApplicationSetTemplate,
    ) -> ApplicationSet {
        let mut app_set = ApplicationSet::new(
            "test-app-set",
            ApplicationSetSpec {
                generators: vec![GeneratorSpec {
                    list: Some(ListGenerator {
                        elements,
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                template,
                ..Default::default()
            },
        );
        app_set.metadata = ObjectMeta {
            name: Some("test-app-set".to_string()),
            namespace: Some("argocd".to_string()),
            uid: Some("uid-1234".to_string()),
            ..app_set.metadata
        };
        app_set
    }

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn renders_one_application_per_parameter_map() {
        let app_set = app_set_with(
            vec![json!({"cluster": "dev"}), json!({"cluster": "prod"})],
            template("{{cluster}}-app"),
        );

        let outcome = generate_desired(&app_set, &registry(), &Render::new(), TIMEOUT)
            .await
            .unwrap();

        assert_eq!(outcome.apps.len(), 2);
        assert!(outcome.errors.is_empty());
        assert_eq!(outcome.apps[0].metadata.name.as_deref(), Some("dev-app"));
        assert_eq!(outcome.apps[1].metadata.name.as_deref(), Some("prod-app"));
        assert_eq!(
            outcome.apps[0].spec.source.as_ref().unwrap().path,
            "dev"
        );
    }

    #[tokio::test]
    async fn applications_default_to_the_appset_namespace_and_are_owned() {
        let app_set = app_set_with(vec![json!({"cluster": "dev"})], template("{{cluster}}"));
        let outcome = generate_desired(&app_set, &registry(), &Render::new(), TIMEOUT)
            .await
            .unwrap();

        let app = &outcome.apps[0];
        assert_eq!(app.metadata.namespace.as_deref(), Some("argocd"));
        let owner = &app.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.kind, "ApplicationSet");
        assert_eq!(owner.name, "test-app-set");
        assert_eq!(owner.uid, "uid-1234");
        assert_eq!(owner.controller, Some(true));
    }

    #[tokio::test]
    async fn output_is_sorted_by_rendered_name() {
        let app_set = app_set_with(
            vec![
                json!({"cluster": "zeta"}),
                json!({"cluster": "alpha"}),
                json!({"cluster": "mid"}),
            ],
            template("{{cluster}}"),
        );
        let outcome = generate_desired(&app_set, &registry(), &Render::new(), TIMEOUT)
            .await
            .unwrap();
        let names: Vec<_> = outcome.apps.iter().map(|a| a.name_any()).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[tokio::test]
    async fn duplicate_names_keep_the_first_occurrence() {
        let app_set = app_set_with(
            vec![
                json!({"cluster": "same", "order": "first"}),
                json!({"cluster": "same", "order": "second"}),
            ],
            {
                let mut t = template("{{cluster}}");
                t.spec.source.as_mut().unwrap().path = "{{order}}".to_string();
                t
            },
        );

        let outcome = generate_desired(&app_set, &registry(), &Render::new(), TIMEOUT)
            .await
            .unwrap();

        assert_eq!(outcome.apps.len(), 1);
        assert_eq!(outcome.duplicates, vec!["same".to_string()]);
        assert_eq!(outcome.apps[0].spec.source.as_ref().unwrap().path, "first");
    }

    #[tokio::test]
    async fn unrenderable_parameter_maps_are_skipped_not_fatal() {
        // Empty rendered name: the template only resolves for maps carrying
        // `cluster`
        let app_set = app_set_with(
            vec![json!({"other": "x"}), json!({"cluster": "ok"})],
            {
                let mut t = template("{{cluster}}");
                // an unresolved name placeholder renders literally, so use a
                // template that renders empty instead: a literal empty name
                t.metadata.name = String::new();
                t
            },
        );

        let outcome = generate_desired(&app_set, &registry(), &Render::new(), TIMEOUT)
            .await
            .unwrap();
        // both maps fail (empty name), but the set itself survives
        assert!(outcome.apps.is_empty());
        assert_eq!(outcome.errors.len(), 2);
    }

    #[tokio::test]
    async fn unrecognized_generator_alone_aborts_the_set() {
        let mut app_set = app_set_with(vec![], template("x"));
        app_set.spec.generators = vec![GeneratorSpec::default()];

        let err = generate_desired(&app_set, &registry(), &Render::new(), TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EmptyGenerator));
    }

    #[tokio::test]
    async fn per_generator_template_fragment_overrides_fields() {
        let mut app_set = app_set_with(vec![], template("{{cluster}}"));
        app_set.spec.generators = vec![GeneratorSpec {
            list: Some(ListGenerator {
                elements: vec![json!({"cluster": "dev"})],
                template: ApplicationSetTemplate {
                    spec: ApplicationSpec {
                        project: "override".to_string(),
                        ..Default::default()
                    },
                    ..Default::default()
                },
            }),
            ..Default::default()
        }];

        let outcome = generate_desired(&app_set, &registry(), &Render::new(), TIMEOUT)
            .await
            .unwrap();
        let app = &outcome.apps[0];
        // Fragment wins on project, base fields survive
        assert_eq!(app.spec.project, "override");
        assert_eq!(
            app.spec.source.as_ref().unwrap().repo_url,
            "https://github.com/example/apps.git"
        );
    }

    #[tokio::test]
    async fn requeue_is_the_minimum_over_generators() {
        let app_set = app_set_with(vec![json!({"cluster": "dev"})], template("{{cluster}}"));
        let outcome = generate_desired(&app_set, &registry(), &Render::new(), TIMEOUT)
            .await
            .unwrap();
        // Only a list generator: identity element
        assert_eq!(outcome.requeue_after, NO_REQUEUE_AFTER);
    }
}
