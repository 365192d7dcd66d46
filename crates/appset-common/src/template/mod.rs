//! Template rendering for generated applications
//!
//! A parameter map plus an application template produce one concrete
//! [`Application`]. Substitution runs over the JSON-serialised template so
//! replacement values land with proper JSON escaping, then the result is
//! deserialised back into a typed object. Two dialects exist and the
//! caller selects one:
//!
//! - **flat** (default, legacy): `{{ key }}` string substitution, see
//!   [`flat`]
//! - **structured**: expression language with dotted paths, conditionals,
//!   ranges and helpers, see [`structured`]
//!
//! After substitution the renderer injects the resources finalizer unless
//! the sync policy preserves resources on deletion or the template already
//! carries finalizers.

mod flat;
mod structured;

pub use flat::{is_structured_template, replace_legacy_flat};
pub use structured::StructuredEngine;

use kube::core::ObjectMeta;

use crate::crd::{
    Application, ApplicationSetSyncPolicy, ApplicationSetTemplate, ParamMap, TemplateDialect,
};
use crate::error::Error;
use crate::{Result, RESOURCES_FINALIZER};

/// Renders templates and template fragments with parameter maps.
///
/// Generators use [`replace`](Renderer::replace) for spec interpolation;
/// the reconciler uses
/// [`render_template_params`](Renderer::render_template_params) to
/// materialise applications.
pub trait Renderer: Send + Sync {
    /// Render the application template with one parameter map.
    fn render_template_params(
        &self,
        template: &ApplicationSetTemplate,
        sync_policy: Option<&ApplicationSetSyncPolicy>,
        params: &ParamMap,
        dialect: TemplateDialect,
    ) -> Result<Application>;

    /// Substitute parameters into an arbitrary text (e.g. a serialised
    /// generator spec during matrix interpolation).
    fn replace(&self, text: &str, params: &ParamMap, dialect: TemplateDialect) -> Result<String>;
}

/// Production renderer
pub struct Render {
    structured: StructuredEngine,
}

impl Default for Render {
    fn default() -> Self {
        Self::new()
    }
}

impl Render {
    /// Create a renderer with a fresh structured-dialect engine.
    pub fn new() -> Self {
        Self {
            structured: StructuredEngine::new(),
        }
    }
}

impl Renderer for Render {
    fn render_template_params(
        &self,
        template: &ApplicationSetTemplate,
        sync_policy: Option<&ApplicationSetSyncPolicy>,
        params: &ParamMap,
        dialect: TemplateDialect,
    ) -> Result<Application> {
        let app = application_from_template(template);
        let serialized = serde_json::to_string(&app)
            .map_err(|e| Error::template_execute(format!("serializing template: {e}")))?;

        let rendered = match dialect {
            TemplateDialect::Flat => flat::substitute(&serialized, params, true),
            TemplateDialect::Structured => self.structured.render(&serialized, params)?,
        };

        let mut app: Application = serde_json::from_str(&rendered)
            .map_err(|e| Error::template_unmarshal(e.to_string()))?;

        inject_finalizer(&mut app, sync_policy);

        let name = app.metadata.name.as_deref().unwrap_or_default();
        if name.is_empty() {
            return Err(Error::invalid_target(
                "rendered application has an empty name",
            ));
        }

        Ok(app)
    }

    fn replace(&self, text: &str, params: &ParamMap, dialect: TemplateDialect) -> Result<String> {
        match dialect {
            TemplateDialect::Flat => Ok(flat::substitute(text, params, false)),
            TemplateDialect::Structured => self.structured.render(text, params),
        }
    }
}

/// Build the unrendered application object from a template.
fn application_from_template(template: &ApplicationSetTemplate) -> Application {
    let meta = &template.metadata;
    let mut app = Application::new(&meta.name, template.spec.clone());
    app.metadata = ObjectMeta {
        name: Some(meta.name.clone()),
        namespace: (!meta.namespace.is_empty()).then(|| meta.namespace.clone()),
        labels: (!meta.labels.is_empty()).then(|| meta.labels.clone()),
        annotations: (!meta.annotations.is_empty()).then(|| meta.annotations.clone()),
        finalizers: (!meta.finalizers.is_empty()).then(|| meta.finalizers.clone()),
        ..Default::default()
    };
    app
}

/// Add the resources finalizer when the sync policy does not preserve
/// resources and the rendered application carries no finalizers of its
/// own. User-specified finalizers are always kept verbatim. Idempotent.
fn inject_finalizer(app: &mut Application, sync_policy: Option<&ApplicationSetSyncPolicy>) {
    let preserve = sync_policy
        .map(|p| p.preserve_resources_on_deletion)
        .unwrap_or(false);
    let has_finalizers = app
        .metadata
        .finalizers
        .as_ref()
        .map(|f| !f.is_empty())
        .unwrap_or(false);

    if !preserve && !has_finalizers {
        app.metadata.finalizers = Some(vec![RESOURCES_FINALIZER.to_string()]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ApplicationSetTemplateMeta, ApplicationSource, ApplicationSpec};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn params(value: serde_json::Value) -> ParamMap {
        value.as_object().expect("test params must be an object").clone()
    }

    fn template(name: &str, path: &str) -> ApplicationSetTemplate {
        ApplicationSetTemplate {
            metadata: ApplicationSetTemplateMeta {
                name: name.to_string(),
                ..Default::default()
            },
            spec: ApplicationSpec {
                project: "default".to_string(),
                source: Some(ApplicationSource {
                    repo_url: "https://github.com/example/apps.git".to_string(),
                    path: path.to_string(),
                    target_revision: "HEAD".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            },
        }
    }

    #[test]
    fn flat_dialect_substitutes_into_spec_fields() {
        let render = Render::new();
        let app = render
            .render_template_params(
                &template("{{cluster}}-app", "{{one}}{{three}}"),
                None,
                &params(json!({"cluster": "prod", "one": "two", "three": "four"})),
                TemplateDialect::Flat,
            )
            .unwrap();

        assert_eq!(app.metadata.name.as_deref(), Some("prod-app"));
        assert_eq!(app.spec.source.as_ref().unwrap().path, "twofour");
    }

    #[test]
    fn flat_dialect_leaves_unknown_placeholders_literal() {
        let render = Render::new();
        let app = render
            .render_template_params(
                &template("app", "{{two}}"),
                None,
                &params(json!({"one": "two"})),
                TemplateDialect::Flat,
            )
            .unwrap();
        assert_eq!(app.spec.source.as_ref().unwrap().path, "{{two}}");
    }

    #[test]
    fn values_with_quotes_survive_the_json_round_trip() {
        let render = Render::new();
        let app = render
            .render_template_params(
                &template("app", "{{v}}"),
                None,
                &params(json!({"v": "a\"b\\c"})),
                TemplateDialect::Flat,
            )
            .unwrap();
        assert_eq!(app.spec.source.as_ref().unwrap().path, "a\"b\\c");
    }

    #[test]
    fn structured_dialect_renders_conditionals() {
        let render = Render::new();
        let app = render
            .render_template_params(
                &template(
                    "app",
                    "{{ if .hpa.enabled }}{{ .hpa.maxReplicas }}{{ else }}{{ .replicas }}{{ end }}",
                ),
                None,
                &params(json!({"hpa": {"enabled": false}, "replicas": 3})),
                TemplateDialect::Structured,
            )
            .unwrap();
        assert_eq!(app.spec.source.as_ref().unwrap().path, "3");
    }

    #[test]
    fn structured_helper_string_arguments_survive_json_escaping() {
        // Inside the JSON-serialised template the quotes of helper string
        // arguments arrive escaped; they must still parse
        let render = Render::new();
        let app = render
            .render_template_params(
                &template("app", r#"{{ ternary "big" "small" .wide }}"#),
                None,
                &params(json!({"wide": true})),
                TemplateDialect::Structured,
            )
            .unwrap();
        assert_eq!(app.spec.source.as_ref().unwrap().path, "big");
    }

    #[test]
    fn finalizer_added_without_sync_policy() {
        let render = Render::new();
        let app = render
            .render_template_params(
                &template("app", "guestbook"),
                None,
                &params(json!({})),
                TemplateDialect::Flat,
            )
            .unwrap();
        assert_eq!(
            app.metadata.finalizers,
            Some(vec![RESOURCES_FINALIZER.to_string()])
        );
    }

    #[test]
    fn finalizer_added_when_preserve_is_false() {
        let render = Render::new();
        let policy = ApplicationSetSyncPolicy {
            preserve_resources_on_deletion: false,
        };
        let app = render
            .render_template_params(
                &template("app", "guestbook"),
                Some(&policy),
                &params(json!({})),
                TemplateDialect::Flat,
            )
            .unwrap();
        assert_eq!(
            app.metadata.finalizers,
            Some(vec![RESOURCES_FINALIZER.to_string()])
        );
    }

    #[test]
    fn finalizer_not_added_when_preserving_resources() {
        let render = Render::new();
        let policy = ApplicationSetSyncPolicy {
            preserve_resources_on_deletion: true,
        };
        let app = render
            .render_template_params(
                &template("app", "guestbook"),
                Some(&policy),
                &params(json!({})),
                TemplateDialect::Flat,
            )
            .unwrap();
        assert!(app.metadata.finalizers.is_none());
    }

    #[test]
    fn user_finalizers_are_preserved_verbatim() {
        let render = Render::new();
        let mut tmpl = template("app", "guestbook");
        tmpl.metadata.finalizers = vec!["my.example.com/custom".to_string()];

        // Preserved with preserve=true
        let policy = ApplicationSetSyncPolicy {
            preserve_resources_on_deletion: true,
        };
        let app = render
            .render_template_params(
                &tmpl,
                Some(&policy),
                &params(json!({})),
                TemplateDialect::Flat,
            )
            .unwrap();
        assert_eq!(
            app.metadata.finalizers,
            Some(vec!["my.example.com/custom".to_string()])
        );

        // And user finalizers suppress the default one too
        let app = render
            .render_template_params(&tmpl, None, &params(json!({})), TemplateDialect::Flat)
            .unwrap();
        assert_eq!(
            app.metadata.finalizers,
            Some(vec!["my.example.com/custom".to_string()])
        );
    }

    #[test]
    fn finalizer_injection_is_idempotent() {
        let render = Render::new();
        let app = render
            .render_template_params(
                &template("app", "guestbook"),
                None,
                &params(json!({})),
                TemplateDialect::Flat,
            )
            .unwrap();

        // Render a template that already carries the injected finalizer:
        // the set must not grow
        let mut tmpl = template("app", "guestbook");
        tmpl.metadata.finalizers = app.metadata.finalizers.clone().unwrap();
        let again = render
            .render_template_params(&tmpl, None, &params(json!({})), TemplateDialect::Flat)
            .unwrap();
        assert_eq!(again.metadata.finalizers, app.metadata.finalizers);
    }

    #[test]
    fn empty_rendered_name_is_an_invalid_target() {
        let render = Render::new();
        let err = render
            .render_template_params(
                &template("", "guestbook"),
                None,
                &params(json!({})),
                TemplateDialect::Flat,
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTarget { .. }), "got {err:?}");
    }

    #[test]
    fn unresolved_name_placeholder_renders_but_is_kept() {
        // An unresolved name placeholder is historical flat behaviour: the
        // literal braces remain in the name; the caller's uniqueness pass
        // then treats identical failures as duplicates
        let render = Render::new();
        let app = render
            .render_template_params(
                &template("{{missing}}", "guestbook"),
                None,
                &params(json!({})),
                TemplateDialect::Flat,
            )
            .unwrap();
        assert_eq!(app.metadata.name.as_deref(), Some("{{missing}}"));
    }

    #[test]
    fn labels_and_annotations_are_rendered() {
        let render = Render::new();
        let mut tmpl = template("{{name}}", "guestbook");
        tmpl.metadata.labels =
            BTreeMap::from([("env".to_string(), "{{env}}".to_string())]);
        tmpl.metadata.annotations =
            BTreeMap::from([("team".to_string(), "{{team}}".to_string())]);

        let app = render
            .render_template_params(
                &tmpl,
                None,
                &params(json!({"name": "web", "env": "prod", "team": "platform"})),
                TemplateDialect::Flat,
            )
            .unwrap();

        assert_eq!(
            app.metadata.labels.as_ref().unwrap().get("env"),
            Some(&"prod".to_string())
        );
        assert_eq!(
            app.metadata.annotations.as_ref().unwrap().get("team"),
            Some(&"platform".to_string())
        );
    }

    #[test]
    fn replace_interpolates_serialized_specs() {
        let render = Render::new();
        let spec_json = r#"{"selector":{"matchLabels":{"environment":"{{path.basename}}"}}}"#;
        let out = render
            .replace(
                spec_json,
                &params(json!({"path": {"basename": "dev"}})),
                TemplateDialect::Flat,
            )
            .unwrap();
        assert_eq!(
            out,
            r#"{"selector":{"matchLabels":{"environment":"dev"}}}"#
        );
    }

    #[test]
    fn replace_structured_dialect() {
        let render = Render::new();
        let out = render
            .replace(
                "{{ .path.basename }}",
                &params(json!({"path": {"basename": "dev"}})),
                TemplateDialect::Structured,
            )
            .unwrap();
        assert_eq!(out, "dev");
    }
}
