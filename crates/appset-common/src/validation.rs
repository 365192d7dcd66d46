//! Detection of unrecognised generators
//!
//! The generator spec is "one of N nullable fields" on the wire, so a
//! generator key this controller does not know deserialises to a spec with
//! zero populated variants. The typed object cannot tell us what the
//! unknown key was; that is recovered from the
//! `kubectl.kubernetes.io/last-applied-configuration` annotation, which
//! preserves the user's raw input. Every failure mode degrades gracefully
//! to "invalid, but nameless".

use std::collections::BTreeSet;

use kube::ResourceExt;
use tracing::warn;

use crate::crd::ApplicationSet;
use crate::LAST_APPLIED_CONFIG_ANNOTATION;

/// Return whether the ApplicationSet contains invalid (zero-variant)
/// generators, along with the generator names recovered from the
/// last-applied-configuration annotation.
pub fn check_invalid_generators(app_set: &ApplicationSet) -> (bool, BTreeSet<String>) {
    let mut has_invalid = false;
    let mut names = BTreeSet::new();

    for (index, generator) in app_set.spec.generators.iter().enumerate() {
        if generator.variant().is_none() {
            has_invalid = true;
            if let Some(name) = invalid_generator_name(app_set, index) {
                names.insert(name);
            }
        }
    }

    (has_invalid, names)
}

/// Log a warning if the ApplicationSet contains unrecognised generators.
/// Returns the warning text for the caller to attach to a condition.
pub fn log_invalid_generators(app_set: &ApplicationSet) -> Option<String> {
    let (has_invalid, names) = check_invalid_generators(app_set);
    let message = invalid_generators_message(&app_set.name_any(), has_invalid, &names)?;
    warn!("{message}");
    Some(message)
}

/// Format the unrecognised-generator warning.
pub fn invalid_generators_message(
    name: &str,
    has_invalid: bool,
    invalid_names: &BTreeSet<String>,
) -> Option<String> {
    if !invalid_names.is_empty() {
        let joined = invalid_names
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join(", ");
        Some(format!(
            "ApplicationSet {name} contains unrecognized generators: {joined}"
        ))
    } else if has_invalid {
        Some(format!(
            "ApplicationSet {name} contains unrecognized generators"
        ))
    } else {
        None
    }
}

/// Recover the user-facing name of the generator at `index` from the
/// last-applied-configuration annotation: parse it as JSON, follow
/// `.spec.generators[index]`, report its first key.
fn invalid_generator_name(app_set: &ApplicationSet, index: usize) -> Option<String> {
    let config = app_set
        .metadata
        .annotations
        .as_ref()?
        .get(LAST_APPLIED_CONFIG_ANNOTATION)?;

    let values: serde_json::Value = match serde_json::from_str(config) {
        Ok(v) => v,
        Err(_) => {
            warn!("couldn't unmarshal {LAST_APPLIED_CONFIG_ANNOTATION} annotation");
            return None;
        }
    };

    let Some(generators) = values
        .get("spec")
        .and_then(|spec| spec.get("generators"))
        .and_then(|g| g.as_array())
    else {
        warn!("couldn't get spec.generators from {LAST_APPLIED_CONFIG_ANNOTATION} annotation");
        return None;
    };

    let Some(generator) = generators.get(index).and_then(|g| g.as_object()) else {
        warn!(
            index,
            len = generators.len(),
            "generator index out of range in {LAST_APPLIED_CONFIG_ANNOTATION} annotation"
        );
        return None;
    };

    generator.keys().next().cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ApplicationSetSpec, GeneratorSpec, GitGenerator, ListGenerator};
    use kube::core::ObjectMeta;
    use std::collections::BTreeMap;

    fn app_set_with(
        name: &str,
        generators: Vec<GeneratorSpec>,
        last_applied: Option<&str>,
    ) -> ApplicationSet {
        let mut app_set = ApplicationSet::new(
            name,
            ApplicationSetSpec {
                generators,
                ..Default::default()
            },
        );
        if let Some(config) = last_applied {
            app_set.metadata = ObjectMeta {
                name: Some(name.to_string()),
                annotations: Some(BTreeMap::from([(
                    LAST_APPLIED_CONFIG_ANNOTATION.to_string(),
                    config.to_string(),
                )])),
                ..Default::default()
            };
        }
        app_set
    }

    fn list_generator() -> GeneratorSpec {
        GeneratorSpec {
            list: Some(ListGenerator::default()),
            ..Default::default()
        }
    }

    fn git_generator() -> GeneratorSpec {
        GeneratorSpec {
            git: Some(GitGenerator {
                repo_url: "https://github.com/example/apps.git".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn all_valid_generators_pass() {
        let app_set = app_set_with("ok", vec![list_generator(), git_generator()], None);
        let (has_invalid, names) = check_invalid_generators(&app_set);
        assert!(!has_invalid);
        assert!(names.is_empty());
        assert_eq!(invalid_generators_message("ok", has_invalid, &names), None);
    }

    #[test]
    fn unrecognized_generators_are_named_from_the_annotation() {
        let last_applied = r#"{
            "spec": {
                "generators": [{"list":{}},{"bbb":{}},{"git":{}},{"aaa":{}}]
            }
        }"#;
        let app_set = app_set_with(
            "test-app-set",
            vec![
                list_generator(),
                GeneratorSpec::default(),
                git_generator(),
                GeneratorSpec::default(),
            ],
            Some(last_applied),
        );

        let (has_invalid, names) = check_invalid_generators(&app_set);
        assert!(has_invalid);
        assert_eq!(
            invalid_generators_message("test-app-set", has_invalid, &names).as_deref(),
            Some("ApplicationSet test-app-set contains unrecognized generators: aaa, bbb")
        );
    }

    #[test]
    fn malformed_annotation_degrades_to_nameless_warning() {
        let app_set = app_set_with(
            "broken",
            vec![GeneratorSpec::default()],
            Some("not json at all"),
        );
        let (has_invalid, names) = check_invalid_generators(&app_set);
        assert!(has_invalid);
        assert!(names.is_empty());
        assert_eq!(
            invalid_generators_message("broken", has_invalid, &names).as_deref(),
            Some("ApplicationSet broken contains unrecognized generators")
        );
    }

    #[test]
    fn missing_annotation_degrades_to_nameless_warning() {
        let app_set = app_set_with("no-annotation", vec![GeneratorSpec::default()], None);
        let (has_invalid, names) = check_invalid_generators(&app_set);
        assert!(has_invalid);
        assert!(names.is_empty());
    }

    #[test]
    fn out_of_range_index_degrades_gracefully() {
        // Annotation lists fewer generators than the spec carries
        let last_applied = r#"{"spec": {"generators": [{"list":{}}]}}"#;
        let app_set = app_set_with(
            "short",
            vec![list_generator(), GeneratorSpec::default()],
            Some(last_applied),
        );
        let (has_invalid, names) = check_invalid_generators(&app_set);
        assert!(has_invalid);
        assert!(names.is_empty());
    }

    #[test]
    fn annotation_without_spec_section_degrades_gracefully() {
        let app_set = app_set_with(
            "no-spec",
            vec![GeneratorSpec::default()],
            Some(r#"{"metadata": {}}"#),
        );
        let (has_invalid, names) = check_invalid_generators(&app_set);
        assert!(has_invalid);
        assert!(names.is_empty());
    }
}
