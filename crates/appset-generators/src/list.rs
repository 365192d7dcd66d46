//! List generator: literal parameter elements from the spec
//!
//! The simplest generator: each element of `list.elements` is a JSON
//! object that becomes one parameter map verbatim. A malformed element is
//! fatal for that element only: it is logged and skipped, the rest of the
//! list proceeds. No external I/O, so it never asks for a requeue.

use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use appset_common::crd::{ApplicationSet, ApplicationSetTemplate, GeneratorSpec, ParamMap};
use appset_common::{Error, Result};

use crate::{Generator, NO_REQUEUE_AFTER};

/// Literal list generator
#[derive(Default)]
pub struct ListGeneratorImpl;

impl ListGeneratorImpl {
    /// Create a new list generator.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Generator for ListGeneratorImpl {
    async fn generate_params(
        &self,
        spec: &GeneratorSpec,
        _app_set: &ApplicationSet,
    ) -> Result<Vec<ParamMap>> {
        let list = spec.list.as_ref().ok_or(Error::EmptyGenerator)?;

        let mut params = Vec::with_capacity(list.elements.len());
        for (index, element) in list.elements.iter().enumerate() {
            match element.as_object() {
                Some(map) => params.push(map.clone()),
                None => {
                    let err = Error::malformed_element(
                        index,
                        format!("expected a JSON object, got {element}"),
                    );
                    warn!(error = %err, "skipping malformed list element");
                }
            }
        }
        Ok(params)
    }

    fn get_template(&self, spec: &GeneratorSpec) -> Option<ApplicationSetTemplate> {
        spec.list.as_ref().map(|list| list.template.clone())
    }

    fn get_requeue_after(&self, _spec: &GeneratorSpec) -> Duration {
        NO_REQUEUE_AFTER
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use appset_common::crd::ListGenerator;
    use serde_json::json;

    fn spec(elements: Vec<serde_json::Value>) -> GeneratorSpec {
        GeneratorSpec {
            list: Some(ListGenerator {
                elements,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn app_set() -> ApplicationSet {
        ApplicationSet::new("test", Default::default())
    }

    #[tokio::test]
    async fn elements_become_parameter_maps_in_order() {
        let generator = ListGeneratorImpl::new();
        let params = generator
            .generate_params(
                &spec(vec![
                    json!({"cluster": "engineering-dev", "url": "https://1.2.3.4"}),
                    json!({"cluster": "engineering-prod", "url": "https://2.4.6.8"}),
                ]),
                &app_set(),
            )
            .await
            .unwrap();

        assert_eq!(params.len(), 2);
        assert_eq!(params[0]["cluster"], "engineering-dev");
        assert_eq!(params[1]["url"], "https://2.4.6.8");
    }

    #[tokio::test]
    async fn nested_values_pass_through() {
        let generator = ListGeneratorImpl::new();
        let params = generator
            .generate_params(
                &spec(vec![json!({"values": {"revision": "HEAD"}, "replicas": 3})]),
                &app_set(),
            )
            .await
            .unwrap();
        assert_eq!(params[0]["values"]["revision"], "HEAD");
        assert_eq!(params[0]["replicas"], 3);
    }

    #[tokio::test]
    async fn malformed_element_is_skipped_and_others_proceed() {
        let generator = ListGeneratorImpl::new();
        let params = generator
            .generate_params(
                &spec(vec![
                    json!({"a": 1}),
                    json!("just a string"),
                    json!({"b": 2}),
                ]),
                &app_set(),
            )
            .await
            .unwrap();
        assert_eq!(params.len(), 2);
        assert_eq!(params[0]["a"], 1);
        assert_eq!(params[1]["b"], 2);
    }

    #[tokio::test]
    async fn all_elements_malformed_yields_an_empty_set() {
        let generator = ListGeneratorImpl::new();
        let params = generator
            .generate_params(&spec(vec![json!("x"), json!(3)]), &app_set())
            .await
            .unwrap();
        assert!(params.is_empty());
    }

    #[tokio::test]
    async fn missing_variant_is_an_empty_generator() {
        let generator = ListGeneratorImpl::new();
        let err = generator
            .generate_params(&GeneratorSpec::default(), &app_set())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EmptyGenerator));
    }

    #[test]
    fn never_requeues() {
        let generator = ListGeneratorImpl::new();
        assert_eq!(generator.get_requeue_after(&spec(vec![])), NO_REQUEUE_AFTER);
    }

    #[test]
    fn exposes_its_template_fragment() {
        let generator = ListGeneratorImpl::new();
        let spec = spec(vec![]);
        assert!(generator.get_template(&spec).is_some());
        assert!(generator.get_template(&GeneratorSpec::default()).is_none());
    }
}
