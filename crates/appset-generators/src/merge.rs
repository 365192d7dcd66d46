//! Merge generator: keyed join of two child generators
//!
//! A `mergeKeys` list names the fields forming the join key. The first
//! child is the base set; parameter maps from the second child are merged
//! over base maps sharing the same key, with the second child winning on
//! collisions (deep union). Maps missing any merge key are dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use appset_common::crd::{
    ApplicationSet, ApplicationSetTemplate, GeneratorSpec, MergeGenerator, ParamMap,
};
use appset_common::utils::deep_merge;
use appset_common::{Error, Result};

use crate::matrix::check_arity;
use crate::{generator_for, Generator, GeneratorRegistry, NO_REQUEUE_AFTER};

/// Keyed-join composite generator
pub struct MergeGeneratorImpl {
    children: Arc<GeneratorRegistry>,
}

impl MergeGeneratorImpl {
    /// Create a merge generator dispatching children through `children`.
    pub fn new(children: Arc<GeneratorRegistry>) -> Self {
        Self { children }
    }

    async fn child_params(
        &self,
        nested: &appset_common::crd::NestedGeneratorSpec,
        app_set: &ApplicationSet,
    ) -> Result<Vec<ParamMap>> {
        let spec = nested.to_generator_spec();
        match spec.populated_count() {
            0 => return Err(Error::EmptyGenerator),
            1 => {}
            _ => return Err(Error::MoreThanOneInnerGenerators),
        }
        generator_for(&self.children, &spec)?
            .generate_params(&spec, app_set)
            .await
    }
}

#[async_trait]
impl Generator for MergeGeneratorImpl {
    async fn generate_params(
        &self,
        spec: &GeneratorSpec,
        app_set: &ApplicationSet,
    ) -> Result<Vec<ParamMap>> {
        let merge = spec.merge.as_ref().ok_or(Error::EmptyGenerator)?;
        check_arity(&merge.generators)?;
        if merge.merge_keys.is_empty() {
            return Err(Error::configuration("merge generator requires mergeKeys"));
        }

        let base = self.child_params(&merge.generators[0], app_set).await?;
        let overlay = self.child_params(&merge.generators[1], app_set).await?;

        // Index the overlay side; a later map with the same key replaces an
        // earlier one, matching "later generators override earlier"
        let mut overlay_by_key: HashMap<String, ParamMap> = HashMap::new();
        for map in overlay {
            match merge_key(&map, &merge.merge_keys) {
                Some(key) => {
                    overlay_by_key.insert(key, map);
                }
                None => debug!("overlay parameter map is missing a merge key, dropped"),
            }
        }

        let mut result = Vec::new();
        for base_map in base {
            let Some(key) = merge_key(&base_map, &merge.merge_keys) else {
                debug!("base parameter map is missing a merge key, dropped");
                continue;
            };
            match overlay_by_key.get(&key) {
                Some(overlay_map) => {
                    let mut merged = Value::Object(base_map);
                    deep_merge(&mut merged, &Value::Object(overlay_map.clone()));
                    let Value::Object(merged) = merged else {
                        unreachable!("deep_merge of two objects yields an object");
                    };
                    result.push(merged);
                }
                None => result.push(base_map),
            }
        }
        Ok(result)
    }

    fn get_template(&self, spec: &GeneratorSpec) -> Option<ApplicationSetTemplate> {
        spec.merge.as_ref().map(|m| m.template.clone())
    }

    fn get_requeue_after(&self, spec: &GeneratorSpec) -> Duration {
        let Some(merge) = spec.merge.as_ref() else {
            return NO_REQUEUE_AFTER;
        };

        let mut requeue = NO_REQUEUE_AFTER;
        for nested in &merge.generators {
            let child = nested.to_generator_spec();
            if child.populated_count() != 1 {
                continue;
            }
            if let Ok(generator) = generator_for(&self.children, &child) {
                requeue = requeue.min(generator.get_requeue_after(&child));
            }
        }
        requeue
    }
}

/// Compose the join key for one parameter map, or `None` when any merge
/// key is absent.
fn merge_key(map: &ParamMap, merge_keys: &[String]) -> Option<String> {
    let mut parts = Vec::with_capacity(merge_keys.len());
    for key in merge_keys {
        parts.push(format!("{key}={}", map.get(key)?));
    }
    Some(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::list::ListGeneratorImpl;
    use appset_common::crd::{ListGenerator, NestedGeneratorSpec};
    use serde_json::json;

    fn list_nested(elements: Vec<serde_json::Value>) -> NestedGeneratorSpec {
        NestedGeneratorSpec {
            list: Some(ListGenerator {
                elements,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn merge_spec(generators: Vec<NestedGeneratorSpec>, keys: Vec<&str>) -> GeneratorSpec {
        GeneratorSpec {
            merge: Some(MergeGenerator {
                generators,
                merge_keys: keys.into_iter().map(String::from).collect(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn merge_generator() -> MergeGeneratorImpl {
        let mut registry: GeneratorRegistry = HashMap::new();
        registry.insert(
            "List",
            Arc::new(ListGeneratorImpl::new()) as Arc<dyn Generator>,
        );
        MergeGeneratorImpl::new(Arc::new(registry))
    }

    fn app_set() -> ApplicationSet {
        ApplicationSet::new("test", Default::default())
    }

    #[tokio::test]
    async fn joins_on_the_merge_key_with_overlay_winning() {
        let generator = merge_generator();
        let spec = merge_spec(
            vec![
                list_nested(vec![
                    json!({"cluster": "dev", "replicas": 1}),
                    json!({"cluster": "prod", "replicas": 1}),
                ]),
                list_nested(vec![json!({"cluster": "prod", "replicas": 5, "ha": true})]),
            ],
            vec!["cluster"],
        );

        let params = generator.generate_params(&spec, &app_set()).await.unwrap();
        assert_eq!(params.len(), 2);
        assert_eq!(params[0]["cluster"], "dev");
        assert_eq!(params[0]["replicas"], 1);
        assert_eq!(params[1]["cluster"], "prod");
        assert_eq!(params[1]["replicas"], 5);
        assert_eq!(params[1]["ha"], true);
    }

    #[tokio::test]
    async fn deep_union_merges_nested_maps() {
        let generator = merge_generator();
        let spec = merge_spec(
            vec![
                list_nested(vec![json!({
                    "cluster": "prod",
                    "values": {"region": "us-east-1", "tier": "free"}
                })]),
                list_nested(vec![json!({
                    "cluster": "prod",
                    "values": {"tier": "paid"}
                })]),
            ],
            vec!["cluster"],
        );

        let params = generator.generate_params(&spec, &app_set()).await.unwrap();
        assert_eq!(params[0]["values"]["region"], "us-east-1");
        assert_eq!(params[0]["values"]["tier"], "paid");
    }

    #[tokio::test]
    async fn maps_missing_a_merge_key_are_dropped() {
        let generator = merge_generator();
        let spec = merge_spec(
            vec![
                list_nested(vec![
                    json!({"cluster": "dev"}),
                    json!({"unrelated": true}),
                ]),
                list_nested(vec![json!({"no-key-here": 1})]),
            ],
            vec!["cluster"],
        );

        let params = generator.generate_params(&spec, &app_set()).await.unwrap();
        assert_eq!(params.len(), 1);
        assert_eq!(params[0]["cluster"], "dev");
    }

    #[tokio::test]
    async fn compound_merge_keys_require_every_field() {
        let generator = merge_generator();
        let spec = merge_spec(
            vec![
                list_nested(vec![
                    json!({"cluster": "dev", "region": "us", "v": 1}),
                    json!({"cluster": "dev", "region": "eu", "v": 1}),
                ]),
                list_nested(vec![json!({"cluster": "dev", "region": "eu", "v": 2})]),
            ],
            vec!["cluster", "region"],
        );

        let params = generator.generate_params(&spec, &app_set()).await.unwrap();
        assert_eq!(params.len(), 2);
        assert_eq!(params[0]["v"], 1);
        assert_eq!(params[1]["v"], 2);
    }

    #[tokio::test]
    async fn missing_merge_keys_config_is_an_error() {
        let generator = merge_generator();
        let spec = merge_spec(vec![list_nested(vec![]), list_nested(vec![])], vec![]);
        let err = generator.generate_params(&spec, &app_set()).await.unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[tokio::test]
    async fn arity_is_enforced() {
        let generator = merge_generator();
        let spec = merge_spec(vec![list_nested(vec![])], vec!["cluster"]);
        let err = generator.generate_params(&spec, &app_set()).await.unwrap_err();
        assert!(matches!(err, Error::LessThanTwoGenerators));
    }

    #[test]
    fn requeue_of_two_lists_is_the_identity() {
        let generator = merge_generator();
        let spec = merge_spec(vec![list_nested(vec![]), list_nested(vec![])], vec!["k"]);
        assert_eq!(generator.get_requeue_after(&spec), NO_REQUEUE_AFTER);
    }
}
