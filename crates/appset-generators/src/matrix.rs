//! Matrix generator: cartesian product of two child generators
//!
//! The second child's spec is interpolated with each parameter map from
//! the first child before it runs, which is what lets the second generator
//! depend on the first (e.g. a cluster selector using `{{path.basename}}`
//! from a git scan). Interpolation is two-pass: render the serialised spec
//! with the first map as parameters, then deserialise into a fresh spec.
//! The child spec is never mutated in place.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use appset_common::crd::{
    ApplicationSet, ApplicationSetTemplate, GeneratorSpec, NestedGeneratorSpec, ParamMap,
    TemplateDialect,
};
use appset_common::template::Renderer;
use appset_common::{Error, Result};

use crate::{generator_for, Generator, GeneratorRegistry, NO_REQUEUE_AFTER};

/// Cartesian-product composite generator
pub struct MatrixGeneratorImpl {
    children: Arc<GeneratorRegistry>,
    renderer: Arc<dyn Renderer>,
}

impl MatrixGeneratorImpl {
    /// Create a matrix generator dispatching children through `children`.
    pub fn new(children: Arc<GeneratorRegistry>, renderer: Arc<dyn Renderer>) -> Self {
        Self { children, renderer }
    }

    /// Render the serialised child spec with one parameter map and
    /// deserialise the result into a fresh spec.
    fn interpolate(
        &self,
        nested: &NestedGeneratorSpec,
        params: &ParamMap,
        dialect: TemplateDialect,
    ) -> Result<NestedGeneratorSpec> {
        let serialized = serde_json::to_string(nested)
            .map_err(|e| Error::template_execute(format!("serializing child spec: {e}")))?;
        let rendered = self.renderer.replace(&serialized, params, dialect)?;
        serde_json::from_str(&rendered).map_err(|e| {
            Error::template_unmarshal(format!("interpolated child spec is invalid: {e}"))
        })
    }
}

/// Validate a nested generator and widen it for dispatch.
fn child_spec(nested: &NestedGeneratorSpec) -> Result<GeneratorSpec> {
    let spec = nested.to_generator_spec();
    match spec.populated_count() {
        0 => Err(Error::EmptyGenerator),
        1 => Ok(spec),
        _ => Err(Error::MoreThanOneInnerGenerators),
    }
}

/// Check the two-child arity shared by Matrix and Merge.
pub(crate) fn check_arity(children: &[NestedGeneratorSpec]) -> Result<()> {
    match children.len() {
        0 | 1 => Err(Error::LessThanTwoGenerators),
        2 => Ok(()),
        _ => Err(Error::MoreThanTwoGenerators),
    }
}

#[async_trait]
impl Generator for MatrixGeneratorImpl {
    async fn generate_params(
        &self,
        spec: &GeneratorSpec,
        app_set: &ApplicationSet,
    ) -> Result<Vec<ParamMap>> {
        let matrix = spec.matrix.as_ref().ok_or(Error::EmptyGenerator)?;
        check_arity(&matrix.generators)?;

        let first = child_spec(&matrix.generators[0])?;
        // Validate the second child's shape before doing any work
        child_spec(&matrix.generators[1])?;

        let first_params = generator_for(&self.children, &first)?
            .generate_params(&first, app_set)
            .await?;

        let dialect = app_set.spec.dialect;
        let mut combined = Vec::new();
        for a in &first_params {
            let interpolated = self.interpolate(&matrix.generators[1], a, dialect)?;
            let second = child_spec(&interpolated)?;
            let second_params = generator_for(&self.children, &second)?
                .generate_params(&second, app_set)
                .await?;

            'pairs: for b in &second_params {
                let mut merged = a.clone();
                for (key, value) in b {
                    if merged.contains_key(key) {
                        // Never let one side silently overwrite the other
                        warn!(
                            key,
                            "matrix children produced the same parameter key, skipping pair"
                        );
                        continue 'pairs;
                    }
                    merged.insert(key.clone(), value.clone());
                }
                combined.push(merged);
            }
        }
        Ok(combined)
    }

    fn get_template(&self, spec: &GeneratorSpec) -> Option<ApplicationSetTemplate> {
        spec.matrix.as_ref().map(|m| m.template.clone())
    }

    fn get_requeue_after(&self, spec: &GeneratorSpec) -> Duration {
        let Some(matrix) = spec.matrix.as_ref() else {
            return NO_REQUEUE_AFTER;
        };

        let mut requeue = NO_REQUEUE_AFTER;
        for nested in &matrix.generators {
            let Ok(child) = child_spec(nested) else {
                continue;
            };
            if let Ok(generator) = generator_for(&self.children, &child) {
                requeue = requeue.min(generator.get_requeue_after(&child));
            }
        }
        requeue
    }
}
