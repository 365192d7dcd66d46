//! Parameter generators for the appset controller
//!
//! A generator turns one generator spec into a sequence of parameter maps.
//! Leaf generators (List, Git, Clusters, SCMProvider, PullRequest,
//! ClusterDecisionResource, Plugin) produce parameters directly; composite
//! generators (Matrix, Merge) combine the output of two leaves. The
//! reconciler reaches every generator through the [`GeneratorRegistry`],
//! which dispatches on the single populated variant of a spec.

#![deny(missing_docs)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use appset_common::crd::{ApplicationSet, ApplicationSetTemplate, GeneratorSpec, ParamMap};
use appset_common::{Error, Result};

pub mod cluster;
pub mod cluster_decision;
pub mod git;
pub mod list;
pub mod matrix;
pub mod merge;
pub mod plugin;
pub mod pull_request;
pub mod registry;
pub mod scm;

pub use registry::build_registry;

/// Sentinel requeue duration meaning "never recheck on a timer".
///
/// It is the identity element of the min-fold composites perform over
/// their children's requeue durations.
pub const NO_REQUEUE_AFTER: Duration = Duration::MAX;

/// A producer of parameter maps.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Generator: Send + Sync {
    /// Produce one parameter map per generated application.
    async fn generate_params(
        &self,
        spec: &GeneratorSpec,
        app_set: &ApplicationSet,
    ) -> Result<Vec<ParamMap>>;

    /// The per-generator template fragment, merged over the
    /// ApplicationSet's global template by the reconciler.
    fn get_template(&self, spec: &GeneratorSpec) -> Option<ApplicationSetTemplate>;

    /// How soon the reconciler should recheck this generator.
    /// [`NO_REQUEUE_AFTER`] means never.
    fn get_requeue_after(&self, spec: &GeneratorSpec) -> Duration;
}

/// Uniform dispatch table from variant name to generator implementation,
/// injected at start-up.
pub type GeneratorRegistry = HashMap<&'static str, Arc<dyn Generator>>;

/// Route a generator spec to the registered implementation for its single
/// populated variant.
///
/// A spec with zero populated variants is unrecognised
/// ([`Error::EmptyGenerator`]); a variant without a registered
/// implementation is a configuration error.
pub fn generator_for<'a>(
    registry: &'a GeneratorRegistry,
    spec: &GeneratorSpec,
) -> Result<&'a Arc<dyn Generator>> {
    let variant = spec.variant().ok_or(Error::EmptyGenerator)?;
    registry.get(variant.name()).ok_or_else(|| {
        Error::configuration(format!(
            "no generator registered for variant {}",
            variant.name()
        ))
    })
}
