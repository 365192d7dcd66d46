//! Common types for the appset controller: CRDs, errors, templating, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod telemetry;
pub mod template;
pub mod utils;
pub mod validation;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Finalizer added to generated applications so that their managed resources
/// are cleaned up before the application object disappears
pub const RESOURCES_FINALIZER: &str = "resources-finalizer.argocd.argoproj.io";

/// Label identifying a Secret as a cluster-connection secret
pub const CLUSTER_SECRET_TYPE_LABEL: &str = "argocd.argoproj.io/secret-type";

/// Value of [`CLUSTER_SECRET_TYPE_LABEL`] for cluster secrets
pub const CLUSTER_SECRET_TYPE_CLUSTER: &str = "cluster";

/// Annotation kubectl maintains with the last client-side applied configuration.
/// Used only to recover the names of unrecognized generators.
pub const LAST_APPLIED_CONFIG_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// Field manager name used for all server-side apply operations
pub const FIELD_MANAGER: &str = "appset-controller";
