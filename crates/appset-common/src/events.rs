//! Kubernetes Event recording for the controller.
//!
//! Provides a trait-based abstraction over `kube::runtime::events::Recorder`
//! so the reconciler can emit standard Kubernetes Events visible via
//! `kubectl describe` and `kubectl get events`.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
///
/// Implementations are expected to be fire-and-forget: `publish()` logs a
/// warning on failure but never returns an error.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    client: Client,
    reporter: Reporter,
}

impl KubeEventPublisher {
    /// Create a new publisher for the given controller name.
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: None,
        };
        Self { client, reporter }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        let recorder =
            Recorder::new(self.client.clone(), self.reporter.clone(), resource_ref.clone());
        if let Err(e) = recorder.publish(event).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// No-op implementation for tests.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
        // intentionally empty
    }
}

/// Well-known event reason strings.
pub mod reasons {
    /// A generated application was created
    pub const APPLICATION_CREATED: &str = "ApplicationCreated";
    /// A generated application was updated to match the template
    pub const APPLICATION_UPDATED: &str = "ApplicationUpdated";
    /// A live application left the desired set and was deleted
    pub const APPLICATION_DELETED: &str = "ApplicationDeleted";
    /// A live application was orphaned instead of deleted
    pub const APPLICATION_ORPHANED: &str = "ApplicationOrphaned";
    /// A generator failed to produce parameters
    pub const GENERATION_FAILED: &str = "GenerationFailed";
    /// A parameter map failed to render into an application
    pub const RENDER_FAILED: &str = "RenderFailed";
    /// Two parameter maps rendered to the same application name
    pub const DUPLICATE_NAME: &str = "DuplicateApplicationName";
    /// A RollingSync step failed to stabilise within its budget
    pub const ROLLOUT_STALLED: &str = "RolloutStalled";
}

/// Well-known event action strings.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Applying the desired application set
    pub const APPLY: &str = "Apply";
    /// Stepping a RollingSync rollout
    pub const ROLLOUT: &str = "Rollout";
}
