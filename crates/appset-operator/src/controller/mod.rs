//! ApplicationSet reconciliation
//!
//! One reconcile runs end-to-end for one ApplicationSet: validate, expand
//! generators into a desired set, diff against the live set selected by
//! owner reference, apply create/update/delete respecting the rollout
//! strategy and deletion policy, record status conditions, and schedule
//! the next pass at the fastest generator's cadence.

mod desired;
mod diff;
mod rollout;

pub use desired::{generate_desired, owner_reference, DesiredOutcome};
pub use diff::{plan, DiffPlan};
pub use rollout::{backoff_interval, plan_rollout, step_for_app, RolloutPlan};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument, warn};

use appset_common::crd::{
    Application, ApplicationSet, ApplicationSetCondition, ApplicationSetConditionType,
    ApplicationSetStatus, ConditionStatus, StrategyType,
};
use appset_common::events::{actions, reasons, EventPublisher};
use appset_common::template::Renderer;
use appset_common::validation::log_invalid_generators;
use appset_common::{Error, Result};
use appset_generators::{GeneratorRegistry, NO_REQUEUE_AFTER};

use crate::clients::AppsClient;
use crate::config::ControllerConfig;

/// Base health-poll interval while a RollingSync rollout is in flight;
/// the interval backs off exponentially from here while the active step
/// stays unsettled
const ROLLOUT_POLL_BASE: Duration = Duration::from_secs(10);

/// Ceiling for the rollout health-poll backoff
const ROLLOUT_POLL_CAP: Duration = Duration::from_secs(120);

/// Shared state for the reconcile loop
pub struct Context {
    /// Control-plane operations
    pub client: Arc<dyn AppsClient>,
    /// Generator dispatch table
    pub registry: Arc<GeneratorRegistry>,
    /// Template renderer
    pub renderer: Arc<dyn Renderer>,
    /// Kubernetes Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Operator tunables
    pub config: ControllerConfig,
}

/// Reconcile one ApplicationSet, bounded by the configured deadline.
///
/// On deadline expiry in-flight generator work is dropped, a `Cancelled`
/// condition is recorded best-effort, and the set is requeued; status is
/// not otherwise mutated.
pub async fn reconcile(app_set: Arc<ApplicationSet>, ctx: Arc<Context>) -> Result<Action> {
    let deadline = ctx.config.reconcile_deadline;
    match tokio::time::timeout(deadline, reconcile_inner(app_set.clone(), ctx.clone())).await {
        Ok(result) => result,
        Err(_) => {
            warn!(
                app_set = %app_set.name_any(),
                ?deadline,
                "reconcile deadline exceeded, requeueing"
            );
            let mut status = app_set.status.clone().unwrap_or_default();
            status.set_condition(ApplicationSetCondition::new(
                ApplicationSetConditionType::Cancelled,
                ConditionStatus::True,
                "DeadlineExceeded",
                format!("reconcile aborted after {deadline:?}"),
            ));
            if let Err(e) = patch_status(&ctx, &app_set, &status).await {
                warn!(error = %e, "failed to record Cancelled condition");
            }
            Ok(Action::requeue(Duration::from_secs(30)))
        }
    }
}

#[instrument(skip_all, fields(app_set = %app_set.name_any()))]
async fn reconcile_inner(app_set: Arc<ApplicationSet>, ctx: Arc<Context>) -> Result<Action> {
    // Deletion cascades through owner references; nothing to do here
    if app_set.metadata.deletion_timestamp.is_some() {
        debug!("ApplicationSet is being deleted");
        return Ok(Action::await_change());
    }

    let mut status = app_set.status.clone().unwrap_or_default();
    let mut soft_errors: Vec<String> = Vec::new();

    // Surface unrecognised generators but keep going: partial progress on
    // the recognised ones is safe
    if let Some(message) = log_invalid_generators(&app_set) {
        soft_errors.push(message);
    }

    // Expand generators into the desired application set
    let outcome = match generate_desired(
        &app_set,
        &ctx.registry,
        ctx.renderer.as_ref(),
        ctx.config.generator_timeout,
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            // The generator layer produced no candidate set: record and
            // let the error policy requeue
            status.set_condition(ApplicationSetCondition::new(
                ApplicationSetConditionType::ErrorOccurred,
                ConditionStatus::True,
                "ApplicationGenerationFailed",
                e.to_string(),
            ));
            status.set_condition(ApplicationSetCondition::new(
                ApplicationSetConditionType::ParametersGenerated,
                ConditionStatus::False,
                "ApplicationGenerationFailed",
                e.to_string(),
            ));
            if let Err(patch_err) = patch_status(&ctx, &app_set, &status).await {
                warn!(error = %patch_err, "failed to record generation failure");
            }
            publish_event(
                &ctx,
                &app_set,
                EventType::Warning,
                reasons::GENERATION_FAILED,
                actions::RECONCILE,
                e.to_string(),
            )
            .await;
            return Err(e);
        }
    };

    status.set_condition(ApplicationSetCondition::new(
        ApplicationSetConditionType::ParametersGenerated,
        ConditionStatus::True,
        "ParametersGenerated",
        format!("generated {} applications", outcome.apps.len()),
    ));

    for e in &outcome.errors {
        soft_errors.push(e.to_string());
    }
    if !outcome.duplicates.is_empty() {
        let message = format!(
            "duplicate application names dropped: {}",
            outcome.duplicates.join(", ")
        );
        publish_event(
            &ctx,
            &app_set,
            EventType::Warning,
            reasons::DUPLICATE_NAME,
            actions::RECONCILE,
            message.clone(),
        )
        .await;
        soft_errors.push(message);
    }

    // Diff against the live set selected by owner reference
    let namespace = app_set.namespace().unwrap_or_default();
    let owner_uid = app_set.uid().unwrap_or_default();
    let live = ctx.client.list_owned(&namespace, &owner_uid).await?;
    let diff = diff::plan(&outcome.apps, &live);

    // RollingSync gates pending updates behind step health
    let strategy = app_set.spec.strategy.as_ref();
    let rolling = strategy
        .map(|s| s.type_ == StrategyType::RollingSync)
        .unwrap_or(false);
    let rollout_plan = if rolling {
        let steps = strategy
            .and_then(|s| s.rolling_sync.as_ref())
            .map(|r| r.steps.as_slice())
            .unwrap_or_default();
        let pending: BTreeSet<String> = diff.update.iter().map(|a| a.name_any()).collect();
        let live_by_name: BTreeMap<String, Application> =
            live.iter().map(|a| (a.name_any(), a.clone())).collect();
        Some(rollout::plan_rollout(
            &outcome.apps,
            &pending,
            &live_by_name,
            &status.application_status,
            steps,
            ctx.config.rollout_dwell,
            ctx.config.rollout_budget,
            Utc::now(),
        ))
    } else {
        None
    };

    // Apply the plan
    let gated = rollout_plan
        .as_ref()
        .map(|p| p.gated.clone())
        .unwrap_or_default();
    let apply_errors = apply(&ctx, &app_set, &diff, &gated, &owner_uid).await;
    for e in &apply_errors {
        soft_errors.push(e.to_string());
    }

    // Record the outcome
    let up_to_date = soft_errors.is_empty()
        && gated.is_empty()
        && rollout_plan.as_ref().map(|p| !p.progressing).unwrap_or(true);

    if soft_errors.is_empty() {
        status.set_condition(ApplicationSetCondition::new(
            ApplicationSetConditionType::ErrorOccurred,
            ConditionStatus::False,
            "ApplicationSetUpToDate",
            "no errors during the last reconcile",
        ));
    } else {
        status.set_condition(ApplicationSetCondition::new(
            ApplicationSetConditionType::ErrorOccurred,
            ConditionStatus::True,
            "ReconcileError",
            soft_errors.join("; "),
        ));
    }
    status.set_condition(ApplicationSetCondition::new(
        ApplicationSetConditionType::ResourcesUpToDate,
        if up_to_date {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        },
        "ResourcesUpToDate",
        format!(
            "{} created, {} updated ({} gated), {} removed",
            diff.create.len(),
            diff.update.len(),
            gated.len(),
            diff.delete.len()
        ),
    ));

    let mut requeue_after = outcome.requeue_after;
    if let Some(plan) = &rollout_plan {
        status.application_status = plan.statuses.clone();
        status.set_condition(ApplicationSetCondition::new(
            ApplicationSetConditionType::RolloutProgressing,
            if plan.progressing {
                ConditionStatus::True
            } else {
                ConditionStatus::False
            },
            "RolloutProgressing",
            "RollingSync rollout state",
        ));
        if plan.stalled {
            status.set_condition(ApplicationSetCondition::new(
                ApplicationSetConditionType::RolloutStalled,
                ConditionStatus::True,
                "RolloutStalled",
                "a rollout step did not stabilise within its budget",
            ));
            publish_event(
                &ctx,
                &app_set,
                EventType::Warning,
                reasons::ROLLOUT_STALLED,
                actions::ROLLOUT,
                "a rollout step did not stabilise within its budget".to_string(),
            )
            .await;
        }
        if plan.progressing {
            let poll = rollout::backoff_interval(
                ROLLOUT_POLL_BASE,
                ROLLOUT_POLL_CAP,
                plan.active_step_unsettled_for.unwrap_or_default(),
            );
            requeue_after = requeue_after.min(poll);
        }
    } else {
        status.application_status.clear();
    }

    patch_status(&ctx, &app_set, &status).await?;

    info!(
        desired = outcome.apps.len(),
        created = diff.create.len(),
        updated = diff.update.len(),
        deleted = diff.delete.len(),
        "reconciled"
    );

    if requeue_after == NO_REQUEUE_AFTER {
        Ok(Action::await_change())
    } else {
        Ok(Action::requeue(requeue_after))
    }
}

/// Apply creates, non-gated updates, and deletes. Individual failures are
/// collected, never fatal for the rest of the plan.
async fn apply(
    ctx: &Context,
    app_set: &ApplicationSet,
    diff: &diff::DiffPlan,
    gated: &BTreeSet<String>,
    owner_uid: &str,
) -> Vec<Error> {
    let mut errors = Vec::new();
    let preserve = app_set
        .spec
        .sync_policy
        .as_ref()
        .map(|p| p.preserve_resources_on_deletion)
        .unwrap_or(false);

    for app in &diff.create {
        match ctx.client.create(app).await {
            Ok(()) => {
                info!(app = %app.name_any(), "created application");
                publish_event(
                    ctx,
                    app_set,
                    EventType::Normal,
                    reasons::APPLICATION_CREATED,
                    actions::APPLY,
                    format!("created application {}", app.name_any()),
                )
                .await;
            }
            Err(e) => {
                error!(app = %app.name_any(), error = %e, "create failed");
                errors.push(e);
            }
        }
    }

    for app in &diff.update {
        let name = app.name_any();
        if gated.contains(&name) {
            debug!(app = %name, "update gated by rollout step");
            continue;
        }
        match ctx.client.update(app).await {
            Ok(()) => {
                info!(app = %name, "updated application");
                publish_event(
                    ctx,
                    app_set,
                    EventType::Normal,
                    reasons::APPLICATION_UPDATED,
                    actions::APPLY,
                    format!("updated application {name}"),
                )
                .await;
            }
            Err(e) => {
                error!(app = %name, error = %e, "update failed");
                errors.push(e);
            }
        }
    }

    for app in &diff.delete {
        let name = app.name_any();
        if preserve {
            // Keep the application, just release ownership
            match ctx.client.remove_owner_reference(app, owner_uid).await {
                Ok(()) => {
                    info!(app = %name, "orphaned application (preserveResourcesOnDeletion)");
                    publish_event(
                        ctx,
                        app_set,
                        EventType::Normal,
                        reasons::APPLICATION_ORPHANED,
                        actions::APPLY,
                        format!("orphaned application {name}"),
                    )
                    .await;
                }
                Err(e) => {
                    error!(app = %name, error = %e, "orphaning failed");
                    errors.push(e);
                }
            }
        } else {
            match ctx
                .client
                .delete(&app.namespace().unwrap_or_default(), &name)
                .await
            {
                Ok(()) => {
                    info!(app = %name, "deleted application");
                    publish_event(
                        ctx,
                        app_set,
                        EventType::Normal,
                        reasons::APPLICATION_DELETED,
                        actions::APPLY,
                        format!("deleted application {name}"),
                    )
                    .await;
                }
                Err(e) => {
                    error!(app = %name, error = %e, "delete failed");
                    errors.push(e);
                }
            }
        }
    }

    errors
}

async fn patch_status(
    ctx: &Context,
    app_set: &ApplicationSet,
    status: &ApplicationSetStatus,
) -> Result<()> {
    ctx.client
        .update_status(
            &app_set.namespace().unwrap_or_default(),
            &app_set.name_any(),
            status,
        )
        .await
}

async fn publish_event(
    ctx: &Context,
    app_set: &ApplicationSet,
    type_: EventType,
    reason: &str,
    action: &str,
    note: String,
) {
    let reference = ObjectReference {
        api_version: Some("argoproj.io/v1alpha1".to_string()),
        kind: Some("ApplicationSet".to_string()),
        name: app_set.metadata.name.clone(),
        namespace: app_set.metadata.namespace.clone(),
        uid: app_set.metadata.uid.clone(),
        ..Default::default()
    };
    ctx.events
        .publish(&reference, type_, reason, action, Some(note))
        .await;
}

/// Requeue policy on reconcile errors: transient failures come back
/// quickly, configuration errors wait for the next change or a slow retry.
pub fn error_policy(app_set: Arc<ApplicationSet>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(
        app_set = %app_set.name_any(),
        error = %error,
        retryable = error.is_retryable(),
        "reconcile failed"
    );
    if error.is_retryable() {
        Action::requeue(Duration::from_secs(30))
    } else {
        Action::requeue(Duration::from_secs(300))
    }
}
