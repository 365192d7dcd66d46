//! RollingSync rollout planning
//!
//! Applications are grouped into steps by label match expressions, in the
//! literal order the steps are declared. Updates for step N are released
//! only once every application in steps before N has been Healthy and
//! Synced for the dwell time. Creates and deletes are never gated. A step
//! that fails to stabilise within the budget marks the rollout stalled;
//! nothing is rolled back.
//!
//! Step health is polled with exponential backoff: the poll interval
//! doubles from a base up to a cap for as long as the active step stays
//! unsettled, and resets once the step's progress state transitions (the
//! elapsed time is derived from the transition timestamps kept in the
//! status, so no separate attempt counter is stored).

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::ResourceExt;

use appset_common::crd::{
    Application, ApplicationSetApplicationStatus, RolloutPhase, RolloutStep,
};

/// Outcome of planning one RollingSync pass.
pub struct RolloutPlan {
    /// Applications whose pending update must NOT be applied this pass
    pub gated: BTreeSet<String>,
    /// Fresh per-application progress entries for the status
    pub statuses: Vec<ApplicationSetApplicationStatus>,
    /// True while any application has not settled
    pub progressing: bool,
    /// True when the active step exceeded its stabilisation budget
    pub stalled: bool,
    /// How long the active step has been unsettled, measured from the
    /// earliest progress transition among its applications. `None` when
    /// every step has settled. Drives the health-poll backoff.
    pub active_step_unsettled_for: Option<Duration>,
}

/// Health-poll interval for a progressing rollout: starts at `base` and
/// doubles for as long as the active step has been unsettled, capped at
/// `cap`. A step transition resets the underlying elapsed time and with
/// it the interval.
pub fn backoff_interval(base: Duration, cap: Duration, unsettled_for: Duration) -> Duration {
    if base.is_zero() {
        return cap;
    }
    let mut interval = base;
    while interval < cap && interval <= unsettled_for {
        interval = (interval * 2).min(cap);
    }
    interval
}

/// The step an application belongs to: the first step whose expressions
/// all match its labels. Applications matching no step run after every
/// declared step.
pub fn step_for_app(app: &Application, steps: &[RolloutStep]) -> usize {
    let labels = app.metadata.labels.clone().unwrap_or_default();
    steps
        .iter()
        .position(|step| step.match_expressions.iter().all(|e| e.matches(&labels)))
        .unwrap_or(steps.len())
}

/// Plan which pending updates may proceed and what the per-application
/// progress looks like afterwards.
pub fn plan_rollout(
    desired: &[Application],
    updates_pending: &BTreeSet<String>,
    live_by_name: &BTreeMap<String, Application>,
    previous: &[ApplicationSetApplicationStatus],
    steps: &[RolloutStep],
    dwell: Duration,
    budget: Duration,
    now: DateTime<Utc>,
) -> RolloutPlan {
    let previous_by_name: BTreeMap<&str, &ApplicationSetApplicationStatus> = previous
        .iter()
        .map(|entry| (entry.application.as_str(), entry))
        .collect();

    // Which step each desired application belongs to
    let app_steps: Vec<(String, usize)> = desired
        .iter()
        .map(|app| (app.name_any(), step_for_app(app, steps)))
        .collect();

    // A step is settled when every one of its applications is Healthy,
    // Synced, without a pending update, and has dwelled long enough
    let settled_step = |step: usize| -> bool {
        app_steps
            .iter()
            .filter(|(_, s)| *s == step)
            .all(|(name, _)| {
                if updates_pending.contains(name) {
                    return false;
                }
                let healthy = live_by_name
                    .get(name)
                    .map(|app| app.is_healthy_and_synced())
                    .unwrap_or(false);
                if !healthy {
                    return false;
                }
                match previous_by_name.get(name.as_str()) {
                    Some(entry) if entry.status == RolloutPhase::Healthy => {
                        now.signed_duration_since(entry.last_transition_time)
                            .to_std()
                            .map(|elapsed| elapsed >= dwell)
                            .unwrap_or(false)
                    }
                    // No prior Healthy record: the dwell clock starts now
                    _ => false,
                }
            })
    };

    // The active step: the first one that has not settled. Every step
    // before it is released; it and everything after it stays gated for
    // updates beyond the active step itself.
    let total_steps = steps.len() + 1;
    let mut active_step = total_steps;
    for step in 0..total_steps {
        if !settled_step(step) {
            active_step = step;
            break;
        }
    }

    let mut gated = BTreeSet::new();
    let mut statuses = Vec::new();
    let mut progressing = false;
    let mut stalled = false;
    let mut active_unsettled_since: Option<DateTime<Utc>> = None;

    for (name, step) in &app_steps {
        let pending = updates_pending.contains(name);
        let healthy = live_by_name
            .get(name)
            .map(|app| app.is_healthy_and_synced())
            .unwrap_or(false);

        let phase = if pending && *step > active_step {
            gated.insert(name.clone());
            RolloutPhase::Waiting
        } else if pending {
            RolloutPhase::Pending
        } else if healthy {
            RolloutPhase::Healthy
        } else {
            RolloutPhase::Progressing
        };

        if phase != RolloutPhase::Healthy {
            progressing = true;
        }

        // Keep the previous transition time while the phase is unchanged
        let last_transition_time = match previous_by_name.get(name.as_str()) {
            Some(entry) if entry.status == phase => entry.last_transition_time,
            _ => now,
        };

        // The active step is stalled once any of its applications has been
        // unsettled for longer than the budget; the earliest transition
        // also anchors the health-poll backoff
        if *step == active_step && phase != RolloutPhase::Healthy {
            active_unsettled_since = Some(match active_unsettled_since {
                Some(existing) => existing.min(last_transition_time),
                None => last_transition_time,
            });
            if let Ok(elapsed) = now.signed_duration_since(last_transition_time).to_std() {
                if elapsed >= budget {
                    stalled = true;
                }
            }
        }

        statuses.push(ApplicationSetApplicationStatus {
            application: name.clone(),
            step: format!("{}", step + 1),
            status: phase,
            message: String::new(),
            last_transition_time,
        });
    }

    let active_step_unsettled_for = active_unsettled_since
        .and_then(|since| now.signed_duration_since(since).to_std().ok());

    RolloutPlan {
        gated,
        statuses,
        progressing,
        stalled,
        active_step_unsettled_for,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use appset_common::crd::{
        ApplicationSpec, ApplicationStatus, HealthStatus, MatchExpression, SyncStatus,
    };
    use kube::core::ObjectMeta;
    use std::collections::BTreeMap as Map;

    fn step(key: &str, value: &str) -> RolloutStep {
        RolloutStep {
            match_expressions: vec![MatchExpression {
                key: key.to_string(),
                operator: "In".to_string(),
                values: vec![value.to_string()],
            }],
        }
    }

    fn app(name: &str, env: &str) -> Application {
        let mut app = Application::new(name, ApplicationSpec::default());
        app.metadata = ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("argocd".to_string()),
            labels: Some(Map::from([("env".to_string(), env.to_string())])),
            ..Default::default()
        };
        app
    }

    fn healthy(mut app: Application) -> Application {
        app.status = Some(ApplicationStatus {
            health: Some(HealthStatus {
                status: "Healthy".to_string(),
                message: None,
            }),
            sync: Some(SyncStatus {
                status: "Synced".to_string(),
                revision: None,
            }),
            ..Default::default()
        });
        app
    }

    fn healthy_entry(name: &str, step: &str, since_seconds: i64) -> ApplicationSetApplicationStatus {
        ApplicationSetApplicationStatus {
            application: name.to_string(),
            step: step.to_string(),
            status: RolloutPhase::Healthy,
            message: String::new(),
            last_transition_time: Utc::now() - chrono::Duration::seconds(since_seconds),
        }
    }

    const DWELL: Duration = Duration::from_secs(10);
    const BUDGET: Duration = Duration::from_secs(300);

    #[test]
    fn apps_are_assigned_to_the_first_matching_step() {
        let steps = vec![step("env", "dev"), step("env", "prod")];
        assert_eq!(step_for_app(&app("a", "dev"), &steps), 0);
        assert_eq!(step_for_app(&app("b", "prod"), &steps), 1);
        // No match: after every declared step
        assert_eq!(step_for_app(&app("c", "qa"), &steps), 2);
    }

    #[test]
    fn later_step_updates_are_gated_until_earlier_steps_settle() {
        let steps = vec![step("env", "dev"), step("env", "prod")];
        let desired = vec![app("dev-app", "dev"), app("prod-app", "prod")];
        let pending: BTreeSet<String> =
            ["dev-app".to_string(), "prod-app".to_string()].into();
        let live = BTreeMap::from([
            ("dev-app".to_string(), app("dev-app", "dev")),
            ("prod-app".to_string(), app("prod-app", "prod")),
        ]);

        let plan = plan_rollout(
            &desired,
            &pending,
            &live,
            &[],
            &steps,
            DWELL,
            BUDGET,
            Utc::now(),
        );

        // Step 0 has a pending update, so it is the active step; the
        // prod update waits
        assert!(!plan.gated.contains("dev-app"));
        assert!(plan.gated.contains("prod-app"));
        assert!(plan.progressing);
    }

    #[test]
    fn settled_first_step_releases_the_second() {
        let steps = vec![step("env", "dev"), step("env", "prod")];
        let desired = vec![app("dev-app", "dev"), app("prod-app", "prod")];
        let pending: BTreeSet<String> = ["prod-app".to_string()].into();
        let live = BTreeMap::from([
            ("dev-app".to_string(), healthy(app("dev-app", "dev"))),
            ("prod-app".to_string(), app("prod-app", "prod")),
        ]);
        // dev-app has been Healthy for longer than the dwell
        let previous = vec![healthy_entry("dev-app", "1", 60)];

        let plan = plan_rollout(
            &desired,
            &pending,
            &live,
            &previous,
            &steps,
            DWELL,
            BUDGET,
            Utc::now(),
        );

        assert!(!plan.gated.contains("prod-app"));
    }

    #[test]
    fn dwell_time_holds_the_next_step_back() {
        let steps = vec![step("env", "dev"), step("env", "prod")];
        let desired = vec![app("dev-app", "dev"), app("prod-app", "prod")];
        let pending: BTreeSet<String> = ["prod-app".to_string()].into();
        let live = BTreeMap::from([
            ("dev-app".to_string(), healthy(app("dev-app", "dev"))),
            ("prod-app".to_string(), app("prod-app", "prod")),
        ]);
        // Healthy, but only for two seconds: not yet dwelled
        let previous = vec![healthy_entry("dev-app", "1", 2)];

        let plan = plan_rollout(
            &desired,
            &pending,
            &live,
            &previous,
            &steps,
            DWELL,
            BUDGET,
            Utc::now(),
        );

        assert!(plan.gated.contains("prod-app"));
    }

    #[test]
    fn everything_healthy_is_not_progressing() {
        let steps = vec![step("env", "dev")];
        let desired = vec![app("dev-app", "dev")];
        let live = BTreeMap::from([(
            "dev-app".to_string(),
            healthy(app("dev-app", "dev")),
        )]);
        let previous = vec![healthy_entry("dev-app", "1", 60)];

        let plan = plan_rollout(
            &desired,
            &BTreeSet::new(),
            &live,
            &previous,
            &steps,
            DWELL,
            BUDGET,
            Utc::now(),
        );

        assert!(!plan.progressing);
        assert!(!plan.stalled);
        assert!(plan.gated.is_empty());
        assert_eq!(plan.statuses[0].status, RolloutPhase::Healthy);
        // A settled rollout has no backoff clock running
        assert!(plan.active_step_unsettled_for.is_none());
    }

    #[test]
    fn exceeded_budget_marks_the_rollout_stalled() {
        let steps = vec![step("env", "dev")];
        let desired = vec![app("dev-app", "dev")];
        let live = BTreeMap::from([("dev-app".to_string(), app("dev-app", "dev"))]);
        // Progressing for far longer than the budget
        let previous = vec![ApplicationSetApplicationStatus {
            application: "dev-app".to_string(),
            step: "1".to_string(),
            status: RolloutPhase::Progressing,
            message: String::new(),
            last_transition_time: Utc::now() - chrono::Duration::seconds(3600),
        }];

        let plan = plan_rollout(
            &desired,
            &BTreeSet::new(),
            &live,
            &previous,
            &steps,
            DWELL,
            BUDGET,
            Utc::now(),
        );

        assert!(plan.stalled);
        assert!(plan.progressing);
        // The unsettled duration reflects how long the step has been stuck
        let unsettled = plan.active_step_unsettled_for.unwrap();
        assert!(unsettled >= Duration::from_secs(3590), "got {unsettled:?}");
    }

    #[test]
    fn backoff_doubles_from_base_up_to_the_cap() {
        let base = Duration::from_secs(10);
        let cap = Duration::from_secs(120);

        // Fresh step: poll at the base interval
        assert_eq!(backoff_interval(base, cap, Duration::ZERO), base);
        assert_eq!(backoff_interval(base, cap, Duration::from_secs(9)), base);

        // Each elapsed base-multiple doubles the interval
        assert_eq!(
            backoff_interval(base, cap, Duration::from_secs(10)),
            Duration::from_secs(20)
        );
        assert_eq!(
            backoff_interval(base, cap, Duration::from_secs(45)),
            Duration::from_secs(80)
        );

        // Long-unsettled steps poll at the cap, never slower
        assert_eq!(backoff_interval(base, cap, Duration::from_secs(3600)), cap);
    }

    #[test]
    fn backoff_resets_when_the_step_transitions() {
        let base = Duration::from_secs(10);
        let cap = Duration::from_secs(120);

        // A step that just transitioned reports a near-zero unsettled
        // duration, which brings the poll interval back to the base
        let steps = vec![step("env", "dev")];
        let desired = vec![app("dev-app", "dev")];
        let live = BTreeMap::from([("dev-app".to_string(), app("dev-app", "dev"))]);
        let plan = plan_rollout(
            &desired,
            &BTreeSet::new(),
            &live,
            &[],
            &steps,
            DWELL,
            BUDGET,
            Utc::now(),
        );

        let unsettled = plan.active_step_unsettled_for.unwrap();
        assert!(unsettled < Duration::from_secs(1), "got {unsettled:?}");
        assert_eq!(backoff_interval(base, cap, unsettled), base);
    }

    #[test]
    fn transition_time_is_kept_while_the_phase_is_stable() {
        let steps = vec![step("env", "dev")];
        let desired = vec![app("dev-app", "dev")];
        let live = BTreeMap::from([(
            "dev-app".to_string(),
            healthy(app("dev-app", "dev")),
        )]);
        let previous = vec![healthy_entry("dev-app", "1", 120)];
        let prior_time = previous[0].last_transition_time;

        let plan = plan_rollout(
            &desired,
            &BTreeSet::new(),
            &live,
            &previous,
            &steps,
            DWELL,
            BUDGET,
            Utc::now(),
        );

        assert_eq!(plan.statuses[0].last_transition_time, prior_time);
    }
}
