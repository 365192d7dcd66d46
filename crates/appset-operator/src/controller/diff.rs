//! Desired-vs-live diffing
//!
//! Applications only in the desired set are created; applications in both
//! are updated when the managed fields differ; live applications outside
//! the desired set are deleted (subject to the deletion policy, applied by
//! the caller). Managed fields are the spec, labels, annotations, and
//! finalizers; labels and annotations added by other actors are preserved,
//! and status is never touched.

use std::collections::BTreeMap;

use kube::ResourceExt;

use appset_common::crd::Application;

/// The actions one reconcile must apply.
#[derive(Default)]
pub struct DiffPlan {
    /// Applications in desired but not live
    pub create: Vec<Application>,
    /// Applications in both whose managed fields differ, already merged
    /// over the live object
    pub update: Vec<Application>,
    /// Applications live but not desired
    pub delete: Vec<Application>,
}

/// Compute the actions turning `live` into `desired`. Order follows the
/// desired set's deterministic order; deletes follow live order.
pub fn plan(desired: &[Application], live: &[Application]) -> DiffPlan {
    let live_by_key: BTreeMap<(String, String), &Application> = live
        .iter()
        .map(|app| ((app.namespace().unwrap_or_default(), app.name_any()), app))
        .collect();

    let mut diff = DiffPlan::default();
    for app in desired {
        let key = (app.namespace().unwrap_or_default(), app.name_any());
        match live_by_key.get(&key) {
            None => diff.create.push(app.clone()),
            Some(live_app) => {
                let merged = merge_into_live(app, live_app);
                if needs_update(&merged, live_app) {
                    diff.update.push(merged);
                }
            }
        }
    }

    let desired_keys: std::collections::BTreeSet<(String, String)> = desired
        .iter()
        .map(|app| (app.namespace().unwrap_or_default(), app.name_any()))
        .collect();
    for app in live {
        let key = (app.namespace().unwrap_or_default(), app.name_any());
        if !desired_keys.contains(&key) {
            diff.delete.push(app.clone());
        }
    }

    diff
}

/// Overlay the desired managed fields onto the live object.
///
/// Labels and annotations are a three-way-style merge: keys the template
/// renders win, keys added by other actors survive. Everything else about
/// the live object (status, resource version, foreign metadata) is kept.
fn merge_into_live(desired: &Application, live: &Application) -> Application {
    let mut merged = live.clone();
    merged.spec = desired.spec.clone();
    merged.metadata.labels = merge_string_maps(
        live.metadata.labels.as_ref(),
        desired.metadata.labels.as_ref(),
    );
    merged.metadata.annotations = merge_string_maps(
        live.metadata.annotations.as_ref(),
        desired.metadata.annotations.as_ref(),
    );
    merged.metadata.finalizers = desired.metadata.finalizers.clone();
    merged.metadata.owner_references = desired.metadata.owner_references.clone();
    merged
}

fn merge_string_maps(
    live: Option<&BTreeMap<String, String>>,
    desired: Option<&BTreeMap<String, String>>,
) -> Option<BTreeMap<String, String>> {
    let mut merged = live.cloned().unwrap_or_default();
    if let Some(desired) = desired {
        for (key, value) in desired {
            merged.insert(key.clone(), value.clone());
        }
    }
    (!merged.is_empty()).then_some(merged)
}

fn needs_update(merged: &Application, live: &Application) -> bool {
    merged.spec != live.spec
        || merged.metadata.labels != live.metadata.labels
        || merged.metadata.annotations != live.metadata.annotations
        || merged.metadata.finalizers != live.metadata.finalizers
        || merged.metadata.owner_references != live.metadata.owner_references
}
