//! Claim-update-verify binding protocol (spec.md §4.4 "Binding protocol
//! (critical)"). Generalizes the teacher's `KubernetesPool::acquire`
//! relabeling (`kubernetes_pool.rs`) into a race-free CAS: the merge patch
//! carries the candidate's observed `resourceVersion`, so a concurrent
//! writer that already relabeled the pod causes the API server to reject
//! the patch with a conflict, exactly as `util/patch.rs`'s JSON-patch
//! status update relies on optimistic concurrency.

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, Patch, PatchParams};
use serde_json::json;

use crate::crd::{LABEL_POOL, LABEL_STATE, STATE_IDLE, state_bound};

/// Outcome of a single bind attempt.
pub enum BindOutcome {
    /// Bound `pod_name` to the sandbox.
    Bound(String),
    /// No idle pods exist for the pool right now.
    NoIdlePods,
    /// A concurrent reconciler won the race for the chosen candidate;
    /// callers should restart at step 1 (spec.md §4.4 step 4).
    Conflict,
}

/// Pick the oldest idle pod for `pool`, then attempt the conditional
/// relabel. Exactly one concurrent caller observes `Bound` for the
/// returned pod (spec.md §8 property 1, "binding uniqueness").
pub async fn try_bind(pods: &Api<Pod>, pool: &str, sandbox_uid: &str) -> kube::Result<BindOutcome> {
    let lp = ListParams::default().labels(&format!("{LABEL_POOL}={pool},{LABEL_STATE}={STATE_IDLE}"));
    let candidates = pods.list(&lp).await?;

    let mut idle: Vec<Pod> = candidates.items;
    idle.sort_by_key(|p| {
        p.metadata
            .creation_timestamp
            .as_ref()
            .map(|t| t.0)
            .unwrap_or_default()
    });

    let Some(candidate) = idle.into_iter().next() else {
        return Ok(BindOutcome::NoIdlePods);
    };

    let (Some(name), Some(resource_version)) = (
        candidate.metadata.name.clone(),
        candidate.metadata.resource_version.clone(),
    ) else {
        return Ok(BindOutcome::Conflict);
    };

    let patch = json!({
        "metadata": {
            "name": name,
            "resourceVersion": resource_version,
            "labels": {
                LABEL_STATE: state_bound(sandbox_uid),
            }
        }
    });

    match pods
        .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => Ok(BindOutcome::Bound(name)),
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(BindOutcome::Conflict),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::Client;

    #[tokio::test]
    #[ignore] // Requires a live Kubernetes API server
    async fn concurrent_bind_attempts_yield_exactly_one_winner() {
        let client = Client::try_default().await.expect("kubeconfig");
        let pods: Api<Pod> = Api::namespaced(client, "default");

        let (a, b) = tokio::join!(
            try_bind(&pods, "test-pool", "sandbox-a"),
            try_bind(&pods, "test-pool", "sandbox-b"),
        );
        let bound = [a, b]
            .into_iter()
            .filter(|r| matches!(r, Ok(BindOutcome::Bound(_))))
            .count();
        assert_eq!(bound, 1);
    }

    #[tokio::test]
    #[ignore] // Requires a live Kubernetes API server
    async fn bind_with_no_idle_pods_reports_no_idle_pods() {
        let client = Client::try_default().await.expect("kubeconfig");
        let pods: Api<Pod> = Api::namespaced(client, "default");

        let outcome = try_bind(&pods, "pool-with-no-idle-pods", "sandbox-z")
            .await
            .expect("list should succeed even with no matches");
        assert!(matches!(outcome, BindOutcome::NoIdlePods));
    }
}
