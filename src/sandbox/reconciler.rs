//! Sandbox reconcile cycle and state machine (spec.md §4.4), wrapped in
//! the same leader-election loop as the pool reconciler
//! (`pool::reconciler::run`, grounded in
//! `eosin-storage-operator`'s `shards::reconcile::run`). Deletion uses
//! `kube::runtime::finalizer` so the bound pod is always deleted before
//! the `Sandbox` object itself disappears (spec.md §4.4 "on sandbox
//! deletion, the pod is deleted").

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::finalizer::{Event as FinalizerEvent, finalizer};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Client, Resource, ResourceExt};
use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditEvent, AuditSink};
use crate::config::ReconcilerConfig;
use crate::crd::{Sandbox, SandboxPhase};
use crate::error::{ReconcileError, reconcile_backoff};
use crate::pool::RateLimiter;
use crate::sandbox::binding::{self, BindOutcome};

#[cfg(feature = "metrics")]
use crate::metrics;

const FINALIZER: &str = "sandboxctl.io/sandbox";
const MAX_BIND_ATTEMPTS: usize = 5;

fn pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|cs| cs.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
        .unwrap_or(false)
}

fn pod_terminal(pod: &Pod) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return true;
    }
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .map(|p| p == "Failed" || p == "Succeeded")
        .unwrap_or(false)
}

pub struct SandboxContext {
    pub client: Client,
    pub audit: AuditSink,
    pub rate_limiter: RateLimiter,
    /// Bounds how many reconciles run concurrently
    /// (`ReconcilerConfig::worker_concurrency`).
    pub worker_semaphore: Arc<tokio::sync::Semaphore>,
    /// Steady-state recheck interval for `Ready` sandboxes
    /// (`ReconcilerConfig::requeue_seconds`).
    pub requeue_interval: Duration,
    /// Backoff applied by `error_policy` (`ReconcilerConfig::error_backoff_seconds`).
    pub error_backoff: Duration,
}

async fn patch_status(
    sandboxes: &Api<Sandbox>,
    name: &str,
    phase: SandboxPhase,
    pod_ref: Option<&str>,
    reason: &str,
    message: String,
) {
    let status = serde_json::json!({
        "status": {
            "phase": phase,
            "podRef": pod_ref,
            "conditions": [{
                "type": "Reconciled",
                "status": "True",
                "reason": reason,
                "message": message,
                "lastTransitionTime": chrono::Utc::now().to_rfc3339(),
            }],
        }
    });
    let _ = sandboxes
        .patch_status(name, &PatchParams::default(), &Patch::Merge(&status))
        .await;
}

async fn apply(
    sandbox: Arc<Sandbox>,
    ctx: &SandboxContext,
    namespace: &str,
) -> Result<Action, ReconcileError> {
    let name = sandbox.name_any();
    let uid = sandbox.uid().unwrap_or_else(|| name.clone());
    let pool_ref = sandbox.spec.pool_ref.clone();

    let sandboxes: Api<Sandbox> = Api::namespaced(ctx.client.clone(), namespace);
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), namespace);

    if pool_ref.trim().is_empty() {
        patch_status(
            &sandboxes,
            &name,
            SandboxPhase::Failed,
            None,
            "InvalidSpec",
            "poolRef must be non-empty".to_string(),
        )
        .await;
        return Ok(Action::await_change());
    }

    let phase = sandbox.status.as_ref().map(|s| s.phase).unwrap_or_default();
    let pod_ref = sandbox.status.as_ref().and_then(|s| s.pod_ref.clone());

    match phase {
        SandboxPhase::Pending => {
            for _ in 0..MAX_BIND_ATTEMPTS {
                match binding::try_bind(&pods, &pool_ref, &uid)
                    .await
                    .map_err(anyhow::Error::from)?
                {
                    BindOutcome::Bound(pod_name) => {
                        patch_status(
                            &sandboxes,
                            &name,
                            SandboxPhase::Bound,
                            Some(&pod_name),
                            "Bound",
                            format!("bound to pod {pod_name}"),
                        )
                        .await;
                        ctx.audit.log(AuditEvent::SandboxBound {
                            sandbox: name.clone(),
                            pool: pool_ref.clone(),
                            pod: pod_name,
                        });
                        return Ok(Action::requeue(Duration::from_secs(2)));
                    }
                    BindOutcome::NoIdlePods => {
                        #[cfg(feature = "metrics")]
                        metrics::global()
                            .no_idle_pods
                            .with_label_values(&[&pool_ref])
                            .inc();
                        return Ok(Action::requeue(Duration::from_secs(5)));
                    }
                    BindOutcome::Conflict => continue,
                }
            }
            tracing::warn!(sandbox = %name, "exhausted bind attempts on conflicting CAS, retrying shortly");
            patch_status(
                &sandboxes,
                &name,
                SandboxPhase::Pending,
                None,
                "BindConflict",
                "binding race exhausted its retry budget".to_string(),
            )
            .await;
            Ok(Action::requeue(Duration::from_secs(1)))
        }
        SandboxPhase::Bound => {
            let Some(pod_name) = pod_ref else {
                return Ok(Action::requeue(Duration::from_secs(2)));
            };
            match pods.get_opt(&pod_name).await.map_err(anyhow::Error::from)? {
                None => {
                    patch_status(
                        &sandboxes,
                        &name,
                        SandboxPhase::Failed,
                        Some(&pod_name),
                        "PodMissing",
                        format!("bound pod {pod_name} no longer exists"),
                    )
                    .await;
                    ctx.audit.log(AuditEvent::SandboxFailed {
                        sandbox: name,
                        pod: Some(pod_name),
                        reason: "pod_missing".to_string(),
                    });
                    Ok(Action::await_change())
                }
                Some(pod) if pod_terminal(&pod) => {
                    let _ = pods.delete(&pod_name, &DeleteParams::default()).await;
                    patch_status(
                        &sandboxes,
                        &name,
                        SandboxPhase::Failed,
                        Some(&pod_name),
                        "PodTerminal",
                        format!("bound pod {pod_name} entered a terminal state"),
                    )
                    .await;
                    ctx.audit.log(AuditEvent::SandboxFailed {
                        sandbox: name,
                        pod: Some(pod_name),
                        reason: "pod_terminal".to_string(),
                    });
                    Ok(Action::await_change())
                }
                Some(pod) if pod_ready(&pod) => {
                    patch_status(
                        &sandboxes,
                        &name,
                        SandboxPhase::Ready,
                        Some(&pod_name),
                        "Ready",
                        format!("pod {pod_name} is ready"),
                    )
                    .await;
                    #[cfg(feature = "metrics")]
                    if let Some(created) = sandbox.metadata.creation_timestamp.as_ref() {
                        let elapsed = (chrono::Utc::now() - created.0).num_milliseconds().max(0) as f64 / 1000.0;
                        metrics::global()
                            .sandbox_ready_latency
                            .with_label_values(&[&pool_ref])
                            .observe(elapsed);
                    }
                    ctx.audit.log(AuditEvent::SandboxReady {
                        sandbox: name,
                        pod: pod_name,
                    });
                    Ok(Action::requeue(ctx.requeue_interval))
                }
                Some(_) => Ok(Action::requeue(Duration::from_secs(2))),
            }
        }
        SandboxPhase::Ready => {
            let Some(pod_name) = pod_ref else {
                return Ok(Action::requeue(ctx.requeue_interval));
            };
            match pods.get_opt(&pod_name).await.map_err(anyhow::Error::from)? {
                Some(pod) if !pod_terminal(&pod) => Ok(Action::requeue(ctx.requeue_interval)),
                _ => {
                    patch_status(
                        &sandboxes,
                        &name,
                        SandboxPhase::Failed,
                        Some(&pod_name),
                        "PodLost",
                        format!("bound pod {pod_name} is gone or terminal"),
                    )
                    .await;
                    ctx.audit.log(AuditEvent::SandboxFailed {
                        sandbox: name,
                        pod: Some(pod_name),
                        reason: "pod_lost".to_string(),
                    });
                    Ok(Action::await_change())
                }
            }
        }
        SandboxPhase::Failed | SandboxPhase::Terminating => Ok(Action::await_change()),
    }
}

async fn cleanup(
    sandbox: Arc<Sandbox>,
    ctx: &SandboxContext,
    namespace: &str,
) -> Result<Action, ReconcileError> {
    let name = sandbox.name_any();
    let pool_ref = sandbox.spec.pool_ref.clone();
    let pod_ref = sandbox.status.as_ref().and_then(|s| s.pod_ref.clone());

    if let Some(pod_name) = &pod_ref {
        let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), namespace);
        let _ = pods.delete(pod_name, &DeleteParams::default()).await;

        #[cfg(feature = "metrics")]
        if let Some(bound_since) = sandbox.metadata.creation_timestamp.as_ref() {
            let elapsed = (chrono::Utc::now() - bound_since.0).num_milliseconds().max(0) as f64 / 1000.0;
            metrics::global()
                .idle_duration
                .with_label_values(&[&pool_ref])
                .observe(elapsed);
        }
    }

    ctx.audit.log(AuditEvent::SandboxFailed {
        sandbox: name,
        pod: pod_ref,
        reason: "sandbox_deleted".to_string(),
    });

    Ok(Action::await_change())
}

async fn reconcile(
    sandbox: Arc<Sandbox>,
    ctx: Arc<SandboxContext>,
) -> Result<Action, ReconcileError> {
    let _permit = ctx
        .worker_semaphore
        .clone()
        .acquire_owned()
        .await
        .expect("worker semaphore never closed");
    ctx.rate_limiter.acquire().await;
    let namespace = sandbox.namespace().unwrap_or_else(|| "default".to_string());
    let sandboxes: Api<Sandbox> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer(&sandboxes, FINALIZER, sandbox, |event| async {
        match event {
            FinalizerEvent::Apply(sandbox) => apply(sandbox, &ctx, &namespace).await,
            FinalizerEvent::Cleanup(sandbox) => cleanup(sandbox, &ctx, &namespace).await,
        }
    })
    .await
    .map_err(|e| anyhow::anyhow!("finalizer error: {e}").into())
}

fn error_policy(
    _sandbox: Arc<Sandbox>,
    error: &ReconcileError,
    ctx: Arc<SandboxContext>,
) -> Action {
    reconcile_backoff(error, ctx.error_backoff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    fn pod_with_phase(phase: Option<&str>, ready: bool) -> Pod {
        Pod {
            status: Some(PodStatus {
                phase: phase.map(str::to_string),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn pod_ready_requires_ready_condition_true() {
        assert!(pod_ready(&pod_with_phase(Some("Running"), true)));
        assert!(!pod_ready(&pod_with_phase(Some("Running"), false)));
        assert!(!pod_ready(&Pod::default()));
    }

    #[test]
    fn pod_terminal_on_failed_or_succeeded_phase() {
        assert!(pod_terminal(&pod_with_phase(Some("Failed"), false)));
        assert!(pod_terminal(&pod_with_phase(Some("Succeeded"), false)));
        assert!(!pod_terminal(&pod_with_phase(Some("Running"), true)));
    }

    #[test]
    fn pod_terminal_on_deletion_timestamp_regardless_of_phase() {
        let mut pod = pod_with_phase(Some("Running"), true);
        pod.metadata = ObjectMeta {
            deletion_timestamp: Some(Time(chrono::Utc::now())),
            ..Default::default()
        };
        assert!(pod_terminal(&pod));
    }
}

/// Run the Sandbox controller under leader election, mirroring
/// `pool::reconciler::run`.
pub async fn run(
    client: Client,
    watch_namespace: String,
    lease_namespace: String,
    audit: AuditSink,
    config: ReconcilerConfig,
    shutdown: CancellationToken,
) {
    let holder_id = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("sandboxctl-sandbox-{}", uuid::Uuid::new_v4()));

    let leadership = LeaseLock::new(
        client.clone(),
        &lease_namespace,
        LeaseLockParams {
            holder_id,
            lease_name: config.lease_name.clone(),
            lease_ttl: Duration::from_secs(15),
        },
    );

    let shutdown_grace = Duration::from_secs(config.shutdown_grace_seconds);
    let ctx = Arc::new(SandboxContext {
        client: client.clone(),
        audit,
        rate_limiter: RateLimiter::new(config.rate_limit_qps, config.rate_limit_burst),
        worker_semaphore: Arc::new(tokio::sync::Semaphore::new(config.worker_concurrency)),
        requeue_interval: Duration::from_secs(config.requeue_seconds),
        error_backoff: Duration::from_secs(config.error_backoff_seconds),
    });

    let mut controller_task: Option<tokio::task::JoinHandle<()>> = None;
    let mut tick = tokio::time::interval(Duration::from_secs(5));

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if let Some(mut task) = controller_task.take() {
                    if tokio::time::timeout(shutdown_grace, &mut task).await.is_err() {
                        tracing::warn!("sandbox controller did not finish in-flight reconciles within grace period, aborting");
                        task.abort();
                        let _ = task.await;
                    }
                }
                tracing::info!("sandbox controller shut down");
                return;
            }
            _ = tick.tick() => {}
        }

        let lease = match leadership.try_acquire_or_renew().await {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!(error = %e, "leader election renew/acquire failed");
                if let Some(task) = controller_task.take() {
                    task.abort();
                }
                continue;
            }
        };

        if matches!(lease, LeaseLockResult::Acquired(_)) {
            if controller_task.is_none() {
                tracing::info!("acquired sandbox-controller leadership");
                let (sandboxes, pods): (Api<Sandbox>, Api<Pod>) = if watch_namespace.is_empty() {
                    (Api::all(client.clone()), Api::all(client.clone()))
                } else {
                    (
                        Api::namespaced(client.clone(), &watch_namespace),
                        Api::namespaced(client.clone(), &watch_namespace),
                    )
                };
                let ctx = ctx.clone();
                controller_task = Some(tokio::spawn(async move {
                    Controller::new(sandboxes, WatcherConfig::default())
                        .owns(pods, WatcherConfig::default())
                        .run(reconcile, error_policy, ctx)
                        .for_each(|result| async move {
                            if let Err(e) = result {
                                tracing::warn!(error = %e, "sandbox controller reconcile error");
                            }
                        })
                        .await;
                }));
            }
        } else if let Some(task) = controller_task.take() {
            tracing::info!("lost sandbox-controller leadership");
            task.abort();
        }
    }
}
