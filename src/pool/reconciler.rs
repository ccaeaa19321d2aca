//! WarmPool reconcile cycle (spec.md §4.3), generalized from the teacher's
//! `reconcile_sandbox` in `kubernetes_operator.rs` and wrapped in the
//! leader-election loop from `eosin-storage-operator`'s
//! `shards::reconcile::run` (acquire-or-renew a `coordination.k8s.io`
//! Lease; abort the controller task on loss).

use std::collections::BTreeMap;
#[cfg(feature = "metrics")]
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, Volume, VolumeMount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, ObjectMeta, Time};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Client, Resource, ResourceExt};
use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditEvent, AuditSink};
use crate::config::ReconcilerConfig;
use crate::crd::{self, LABEL_POOL, LABEL_STATE, STATE_IDLE, WarmPool};
use crate::error::{ReconcileError, reconcile_backoff};
use crate::node_registry::NodeSet;
use crate::pool::{RateLimiter, placement};

#[cfg(feature = "metrics")]
use crate::metrics;

const FATAL_WAITING: &[&str] = &[
    "ImagePullBackOff",
    "ErrImagePull",
    "InvalidImageName",
    "CreateContainerConfigError",
    "CreateContainerError",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PodClass {
    Idle,
    Bound,
    Pending,
    Terminating,
    Failed { reason: &'static str },
}

fn pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|cs| cs.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
        .unwrap_or(false)
}

fn classify(pod: &Pod) -> PodClass {
    if pod.metadata.deletion_timestamp.is_some() {
        return PodClass::Terminating;
    }

    if let Some(statuses) = pod.status.as_ref().and_then(|s| s.container_statuses.as_ref()) {
        for cs in statuses {
            if let Some(waiting) = cs.state.as_ref().and_then(|s| s.waiting.as_ref())
                && FATAL_WAITING.contains(&waiting.reason.as_deref().unwrap_or(""))
            {
                return PodClass::Failed {
                    reason: waiting.reason.as_deref().unwrap_or("Unknown"),
                };
            }
            if let Some(terminated) = cs.state.as_ref().and_then(|s| s.terminated.as_ref())
                && terminated.exit_code != 0
            {
                return PodClass::Failed {
                    reason: "ContainerTerminated",
                };
            }
        }
    }

    let state_label = pod
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(LABEL_STATE))
        .map(|s| s.as_str());

    match state_label {
        Some(s) if crd::parse_bound_state(s).is_some() => PodClass::Bound,
        _ => {
            if pod_ready(pod) {
                PodClass::Idle
            } else {
                PodClass::Pending
            }
        }
    }
}

fn primary_image(pool: &WarmPool) -> Option<String> {
    pool.spec
        .pod_template
        .spec
        .as_ref()
        .and_then(|s| s.containers.first())
        .and_then(|c| c.image.clone())
}

fn build_pod(pool: &WarmPool, namespace: &str) -> anyhow::Result<Pod> {
    let name = pool.name_any();
    let pod_name = format!("{name}-{}", uuid::Uuid::new_v4());

    let mut template = pool
        .spec
        .pod_template
        .spec
        .clone()
        .ok_or_else(|| anyhow::anyhow!("WarmPool {name} podTemplate has no pod spec"))?;

    if template.containers.is_empty() {
        anyhow::bail!("WarmPool {name} podTemplate has no containers");
    }

    if !pool.spec.tools.is_empty() {
        let volumes = template.volumes.get_or_insert_with(Vec::new);
        volumes.push(Volume {
            name: "tools".to_string(),
            ..Default::default()
        });

        let init_containers = template.init_containers.get_or_insert_with(Vec::new);
        for (i, tool) in pool.spec.tools.iter().enumerate() {
            init_containers.push(Container {
                name: format!("tools-init-{i}"),
                image: Some(tool.image.clone()),
                command: Some(vec!["sh".to_string(), "-c".to_string()]),
                args: Some(vec![
                    "cp -a /opt/arl/tools/. /mnt/tools/ 2>/dev/null || true".to_string(),
                ]),
                volume_mounts: Some(vec![VolumeMount {
                    name: "tools".to_string(),
                    mount_path: "/mnt/tools".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            });
        }

        for container in template.containers.iter_mut() {
            let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
            mounts.push(VolumeMount {
                name: "tools".to_string(),
                mount_path: "/opt/arl/tools".to_string(),
                ..Default::default()
            });
        }
    }

    let mut labels: BTreeMap<String, String> = pool
        .spec
        .pod_template
        .metadata
        .as_ref()
        .and_then(|m| m.labels.clone())
        .unwrap_or_default();
    labels.insert(LABEL_POOL.to_string(), name.clone());
    labels.insert(LABEL_STATE.to_string(), STATE_IDLE.to_string());

    let owner_ref = pool
        .controller_owner_ref(&())
        .ok_or_else(|| anyhow::anyhow!("WarmPool {name} has no uid; cannot build owner ref"))?;

    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(pod_name),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            owner_references: Some(vec![owner_ref]),
            ..Default::default()
        },
        spec: Some(template),
        ..Default::default()
    })
}

fn condition(type_: &str, status: bool, reason: &str, message: String) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: if status { "True" } else { "False" }.to_string(),
        reason: reason.to_string(),
        message,
        last_transition_time: Time(chrono::Utc::now()),
        observed_generation: None,
    }
}

/// Per-controller bookkeeping so the scale-out latency histograms fire
/// once per pod/container lifecycle transition rather than once per
/// reconcile pass (`ReconcilerConfig`'s knobs are per-process, not
/// per-reconcile, so this lives alongside them on `PoolContext`).
#[cfg(feature = "metrics")]
#[derive(Default)]
struct PoolMetricsState {
    observed_schedule: HashSet<String>,
    observed_ready: HashSet<String>,
    observed_containers: HashSet<(String, String)>,
    scale_out_since: HashMap<String, chrono::DateTime<chrono::Utc>>,
    first_ready_recorded: HashSet<String>,
}

/// Context injected into every reconcile and error-policy invocation.
pub struct PoolContext {
    pub client: Client,
    pub nodes: NodeSet,
    pub audit: AuditSink,
    pub rate_limiter: RateLimiter,
    /// Bounds how many reconciles run concurrently
    /// (`ReconcilerConfig::worker_concurrency`).
    pub worker_semaphore: Arc<tokio::sync::Semaphore>,
    /// Steady-state recheck interval (`ReconcilerConfig::requeue_seconds`).
    pub requeue_interval: Duration,
    /// Backoff applied by `error_policy` (`ReconcilerConfig::error_backoff_seconds`).
    pub error_backoff: Duration,
    #[cfg(feature = "metrics")]
    metrics_state: tokio::sync::Mutex<PoolMetricsState>,
}

/// Record pod-lifecycle histograms the first time each transition is
/// observed for a given pod/container, and the scale-out episode
/// histograms the first time an episode starts and ends.
#[cfg(feature = "metrics")]
async fn observe_pod_lifecycle_metrics(ctx: &PoolContext, pool: &str, pod: &Pod) {
    let Some(uid) = pod.metadata.uid.clone() else {
        return;
    };
    let Some(created) = pod.metadata.creation_timestamp.as_ref().map(|t| t.0) else {
        return;
    };

    let mut state = ctx.metrics_state.lock().await;

    if let Some(conditions) = pod.status.as_ref().and_then(|s| s.conditions.as_ref()) {
        if !state.observed_schedule.contains(&uid)
            && let Some(scheduled_at) = conditions
                .iter()
                .find(|c| c.type_ == "PodScheduled" && c.status == "True")
                .and_then(|c| c.last_transition_time.as_ref())
        {
            let elapsed = (scheduled_at.0 - created).num_milliseconds().max(0) as f64 / 1000.0;
            metrics::global()
                .pod_schedule_latency
                .with_label_values(&[pool])
                .observe(elapsed);
            state.observed_schedule.insert(uid.clone());
        }

        if !state.observed_ready.contains(&uid)
            && let Some(ready_at) = conditions
                .iter()
                .find(|c| c.type_ == "Ready" && c.status == "True")
                .and_then(|c| c.last_transition_time.as_ref())
        {
            let node = pod
                .spec
                .as_ref()
                .and_then(|s| s.node_name.clone())
                .unwrap_or_else(|| "unknown".to_string());
            let elapsed = (ready_at.0 - created).num_milliseconds().max(0) as f64 / 1000.0;
            metrics::global()
                .pod_ready_latency
                .with_label_values(&[pool, &node])
                .observe(elapsed);
            state.observed_ready.insert(uid.clone());

            if state.scale_out_since.contains_key(pool) && !state.first_ready_recorded.contains(pool) {
                let started = state.scale_out_since[pool];
                let elapsed = (chrono::Utc::now() - started).num_milliseconds().max(0) as f64 / 1000.0;
                metrics::global()
                    .first_pod_ready_latency
                    .with_label_values(&[pool])
                    .observe(elapsed);
                state.first_ready_recorded.insert(pool.to_string());
            }
        }
    }

    if let Some(statuses) = pod.status.as_ref().and_then(|s| s.container_statuses.as_ref()) {
        for cs in statuses {
            let key = (uid.clone(), cs.name.clone());
            if state.observed_containers.contains(&key) {
                continue;
            }
            if let Some(started_at) = cs
                .state
                .as_ref()
                .and_then(|s| s.running.as_ref())
                .and_then(|r| r.started_at.as_ref())
            {
                let elapsed = (started_at.0 - created).num_milliseconds().max(0) as f64 / 1000.0;
                metrics::global()
                    .container_start_latency
                    .with_label_values(&[pool, &cs.name])
                    .observe(elapsed);
                state.observed_containers.insert(key);
            }
        }
    }
}

async fn reconcile(pool: Arc<WarmPool>, ctx: Arc<PoolContext>) -> Result<Action, ReconcileError> {
    let _permit = ctx
        .worker_semaphore
        .clone()
        .acquire_owned()
        .await
        .expect("worker semaphore never closed");
    ctx.rate_limiter.acquire().await;

    let namespace = pool.namespace().unwrap_or_else(|| "default".to_string());
    let name = pool.name_any();
    let pods_api: Api<Pod> = Api::namespaced(ctx.client.clone(), &namespace);
    let pools_api: Api<WarmPool> = Api::namespaced(ctx.client.clone(), &namespace);

    // 1. Load state.
    let lp = ListParams::default().labels(&format!("{LABEL_POOL}={name}"));
    let owned = pods_api.list(&lp).await.map_err(anyhow::Error::from)?;

    // 2. Classify.
    let mut idle = Vec::new();
    let mut bound = Vec::new();
    let mut pending = Vec::new();
    let mut terminating = Vec::new();
    let mut failed = Vec::new();

    for pod in owned.items {
        match classify(&pod) {
            PodClass::Idle => {
                #[cfg(feature = "metrics")]
                observe_pod_lifecycle_metrics(&ctx, &name, &pod).await;
                idle.push(pod)
            }
            PodClass::Bound => bound.push(pod),
            PodClass::Pending => {
                #[cfg(feature = "metrics")]
                observe_pod_lifecycle_metrics(&ctx, &name, &pod).await;
                pending.push(pod)
            }
            PodClass::Terminating => terminating.push(pod),
            PodClass::Failed { reason } => failed.push((pod, reason)),
        }
    }
    let _ = terminating;

    // 3. Purge failed; these do not count toward any total.
    for (pod, reason) in failed {
        if let Some(pod_name) = pod.metadata.name.clone() {
            if let Err(e) = pods_api.delete(&pod_name, &DeleteParams::default()).await {
                tracing::warn!(pool = %name, pod = %pod_name, error = %e, "failed to purge failed pod");
            } else {
                #[cfg(feature = "metrics")]
                {
                    metrics::global()
                        .pod_deletes
                        .with_label_values(&[&name, reason])
                        .inc();
                    if FATAL_WAITING.contains(&reason) {
                        metrics::global()
                            .image_pull_errors
                            .with_label_values(&[&name, reason])
                            .inc();
                    }
                }
                ctx.audit.log(AuditEvent::PodDeleted {
                    pool: name.clone(),
                    pod: pod_name,
                    reason: reason.to_string(),
                });
            }
        }
    }

    // 4. Compute delta.
    let desired = pool.spec.replicas as usize;
    let existing_toward_desired = idle.len() + pending.len();
    let deficit = desired.saturating_sub(existing_toward_desired);

    #[cfg(feature = "metrics")]
    metrics::global()
        .pending_pods
        .with_label_values(&[&name])
        .set(pending.len() as i64);

    #[cfg(feature = "metrics")]
    {
        let mut state = ctx.metrics_state.lock().await;
        if deficit > 0 {
            state.scale_out_since.entry(name.clone()).or_insert_with(chrono::Utc::now);
        } else if pending.is_empty()
            && let Some(started) = state.scale_out_since.remove(&name)
        {
            state.first_ready_recorded.remove(&name);
            let elapsed = (chrono::Utc::now() - started).num_milliseconds().max(0) as f64 / 1000.0;
            metrics::global()
                .all_pods_ready_latency
                .with_label_values(&[&name])
                .observe(elapsed);
        }
    }

    // 5. Scale out.
    if deficit > 0 {
        let affinity_nodes = ctx.nodes.snapshot().await;
        for _ in 0..deficit {
            let mut pod = match build_pod(&pool, &namespace) {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(pool = %name, error = %e, "failed to build pod spec");
                    break;
                }
            };

            if pool.spec.image_locality.enabled
                && let Some(image) = primary_image(&pool)
                && !affinity_nodes.is_empty()
            {
                let k = placement::affinity_candidate_count(
                    pool.spec.replicas,
                    pool.spec.image_locality.spread_factor,
                );
                let affinity = placement::preferred_affinity(
                    &image,
                    &affinity_nodes,
                    k,
                    pool.spec.image_locality.weight,
                );
                let spec = pod.spec.get_or_insert_with(PodSpec::default);
                let node_affinity =
                    spec.affinity.get_or_insert_with(Default::default);
                node_affinity.node_affinity = Some(affinity);
            }

            match pods_api.create(&PostParams::default(), &pod).await {
                Ok(created) => {
                    if let Some(pod_name) = created.metadata.name {
                        ctx.audit.log(AuditEvent::PodCreated {
                            pool: name.clone(),
                            pod: pod_name,
                        });
                    }
                }
                Err(e) => {
                    tracing::warn!(pool = %name, error = %e, "failed to create pod, backing off");
                    #[cfg(feature = "metrics")]
                    metrics::global()
                        .image_pull_errors
                        .with_label_values(&[&name, "CreateError"])
                        .inc();
                    break;
                }
            }
        }
    }

    // 6. Scale in: excess idle pods, oldest first. Never delete bound pods.
    let allowed_idle = desired.saturating_sub(bound.len());
    let mut remaining_idle = idle.len();
    if idle.len() > allowed_idle {
        let mut by_age = idle;
        by_age.sort_by_key(|p| {
            p.metadata
                .creation_timestamp
                .as_ref()
                .map(|t| t.0)
                .unwrap_or_default()
        });
        let excess = by_age.len() - allowed_idle;
        for pod in by_age.into_iter().take(excess) {
            if let Some(pod_name) = pod.metadata.name {
                if pods_api
                    .delete(&pod_name, &DeleteParams::default())
                    .await
                    .is_ok()
                {
                    remaining_idle -= 1;
                    #[cfg(feature = "metrics")]
                    metrics::global()
                        .pod_deletes
                        .with_label_values(&[&name, "ScaleIn"])
                        .inc();
                    ctx.audit.log(AuditEvent::PodDeleted {
                        pool: name.clone(),
                        pod: pod_name,
                        reason: "scale_in".to_string(),
                    });
                }
            }
        }
    }

    // 7. Update status. Scale-out only produces pending pods this cycle, so
    // readyReplicas tracks idle pods surviving scale-in.
    let ready_replicas = remaining_idle as u32;
    let allocated_replicas = bound.len() as u32;

    let status = serde_json::json!({
        "status": {
            "readyReplicas": ready_replicas,
            "allocatedReplicas": allocated_replicas,
            "lastScaleTime": chrono::Utc::now().to_rfc3339(),
            "conditions": [condition(
                "Reconciled",
                true,
                "ReconcileSucceeded",
                format!("ready={ready_replicas} allocated={allocated_replicas} desired={desired}"),
            )],
        }
    });

    let _ = pools_api
        .patch_status(&name, &PatchParams::default(), &Patch::Merge(&status))
        .await;

    ctx.audit.log(AuditEvent::PoolScaled {
        pool: name,
        ready: ready_replicas as usize,
        allocated: allocated_replicas as usize,
        desired,
    });

    Ok(Action::requeue(ctx.requeue_interval))
}

fn error_policy(_pool: Arc<WarmPool>, error: &ReconcileError, ctx: Arc<PoolContext>) -> Action {
    reconcile_backoff(error, ctx.error_backoff)
}

/// Run the WarmPool controller, standing by until this replica acquires
/// the named Lease (spec.md §4.3 "[SUPPLEMENT] Leader election" via
/// SPEC_FULL.md). `watch_namespace` empty means all namespaces; the Lease
/// itself always lives in `lease_namespace` (a Lease cannot span "all
/// namespaces").
pub async fn run(
    client: Client,
    watch_namespace: String,
    lease_namespace: String,
    nodes: NodeSet,
    audit: AuditSink,
    config: ReconcilerConfig,
    shutdown: CancellationToken,
) {
    let holder_id = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("sandboxctl-pool-{}", uuid::Uuid::new_v4()));

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
    let ctx = Arc::new(PoolContext {
        client: client.clone(),
        nodes,
        audit,
        rate_limiter: RateLimiter::new(config.rate_limit_qps, config.rate_limit_burst),
        worker_semaphore: Arc::new(tokio::sync::Semaphore::new(config.worker_concurrency)),
        requeue_interval: Duration::from_secs(config.requeue_seconds),
        error_backoff: Duration::from_secs(config.error_backoff_seconds),
        #[cfg(feature = "metrics")]
        metrics_state: tokio::sync::Mutex::new(PoolMetricsState::default()),
    });

    let mut controller_task: Option<tokio::task::JoinHandle<()>> = None;
    let mut tick = tokio::time::interval(Duration::from_secs(5));

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if let Some(mut task) = controller_task.take() {
                    if tokio::time::timeout(shutdown_grace, &mut task).await.is_err() {
                        tracing::warn!("pool controller did not finish in-flight reconciles within grace period, aborting");
                        task.abort();
                        let _ = task.await;
                    }
                }
                tracing::info!("pool controller shut down");
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
                tracing::info!("acquired pool-controller leadership");
                let (pools, pods): (Api<WarmPool>, Api<Pod>) = if watch_namespace.is_empty() {
                    (Api::all(client.clone()), Api::all(client.clone()))
                } else {
                    (
                        Api::namespaced(client.clone(), &watch_namespace),
                        Api::namespaced(client.clone(), &watch_namespace),
                    )
                };
                let ctx = ctx.clone();
                controller_task = Some(tokio::spawn(async move {
                    Controller::new(pools, WatcherConfig::default())
                        .owns(pods, WatcherConfig::default())
                        .run(reconcile, error_policy, ctx)
                        .for_each(|result| async move {
                            if let Err(e) = result {
                                tracing::warn!(error = %e, "pool controller reconcile error");
                            }
                        })
                        .await;
                }));
            }
        } else if let Some(task) = controller_task.take() {
            tracing::info!("lost pool-controller leadership");
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ContainerState, ContainerStateWaiting, ContainerStatus, PodCondition, PodStatus};

    fn pod_with(labels: BTreeMap<String, String>, ready: bool) -> Pod {
        Pod {
            metadata: ObjectMeta {
                labels: Some(labels),
                ..Default::default()
            },
            status: Some(PodStatus {
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
    fn classifies_idle_bound_and_pending() {
        let mut idle_labels = BTreeMap::new();
        idle_labels.insert(LABEL_STATE.to_string(), STATE_IDLE.to_string());
        assert_eq!(classify(&pod_with(idle_labels.clone(), true)), PodClass::Idle);
        assert_eq!(classify(&pod_with(idle_labels, false)), PodClass::Pending);

        let mut bound_labels = BTreeMap::new();
        bound_labels.insert(LABEL_STATE.to_string(), crd::state_bound("abc-123"));
        assert_eq!(classify(&pod_with(bound_labels, true)), PodClass::Bound);
    }

    #[test]
    fn classifies_fatal_waiting_as_failed() {
        let mut pod = pod_with(BTreeMap::new(), false);
        pod.status.as_mut().unwrap().container_statuses = Some(vec![ContainerStatus {
            name: "executor".to_string(),
            ready: false,
            state: Some(ContainerState {
                waiting: Some(ContainerStateWaiting {
                    reason: Some("ImagePullBackOff".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }]);
        assert!(matches!(classify(&pod), PodClass::Failed { .. }));
    }
}
