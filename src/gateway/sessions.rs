//! Session lifecycle: creation (spec.md §4.5 "Session creation"), lookup,
//! and deletion. Bridges the gateway's in-memory [`Session`] to the
//! backing `Sandbox`/`WarmPool` objects in the orchestrator store.

use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::Client;
use kube::api::{Api, DeleteParams, PostParams};
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, sleep};
use uuid::Uuid;

use crate::crd::{Sandbox, SandboxPhase, SandboxSpec, WarmPool};
use crate::error::GatewayError;
use crate::gateway::session::{Session, SessionStore};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub pool_ref: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub keep_alive: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub sandbox_ref: String,
    pub pod_ref: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: String,
    pub pool_ref: String,
    pub sandbox_ref: String,
    pub pod_ref: String,
    pub keep_alive: bool,
    pub step_count: usize,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Create a Sandbox against `poolRef`, poll until `Ready`, and register
/// the resulting in-memory [`Session`] (spec.md §4.5). Fails fast if the
/// pool doesn't exist or has zero `readyReplicas`.
pub async fn create(
    client: &Client,
    sessions: &SessionStore,
    default_namespace: &str,
    ready_timeout: Duration,
    status_poll_timeout: Duration,
    req: CreateSessionRequest,
) -> Result<SessionInfo, GatewayError> {
    if req.pool_ref.trim().is_empty() {
        return Err(GatewayError::Invalid("poolRef must be non-empty".to_string()));
    }

    let namespace = req.namespace.as_deref().unwrap_or(default_namespace);

    let pools: Api<WarmPool> = Api::namespaced(client.clone(), namespace);
    let pool = pools.get(&req.pool_ref).await.map_err(|e| match e {
        kube::Error::Api(ae) if ae.code == 404 => {
            GatewayError::NotFound(format!("pool {} not found", req.pool_ref))
        }
        other => GatewayError::from(other),
    })?;

    let ready = pool.status.as_ref().map(|s| s.ready_replicas).unwrap_or(0);
    if ready == 0 {
        return Err(GatewayError::Unavailable(format!(
            "pool {} has zero ready replicas",
            req.pool_ref
        )));
    }

    let sandboxes: Api<Sandbox> = Api::namespaced(client.clone(), namespace);
    let name = format!("sbx-{}", Uuid::new_v4());
    let sandbox = Sandbox::new(
        &name,
        SandboxSpec {
            pool_ref: req.pool_ref.clone(),
            keep_alive: req.keep_alive,
        },
    );
    sandboxes.create(&PostParams::default(), &sandbox).await?;

    let deadline = Instant::now() + ready_timeout;
    let pod_ref = loop {
        let current = tokio::time::timeout(status_poll_timeout, sandboxes.get(&name))
            .await
            .map_err(|_| {
                GatewayError::Timeout(format!("status poll for sandbox {name} timed out"))
            })??;
        let status = current.status.unwrap_or_default();

        match status.phase {
            SandboxPhase::Ready => {
                let Some(pod_ref) = status.pod_ref else {
                    return Err(GatewayError::Internal(
                        "sandbox reported Ready with no podRef".to_string(),
                    ));
                };
                break pod_ref;
            }
            SandboxPhase::Failed => {
                return Err(GatewayError::Internal(format!(
                    "sandbox {name} failed to become ready"
                )));
            }
            _ => {
                if status.conditions.iter().any(|c| c.reason == "BindConflict") {
                    return Err(GatewayError::Conflict(format!(
                        "sandbox {name} exhausted its binding retry budget"
                    )));
                }
            }
        }

        if Instant::now() >= deadline {
            return Err(GatewayError::Timeout(format!(
                "sandbox {name} did not become ready within {:?}",
                ready_timeout
            )));
        }
        sleep(Duration::from_millis(500)).await;
    };

    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let pod = pods.get(&pod_ref).await?;
    let pod_ip = pod
        .status
        .as_ref()
        .and_then(|s| s.pod_ip.clone())
        .ok_or_else(|| GatewayError::Internal(format!("pod {pod_ref} has no assigned IP")))?;

    let session_id = Uuid::new_v4().to_string();
    let session = Session::new(
        session_id.clone(),
        namespace.to_string(),
        req.pool_ref,
        name.clone(),
        pod_ref.clone(),
        pod_ip,
        req.keep_alive,
    );
    sessions.insert(session).await;

    Ok(SessionInfo {
        session_id,
        sandbox_ref: name,
        pod_ref,
    })
}

pub async fn snapshot(sessions: &SessionStore, id: &str) -> Result<SessionSnapshot, GatewayError> {
    let session = sessions
        .get(id)
        .await
        .ok_or_else(|| GatewayError::NotFound(format!("session {id} not found")))?;

    Ok(SessionSnapshot {
        session_id: session.id.clone(),
        pool_ref: session.pool_ref.clone(),
        sandbox_ref: session.sandbox_ref.clone(),
        pod_ref: session.pod_ref.clone(),
        keep_alive: session.keep_alive,
        step_count: session.step_count().await,
        created_at: session.created_at,
    })
}

/// Delete a session: remove the backing Sandbox (its reconciler deletes
/// the pod via the finalizer) and drop the in-memory entry.
pub async fn delete(
    client: &Client,
    sessions: &SessionStore,
    id: &str,
) -> Result<(), GatewayError> {
    let Some(session) = sessions.remove(id).await else {
        return Err(GatewayError::NotFound(format!("session {id} not found")));
    };

    let sandboxes: Api<Sandbox> = Api::namespaced(client.clone(), &session.namespace);
    match sandboxes
        .delete(&session.sandbox_ref, &DeleteParams::default())
        .await
    {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(GatewayError::from(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn snapshot_of_unknown_session_is_not_found() {
        let sessions = SessionStore::new();
        assert!(matches!(
            snapshot(&sessions, "no-such-session").await,
            Err(GatewayError::NotFound(_))
        ));
    }

    #[tokio::test]
    #[ignore] // Requires a live Kubernetes API server
    async fn rejects_empty_pool_ref() {
        let client = Client::try_default().await.expect("kubeconfig");
        let sessions = SessionStore::new();
        let err = create(
            &client,
            &sessions,
            "default",
            Duration::from_secs(1),
            Duration::from_secs(1),
            CreateSessionRequest {
                pool_ref: String::new(),
                namespace: None,
                keep_alive: false,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, GatewayError::Invalid(_)));
    }

    #[tokio::test]
    #[ignore] // Requires a live Kubernetes API server and a ready WarmPool
    async fn create_fails_fast_when_pool_has_zero_ready_replicas() {
        let client = Client::try_default().await.expect("kubeconfig");
        let sessions = SessionStore::new();
        let err = create(
            &client,
            &sessions,
            "default",
            Duration::from_secs(1),
            Duration::from_secs(1),
            CreateSessionRequest {
                pool_ref: "pool-with-zero-ready".to_string(),
                namespace: None,
                keep_alive: false,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, GatewayError::Unavailable(_)));
    }

    #[tokio::test]
    #[ignore] // Requires a live Kubernetes API server
    async fn delete_of_unknown_session_is_not_found() {
        let client = Client::try_default().await.expect("kubeconfig");
        let sessions = SessionStore::new();
        assert!(matches!(
            delete(&client, &sessions, "no-such-session").await,
            Err(GatewayError::NotFound(_))
        ));
    }
}
