//! WarmPool CRUD forwarding (spec.md §4.5 "Pool management API", §6.2
//! `/v1/pools[/{name}]`). The gateway validates requests server-side and
//! otherwise passes them straight through to the orchestrator object
//! store — there is no additional pool-level state of its own.

use k8s_openapi::api::core::v1::PodTemplateSpec;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::crd::{ImageLocality, ToolSource, WarmPool, WarmPoolSpec, WarmPoolStatus};
use crate::error::GatewayError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePoolRequest {
    pub name: String,
    pub replicas: u32,
    pub pod_template: PodTemplateSpec,
    #[serde(default)]
    pub tools: Vec<ToolSource>,
    #[serde(default)]
    pub image_locality: ImageLocality,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalePoolRequest {
    pub replicas: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolView {
    pub name: String,
    pub replicas: u32,
    pub ready_replicas: u32,
    pub allocated_replicas: u32,
}

impl From<WarmPool> for PoolView {
    fn from(pool: WarmPool) -> Self {
        let status = pool.status.unwrap_or_default();
        Self {
            name: pool.metadata.name.unwrap_or_default(),
            replicas: pool.spec.replicas,
            ready_replicas: status.ready_replicas,
            allocated_replicas: status.allocated_replicas,
        }
    }
}

fn validate_create(req: &CreatePoolRequest) -> Result<(), GatewayError> {
    if req.name.trim().is_empty() {
        return Err(GatewayError::Invalid("pool name must be non-empty".to_string()));
    }
    if req.replicas == 0 {
        return Err(GatewayError::Invalid("replicas must be > 0".to_string()));
    }
    Ok(())
}

pub async fn create(
    client: &Client,
    namespace: &str,
    req: CreatePoolRequest,
) -> Result<PoolView, GatewayError> {
    validate_create(&req)?;

    let pools: Api<WarmPool> = Api::namespaced(client.clone(), namespace);
    let mut pool = WarmPool::new(
        &req.name,
        WarmPoolSpec {
            replicas: req.replicas,
            pod_template: req.pod_template,
            tools: req.tools,
            image_locality: req.image_locality,
        },
    );
    pool.status = Some(WarmPoolStatus::default());

    let created = pools.create(&PostParams::default(), &pool).await?;
    Ok(created.into())
}

pub async fn get(client: &Client, namespace: &str, name: &str) -> Result<PoolView, GatewayError> {
    let pools: Api<WarmPool> = Api::namespaced(client.clone(), namespace);
    let pool = pools.get(name).await.map_err(|e| match e {
        kube::Error::Api(ae) if ae.code == 404 => {
            GatewayError::NotFound(format!("pool {name} not found"))
        }
        other => GatewayError::from(other),
    })?;
    Ok(pool.into())
}

pub async fn list(client: &Client, namespace: &str) -> Result<Vec<PoolView>, GatewayError> {
    let pools: Api<WarmPool> = Api::namespaced(client.clone(), namespace);
    let list = pools.list(&Default::default()).await?;
    Ok(list.items.into_iter().map(PoolView::from).collect())
}

pub async fn delete(client: &Client, namespace: &str, name: &str) -> Result<(), GatewayError> {
    let pools: Api<WarmPool> = Api::namespaced(client.clone(), namespace);
    pools
        .delete(name, &DeleteParams::default())
        .await
        .map_err(|e| match e {
            kube::Error::Api(ae) if ae.code == 404 => {
                GatewayError::NotFound(format!("pool {name} not found"))
            }
            other => GatewayError::from(other),
        })?;
    Ok(())
}

/// Patch `spec.replicas` (spec.md §4.5 "`Scale` is a patch that updates
/// `replicas` and optionally per-container resources").
pub async fn scale(
    client: &Client,
    namespace: &str,
    name: &str,
    req: ScalePoolRequest,
) -> Result<PoolView, GatewayError> {
    if req.replicas == 0 {
        return Err(GatewayError::Invalid("replicas must be > 0".to_string()));
    }

    let pools: Api<WarmPool> = Api::namespaced(client.clone(), namespace);
    let patch = json!({ "spec": { "replicas": req.replicas } });
    let patched = pools
        .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(|e| match e {
            kube::Error::Api(ae) if ae.code == 404 => {
                GatewayError::NotFound(format!("pool {name} not found"))
            }
            other => GatewayError::from(other),
        })?;
    Ok(patched.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(name: &str, replicas: u32) -> CreatePoolRequest {
        CreatePoolRequest {
            name: name.to_string(),
            replicas,
            pod_template: PodTemplateSpec::default(),
            tools: Vec::new(),
            image_locality: ImageLocality::default(),
        }
    }

    #[test]
    fn rejects_empty_name() {
        assert!(validate_create(&req("", 1)).is_err());
    }

    #[test]
    fn rejects_zero_replicas() {
        assert!(validate_create(&req("pool-a", 0)).is_err());
    }

    #[test]
    fn accepts_well_formed_request() {
        assert!(validate_create(&req("pool-a", 3)).is_ok());
    }
}
