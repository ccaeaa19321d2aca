//! Client-side wrapper around the in-pod agent's gRPC wire contract
//! (spec.md §6.1). The gateway dials the sidecar container directly over
//! the cluster network using the pod's IP; there is no service mesh or
//! discovery layer in scope (spec.md §1 excludes the in-pod agent itself
//! beyond this contract).

use std::time::Duration;

use tonic::transport::{Channel, Endpoint};

use crate::agent_proto::pod_agent_client::PodAgentClient;
use crate::error::GatewayError;

/// Port the sidecar's `PodAgent` gRPC service listens on. Not named by
/// spec.md; fixed here as a convention the pod template's sidecar
/// container must honor, mirroring the teacher's fixed `AGENT_PORT`
/// constant for its own vsock agent (`guest-agent/src/main.rs`).
pub const AGENT_PORT: u16 = 52100;

/// Connect to the in-pod agent at `pod_ip`, bounding both the connect
/// attempt and the RPC deadline by `timeout` (spec.md §5 "every outbound
/// RPC carries a deadline").
pub async fn connect(pod_ip: &str, timeout: Duration) -> Result<PodAgentClient<Channel>, GatewayError> {
    let endpoint = Endpoint::from_shared(format!("http://{pod_ip}:{AGENT_PORT}"))
        .map_err(|e| GatewayError::Internal(e.to_string()))?
        .connect_timeout(timeout)
        .timeout(timeout);

    let channel = endpoint
        .connect()
        .await
        .map_err(|e| GatewayError::Unavailable(format!("connecting to pod agent: {e}")))?;

    Ok(PodAgentClient::new(channel))
}
