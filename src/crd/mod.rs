//! Custom resource types for the control plane (spec.md §3), adapted from
//! the teacher's `kubernetes_operator.rs` `AgentSandbox`/`AgentSandboxPool`
//! CRD pair: same `kube-derive` shape, generalized fields, and the
//! well-known `Condition` type in `status` instead of bespoke strings.

pub mod sandbox;
pub mod warm_pool;

pub use sandbox::{Sandbox, SandboxPhase, SandboxSpec, SandboxStatus};
pub use warm_pool::{ImageLocality, ToolSource, WarmPool, WarmPoolSpec, WarmPoolStatus};

/// Label recording which pool a pod belongs to.
pub const LABEL_POOL: &str = "sandboxctl.io/pool";
/// Label recording a pooled pod's lifecycle state: `idle` or
/// `bound:<sandbox-uid>` (spec.md §3 `PooledPod`).
pub const LABEL_STATE: &str = "sandboxctl.io/state";
/// Value of [`LABEL_STATE`] for a ready, unbound pod.
pub const STATE_IDLE: &str = "idle";

/// Build the `state` label value for a pod bound to `sandbox_uid`.
pub fn state_bound(sandbox_uid: &str) -> String {
    format!("bound:{sandbox_uid}")
}

/// Parse a `state` label value, returning `Some(sandbox_uid)` if bound.
pub fn parse_bound_state(value: &str) -> Option<&str> {
    value.strip_prefix("bound:")
}
