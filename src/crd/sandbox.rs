//! `Sandbox` CRD (spec.md §3 "Sandbox"). Generalizes the teacher's
//! `AgentSandbox` (`kubernetes_operator.rs`): phase becomes the closed
//! `SandboxPhase` enum from spec.md §4.4 rather than a free string, and
//! `podRef` replaces the teacher's single-field `podName`.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Lifecycle phase of a `Sandbox` (spec.md §3, §4.4 state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum SandboxPhase {
    Pending,
    Bound,
    Ready,
    Failed,
    Terminating,
}

impl Default for SandboxPhase {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for SandboxPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SandboxPhase::Pending => "Pending",
            SandboxPhase::Bound => "Bound",
            SandboxPhase::Ready => "Ready",
            SandboxPhase::Failed => "Failed",
            SandboxPhase::Terminating => "Terminating",
        };
        f.write_str(s)
    }
}

/// Spec for the `Sandbox` custom resource, declared by a user via the
/// gateway (spec.md §3).
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "sandboxctl.io",
    version = "v1alpha1",
    kind = "Sandbox",
    plural = "sandboxes",
    shortname = "sbx",
    status = "SandboxStatus",
    namespaced
)]
pub struct SandboxSpec {
    /// Target pool name. Required, non-empty.
    pub pool_ref: String,
    #[serde(default)]
    pub keep_alive: bool,
}

/// Status for the `Sandbox` CR.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct SandboxStatus {
    #[serde(default)]
    pub phase: SandboxPhase,
    /// Name of the bound pod once `phase == Bound`.
    #[serde(default)]
    pub pod_ref: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}
