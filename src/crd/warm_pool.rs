//! `WarmPool` CRD (spec.md §3 "WarmPool"). Generalizes the teacher's
//! `AgentSandboxPool` (`kubernetes_operator.rs`): instead of a fixed
//! image/vcpus/memory spec, `podTemplate` is passed through opaquely (the
//! operator does not interpret container contents beyond locating the
//! primary container's image for placement, per spec.md §4.3 step 5).

use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A tool image to co-provision into pooled pods via an init container
/// (spec.md §4.3 step 5).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ToolSource {
    /// Container image carrying `/opt/arl/tools/*`.
    pub image: String,
}

/// Image-locality placement configuration (spec.md §3, §4.1, §4.3).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ImageLocality {
    #[serde(default)]
    pub enabled: bool,
    /// Multiplied by `replicas` and rounded up to get the affinity
    /// candidate count `k` (spec.md §4.3 step 5).
    #[serde(default = "default_spread_factor")]
    pub spread_factor: f64,
    /// Node affinity term weight, 1..=100.
    #[serde(default = "default_weight")]
    pub weight: i32,
}

fn default_spread_factor() -> f64 {
    1.0
}

fn default_weight() -> i32 {
    50
}

impl Default for ImageLocality {
    fn default() -> Self {
        Self {
            enabled: false,
            spread_factor: default_spread_factor(),
            weight: default_weight(),
        }
    }
}

/// Spec for the `WarmPool` custom resource.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "sandboxctl.io",
    version = "v1alpha1",
    kind = "WarmPool",
    plural = "warmpools",
    shortname = "wp",
    status = "WarmPoolStatus",
    namespaced
)]
pub struct WarmPoolSpec {
    /// Desired ready, idle pod count. Must be `> 0`.
    pub replicas: u32,
    /// Opaque pod template; must contain an executor and sidecar container
    /// sharing a volume (spec.md §3; not validated beyond presence).
    pub pod_template: PodTemplateSpec,
    /// Tool images to co-provision (spec.md §4.3 step 5).
    #[serde(default)]
    pub tools: Vec<ToolSource>,
    #[serde(default)]
    pub image_locality: ImageLocality,
}

/// Status for the `WarmPool` CR (spec.md §3 `WarmPool.status`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct WarmPoolStatus {
    #[serde(default)]
    pub ready_replicas: u32,
    #[serde(default)]
    pub allocated_replicas: u32,
    #[serde(default)]
    pub last_scale_time: Option<Time>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}
