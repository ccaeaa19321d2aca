//! sandboxctl — control plane for ultra-low-latency, isolated sandbox
//! execution environments on Kubernetes.
//!
//! Draws pre-warmed pods from a continuously replenished [`pool`], binds
//! them to user-visible [`sandbox`] requests through a race-free protocol,
//! and exposes synchronous step execution over the [`gateway`].

pub mod agent_proto {
    tonic::include_proto!("agentkernel.pod.v1");
}

pub mod audit;
pub mod config;
pub mod crd;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod node_registry;
pub mod pool;
pub mod rendezvous;
pub mod sandbox;
pub mod shutdown;
