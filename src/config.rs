//! Configuration for the pool reconciler, sandbox reconciler, and gateway.
//!
//! Loaded from a TOML file (`sandboxctl.toml` by convention) with
//! environment-appropriate defaults, following the same
//! `from_file`/`from_str` shape the rest of the pack uses for its own
//! config types.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub namespace: NamespaceConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceConfig {
    /// Namespace the controllers watch. Empty string means all namespaces.
    #[serde(default = "default_namespace")]
    pub watch: String,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            watch: default_namespace(),
        }
    }
}

fn default_namespace() -> String {
    String::new()
}

/// Reconciler tuning knobs shared by the pool and sandbox controllers
/// (spec.md §4.3, §4.4, §5 — token bucket QPS/burst, worker concurrency,
/// requeue backoff).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    #[serde(default = "default_qps")]
    pub rate_limit_qps: f64,
    #[serde(default = "default_burst")]
    pub rate_limit_burst: u32,
    #[serde(default = "default_workers")]
    pub worker_concurrency: usize,
    #[serde(default = "default_requeue_secs")]
    pub requeue_seconds: u64,
    #[serde(default = "default_backoff_secs")]
    pub error_backoff_seconds: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_seconds: u64,
    /// Lease name used for leader election; distinct lease names partition
    /// a sharded control plane into independent shards.
    #[serde(default = "default_lease_name")]
    pub lease_name: String,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            rate_limit_qps: default_qps(),
            rate_limit_burst: default_burst(),
            worker_concurrency: default_workers(),
            requeue_seconds: default_requeue_secs(),
            error_backoff_seconds: default_backoff_secs(),
            shutdown_grace_seconds: default_shutdown_grace_secs(),
            lease_name: default_lease_name(),
        }
    }
}

fn default_qps() -> f64 {
    10.0
}
fn default_burst() -> u32 {
    20
}
fn default_workers() -> usize {
    4
}
fn default_requeue_secs() -> u64 {
    30
}
fn default_backoff_secs() -> u64 {
    60
}
fn default_shutdown_grace_secs() -> u64 {
    10
}
fn default_lease_name() -> String {
    "sandboxctl-controller-lock".to_string()
}

/// Execution gateway settings (spec.md §4.5, §6.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_session_ready_timeout_secs")]
    pub session_ready_timeout_seconds: u64,
    #[serde(default = "default_status_poll_timeout_secs")]
    pub status_poll_timeout_seconds: u64,
    #[serde(default = "default_step_output_cap_bytes")]
    pub step_output_cap_bytes: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            session_ready_timeout_seconds: default_session_ready_timeout_secs(),
            status_poll_timeout_seconds: default_status_poll_timeout_secs(),
            step_output_cap_bytes: default_step_output_cap_bytes(),
        }
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_session_ready_timeout_secs() -> u64 {
    60
}
fn default_status_poll_timeout_secs() -> u64 {
    60
}
fn default_step_output_cap_bytes() -> usize {
    1024 * 1024
}

/// Fire-and-forget audit sink (spec.md §6.3).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuditConfig {
    /// Path to the JSONL audit log. Unset disables auditing entirely.
    pub path: Option<String>,
}

/// Prometheus metrics server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_addr")]
    pub bind_addr: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_metrics_addr(),
        }
    }
}

fn default_metrics_addr() -> String {
    "0.0.0.0:9090".to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::from_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("failed to parse TOML configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_empty() {
        let config = Config::from_str("").unwrap();
        assert_eq!(config.reconciler.worker_concurrency, 4);
        assert_eq!(config.gateway.bind_addr, "0.0.0.0:8080");
        assert!(config.audit.path.is_none());
    }

    #[test]
    fn overrides_parse() {
        let toml = r#"
            [namespace]
            watch = "agentkernel"

            [reconciler]
            rate_limit_qps = 5.0
            worker_concurrency = 8
            lease_name = "shard-a"

            [gateway]
            bind_addr = "127.0.0.1:9000"
            session_ready_timeout_seconds = 30

            [audit]
            path = "/var/log/sandboxctl/audit.jsonl"
        "#;
        let config = Config::from_str(toml).unwrap();
        assert_eq!(config.namespace.watch, "agentkernel");
        assert_eq!(config.reconciler.rate_limit_qps, 5.0);
        assert_eq!(config.reconciler.worker_concurrency, 8);
        assert_eq!(config.reconciler.lease_name, "shard-a");
        assert_eq!(config.gateway.bind_addr, "127.0.0.1:9000");
        assert_eq!(config.gateway.session_ready_timeout_seconds, 30);
        assert_eq!(
            config.audit.path.as_deref(),
            Some("/var/log/sandboxctl/audit.jsonl")
        );
    }
}
