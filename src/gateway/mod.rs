//! Execution gateway (spec.md §4.5, §6.2): the HTTP surface agents talk to,
//! plus the session/executor/agent-client machinery it's built on.

pub mod agent_client;
pub mod executor;
pub mod http;
pub mod pools;
pub mod session;
pub mod sessions;
pub mod shell;
pub mod tools;
pub mod trajectory;

use kube::Client;

use crate::audit::AuditSink;
use crate::config::GatewayConfig;
use crate::gateway::session::SessionStore;

/// Shared state handed to every request handler.
pub struct GatewayState {
    pub client: Client,
    pub sessions: SessionStore,
    pub audit: AuditSink,
    pub namespace: String,
    pub config: GatewayConfig,
}

impl GatewayState {
    pub fn new(client: Client, audit: AuditSink, namespace: String, config: GatewayConfig) -> Self {
        Self {
            client,
            sessions: SessionStore::new(),
            audit,
            namespace,
            config,
        }
    }
}
