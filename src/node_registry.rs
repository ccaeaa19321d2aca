//! Node registry — C2.
//!
//! Watches node create/update/delete events and maintains the set of
//! schedulable node names behind a reader/writer lock (spec.md §4.2, §5).
//! This is the sole input to C1's ranking.

use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Returns true iff `node` is not cordoned and reports `Ready=True`.
fn is_schedulable(node: &Node) -> bool {
    let unschedulable = node
        .spec
        .as_ref()
        .and_then(|s| s.unschedulable)
        .unwrap_or(false);
    if unschedulable {
        return false;
    }

    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// The set of currently schedulable node names. Readers receive a
/// consistent snapshot via copy-on-read; there is no persistence.
#[derive(Clone, Default)]
pub struct NodeSet {
    inner: Arc<RwLock<HashSet<String>>>,
}

impl NodeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the current schedulable node names as a sorted vector, so
    /// callers (notably C1) get a deterministic ordering.
    pub async fn snapshot(&self) -> Vec<String> {
        let guard = self.inner.read().await;
        let mut names: Vec<String> = guard.iter().cloned().collect();
        names.sort();
        names
    }

    async fn upsert(&self, name: String, schedulable: bool) {
        let mut guard = self.inner.write().await;
        if schedulable {
            guard.insert(name);
        } else {
            guard.remove(&name);
        }
    }

    async fn remove(&self, name: &str) {
        let mut guard = self.inner.write().await;
        guard.remove(name);
    }
}

/// Run the node watcher until `shutdown` is cancelled, updating `nodes` on
/// every create/update/delete event.
pub async fn run(client: Client, nodes: NodeSet, shutdown: CancellationToken) {
    let api: Api<Node> = Api::all(client);
    let mut stream = watcher::watcher(api, watcher::Config::default()).boxed();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("node registry watcher shutting down");
                break;
            }
            event = stream.next() => {
                match event {
                    Some(Ok(watcher::Event::Apply(node))) => {
                        let name = node.name_any();
                        let schedulable = is_schedulable(&node);
                        nodes.upsert(name, schedulable).await;
                    }
                    Some(Ok(watcher::Event::Delete(node))) => {
                        nodes.remove(&node.name_any()).await;
                    }
                    Some(Ok(watcher::Event::Init)) | Some(Ok(watcher::Event::InitApply(_))) | Some(Ok(watcher::Event::InitDone)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "node watcher error, continuing");
                    }
                    None => {
                        tracing::warn!("node watcher stream ended, stopping");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeCondition, NodeSpec, NodeStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn node(name: &str, unschedulable: bool, ready: bool) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                unschedulable: Some(unschedulable),
                ..Default::default()
            }),
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn schedulable_requires_ready_and_uncordoned() {
        assert!(is_schedulable(&node("a", false, true)));
        assert!(!is_schedulable(&node("a", true, true)));
        assert!(!is_schedulable(&node("a", false, false)));
        assert!(!is_schedulable(&node("a", true, false)));
    }

    #[tokio::test]
    async fn upsert_and_snapshot() {
        let set = NodeSet::new();
        set.upsert("a".to_string(), true).await;
        set.upsert("b".to_string(), true).await;
        set.upsert("c".to_string(), false).await;
        assert_eq!(set.snapshot().await, vec!["a".to_string(), "b".to_string()]);

        set.remove("a").await;
        assert_eq!(set.snapshot().await, vec!["b".to_string()]);
    }
}
