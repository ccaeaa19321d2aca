//! In-gateway session state (spec.md §3 "Session"): the mutable wrapper
//! around a bound Sandbox that tracks step history and snapshots.
//!
//! A session's `history` is append-only between restores; a restore
//! truncates it to the target snapshot. Step execution and restore share
//! one per-session mutex so the two can never interleave (spec.md §5
//! "a restore acquires the session mutex exclusively").

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};

/// One step's recorded outcome. `stdout`/`stderr` are retained (capped)
/// alongside their digests: the data model (spec.md §3) names only the
/// digests for the append-only log, but trajectory export (spec.md §4.5)
/// needs the actual text, so both are kept — the digest is the compact,
/// tamper-evident record; the text is what export and debugging want.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub step_name: String,
    pub command: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub stdout_digest: String,
    pub stderr_digest: String,
    pub truncated: bool,
    pub snapshot_id: String,
    pub duration_ms: u64,
}

/// A captured filesystem snapshot: a gzip'd tar of `/workspace` taken
/// immediately after the step that produced it (SPEC_FULL.md §4.5
/// "Snapshot strategy"). Bounded by the same output cap as step
/// stdout/stderr.
pub struct SnapshotRecord {
    pub archive: Vec<u8>,
    pub truncated: bool,
}

struct SessionInner {
    history: Vec<HistoryEntry>,
    snapshots: HashMap<String, SnapshotRecord>,
    tools_registry: Option<Value>,
}

/// A live session: a sandbox binding plus its execution history.
/// Recoverable in principle from the backing Sandbox object plus a
/// history annotation (spec.md §6.3); this in-memory copy is the
/// gateway's working set.
pub struct Session {
    pub id: String,
    pub namespace: String,
    pub pool_ref: String,
    pub sandbox_ref: String,
    pub pod_ref: String,
    pub pod_ip: String,
    pub keep_alive: bool,
    pub created_at: DateTime<Utc>,
    inner: Mutex<SessionInner>,
    /// Serializes whole execute/restore operations against each other
    /// (spec.md §5): held for the duration of a multi-step execute or a
    /// restore, on top of the finer-grained locking `inner` does for
    /// individual state reads/writes.
    pub exec_lock: Mutex<()>,
}

impl Session {
    pub fn new(
        id: String,
        namespace: String,
        pool_ref: String,
        sandbox_ref: String,
        pod_ref: String,
        pod_ip: String,
        keep_alive: bool,
    ) -> Self {
        Self {
            id,
            namespace,
            pool_ref,
            sandbox_ref,
            pod_ref,
            pod_ip,
            keep_alive,
            created_at: Utc::now(),
            exec_lock: Mutex::new(()),
            inner: Mutex::new(SessionInner {
                history: Vec::new(),
                snapshots: HashMap::new(),
                tools_registry: None,
            }),
        }
    }

    /// Number of steps currently recorded.
    pub async fn step_count(&self) -> usize {
        self.inner.lock().await.history.len()
    }

    /// Snapshot the current history for a response body or export.
    pub async fn history(&self) -> Vec<HistoryEntry> {
        self.inner.lock().await.history.clone()
    }

    /// Append one entry and record its snapshot, holding the session
    /// mutex for the whole step (spec.md §5). Returns the lock guard's
    /// scope implicitly; callers execute one step per call so the lock
    /// is held only as long as that RPC takes.
    pub async fn record_step(&self, entry: HistoryEntry, snapshot: SnapshotRecord) {
        let mut guard = self.inner.lock().await;
        guard
            .snapshots
            .insert(entry.snapshot_id.clone(), snapshot);
        guard.history.push(entry);
    }

    /// Look up a snapshot's archive bytes by id.
    pub async fn snapshot_archive(&self, snapshot_id: &str) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .await
            .snapshots
            .get(snapshot_id)
            .map(|s| s.archive.clone())
    }

    /// Truncate `history` to the point immediately after the step that
    /// produced `snapshot_id` (spec.md §3 "a restore truncates to the
    /// target snapshot"). Returns `false` if `snapshot_id` is unknown.
    pub async fn truncate_to(&self, snapshot_id: &str) -> bool {
        let mut guard = self.inner.lock().await;
        let Some(pos) = guard
            .history
            .iter()
            .position(|h| h.snapshot_id == snapshot_id)
        else {
            return false;
        };
        guard.history.truncate(pos + 1);
        let retained: std::collections::HashSet<String> =
            guard.history.iter().map(|h| h.snapshot_id.clone()).collect();
        guard.snapshots.retain(|id, _| retained.contains(id));
        true
    }

    pub async fn cached_tools_registry(&self) -> Option<Value> {
        self.inner.lock().await.tools_registry.clone()
    }

    pub async fn cache_tools_registry(&self, registry: Value) {
        self.inner.lock().await.tools_registry = Some(registry);
    }
}

/// Concurrent map of live sessions (spec.md §5 "session map is a
/// concurrent map").
#[derive(Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, session: Session) -> Arc<Session> {
        let session = Arc::new(session);
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        session
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn remove(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.write().await.remove(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, snapshot_id: &str) -> HistoryEntry {
        HistoryEntry {
            step_name: name.to_string(),
            command: vec!["true".to_string()],
            env: HashMap::new(),
            cwd: "/workspace".to_string(),
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            stdout_digest: String::new(),
            stderr_digest: String::new(),
            truncated: false,
            snapshot_id: snapshot_id.to_string(),
            duration_ms: 1,
        }
    }

    fn snapshot(byte: u8) -> SnapshotRecord {
        SnapshotRecord {
            archive: vec![byte],
            truncated: false,
        }
    }

    fn session() -> Session {
        Session::new(
            "s1".to_string(),
            "default".to_string(),
            "pool-a".to_string(),
            "sbx-1".to_string(),
            "pod-1".to_string(),
            "10.0.0.1".to_string(),
            false,
        )
    }

    #[tokio::test]
    async fn history_preserves_submission_order() {
        let session = session();
        session.record_step(entry("a", "snap-a"), snapshot(1)).await;
        session.record_step(entry("b", "snap-b"), snapshot(2)).await;
        session.record_step(entry("c", "snap-c"), snapshot(3)).await;

        let names: Vec<String> = session
            .history()
            .await
            .into_iter()
            .map(|h| h.step_name)
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn truncate_to_drops_steps_after_target_and_their_snapshots() {
        let session = session();
        session.record_step(entry("a", "snap-a"), snapshot(1)).await;
        session.record_step(entry("b", "snap-b"), snapshot(2)).await;
        session.record_step(entry("c", "snap-c"), snapshot(3)).await;

        assert!(session.truncate_to("snap-b").await);
        assert_eq!(session.step_count().await, 2);
        assert!(session.snapshot_archive("snap-b").await.is_some());
        assert!(session.snapshot_archive("snap-c").await.is_none());
    }

    #[tokio::test]
    async fn truncate_to_unknown_snapshot_is_a_noop_failure() {
        let session = session();
        session.record_step(entry("a", "snap-a"), snapshot(1)).await;

        assert!(!session.truncate_to("does-not-exist").await);
        assert_eq!(session.step_count().await, 1);
    }

    #[tokio::test]
    async fn store_insert_get_remove_roundtrips() {
        let store = SessionStore::new();
        let inserted = store.insert(session()).await;
        assert_eq!(store.get("s1").await.unwrap().id, inserted.id);
        assert!(store.remove("s1").await.is_some());
        assert!(store.get("s1").await.is_none());
    }
}
