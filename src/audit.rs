//! Fire-and-forget audit sink (spec.md §6.3, §9 "History as log, not
//! state"). Adapted from the teacher's `AuditEvent`/`AuditLog` JSONL
//! writer: same shape, new event set, and a background channel so the
//! reconciler and gateway request paths never block on disk I/O.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use tokio::sync::mpsc;

/// Audit event types emitted by the pool reconciler, sandbox reconciler,
/// and gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    PoolScaled {
        pool: String,
        ready: usize,
        allocated: usize,
        desired: usize,
    },
    PodCreated {
        pool: String,
        pod: String,
    },
    PodDeleted {
        pool: String,
        pod: String,
        reason: String,
    },
    SandboxBound {
        sandbox: String,
        pool: String,
        pod: String,
    },
    SandboxReady {
        sandbox: String,
        pod: String,
    },
    SandboxFailed {
        sandbox: String,
        pod: Option<String>,
        reason: String,
    },
    StepExecuted {
        session: String,
        step: String,
        exit_code: Option<i32>,
        snapshot_id: Option<String>,
    },
    SessionRestored {
        session: String,
        snapshot_id: String,
    },
}

/// A logged audit entry with metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub pid: u32,
    pub event: AuditEvent,
}

impl AuditEntry {
    fn new(event: AuditEvent) -> Self {
        Self {
            timestamp: Utc::now(),
            pid: std::process::id(),
            event,
        }
    }
}

/// Handle for submitting audit events. Cloneable; sending never blocks the
/// caller beyond an unbounded channel push.
#[derive(Clone)]
pub struct AuditSink {
    tx: Option<mpsc::UnboundedSender<AuditEvent>>,
}

impl AuditSink {
    /// Spawn a sink writing JSONL to `path`. Returns a disabled sink (every
    /// `log` call is a no-op) when `path` is `None`, per spec.md §6.3's
    /// "best-effort" / optional configuration.
    pub fn spawn(path: Option<PathBuf>) -> Self {
        let Some(path) = path else {
            return Self { tx: None };
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<AuditEvent>();

        tokio::spawn(async move {
            if let Some(parent) = path.parent() {
                if let Err(e) = fs::create_dir_all(parent) {
                    tracing::warn!(error = %e, "failed to create audit log directory");
                }
            }

            while let Some(event) = rx.recv().await {
                let entry = AuditEntry::new(event);
                let line = match serde_json::to_string(&entry) {
                    Ok(l) => l,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to serialize audit entry");
                        continue;
                    }
                };

                let result = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .and_then(|mut file| writeln!(file, "{}", line));

                if let Err(e) = result {
                    tracing::warn!(error = %e, "failed to write audit entry");
                }
            }
        });

        Self { tx: Some(tx) }
    }

    /// A sink that drops every event (auditing disabled).
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Log an event. Never blocks; failures are logged and dropped, never
    /// propagated to the caller.
    pub fn log(&self, event: AuditEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufRead;

    #[tokio::test]
    async fn writes_jsonl_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let sink = AuditSink::spawn(Some(path.clone()));

        sink.log(AuditEvent::PoolScaled {
            pool: "p".to_string(),
            ready: 2,
            allocated: 0,
            desired: 2,
        });
        sink.log(AuditEvent::SandboxBound {
            sandbox: "s1".to_string(),
            pool: "p".to_string(),
            pod: "pod-0".to_string(),
        });

        // Give the background task a chance to drain the channel.
        for _ in 0..50 {
            if path.exists() && fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let file = fs::File::open(&path).unwrap();
        let lines: Vec<_> = std::io::BufReader::new(file).lines().collect();
        assert_eq!(lines.len(), 2);
    }

    #[test]
    fn disabled_sink_drops_everything() {
        let sink = AuditSink::disabled();
        sink.log(AuditEvent::PodCreated {
            pool: "p".to_string(),
            pod: "x".to_string(),
        });
    }
}
