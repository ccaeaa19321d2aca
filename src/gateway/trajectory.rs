//! Trajectory export (spec.md §4.5 "Trajectory export"): renders a
//! session's history as the JSONL action/observation log consumed by
//! downstream training or evaluation pipelines.

use serde::Serialize;

use crate::error::GatewayError;
use crate::gateway::session::{HistoryEntry, Session};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Action {
    command: Vec<String>,
    env: std::collections::HashMap<String, String>,
    cwd: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Observation {
    stdout: String,
    stderr: String,
    exit_code: i32,
    truncated: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TrajectoryLine {
    step_name: String,
    action: Action,
    observation: Observation,
    snapshot_id: String,
    duration_ms: u64,
}

impl From<HistoryEntry> for TrajectoryLine {
    fn from(entry: HistoryEntry) -> Self {
        TrajectoryLine {
            step_name: entry.step_name,
            action: Action {
                command: entry.command,
                env: entry.env,
                cwd: entry.cwd,
            },
            observation: Observation {
                stdout: entry.stdout,
                stderr: entry.stderr,
                exit_code: entry.exit_code,
                truncated: entry.truncated,
            },
            snapshot_id: entry.snapshot_id,
            duration_ms: entry.duration_ms,
        }
    }
}

/// Render `session`'s full history as newline-delimited JSON, one action
/// per line, in execution order.
pub async fn export(session: &Session) -> Result<String, GatewayError> {
    let history = session.history().await;
    let mut out = String::new();
    for entry in history {
        let line = TrajectoryLine::from(entry);
        out.push_str(&serde_json::to_string(&line)?);
        out.push('\n');
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::session::SnapshotRecord;
    use std::collections::HashMap;

    #[tokio::test]
    async fn exports_one_json_line_per_step() {
        let session = Session::new(
            "s1".to_string(),
            "default".to_string(),
            "pool-a".to_string(),
            "sbx-1".to_string(),
            "pod-1".to_string(),
            "10.0.0.1".to_string(),
            false,
        );
        session
            .record_step(
                HistoryEntry {
                    step_name: "build".to_string(),
                    command: vec!["make".to_string()],
                    env: HashMap::new(),
                    cwd: "/workspace".to_string(),
                    exit_code: 0,
                    stdout: "ok".to_string(),
                    stderr: String::new(),
                    stdout_digest: "d1".to_string(),
                    stderr_digest: "d2".to_string(),
                    truncated: false,
                    snapshot_id: "snap1".to_string(),
                    duration_ms: 12,
                },
                SnapshotRecord {
                    archive: Vec::new(),
                    truncated: false,
                },
            )
            .await;

        let rendered = export(&session).await.unwrap();
        let lines: Vec<_> = rendered.lines().collect();
        assert_eq!(lines.len(), 1);
        let parsed: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["stepName"], "build");
        assert_eq!(parsed["action"]["command"][0], "make");
        assert_eq!(parsed["snapshotId"], "snap1");
    }
}
