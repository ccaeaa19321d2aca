//! Step execution, snapshot capture, and restore (spec.md §4.5 "Step
//! execution", "Restore"). Talks to the in-pod agent over the gRPC
//! contract in spec.md §6.1.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tonic::Request;

use crate::agent_proto::{ExecuteRequest, ResetRequest, UpdateFilesRequest};
use crate::error::GatewayError;
use crate::gateway::agent_client;
use crate::gateway::session::{HistoryEntry, Session, SnapshotRecord};

const SNAPSHOT_ARCHIVE_NAME: &str = "/tmp/.sandboxctl-snapshot.tar.gz";
/// Default per-step RPC deadline when a step doesn't specify its own
/// `timeoutSeconds` (spec.md §5's request-timeout default tier; the
/// gateway-wide 60s default is reserved for status polls).
const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRequest {
    pub name: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub work_dir: Option<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub background: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub name: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub snapshot_id: String,
    pub truncated: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResponse {
    pub results: Vec<StepResult>,
    pub total_duration_ms: u64,
    /// Name of the step that aborted the run with a non-zero exit, if any
    /// (spec.md §4.5 "abort the remaining steps and return the partial
    /// result; the outer response indicates which step failed").
    pub failed_step: Option<String>,
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Run one command to completion against the pod agent, collecting
/// stdout/stderr up to `cap` bytes each.
async fn run_one(
    client: &mut crate::agent_proto::pod_agent_client::PodAgentClient<tonic::transport::Channel>,
    command: Vec<String>,
    env: HashMap<String, String>,
    working_dir: String,
    timeout: Duration,
    cap: usize,
) -> Result<(i32, Vec<u8>, Vec<u8>, bool), GatewayError> {
    let mut req = Request::new(ExecuteRequest {
        command,
        env,
        working_dir,
        background: false,
        timeout_seconds: timeout.as_secs() as u32,
    });
    req.set_timeout(timeout);

    let mut stream = client
        .execute(req)
        .await
        .map_err(GatewayError::from)?
        .into_inner();

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut truncated = false;
    let mut exit_code = 0;

    loop {
        let chunk = match stream.message().await {
            Ok(Some(c)) => c,
            Ok(None) => break,
            Err(status) => return Err(GatewayError::from(status)),
        };

        if stdout.len() < cap {
            let remaining = cap - stdout.len();
            if chunk.stdout_chunk.len() > remaining {
                truncated = true;
                stdout.extend_from_slice(&chunk.stdout_chunk[..remaining]);
            } else {
                stdout.extend_from_slice(&chunk.stdout_chunk);
            }
        } else if !chunk.stdout_chunk.is_empty() {
            truncated = true;
        }

        if stderr.len() < cap {
            let remaining = cap - stderr.len();
            if chunk.stderr_chunk.len() > remaining {
                truncated = true;
                stderr.extend_from_slice(&chunk.stderr_chunk[..remaining]);
            } else {
                stderr.extend_from_slice(&chunk.stderr_chunk);
            }
        } else if !chunk.stderr_chunk.is_empty() {
            truncated = true;
        }

        if chunk.done {
            exit_code = chunk.exit_code;
            break;
        }
    }

    Ok((exit_code, stdout, stderr, truncated))
}

/// Capture a gzip'd tar of `/workspace` via the agent's `Execute` RPC,
/// bounded by `cap` (SPEC_FULL.md §4.5 "Snapshot strategy").
async fn capture_snapshot(
    client: &mut crate::agent_proto::pod_agent_client::PodAgentClient<tonic::transport::Channel>,
    cap: usize,
    timeout: Duration,
) -> Result<SnapshotRecord, GatewayError> {
    let (exit_code, archive, _stderr, truncated) = run_one(
        client,
        vec![
            "sh".to_string(),
            "-c".to_string(),
            "tar czf - -C /workspace .".to_string(),
        ],
        HashMap::new(),
        "/".to_string(),
        timeout,
        cap,
    )
    .await?;

    if exit_code != 0 {
        return Err(GatewayError::Internal(
            "snapshot capture command failed".to_string(),
        ));
    }

    Ok(SnapshotRecord { archive, truncated })
}

/// Execute an ordered list of steps strictly sequentially (spec.md §4.5),
/// aborting on the first non-zero exit code. Serialized against restore
/// via `session.exec_lock`.
pub async fn execute_steps(
    session: &Session,
    steps: Vec<StepRequest>,
    output_cap: usize,
    audit: &crate::audit::AuditSink,
) -> Result<ExecuteResponse, GatewayError> {
    let _guard = session.exec_lock.lock().await;

    let mut client = agent_client::connect(&session.pod_ip, Duration::from_secs(10)).await?;

    let started = Instant::now();
    let mut results = Vec::with_capacity(steps.len());
    let mut failed_step = None;

    for step in steps {
        let timeout = step
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_STEP_TIMEOUT);
        let work_dir = step.work_dir.clone().unwrap_or_else(|| "/workspace".to_string());
        let step_started = Instant::now();

        if step.background {
            let mut req = Request::new(ExecuteRequest {
                command: step.command.clone(),
                env: step.env.clone(),
                working_dir: work_dir.clone(),
                background: true,
                timeout_seconds: timeout.as_secs() as u32,
            });
            req.set_timeout(timeout);
            let mut stream = client
                .execute(req)
                .await
                .map_err(GatewayError::from)?
                .into_inner();
            // Background steps return as soon as the server reports the
            // spawn (spec.md §6.1 "done=true immediately after spawning").
            let mut pid = None;
            while let Some(chunk) = stream.message().await.map_err(GatewayError::from)? {
                if chunk.done {
                    pid = chunk.pid;
                    break;
                }
            }
            let duration_ms = step_started.elapsed().as_millis() as u64;
            let snapshot_id = String::new();
            results.push(StepResult {
                name: step.name.clone(),
                exit_code: 0,
                stdout: pid.map(|p| format!("pid={p}")).unwrap_or_default(),
                stderr: String::new(),
                duration_ms,
                snapshot_id,
                truncated: false,
            });

            let entry = HistoryEntry {
                step_name: step.name.clone(),
                command: step.command,
                env: step.env,
                cwd: work_dir,
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
                stdout_digest: sha256_hex(b""),
                stderr_digest: sha256_hex(b""),
                truncated: false,
                snapshot_id: String::new(),
                duration_ms,
            };
            session
                .record_step(
                    entry,
                    SnapshotRecord {
                        archive: Vec::new(),
                        truncated: false,
                    },
                )
                .await;
            audit.log(crate::audit::AuditEvent::StepExecuted {
                session: session.id.clone(),
                step: step.name,
                exit_code: Some(0),
                snapshot_id: None,
            });
            continue;
        }

        let (exit_code, stdout, stderr, truncated) = run_one(
            &mut client,
            step.command.clone(),
            step.env.clone(),
            work_dir.clone(),
            timeout,
            output_cap,
        )
        .await?;

        let snapshot = capture_snapshot(&mut client, output_cap, timeout).await?;
        let snapshot_id = sha256_hex(&snapshot.archive);
        let duration_ms = step_started.elapsed().as_millis() as u64;

        let stdout_text = String::from_utf8_lossy(&stdout).to_string();
        let stderr_text = String::from_utf8_lossy(&stderr).to_string();

        let entry = HistoryEntry {
            step_name: step.name.clone(),
            command: step.command,
            env: step.env,
            cwd: work_dir,
            exit_code,
            stdout: stdout_text.clone(),
            stderr: stderr_text.clone(),
            stdout_digest: sha256_hex(&stdout),
            stderr_digest: sha256_hex(&stderr),
            truncated: truncated || snapshot.truncated,
            snapshot_id: snapshot_id.clone(),
            duration_ms,
        };
        session.record_step(entry, snapshot).await;

        audit.log(crate::audit::AuditEvent::StepExecuted {
            session: session.id.clone(),
            step: step.name.clone(),
            exit_code: Some(exit_code),
            snapshot_id: Some(snapshot_id.clone()),
        });

        results.push(StepResult {
            name: step.name.clone(),
            exit_code,
            stdout: stdout_text,
            stderr: stderr_text,
            duration_ms,
            snapshot_id,
            truncated,
        });

        if exit_code != 0 {
            failed_step = Some(step.name);
            break;
        }
    }

    Ok(ExecuteResponse {
        results,
        total_duration_ms: started.elapsed().as_millis() as u64,
        failed_step,
    })
}

/// Restore the session's filesystem to the state captured by
/// `snapshot_id`, truncating `history` to that point (spec.md §4.5
/// "Restore"). Serialized against `execute_steps` via `exec_lock`.
pub async fn restore(
    session: &Session,
    snapshot_id: &str,
    audit: &crate::audit::AuditSink,
) -> Result<(), GatewayError> {
    let _guard = session.exec_lock.lock().await;

    let Some(archive) = session.snapshot_archive(snapshot_id).await else {
        return Err(GatewayError::NotFound(format!(
            "snapshot {snapshot_id} not found"
        )));
    };

    let mut client = agent_client::connect(&session.pod_ip, Duration::from_secs(30)).await?;

    client
        .reset(Request::new(ResetRequest {
            preserve_files: Vec::new(),
        }))
        .await
        .map_err(GatewayError::from)?;

    let mut files = HashMap::new();
    files.insert(SNAPSHOT_ARCHIVE_NAME.to_string(), archive);
    client
        .update_files(Request::new(UpdateFilesRequest {
            base_path: "/".to_string(),
            files,
            patch: None,
        }))
        .await
        .map_err(GatewayError::from)?;

    let (exit_code, _stdout, stderr, _truncated) = run_one(
        &mut client,
        vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("mkdir -p /workspace && tar xzf {SNAPSHOT_ARCHIVE_NAME} -C /workspace && rm -f {SNAPSHOT_ARCHIVE_NAME}"),
        ],
        HashMap::new(),
        "/".to_string(),
        Duration::from_secs(30),
        64 * 1024,
    )
    .await?;

    if exit_code != 0 {
        return Err(GatewayError::Internal(format!(
            "restore unpack failed: {}",
            String::from_utf8_lossy(&stderr)
        )));
    }

    if !session.truncate_to(snapshot_id).await {
        return Err(GatewayError::NotFound(format!(
            "snapshot {snapshot_id} not found"
        )));
    }

    audit.log(crate::audit::AuditEvent::SessionRestored {
        session: session.id.clone(),
        snapshot_id: snapshot_id.to_string(),
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::session::Session;

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

    #[test]
    fn sha256_hex_is_deterministic_and_content_sensitive() {
        assert_eq!(sha256_hex(b"hello"), sha256_hex(b"hello"));
        assert_ne!(sha256_hex(b"hello"), sha256_hex(b"world"));
    }

    #[tokio::test]
    async fn restore_of_unknown_snapshot_fails_before_contacting_the_agent() {
        // No live agent is reachable at this pod IP; a correct restore()
        // returns NotFound from the snapshot lookup without ever dialing it.
        let session = session();
        let audit = crate::audit::AuditSink::disabled();
        let err = restore(&session, "does-not-exist", &audit).await.unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }
}
