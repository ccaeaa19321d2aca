//! Reference implementation of the `PodAgent` gRPC contract (spec.md
//! §6.1). Runs as the sidecar container of a pooled pod; the gateway
//! dials it over the pod network at `AGENT_PORT`. Exists as a conformant
//! test double — production pod images may ship their own agent as long
//! as it speaks the same contract.
//!
//! Adapted from the teacher's vsock JSON-RPC guest agent: same role
//! (in-guest command execution, file transfer, PTY shell), new transport
//! (gRPC over the pod network instead of vsock JSON-RPC, since pods are
//! reached over ordinary cluster networking, not a microVM's vsock) and
//! new wire contract (the shared `agentkernel.pod.v1.PodAgent` protobuf
//! service rather than the teacher's bespoke `AgentRequest`/`AgentResponse`
//! JSON frames).

mod patch;
mod pty;

mod agent_proto {
    tonic::include_proto!("agentkernel.pod.v1");
}

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_stream::Stream;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming, transport::Server};

use agent_proto::pod_agent_server::{PodAgent, PodAgentServer};
use agent_proto::shell_input::Payload as InputPayload;
use agent_proto::shell_output::Payload as OutputPayload;
use agent_proto::{
    ExecuteChunk, ExecuteRequest, ResetRequest, ResetResponse, ShellInput, ShellOutput,
    SignalProcessRequest, SignalProcessResponse, UpdateFilesRequest, UpdateFilesResponse,
};

/// Port the agent listens on. Matches `sandboxctl::gateway::agent_client::AGENT_PORT`.
const AGENT_PORT: u16 = 52100;

/// Root the agent treats as the session's working tree. `UpdateFiles`,
/// `Execute`'s default working dir, and `Reset` all key off this.
const WORKSPACE_ROOT: &str = "/workspace";

const STREAM_CHUNK_BYTES: usize = 32 * 1024;

struct AgentService;

fn resolve_under(base: &str, relative: &str) -> PathBuf {
    Path::new(base).join(relative.trim_start_matches('/'))
}

#[tonic::async_trait]
impl PodAgent for AgentService {
    type ExecuteStream = Pin<Box<dyn Stream<Item = Result<ExecuteChunk, Status>> + Send + 'static>>;
    type InteractiveShellStream =
        Pin<Box<dyn Stream<Item = Result<ShellOutput, Status>> + Send + 'static>>;

    async fn update_files(
        &self,
        request: Request<UpdateFilesRequest>,
    ) -> Result<Response<UpdateFilesResponse>, Status> {
        let req = request.into_inner();
        let base = if req.base_path.is_empty() {
            WORKSPACE_ROOT.to_string()
        } else {
            req.base_path
        };

        if let Some(patch_text) = &req.patch {
            if !req.files.is_empty() {
                return Err(Status::invalid_argument(
                    "updateFiles: files and patch are mutually exclusive",
                ));
            }
            patch::apply(Path::new(&base), patch_text)
                .await
                .map_err(|e| Status::internal(format!("applying patch: {e}")))?;
            return Ok(Response::new(UpdateFilesResponse {
                success: true,
                message: String::new(),
            }));
        }

        for (rel_path, content) in req.files {
            let full_path = resolve_under(&base, &rel_path);
            if let Some(parent) = full_path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| Status::internal(format!("creating {}: {e}", parent.display())))?;
            }
            tokio::fs::write(&full_path, content)
                .await
                .map_err(|e| Status::internal(format!("writing {}: {e}", full_path.display())))?;
        }

        Ok(Response::new(UpdateFilesResponse {
            success: true,
            message: String::new(),
        }))
    }

    async fn execute(
        &self,
        request: Request<ExecuteRequest>,
    ) -> Result<Response<Self::ExecuteStream>, Status> {
        let req = request.into_inner();
        if req.command.is_empty() {
            return Err(Status::invalid_argument("execute: command must be non-empty"));
        }

        let working_dir = if req.working_dir.is_empty() {
            WORKSPACE_ROOT.to_string()
        } else {
            req.working_dir
        };

        let mut cmd = Command::new(&req.command[0]);
        cmd.args(&req.command[1..]);
        cmd.current_dir(&working_dir);
        cmd.envs(&req.env);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| Status::internal(format!("spawning command: {e}")))?;
        let pid = child.id();

        let (tx, rx) = mpsc::channel::<Result<ExecuteChunk, Status>>(16);

        if req.background {
            let _ = tx
                .send(Ok(ExecuteChunk {
                    stdout_chunk: Vec::new(),
                    stderr_chunk: Vec::new(),
                    done: true,
                    exit_code: 0,
                    pid,
                }))
                .await;

            let mut stdout = child.stdout.take();
            let mut stderr = child.stderr.take();
            tokio::spawn(async move {
                if let Some(mut stdout) = stdout.take() {
                    let _ = tokio::io::copy(&mut stdout, &mut tokio::io::sink()).await;
                }
            });
            tokio::spawn(async move {
                if let Some(mut stderr) = stderr.take() {
                    let _ = tokio::io::copy(&mut stderr, &mut tokio::io::sink()).await;
                }
            });
            tokio::spawn(async move {
                let _ = child.wait().await;
            });

            return Ok(Response::new(Box::pin(ReceiverStream::new(rx))));
        }

        let timeout = std::time::Duration::from_secs(req.timeout_seconds.max(1) as u64);
        tokio::spawn(async move {
            let mut stdout = child.stdout.take().expect("stdout piped");
            let mut stderr = child.stderr.take().expect("stderr piped");

            let run = async {
                let mut stdout_buf = [0u8; STREAM_CHUNK_BYTES];
                let mut stderr_buf = [0u8; STREAM_CHUNK_BYTES];
                let mut stdout_open = true;
                let mut stderr_open = true;

                while stdout_open || stderr_open {
                    tokio::select! {
                        n = stdout.read(&mut stdout_buf), if stdout_open => {
                            match n {
                                Ok(0) => stdout_open = false,
                                Ok(n) => {
                                    let chunk = ExecuteChunk {
                                        stdout_chunk: stdout_buf[..n].to_vec(),
                                        stderr_chunk: Vec::new(),
                                        done: false,
                                        exit_code: 0,
                                        pid: None,
                                    };
                                    if tx.send(Ok(chunk)).await.is_err() {
                                        return;
                                    }
                                }
                                Err(_) => stdout_open = false,
                            }
                        }
                        n = stderr.read(&mut stderr_buf), if stderr_open => {
                            match n {
                                Ok(0) => stderr_open = false,
                                Ok(n) => {
                                    let chunk = ExecuteChunk {
                                        stdout_chunk: Vec::new(),
                                        stderr_chunk: stderr_buf[..n].to_vec(),
                                        done: false,
                                        exit_code: 0,
                                        pid: None,
                                    };
                                    if tx.send(Ok(chunk)).await.is_err() {
                                        return;
                                    }
                                }
                                Err(_) => stderr_open = false,
                            }
                        }
                    }
                }

                let exit_code = match child.wait().await {
                    Ok(status) => status.code().unwrap_or(-1),
                    Err(_) => -1,
                };
                let _ = tx
                    .send(Ok(ExecuteChunk {
                        stdout_chunk: Vec::new(),
                        stderr_chunk: Vec::new(),
                        done: true,
                        exit_code,
                        pid,
                    }))
                    .await;
            };

            if tokio::time::timeout(timeout, run).await.is_err() {
                let _ = child.start_kill();
                let _ = tx
                    .send(Ok(ExecuteChunk {
                        stdout_chunk: Vec::new(),
                        stderr_chunk: Vec::new(),
                        done: true,
                        exit_code: 124,
                        pid,
                    }))
                    .await;
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn signal_process(
        &self,
        request: Request<SignalProcessRequest>,
    ) -> Result<Response<SignalProcessResponse>, Status> {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let req = request.into_inner();
        let signal = match req.signal.as_str() {
            "SIGTERM" => Signal::SIGTERM,
            "SIGKILL" => Signal::SIGKILL,
            "SIGINT" => Signal::SIGINT,
            other => return Err(Status::invalid_argument(format!("unsupported signal {other}"))),
        };

        match kill(Pid::from_raw(req.pid as i32), signal) {
            Ok(()) => Ok(Response::new(SignalProcessResponse {
                success: true,
                message: String::new(),
            })),
            Err(e) => Ok(Response::new(SignalProcessResponse {
                success: false,
                message: e.to_string(),
            })),
        }
    }

    async fn reset(&self, request: Request<ResetRequest>) -> Result<Response<ResetResponse>, Status> {
        let req = request.into_inner();
        let preserve: std::collections::HashSet<String> = req.preserve_files.into_iter().collect();

        let mut entries = match tokio::fs::read_dir(WORKSPACE_ROOT).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tokio::fs::create_dir_all(WORKSPACE_ROOT)
                    .await
                    .map_err(|e| Status::internal(e.to_string()))?;
                return Ok(Response::new(ResetResponse {
                    success: true,
                    message: String::new(),
                }));
            }
            Err(e) => return Err(Status::internal(format!("reading {WORKSPACE_ROOT}: {e}"))),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Status::internal(e.to_string()))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if preserve.contains(&name) {
                continue;
            }
            let path = entry.path();
            let result = if entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false)
            {
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_file(&path).await
            };
            if let Err(e) = result {
                return Ok(Response::new(ResetResponse {
                    success: false,
                    message: format!("removing {}: {e}", path.display()),
                }));
            }
        }

        Ok(Response::new(ResetResponse {
            success: true,
            message: String::new(),
        }))
    }

    async fn interactive_shell(
        &self,
        request: Request<Streaming<ShellInput>>,
    ) -> Result<Response<Self::InteractiveShellStream>, Status> {
        let mut inbound = request.into_inner();

        let (rows, cols, pending_first) = match inbound.message().await {
            Ok(Some(ShellInput {
                payload: Some(InputPayload::Resize(r)),
            })) => (r.rows as u16, r.cols as u16, None),
            Ok(Some(other)) => (24, 80, Some(other)),
            Ok(None) => return Err(Status::invalid_argument("shell closed before any input")),
            Err(e) => return Err(e),
        };

        let mut session = pty::PtySession::spawn(
            "shell".to_string(),
            "/bin/sh",
            &[],
            rows.max(1),
            cols.max(1),
            None,
        )
        .map_err(|e| Status::internal(format!("spawning shell: {e}")))?;

        let io = session.take_io().expect("freshly spawned session owns its io");
        let (mut pty_reader, mut pty_writer) = tokio::io::split(io);

        let (tx, rx) = mpsc::channel::<Result<ShellOutput, Status>>(32);

        if let Some(ShellInput { payload: Some(p) }) = pending_first {
            match p {
                InputPayload::Data(data) => {
                    let _ = pty_writer.write_all(&data).await;
                }
                InputPayload::Signal(_) => {}
                InputPayload::Resize(r) => {
                    let _ = session.resize(r.rows as u16, r.cols as u16);
                }
            }
        }

        let write_tx = tx.clone();
        tokio::spawn(async move {
            loop {
                match inbound.message().await {
                    Ok(Some(ShellInput { payload: Some(p) })) => match p {
                        InputPayload::Data(data) => {
                            if pty_writer.write_all(&data).await.is_err() {
                                break;
                            }
                        }
                        InputPayload::Signal(sig) => {
                            use nix::sys::signal::{Signal, kill};
                            let signal = match sig.as_str() {
                                "SIGTERM" => Some(Signal::SIGTERM),
                                "SIGKILL" => Some(Signal::SIGKILL),
                                "SIGINT" => Some(Signal::SIGINT),
                                _ => None,
                            };
                            if let (Some(signal), Some(pid)) = (signal, session.pid()) {
                                let _ = kill(pid, signal);
                            }
                        }
                        InputPayload::Resize(r) => {
                            let _ = session.resize(r.rows as u16, r.cols as u16);
                        }
                    },
                    Ok(Some(ShellInput { payload: None })) => {}
                    Ok(None) => break,
                    Err(_) => break,
                }
            }

            let exit_code = wait_for_exit(&mut session).await;
            let _ = write_tx
                .send(Ok(ShellOutput {
                    payload: Some(OutputPayload::ExitCode(exit_code)),
                }))
                .await;
            let _ = write_tx
                .send(Ok(ShellOutput {
                    payload: Some(OutputPayload::Closed(true)),
                }))
                .await;
        });

        tokio::spawn(async move {
            let mut buf = [0u8; STREAM_CHUNK_BYTES];
            loop {
                match pty_reader.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        let chunk = ShellOutput {
                            payload: Some(OutputPayload::Data(buf[..n].to_vec())),
                        };
                        if tx.send(Ok(chunk)).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}

async fn wait_for_exit(session: &mut pty::PtySession) -> i32 {
    for _ in 0..600 {
        if let Some(code) = session.exit_code() {
            return code;
        }
        if !session.is_running() {
            return 0;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    let _ = session.kill();
    -1
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    tokio::fs::create_dir_all(WORKSPACE_ROOT).await.ok();

    let addr = format!("0.0.0.0:{AGENT_PORT}").parse()?;
    tracing::info!(%addr, "guest agent listening");

    Server::builder()
        .add_service(PodAgentServer::new(AgentService))
        .serve(addr)
        .await?;

    Ok(())
}
