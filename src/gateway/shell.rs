//! WebSocket-to-gRPC bridge for `/v1/sessions/{id}/shell` (spec.md §6.2
//! "Interactive shell", §6.1 `InteractiveShell`).
//!
//! The gateway's own HTTP listener terminates the WebSocket upgrade itself
//! (no reverse proxy in front of it is assumed) — `hyper`'s connection
//! already owns the TCP socket, so the upgrade is a plain
//! `hyper::upgrade::on` handoff into a `tokio-tungstenite` stream, the same
//! shape `alfredjeanlab-oddjobs`'s `attach_proxy.rs` bridges on the client
//! side. Frames are JSON over WebSocket text frames rather than raw bytes,
//! since `data` must interleave with out-of-band `resize`/`signal`
//! messages on the same stream.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use http_body_util::Empty;
use hyper::body::{Bytes, Incoming};
use hyper::upgrade::Upgraded;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::agent_proto::shell_input::Payload as InputPayload;
use crate::agent_proto::shell_output::Payload as OutputPayload;
use crate::agent_proto::{Resize, ShellInput};
use crate::error::GatewayError;
use crate::gateway::agent_client;
use crate::gateway::session::Session;

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

fn empty_body() -> BoxBody {
    use http_body_util::BodyExt;
    Empty::new().map_err(|never| match never {}).boxed()
}

/// One message a shell client sends over the WebSocket, mirroring
/// `ShellInput`'s oneof.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Input { data: String },
    Signal { signal: String },
    Resize { rows: u32, cols: u32 },
}

/// One message the gateway sends back, mirroring `ShellOutput`'s oneof.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerFrame {
    Output { data: String },
    Closed { exit_code: Option<i32> },
}

fn is_upgrade_request(req: &Request<Incoming>) -> bool {
    req.headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false)
        && req
            .headers()
            .get(hyper::header::UPGRADE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false)
}

/// Handle `GET /v1/sessions/{id}/shell`: validate the upgrade request,
/// hand the response back for `hyper` to send, and spawn the bridge task
/// once the connection is actually upgraded.
pub fn handle(
    mut req: Request<Incoming>,
    session: std::sync::Arc<Session>,
) -> Result<Response<BoxBody>, GatewayError> {
    if !is_upgrade_request(&req) {
        return Err(GatewayError::Invalid(
            "shell endpoint requires a WebSocket upgrade".to_string(),
        ));
    }

    let handshake_response = tungstenite::handshake::server::create_response(&req)
        .map_err(|e| GatewayError::Invalid(format!("invalid WebSocket handshake: {e}")))?;
    let (parts, _) = handshake_response.into_parts();
    let response = Response::from_parts(parts, empty_body());

    let upgrade_fut = hyper::upgrade::on(&mut req);
    tokio::spawn(async move {
        match upgrade_fut.await {
            Ok(upgraded) => {
                let io = TokioIo::new(upgraded);
                let ws = WebSocketStream::from_raw_socket(
                    io,
                    tungstenite::protocol::Role::Server,
                    None,
                )
                .await;
                if let Err(e) = bridge(ws, session).await {
                    tracing::warn!(error = %e, "interactive shell bridge ended with error");
                }
            }
            Err(e) => tracing::warn!(error = %e, "WebSocket upgrade failed"),
        }
    });

    Ok(response)
}

/// Drive one WebSocket connection to completion, bridging it to the pod
/// agent's `InteractiveShell` bidi RPC.
async fn bridge(
    ws: WebSocketStream<TokioIo<Upgraded>>,
    session: std::sync::Arc<Session>,
) -> Result<(), GatewayError> {
    let (mut ws_tx, mut ws_rx) = ws.split();

    let mut client = agent_client::connect(&session.pod_ip, Duration::from_secs(10)).await?;

    let (agent_tx, agent_rx) = mpsc::channel::<ShellInput>(32);
    let outbound = client
        .interactive_shell(ReceiverStream::new(agent_rx))
        .await
        .map_err(GatewayError::from)?
        .into_inner();
    let mut outbound = outbound;

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                let Some(msg) = msg else { break };
                let msg = match msg {
                    Ok(m) => m,
                    Err(_) => break,
                };
                match msg {
                    Message::Text(text) => {
                        let Ok(frame) = serde_json::from_str::<ClientFrame>(&text) else {
                            continue;
                        };
                        let payload = match frame {
                            ClientFrame::Input { data } => InputPayload::Data(data.into_bytes()),
                            ClientFrame::Signal { signal } => InputPayload::Signal(signal),
                            ClientFrame::Resize { rows, cols } => {
                                InputPayload::Resize(Resize { rows, cols })
                            }
                        };
                        if agent_tx
                            .send(ShellInput { payload: Some(payload) })
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            chunk = outbound.message() => {
                let chunk = match chunk {
                    Ok(Some(c)) => c,
                    Ok(None) => break,
                    Err(_) => break,
                };
                match chunk.payload {
                    Some(OutputPayload::Data(data)) => {
                        let frame = ServerFrame::Output {
                            data: String::from_utf8_lossy(&data).to_string(),
                        };
                        if send_json(&mut ws_tx, &frame).await.is_err() {
                            break;
                        }
                    }
                    Some(OutputPayload::ExitCode(code)) => {
                        let frame = ServerFrame::Closed { exit_code: Some(code) };
                        let _ = send_json(&mut ws_tx, &frame).await;
                    }
                    Some(OutputPayload::Closed(_)) | None => {
                        let frame = ServerFrame::Closed { exit_code: None };
                        let _ = send_json(&mut ws_tx, &frame).await;
                        break;
                    }
                }
            }
        }
    }

    let _ = ws_tx.close().await;
    Ok(())
}

async fn send_json<S>(sink: &mut S, frame: &ServerFrame) -> Result<(), ()>
where
    S: futures::Sink<Message> + Unpin,
{
    let text = serde_json::to_string(frame).map_err(|_| ())?;
    sink.send(Message::Text(text.into())).await.map_err(|_| ())
}
