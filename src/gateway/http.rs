//! HTTP surface for the execution gateway (spec.md §6.2's route table).
//! Hand-rolled `hyper` routing matching on `(Method, path segments)`, the
//! same shape the teacher's `http_api.rs` uses for its own sandbox API.

use std::sync::Arc;

use futures::future::join_all;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::error::GatewayError;
use crate::gateway::executor::{ExecuteResponse, StepRequest};
use crate::gateway::sessions::CreateSessionRequest;
use crate::gateway::{GatewayState, pools, sessions, shell, tools, trajectory};

type BoxBody = http_body_util::combinators::BoxBody<bytes::Bytes, hyper::Error>;

fn full<T: Into<bytes::Bytes>>(chunk: T) -> BoxBody {
    Full::new(chunk.into()).map_err(|never| match never {}).boxed()
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    kind: &'static str,
}

fn json_response<T: Serialize>(status: StatusCode, data: &T) -> Response<BoxBody> {
    let body = serde_json::to_string(data).unwrap_or_else(|_| "{}".to_string());
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full(body))
        .unwrap()
}

fn error_response(err: GatewayError) -> Response<BoxBody> {
    json_response(
        err.status_code(),
        &ErrorBody {
            error: err.to_string(),
            kind: err.kind(),
        },
    )
}

async fn read_json_body<T: for<'de> Deserialize<'de>>(
    req: Request<Incoming>,
) -> Result<T, GatewayError> {
    let bytes = req
        .collect()
        .await
        .map_err(|e| GatewayError::Invalid(format!("failed to read request body: {e}")))?
        .to_bytes();
    serde_json::from_slice(&bytes).map_err(|e| GatewayError::Invalid(format!("invalid JSON body: {e}")))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteRequestBody {
    steps: Vec<StepRequest>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestoreRequestBody {
    snapshot_id: String,
}

async fn route(
    req: Request<Incoming>,
    state: Arc<GatewayState>,
) -> Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    let response = match (&method, segments.as_slice()) {
        (&Method::GET, ["healthz"]) => json_response(StatusCode::OK, &serde_json::json!({"status": "ok"})),

        (&Method::GET, ["metrics"]) => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/plain; version=0.0.4")
            .body(full(crate::metrics::encode()))
            .unwrap(),

        (&Method::POST, ["v1", "sessions"]) => handle_create_session(req, &state).await,
        (&Method::GET, ["v1", "sessions", id]) => handle_get_session(&state, id).await,
        (&Method::DELETE, ["v1", "sessions", id]) => handle_delete_session(&state, id).await,
        (&Method::POST, ["v1", "sessions", id, "execute"]) => {
            handle_execute(req, &state, id).await
        }
        (&Method::POST, ["v1", "sessions", id, "restore"]) => {
            handle_restore(req, &state, id).await
        }
        (&Method::GET, ["v1", "sessions", id, "shell"]) => match handle_shell(req, &state, id).await
        {
            Ok(resp) => resp,
            Err(e) => error_response(e),
        },
        (&Method::GET, ["v1", "sessions", id, "history"]) => handle_history(&state, id).await,
        (&Method::GET, ["v1", "sessions", id, "trajectory"]) => {
            handle_trajectory(&state, id).await
        }
        (&Method::POST, ["v1", "sessions", id, "tools", name]) => {
            handle_tool_invoke(req, &state, id, name).await
        }

        (&Method::POST, ["v1", "pools"]) => handle_create_pool(req, &state).await,
        (&Method::GET, ["v1", "pools"]) => handle_list_pools(&state).await,
        (&Method::GET, ["v1", "pools", name]) => handle_get_pool(&state, name).await,
        (&Method::PATCH, ["v1", "pools", name]) => handle_scale_pool(req, &state, name).await,
        (&Method::DELETE, ["v1", "pools", name]) => handle_delete_pool(&state, name).await,

        _ => json_response(
            StatusCode::NOT_FOUND,
            &ErrorBody {
                error: "route not found".to_string(),
                kind: "NotFound",
            },
        ),
    };

    Ok(response)
}

async fn handle_create_session(req: Request<Incoming>, state: &GatewayState) -> Response<BoxBody> {
    let body: CreateSessionRequest = match read_json_body(req).await {
        Ok(b) => b,
        Err(e) => return error_response(e),
    };

    match sessions::create(
        &state.client,
        &state.sessions,
        &state.namespace,
        std::time::Duration::from_secs(state.config.session_ready_timeout_seconds),
        std::time::Duration::from_secs(state.config.status_poll_timeout_seconds),
        body,
    )
    .await
    {
        Ok(info) => json_response(StatusCode::CREATED, &info),
        Err(e) => error_response(e),
    }
}

async fn handle_get_session(state: &GatewayState, id: &str) -> Response<BoxBody> {
    match sessions::snapshot(&state.sessions, id).await {
        Ok(snap) => json_response(StatusCode::OK, &snap),
        Err(e) => error_response(e),
    }
}

async fn handle_delete_session(state: &GatewayState, id: &str) -> Response<BoxBody> {
    match sessions::delete(&state.client, &state.sessions, id).await {
        Ok(()) => Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(full(Vec::new()))
            .unwrap(),
        Err(e) => error_response(e),
    }
}

async fn handle_execute(
    req: Request<Incoming>,
    state: &GatewayState,
    id: &str,
) -> Response<BoxBody> {
    let session = match state.sessions.get(id).await {
        Some(s) => s,
        None => return error_response(GatewayError::NotFound(format!("session {id} not found"))),
    };

    let body: ExecuteRequestBody = match read_json_body(req).await {
        Ok(b) => b,
        Err(e) => return error_response(e),
    };

    let result: Result<ExecuteResponse, GatewayError> = crate::gateway::executor::execute_steps(
        &session,
        body.steps,
        state.config.step_output_cap_bytes,
        &state.audit,
    )
    .await;

    match result {
        Ok(resp) => json_response(StatusCode::OK, &resp),
        Err(e) => error_response(e),
    }
}

async fn handle_restore(
    req: Request<Incoming>,
    state: &GatewayState,
    id: &str,
) -> Response<BoxBody> {
    let session = match state.sessions.get(id).await {
        Some(s) => s,
        None => return error_response(GatewayError::NotFound(format!("session {id} not found"))),
    };

    let body: RestoreRequestBody = match read_json_body(req).await {
        Ok(b) => b,
        Err(e) => return error_response(e),
    };

    match crate::gateway::executor::restore(&session, &body.snapshot_id, &state.audit).await {
        Ok(()) => json_response(StatusCode::OK, &serde_json::json!({"status": "restored"})),
        Err(e) => error_response(e),
    }
}

async fn handle_shell(
    req: Request<Incoming>,
    state: &GatewayState,
    id: &str,
) -> Result<Response<BoxBody>, GatewayError> {
    let session = state
        .sessions
        .get(id)
        .await
        .ok_or_else(|| GatewayError::NotFound(format!("session {id} not found")))?;
    shell::handle(req, session)
}

async fn handle_history(state: &GatewayState, id: &str) -> Response<BoxBody> {
    let Some(session) = state.sessions.get(id).await else {
        return error_response(GatewayError::NotFound(format!("session {id} not found")));
    };
    json_response(StatusCode::OK, &session.history().await)
}

async fn handle_trajectory(state: &GatewayState, id: &str) -> Response<BoxBody> {
    let Some(session) = state.sessions.get(id).await else {
        return error_response(GatewayError::NotFound(format!("session {id} not found")));
    };
    match trajectory::export(&session).await {
        Ok(body) => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/x-ndjson")
            .body(full(body))
            .unwrap(),
        Err(e) => error_response(e),
    }
}

async fn handle_tool_invoke(
    req: Request<Incoming>,
    state: &GatewayState,
    id: &str,
    name: &str,
) -> Response<BoxBody> {
    let Some(session) = state.sessions.get(id).await else {
        return error_response(GatewayError::NotFound(format!("session {id} not found")));
    };
    let params: Value = match read_json_body(req).await {
        Ok(b) => b,
        Err(e) => return error_response(e),
    };
    match tools::invoke(&session, name, params).await {
        Ok(result) => json_response(StatusCode::OK, &result),
        Err(e) => error_response(e),
    }
}

async fn handle_create_pool(req: Request<Incoming>, state: &GatewayState) -> Response<BoxBody> {
    let body = match read_json_body(req).await {
        Ok(b) => b,
        Err(e) => return error_response(e),
    };
    match pools::create(&state.client, &state.namespace, body).await {
        Ok(view) => json_response(StatusCode::CREATED, &view),
        Err(e) => error_response(e),
    }
}

async fn handle_list_pools(state: &GatewayState) -> Response<BoxBody> {
    match pools::list(&state.client, &state.namespace).await {
        Ok(views) => json_response(StatusCode::OK, &views),
        Err(e) => error_response(e),
    }
}

async fn handle_get_pool(state: &GatewayState, name: &str) -> Response<BoxBody> {
    match pools::get(&state.client, &state.namespace, name).await {
        Ok(view) => json_response(StatusCode::OK, &view),
        Err(e) => error_response(e),
    }
}

async fn handle_scale_pool(
    req: Request<Incoming>,
    state: &GatewayState,
    name: &str,
) -> Response<BoxBody> {
    let body = match read_json_body(req).await {
        Ok(b) => b,
        Err(e) => return error_response(e),
    };
    match pools::scale(&state.client, &state.namespace, name, body).await {
        Ok(view) => json_response(StatusCode::OK, &view),
        Err(e) => error_response(e),
    }
}

async fn handle_delete_pool(state: &GatewayState, name: &str) -> Response<BoxBody> {
    match pools::delete(&state.client, &state.namespace, name).await {
        Ok(()) => Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(full(Vec::new()))
            .unwrap(),
        Err(e) => error_response(e),
    }
}

/// Run the gateway's HTTP server until `shutdown` is cancelled. On
/// cancellation, stops accepting new connections and waits up to
/// `shutdown_grace` for in-flight connections to finish before returning.
pub async fn run(
    state: Arc<GatewayState>,
    bind_addr: &str,
    shutdown_grace: std::time::Duration,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    tracing::info!(%bind_addr, "gateway listening");

    let mut connections: Vec<tokio::task::JoinHandle<()>> = Vec::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("gateway shutting down, draining in-flight connections");
                let drain = join_all(connections.drain(..));
                if tokio::time::timeout(shutdown_grace, drain).await.is_err() {
                    tracing::warn!("gateway connections did not drain within grace period, exiting anyway");
                }
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, _) = accepted?;
                let io = TokioIo::new(stream);
                let state = state.clone();

                connections.retain(|h| !h.is_finished());
                connections.push(tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let state = state.clone();
                        route(req, state)
                    });

                    if let Err(err) = http1::Builder::new()
                        .serve_connection(io, service)
                        .with_upgrades()
                        .await
                    {
                        tracing::debug!(error = %err, "gateway connection error");
                    }
                }));
            }
        }
    }
}
