//! Tools registry parsing and invocation (spec.md §4.5 "Tool invocation",
//! §9 open question (b)). The registry lives at a fixed path inside the
//! pod and is read once per session, then cached.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tonic::Request;

use crate::agent_proto::{ExecuteRequest, UpdateFilesRequest};
use crate::error::GatewayError;
use crate::gateway::agent_client;
use crate::gateway::session::Session;

const REGISTRY_PATH: &str = "/opt/arl/tools/registry.json";
const TOOL_INPUT_PATH: &str = "/tmp/.sandboxctl-tool-input.json";
const REGISTRY_READ_TIMEOUT: Duration = Duration::from_secs(10);
const TOOL_INVOKE_TIMEOUT: Duration = Duration::from_secs(30);

/// How a tool expects its JSON parameters: on stdin, or translated into
/// CLI flags. Only these two fields are interpreted; everything else in
/// a registry entry is preserved opaquely (SPEC_FULL.md §4.5 "Tools
/// registry schema").
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolEntry {
    pub name: String,
    pub command: Vec<String>,
    #[serde(default = "default_args_mode")]
    pub args_mode: String,
    #[serde(flatten)]
    pub extra: Value,
}

fn default_args_mode() -> String {
    "stdin".to_string()
}

/// Read and cache `/opt/arl/tools/registry.json` for `session`, returning
/// the parsed entries. Subsequent calls reuse the cached copy.
pub async fn load_registry(session: &Session) -> Result<Vec<ToolEntry>, GatewayError> {
    if let Some(cached) = session.cached_tools_registry().await {
        return parse_registry(&cached);
    }

    let mut client = agent_client::connect(&session.pod_ip, REGISTRY_READ_TIMEOUT).await?;

    let mut req = Request::new(ExecuteRequest {
        command: vec![
            "cat".to_string(),
            REGISTRY_PATH.to_string(),
        ],
        env: HashMap::new(),
        working_dir: "/".to_string(),
        background: false,
        timeout_seconds: REGISTRY_READ_TIMEOUT.as_secs() as u32,
    });
    req.set_timeout(REGISTRY_READ_TIMEOUT);

    let mut stream = client
        .execute(req)
        .await
        .map_err(GatewayError::from)?
        .into_inner();

    let mut stdout = Vec::new();
    let mut exit_code = 0;
    while let Some(chunk) = stream.message().await.map_err(GatewayError::from)? {
        stdout.extend_from_slice(&chunk.stdout_chunk);
        if chunk.done {
            exit_code = chunk.exit_code;
            break;
        }
    }

    if exit_code != 0 {
        return Err(GatewayError::NotFound(
            "tools registry not present in pod".to_string(),
        ));
    }

    let registry: Value = serde_json::from_slice(&stdout)?;
    session.cache_tools_registry(registry.clone()).await;
    parse_registry(&registry)
}

fn parse_registry(registry: &Value) -> Result<Vec<ToolEntry>, GatewayError> {
    let entries = registry
        .as_array()
        .ok_or_else(|| GatewayError::Internal("tools registry is not a JSON array".to_string()))?;

    entries
        .iter()
        .map(|v| serde_json::from_value(v.clone()).map_err(GatewayError::from))
        .collect()
}

/// Invoke `tool_name` with `params`, returning its parsed stdout.
///
/// Parameters are delivered as the registry entry's `argsMode` dictates:
/// `"stdin"` writes them to a temp file via `UpdateFiles` and redirects it
/// into the tool's stdin (the wire contract has no literal stdin
/// primitive, so a file-plus-redirect through `Execute` stands in for
/// it); `"flags"` serialises each top-level field as a `--key value` pair.
pub async fn invoke(
    session: &Session,
    tool_name: &str,
    params: Value,
) -> Result<Value, GatewayError> {
    let registry = load_registry(session).await?;
    let tool = registry
        .iter()
        .find(|t| t.name == tool_name)
        .ok_or_else(|| GatewayError::NotFound(format!("tool {tool_name} not registered")))?;

    let mut client = agent_client::connect(&session.pod_ip, TOOL_INVOKE_TIMEOUT).await?;

    let command = match tool.args_mode.as_str() {
        "flags" => {
            let mut cmd = tool.command.clone();
            if let Some(map) = params.as_object() {
                for (key, value) in map {
                    cmd.push(format!("--{key}"));
                    cmd.push(match value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    });
                }
            }
            cmd
        }
        _ => {
            let payload = serde_json::to_vec(&params)?;
            let mut files = HashMap::new();
            files.insert(TOOL_INPUT_PATH.to_string(), payload);
            client
                .update_files(Request::new(UpdateFilesRequest {
                    base_path: "/".to_string(),
                    files,
                    patch: None,
                }))
                .await
                .map_err(GatewayError::from)?;

            let mut cmd = vec!["sh".to_string(), "-c".to_string()];
            let mut shell = String::new();
            for (i, part) in tool.command.iter().enumerate() {
                if i > 0 {
                    shell.push(' ');
                }
                shell.push_str(&shell_quote(part));
            }
            shell.push_str(&format!(" < {TOOL_INPUT_PATH}"));
            cmd.push(shell);
            cmd
        }
    };

    let mut req = Request::new(ExecuteRequest {
        command,
        env: HashMap::new(),
        working_dir: "/workspace".to_string(),
        background: false,
        timeout_seconds: TOOL_INVOKE_TIMEOUT.as_secs() as u32,
    });
    req.set_timeout(TOOL_INVOKE_TIMEOUT);

    let mut stream = client
        .execute(req)
        .await
        .map_err(GatewayError::from)?
        .into_inner();

    let mut stdout = Vec::new();
    let mut exit_code = 0;
    while let Some(chunk) = stream.message().await.map_err(GatewayError::from)? {
        stdout.extend_from_slice(&chunk.stdout_chunk);
        if chunk.done {
            exit_code = chunk.exit_code;
            break;
        }
    }

    if exit_code != 0 {
        return Err(GatewayError::Internal(format!(
            "tool {tool_name} exited with code {exit_code}"
        )));
    }

    serde_json::from_slice(&stdout).map_err(GatewayError::from)
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_registry_preserving_unknown_fields() {
        let registry = serde_json::json!([
            {
                "name": "lint",
                "command": ["lint-tool"],
                "argsMode": "flags",
                "version": "1.2.3",
                "timeoutHint": 5
            }
        ]);

        let parsed = parse_registry(&registry).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].name, "lint");
        assert_eq!(parsed[0].args_mode, "flags");
        assert_eq!(parsed[0].extra["version"], "1.2.3");
    }

    #[test]
    fn defaults_args_mode_to_stdin() {
        let registry = serde_json::json!([
            {"name": "fmt", "command": ["fmt-tool"]}
        ]);
        let parsed = parse_registry(&registry).unwrap();
        assert_eq!(parsed[0].args_mode, "stdin");
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }
}
