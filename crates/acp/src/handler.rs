//! Inbound-request handling: the dyn seam the endpoint dispatches into,
//! plus a ready-made client-side delegate wiring file access and terminal
//! sessions the way agents expect.

use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    envelope::RpcErrorObject,
    protocol::{
        METHOD_FS_READ_TEXT_FILE, METHOD_FS_WRITE_TEXT_FILE, METHOD_REQUEST_PERMISSION,
        METHOD_REQUEST_PERMISSION_ALIAS, METHOD_TERMINAL_CREATE, METHOD_TERMINAL_KILL,
        METHOD_TERMINAL_OUTPUT, METHOD_TERMINAL_RELEASE, METHOD_TERMINAL_WAIT_FOR_EXIT,
    },
    terminal::{CreateTerminalParams, TerminalExit, TerminalManager},
};

/// Entry point for requests arriving from the remote peer.
///
/// Returning `Err` produces a JSON-RPC error response; the connection stays
/// up either way. Implementations answer unknown methods with
/// [`RpcErrorObject::method_not_found`].
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, method: &str, params: Value) -> Result<Value, RpcErrorObject>;
}

/// Decision policy for `session/request_permission`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PermissionPolicy {
    /// Pick the first allow-flavored option (or approve outright).
    #[default]
    AllowAll,
    /// Cancel every prompt.
    DenyAll,
}

impl PermissionPolicy {
    fn outcome(&self, params: &Value) -> Value {
        match self {
            PermissionPolicy::AllowAll => {
                let option = params
                    .get("options")
                    .and_then(Value::as_array)
                    .and_then(|options| {
                        options
                            .iter()
                            .find(|option| {
                                option
                                    .get("kind")
                                    .and_then(Value::as_str)
                                    .is_some_and(|kind| kind.starts_with("allow"))
                            })
                            .or_else(|| options.first())
                    })
                    .and_then(|option| option.get("optionId"))
                    .cloned();
                match option {
                    Some(id) => json!({"outcome": {"outcome": "selected", "optionId": id}}),
                    None => json!({"outcome": {"outcome": "approved"}}),
                }
            }
            PermissionPolicy::DenyAll => json!({"outcome": {"outcome": "cancelled"}}),
        }
    }
}

/// Client-side handler covering the full routed set: `fs/*` over the local
/// filesystem, `terminal/*` over a [`TerminalManager`], and permission
/// prompts via a [`PermissionPolicy`].
pub struct ClientDelegate {
    terminals: Arc<TerminalManager>,
    permissions: PermissionPolicy,
}

impl Default for ClientDelegate {
    fn default() -> Self {
        Self::new(Arc::new(TerminalManager::new()))
    }
}

impl ClientDelegate {
    pub fn new(terminals: Arc<TerminalManager>) -> Self {
        Self {
            terminals,
            permissions: PermissionPolicy::default(),
        }
    }

    pub fn with_permissions(mut self, permissions: PermissionPolicy) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn terminals(&self) -> &Arc<TerminalManager> {
        &self.terminals
    }

    async fn read_text_file(&self, params: Value) -> Result<Value, RpcErrorObject> {
        let params: ReadFileParams = decode(params)?;
        let content = tokio::fs::read_to_string(&params.path).await.map_err(|error| {
            RpcErrorObject::internal(format!(
                "failed to read {}: {error}",
                params.path.display()
            ))
        })?;
        Ok(json!({"content": clip_lines(&content, params.line, params.limit)}))
    }

    async fn write_text_file(&self, params: Value) -> Result<Value, RpcErrorObject> {
        let params: WriteFileParams = decode(params)?;
        if let Some(parent) = params.path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        tokio::fs::write(&params.path, params.content)
            .await
            .map_err(|error| {
                RpcErrorObject::internal(format!(
                    "failed to write {}: {error}",
                    params.path.display()
                ))
            })?;
        Ok(json!({}))
    }

    async fn terminal_create(&self, params: Value) -> Result<Value, RpcErrorObject> {
        let params: TerminalCreateParams = decode(params)?;
        let id = self
            .terminals
            .create(CreateTerminalParams {
                command: params.command,
                args: params.args,
                cwd: params.cwd,
                env: params
                    .env
                    .into_iter()
                    .map(|entry| (entry.name, entry.value))
                    .collect(),
                output_byte_limit: params.output_byte_limit,
            })
            .await
            .map_err(internal)?;
        Ok(json!({"terminalId": id}))
    }

    fn terminal_output(&self, params: Value) -> Result<Value, RpcErrorObject> {
        let params: TerminalIdParams = decode(params)?;
        let output = self
            .terminals
            .output(&params.terminal_id)
            .map_err(internal)?;
        let mut body = json!({"output": output.output, "truncated": output.truncated});
        if let Some(exit) = &output.exit {
            body["exitStatus"] = exit_value(exit);
        }
        Ok(body)
    }

    async fn terminal_wait_for_exit(&self, params: Value) -> Result<Value, RpcErrorObject> {
        let params: TerminalIdParams = decode(params)?;
        let exit = self
            .terminals
            .wait_for_exit(&params.terminal_id)
            .await
            .map_err(internal)?;
        Ok(exit_value(&exit))
    }

    async fn terminal_kill(&self, params: Value) -> Result<Value, RpcErrorObject> {
        let params: TerminalIdParams = decode(params)?;
        self.terminals
            .kill(&params.terminal_id)
            .await
            .map_err(internal)?;
        Ok(json!({}))
    }

    async fn terminal_release(&self, params: Value) -> Result<Value, RpcErrorObject> {
        let params: TerminalIdParams = decode(params)?;
        self.terminals
            .release(&params.terminal_id)
            .await
            .map_err(internal)?;
        Ok(json!({}))
    }
}

#[async_trait]
impl Handler for ClientDelegate {
    async fn handle(&self, method: &str, params: Value) -> Result<Value, RpcErrorObject> {
        match method {
            METHOD_FS_READ_TEXT_FILE => self.read_text_file(params).await,
            METHOD_FS_WRITE_TEXT_FILE => self.write_text_file(params).await,
            METHOD_TERMINAL_CREATE => self.terminal_create(params).await,
            METHOD_TERMINAL_OUTPUT => self.terminal_output(params),
            METHOD_TERMINAL_WAIT_FOR_EXIT => self.terminal_wait_for_exit(params).await,
            METHOD_TERMINAL_KILL => self.terminal_kill(params).await,
            METHOD_TERMINAL_RELEASE => self.terminal_release(params).await,
            METHOD_REQUEST_PERMISSION | METHOD_REQUEST_PERMISSION_ALIAS => {
                Ok(self.permissions.outcome(&params))
            }
            other => Err(RpcErrorObject::method_not_found(other)),
        }
    }
}

#[derive(Deserialize)]
struct ReadFileParams {
    path: PathBuf,
    #[serde(default)]
    line: Option<u64>,
    #[serde(default)]
    limit: Option<u64>,
}

#[derive(Deserialize)]
struct WriteFileParams {
    path: PathBuf,
    content: String,
}

#[derive(Deserialize)]
struct TerminalCreateParams {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    cwd: Option<PathBuf>,
    #[serde(default)]
    env: Vec<EnvEntry>,
    #[serde(default, rename = "outputByteLimit")]
    output_byte_limit: Option<usize>,
}

#[derive(Deserialize)]
struct EnvEntry {
    name: String,
    value: String,
}

#[derive(Deserialize)]
struct TerminalIdParams {
    #[serde(rename = "terminalId")]
    terminal_id: String,
}

fn decode<T: DeserializeOwned>(params: Value) -> Result<T, RpcErrorObject> {
    serde_json::from_value(params)
        .map_err(|error| RpcErrorObject::internal(format!("invalid params: {error}")))
}

fn internal(error: crate::error::AcpError) -> RpcErrorObject {
    RpcErrorObject::internal(error.to_string())
}

fn exit_value(exit: &TerminalExit) -> Value {
    json!({"exitCode": exit.code, "signal": exit.signal})
}

fn clip_lines(content: &str, line: Option<u64>, limit: Option<u64>) -> String {
    if line.is_none() && limit.is_none() {
        return content.to_string();
    }
    let skip = line.map(|l| l.saturating_sub(1)).unwrap_or(0) as usize;
    let lines = content.lines().skip(skip);
    let selected: Vec<&str> = match limit {
        Some(limit) => lines.take(limit as usize).collect(),
        None => lines.collect(),
    };
    selected.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_and_writes_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("note.txt");
        let delegate = ClientDelegate::default();

        let result = delegate
            .handle(
                METHOD_FS_WRITE_TEXT_FILE,
                json!({"sessionId":"s","path": path, "content": "one\ntwo\nthree"}),
            )
            .await
            .unwrap();
        assert_eq!(result, json!({}));

        let result = delegate
            .handle(
                METHOD_FS_READ_TEXT_FILE,
                json!({"sessionId":"s","path": path}),
            )
            .await
            .unwrap();
        assert_eq!(result, json!({"content": "one\ntwo\nthree"}));

        let result = delegate
            .handle(
                METHOD_FS_READ_TEXT_FILE,
                json!({"sessionId":"s","path": path, "line": 2, "limit": 1}),
            )
            .await
            .unwrap();
        assert_eq!(result, json!({"content": "two"}));
    }

    #[tokio::test]
    async fn read_failure_maps_to_internal_error() {
        let delegate = ClientDelegate::default();
        let error = delegate
            .handle(
                METHOD_FS_READ_TEXT_FILE,
                json!({"path": "/definitely/not/here.txt"}),
            )
            .await
            .unwrap_err();
        assert_eq!(error.code, crate::envelope::CODE_INTERNAL_ERROR);
    }

    #[tokio::test]
    async fn unknown_method_is_not_found() {
        let delegate = ClientDelegate::default();
        let error = delegate.handle("fs/stat", json!({})).await.unwrap_err();
        assert_eq!(error.code, crate::envelope::CODE_METHOD_NOT_FOUND);
    }

    #[test]
    fn allow_all_selects_first_allow_option() {
        let params = json!({"options": [
            {"optionId": "deny-1", "kind": "reject_once"},
            {"optionId": "ok-1", "kind": "allow_once"},
        ]});
        let outcome = PermissionPolicy::AllowAll.outcome(&params);
        assert_eq!(
            outcome,
            json!({"outcome": {"outcome": "selected", "optionId": "ok-1"}})
        );
    }

    #[test]
    fn deny_all_cancels() {
        let outcome = PermissionPolicy::DenyAll.outcome(&json!({}));
        assert_eq!(outcome, json!({"outcome": {"outcome": "cancelled"}}));
    }
}
