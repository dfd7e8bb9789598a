//! ACP method names and the routed sets for both roles.
//!
//! The runtime treats request/response payloads as opaque JSON beyond the
//! envelope, so only the method names the dispatcher routes on live here,
//! plus the handful of typed parameter shapes the role facades use.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Handshake request issued by the client after spawn.
pub const METHOD_INITIALIZE: &str = "initialize";
/// Creates a fresh agent session.
pub const METHOD_SESSION_NEW: &str = "session/new";
/// Sends a user turn into a session.
pub const METHOD_SESSION_PROMPT: &str = "session/prompt";
/// Reloads a previously created session.
pub const METHOD_SESSION_LOAD: &str = "session/load";
/// Notification cancelling in-flight session work.
pub const METHOD_SESSION_CANCEL: &str = "session/cancel";
/// Streamed agent-side progress notification.
pub const METHOD_SESSION_UPDATE: &str = "session/update";

/// Agent → client file read.
pub const METHOD_FS_READ_TEXT_FILE: &str = "fs/read_text_file";
/// Agent → client file write.
pub const METHOD_FS_WRITE_TEXT_FILE: &str = "fs/write_text_file";
/// Agent → client terminal lifecycle.
pub const METHOD_TERMINAL_CREATE: &str = "terminal/create";
pub const METHOD_TERMINAL_OUTPUT: &str = "terminal/output";
pub const METHOD_TERMINAL_WAIT_FOR_EXIT: &str = "terminal/wait_for_exit";
pub const METHOD_TERMINAL_KILL: &str = "terminal/kill";
pub const METHOD_TERMINAL_RELEASE: &str = "terminal/release";
/// Agent → client permission prompt.
pub const METHOD_REQUEST_PERMISSION: &str = "session/request_permission";
/// Legacy alias some agents still emit for permission prompts.
pub const METHOD_REQUEST_PERMISSION_ALIAS: &str = "request_permission";

/// Requests the client-side handler must answer.
pub const CLIENT_ROUTED_METHODS: &[&str] = &[
    METHOD_FS_READ_TEXT_FILE,
    METHOD_FS_WRITE_TEXT_FILE,
    METHOD_TERMINAL_CREATE,
    METHOD_TERMINAL_OUTPUT,
    METHOD_TERMINAL_WAIT_FOR_EXIT,
    METHOD_TERMINAL_KILL,
    METHOD_TERMINAL_RELEASE,
    METHOD_REQUEST_PERMISSION,
    METHOD_REQUEST_PERMISSION_ALIAS,
];

/// Requests (and the cancel notification) the agent-side handler must answer.
pub const AGENT_ROUTED_METHODS: &[&str] = &[
    METHOD_INITIALIZE,
    METHOD_SESSION_NEW,
    METHOD_SESSION_PROMPT,
    METHOD_SESSION_LOAD,
    METHOD_SESSION_CANCEL,
];

/// The routed method set for one side of the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoutedMethods {
    Client,
    Agent,
    /// Every method is considered routed; useful for transparent proxies.
    All,
}

impl RoutedMethods {
    pub fn contains(&self, method: &str) -> bool {
        match self {
            RoutedMethods::Client => CLIENT_ROUTED_METHODS.contains(&method),
            RoutedMethods::Agent => AGENT_ROUTED_METHODS.contains(&method),
            RoutedMethods::All => true,
        }
    }
}

/// Client metadata attached to the `initialize` request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

/// Parameters for the `initialize` handshake.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InitializeParams {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: u32,
    #[serde(rename = "clientInfo", skip_serializing_if = "Option::is_none")]
    pub client: Option<ClientInfo>,
    #[serde(default)]
    pub capabilities: Value,
}

impl Default for InitializeParams {
    fn default() -> Self {
        Self {
            protocol_version: 1,
            client: None,
            capabilities: Value::Object(Default::default()),
        }
    }
}

/// Parameters for `session/new`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewSessionParams {
    pub cwd: String,
    #[serde(rename = "mcpServers", default)]
    pub mcp_servers: Vec<Value>,
}

/// Parameters for `session/load`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoadSessionParams {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub cwd: String,
    #[serde(rename = "mcpServers", default)]
    pub mcp_servers: Vec<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_alias_is_routed_client_side() {
        assert!(RoutedMethods::Client.contains("session/request_permission"));
        assert!(RoutedMethods::Client.contains("request_permission"));
        assert!(!RoutedMethods::Client.contains("session/prompt"));
    }

    #[test]
    fn agent_set_includes_cancel_notification() {
        assert!(RoutedMethods::Agent.contains("session/cancel"));
        assert!(!RoutedMethods::Agent.contains("fs/read_text_file"));
    }
}
