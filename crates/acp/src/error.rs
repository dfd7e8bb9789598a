use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

/// Errors surfaced by the endpoint, supervisor, and terminal manager.
#[derive(Debug, Error)]
pub enum AcpError {
    #[error("peer process is not running")]
    PeerNotRunning,
    #[error("peer exited with code {code:?}")]
    PeerExited { code: Option<i32> },
    #[error("invalid response envelope: {0}")]
    InvalidResponse(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to encode payload: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode payload: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("peer returned JSON-RPC error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<Value>,
    },
    #[error("no handler installed for inbound requests")]
    HandlerMissing,
    #[error("transport failure: {0}")]
    Transport(#[source] std::io::Error),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("terminal `{0}` not found")]
    TerminalNotFound(String),
    #[error("terminal `{0}` has been released")]
    TerminalReleased(String),
    #[error("executable `{0}` not found")]
    ExecutableNotFound(String),
    #[error("failed to parse command `{0}`")]
    CommandParse(String),
    #[error("transport channel closed unexpectedly")]
    ChannelClosed,
    #[error("blocking shell environment access from an async runtime thread")]
    BlockingOnRuntime,
}
