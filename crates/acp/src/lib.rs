#![forbid(unsafe_code)]
//! Bidirectional JSON-RPC 2.0 peer runtime for the Agent Client Protocol.
//!
//! One connection carries outbound requests awaiting responses, inbound
//! requests dispatched to a local handler, and one-way notifications in both
//! directions, as newline-delimited JSON frames over a byte transport
//! (usually a child process's standard streams). The crate hosts either side
//! of that connection: the **client** role (a host application driving a
//! coding agent) or the **agent** role.
//!
//! ## Connecting to an agent
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use acp::{AgentConnection, ClientDelegate, ConnectOptions, NewSessionParams, PeerProcessConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let connection = AgentConnection::connect(
//!     PeerProcessConfig::new("/opt/agents/bin/agent"),
//!     ConnectOptions {
//!         handler: Some(Arc::new(ClientDelegate::default())),
//!         ..ConnectOptions::default()
//!     },
//! )
//! .await?;
//!
//! let session = connection
//!     .new_session(NewSessionParams { cwd: "/work".into(), mcp_servers: Vec::new() })
//!     .await?;
//! let mut updates = connection.notifications();
//! let reply = connection.prompt(&session, "Summarize the repo".into(), None).await?;
//! # let _ = (updates.recv().await, reply);
//! # Ok(()) }
//! ```
//!
//! ## Pieces
//!
//! - [`FrameBuffer`]: pulls whole top-level JSON values out of a noisy byte
//!   stream (interleaved diagnostics are dropped line by line).
//! - [`envelope`]: classifies frames into requests, responses, and
//!   notifications, with a lenient/strict knob for malformed ids.
//! - [`Transport`]: sink/source byte-stream seam; child stdio, any
//!   `AsyncRead`/`AsyncWrite` pair, or a string-frame duplex channel.
//! - [`PeerEndpoint`]: the multiplexer — correlation ids, the pending-request
//!   table, per-call timeouts, cancellation on drop, handler dispatch,
//!   notification fan-out, an optional [`TapRecord`] debug mirror, and
//!   poisoning on peer exit.
//! - [`PeerProcess`]: spawns the agent (login-shell environment, own process
//!   group, node-shebang interpreter discovery), terminates it
//!   SIGTERM-then-SIGKILL, and keeps the [`OrphanRegistry`] current so peers
//!   orphaned by a crash are reaped on the next start.
//! - [`TerminalManager`]: shell commands run on the agent's behalf, with
//!   capped rolling output buffers, exit waiters, kill/release semantics,
//!   and a bounded cache of released sessions.
//! - [`shell_env`]: the process-wide login-shell environment snapshot every
//!   spawn site starts from.
//!
//! Handler failures become `-32603` responses and never tear down the
//! connection; peer exit fails every pending call with the observed exit
//! code. Requests have no implicit timeout — prompts in particular must be
//! allowed to run indefinitely.

mod agent;
mod client;
mod endpoint;
pub mod envelope;
mod error;
mod framing;
mod handler;
pub mod protocol;
mod registry;
pub mod shell_env;
mod supervisor;
mod tap;
mod terminal;
mod transport;

pub use agent::AgentPeer;
pub use client::{AgentConnection, ConnectOptions};
pub use endpoint::{EndpointOptions, PeerEndpoint, PeerState};
pub use envelope::{Envelope, IdPolicy, Notification, RequestId, RpcErrorObject};
pub use error::AcpError;
pub use framing::FrameBuffer;
pub use handler::{ClientDelegate, Handler, PermissionPolicy};
pub use protocol::{
    ClientInfo, InitializeParams, LoadSessionParams, NewSessionParams, RoutedMethods,
};
pub use registry::{OrphanRegistry, ProcessRecord};
pub use supervisor::{PeerProcess, PeerProcessConfig};
pub use tap::{Direction, TapRecord};
pub use terminal::{
    CreateTerminalParams, TerminalExit, TerminalManager, TerminalOutput,
    DEFAULT_OUTPUT_BYTE_LIMIT, DEFAULT_RELEASED_CAPACITY,
};
pub use transport::{ByteSink, ByteSource, Transport};

#[cfg(test)]
mod test_support;

#[cfg(test)]
mod tests;
