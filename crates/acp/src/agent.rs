//! Agent-role facade: serve an ACP handler over a transport.
//!
//! The agent side shares the client's multiplexer; only the routed method
//! set and the direction of convenience calls differ. An agent binary
//! typically calls [`AgentPeer::over_stdio`] from `main` and parks on
//! [`AgentPeer::serve`].

use std::{sync::Arc, time::Duration};

use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};

use crate::{
    endpoint::{EndpointOptions, PeerEndpoint},
    envelope::Notification,
    error::AcpError,
    handler::Handler,
    protocol::{
        METHOD_FS_READ_TEXT_FILE, METHOD_FS_WRITE_TEXT_FILE, METHOD_REQUEST_PERMISSION,
        METHOD_SESSION_UPDATE,
    },
    tap::TapRecord,
    transport::Transport,
};

/// One agent-side connection to a host client.
pub struct AgentPeer {
    endpoint: Arc<PeerEndpoint>,
}

impl AgentPeer {
    pub fn new(transport: Transport, handler: Arc<dyn Handler>) -> Self {
        let endpoint = Arc::new(PeerEndpoint::new(transport, EndpointOptions::agent()));
        endpoint.set_handler(handler);
        Self { endpoint }
    }

    /// Serves over the process's own standard streams.
    pub fn over_stdio(handler: Arc<dyn Handler>) -> Self {
        Self::new(
            Transport::from_io(tokio::io::stdin(), tokio::io::stdout()),
            handler,
        )
    }

    pub fn endpoint(&self) -> &PeerEndpoint {
        &self.endpoint
    }

    /// Runs until the client goes away or the endpoint is closed.
    pub async fn serve(&self) {
        self.endpoint.closed().await;
    }

    /// Emits a `session/update` progress notification.
    pub fn send_update(&self, session_id: &str, update: Value) -> Result<(), AcpError> {
        self.endpoint.send_notification(
            METHOD_SESSION_UPDATE,
            json!({"sessionId": session_id, "update": update}),
        )
    }

    /// Asks the client to read a file on the agent's behalf.
    pub async fn read_text_file(
        &self,
        session_id: &str,
        path: &str,
        timeout: Option<Duration>,
    ) -> Result<Value, AcpError> {
        self.endpoint
            .send_request(
                METHOD_FS_READ_TEXT_FILE,
                json!({"sessionId": session_id, "path": path}),
                timeout,
            )
            .await
    }

    /// Asks the client to write a file on the agent's behalf.
    pub async fn write_text_file(
        &self,
        session_id: &str,
        path: &str,
        content: &str,
        timeout: Option<Duration>,
    ) -> Result<Value, AcpError> {
        self.endpoint
            .send_request(
                METHOD_FS_WRITE_TEXT_FILE,
                json!({"sessionId": session_id, "path": path, "content": content}),
                timeout,
            )
            .await
    }

    /// Raises a permission prompt on the client.
    pub async fn request_permission(&self, params: Value) -> Result<Value, AcpError> {
        self.endpoint
            .send_request(METHOD_REQUEST_PERMISSION, params, None)
            .await
    }

    /// Any other client-routed request, payload passed through opaquely.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, AcpError> {
        self.endpoint.send_request(method, params, timeout).await
    }

    /// Inbound notifications from the client (`session/cancel` included).
    pub fn notifications(&self) -> mpsc::UnboundedReceiver<Notification> {
        self.endpoint.notifications()
    }

    pub fn debug_tap(&self) -> broadcast::Receiver<TapRecord> {
        self.endpoint.debug_tap()
    }

    pub async fn close(&self) {
        self.endpoint.close().await;
    }
}
