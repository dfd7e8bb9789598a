//! Client-role facade: spawn an agent, connect the endpoint, and drive
//! sessions with typed convenience calls.

use std::{sync::Arc, time::Duration};

use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::{
    endpoint::{EndpointOptions, PeerEndpoint, PeerState},
    envelope::Notification,
    error::AcpError,
    handler::Handler,
    protocol::{
        InitializeParams, LoadSessionParams, NewSessionParams, METHOD_INITIALIZE,
        METHOD_SESSION_CANCEL, METHOD_SESSION_LOAD, METHOD_SESSION_NEW, METHOD_SESSION_PROMPT,
    },
    registry::OrphanRegistry,
    supervisor::{PeerProcess, PeerProcessConfig},
    tap::TapRecord,
};

/// Error-message phrases an agent uses to report that a session is already
/// live; `session/load` treats them as success to stay idempotent.
const SESSION_LIVE_PHRASES: &[&str] = &["already active", "already started", "already exists"];

/// Connection-time options beyond the process launch itself.
pub struct ConnectOptions {
    /// Handler answering agent → client requests; installable later via
    /// [`PeerEndpoint::set_handler`] if omitted.
    pub handler: Option<Arc<dyn Handler>>,
    pub endpoint: EndpointOptions,
    pub initialize: InitializeParams,
    pub initialize_timeout: Option<Duration>,
    /// Reap orphans from prior runs before spawning.
    pub reap_orphans: bool,
    pub registry: Option<Arc<OrphanRegistry>>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            handler: None,
            endpoint: EndpointOptions::client(),
            initialize: InitializeParams::default(),
            initialize_timeout: Some(Duration::from_secs(30)),
            reap_orphans: true,
            registry: None,
        }
    }
}

/// One connected agent: the supervised process plus its endpoint.
pub struct AgentConnection {
    process: PeerProcess,
    endpoint: Arc<PeerEndpoint>,
    initialize_result: Value,
}

impl AgentConnection {
    /// Spawns the agent, wires the endpoint over its stdio, and completes
    /// the `initialize` handshake.
    pub async fn connect(
        config: PeerProcessConfig,
        options: ConnectOptions,
    ) -> Result<Self, AcpError> {
        let registry = options
            .registry
            .unwrap_or_else(|| Arc::new(OrphanRegistry::open_default()));
        if options.reap_orphans {
            registry.reap_orphans().await;
        }

        let mut process = PeerProcess::spawn(config, registry).await?;
        let transport = process.take_transport().ok_or(AcpError::ChannelClosed)?;
        let endpoint = Arc::new(PeerEndpoint::new(transport, options.endpoint));
        if let Some(handler) = options.handler {
            endpoint.set_handler(handler);
        }

        spawn_exit_watcher(&process, Arc::clone(&endpoint));

        let params = serde_json::to_value(&options.initialize).map_err(AcpError::Encode)?;
        let initialize_result = endpoint
            .send_request(METHOD_INITIALIZE, params, options.initialize_timeout)
            .await?;

        Ok(Self {
            process,
            endpoint,
            initialize_result,
        })
    }

    pub fn initialize_result(&self) -> &Value {
        &self.initialize_result
    }

    pub fn endpoint(&self) -> &PeerEndpoint {
        &self.endpoint
    }

    pub fn pid(&self) -> u32 {
        self.process.pid()
    }

    pub fn state(&self) -> PeerState {
        self.endpoint.state()
    }

    /// `session/new`; returns the agent-assigned session id.
    pub async fn new_session(&self, params: NewSessionParams) -> Result<String, AcpError> {
        let params = serde_json::to_value(params).map_err(AcpError::Encode)?;
        let result = self
            .endpoint
            .send_request(METHOD_SESSION_NEW, params, None)
            .await?;
        result
            .get("sessionId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| AcpError::InvalidResponse("session/new response lacks sessionId".into()))
    }

    /// `session/prompt`. A string prompt becomes a single text content
    /// block; pass an array to control the blocks yourself. Prompts run
    /// without a timeout unless one is given.
    pub async fn prompt(
        &self,
        session_id: &str,
        prompt: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, AcpError> {
        let blocks = match prompt {
            Value::String(text) => json!([{"type": "text", "text": text}]),
            other => other,
        };
        self.endpoint
            .send_request(
                METHOD_SESSION_PROMPT,
                json!({"sessionId": session_id, "prompt": blocks}),
                timeout,
            )
            .await
    }

    /// `session/load`, tolerating reloads: an agent error reporting the
    /// session as already live is returned as a synthesized success carrying
    /// the requested session id.
    pub async fn load_session(&self, params: LoadSessionParams) -> Result<Value, AcpError> {
        let session_id = params.session_id.clone();
        let params = serde_json::to_value(params).map_err(AcpError::Encode)?;
        match self
            .endpoint
            .send_request(METHOD_SESSION_LOAD, params, None)
            .await
        {
            Ok(result) => Ok(result),
            Err(AcpError::Rpc {
                code,
                message,
                data,
            }) if session_already_live(&message, data.as_ref()) => {
                debug!(code, %session_id, "session/load reported a live session; treating as success");
                Ok(json!({"sessionId": session_id}))
            }
            Err(error) => Err(error),
        }
    }

    /// `session/cancel` notification; the agent decides what to stop.
    pub fn cancel(&self, session_id: &str) -> Result<(), AcpError> {
        self.endpoint
            .send_notification(METHOD_SESSION_CANCEL, json!({"sessionId": session_id}))
    }

    pub fn notifications(&self) -> mpsc::UnboundedReceiver<Notification> {
        self.endpoint.notifications()
    }

    pub fn debug_tap(&self) -> broadcast::Receiver<TapRecord> {
        self.endpoint.debug_tap()
    }

    pub fn disable_debug_tap(&self) {
        self.endpoint.disable_debug_tap()
    }

    /// Terminates the agent process (stdout drains into the endpoint first)
    /// and closes the endpoint. Returns the exit code when one was observed.
    pub async fn close(self) -> Result<Option<i32>, AcpError> {
        let code = self.process.terminate().await?;
        self.endpoint.close().await;
        Ok(code)
    }
}

fn spawn_exit_watcher(process: &PeerProcess, endpoint: Arc<PeerEndpoint>) {
    let mut exit_rx = process.exit_watch();
    tokio::spawn(async move {
        loop {
            if let Some(code) = *exit_rx.borrow() {
                endpoint.notify_peer_exit(code);
                return;
            }
            if exit_rx.changed().await.is_err() {
                if let Some(code) = *exit_rx.borrow() {
                    endpoint.notify_peer_exit(code);
                }
                return;
            }
        }
    });
}

fn session_already_live(message: &str, data: Option<&Value>) -> bool {
    let message = message.to_lowercase();
    if SESSION_LIVE_PHRASES
        .iter()
        .any(|phrase| message.contains(phrase))
    {
        return true;
    }
    if let Some(data) = data {
        let text = data.to_string().to_lowercase();
        return SESSION_LIVE_PHRASES
            .iter()
            .any(|phrase| text.contains(phrase));
    }
    false
}
