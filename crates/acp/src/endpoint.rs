//! The multiplexer owning one connection and both directions of RPC on it.
//!
//! A [`PeerEndpoint`] wires a [`Transport`] to a writer task and a reader
//! task. Outbound requests get monotonically increasing integer ids and a
//! one-shot continuation in the pending table; inbound frames are classified
//! and routed to the matching continuation, the installed [`Handler`], or the
//! notification fan-out. Writes are serialized through a single channel so
//! frames never interleave on the wire.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
    time,
};
use tracing::{debug, warn};

use crate::{
    envelope::{classify, Envelope, IdPolicy, Notification, RequestId, RpcErrorObject},
    error::AcpError,
    framing::FrameBuffer,
    handler::Handler,
    protocol::RoutedMethods,
    tap::{Direction, TapRecord},
    transport::{ByteSink, ByteSource, Transport},
};

/// Records buffered for a lagging debug tap before the oldest are dropped.
const TAP_CAPACITY: usize = 256;

/// How long the reader waits after end-of-stream before recording a plain
/// connection-closed state; a process exit observer that learns the exit
/// code within this window wins the transition instead.
const EOF_POISON_GRACE: Duration = Duration::from_millis(300);

/// Wait applied to endpoint tasks during [`PeerEndpoint::close`] before they
/// are aborted.
const CLOSE_TASK_TIMEOUT: Duration = Duration::from_secs(1);

/// Connection state as observed by callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerState {
    Running,
    Closed,
    Exited(Option<i32>),
}

/// Per-endpoint tuning.
#[derive(Clone, Copy, Debug)]
pub struct EndpointOptions {
    pub id_policy: IdPolicy,
    pub routed: RoutedMethods,
}

impl EndpointOptions {
    /// Options for the client role (the side driving an agent).
    pub fn client() -> Self {
        Self {
            id_policy: IdPolicy::Lenient,
            routed: RoutedMethods::Client,
        }
    }

    /// Options for the agent role.
    pub fn agent() -> Self {
        Self {
            id_policy: IdPolicy::Lenient,
            routed: RoutedMethods::Agent,
        }
    }
}

type PendingTable = Mutex<HashMap<RequestId, oneshot::Sender<Result<Value, AcpError>>>>;

struct Shared {
    writer: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    pending: PendingTable,
    next_id: AtomicI64,
    handler: RwLock<Option<Arc<dyn Handler>>>,
    notification_sinks: Mutex<Vec<mpsc::UnboundedSender<Notification>>>,
    tap: Mutex<Option<broadcast::Sender<TapRecord>>>,
    state_tx: watch::Sender<PeerState>,
    options: EndpointOptions,
}

impl Shared {
    fn state(&self) -> PeerState {
        *self.state_tx.borrow()
    }

    fn check_running(&self) -> Result<(), AcpError> {
        match self.state() {
            PeerState::Running => Ok(()),
            PeerState::Closed => Err(AcpError::ConnectionClosed),
            PeerState::Exited(_) => Err(AcpError::PeerNotRunning),
        }
    }

    fn tap_record(&self, direction: Direction, raw: &[u8]) {
        let guard = self.tap.lock();
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(TapRecord::new(direction, raw));
        }
    }

    fn write_frame(&self, frame: Vec<u8>) -> Result<(), AcpError> {
        self.tap_record(Direction::Outbound, &frame);
        let guard = self.writer.lock();
        match guard.as_ref() {
            Some(tx) => tx.send(frame).map_err(|_| AcpError::ChannelClosed),
            None => Err(AcpError::ConnectionClosed),
        }
    }

    /// Transitions out of `Running` exactly once: fails every pending
    /// continuation, finishes every stream, and closes the writer.
    fn poison(&self, state: PeerState, error: impl Fn() -> AcpError) {
        let mut first = false;
        self.state_tx.send_if_modified(|current| {
            if *current == PeerState::Running {
                *current = state;
                first = true;
                true
            } else {
                false
            }
        });
        if !first {
            return;
        }

        *self.writer.lock() = None;
        let drained: Vec<_> = {
            let mut pending = self.pending.lock();
            pending.drain().collect()
        };
        for (_, tx) in drained {
            let _ = tx.send(Err(error()));
        }
        self.notification_sinks.lock().clear();
        *self.tap.lock() = None;
    }
}

/// Removes the continuation if its `send_request` future is dropped before a
/// response arrives; a late response is then logged and discarded.
struct PendingGuard {
    shared: Arc<Shared>,
    id: RequestId,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.shared.pending.lock().remove(&self.id);
    }
}

/// One connection's multiplexer; see the module docs.
pub struct PeerEndpoint {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PeerEndpoint {
    pub fn new(transport: Transport, options: EndpointOptions) -> Self {
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(PeerState::Running);

        let shared = Arc::new(Shared {
            writer: Mutex::new(Some(writer_tx)),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            handler: RwLock::new(None),
            notification_sinks: Mutex::new(Vec::new()),
            tap: Mutex::new(None),
            state_tx,
            options,
        });

        let writer = tokio::spawn(writer_task(transport.sink, writer_rx));
        let reader = tokio::spawn(reader_task(transport.source, Arc::clone(&shared)));

        Self {
            shared,
            tasks: Mutex::new(vec![writer, reader]),
        }
    }

    /// Installs (or replaces) the handler answering inbound requests.
    /// In-flight handler invocations are not cancelled.
    pub fn set_handler(&self, handler: Arc<dyn Handler>) {
        *self.shared.handler.write() = Some(handler);
    }

    /// Issues a request and awaits its response. `Value::Null` params are
    /// encoded as absence. Without a timeout the call waits indefinitely;
    /// cancelling the future unregisters the continuation.
    pub async fn send_request(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, AcpError> {
        self.shared.check_running()?;

        let id = RequestId::Number(self.shared.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(id.clone(), tx);
        let _guard = PendingGuard {
            shared: Arc::clone(&self.shared),
            id: id.clone(),
        };

        let frame = Envelope::Request {
            id,
            method: method.to_string(),
            params: none_if_null(params),
        }
        .to_bytes();
        self.shared.write_frame(frame)?;

        let outcome = match timeout {
            Some(limit) => match time::timeout(limit, rx).await {
                Ok(done) => done,
                Err(_) => return Err(AcpError::Timeout(limit)),
            },
            None => rx.await,
        };
        match outcome {
            Ok(result) => result,
            Err(_) => Err(AcpError::ChannelClosed),
        }
    }

    /// Fire-and-forget notification; no pending state is created.
    pub fn send_notification(&self, method: &str, params: Value) -> Result<(), AcpError> {
        self.shared.check_running()?;
        let frame = Envelope::Notification {
            method: method.to_string(),
            params: none_if_null(params),
        }
        .to_bytes();
        self.shared.write_frame(frame)
    }

    /// Registers a consumer of inbound notifications, delivered in arrival
    /// order. Each call gets an independent stream.
    pub fn notifications(&self) -> mpsc::UnboundedReceiver<Notification> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.shared.state() == PeerState::Running {
            self.shared.notification_sinks.lock().push(tx);
        }
        rx
    }

    /// Enables the frame mirror and returns a subscription. Enabling is
    /// idempotent: repeated calls subscribe to the same stream.
    pub fn debug_tap(&self) -> broadcast::Receiver<TapRecord> {
        let mut guard = self.shared.tap.lock();
        match guard.as_ref() {
            Some(tx) => tx.subscribe(),
            None => {
                let (tx, rx) = broadcast::channel(TAP_CAPACITY);
                *guard = Some(tx);
                rx
            }
        }
    }

    /// Closes the tap sink; existing subscriptions finish after draining.
    pub fn disable_debug_tap(&self) {
        *self.shared.tap.lock() = None;
    }

    pub fn state(&self) -> PeerState {
        self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == PeerState::Running
    }

    /// Resolves once the endpoint leaves the `Running` state.
    pub async fn closed(&self) {
        let mut rx = self.shared.state_tx.subscribe();
        loop {
            if *rx.borrow() != PeerState::Running {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Records that the peer process exited; every pending continuation
    /// fails with *peer exited* and later calls fail with *peer not running*.
    pub fn notify_peer_exit(&self, code: Option<i32>) {
        self.shared
            .poison(PeerState::Exited(code), || AcpError::PeerExited { code });
    }

    /// Terminates the transport: pending continuations fail with
    /// *connection closed* and every stream is finished.
    pub async fn close(&self) {
        self.shared
            .poison(PeerState::Closed, || AcpError::ConnectionClosed);
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let abort = task.abort_handle();
            if time::timeout(CLOSE_TASK_TIMEOUT, task).await.is_err() {
                abort.abort();
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.shared.pending.lock().len()
    }
}

impl Drop for PeerEndpoint {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

fn none_if_null(params: Value) -> Option<Value> {
    match params {
        Value::Null => None,
        other => Some(other),
    }
}

async fn writer_task(mut sink: Box<dyn ByteSink>, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(mut frame) = rx.recv().await {
        frame.push(b'\n');
        if let Err(error) = sink.send(&frame).await {
            warn!(%error, "transport write failed");
            break;
        }
    }
    let _ = sink.shutdown().await;
}

async fn reader_task(mut source: Box<dyn ByteSource>, shared: Arc<Shared>) {
    let mut buffer = FrameBuffer::new();
    loop {
        match source.recv().await {
            Ok(Some(chunk)) => {
                buffer.push(&chunk);
                while let Some(frame) = buffer.pop_frame() {
                    dispatch_frame(&shared, &frame);
                }
            }
            Ok(None) => break,
            Err(error) => {
                warn!(%error, "transport read failed");
                break;
            }
        }
        if shared.state() != PeerState::Running {
            return;
        }
    }

    if shared.state() == PeerState::Running {
        time::sleep(EOF_POISON_GRACE).await;
    }
    shared.poison(PeerState::Closed, || AcpError::ConnectionClosed);
}

fn dispatch_frame(shared: &Arc<Shared>, frame: &[u8]) {
    shared.tap_record(Direction::Inbound, frame);

    let value: Value = match serde_json::from_slice(frame) {
        Ok(value) => value,
        Err(error) => {
            warn!(%error, "inbound frame is not valid JSON");
            return;
        }
    };

    match classify(value, shared.options.id_policy) {
        Ok(Envelope::Response { id, outcome }) => {
            let Some(tx) = shared.pending.lock().remove(&id) else {
                debug!(%id, "dropping response with no pending request");
                return;
            };
            let result = outcome.map_err(|error| AcpError::Rpc {
                code: error.code,
                message: error.message,
                data: error.data,
            });
            let _ = tx.send(result);
        }
        Ok(Envelope::Request { id, method, params }) => {
            let handler = shared.handler.read().clone();
            let shared = Arc::clone(shared);
            tokio::spawn(async move {
                let outcome = invoke_handler(&shared, handler, &method, params).await;
                let frame = Envelope::Response { id, outcome }.to_bytes();
                if let Err(error) = shared.write_frame(frame) {
                    debug!(%error, method, "failed to write response frame");
                }
            });
        }
        Ok(Envelope::Notification { method, params }) => {
            let notification = Notification { method, params };
            shared
                .notification_sinks
                .lock()
                .retain(|tx| tx.send(notification.clone()).is_ok());
        }
        Err(error) => warn!(%error, "dropping malformed frame"),
    }
}

async fn invoke_handler(
    shared: &Shared,
    handler: Option<Arc<dyn Handler>>,
    method: &str,
    params: Option<Value>,
) -> Result<Value, RpcErrorObject> {
    if !shared.options.routed.contains(method) {
        return Err(RpcErrorObject::method_not_found(method));
    }
    let Some(handler) = handler else {
        return Err(RpcErrorObject::delegate_not_set());
    };
    handler.handle(method, params.unwrap_or(Value::Null)).await
}
