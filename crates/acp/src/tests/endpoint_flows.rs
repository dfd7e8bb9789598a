use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::time;

use crate::{
    endpoint::{EndpointOptions, PeerEndpoint, PeerState},
    envelope::RpcErrorObject,
    error::AcpError,
    handler::Handler,
    tap::Direction,
    transport::Transport,
};

type RemoteLines = tokio::io::Lines<BufReader<ReadHalf<tokio::io::DuplexStream>>>;
type RemoteWrite = WriteHalf<tokio::io::DuplexStream>;

/// Endpoint wired to an in-memory duplex; returns the remote side split into
/// a line reader and a raw writer.
fn connected_endpoint() -> (Arc<PeerEndpoint>, RemoteLines, RemoteWrite) {
    let (local, remote) = tokio::io::duplex(64 * 1024);
    let (local_read, local_write) = tokio::io::split(local);
    let endpoint = Arc::new(PeerEndpoint::new(
        Transport::from_io(local_read, local_write),
        EndpointOptions::client(),
    ));
    let (remote_read, remote_write) = tokio::io::split(remote);
    (endpoint, BufReader::new(remote_read).lines(), remote_write)
}

async fn next_frame(lines: &mut RemoteLines) -> Value {
    let line = time::timeout(Duration::from_secs(5), lines.next_line())
        .await
        .expect("frame within deadline")
        .expect("read frame")
        .expect("stream open");
    serde_json::from_str(&line).expect("frame is JSON")
}

async fn write_frame(write: &mut RemoteWrite, value: Value) {
    let mut bytes = serde_json::to_vec(&value).expect("encode frame");
    bytes.push(b'\n');
    write.write_all(&bytes).await.expect("write frame");
}

#[tokio::test]
async fn responses_correlate_by_id_regardless_of_arrival_order() {
    let (endpoint, mut lines, mut write) = connected_endpoint();

    let first = {
        let endpoint = Arc::clone(&endpoint);
        tokio::spawn(async move { endpoint.send_request("alpha", json!({}), None).await })
    };
    let second = {
        let endpoint = Arc::clone(&endpoint);
        tokio::spawn(async move { endpoint.send_request("beta", json!({}), None).await })
    };

    let mut requests = Vec::new();
    for _ in 0..2 {
        let frame = next_frame(&mut lines).await;
        requests.push((frame["id"].clone(), frame["method"].clone()));
    }

    // answer in reverse arrival order
    for (id, method) in requests.iter().rev() {
        write_frame(
            &mut write,
            json!({"jsonrpc": "2.0", "id": id, "result": {"echo": method}}),
        )
        .await;
    }

    let first = first.await.expect("join").expect("alpha result");
    let second = second.await.expect("join").expect("beta result");
    assert_eq!(first["echo"], "alpha");
    assert_eq!(second["echo"], "beta");
    assert_eq!(endpoint.pending_len(), 0);
}

#[tokio::test]
async fn request_ids_increase_monotonically_from_one() {
    let (endpoint, mut lines, mut write) = connected_endpoint();

    for expected in 1..=3i64 {
        let call = {
            let endpoint = Arc::clone(&endpoint);
            tokio::spawn(async move { endpoint.send_request("ping", Value::Null, None).await })
        };
        let frame = next_frame(&mut lines).await;
        assert_eq!(frame["id"], json!(expected));
        assert!(frame.get("params").is_none());
        write_frame(
            &mut write,
            json!({"jsonrpc": "2.0", "id": expected, "result": {}}),
        )
        .await;
        call.await.expect("join").expect("result");
    }
}

#[tokio::test]
async fn notifications_flow_to_every_consumer_in_order() {
    let (endpoint, mut lines, mut write) = connected_endpoint();
    let mut stream_a = endpoint.notifications();
    let mut stream_b = endpoint.notifications();

    write_frame(
        &mut write,
        json!({"jsonrpc": "2.0", "method": "session/update", "params": {"a": true}}),
    )
    .await;
    write_frame(
        &mut write,
        json!({"jsonrpc": "2.0", "method": "session/update", "params": {"a": false}}),
    )
    .await;

    for stream in [&mut stream_a, &mut stream_b] {
        let one = stream.recv().await.expect("first notification");
        assert_eq!(one.method, "session/update");
        assert_eq!(one.params, Some(json!({"a": true})));
        let two = stream.recv().await.expect("second notification");
        assert_eq!(two.params, Some(json!({"a": false})));
    }

    // notifications never get a reply
    let quiet = time::timeout(Duration::from_millis(150), lines.next_line()).await;
    assert!(quiet.is_err());
}

#[tokio::test]
async fn timeout_fails_the_call_and_clears_the_pending_table() {
    let (endpoint, mut lines, mut write) = connected_endpoint();

    let started = time::Instant::now();
    let error = endpoint
        .send_request("initialize", json!({}), Some(Duration::from_millis(500)))
        .await
        .expect_err("must time out");
    assert!(matches!(error, AcpError::Timeout(_)));
    assert!(started.elapsed() >= Duration::from_millis(500));
    assert_eq!(endpoint.pending_len(), 0);

    // the late response is logged and discarded, not delivered anywhere
    let frame = next_frame(&mut lines).await;
    write_frame(
        &mut write,
        json!({"jsonrpc": "2.0", "id": frame["id"], "result": {}}),
    )
    .await;
    time::sleep(Duration::from_millis(100)).await;
    assert_eq!(endpoint.state(), PeerState::Running);
    assert_eq!(endpoint.pending_len(), 0);
}

#[tokio::test]
async fn dropping_a_request_future_unregisters_the_continuation() {
    let (endpoint, mut lines, _write) = connected_endpoint();

    let call = {
        let endpoint = Arc::clone(&endpoint);
        tokio::spawn(async move { endpoint.send_request("slow", json!({}), None).await })
    };
    let _ = next_frame(&mut lines).await;
    assert_eq!(endpoint.pending_len(), 1);

    call.abort();
    let _ = call.await;
    time::sleep(Duration::from_millis(50)).await;
    assert_eq!(endpoint.pending_len(), 0);
}

#[tokio::test]
async fn concurrent_writes_never_interleave_frames() {
    let (endpoint, mut lines, _write) = connected_endpoint();

    let mut senders = Vec::new();
    for index in 0..20 {
        let endpoint = Arc::clone(&endpoint);
        senders.push(tokio::spawn(async move {
            let payload = json!({"index": index, "filler": "x".repeat(512)});
            endpoint.send_notification("session/update", payload)
        }));
    }
    for sender in senders {
        sender.await.expect("join").expect("send");
    }

    let mut seen = 0;
    while seen < 20 {
        let frame = next_frame(&mut lines).await;
        assert_eq!(frame["method"], "session/update");
        assert_eq!(frame["params"]["filler"].as_str().map(str::len), Some(512));
        seen += 1;
    }
}

struct ScriptedHandler;

#[async_trait]
impl Handler for ScriptedHandler {
    async fn handle(&self, method: &str, params: Value) -> Result<Value, RpcErrorObject> {
        match method {
            "fs/read_text_file" => Ok(json!({"content": "stub", "echo": params})),
            "terminal/create" => Err(RpcErrorObject::internal("terminal backend offline")),
            other => Err(RpcErrorObject::method_not_found(other)),
        }
    }
}

#[tokio::test]
async fn inbound_requests_dispatch_to_the_handler() {
    let (endpoint, mut lines, mut write) = connected_endpoint();
    endpoint.set_handler(Arc::new(ScriptedHandler));

    write_frame(
        &mut write,
        json!({
            "jsonrpc": "2.0", "id": 7,
            "method": "fs/read_text_file",
            "params": {"path": "/a", "sessionId": "s"}
        }),
    )
    .await;
    let response = next_frame(&mut lines).await;
    assert_eq!(response["id"], 7);
    assert_eq!(response["result"]["content"], "stub");

    write_frame(
        &mut write,
        json!({"jsonrpc": "2.0", "id": 8, "method": "terminal/create", "params": {}}),
    )
    .await;
    let response = next_frame(&mut lines).await;
    assert_eq!(response["id"], 8);
    assert_eq!(response["error"]["code"], -32603);

    // unrouted method, even with a handler installed
    write_frame(
        &mut write,
        json!({"jsonrpc": "2.0", "id": 9, "method": "session/prompt", "params": {}}),
    )
    .await;
    let response = next_frame(&mut lines).await;
    assert_eq!(response["error"]["code"], -32601);
}

#[tokio::test]
async fn requests_without_a_handler_get_internal_or_not_found_errors() {
    let (_endpoint, mut lines, mut write) = connected_endpoint();

    write_frame(
        &mut write,
        json!({"jsonrpc": "2.0", "id": 1, "method": "fs/read_text_file", "params": {}}),
    )
    .await;
    let response = next_frame(&mut lines).await;
    assert_eq!(response["error"]["code"], -32603);
    let message = response["error"]["message"].as_str().unwrap_or_default();
    assert!(message.contains("delegate not set"), "got: {message}");

    write_frame(
        &mut write,
        json!({"jsonrpc": "2.0", "id": 2, "method": "no/such_method"}),
    )
    .await;
    let response = next_frame(&mut lines).await;
    assert_eq!(response["error"]["code"], -32601);
}

#[tokio::test]
async fn noise_between_frames_is_dropped() {
    let (endpoint, _lines, mut write) = connected_endpoint();
    let mut notes = endpoint.notifications();

    write
        .write_all(b"npm WARN deprecated something\n")
        .await
        .expect("write noise");
    write_frame(
        &mut write,
        json!({"jsonrpc": "2.0", "method": "session/update", "params": {"ok": 1}}),
    )
    .await;

    let note = notes.recv().await.expect("notification after noise");
    assert_eq!(note.params, Some(json!({"ok": 1})));
}

#[tokio::test]
async fn close_fails_pending_and_subsequent_calls() {
    let (endpoint, mut lines, _write) = connected_endpoint();

    let call = {
        let endpoint = Arc::clone(&endpoint);
        tokio::spawn(async move { endpoint.send_request("alpha", json!({}), None).await })
    };
    let _ = next_frame(&mut lines).await;

    endpoint.close().await;
    let error = call.await.expect("join").expect_err("pending must fail");
    assert!(matches!(error, AcpError::ConnectionClosed));
    assert_eq!(endpoint.state(), PeerState::Closed);

    let error = endpoint
        .send_request("beta", json!({}), None)
        .await
        .expect_err("closed endpoint rejects calls");
    assert!(matches!(error, AcpError::ConnectionClosed));
}

#[tokio::test]
async fn peer_exit_fails_pending_with_the_exit_code() {
    let (endpoint, mut lines, _write) = connected_endpoint();

    let call = {
        let endpoint = Arc::clone(&endpoint);
        tokio::spawn(async move { endpoint.send_request("alpha", json!({}), None).await })
    };
    let _ = next_frame(&mut lines).await;

    endpoint.notify_peer_exit(Some(1));
    let error = call.await.expect("join").expect_err("pending must fail");
    assert!(matches!(error, AcpError::PeerExited { code: Some(1) }));

    let error = endpoint
        .send_request("beta", json!({}), None)
        .await
        .expect_err("exited peer rejects calls");
    assert!(matches!(error, AcpError::PeerNotRunning));
}

#[tokio::test]
async fn remote_end_of_stream_closes_the_endpoint() {
    let (endpoint, lines, write) = connected_endpoint();
    drop(lines);
    drop(write);
    time::timeout(Duration::from_secs(2), endpoint.closed())
        .await
        .expect("endpoint observes the closed stream");
    assert_eq!(endpoint.state(), PeerState::Closed);
}

#[tokio::test]
async fn debug_tap_mirrors_both_directions() {
    let (endpoint, mut lines, mut write) = connected_endpoint();
    let mut tap = endpoint.debug_tap();

    endpoint
        .send_notification("session/cancel", json!({"sessionId": "s"}))
        .expect("send");
    let _ = next_frame(&mut lines).await;
    write_frame(
        &mut write,
        json!({"jsonrpc": "2.0", "method": "session/update", "params": {}}),
    )
    .await;

    let outbound = tap.recv().await.expect("outbound record");
    assert_eq!(outbound.direction, Direction::Outbound);
    assert_eq!(outbound.method.as_deref(), Some("session/cancel"));

    let inbound = tap.recv().await.expect("inbound record");
    assert_eq!(inbound.direction, Direction::Inbound);
    assert_eq!(inbound.method.as_deref(), Some("session/update"));

    endpoint.disable_debug_tap();
    assert!(tap.recv().await.is_err());
}

#[tokio::test]
async fn enabling_the_tap_twice_shares_one_stream() {
    let (endpoint, mut lines, _write) = connected_endpoint();
    let mut tap_a = endpoint.debug_tap();
    let mut tap_b = endpoint.debug_tap();

    endpoint
        .send_notification("session/update", json!({}))
        .expect("send");
    let _ = next_frame(&mut lines).await;

    assert_eq!(
        tap_a.recv().await.expect("record a").method.as_deref(),
        Some("session/update")
    );
    assert_eq!(
        tap_b.recv().await.expect("record b").method.as_deref(),
        Some("session/update")
    );
}
